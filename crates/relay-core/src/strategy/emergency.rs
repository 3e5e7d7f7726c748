use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::usage::AggregatedUsage;

/// Runtime knobs that consumers scale while emergency mode is active.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyAdjustments {
    pub scan_interval_multiplier: f64,
    pub operation_limit_multiplier: f64,
    pub cache_ttl_multiplier: f64,
}

impl EmergencyAdjustments {
    #[must_use]
    pub const fn neutral() -> Self {
        Self { scan_interval_multiplier: 1.0, operation_limit_multiplier: 1.0, cache_ttl_multiplier: 1.0 }
    }

    #[must_use]
    pub const fn protective() -> Self {
        Self { scan_interval_multiplier: 2.0, operation_limit_multiplier: 0.5, cache_ttl_multiplier: 2.0 }
    }
}

impl Default for EmergencyAdjustments {
    fn default() -> Self {
        Self::neutral()
    }
}

/// Current emergency posture of a strategy instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyContext {
    pub active: bool,
    /// `Some(true)` while an operator has forced emergency mode on.
    pub manual_override: Option<bool>,
    pub reason: Option<String>,
    pub activated_at: Option<DateTime<Utc>>,
    pub adjustments: EmergencyAdjustments,
}

impl Default for EmergencyContext {
    fn default() -> Self {
        Self {
            active: false,
            manual_override: None,
            reason: None,
            activated_at: None,
            adjustments: EmergencyAdjustments::neutral(),
        }
    }
}

/// Cluster-level triggers for automatic emergency mode.
#[derive(Debug, Clone, Copy)]
pub struct EmergencyPolicy {
    /// Number of providers at alert-or-worse that triggers emergency mode.
    pub provider_count: usize,
    pub daily_threshold_pct: f64,
    pub monthly_threshold_pct: f64,
}

impl Default for EmergencyPolicy {
    fn default() -> Self {
        Self { provider_count: 2, daily_threshold_pct: 90.0, monthly_threshold_pct: 90.0 }
    }
}

/// Returns the reason emergency mode should be active, or `None` if no trigger holds.
#[must_use]
pub fn evaluate(usage: &AggregatedUsage, policy: &EmergencyPolicy) -> Option<String> {
    if let Some(p) = usage.providers.iter().find(|p| {
        (p.daily_limit > 0 && p.daily_pct >= p.emergency_threshold_pct) ||
            (p.monthly_limit > 0 && p.monthly_pct >= p.emergency_threshold_pct)
    }) {
        return Some(format!(
            "{} reached its emergency threshold ({:.1}% daily, {:.1}% monthly)",
            p.name, p.daily_pct, p.monthly_pct
        ));
    }

    let at_alert = usage.totals.providers_at_alert;
    if policy.provider_count > 0 && at_alert >= policy.provider_count {
        return Some(format!("{at_alert} providers at alert level or worse"));
    }

    if usage.totals.daily_limit > 0 && usage.totals.daily_pct >= policy.daily_threshold_pct {
        return Some(format!("aggregate daily usage at {:.1}%", usage.totals.daily_pct));
    }
    if usage.totals.monthly_limit > 0 && usage.totals.monthly_pct >= policy.monthly_threshold_pct {
        return Some(format!("aggregate monthly usage at {:.1}%", usage.totals.monthly_pct));
    }

    None
}
