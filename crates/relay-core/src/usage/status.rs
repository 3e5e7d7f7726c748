use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{collections::BTreeMap, fmt, sync::Arc};

use crate::types::ProviderRole;

/// Quota pressure band of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageLevel {
    Healthy,
    Warning,
    Alert,
    Emergency,
    Exhausted,
}

impl UsageLevel {
    /// Bands the larger of the daily and monthly percentages.
    ///
    /// `alert` kicks in at `max(alert, 0.9 * emergency)`, so `warning` is the band between the
    /// configured alert threshold and that point.
    #[must_use]
    pub fn classify(max_pct: f64, alert_pct: f64, emergency_pct: f64) -> Self {
        if max_pct >= 100.0 {
            Self::Exhausted
        } else if max_pct >= emergency_pct {
            Self::Emergency
        } else if max_pct >= alert_pct.max(0.9 * emergency_pct) {
            Self::Alert
        } else if max_pct >= alert_pct {
            Self::Warning
        } else {
            Self::Healthy
        }
    }

    #[must_use]
    pub fn is_alert_or_worse(&self) -> bool {
        *self >= Self::Alert
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Warning => "warning",
            Self::Alert => "alert",
            Self::Emergency => "emergency",
            Self::Exhausted => "exhausted",
        }
    }
}

impl fmt::Display for UsageLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Percentage of `limit` consumed. Unlimited windows (`limit == 0`) read as 0%.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn percent(used: u64, limit: u64) -> f64 {
    if limit == 0 {
        0.0
    } else {
        used as f64 / limit as f64 * 100.0
    }
}

/// Remaining budget, `None` for unlimited windows.
#[must_use]
pub fn remaining(used: u64, limit: u64) -> Option<u64> {
    (limit > 0).then(|| limit.saturating_sub(used))
}

/// Point-in-time usage of one provider.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderUsageSnapshot {
    pub name: Arc<str>,
    pub display_name: String,
    pub role: ProviderRole,
    pub priority: u32,
    pub daily_used: u64,
    pub daily_limit: u64,
    pub daily_pct: f64,
    pub daily_remaining: Option<u64>,
    pub monthly_used: u64,
    pub monthly_limit: u64,
    pub monthly_pct: f64,
    pub monthly_remaining: Option<u64>,
    pub request_count: u64,
    pub cache_hits: u64,
    pub cache_saved_cu: u64,
    pub cu_by_method: BTreeMap<String, u64>,
    pub alert_threshold_pct: f64,
    pub emergency_threshold_pct: f64,
    pub status: UsageLevel,
    pub last_updated: Option<DateTime<Utc>>,
}

impl ProviderUsageSnapshot {
    #[must_use]
    pub fn max_pct(&self) -> f64 {
        self.daily_pct.max(self.monthly_pct)
    }
}

/// Cluster-wide totals. Percentages only consider providers with a finite limit.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageTotals {
    pub daily_used: u64,
    pub daily_limit: u64,
    pub daily_pct: f64,
    pub monthly_used: u64,
    pub monthly_limit: u64,
    pub monthly_pct: f64,
    pub request_count: u64,
    pub cache_hits: u64,
    pub cache_saved_cu: u64,
    pub providers_at_alert: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedUsage {
    pub providers: Vec<ProviderUsageSnapshot>,
    pub totals: UsageTotals,
    pub generated_at: DateTime<Utc>,
}

impl AggregatedUsage {
    #[must_use]
    pub fn from_snapshots(mut providers: Vec<ProviderUsageSnapshot>, now: DateTime<Utc>) -> Self {
        providers.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));

        let mut totals = UsageTotals::default();
        let (mut limited_daily_used, mut limited_monthly_used) = (0u64, 0u64);

        for p in &providers {
            totals.daily_used = totals.daily_used.saturating_add(p.daily_used);
            totals.monthly_used = totals.monthly_used.saturating_add(p.monthly_used);
            totals.request_count = totals.request_count.saturating_add(p.request_count);
            totals.cache_hits = totals.cache_hits.saturating_add(p.cache_hits);
            totals.cache_saved_cu = totals.cache_saved_cu.saturating_add(p.cache_saved_cu);

            if p.daily_limit > 0 {
                totals.daily_limit = totals.daily_limit.saturating_add(p.daily_limit);
                limited_daily_used = limited_daily_used.saturating_add(p.daily_used);
            }
            if p.monthly_limit > 0 {
                totals.monthly_limit = totals.monthly_limit.saturating_add(p.monthly_limit);
                limited_monthly_used = limited_monthly_used.saturating_add(p.monthly_used);
            }
            if p.status.is_alert_or_worse() {
                totals.providers_at_alert += 1;
            }
        }

        totals.daily_pct = percent(limited_daily_used, totals.daily_limit);
        totals.monthly_pct = percent(limited_monthly_used, totals.monthly_limit);

        Self { providers, totals, generated_at: now }
    }

    #[must_use]
    pub fn provider(&self, name: &str) -> Option<&ProviderUsageSnapshot> {
        self.providers.iter().find(|p| &*p.name == name)
    }
}
