use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::{clamp_thresholds, ProviderDefinition, ProviderRole};

/// Quota registration of a provider as the tracker knows it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaRegistration {
    pub display_name: String,
    #[serde(default)]
    pub role: ProviderRole,
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub daily_limit: u64,
    #[serde(default)]
    pub monthly_limit: u64,
    pub alert_threshold_pct: f64,
    pub emergency_threshold_pct: f64,
}

impl From<&ProviderDefinition> for QuotaRegistration {
    fn from(def: &ProviderDefinition) -> Self {
        let (alert, emergency) =
            clamp_thresholds(def.alert_threshold_pct, def.emergency_threshold_pct);
        Self {
            display_name: def.display_name.clone(),
            role: def.role,
            priority: def.priority,
            daily_limit: def.daily_limit,
            monthly_limit: def.monthly_limit,
            alert_threshold_pct: alert,
            emergency_threshold_pct: emergency,
        }
    }
}

/// Consumption counters of one provider.
///
/// The daily fields share one window keyed by UTC date; `monthly_used` has its own window
/// keyed by `YYYY-MM`. The two roll independently.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UsageCounters {
    pub daily_used: u64,
    pub monthly_used: u64,
    pub request_count: u64,
    pub cu_by_method: BTreeMap<String, u64>,
    pub cache_hits: u64,
    pub cache_saved_cu: u64,
    pub last_updated: Option<DateTime<Utc>>,
    pub last_daily_reset: Option<NaiveDate>,
    pub last_monthly_reset: Option<String>,
}

impl UsageCounters {
    /// Fresh counters with both windows stamped at `now`.
    #[must_use]
    pub fn started_at(now: DateTime<Utc>) -> Self {
        Self {
            last_daily_reset: Some(now.date_naive()),
            last_monthly_reset: Some(month_key(now)),
            ..Self::default()
        }
    }

    /// Applies day and month rollovers for `now`. Returns `true` if anything changed.
    ///
    /// A window resets only when time has moved forward past its stamp; a clock that steps
    /// backwards leaves the counters alone.
    pub fn roll_windows(&mut self, now: DateTime<Utc>) -> bool {
        let mut changed = false;

        let today = now.date_naive();
        match self.last_daily_reset {
            Some(last) if today <= last => {}
            Some(_) => {
                self.daily_used = 0;
                self.request_count = 0;
                self.cache_hits = 0;
                self.cache_saved_cu = 0;
                self.cu_by_method.clear();
                self.last_daily_reset = Some(today);
                changed = true;
            }
            None => {
                self.last_daily_reset = Some(today);
                changed = true;
            }
        }

        let month = month_key(now);
        match self.last_monthly_reset.as_deref() {
            Some(last) if month.as_str() <= last => {}
            Some(_) => {
                self.monthly_used = 0;
                self.last_monthly_reset = Some(month);
                changed = true;
            }
            None => {
                self.last_monthly_reset = Some(month);
                changed = true;
            }
        }

        changed
    }

    /// Copy of the counters as they read at `now`.
    #[must_use]
    pub fn rolled(&self, now: DateTime<Utc>) -> Self {
        let mut copy = self.clone();
        copy.roll_windows(now);
        copy
    }

    pub fn add_usage(&mut self, method: &str, cu: u64, now: DateTime<Utc>) {
        self.daily_used = self.daily_used.saturating_add(cu);
        self.monthly_used = self.monthly_used.saturating_add(cu);
        self.request_count = self.request_count.saturating_add(1);
        let per_method = self.cu_by_method.entry(method.to_string()).or_insert(0);
        *per_method = per_method.saturating_add(cu);
        self.last_updated = Some(now);
    }

    pub fn add_cache_hit(&mut self, saved_cu: u64, now: DateTime<Utc>) {
        self.cache_hits = self.cache_hits.saturating_add(1);
        self.cache_saved_cu = self.cache_saved_cu.saturating_add(saved_cu);
        self.last_updated = Some(now);
    }
}

/// `YYYY-MM` key of the calendar month containing `now`.
#[must_use]
pub fn month_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m").to_string()
}
