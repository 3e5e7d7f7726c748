use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{fmt, time::Duration};
use tokio::time::Instant;

/// Smoothing factor for the latency moving average.
pub const LATENCY_EMA_ALPHA: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderHealth {
    Healthy,
    Degraded,
    Offline,
}

impl fmt::Display for ProviderHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Offline => "offline",
        })
    }
}

/// When a provider is taken offline and for how long.
#[derive(Debug, Clone, Copy)]
pub struct HealthPolicy {
    pub failure_threshold: u32,
    pub offline_cooldown: Duration,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self { failure_threshold: 3, offline_cooldown: Duration::from_millis(60_000) }
    }
}

/// Mutable health record of one provider, always accessed under its own lock.
#[derive(Debug, Clone)]
pub struct HealthState {
    pub health: ProviderHealth,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    pub average_latency_ms: Option<f64>,
    pub offline_until: Option<Instant>,
    pub last_error: Option<String>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            health: ProviderHealth::Healthy,
            consecutive_failures: 0,
            total_failures: 0,
            total_successes: 0,
            average_latency_ms: None,
            offline_until: None,
            last_error: None,
            last_success_at: None,
            last_failure_at: None,
        }
    }
}

impl HealthState {
    /// Any success restores full health, even straight from offline.
    ///
    /// Returns the previous health if it changed.
    pub fn record_success(&mut self, latency_ms: u64) -> Option<ProviderHealth> {
        #[allow(clippy::cast_precision_loss)]
        let sample = latency_ms as f64;
        self.average_latency_ms = Some(match self.average_latency_ms {
            Some(avg) => avg * (1.0 - LATENCY_EMA_ALPHA) + sample * LATENCY_EMA_ALPHA,
            None => sample,
        });
        self.total_successes = self.total_successes.saturating_add(1);
        self.consecutive_failures = 0;
        self.offline_until = None;
        self.last_success_at = Some(Utc::now());
        self.transition(ProviderHealth::Healthy)
    }

    /// Counts a failure and moves to `degraded`, or `offline` at the threshold.
    ///
    /// Returns the previous health if it changed.
    pub fn record_failure(
        &mut self,
        error: &str,
        policy: &HealthPolicy,
        now: Instant,
    ) -> Option<ProviderHealth> {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.total_failures = self.total_failures.saturating_add(1);
        self.last_error = Some(error.to_string());
        self.last_failure_at = Some(Utc::now());

        if self.consecutive_failures >= policy.failure_threshold.max(1) {
            self.offline_until = Some(now + policy.offline_cooldown);
            self.transition(ProviderHealth::Offline)
        } else {
            self.transition(ProviderHealth::Degraded)
        }
    }

    /// Offline providers become selectable again once their cooldown has passed. They stay
    /// `offline` until a call succeeds.
    #[must_use]
    pub fn is_selectable(&self, now: Instant) -> bool {
        match (self.health, self.offline_until) {
            (ProviderHealth::Offline, Some(until)) => now >= until,
            _ => true,
        }
    }

    /// Wall-clock rendering of `offline_until` for snapshots.
    #[must_use]
    pub fn offline_until_utc(&self, now: Instant) -> Option<DateTime<Utc>> {
        if self.health != ProviderHealth::Offline {
            return None;
        }
        let remaining = self.offline_until?.saturating_duration_since(now);
        chrono::Duration::from_std(remaining).ok().map(|d| Utc::now() + d)
    }

    fn transition(&mut self, to: ProviderHealth) -> Option<ProviderHealth> {
        let from = self.health;
        self.health = to;
        (from != to).then_some(from)
    }
}
