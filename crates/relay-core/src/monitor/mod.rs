//! Periodic usage snapshots for dashboards and alerting.
//!
//! The monitor refreshes on two clocks: a slow fixed interval, and a short debounce after
//! any event that changes usage, health or emergency state. Readers never block the
//! refresh; [`UsageMonitor::get_latest_metrics`] returns the last published snapshot and
//! [`UsageMonitor::subscribe`] sees every new one.

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    sync::{
        broadcast::{self, error::RecvError},
        watch,
    },
    task::JoinHandle,
    time::Instant,
};

use crate::{
    strategy::{
        CacheStats, EmergencyContext, ProviderHealth, ProviderStateSnapshot, ProviderStrategy,
        SelectionStrategy,
    },
    usage::{ProviderUsageSnapshot, UsageTotals},
};

#[derive(Debug, Clone, Copy)]
pub struct MonitorConfig {
    pub refresh_interval: Duration,
    pub debounce: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self { refresh_interval: Duration::from_secs(30), debounce: Duration::from_millis(250) }
    }
}

/// Usage of one provider merged with its health record.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderMetrics {
    #[serde(flatten)]
    pub usage: ProviderUsageSnapshot,
    pub emergency_only: bool,
    pub health: ProviderHealth,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    pub average_latency_ms: Option<f64>,
    pub offline_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub generated_at: DateTime<Utc>,
    pub strategy: SelectionStrategy,
    pub providers: Vec<ProviderMetrics>,
    pub totals: UsageTotals,
    pub emergency: EmergencyContext,
    pub cache: CacheStats,
}

impl MetricsSnapshot {
    #[must_use]
    pub fn provider(&self, name: &str) -> Option<&ProviderMetrics> {
        self.providers.iter().find(|p| &*p.usage.name == name)
    }
}

pub struct UsageMonitor {
    strategy: Arc<ProviderStrategy>,
    config: MonitorConfig,
    latest: ArcSwap<MetricsSnapshot>,
    tx: watch::Sender<Arc<MetricsSnapshot>>,
}

impl UsageMonitor {
    #[must_use]
    pub fn new(strategy: Arc<ProviderStrategy>, config: MonitorConfig) -> Self {
        let initial = Arc::new(build_snapshot(&strategy));
        let (tx, _) = watch::channel(Arc::clone(&initial));
        Self { strategy, config, latest: ArcSwap::new(initial), tx }
    }

    /// Last published snapshot. Never blocks and never recomputes.
    #[must_use]
    pub fn get_latest_metrics(&self) -> Arc<MetricsSnapshot> {
        self.latest.load_full()
    }

    /// Recomputes and publishes a snapshot now.
    pub fn request_immediate_update(&self) -> Arc<MetricsSnapshot> {
        let snapshot = Arc::new(build_snapshot(&self.strategy));
        self.latest.store(Arc::clone(&snapshot));
        self.tx.send_replace(Arc::clone(&snapshot));
        tracing::debug!(
            providers = snapshot.providers.len(),
            emergency = snapshot.emergency.active,
            "metrics refreshed"
        );
        snapshot
    }

    /// Forces emergency mode on, or clears the override, and publishes the result.
    pub fn toggle_emergency(&self, force: bool, reason: Option<String>) -> Arc<MetricsSnapshot> {
        self.strategy.force_emergency_mode(force, reason);
        self.request_immediate_update()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Arc<MetricsSnapshot>> {
        self.tx.subscribe()
    }

    /// Runs the refresh loop until `shutdown` fires.
    pub fn start(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        let mut events = self.strategy.events().subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.config.refresh_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut pending: Option<Instant> = None;
            let mut events_open = true;

            tracing::info!(
                refresh_secs = monitor.config.refresh_interval.as_secs(),
                debounce_ms = monitor.config.debounce.as_millis() as u64,
                "usage monitor started"
            );

            loop {
                let deadline = pending.unwrap_or_else(Instant::now);
                tokio::select! {
                    _ = ticker.tick() => {
                        monitor.request_immediate_update();
                        pending = None;
                    }
                    () = tokio::time::sleep_until(deadline), if pending.is_some() => {
                        monitor.request_immediate_update();
                        pending = None;
                    }
                    event = events.recv(), if events_open => match event {
                        Ok(event) if event.affects_usage() => {
                            pending.get_or_insert_with(|| Instant::now() + monitor.config.debounce);
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::debug!(skipped = skipped, "monitor lagged behind events");
                            pending.get_or_insert_with(|| Instant::now() + monitor.config.debounce);
                        }
                        Err(RecvError::Closed) => {
                            events_open = false;
                        }
                    },
                    _ = shutdown.recv() => {
                        tracing::info!("usage monitor shutting down");
                        break;
                    }
                }
            }
        })
    }
}

fn build_snapshot(strategy: &ProviderStrategy) -> MetricsSnapshot {
    let state = strategy.get_strategy_state();
    let names: Vec<Arc<str>> = state.providers.iter().map(|p| Arc::clone(&p.name)).collect();
    let usage = strategy.tracker().aggregate_for(&names);

    let health: HashMap<&str, &ProviderStateSnapshot> =
        state.providers.iter().map(|p| (&*p.name, p)).collect();

    let providers = usage
        .providers
        .iter()
        .filter_map(|snapshot| {
            let h = health.get(&*snapshot.name)?;
            Some(ProviderMetrics {
                usage: snapshot.clone(),
                emergency_only: h.emergency_only,
                health: h.health,
                consecutive_failures: h.consecutive_failures,
                total_failures: h.total_failures,
                total_successes: h.total_successes,
                average_latency_ms: h.average_latency_ms,
                offline_until: h.offline_until,
                last_error: h.last_error.clone(),
            })
        })
        .collect();

    MetricsSnapshot {
        generated_at: usage.generated_at,
        strategy: state.strategy,
        providers,
        totals: usage.totals,
        emergency: state.emergency,
        cache: state.cache,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        events::EventBus,
        strategy::StrategyConfig,
        types::{ProviderDefinition, ProviderRole},
        usage::{CostTable, UsageTracker},
    };

    fn monitor(config: MonitorConfig) -> Arc<UsageMonitor> {
        let tracker = Arc::new(UsageTracker::new(CostTable::default(), EventBus::new()));
        let strategy = Arc::new(ProviderStrategy::new(StrategyConfig::default(), tracker));
        strategy.configure_providers(vec![
            ProviderDefinition::new("main", ProviderRole::Primary, 1).with_limits(1000, 0),
            ProviderDefinition::new("backup", ProviderRole::Secondary, 2),
        ]);
        Arc::new(UsageMonitor::new(strategy, config))
    }

    #[tokio::test]
    async fn test_immediate_update_merges_usage_and_health() {
        let monitor = monitor(MonitorConfig::default());
        monitor.strategy.tracker().record_usage("main", "eth_call", Some(500.0));
        monitor.strategy.handle_failure("backup", "timeout");

        // the cached snapshot is stale until refreshed
        assert_eq!(monitor.get_latest_metrics().provider("main").unwrap().usage.daily_used, 0);

        let snapshot = monitor.request_immediate_update();
        let main = snapshot.provider("main").unwrap();
        assert_eq!(main.usage.daily_used, 500);
        assert!((main.usage.daily_pct - 50.0).abs() < f64::EPSILON);
        assert_eq!(main.health, ProviderHealth::Healthy);

        let backup = snapshot.provider("backup").unwrap();
        assert_eq!(backup.health, ProviderHealth::Degraded);
        assert_eq!(backup.last_error.as_deref(), Some("timeout"));

        assert_eq!(snapshot.totals.daily_used, 500);
        assert_eq!(monitor.get_latest_metrics().provider("main").unwrap().usage.daily_used, 500);
    }

    #[tokio::test]
    async fn test_toggle_emergency_publishes() {
        let monitor = monitor(MonitorConfig::default());
        let mut rx = monitor.subscribe();

        let snapshot = monitor.toggle_emergency(true, Some("maintenance".into()));
        assert!(snapshot.emergency.active);
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().emergency.active);

        let snapshot = monitor.toggle_emergency(false, None);
        assert!(!snapshot.emergency.active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_usage_event_triggers_debounced_refresh() {
        let monitor = monitor(MonitorConfig {
            refresh_interval: Duration::from_secs(30),
            debounce: Duration::from_millis(250),
        });
        let mut rx = monitor.subscribe();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = monitor.start(shutdown_rx);

        // first interval tick fires immediately
        rx.changed().await.unwrap();

        let started = Instant::now();
        monitor.strategy.tracker().record_usage("main", "eth_call", Some(10.0));
        monitor.strategy.tracker().record_usage("main", "eth_call", Some(10.0));
        rx.changed().await.unwrap();

        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(250));
        assert!(waited < Duration::from_secs(30));
        assert_eq!(rx.borrow().provider("main").unwrap().usage.daily_used, 20);

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[test]
    fn test_snapshot_serializes_flat_provider_fields() {
        let monitor = monitor(MonitorConfig::default());
        let json = serde_json::to_value(&*monitor.get_latest_metrics()).unwrap();
        let main = &json["providers"][0];
        assert_eq!(main["name"], "main");
        assert_eq!(main["dailyLimit"], 1000);
        assert_eq!(main["health"], "healthy");
        assert_eq!(json["emergency"]["active"], false);
    }
}
