//! A wired-up relay over mock providers.

use relay_core::{
    events::EventBus,
    monitor::{MonitorConfig, UsageMonitor},
    strategy::{ProviderStrategy, StrategyConfig},
    types::{ProviderDefinition, ProviderRole},
    upstream::{HttpClient, ManagerConfig, ResilientProviderManager, RetryPolicy},
    usage::{CostTable, UsageTracker},
};
use std::{sync::Arc, time::Duration};

/// Short timeouts and poll intervals so tests finish quickly.
#[must_use]
pub fn fast_manager_config() -> ManagerConfig {
    ManagerConfig {
        probe_timeout: Duration::from_millis(500),
        request_timeout: Duration::from_secs(2),
        max_endpoint_attempts: 2,
        retry: RetryPolicy {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: 0.0,
        },
        head_poll_interval: Duration::from_millis(25),
        logs_poll_interval: Duration::from_millis(25),
        ..ManagerConfig::default()
    }
}

/// A provider with one rpc url.
#[must_use]
pub fn provider(name: &str, role: ProviderRole, priority: u32, url: &str) -> ProviderDefinition {
    ProviderDefinition::new(name, role, priority).with_rpc_url(url)
}

pub struct RelayHarness {
    pub tracker: Arc<UsageTracker>,
    pub strategy: Arc<ProviderStrategy>,
    pub manager: Arc<ResilientProviderManager>,
    pub monitor: Arc<UsageMonitor>,
}

impl RelayHarness {
    /// In-memory tracker, default strategy, fast manager.
    pub async fn start(providers: Vec<ProviderDefinition>) -> Self {
        Self::start_with(providers, StrategyConfig::default(), fast_manager_config()).await
    }

    pub async fn start_with(
        providers: Vec<ProviderDefinition>,
        strategy_config: StrategyConfig,
        manager_config: ManagerConfig,
    ) -> Self {
        let tracker = Arc::new(UsageTracker::new(CostTable::default(), EventBus::new()));
        Self::start_with_tracker(tracker, providers, strategy_config, manager_config).await
    }

    pub async fn start_with_tracker(
        tracker: Arc<UsageTracker>,
        providers: Vec<ProviderDefinition>,
        strategy_config: StrategyConfig,
        manager_config: ManagerConfig,
    ) -> Self {
        let strategy = Arc::new(ProviderStrategy::new(strategy_config, Arc::clone(&tracker)));
        let http_client = Arc::new(HttpClient::new().expect("http client"));
        let manager = Arc::new(ResilientProviderManager::new(
            Arc::clone(&strategy),
            http_client,
            manager_config,
        ));
        manager.initialize(providers).await.expect("manager initialization");
        let monitor = Arc::new(UsageMonitor::new(Arc::clone(&strategy), MonitorConfig::default()));

        Self { tracker, strategy, manager, monitor }
    }

    /// Daily CU recorded for `name`, zero if unknown.
    #[must_use]
    pub fn daily_used(&self, name: &str) -> u64 {
        self.tracker.get_usage(name).map_or(0, |usage| usage.daily_used)
    }
}

/// Polls `condition` every 10ms until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
