use anyhow::Result;
use relay_core::{
    config::AppConfig,
    events::EventBus,
    monitor::UsageMonitor,
    strategy::ProviderStrategy,
    upstream::{HttpClient, ResilientProviderManager},
    usage::{CostTable, UsageStore, UsageTracker},
};
use std::sync::Arc;
use tokio::{signal, sync::broadcast};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initializes the logging system based on the configuration.
///
/// `RUST_LOG` wins when set; otherwise the configured level applies to the relay crates and
/// everything else stays at `warn`.
fn init_logging(config: &AppConfig) {
    let level = config.log_level.as_str();
    let filter = EnvFilter::try_from_env("RUST_LOG").unwrap_or_else(|_| {
        EnvFilter::new(format!("warn,relay_core={level},relay_node={level}"))
    });

    let registry = tracing_subscriber::registry().with(filter);

    if config.log_format.as_str() == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        // "pretty" and any other format default to pretty logging
        let fmt_layer = tracing_subscriber::fmt::layer()
            .pretty()
            .with_file(true)
            .with_line_number(true)
            .with_target(false);
        registry.with(fmt_layer).init();
    }
}

/// Container for initialized core services.
struct CoreServices {
    tracker: Arc<UsageTracker>,
    strategy: Arc<ProviderStrategy>,
    manager: Arc<ResilientProviderManager>,
    monitor: Arc<UsageMonitor>,
}

/// Builds the tracker, strategy, manager and monitor and probes every provider.
async fn init_core_services(config: &AppConfig) -> Result<CoreServices> {
    let tracker = Arc::new(
        UsageTracker::with_persistence(
            CostTable::default(),
            EventBus::new(),
            UsageStore::new(config.usage_file.clone()),
            config.usage_flush_debounce(),
        )
        .map_err(|e| anyhow::anyhow!("Usage state initialization failed: {e}"))?,
    );

    let strategy = Arc::new(ProviderStrategy::new(config.strategy_config(), Arc::clone(&tracker)));

    let http_client = Arc::new(
        HttpClient::new().map_err(|e| anyhow::anyhow!("HTTP client initialization failed: {e}"))?,
    );
    let manager = Arc::new(ResilientProviderManager::new(
        Arc::clone(&strategy),
        http_client,
        config.manager_config(),
    ));
    manager
        .initialize(config.to_definitions())
        .await
        .map_err(|e| anyhow::anyhow!("Provider initialization failed: {e}"))?;

    let monitor = Arc::new(UsageMonitor::new(Arc::clone(&strategy), config.monitor_config()));

    Ok(CoreServices { tracker, strategy, manager, monitor })
}

#[tokio::main]
async fn main() -> Result<()> {
    let config =
        AppConfig::load().map_err(|e| anyhow::anyhow!("Configuration loading failed: {e}"))?;
    config.validate().map_err(|e| anyhow::anyhow!("Configuration validation failed: {e}"))?;

    init_logging(&config);
    info!("Starting RPC relay");
    debug!(
        providers_count = config.providers.len(),
        strategy = ?config.provider_strategy,
        usage_file = %config.usage_file.display(),
        "Configuration loaded"
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let services = init_core_services(&config).await?;

    let monitor_handle = services.monitor.start(shutdown_tx.subscribe());
    let emergency_handle = services
        .strategy
        .spawn_emergency_ticker(config.emergency_check_interval(), shutdown_tx.subscribe());

    let heads = services.manager.on_new_heads(|head| {
        debug!(head = head, "new head");
    });

    for pool in services.manager.endpoint_status() {
        info!(
            provider = %pool.provider,
            endpoints = pool.endpoints.len(),
            "provider ready"
        );
    }

    match signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }

    heads.unsubscribe();
    let _ = shutdown_tx.send(());
    for (name, handle) in [("monitor", monitor_handle), ("emergency", emergency_handle)] {
        if let Err(e) = handle.await {
            warn!(task = name, error = %e, "Background task did not stop cleanly");
        }
    }

    if let Err(e) = services.tracker.flush_now() {
        error!(error = %e, "Failed to flush usage state");
    }
    services.tracker.wait_for_idle().await;

    info!("Shutdown complete");
    Ok(())
}
