use arc_swap::{ArcSwap, ArcSwapOption};
use serde::Serialize;
use serde_json::Value;
use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::sync::watch;

use crate::{
    strategy::{ExecuteOptions, ProviderStrategy, StrategyError},
    types::{parse_hex_u64, to_hex_quantity, ProviderDefinition, ProviderRole},
};

use super::{
    circuit_breaker::CircuitBreaker,
    endpoint::{timeout_for_method, EndpointStatus, UpstreamEndpoint},
    errors::UpstreamError,
    http_client::HttpClient,
    subscription::{stopped, Subscription},
    websocket::stream_new_heads,
};

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("no providers configured")]
    NoProvidersConfigured,

    #[error(transparent)]
    Strategy(#[from] StrategyError),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

/// Jittered exponential backoff used between endpoint attempts after a rate-limit error.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the capped delay spread around it, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_millis(5000),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (zero-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        use rand::Rng;

        #[allow(clippy::cast_possible_truncation)]
        let base_ms = self.base_delay.as_millis() as u64;
        #[allow(clippy::cast_possible_truncation)]
        let max_ms = self.max_delay.as_millis() as u64;

        let capped = base_ms.saturating_mul(1u64 << attempt.min(10)).min(max_ms);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let jitter_range = (capped as f64 * self.jitter.clamp(0.0, 1.0)) as u64;
        let jitter_offset =
            if jitter_range > 0 { rand::rng().random_range(0..jitter_range) } else { 0 };

        Duration::from_millis(capped.saturating_sub(jitter_range / 2) + jitter_offset)
    }
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub probe_timeout: Duration,
    pub request_timeout: Duration,
    /// Endpoint attempts within one provider before the strategy moves on.
    pub max_endpoint_attempts: u32,
    pub retry: RetryPolicy,
    pub head_poll_interval: Duration,
    pub logs_poll_interval: Duration,
    pub breaker_threshold: u32,
    pub breaker_cooldown: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(10),
            max_endpoint_attempts: 3,
            retry: RetryPolicy::default(),
            head_poll_interval: Duration::from_secs(4),
            logs_poll_interval: Duration::from_secs(15),
            breaker_threshold: 3,
            breaker_cooldown: Duration::from_secs(30),
        }
    }
}

/// The physical endpoints that answered the startup probe for one provider.
pub struct EndpointPool {
    provider: Arc<str>,
    endpoints: Vec<Arc<UpstreamEndpoint>>,
    cursor: AtomicUsize,
}

impl EndpointPool {
    fn new(provider: Arc<str>, endpoints: Vec<Arc<UpstreamEndpoint>>) -> Self {
        Self { provider, endpoints, cursor: AtomicUsize::new(0) }
    }

    #[must_use]
    pub fn provider(&self) -> &Arc<str> {
        &self.provider
    }

    #[must_use]
    pub fn endpoints(&self) -> &[Arc<UpstreamEndpoint>] {
        &self.endpoints
    }

    /// Next endpoint in rotation whose circuit breaker admits a request.
    fn next_available(&self) -> Option<Arc<UpstreamEndpoint>> {
        let len = self.endpoints.len();
        if len == 0 {
            return None;
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % len;
        (0..len)
            .map(|offset| &self.endpoints[(start + offset) % len])
            .find(|endpoint| endpoint.is_available())
            .cloned()
    }
}

/// Endpoint health of one provider.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderEndpoints {
    pub provider: Arc<str>,
    pub endpoints: Vec<EndpointStatus>,
}

type Pools = HashMap<Arc<str>, Arc<EndpointPool>>;

/// Owns the physical endpoints of every provider and runs calls, head subscriptions and log
/// polling through the [`ProviderStrategy`].
pub struct ResilientProviderManager {
    strategy: Arc<ProviderStrategy>,
    http_client: Arc<HttpClient>,
    config: ManagerConfig,
    definitions: ArcSwap<Vec<ProviderDefinition>>,
    pools: ArcSwap<Pools>,
    primary: ArcSwapOption<ProviderDefinition>,
}

impl ResilientProviderManager {
    #[must_use]
    pub fn new(
        strategy: Arc<ProviderStrategy>,
        http_client: Arc<HttpClient>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            strategy,
            http_client,
            config,
            definitions: ArcSwap::from_pointee(Vec::new()),
            pools: ArcSwap::from_pointee(HashMap::new()),
            primary: ArcSwapOption::empty(),
        }
    }

    #[must_use]
    pub fn strategy(&self) -> &Arc<ProviderStrategy> {
        &self.strategy
    }

    #[must_use]
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Probes every provider's endpoints and hands the provider set to the strategy.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::NoProvidersConfigured`] if `definitions` is empty.
    pub async fn initialize(&self, definitions: Vec<ProviderDefinition>) -> Result<(), ManagerError> {
        if definitions.is_empty() {
            return Err(ManagerError::NoProvidersConfigured);
        }
        let definitions: Vec<ProviderDefinition> =
            definitions.into_iter().map(ProviderDefinition::normalized).collect();

        let pools = self.build_pools(&definitions).await;
        let primary = definitions
            .iter()
            .find(|d| d.role == ProviderRole::Primary)
            .or_else(|| definitions.first())
            .cloned();

        let primary_name = primary.as_ref().map(|d| d.name.to_string()).unwrap_or_default();
        let provider_count = definitions.len();

        self.pools.store(Arc::new(pools));
        self.primary.store(primary.map(Arc::new));
        self.definitions.store(Arc::new(definitions.clone()));
        self.strategy.configure_providers(definitions);

        tracing::info!(providers = provider_count, primary = %primary_name, "provider manager initialized");
        Ok(())
    }

    /// Re-runs the startup probe and swaps in fresh endpoint pools.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::NoProvidersConfigured`] before [`Self::initialize`].
    pub async fn reprobe(&self) -> Result<(), ManagerError> {
        let definitions = self.definitions.load_full();
        if definitions.is_empty() {
            return Err(ManagerError::NoProvidersConfigured);
        }
        let pools = self.build_pools(&definitions).await;
        self.pools.store(Arc::new(pools));
        tracing::info!(providers = definitions.len(), "endpoint pools refreshed");
        Ok(())
    }

    async fn build_pools(&self, definitions: &[ProviderDefinition]) -> Pools {
        let probes = definitions.iter().map(|definition| self.probe_provider(definition));
        futures::future::join_all(probes)
            .await
            .into_iter()
            .map(|pool| (Arc::clone(&pool.provider), Arc::new(pool)))
            .collect()
    }

    /// Keeps the endpoints that answer `eth_blockNumber`, or the first URL if none do.
    async fn probe_provider(&self, definition: &ProviderDefinition) -> EndpointPool {
        let provider = Arc::clone(&definition.name);
        let urls = definition.endpoint_candidates();
        if urls.is_empty() {
            tracing::warn!(provider = %provider, "provider has no rpc urls");
            return EndpointPool::new(provider, Vec::new());
        }

        let endpoints: Vec<Arc<UpstreamEndpoint>> =
            urls.iter().map(|url| Arc::new(self.new_endpoint(&provider, url))).collect();
        let results = futures::future::join_all(
            endpoints.iter().map(|endpoint| endpoint.probe(self.config.probe_timeout)),
        )
        .await;

        let mut live = Vec::with_capacity(endpoints.len());
        for (endpoint, result) in endpoints.into_iter().zip(results) {
            match result {
                Ok(block) => {
                    tracing::debug!(provider = %provider, block = block, "endpoint probe succeeded");
                    live.push(endpoint);
                }
                Err(e) => {
                    tracing::warn!(provider = %provider, error = %e, "endpoint probe failed");
                }
            }
        }

        if live.is_empty() {
            tracing::warn!(provider = %provider, "no endpoint answered the probe, keeping the first url");
            live.push(Arc::new(self.new_endpoint(&provider, &urls[0])));
        }

        tracing::info!(provider = %provider, endpoints = live.len(), candidates = urls.len(), "provider probed");
        EndpointPool::new(provider, live)
    }

    fn new_endpoint(&self, provider: &Arc<str>, url: &str) -> UpstreamEndpoint {
        UpstreamEndpoint::new(
            Arc::clone(provider),
            url,
            Arc::clone(&self.http_client),
            CircuitBreaker::new(self.config.breaker_threshold, self.config.breaker_cooldown),
        )
    }

    /// The primary provider picked at initialization.
    #[must_use]
    pub fn primary_provider(&self) -> Option<Arc<ProviderDefinition>> {
        self.primary.load_full()
    }

    /// An endpoint of the primary provider, for callers that want to bypass the strategy.
    /// Calls made through it are not accounted.
    #[must_use]
    pub fn primary_endpoint(&self) -> Option<Arc<UpstreamEndpoint>> {
        let primary = self.primary.load_full()?;
        let pool = self.pools.load().get(&primary.name).cloned()?;
        pool.next_available().or_else(|| pool.endpoints.first().cloned())
    }

    /// Runs `call` against an endpoint of the provider the strategy picks.
    ///
    /// Within a provider, endpoints are rotated up to `max_endpoint_attempts` times with a
    /// backoff after rate-limit errors. Permanent errors are returned without rotating.
    ///
    /// # Errors
    ///
    /// Returns the strategy error once no provider could serve the call.
    pub async fn with_provider<F, Fut>(
        &self,
        method: &str,
        params: &Value,
        call: F,
        options: ExecuteOptions,
    ) -> Result<Value, ManagerError>
    where
        F: Fn(Arc<UpstreamEndpoint>) -> Fut,
        Fut: Future<Output = Result<Value, UpstreamError>>,
    {
        let pools = self.pools.load_full();
        let pools = &pools;
        let call = &call;

        let value = self
            .strategy
            .execute_with_best_provider(
                method,
                params,
                |definition: Arc<ProviderDefinition>| {
                    let pool = pools.get(&definition.name).cloned();
                    async move {
                        let pool = pool.ok_or_else(|| {
                            UpstreamError::ProviderUnavailable(format!(
                                "no endpoints for provider {}",
                                definition.name
                            ))
                        })?;
                        self.call_with_rotation(&pool, method, call).await
                    }
                },
                options,
            )
            .await?;
        Ok(value)
    }

    async fn call_with_rotation<F, Fut>(
        &self,
        pool: &EndpointPool,
        method: &str,
        call: &F,
    ) -> Result<Value, UpstreamError>
    where
        F: Fn(Arc<UpstreamEndpoint>) -> Fut,
        Fut: Future<Output = Result<Value, UpstreamError>>,
    {
        if pool.endpoints.is_empty() {
            return Err(UpstreamError::ProviderUnavailable(format!(
                "no endpoints for provider {}",
                pool.provider
            )));
        }

        let attempts = self.config.max_endpoint_attempts.max(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            let Some(endpoint) = pool.next_available() else {
                break;
            };

            match call(Arc::clone(&endpoint)).await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_permanent() => return Err(error),
                Err(error) => {
                    tracing::debug!(
                        provider = %pool.provider,
                        method = method,
                        attempt = attempt + 1,
                        error = %error,
                        "endpoint call failed"
                    );
                    if error.is_rate_limited() && attempt + 1 < attempts {
                        let delay = self.config.retry.delay_for(attempt);
                        tracing::debug!(
                            provider = %pool.provider,
                            delay_ms = delay.as_millis() as u64,
                            "rate limited, backing off"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    last_error = Some(error);
                }
            }
        }

        Err(last_error.unwrap_or(UpstreamError::CircuitBreakerOpen))
    }

    /// Sends a plain JSON-RPC call through [`Self::with_provider`].
    ///
    /// # Errors
    ///
    /// See [`Self::with_provider`].
    pub async fn request(
        &self,
        method: &str,
        params: &Value,
        options: ExecuteOptions,
    ) -> Result<Value, ManagerError> {
        let timeout = timeout_for_method(method, self.config.request_timeout);
        self.with_provider(
            method,
            params,
            |endpoint: Arc<UpstreamEndpoint>| async move { endpoint.call(method, params, timeout).await },
            options,
        )
        .await
    }

    #[must_use]
    pub fn endpoint_status(&self) -> Vec<ProviderEndpoints> {
        let pools = self.pools.load();
        self.definitions
            .load()
            .iter()
            .filter_map(|definition| pools.get(&definition.name))
            .map(|pool| ProviderEndpoints {
                provider: Arc::clone(&pool.provider),
                endpoints: pool.endpoints.iter().map(|endpoint| endpoint.status()).collect(),
            })
            .collect()
    }

    /// Calls `handler` with every new head block number.
    ///
    /// Uses a WebSocket `newHeads` stream when any provider has stream URLs and falls back to
    /// polling `eth_blockNumber`. The handler only sees a number when it differs from the last
    /// one delivered.
    pub fn on_new_heads<H>(self: &Arc<Self>, handler: H) -> Subscription
    where
        H: Fn(u64) + Send + Sync + 'static,
    {
        let (subscription, stop) = Subscription::new("new_heads");
        let streams: Vec<(Arc<str>, String)> = self
            .definitions
            .load()
            .iter()
            .flat_map(|d| d.ws_urls.iter().map(move |url| (Arc::clone(&d.name), url.clone())))
            .collect();

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.run_head_subscription(streams, stop, handler).await;
        });
        subscription
    }

    async fn run_head_subscription<H>(
        &self,
        streams: Vec<(Arc<str>, String)>,
        mut stop: watch::Receiver<bool>,
        handler: H,
    ) where
        H: Fn(u64),
    {
        let stop_check = stop.clone();
        let mut last: Option<u64> = None;
        let mut deliver = |head: u64| {
            if *stop_check.borrow() || last == Some(head) {
                return;
            }
            last = Some(head);
            handler(head);
        };

        for (provider, url) in &streams {
            match stream_new_heads(provider, url, &mut stop, &mut deliver).await {
                Ok(()) => return,
                Err(e) => {
                    tracing::warn!(provider = %provider, error = %e, "head stream unavailable");
                }
            }
        }

        if !streams.is_empty() {
            tracing::info!("falling back to head polling");
        }

        let mut ticker = tokio::time::interval(self.config.head_poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                () = stopped(&mut stop) => break,
            }

            match self.request("eth_blockNumber", &Value::Array(Vec::new()), ExecuteOptions::default()).await {
                Ok(result) => match parse_hex_u64(&result) {
                    Some(head) => deliver(head),
                    None => tracing::warn!(result = %result, "head poll returned a non-quantity"),
                },
                Err(e) => tracing::warn!(error = %e, "head poll failed"),
            }
        }
        tracing::debug!("head subscription finished");
    }

    /// Polls `eth_getLogs` for `filter` and calls `handler` with each non-empty batch.
    ///
    /// The first tick starts at the current head; later ticks query from the block after the
    /// last one covered, so no block is delivered twice. Failed ticks are logged and retried
    /// on the next interval from the same block.
    pub fn subscribe_logs<H>(self: &Arc<Self>, filter: Value, handler: H) -> Subscription
    where
        H: Fn(Vec<Value>) + Send + Sync + 'static,
    {
        let (subscription, mut stop) = Subscription::new("logs");
        let manager = Arc::clone(self);

        tokio::spawn(async move {
            let mut last_seen: Option<u64> = None;
            let mut ticker = tokio::time::interval(manager.config.logs_poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    () = stopped(&mut stop) => break,
                }

                match manager.poll_logs(&filter, last_seen).await {
                    Ok(Some((logs, head))) => {
                        if *stop.borrow() {
                            break;
                        }
                        last_seen = Some(head);
                        if !logs.is_empty() {
                            tracing::debug!(logs = logs.len(), head = head, "delivering logs");
                            handler(logs);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => tracing::warn!(error = %e, "log poll failed"),
                }
            }
            tracing::debug!("log subscription finished");
        });

        subscription
    }

    /// One log poll. Returns `None` when no block past `last_seen` exists yet.
    async fn poll_logs(
        &self,
        filter: &Value,
        last_seen: Option<u64>,
    ) -> Result<Option<(Vec<Value>, u64)>, ManagerError> {
        let result =
            self.request("eth_blockNumber", &Value::Array(Vec::new()), ExecuteOptions::default()).await?;
        let head = parse_hex_u64(&result).ok_or_else(|| {
            UpstreamError::InvalidResponse(format!("eth_blockNumber returned {result}"))
        })?;

        let from = last_seen.map_or(head, |seen| seen.saturating_add(1));
        if from > head {
            return Ok(None);
        }

        let mut range = match filter {
            Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        range.insert("fromBlock".to_string(), Value::String(to_hex_quantity(from)));
        range.insert("toBlock".to_string(), Value::String(to_hex_quantity(head)));

        let logs = self
            .request("eth_getLogs", &Value::Array(vec![Value::Object(range)]), ExecuteOptions::default())
            .await?;
        let logs = match logs {
            Value::Array(logs) => logs,
            Value::Null => Vec::new(),
            other => {
                return Err(UpstreamError::InvalidResponse(format!(
                    "eth_getLogs returned a non-array: {other}"
                ))
                .into())
            }
        };
        Ok(Some((logs, head)))
    }
}
