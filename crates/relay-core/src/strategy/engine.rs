use arc_swap::ArcSwap;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::{
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::broadcast, task::JoinHandle, time::Instant};

use crate::{
    events::{CoreEvent, EventBus},
    types::{ProviderDefinition, ProviderRole},
    upstream::UpstreamError,
    usage::{normalize_cost, CanUseOptions, UsageTracker},
};

use super::{
    cache::{CacheStats, ResponseCache},
    emergency::{self, EmergencyAdjustments, EmergencyContext, EmergencyPolicy},
    errors::StrategyError,
    health::{HealthPolicy, HealthState, ProviderHealth},
    selection::{narrow_for_emergency, order_candidates, Candidate, SelectionStrategy},
};

/// TTL multiplier applied to every cached response when aggressive caching is enabled.
pub const AGGRESSIVE_CACHE_MULTIPLIER: f64 = 3.0;

/// Static settings of a [`ProviderStrategy`].
#[derive(Debug, Clone)]
pub struct StrategyConfig {
    pub strategy: SelectionStrategy,
    pub cache_ttl: Duration,
    pub cache_max_size: usize,
    pub aggressive_caching: bool,
    pub health: HealthPolicy,
    pub emergency: EmergencyPolicy,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            strategy: SelectionStrategy::CapacityBased,
            cache_ttl: Duration::from_secs(30),
            cache_max_size: 1000,
            aggressive_caching: false,
            health: HealthPolicy::default(),
            emergency: EmergencyPolicy::default(),
        }
    }
}

/// Per-call knobs for [`ProviderStrategy::execute_with_best_provider`].
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub cacheable: bool,
    /// Overrides the default `method:params` key.
    pub cache_key: Option<String>,
    pub ttl_seconds: Option<u64>,
    pub cost_override: Option<f64>,
    pub allow_near_limit: bool,
    /// Skip emergency narrowing and allow emergency-only providers.
    pub bypass_emergency: bool,
    /// Total executor invocations across providers. Defaults to the candidate count.
    pub max_attempts: Option<u32>,
    /// Executor invocations per provider. Defaults to 1.
    pub max_provider_attempts: Option<u32>,
}

impl ExecuteOptions {
    /// Options for a read whose result may be served from cache.
    #[must_use]
    pub fn cached() -> Self {
        Self { cacheable: true, ..Self::default() }
    }

    #[must_use]
    pub fn with_ttl_seconds(mut self, ttl_seconds: u64) -> Self {
        self.ttl_seconds = Some(ttl_seconds);
        self
    }

    #[must_use]
    pub fn with_cost(mut self, cu: f64) -> Self {
        self.cost_override = Some(cu);
        self
    }

    fn quota_options(&self) -> CanUseOptions {
        CanUseOptions { allow_near_limit: self.allow_near_limit, ..CanUseOptions::default() }
    }
}

/// Runtime state of one configured provider.
struct ProviderSlot {
    definition: ArcSwap<ProviderDefinition>,
    health: Mutex<HealthState>,
}

impl ProviderSlot {
    fn new(definition: Arc<ProviderDefinition>) -> Self {
        Self { definition: ArcSwap::new(definition), health: Mutex::new(HealthState::default()) }
    }

    fn name(&self) -> Arc<str> {
        Arc::clone(&self.definition.load().name)
    }
}

/// Health and configuration of one provider as exposed to consumers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStateSnapshot {
    pub name: Arc<str>,
    pub display_name: String,
    pub role: ProviderRole,
    pub priority: u32,
    pub emergency_only: bool,
    pub health: ProviderHealth,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    pub average_latency_ms: Option<f64>,
    pub offline_until: Option<chrono::DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyState {
    pub strategy: SelectionStrategy,
    pub round_robin_cursor: usize,
    pub providers: Vec<ProviderStateSnapshot>,
    pub emergency: EmergencyContext,
    pub cache: CacheStats,
}

/// Chooses a provider for every call, tracks provider health, caches responses and decides
/// when to enter emergency mode.
pub struct ProviderStrategy {
    config: StrategyConfig,
    tracker: Arc<UsageTracker>,
    events: EventBus,
    providers: ArcSwap<Vec<Arc<ProviderSlot>>>,
    reconfigure: Mutex<()>,
    cache: ResponseCache,
    emergency: Mutex<EmergencyContext>,
    cursor: AtomicUsize,
}

impl ProviderStrategy {
    /// Creates a strategy publishing on the tracker's event bus.
    #[must_use]
    pub fn new(config: StrategyConfig, tracker: Arc<UsageTracker>) -> Self {
        let events = tracker.events().clone();
        let cache = ResponseCache::new(config.cache_max_size);
        Self {
            config,
            tracker,
            events,
            providers: ArcSwap::from_pointee(Vec::new()),
            reconfigure: Mutex::new(()),
            cache,
            emergency: Mutex::new(EmergencyContext::default()),
            cursor: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn config(&self) -> &StrategyConfig {
        &self.config
    }

    #[must_use]
    pub fn tracker(&self) -> &Arc<UsageTracker> {
        &self.tracker
    }

    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Replaces the provider set.
    ///
    /// Providers that survive keep their health record; removed ones are dropped. Every
    /// definition is registered with the usage tracker and emergency mode is re-evaluated.
    pub fn configure_providers(&self, definitions: Vec<ProviderDefinition>) {
        let names = {
            let _guard = self.reconfigure.lock();
            let current = self.providers.load_full();
            let mut next: Vec<Arc<ProviderSlot>> = Vec::with_capacity(definitions.len());

            for definition in definitions {
                let definition = Arc::new(definition.normalized());
                if next.iter().any(|slot| slot.name() == definition.name) {
                    tracing::warn!(provider = %definition.name, "duplicate provider ignored");
                    continue;
                }

                self.tracker.register_provider(&definition);
                let slot = match current.iter().find(|slot| slot.name() == definition.name) {
                    Some(existing) => {
                        existing.definition.store(Arc::clone(&definition));
                        Arc::clone(existing)
                    }
                    None => Arc::new(ProviderSlot::new(definition)),
                };
                next.push(slot);
            }

            let names: Vec<Arc<str>> = next.iter().map(|slot| slot.name()).collect();
            self.providers.store(Arc::new(next));
            names
        };

        tracing::info!(providers = names.len(), strategy = %self.config.strategy, "providers configured");
        self.events.emit(CoreEvent::ProvidersConfigured { providers: names });
        self.evaluate_emergency();
    }

    /// Current provider definitions in configuration order.
    #[must_use]
    pub fn providers(&self) -> Vec<Arc<ProviderDefinition>> {
        self.providers.load().iter().map(|slot| slot.definition.load_full()).collect()
    }

    /// Runs `executor` against the best available provider, falling through the ordered
    /// candidate list until a call succeeds or the attempt budget is spent.
    ///
    /// # Errors
    ///
    /// - [`StrategyError::NoProvidersConfigured`] if the provider set is empty
    /// - [`StrategyError::QuotaExceeded`] if every provider is out of quota for this call,
    ///   including quota held by concurrent calls still in flight
    /// - [`StrategyError::NoProviderAvailable`] if the rest are offline or excluded by role
    /// - [`StrategyError::AllProvidersFailed`] if every attempt failed
    pub async fn execute_with_best_provider<F, Fut>(
        &self,
        method: &str,
        params: &Value,
        executor: F,
        options: ExecuteOptions,
    ) -> Result<Value, StrategyError>
    where
        F: Fn(Arc<ProviderDefinition>) -> Fut,
        Fut: Future<Output = Result<Value, UpstreamError>>,
    {
        let estimated_cu = options
            .cost_override
            .map_or_else(|| self.tracker.estimate_cost(method), normalize_cost);

        let cache_key = options.cacheable.then(|| {
            options.cache_key.clone().unwrap_or_else(|| default_cache_key(method, params))
        });

        if let Some(key) = &cache_key {
            if let Some(entry) = self.cache.get(key, Instant::now()) {
                tracing::debug!(provider = %entry.provider, method = method, "cache hit");
                self.tracker.record_cache_hit(&entry.provider, method, entry.estimated_cu);
                return Ok(entry.value);
            }
        }

        let candidates = self.select_candidates(method, estimated_cu, &options)?;
        #[allow(clippy::cast_possible_truncation)]
        let max_attempts = options.max_attempts.unwrap_or(candidates.len() as u32).max(1);
        let per_provider = options.max_provider_attempts.unwrap_or(1).max(1);

        let quota_options = options.quota_options();
        let mut attempts = 0u32;
        let mut quota_denied = 0u32;
        let mut last_error: Option<String> = None;

        'providers: for candidate in candidates {
            let definition = candidate.definition;
            for _ in 0..per_provider {
                if attempts >= max_attempts {
                    break 'providers;
                }
                // the pre-filter above is advisory; this is the check that holds the units
                let Some(reservation) =
                    self.tracker.try_reserve(&definition.name, estimated_cu, quota_options)
                else {
                    tracing::debug!(
                        provider = %definition.name,
                        method = method,
                        cu = estimated_cu,
                        "quota held by calls in flight, skipping provider"
                    );
                    quota_denied += 1;
                    continue 'providers;
                };
                attempts += 1;

                let started = Instant::now();
                match executor(Arc::clone(&definition)).await {
                    Ok(value) => {
                        #[allow(clippy::cast_possible_truncation)]
                        let latency_ms = started.elapsed().as_millis() as u64;
                        self.handle_success(&definition.name, latency_ms);

                        self.tracker.commit_reservation(reservation, method);

                        if let Some(key) = cache_key {
                            self.cache.insert(
                                key,
                                value.clone(),
                                self.cache_ttl(options.ttl_seconds),
                                Arc::clone(&definition.name),
                                estimated_cu,
                                Instant::now(),
                            );
                        }

                        self.evaluate_emergency();
                        return Ok(value);
                    }
                    Err(error) => {
                        drop(reservation);
                        tracing::warn!(
                            provider = %definition.name,
                            method = method,
                            attempt = attempts,
                            error = %error,
                            "provider call failed"
                        );
                        let message = error.to_string();
                        if error.should_penalize_provider() {
                            self.handle_failure(&definition.name, &message);
                        }
                        last_error = Some(message);

                        if error.is_permanent() {
                            break;
                        }
                    }
                }
            }
        }

        if attempts == 0 && quota_denied > 0 {
            return Err(StrategyError::QuotaExceeded { method: method.to_string(), estimated_cu });
        }

        Err(StrategyError::AllProvidersFailed {
            attempts,
            last_error: last_error.unwrap_or_else(|| "no attempt was made".to_string()),
        })
    }

    /// Filters providers for one call and orders them by the configured strategy.
    fn select_candidates(
        &self,
        method: &str,
        estimated_cu: u64,
        options: &ExecuteOptions,
    ) -> Result<Vec<Candidate>, StrategyError> {
        let slots = self.providers.load();
        if slots.is_empty() {
            return Err(StrategyError::NoProvidersConfigured);
        }

        let emergency_active = self.is_emergency_mode();
        let allow_emergency_only = emergency_active || options.bypass_emergency;
        let quota_options = options.quota_options();
        let now = Instant::now();

        let mut quota_blocked = 0usize;
        let mut candidates = Vec::with_capacity(slots.len());
        for slot in slots.iter() {
            let definition = slot.definition.load_full();
            if !self.tracker.can_use(&definition.name, estimated_cu, quota_options) {
                quota_blocked += 1;
                continue;
            }
            if !slot.health.lock().is_selectable(now) {
                continue;
            }
            if definition.emergency_only && !allow_emergency_only {
                continue;
            }
            let usage = self.tracker.get_usage(&definition.name);
            candidates.push(Candidate::new(definition, usage.as_ref()));
        }

        if candidates.is_empty() {
            if quota_blocked == slots.len() {
                return Err(StrategyError::QuotaExceeded {
                    method: method.to_string(),
                    estimated_cu,
                });
            }
            return Err(StrategyError::NoProviderAvailable);
        }

        if emergency_active && !options.bypass_emergency {
            candidates = narrow_for_emergency(candidates);
        }

        let ordered = order_candidates(self.config.strategy, candidates, &self.cursor);
        if tracing::enabled!(tracing::Level::DEBUG) {
            let order: Vec<&str> = ordered.iter().map(|c| &*c.definition.name).collect();
            tracing::debug!(method = method, cu = estimated_cu, order = ?order, "provider order");
        }
        Ok(ordered)
    }

    /// TTL for a new cache entry, scaled by aggressive caching and emergency mode.
    #[must_use]
    pub fn cache_ttl(&self, ttl_seconds: Option<u64>) -> Duration {
        let base = ttl_seconds.map_or(self.config.cache_ttl, Duration::from_secs);
        let aggressive = if self.config.aggressive_caching { AGGRESSIVE_CACHE_MULTIPLIER } else { 1.0 };
        let emergency = self.emergency.lock().adjustments.cache_ttl_multiplier;
        Duration::try_from_secs_f64(base.as_secs_f64() * aggressive * emergency).unwrap_or(Duration::MAX)
    }

    /// Records a successful call against `name`'s health.
    pub fn handle_success(&self, name: &str, latency_ms: u64) {
        let Some(slot) = self.find_slot(name) else {
            return;
        };
        let previous = slot.health.lock().record_success(latency_ms);
        let provider = slot.name();

        if let Some(from) = previous {
            tracing::info!(provider = %provider, from = %from, "provider recovered");
            self.events.emit(CoreEvent::HealthChanged {
                provider: Arc::clone(&provider),
                from,
                to: ProviderHealth::Healthy,
            });
        }
        self.events.emit(CoreEvent::ProviderSucceeded { provider, latency_ms });
    }

    /// Records a failed call against `name`'s health.
    pub fn handle_failure(&self, name: &str, error: &str) {
        let Some(slot) = self.find_slot(name) else {
            return;
        };
        let (previous, current, failures) = {
            let mut health = slot.health.lock();
            let previous = health.record_failure(error, &self.config.health, Instant::now());
            (previous, health.health, health.consecutive_failures)
        };
        let provider = slot.name();

        if let Some(from) = previous {
            if current == ProviderHealth::Offline {
                tracing::warn!(
                    provider = %provider,
                    failures = failures,
                    cooldown_ms = self.config.health.offline_cooldown.as_millis() as u64,
                    "provider taken offline"
                );
            } else {
                tracing::info!(provider = %provider, from = %from, to = %current, "provider health changed");
            }
            self.events.emit(CoreEvent::HealthChanged {
                provider: Arc::clone(&provider),
                from,
                to: current,
            });
        }
        self.events.emit(CoreEvent::ProviderFailed { provider, error: error.to_string() });
        self.evaluate_emergency();
    }

    /// Recomputes emergency mode from current usage and emits on transitions.
    pub fn evaluate_emergency(&self) -> EmergencyContext {
        let names: Vec<Arc<str>> = self.providers.load().iter().map(|slot| slot.name()).collect();
        let usage = self.tracker.aggregate_for(&names);
        let natural = emergency::evaluate(&usage, &self.config.emergency);

        let mut context = self.emergency.lock();
        let (should_be_active, reason) = match context.manual_override {
            Some(forced) => (forced, context.reason.clone()),
            None => (natural.is_some(), natural),
        };

        if context.active == should_be_active {
            if should_be_active {
                context.reason = reason;
            }
            return context.clone();
        }

        context.active = should_be_active;
        if should_be_active {
            context.reason = reason;
            context.activated_at = Some(Utc::now());
            context.adjustments = EmergencyAdjustments::protective();
        } else {
            context.reason = None;
            context.activated_at = None;
            context.adjustments = EmergencyAdjustments::neutral();
        }
        let snapshot = context.clone();
        drop(context);

        if snapshot.active {
            tracing::warn!(
                reason = snapshot.reason.as_deref().unwrap_or_default(),
                manual = snapshot.manual_override.is_some(),
                "emergency mode activated"
            );
        } else {
            tracing::info!("emergency mode deactivated");
        }
        self.events.emit(CoreEvent::EmergencyChanged(snapshot.clone()));
        snapshot
    }

    /// Forces emergency mode on, or clears a previous override and re-evaluates.
    pub fn force_emergency_mode(&self, force: bool, reason: Option<String>) -> EmergencyContext {
        {
            let mut context = self.emergency.lock();
            if force {
                context.manual_override = Some(true);
                context.reason = Some(reason.unwrap_or_else(|| "manual override".to_string()));
            } else {
                context.manual_override = None;
            }
        }
        self.evaluate_emergency()
    }

    #[must_use]
    pub fn is_emergency_mode(&self) -> bool {
        self.emergency.lock().active
    }

    #[must_use]
    pub fn get_emergency_context(&self) -> EmergencyContext {
        self.emergency.lock().clone()
    }

    #[must_use]
    pub fn get_strategy_state(&self) -> StrategyState {
        let now = Instant::now();
        let providers = self
            .providers
            .load()
            .iter()
            .map(|slot| {
                let definition = slot.definition.load();
                let health = slot.health.lock();
                ProviderStateSnapshot {
                    name: Arc::clone(&definition.name),
                    display_name: definition.display_name.clone(),
                    role: definition.role,
                    priority: definition.priority,
                    emergency_only: definition.emergency_only,
                    health: health.health,
                    consecutive_failures: health.consecutive_failures,
                    total_failures: health.total_failures,
                    total_successes: health.total_successes,
                    average_latency_ms: health.average_latency_ms,
                    offline_until: health.offline_until_utc(now),
                    last_error: health.last_error.clone(),
                }
            })
            .collect();

        StrategyState {
            strategy: self.config.strategy,
            round_robin_cursor: self.cursor.load(Ordering::Relaxed),
            providers,
            emergency: self.get_emergency_context(),
            cache: self.cache.stats(),
        }
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
        tracing::debug!("response cache cleared");
    }

    /// Re-evaluates emergency mode on a fixed interval until `shutdown` fires.
    pub fn spawn_emergency_ticker(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let strategy = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        strategy.evaluate_emergency();
                    }
                    _ = shutdown.recv() => {
                        tracing::info!("emergency ticker shutting down");
                        break;
                    }
                }
            }
        })
    }

    fn find_slot(&self, name: &str) -> Option<Arc<ProviderSlot>> {
        self.providers.load().iter().find(|slot| &*slot.definition.load().name == name).cloned()
    }
}

fn default_cache_key(method: &str, params: &Value) -> String {
    format!("{method}:{params}")
}
