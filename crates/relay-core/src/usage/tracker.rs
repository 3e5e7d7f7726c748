use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use tokio::sync::{mpsc, watch};

use crate::{
    events::{CoreEvent, EventBus},
    types::ProviderDefinition,
};

use super::{
    costs::{normalize_cost, CostTable},
    counters::{QuotaRegistration, UsageCounters},
    persistence::{PersistedProvider, PersistedUsage, PersistenceError, UsageStore, USAGE_FILE_VERSION},
    status::{percent, remaining, AggregatedUsage, ProviderUsageSnapshot, UsageLevel},
};

/// Default quiet period between a mutation and the file write it triggers.
pub const DEFAULT_FLUSH_DEBOUNCE: Duration = Duration::from_millis(50);

/// Flags for [`UsageTracker::can_use`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CanUseOptions {
    /// Permit one call that crosses the limit as long as usage is still below it.
    pub allow_near_limit: bool,
    pub ignore_daily: bool,
    pub ignore_monthly: bool,
}

/// Registration and counters of one provider.
#[derive(Debug, Clone)]
struct ProviderUsage {
    registration: Option<QuotaRegistration>,
    counters: UsageCounters,
    /// Compute units held by calls still in flight. Never persisted.
    reserved: u64,
}

impl ProviderUsage {
    fn new(registration: Option<QuotaRegistration>, counters: UsageCounters) -> Self {
        Self { registration, counters, reserved: 0 }
    }

    /// Quota check over committed plus reserved usage.
    fn admits(&self, cost: u64, options: CanUseOptions, now: DateTime<Utc>) -> bool {
        let Some(registration) = self.registration.as_ref() else {
            return true;
        };
        let counters = self.counters.rolled(now);
        let daily_used = counters.daily_used.saturating_add(self.reserved);
        let monthly_used = counters.monthly_used.saturating_add(self.reserved);

        let daily_ok = options.ignore_daily ||
            window_allows(daily_used, registration.daily_limit, cost, options.allow_near_limit);
        let monthly_ok = options.ignore_monthly ||
            window_allows(monthly_used, registration.monthly_limit, cost, options.allow_near_limit);
        daily_ok && monthly_ok
    }
}

type UsageMap = DashMap<Arc<str>, ProviderUsage>;

/// Compute units held against a provider's quota for one call in flight.
///
/// Obtained from [`UsageTracker::try_reserve`]. Pass it to
/// [`UsageTracker::commit_reservation`] once the call succeeds; dropping it instead hands
/// the units back.
#[must_use = "dropping a reservation releases it"]
pub struct QuotaReservation {
    providers: Arc<UsageMap>,
    provider: Arc<str>,
    cu: u64,
    held: bool,
}

impl QuotaReservation {
    #[must_use]
    pub fn provider(&self) -> &str {
        &self.provider
    }

    #[must_use]
    pub fn cu(&self) -> u64 {
        self.cu
    }

    fn release(&mut self) {
        if !std::mem::take(&mut self.held) {
            return;
        }
        if let Some(mut entry) = self.providers.get_mut(&*self.provider) {
            entry.reserved = entry.reserved.saturating_sub(self.cu);
        }
    }
}

impl Drop for QuotaReservation {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for QuotaReservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaReservation")
            .field("provider", &self.provider)
            .field("cu", &self.cu)
            .field("held", &self.held)
            .finish()
    }
}

#[derive(Debug, Default)]
struct FlushState {
    dirty: bool,
    scheduled: bool,
}

/// Handle to the single background writer.
///
/// Dropping the handle closes the signal channel, which ends the writer task.
struct UsageWriter {
    store: Arc<UsageStore>,
    state: Arc<Mutex<FlushState>>,
    signal: mpsc::UnboundedSender<()>,
    idle_tx: Arc<watch::Sender<bool>>,
    idle_rx: watch::Receiver<bool>,
}

impl UsageWriter {
    fn spawn(store: Arc<UsageStore>, providers: Arc<UsageMap>, debounce: Duration) -> Self {
        let state = Arc::new(Mutex::new(FlushState::default()));
        let (signal, mut signals) = mpsc::unbounded_channel::<()>();
        let (idle_tx, idle_rx) = watch::channel(true);
        let idle_tx = Arc::new(idle_tx);

        let task_state = Arc::clone(&state);
        let task_idle = Arc::clone(&idle_tx);
        let task_store = Arc::clone(&store);

        tokio::spawn(async move {
            while signals.recv().await.is_some() {
                tokio::time::sleep(debounce).await;

                loop {
                    {
                        let mut flush = task_state.lock();
                        if !flush.dirty {
                            flush.scheduled = false;
                            task_idle.send_replace(true);
                            break;
                        }
                        flush.dirty = false;
                    }

                    let store = Arc::clone(&task_store);
                    let providers = Arc::clone(&providers);
                    let write = move || store.save_with(|| snapshot(&providers, Utc::now()));
                    match tokio::task::spawn_blocking(write).await {
                        Ok(Ok(())) => tracing::trace!("usage file written"),
                        Ok(Err(e)) => tracing::error!(error = %e, "failed to persist usage"),
                        Err(e) => tracing::error!(error = %e, "usage writer panicked"),
                    }
                }
            }
            tracing::debug!("usage writer stopped");
        });

        Self { store, state, signal, idle_tx, idle_rx }
    }

    fn schedule(&self) {
        let mut flush = self.state.lock();
        flush.dirty = true;
        if !flush.scheduled {
            flush.scheduled = true;
            self.idle_tx.send_replace(false);
            let _ = self.signal.send(());
        }
    }
}

/// Records compute-unit consumption per provider and answers quota questions.
///
/// All methods are synchronous except [`UsageTracker::wait_for_idle`]; persistence happens on
/// a background task, which is why a tracker built with
/// [`UsageTracker::with_persistence`] must be created inside a Tokio runtime.
pub struct UsageTracker {
    providers: Arc<UsageMap>,
    costs: CostTable,
    events: EventBus,
    writer: Option<UsageWriter>,
}

impl UsageTracker {
    /// In-memory tracker with no backing file.
    #[must_use]
    pub fn new(costs: CostTable, events: EventBus) -> Self {
        Self { providers: Arc::new(DashMap::new()), costs, events, writer: None }
    }

    /// Tracker backed by `store`. Existing state is loaded; a missing file is created.
    ///
    /// # Errors
    ///
    /// Returns a [`PersistenceError`] if the file exists but cannot be read or parsed, or if
    /// it cannot be created.
    pub fn with_persistence(
        costs: CostTable,
        events: EventBus,
        store: UsageStore,
        debounce: Duration,
    ) -> Result<Self, PersistenceError> {
        let persisted = store.load_or_init()?;
        let providers: Arc<UsageMap> = Arc::new(DashMap::new());
        for (name, record) in persisted.providers {
            providers.insert(
                Arc::from(name.as_str()),
                ProviderUsage::new(record.registration, record.counters),
            );
        }

        tracing::info!(
            path = %store.path().display(),
            providers = providers.len(),
            "loaded usage state"
        );

        let writer = UsageWriter::spawn(Arc::new(store), Arc::clone(&providers), debounce);
        Ok(Self { providers, costs, events, writer: Some(writer) })
    }

    #[must_use]
    pub fn costs(&self) -> &CostTable {
        &self.costs
    }

    #[must_use]
    pub fn estimate_cost(&self, method: &str) -> u64 {
        self.costs.cost_of(method)
    }

    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    #[must_use]
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn provider_names(&self) -> Vec<Arc<str>> {
        self.providers.iter().map(|entry| Arc::clone(entry.key())).collect()
    }

    /// Registers or updates a provider's quota. Existing counters are kept.
    pub fn register_provider(&self, def: &ProviderDefinition) {
        let registration = QuotaRegistration::from(def);
        let now = Utc::now();
        let mut entry = self
            .providers
            .entry(Arc::clone(&def.name))
            .or_insert_with(|| ProviderUsage::new(None, UsageCounters::started_at(now)));
        if entry.registration.as_ref() == Some(&registration) {
            return;
        }
        entry.registration = Some(registration);
        drop(entry);

        tracing::debug!(provider = %def.name, "registered provider quota");
        self.schedule_flush();
    }

    /// Adds the cost of one call to `name`'s counters.
    ///
    /// Returns the compute units recorded, or `None` if the provider is unknown.
    pub fn record_usage(&self, name: &str, method: &str, cost_override: Option<f64>) -> Option<u64> {
        self.record_usage_at(name, method, cost_override, Utc::now())
    }

    pub(crate) fn record_usage_at(
        &self,
        name: &str,
        method: &str,
        cost_override: Option<f64>,
        now: DateTime<Utc>,
    ) -> Option<u64> {
        let cu = cost_override.map_or_else(|| self.costs.cost_of(method), normalize_cost);

        let provider = {
            let mut entry = self.providers.get_mut(name)?;
            charge(&mut entry, name, method, cu, now);
            Arc::clone(entry.key())
        };

        self.recorded(provider, method, cu);
        Some(cu)
    }

    /// Holds `cu` against `name`'s quota if the call fits, counting other reservations.
    ///
    /// The check and the hold happen under the same entry lock, so concurrent callers can
    /// never be admitted on the same headroom. Returns `None` when the call does not fit.
    /// Unknown providers get a reservation that holds nothing.
    #[must_use]
    pub fn try_reserve(&self, name: &str, cu: u64, options: CanUseOptions) -> Option<QuotaReservation> {
        self.try_reserve_at(name, cu, options, Utc::now())
    }

    pub(crate) fn try_reserve_at(
        &self,
        name: &str,
        cu: u64,
        options: CanUseOptions,
        now: DateTime<Utc>,
    ) -> Option<QuotaReservation> {
        let Some(mut entry) = self.providers.get_mut(name) else {
            return Some(QuotaReservation {
                providers: Arc::clone(&self.providers),
                provider: Arc::from(name),
                cu,
                held: false,
            });
        };
        if !entry.admits(cu, options, now) {
            return None;
        }
        entry.reserved = entry.reserved.saturating_add(cu);

        Some(QuotaReservation {
            providers: Arc::clone(&self.providers),
            provider: Arc::clone(entry.key()),
            cu,
            held: true,
        })
    }

    /// Turns a reservation into recorded usage of `method`.
    ///
    /// Returns the compute units recorded, or `None` if the provider is unknown.
    pub fn commit_reservation(&self, reservation: QuotaReservation, method: &str) -> Option<u64> {
        self.commit_reservation_at(reservation, method, Utc::now())
    }

    pub(crate) fn commit_reservation_at(
        &self,
        mut reservation: QuotaReservation,
        method: &str,
        now: DateTime<Utc>,
    ) -> Option<u64> {
        let cu = reservation.cu;
        let provider = {
            let mut entry = self.providers.get_mut(&*reservation.provider)?;
            if std::mem::take(&mut reservation.held) {
                entry.reserved = entry.reserved.saturating_sub(cu);
            }
            charge(&mut entry, &reservation.provider, method, cu, now);
            Arc::clone(entry.key())
        };

        self.recorded(provider, method, cu);
        Some(cu)
    }

    fn recorded(&self, provider: Arc<str>, method: &str, cu: u64) {
        tracing::debug!(provider = %provider, method = method, cu = cu, "recorded usage");
        self.events.emit(CoreEvent::UsageRecorded { provider, method: method.to_string(), cu });
        self.schedule_flush();
    }

    /// Counts a cache hit attributed to `name`. Daily and monthly usage are untouched.
    pub fn record_cache_hit(&self, name: &str, method: &str, cost_saved: u64) {
        self.record_cache_hit_at(name, method, cost_saved, Utc::now());
    }

    pub(crate) fn record_cache_hit_at(
        &self,
        name: &str,
        method: &str,
        cost_saved: u64,
        now: DateTime<Utc>,
    ) {
        let provider = {
            let Some(mut entry) = self.providers.get_mut(name) else {
                return;
            };
            entry.counters.roll_windows(now);
            entry.counters.add_cache_hit(cost_saved, now);
            Arc::clone(entry.key())
        };

        self.events.emit(CoreEvent::CacheHit {
            provider,
            method: method.to_string(),
            saved_cu: cost_saved,
        });
        self.schedule_flush();
    }

    /// Returns `false` if spending `cost` would push a window past its limit.
    ///
    /// Units held by outstanding reservations count as used. With `allow_near_limit`, a
    /// window that is still strictly below its limit admits the call regardless of how far
    /// it overshoots. Unknown providers are always allowed.
    #[must_use]
    pub fn can_use(&self, name: &str, cost: u64, options: CanUseOptions) -> bool {
        self.can_use_at(name, cost, options, Utc::now())
    }

    pub(crate) fn can_use_at(
        &self,
        name: &str,
        cost: u64,
        options: CanUseOptions,
        now: DateTime<Utc>,
    ) -> bool {
        self.providers.get(name).map_or(true, |entry| entry.admits(cost, options, now))
    }

    #[must_use]
    pub fn get_usage(&self, name: &str) -> Option<ProviderUsageSnapshot> {
        self.get_usage_at(name, Utc::now())
    }

    pub(crate) fn get_usage_at(&self, name: &str, now: DateTime<Utc>) -> Option<ProviderUsageSnapshot> {
        let entry = self.providers.get(name)?;
        Some(build_snapshot(entry.key(), entry.value(), now))
    }

    /// Usage of every known provider with cluster totals.
    #[must_use]
    pub fn get_aggregated_usage(&self) -> AggregatedUsage {
        let now = Utc::now();
        let snapshots =
            self.providers.iter().map(|entry| build_snapshot(entry.key(), entry.value(), now)).collect();
        AggregatedUsage::from_snapshots(snapshots, now)
    }

    /// Usage restricted to `names`, skipping names the tracker does not know.
    #[must_use]
    pub fn aggregate_for(&self, names: &[Arc<str>]) -> AggregatedUsage {
        let now = Utc::now();
        let snapshots = names
            .iter()
            .filter_map(|name| {
                self.providers.get(&**name).map(|entry| build_snapshot(entry.key(), entry.value(), now))
            })
            .collect();
        AggregatedUsage::from_snapshots(snapshots, now)
    }

    /// Zeroes one provider's counters and writes the file immediately.
    ///
    /// Returns `Ok(false)` if the provider is unknown.
    ///
    /// # Errors
    ///
    /// Returns the flush error; the in-memory reset has already happened.
    pub fn reset_provider(&self, name: &str) -> Result<bool, PersistenceError> {
        let now = Utc::now();
        let provider = {
            let Some(mut entry) = self.providers.get_mut(name) else {
                return Ok(false);
            };
            entry.counters = UsageCounters::started_at(now);
            Arc::clone(entry.key())
        };

        tracing::info!(provider = %provider, "usage reset");
        self.events.emit(CoreEvent::UsageReset { provider: Some(provider) });
        self.schedule_flush();
        self.flush_now()?;
        Ok(true)
    }

    /// Zeroes every provider's counters and writes the file immediately.
    ///
    /// # Errors
    ///
    /// Returns the flush error; the in-memory reset has already happened.
    pub fn reset_all(&self) -> Result<(), PersistenceError> {
        let now = Utc::now();
        for mut entry in self.providers.iter_mut() {
            entry.counters = UsageCounters::started_at(now);
        }

        tracing::info!(providers = self.providers.len(), "usage reset for all providers");
        self.events.emit(CoreEvent::UsageReset { provider: None });
        self.schedule_flush();
        self.flush_now()
    }

    /// Writes the current state synchronously. A no-op without persistence.
    ///
    /// # Errors
    ///
    /// Returns the write failure.
    pub fn flush_now(&self) -> Result<(), PersistenceError> {
        match &self.writer {
            Some(writer) => writer.store.save_with(|| snapshot(&self.providers, Utc::now())),
            None => Ok(()),
        }
    }

    /// Resolves once no scheduled write is pending.
    pub async fn wait_for_idle(&self) {
        if let Some(writer) = &self.writer {
            let mut idle = writer.idle_rx.clone();
            let _ = idle.wait_for(|idle| *idle).await;
        }
    }

    fn schedule_flush(&self) {
        if let Some(writer) = &self.writer {
            writer.schedule();
        }
    }
}

fn charge(entry: &mut ProviderUsage, name: &str, method: &str, cu: u64, now: DateTime<Utc>) {
    if entry.counters.roll_windows(now) {
        tracing::info!(provider = %name, "usage window rolled over");
    }
    entry.counters.add_usage(method, cu, now);
}

fn window_allows(used: u64, limit: u64, cost: u64, allow_near_limit: bool) -> bool {
    if limit == 0 || used.saturating_add(cost) <= limit {
        return true;
    }
    allow_near_limit && used < limit
}

fn build_snapshot(name: &Arc<str>, usage: &ProviderUsage, now: DateTime<Utc>) -> ProviderUsageSnapshot {
    let counters = usage.counters.rolled(now);
    let registration = usage.registration.clone().unwrap_or_else(|| QuotaRegistration {
        display_name: name.to_string(),
        role: crate::types::ProviderRole::default(),
        priority: u32::MAX,
        daily_limit: 0,
        monthly_limit: 0,
        alert_threshold_pct: crate::types::DEFAULT_ALERT_THRESHOLD_PCT,
        emergency_threshold_pct: crate::types::DEFAULT_EMERGENCY_THRESHOLD_PCT,
    });

    let daily_pct = percent(counters.daily_used, registration.daily_limit);
    let monthly_pct = percent(counters.monthly_used, registration.monthly_limit);
    let status = UsageLevel::classify(
        daily_pct.max(monthly_pct),
        registration.alert_threshold_pct,
        registration.emergency_threshold_pct,
    );

    ProviderUsageSnapshot {
        name: Arc::clone(name),
        display_name: registration.display_name,
        role: registration.role,
        priority: registration.priority,
        daily_used: counters.daily_used,
        daily_limit: registration.daily_limit,
        daily_pct,
        daily_remaining: remaining(counters.daily_used, registration.daily_limit),
        monthly_used: counters.monthly_used,
        monthly_limit: registration.monthly_limit,
        monthly_pct,
        monthly_remaining: remaining(counters.monthly_used, registration.monthly_limit),
        request_count: counters.request_count,
        cache_hits: counters.cache_hits,
        cache_saved_cu: counters.cache_saved_cu,
        cu_by_method: counters.cu_by_method,
        alert_threshold_pct: registration.alert_threshold_pct,
        emergency_threshold_pct: registration.emergency_threshold_pct,
        status,
        last_updated: counters.last_updated,
    }
}

fn snapshot(providers: &UsageMap, now: DateTime<Utc>) -> PersistedUsage {
    let providers = providers
        .iter()
        .map(|entry| {
            (
                entry.key().to_string(),
                PersistedProvider {
                    registration: entry.registration.clone(),
                    counters: entry.counters.clone(),
                },
            )
        })
        .collect();
    PersistedUsage { version: USAGE_FILE_VERSION, updated_at: now, providers }
}
