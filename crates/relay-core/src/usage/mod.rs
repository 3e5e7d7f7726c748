//! Compute-unit accounting against per-provider daily and monthly quotas.
//!
//! [`UsageTracker`] owns the counters, [`CostTable`] prices methods, and [`UsageStore`] keeps
//! the counters on disk across restarts.

pub mod costs;
pub mod counters;
pub mod persistence;
pub mod status;
pub mod tracker;

pub use costs::{normalize_cost, CostTable, DEFAULT_METHOD_COST};
pub use counters::{QuotaRegistration, UsageCounters};
pub use persistence::{PersistedProvider, PersistedUsage, PersistenceError, UsageStore};
pub use status::{AggregatedUsage, ProviderUsageSnapshot, UsageLevel, UsageTotals};
pub use tracker::{CanUseOptions, QuotaReservation, UsageTracker, DEFAULT_FLUSH_DEBOUNCE};
