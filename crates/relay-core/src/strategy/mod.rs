//! Provider selection, health tracking, response caching and emergency mode.

pub mod cache;
pub mod emergency;
pub mod engine;
pub mod errors;
pub mod health;
pub mod selection;

pub use cache::{CacheEntry, CacheStats, ResponseCache, MAX_ENTRY_TTL};
pub use emergency::{EmergencyAdjustments, EmergencyContext, EmergencyPolicy};
pub use engine::{
    ExecuteOptions, ProviderStateSnapshot, ProviderStrategy, StrategyConfig, StrategyState,
    AGGRESSIVE_CACHE_MULTIPLIER,
};
pub use errors::StrategyError;
pub use health::{HealthPolicy, HealthState, ProviderHealth};
pub use selection::SelectionStrategy;
