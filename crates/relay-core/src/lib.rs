//! # Relay Core
//!
//! Quota-aware routing of JSON-RPC calls across metered blockchain RPC providers.
//!
//! This crate provides the foundational components for:
//!
//! - **[`usage`]**: Compute-unit accounting per provider with daily and monthly windows,
//!   alert banding and a crash-safe usage file.
//!
//! - **[`strategy`]**: Provider selection (capacity, cost, round robin, emergency), provider
//!   health, a response cache and emergency mode.
//!
//! - **[`upstream`]**: Physical endpoints with circuit breakers, startup probing, endpoint
//!   rotation, `newHeads` subscriptions and log polling.
//!
//! - **[`monitor`]**: Debounced usage snapshots for dashboards.
//!
//! - **[`config`]**: Layered configuration from a TOML file and the environment.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                  ResilientProviderManager                    │
//! │   endpoint pools · probing · rotation · heads · log polling  │
//! └───────────────────────────────┬──────────────────────────────┘
//!                                 │ execute_with_best_provider
//! ┌───────────────────────────────▼──────────────────────────────┐
//! │                      ProviderStrategy                        │
//! │   cache · quota filter · health · ordering · emergency mode  │
//! └───────────────┬───────────────────────────────┬──────────────┘
//!                 │ try_reserve / commit          │ EventBus
//! ┌───────────────▼──────────────┐        ┌───────▼──────────────┐
//! │         UsageTracker         │──────► │     UsageMonitor     │
//! │  counters · usage file       │ events │  snapshots · watch   │
//! └──────────────────────────────┘        └──────────────────────┘
//! ```
//!
//! ## Call Flow
//!
//! ```text
//! request(method, params)
//!       │
//!       ▼
//! ┌─────────────┐
//! │ Cache Check │ ─── Hit ──► cached result (cache hit recorded)
//! └──────┬──────┘
//!        │ Miss
//!        ▼
//! ┌──────────────────────┐
//! │ Filter providers     │ ─── none ──► QuotaExceeded / NoProviderAvailable
//! │ quota · health · role│
//! └──────┬───────────────┘
//!        ▼
//! ┌──────────────────────┐
//! │ Order by strategy    │
//! └──────┬───────────────┘
//!        ▼
//! ┌──────────────────────┐   held      ┌────────────────┐
//! │ Reserve estimated CU │ ──────────► │ next candidate │
//! └──────┬───────────────┘             └────────────────┘
//!        ▼                                     ▲
//! ┌──────────────────────┐   failure           │
//! │ Call provider        │ ────────────────────┘
//! │ (endpoint rotation)  │   (reservation released)
//! └──────┬───────────────┘
//!        │ success
//!        ▼
//!  commit reservation · cache insert · re-evaluate emergency
//! ```

pub mod config;
pub mod events;
pub mod monitor;
pub mod strategy;
pub mod types;
pub mod upstream;
pub mod usage;

pub use events::{CoreEvent, EventBus};
pub use monitor::{MetricsSnapshot, UsageMonitor};
pub use strategy::{ExecuteOptions, ProviderStrategy, StrategyError};
pub use types::{ProviderDefinition, ProviderRole};
pub use upstream::{ManagerError, ResilientProviderManager, Subscription, UpstreamError};
pub use usage::{UsageTracker, UsageLevel};
