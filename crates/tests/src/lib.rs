//! Integration tests for the relay
//!
//! Every test runs the real tracker, strategy and manager against local mock providers:
//!
//! - `routing_tests`: endpoint rotation, provider failover, quotas, caching and emergency mode
//! - `subscription_tests`: `newHeads` over WebSocket and polling, and log polling
//! - `persistence_tests`: the usage file across restarts
//! - `mock_infrastructure`: reusable mock providers and a wired-up relay
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test --package tests
//! ```

#[cfg(test)]
mod persistence_tests;

#[cfg(test)]
mod routing_tests;

#[cfg(test)]
mod subscription_tests;

/// Mock infrastructure for testing
pub mod mock_infrastructure;
