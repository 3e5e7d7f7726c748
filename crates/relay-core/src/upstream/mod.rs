//! Upstream RPC provider plumbing.
//!
//! This module handles communication with the physical endpoints of every provider:
//! - HTTP transport with bounded concurrency and per-call timeouts
//! - Circuit breaker per endpoint
//! - Startup probing and endpoint rotation within a provider
//! - `newHeads` over WebSocket with a polling fallback, and log polling
//!
//! Which provider serves a call is decided by [`crate::strategy::ProviderStrategy`];
//! [`ResilientProviderManager`] only decides which of that provider's URLs to use.

pub mod circuit_breaker;
pub mod endpoint;
pub mod errors;
pub mod http_client;
pub mod manager;
pub mod subscription;
pub mod websocket;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerState};
pub use endpoint::{redact_url, timeout_for_method, EndpointStatus, UpstreamEndpoint};
pub use errors::{RpcErrorCategory, UpstreamError};
pub use http_client::{HttpClient, HttpClientConfig};
pub use manager::{
    EndpointPool, ManagerConfig, ManagerError, ProviderEndpoints, ResilientProviderManager,
    RetryPolicy,
};
pub use subscription::Subscription;
pub use websocket::{parse_head_message, HeadMessage};
