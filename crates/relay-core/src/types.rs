//! Core type definitions shared by every layer of the relay.
//!
//! # Type Categories
//!
//! ## Provider Types
//! - [`ProviderDefinition`]: Immutable description of one upstream RPC provider, including its
//!   quota budget, traffic role and physical endpoint URLs
//! - [`ProviderRole`]: Traffic tier used to bias selection and emergency narrowing
//!
//! ## JSON-RPC Protocol Types
//! - [`JsonRpcRequest`], [`JsonRpcResponse`], [`JsonRpcError`]: Wire format used by the
//!   endpoint layer. Payload contents are never interpreted beyond `result`/`error`.

use serde::{Deserialize, Serialize};
use std::{borrow::Cow, fmt, sync::Arc};

/// JSON-RPC protocol version constant to avoid repeated allocations.
pub const JSONRPC_VERSION: &str = "2.0";

/// Pre-allocated `Cow` for the JSON-RPC version.
pub const JSONRPC_VERSION_COW: Cow<'static, str> = Cow::Borrowed(JSONRPC_VERSION);

/// Default alert threshold (percent of quota) when none is configured.
pub const DEFAULT_ALERT_THRESHOLD_PCT: f64 = 80.0;

/// Default emergency threshold (percent of quota) when none is configured.
pub const DEFAULT_EMERGENCY_THRESHOLD_PCT: f64 = 95.0;

/// Intended traffic tier of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderRole {
    #[default]
    Primary,
    Secondary,
    Tertiary,
    Emergency,
}

impl ProviderRole {
    /// Returns a static string representation for logs and snapshots.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
            Self::Tertiary => "tertiary",
            Self::Emergency => "emergency",
        }
    }
}

impl fmt::Display for ProviderRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration of a single upstream RPC provider.
///
/// Definitions are immutable for the lifetime of one configuration load. Reconfiguring the
/// relay hands in a fresh set of definitions; surviving providers keep their runtime state.
///
/// # Example
///
/// ```
/// use relay_core::types::{ProviderDefinition, ProviderRole};
///
/// let def = ProviderDefinition::new("alchemy", ProviderRole::Primary, 1)
///     .with_limits(1_000_000, 30_000_000)
///     .with_thresholds(85.0, 70.0)
///     .with_rpc_url("https://eth-mainnet.g.alchemy.com/v2/KEY")
///     .normalized();
///
/// // alert is lowered to the emergency threshold
/// assert_eq!(def.alert_threshold_pct, 70.0);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderDefinition {
    pub name: Arc<str>,
    pub display_name: String,
    pub role: ProviderRole,
    /// Lower is preferred.
    pub priority: u32,
    /// Daily budget in cost units. `0` means unlimited.
    pub daily_limit: u64,
    /// Monthly budget in cost units. `0` means unlimited.
    pub monthly_limit: u64,
    pub alert_threshold_pct: f64,
    pub emergency_threshold_pct: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traffic_cap: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_weight: Option<f64>,
    #[serde(default)]
    pub emergency_only: bool,
    #[serde(default)]
    pub rpc_urls: Vec<String>,
    #[serde(default)]
    pub backup_urls: Vec<String>,
    #[serde(default)]
    pub ws_urls: Vec<String>,
}

impl ProviderDefinition {
    /// Creates a definition with default thresholds, unlimited quota and no endpoints.
    #[must_use]
    pub fn new(name: impl AsRef<str>, role: ProviderRole, priority: u32) -> Self {
        let name = name.as_ref();
        Self {
            name: Arc::from(name),
            display_name: name.to_string(),
            role,
            priority,
            daily_limit: 0,
            monthly_limit: 0,
            alert_threshold_pct: DEFAULT_ALERT_THRESHOLD_PCT,
            emergency_threshold_pct: DEFAULT_EMERGENCY_THRESHOLD_PCT,
            traffic_cap: None,
            cost_weight: None,
            emergency_only: false,
            rpc_urls: Vec::new(),
            backup_urls: Vec::new(),
            ws_urls: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    #[must_use]
    pub fn with_limits(mut self, daily_limit: u64, monthly_limit: u64) -> Self {
        self.daily_limit = daily_limit;
        self.monthly_limit = monthly_limit;
        self
    }

    #[must_use]
    pub fn with_thresholds(mut self, alert_pct: f64, emergency_pct: f64) -> Self {
        self.alert_threshold_pct = alert_pct;
        self.emergency_threshold_pct = emergency_pct;
        self
    }

    #[must_use]
    pub fn with_cost_weight(mut self, cost_weight: f64) -> Self {
        self.cost_weight = Some(cost_weight);
        self
    }

    #[must_use]
    pub fn emergency_only(mut self) -> Self {
        self.emergency_only = true;
        self
    }

    #[must_use]
    pub fn with_rpc_url(mut self, url: impl Into<String>) -> Self {
        self.rpc_urls.push(url.into());
        self
    }

    #[must_use]
    pub fn with_backup_url(mut self, url: impl Into<String>) -> Self {
        self.backup_urls.push(url.into());
        self
    }

    #[must_use]
    pub fn with_ws_url(mut self, url: impl Into<String>) -> Self {
        self.ws_urls.push(url.into());
        self
    }

    /// Returns a copy with thresholds clamped into `(0, 100]` and `alert <= emergency`.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        let (alert, emergency) =
            clamp_thresholds(self.alert_threshold_pct, self.emergency_threshold_pct);
        self.alert_threshold_pct = alert;
        self.emergency_threshold_pct = emergency;
        self
    }

    /// All HTTP endpoint candidates, ordinary URLs first, duplicates removed.
    #[must_use]
    pub fn endpoint_candidates(&self) -> Vec<String> {
        let mut urls: Vec<String> = Vec::with_capacity(self.rpc_urls.len() + self.backup_urls.len());
        for url in self.rpc_urls.iter().chain(self.backup_urls.iter()) {
            let url = url.trim();
            if !url.is_empty() && !urls.iter().any(|u| u == url) {
                urls.push(url.to_string());
            }
        }
        urls
    }
}

/// Clamps a threshold pair into `(0, 100]` and enforces `alert <= emergency`.
///
/// Non-finite or non-positive inputs fall back to the defaults.
#[must_use]
pub fn clamp_thresholds(alert_pct: f64, emergency_pct: f64) -> (f64, f64) {
    fn clamp_one(value: f64, fallback: f64) -> f64 {
        if !value.is_finite() || value <= 0.0 {
            fallback
        } else {
            value.min(100.0)
        }
    }

    let emergency = clamp_one(emergency_pct, DEFAULT_EMERGENCY_THRESHOLD_PCT);
    let alert = clamp_one(alert_pct, DEFAULT_ALERT_THRESHOLD_PCT).min(emergency);
    (alert, emergency)
}

/// JSON-RPC 2.0 request structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: Cow<'static, str>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    pub id: serde_json::Value,
}

impl JsonRpcRequest {
    #[must_use]
    pub fn new(
        method: impl Into<String>,
        params: Option<serde_json::Value>,
        id: serde_json::Value,
    ) -> Self {
        Self { jsonrpc: JSONRPC_VERSION_COW, method: method.into(), params, id }
    }
}

/// JSON-RPC 2.0 response structure.
///
/// A response contains either a `result` or an `error`, never both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: Cow<'static, str>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
    #[serde(default)]
    pub id: serde_json::Value,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Parses a `0x`-prefixed hex quantity such as a block number.
#[must_use]
pub fn parse_hex_u64(value: &serde_json::Value) -> Option<u64> {
    let hex_str = value.as_str()?;
    let digits = hex_str.strip_prefix("0x").unwrap_or(hex_str);
    u64::from_str_radix(digits, 16).ok()
}

/// Formats a block number as a `0x`-prefixed hex quantity.
#[must_use]
pub fn to_hex_quantity(value: u64) -> String {
    format!("0x{value:x}")
}
