//! Application configuration with layered loading.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded in this order (later overrides earlier):
//!
//! 1. **Compiled defaults**: the `Default` implementation of [`AppConfig`]
//! 2. **Config file**: TOML file named by the `RELAY_CONFIG` env var (default
//!    `config/relay.toml`), optional
//! 3. **Environment variables**: flat upper-case names such as `CACHE_TTL_SECONDS`
//!
//! Providers come from `[[providers]]` tables in the file plus any names listed in
//! `RPC_PROVIDERS`. Each provider can then be adjusted through `<NAME>_DAILY_LIMIT`,
//! `<NAME>_MONTHLY_LIMIT`, `<NAME>_ALERT_THRESHOLD`, `<NAME>_EMERGENCY_THRESHOLD`,
//! `<NAME>_RPC_URLS`, `<NAME>_BACKUP_URLS` and `<NAME>_WS_URLS` (comma separated), where
//! `<NAME>` is the upper-cased provider name with non-alphanumerics replaced by `_`.
//!
//! # Example
//!
//! ```toml
//! provider_strategy = "round_robin"
//! cache_ttl_seconds = 60
//!
//! [[providers]]
//! name = "alchemy"
//! role = "primary"
//! daily_limit = 10000000
//! rpc_urls = ["https://eth-mainnet.example.com/v2/KEY"]
//! ws_urls = ["wss://eth-mainnet.example.com/v2/KEY"]
//! ```

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use thiserror::Error;

use crate::{
    monitor::MonitorConfig,
    strategy::{EmergencyPolicy, HealthPolicy, SelectionStrategy, StrategyConfig},
    types::{ProviderDefinition, ProviderRole},
    upstream::{ManagerConfig, RetryPolicy},
};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// One provider as written in the config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProviderConfig {
    pub name: String,
    pub display_name: Option<String>,
    /// Defaults to `primary` for the first provider and `secondary` for the rest.
    pub role: Option<ProviderRole>,
    /// Defaults to the provider's position in the list, starting at 1.
    pub priority: Option<u32>,
    pub daily_limit: u64,
    pub monthly_limit: u64,
    pub alert_threshold: Option<f64>,
    pub emergency_threshold: Option<f64>,
    pub traffic_cap: Option<f64>,
    pub cost_weight: Option<f64>,
    pub emergency_only: bool,
    pub rpc_urls: Vec<String>,
    pub backup_urls: Vec<String>,
    pub ws_urls: Vec<String>,
}

impl ProviderConfig {
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Self::default() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub cu_alert_threshold: f64,
    pub cu_emergency_threshold: f64,
    pub provider_strategy: SelectionStrategy,
    pub cache_ttl_seconds: u64,
    pub cache_max_size: usize,
    pub enable_aggressive_caching: bool,
    pub emergency_provider_count: usize,
    pub emergency_daily_threshold: f64,
    pub emergency_monthly_threshold: f64,
    pub emergency_check_interval_seconds: u64,
    pub provider_failure_threshold: u32,
    pub provider_offline_cooldown_ms: u64,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_jitter: f64,
    pub usage_file: PathBuf,
    pub usage_flush_debounce_ms: u64,
    pub probe_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub max_endpoint_attempts: u32,
    pub head_poll_interval_ms: u64,
    pub logs_poll_interval_ms: u64,
    pub monitor_refresh_seconds: u64,
    pub monitor_debounce_ms: u64,
    pub log_level: String,
    pub log_format: String,
    /// Comma-separated provider names added on top of the file's `[[providers]]`.
    pub rpc_providers: Option<String>,
    pub providers: Vec<ProviderConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            cu_alert_threshold: 80.0,
            cu_emergency_threshold: 95.0,
            provider_strategy: SelectionStrategy::CapacityBased,
            cache_ttl_seconds: 30,
            cache_max_size: 1000,
            enable_aggressive_caching: false,
            emergency_provider_count: 2,
            emergency_daily_threshold: 90.0,
            emergency_monthly_threshold: 90.0,
            emergency_check_interval_seconds: 60,
            provider_failure_threshold: 3,
            provider_offline_cooldown_ms: 60_000,
            retry_base_delay_ms: 250,
            retry_max_delay_ms: 5000,
            retry_jitter: 0.2,
            usage_file: PathBuf::from("data/usage.json"),
            usage_flush_debounce_ms: 50,
            probe_timeout_ms: 3000,
            request_timeout_ms: 10_000,
            max_endpoint_attempts: 3,
            head_poll_interval_ms: 4000,
            logs_poll_interval_ms: 15_000,
            monitor_refresh_seconds: 30,
            monitor_debounce_ms: 250,
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            rpc_providers: None,
            providers: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Builds the configuration from an optional TOML file and an environment map.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Load`] if the file or an environment value cannot be parsed,
    /// and [`ConfigError::Invalid`] for malformed per-provider overrides.
    pub fn from_sources(
        file: Option<&Path>,
        env: &HashMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(false));
        }
        let settings = builder
            .add_source(
                Environment::default().source(Some(env.clone())).try_parsing(true).ignore_empty(true),
            )
            .build()?;

        let mut config: Self = settings.try_deserialize()?;
        config.apply_provider_env(env)?;
        Ok(config)
    }

    /// Loads from `RELAY_CONFIG` (default `config/relay.toml`) and the process environment.
    ///
    /// # Errors
    ///
    /// See [`Self::from_sources`].
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("RELAY_CONFIG").unwrap_or_else(|_| "config/relay.toml".to_string());
        let env: HashMap<String, String> = std::env::vars().collect();
        Self::from_sources(Some(Path::new(&path)), &env)
    }

    fn apply_provider_env(&mut self, env: &HashMap<String, String>) -> Result<(), ConfigError> {
        if let Some(list) = &self.rpc_providers {
            for name in split_list(list) {
                if !self.providers.iter().any(|p| p.name.eq_ignore_ascii_case(&name)) {
                    self.providers.push(ProviderConfig::named(name));
                }
            }
        }

        for provider in &mut self.providers {
            let prefix = env_prefix(&provider.name);
            let var = |suffix: &str| {
                let key = format!("{prefix}_{suffix}");
                env.get(&key).filter(|v| !v.trim().is_empty()).map(|v| (key, v.trim()))
            };

            if let Some((key, value)) = var("DAILY_LIMIT") {
                provider.daily_limit = parse_var(&key, value)?;
            }
            if let Some((key, value)) = var("MONTHLY_LIMIT") {
                provider.monthly_limit = parse_var(&key, value)?;
            }
            if let Some((key, value)) = var("ALERT_THRESHOLD") {
                provider.alert_threshold = Some(parse_var(&key, value)?);
            }
            if let Some((key, value)) = var("EMERGENCY_THRESHOLD") {
                provider.emergency_threshold = Some(parse_var(&key, value)?);
            }
            if let Some((_, value)) = var("RPC_URLS") {
                provider.rpc_urls = split_list(value);
            }
            if let Some((_, value)) = var("BACKUP_URLS") {
                provider.backup_urls = split_list(value);
            }
            if let Some((_, value)) = var("WS_URLS") {
                provider.ws_urls = split_list(value);
            }
        }
        Ok(())
    }

    /// Checks the loaded configuration for values the runtime cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.providers.is_empty() {
            return invalid("no RPC providers configured".to_string());
        }

        let mut seen: Vec<String> = Vec::with_capacity(self.providers.len());
        for provider in &self.providers {
            let name = provider.name.trim();
            if name.is_empty() {
                return invalid("provider with an empty name".to_string());
            }
            let lower = name.to_ascii_lowercase();
            if seen.contains(&lower) {
                return invalid(format!("duplicate provider: {name}"));
            }
            seen.push(lower);

            if provider.rpc_urls.is_empty() && provider.backup_urls.is_empty() {
                return invalid(format!("provider {name} has no RPC URLs"));
            }
            for url in provider.rpc_urls.iter().chain(&provider.backup_urls) {
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    return invalid(format!(
                        "invalid RPC URL for provider {name}: {}",
                        crate::upstream::redact_url(url)
                    ));
                }
            }
            for url in &provider.ws_urls {
                if !url.starts_with("ws://") && !url.starts_with("wss://") {
                    return invalid(format!(
                        "invalid WebSocket URL for provider {name}: {}",
                        crate::upstream::redact_url(url)
                    ));
                }
            }
        }

        if self.cache_max_size == 0 {
            return invalid("cache max size must be greater than 0".to_string());
        }
        if !(0.0..=1.0).contains(&self.retry_jitter) {
            return invalid(format!("retry jitter must be within [0, 1], got {}", self.retry_jitter));
        }
        if self.max_endpoint_attempts == 0 {
            return invalid("max endpoint attempts must be greater than 0".to_string());
        }
        if !["json", "pretty"].contains(&self.log_format.as_str()) {
            return invalid("log format must be 'json' or 'pretty'".to_string());
        }

        Ok(())
    }

    /// Provider definitions with defaults filled in.
    #[must_use]
    pub fn to_definitions(&self) -> Vec<ProviderDefinition> {
        self.providers
            .iter()
            .enumerate()
            .map(|(index, provider)| {
                let role = provider.role.unwrap_or(if index == 0 {
                    ProviderRole::Primary
                } else {
                    ProviderRole::Secondary
                });
                #[allow(clippy::cast_possible_truncation)]
                let priority = provider.priority.unwrap_or(index as u32 + 1);

                let mut definition = ProviderDefinition::new(provider.name.trim(), role, priority)
                    .with_limits(provider.daily_limit, provider.monthly_limit)
                    .with_thresholds(
                        provider.alert_threshold.unwrap_or(self.cu_alert_threshold),
                        provider.emergency_threshold.unwrap_or(self.cu_emergency_threshold),
                    );
                if let Some(display_name) = &provider.display_name {
                    definition = definition.with_display_name(display_name.clone());
                }
                definition.traffic_cap = provider.traffic_cap;
                definition.cost_weight = provider.cost_weight;
                definition.emergency_only = provider.emergency_only;
                definition.rpc_urls.clone_from(&provider.rpc_urls);
                definition.backup_urls.clone_from(&provider.backup_urls);
                definition.ws_urls.clone_from(&provider.ws_urls);
                definition.normalized()
            })
            .collect()
    }

    #[must_use]
    pub fn strategy_config(&self) -> StrategyConfig {
        StrategyConfig {
            strategy: self.provider_strategy,
            cache_ttl: Duration::from_secs(self.cache_ttl_seconds),
            cache_max_size: self.cache_max_size,
            aggressive_caching: self.enable_aggressive_caching,
            health: HealthPolicy {
                failure_threshold: self.provider_failure_threshold,
                offline_cooldown: Duration::from_millis(self.provider_offline_cooldown_ms),
            },
            emergency: EmergencyPolicy {
                provider_count: self.emergency_provider_count,
                daily_threshold_pct: self.emergency_daily_threshold,
                monthly_threshold_pct: self.emergency_monthly_threshold,
            },
        }
    }

    #[must_use]
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            max_endpoint_attempts: self.max_endpoint_attempts,
            retry: RetryPolicy {
                base_delay: Duration::from_millis(self.retry_base_delay_ms),
                max_delay: Duration::from_millis(self.retry_max_delay_ms),
                jitter: self.retry_jitter,
            },
            head_poll_interval: Duration::from_millis(self.head_poll_interval_ms),
            logs_poll_interval: Duration::from_millis(self.logs_poll_interval_ms),
            ..ManagerConfig::default()
        }
    }

    #[must_use]
    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            refresh_interval: Duration::from_secs(self.monitor_refresh_seconds.max(1)),
            debounce: Duration::from_millis(self.monitor_debounce_ms),
        }
    }

    #[must_use]
    pub fn usage_flush_debounce(&self) -> Duration {
        Duration::from_millis(self.usage_flush_debounce_ms)
    }

    #[must_use]
    pub fn emergency_check_interval(&self) -> Duration {
        Duration::from_secs(self.emergency_check_interval_seconds.max(1))
    }
}

/// `alchemy-eu` becomes `ALCHEMY_EU`.
fn env_prefix(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::Invalid(format!("{key} has an invalid value: {value}")))
}
