//! Application configuration.
//!
//! Loaded from a TOML file with `LIVESYNC_` environment overrides, e.g.
//! `LIVESYNC_API__BASE_URL=http://api:8000` or `LIVESYNC_SERVER__PORT=9000`.
//! Every field has a default, so an empty file is a valid configuration.

use crate::error::{AppError, AppResult};
use livesync_alerts::{default_rules, AlertRule};
use livesync_core::BackoffPolicy;
use livesync_registry::{MonitorConfig, RateLimitedCacheConfig, RegistryConfig};
use livesync_store::{ServerConfig, StoreConfig};
use livesync_ws::IngressConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "LIVESYNC";

/// Upstream account API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// API root, e.g. "http://localhost:8000/api".
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Requests allowed per window.
    #[serde(default = "default_rate_limit_requests")]
    pub rate_limit_requests: u32,
    #[serde(default = "default_rate_limit_window_ms")]
    pub rate_limit_window_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Consecutive failures per account before auto-reconnect stops.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// First retry delay; doubles per failure.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    /// Delay between successful polls of one account.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub cache: CacheConfig,
}

fn default_base_url() -> String {
    "http://localhost:8000/api".to_string()
}

fn default_rate_limit_requests() -> u32 {
    60
}

fn default_rate_limit_window_ms() -> u64 {
    60_000
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

fn default_max_retry_delay_ms() -> u64 {
    30_000
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            rate_limit_requests: default_rate_limit_requests(),
            rate_limit_window_ms: default_rate_limit_window_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            cache: CacheConfig::default(),
        }
    }
}

impl ApiConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn cache_config(&self) -> RateLimitedCacheConfig {
        RateLimitedCacheConfig {
            rate_limit_requests: self.rate_limit_requests,
            rate_limit_window: Duration::from_millis(self.rate_limit_window_ms),
            request_timeout: self.request_timeout(),
            default_ttl: Duration::from_millis(self.cache.ttl_ms),
            max_size: self.cache.max_size,
        }
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            retry_attempts: self.retry_attempts,
            backoff: BackoffPolicy::exponential(self.retry_delay_ms, self.max_retry_delay_ms),
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            ..Default::default()
        }
    }
}

/// Response cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl_ms")]
    pub ttl_ms: u64,
    #[serde(default = "default_cache_max_size")]
    pub max_size: usize,
    /// Period of the expired-entry sweep.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

fn default_cache_ttl_ms() -> u64 {
    5_000
}

fn default_cache_max_size() -> usize {
    100
}

fn default_sweep_interval_ms() -> u64 {
    60_000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_cache_ttl_ms(),
            max_size: default_cache_max_size(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

/// Alert rule selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsConfig {
    /// Start from the built-in margin and drawdown rules.
    #[serde(default = "default_use_default_rules")]
    pub use_default_rules: bool,
    /// Extra rules, appended after the defaults.
    #[serde(default)]
    pub rules: Vec<AlertRule>,
}

fn default_use_default_rules() -> bool {
    true
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            use_default_rules: default_use_default_rules(),
            rules: Vec::new(),
        }
    }
}

impl AlertsConfig {
    /// Effective rule list.
    pub fn rules(&self) -> Vec<AlertRule> {
        let mut rules = if self.use_default_rules {
            default_rules()
        } else {
            Vec::new()
        };
        rules.extend(self.rules.iter().cloned());
        rules
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Account ids polled by the monitor.
    #[serde(default)]
    pub accounts: Vec<String>,
    /// Push channel. An empty `url` runs the pipeline pull-only.
    #[serde(default)]
    pub stream: IngressConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
}

impl AppConfig {
    /// Load `path` (if it exists) and apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::warn!(path = %path.display(), "Config file not found, using defaults");
        }

        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("accounts")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| AppError::Config(format!("Failed to read config: {e}")))?;

        let config: Self = settings
            .try_deserialize()
            .map_err(|e| AppError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document without environment overrides.
    pub fn from_toml(content: &str) -> AppResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Whether a push channel is configured.
    pub fn has_stream(&self) -> bool {
        !self.stream.url.trim().is_empty()
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.api.rate_limit_requests == 0 {
            return Err(AppError::Config(
                "api.rate_limit_requests must be greater than 0".to_string(),
            ));
        }
        if self.api.rate_limit_window_ms == 0 {
            return Err(AppError::Config(
                "api.rate_limit_window_ms must be greater than 0".to_string(),
            ));
        }
        if !self.accounts.is_empty() && self.api.base_url.trim().is_empty() {
            return Err(AppError::Config(
                "api.base_url is required when accounts are configured".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for id in &self.accounts {
            if id.trim().is_empty() {
                return Err(AppError::Config("empty account id".to_string()));
            }
            if !seen.insert(id.as_str()) {
                return Err(AppError::Config(format!("duplicate account id: {id}")));
            }
        }
        Ok(())
    }
}
