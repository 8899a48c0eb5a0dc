//! Application configuration loaded from environment variables.
//!
//! Missing variables fall back to defaults; present-but-invalid values are
//! startup errors (the process exits non-zero rather than serving with a
//! half-read configuration).

use std::str::FromStr;
use std::time::Duration;

use tollgate_core::domain::{KeyRegistry, WindowConfig};
use tollgate_core::engine::FailPolicy;
use tollgate_core::error::ConfigError;
use tollgate_infra::RedisStoreConfig;

/// Which counter store backs this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    /// Shared Redis: the distributed deployment.
    Redis,
    /// In-process memory: single-node development and tests only.
    Memory,
}

impl FromStr for StoreBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "redis" => Ok(StoreBackend::Redis),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(ConfigError::InvalidValue {
                name: "store backend",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Base URL of a real OpenAI-compatible upstream. Unset: the built-in
    /// mock answers instead.
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    /// Bound on the whole upstream call; on expiry the reservation is
    /// released and the client gets 504.
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct MockConfig {
    pub delay_min_ms: u64,
    pub delay_max_ms: u64,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub store_backend: StoreBackend,
    pub redis: RedisStoreConfig,
    pub window: WindowConfig,
    pub sweep_interval_secs: u32,
    pub sweep_enabled: bool,
    pub default_output_reserve: u64,
    pub fail_policy: FailPolicy,
    pub api_keys_file: Option<String>,
    pub upstream: UpstreamConfig,
    pub mock: MockConfig,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let window = WindowConfig::new(
            env_parse("SEGMENT_SECS", 1)?,
            env_parse("WINDOW_SECS", 60)?,
            env_parse("SWEEP_DEADLINE_SECS", 120)?,
        )?;

        let mock = MockConfig {
            delay_min_ms: env_parse("MOCK_DELAY_MIN_MS", 100)?,
            delay_max_ms: env_parse("MOCK_DELAY_MAX_MS", 500)?,
        };
        if mock.delay_min_ms > mock.delay_max_ms {
            return Err(ConfigError::InvalidValue {
                name: "MOCK_DELAY_MIN_MS",
                value: format!("{} exceeds MOCK_DELAY_MAX_MS", mock.delay_min_ms),
            });
        }

        Ok(Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env_parse("PORT", 8080)?,
            store_backend: env_parse("STORE_BACKEND", StoreBackend::Redis)?,
            redis: RedisStoreConfig::from_env(),
            window,
            sweep_interval_secs: env_parse("SWEEP_INTERVAL_SECS", 30)?,
            sweep_enabled: std::env::var("SWEEP_ENABLED")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true),
            default_output_reserve: env_parse("DEFAULT_MAX_TOKENS_RESERVE", 512)?,
            fail_policy: env_parse("FAIL_POLICY", FailPolicy::Closed)?,
            api_keys_file: std::env::var("API_KEYS_FILE").ok(),
            upstream: UpstreamConfig {
                base_url: std::env::var("UPSTREAM_BASE_URL").ok(),
                api_key: std::env::var("UPSTREAM_API_KEY").ok(),
                timeout: Duration::from_secs(env_parse("UPSTREAM_TIMEOUT_SECS", 120)?),
            },
            mock,
        })
    }

    /// Load the per-key limits table. Without `API_KEYS_FILE` the built-in
    /// development keys apply.
    pub fn load_keys(&self) -> Result<KeyRegistry, ConfigError> {
        let Some(path) = &self.api_keys_file else {
            tracing::warn!("API_KEYS_FILE not set, using built-in development keys");
            return Ok(KeyRegistry::development());
        };

        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::InvalidValue {
            name: "API_KEYS_FILE",
            value: format!("{path}: {e}"),
        })?;
        let registry: KeyRegistry =
            serde_json::from_str(&raw).map_err(|e| ConfigError::InvalidValue {
                name: "API_KEYS_FILE",
                value: format!("{path}: {e}"),
            })?;
        if registry.is_empty() {
            return Err(ConfigError::InvalidValue {
                name: "API_KEYS_FILE",
                value: format!("{path}: no keys defined"),
            });
        }
        tracing::info!(keys = registry.len(), path = %path, "Loaded API key registry");
        Ok(registry)
    }
}

fn env_parse<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value: raw }),
        Err(_) => Ok(default),
    }
}
