//! Application state - shared across all handlers.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use tollgate_core::domain::KeyRegistry;
use tollgate_core::engine::QuotaEngine;
use tollgate_core::error::ConfigError;
use tollgate_core::estimator::TokenEstimator;
use tollgate_core::ports::{CounterStore, StoreError};
use tollgate_infra::{MemoryCounterStore, RedisCounterStore};

use crate::config::{AppConfig, StoreBackend};
use crate::upstream::{MockUpstream, OpenAiUpstream, Upstream};

/// Failures that abort startup (the process exits non-zero).
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("coordination store: {0}")]
    Store(#[from] StoreError),

    #[error("upstream client: {0}")]
    Upstream(#[from] crate::upstream::UpstreamError),
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<QuotaEngine>,
    pub estimator: TokenEstimator,
    pub keys: Arc<KeyRegistry>,
    pub store: Arc<dyn CounterStore>,
    pub upstream: Arc<dyn Upstream>,
    pub upstream_timeout: Duration,
}

impl AppState {
    /// Build the application state for the configured backends. Fails (and
    /// the process exits non-zero) when the store is unreachable.
    pub async fn new(config: &AppConfig) -> Result<Self, StartupError> {
        let keys = Arc::new(config.load_keys()?);
        let estimator = TokenEstimator::new();

        let store: Arc<dyn CounterStore> = match config.store_backend {
            StoreBackend::Redis => Arc::new(
                RedisCounterStore::new(config.redis.clone(), config.window).await?,
            ),
            StoreBackend::Memory => {
                tracing::warn!("memory store configured: limits are per-process, not distributed");
                Arc::new(MemoryCounterStore::new(config.window))
            }
        };

        let engine = Arc::new(QuotaEngine::new(
            store.clone(),
            config.window,
            config.fail_policy,
            config.default_output_reserve,
        ));

        let upstream: Arc<dyn Upstream> = match &config.upstream.base_url {
            Some(base_url) => {
                tracing::info!(url = %base_url, "Forwarding admitted requests upstream");
                Arc::new(OpenAiUpstream::new(
                    base_url.clone(),
                    config.upstream.api_key.clone(),
                    config.upstream.timeout,
                )?)
            }
            None => {
                tracing::info!("No upstream configured, the mock responder answers");
                Arc::new(MockUpstream::new(estimator, config.mock))
            }
        };

        tracing::info!("Application state initialized");

        Ok(Self {
            engine,
            estimator,
            keys,
            store,
            upstream,
            upstream_timeout: config.upstream.timeout,
        })
    }
}
