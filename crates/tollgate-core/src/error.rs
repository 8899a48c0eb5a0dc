//! Domain-level error types.

use thiserror::Error;

use crate::ports::StoreError;

/// Failures the quota engine can surface to callers.
///
/// A rejected admission is NOT an error; it is the `Rejected` variant of
/// [`crate::engine::Decision`]. These variants cover the unexpected paths
/// only.
#[derive(Debug, Error)]
pub enum QuotaError {
    /// The coordination store did not answer (after the adapter's bounded
    /// retries). Under fail-closed policy the caller answers 503.
    #[error("coordination store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),

    /// Internal inconsistency, e.g. a corrupt reservation record. Always
    /// logged with the offending id before it reaches the caller.
    #[error("invariant violation: {0}")]
    Invariant(String),
}

/// Rejected configuration values, detected at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("segment size must be non-zero")]
    ZeroSegment,

    #[error("window of {window_secs}s is not divisible by segment size {segment_secs}s")]
    UnevenSegments { window_secs: u32, segment_secs: u32 },

    #[error("sweep deadline must be at least the window ({window_secs}s), got {sweep_secs}s")]
    SweepTooShort { window_secs: u32, sweep_secs: u32 },

    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}
