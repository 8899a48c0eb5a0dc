//! Coordination-store port.
//!
//! The store owns every mutable counter. Each operation below is atomic with
//! respect to the others for the same key: the Redis adapter runs a
//! server-side script, the in-memory adapter holds one lock. Callers inject
//! `now` so the adapters never read the wall clock themselves.

use async_trait::async_trait;

use crate::domain::{ApiKey, Cost, KeyLimits, PerDimension, ReservationId};

/// One admission attempt, executed as a single indivisible unit:
/// sum the live window per dimension, compare against the ceilings, and on
/// success apply the additions and persist the reservation record.
#[derive(Debug, Clone)]
pub struct StoreAdmit {
    pub key: ApiKey,
    pub limits: KeyLimits,
    pub cost: Cost,
    pub reservation: ReservationId,
    pub now_secs: i64,
}

/// The store's answer to [`StoreAdmit`].
#[derive(Debug, Clone, Copy)]
pub struct StoreDecision {
    pub admitted: bool,
    /// Sliding-window sums per dimension, sampled before this request's
    /// additions were applied.
    pub used: PerDimension<u64>,
    /// On rejection: seconds until the tightest violated dimension drops
    /// below its ceiling, in `[1, W]`. Zero on admission.
    pub retry_after_secs: u64,
}

/// What a commit/release actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleOutcome {
    /// Counters adjusted and the record dropped.
    Applied,
    /// The record was already gone (prior settle, sweep, or expiry); nothing
    /// changed. Settles are idempotent.
    AlreadySettled,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("operation failed: {0}")]
    Operation(String),

    #[error("operation timed out after {0} ms")]
    Timeout(u64),

    #[error("corrupt record at {key}: {detail}")]
    Corrupt { key: String, detail: String },
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Check-and-reserve. Atomic per key.
    async fn admit(&self, request: StoreAdmit) -> Result<StoreDecision, StoreError>;

    /// Replace the reservation's provisional tokens with actual usage:
    /// apply `(in_actual - in_est, out_actual - out_reserve)` to the bucket
    /// of origin (segments floor at zero), drop the record.
    async fn commit(
        &self,
        id: &ReservationId,
        in_actual: u64,
        out_actual: u64,
        now_secs: i64,
    ) -> Result<SettleOutcome, StoreError>;

    /// Return the full provisional triple `(in_est, out_reserve, 1)` to the
    /// bucket of origin, drop the record.
    async fn release(&self, id: &ReservationId, now_secs: i64)
        -> Result<SettleOutcome, StoreError>;

    /// Release every reservation admitted at or before `cutoff_secs`.
    /// Returns the ids that were actually released by this call.
    async fn sweep(
        &self,
        cutoff_secs: i64,
        now_secs: i64,
    ) -> Result<Vec<ReservationId>, StoreError>;

    /// Cheap liveness probe for health reporting.
    async fn ping(&self) -> Result<(), StoreError>;
}
