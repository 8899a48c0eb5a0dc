//! The quota engine: atomic three-dimensional admission against the shared
//! counter store, plus the reconciliation half (commit / release / sweep).
//!
//! The engine keeps no mutable state in-process. Atomicity of the
//! check-and-reserve lives in the store adapter; this layer builds the
//! additions, interprets the store's answer, applies the failure policy and
//! produces the outward-facing headers.

mod guard;
mod headers;

pub use guard::AdmissionGuard;
pub use headers::QuotaHeaders;

use std::str::FromStr;
use std::sync::Arc;

use crate::domain::{ApiKey, Cost, KeyLimits, PerDimension, ReservationId, WindowConfig};
use crate::error::{ConfigError, QuotaError};
use crate::ports::{CounterStore, SettleOutcome, StoreAdmit, StoreError};

/// What to do when the coordination store does not answer during admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailPolicy {
    /// Reject the request (the caller answers 503 with a short retry hint).
    #[default]
    Closed,
    /// Admit without accounting. Throughput over accuracy.
    Open,
}

impl FromStr for FailPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "closed" => Ok(FailPolicy::Closed),
            "open" => Ok(FailPolicy::Open),
            other => Err(ConfigError::InvalidValue {
                name: "fail policy",
                value: other.to_string(),
            }),
        }
    }
}

/// Outcome of one admission attempt.
#[derive(Debug, Clone)]
pub enum Decision {
    Admitted {
        /// `None` only on the fail-open path: nothing was reserved, so there
        /// is nothing to reconcile.
        reservation: Option<ReservationId>,
        headers: QuotaHeaders,
    },
    Rejected {
        headers: QuotaHeaders,
        /// Seconds until the tightest violated dimension recovers, in `[1, W]`.
        retry_after_secs: u64,
    },
}

pub struct QuotaEngine {
    store: Arc<dyn CounterStore>,
    window: WindowConfig,
    fail_policy: FailPolicy,
    default_output_reserve: u64,
}

impl QuotaEngine {
    pub fn new(
        store: Arc<dyn CounterStore>,
        window: WindowConfig,
        fail_policy: FailPolicy,
        default_output_reserve: u64,
    ) -> Self {
        Self {
            store,
            window,
            fail_policy,
            default_output_reserve,
        }
    }

    pub fn window(&self) -> WindowConfig {
        self.window
    }

    /// Atomic check-and-reserve for `(prompt_estimate, out_reserve, 1)`,
    /// where `out_reserve` is the declared `max_tokens` or the configured
    /// default.
    pub async fn admit(
        &self,
        key: &ApiKey,
        limits: &KeyLimits,
        prompt_estimate: u64,
        max_tokens: Option<u64>,
    ) -> Result<Decision, QuotaError> {
        self.admit_at(key, limits, prompt_estimate, max_tokens, now_secs())
            .await
    }

    /// [`Self::admit`] with an explicit clock, for deterministic tests.
    pub async fn admit_at(
        &self,
        key: &ApiKey,
        limits: &KeyLimits,
        prompt_estimate: u64,
        max_tokens: Option<u64>,
        now_secs: i64,
    ) -> Result<Decision, QuotaError> {
        let cost = Cost {
            input_tokens: prompt_estimate,
            output_tokens: max_tokens.unwrap_or(self.default_output_reserve),
        };
        let reservation = ReservationId::generate();
        let request = StoreAdmit {
            key: key.clone(),
            limits: *limits,
            cost,
            reservation,
            now_secs,
        };

        match self.store.admit(request).await {
            Ok(decision) if decision.admitted => Ok(Decision::Admitted {
                reservation: Some(reservation),
                headers: QuotaHeaders::admitted(limits, decision.used, cost.additions()),
            }),
            Ok(decision) => Ok(Decision::Rejected {
                headers: QuotaHeaders::rejected(limits, decision.used),
                retry_after_secs: decision
                    .retry_after_secs
                    .clamp(1, u64::from(self.window.window_secs())),
            }),
            Err(error) => match self.fail_policy {
                FailPolicy::Closed => Err(QuotaError::StoreUnavailable(error)),
                FailPolicy::Open => {
                    tracing::warn!(key = %key, %error, "store unavailable, admitting without accounting");
                    Ok(Decision::Admitted {
                        reservation: None,
                        headers: QuotaHeaders::admitted(
                            limits,
                            PerDimension::default(),
                            cost.additions(),
                        ),
                    })
                }
            },
        }
    }

    /// Reconcile a reservation with true usage. Idempotent: settling an
    /// already-terminal reservation is a no-op.
    pub async fn commit(
        &self,
        id: ReservationId,
        prompt_tokens: u64,
        completion_tokens: u64,
    ) -> Result<(), QuotaError> {
        self.commit_at(id, prompt_tokens, completion_tokens, now_secs())
            .await
    }

    pub async fn commit_at(
        &self,
        id: ReservationId,
        prompt_tokens: u64,
        completion_tokens: u64,
        now_secs: i64,
    ) -> Result<(), QuotaError> {
        let outcome = self
            .store
            .commit(&id, prompt_tokens, completion_tokens, now_secs)
            .await;
        self.settled(id, "commit", outcome)
    }

    /// Return the full provisional triple. Idempotent.
    pub async fn release(&self, id: ReservationId) -> Result<(), QuotaError> {
        self.release_at(id, now_secs()).await
    }

    pub async fn release_at(&self, id: ReservationId, now_secs: i64) -> Result<(), QuotaError> {
        let outcome = self.store.release(&id, now_secs).await;
        self.settled(id, "release", outcome)
    }

    fn settled(
        &self,
        id: ReservationId,
        op: &'static str,
        outcome: Result<SettleOutcome, StoreError>,
    ) -> Result<(), QuotaError> {
        match outcome {
            Ok(SettleOutcome::Applied) => Ok(()),
            Ok(SettleOutcome::AlreadySettled) => {
                tracing::debug!(reservation = %id, op, "reservation already settled, no-op");
                Ok(())
            }
            Err(error @ StoreError::Corrupt { .. }) => {
                tracing::error!(reservation = %id, op, %error, "corrupt reservation record");
                Err(QuotaError::Invariant(error.to_string()))
            }
            Err(error) => Err(QuotaError::StoreUnavailable(error)),
        }
    }

    /// Release every reservation that stayed OPEN past the sweep deadline.
    /// Returns how many were reclaimed.
    pub async fn sweep(&self) -> Result<u64, QuotaError> {
        self.sweep_at(now_secs()).await
    }

    pub async fn sweep_at(&self, now_secs: i64) -> Result<u64, QuotaError> {
        let cutoff = now_secs - i64::from(self.window.sweep_deadline_secs());
        let released = self
            .store
            .sweep(cutoff, now_secs)
            .await
            .map_err(QuotaError::StoreUnavailable)?;
        for id in &released {
            tracing::warn!(reservation = %id, "reservation passed the sweep deadline without settling, released");
        }
        Ok(released.len() as u64)
    }
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::StoreDecision;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Store stub returning canned decisions and counting settle calls.
    struct StubStore {
        decision: Result<StoreDecision, ()>,
        settle: Result<SettleOutcome, ()>,
        releases: AtomicUsize,
    }

    impl StubStore {
        fn admitting(used: PerDimension<u64>) -> Self {
            Self {
                decision: Ok(StoreDecision {
                    admitted: true,
                    used,
                    retry_after_secs: 0,
                }),
                settle: Ok(SettleOutcome::Applied),
                releases: AtomicUsize::new(0),
            }
        }

        fn rejecting(used: PerDimension<u64>, retry_after_secs: u64) -> Self {
            Self {
                decision: Ok(StoreDecision {
                    admitted: false,
                    used,
                    retry_after_secs,
                }),
                settle: Ok(SettleOutcome::Applied),
                releases: AtomicUsize::new(0),
            }
        }

        fn unavailable() -> Self {
            Self {
                decision: Err(()),
                settle: Err(()),
                releases: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl CounterStore for StubStore {
        async fn admit(&self, _request: StoreAdmit) -> Result<StoreDecision, StoreError> {
            self.decision
                .map_err(|()| StoreError::Connection("down".into()))
        }

        async fn commit(
            &self,
            _id: &ReservationId,
            _in_actual: u64,
            _out_actual: u64,
            _now_secs: i64,
        ) -> Result<SettleOutcome, StoreError> {
            self.settle.map_err(|()| StoreError::Timeout(100))
        }

        async fn release(
            &self,
            _id: &ReservationId,
            _now_secs: i64,
        ) -> Result<SettleOutcome, StoreError> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            self.settle.map_err(|()| StoreError::Timeout(100))
        }

        async fn sweep(
            &self,
            _cutoff_secs: i64,
            _now_secs: i64,
        ) -> Result<Vec<ReservationId>, StoreError> {
            Ok(vec![ReservationId::generate()])
        }

        async fn ping(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn limits() -> KeyLimits {
        KeyLimits {
            input_tpm: 100,
            output_tpm: 200,
            rpm: 3,
        }
    }

    fn engine(store: StubStore, policy: FailPolicy) -> QuotaEngine {
        QuotaEngine::new(Arc::new(store), WindowConfig::default(), policy, 50)
    }

    #[tokio::test]
    async fn admit_produces_reservation_and_headers() {
        let engine = engine(StubStore::admitting(PerDimension::default()), FailPolicy::Closed);
        let decision = engine
            .admit_at(&ApiKey::new("k1"), &limits(), 10, Some(20), 0)
            .await
            .unwrap();

        match decision {
            Decision::Admitted {
                reservation,
                headers,
            } => {
                assert!(reservation.is_some());
                assert_eq!(headers.remaining_requests, 2);
                assert_eq!(headers.remaining_tokens, 180);
            }
            Decision::Rejected { .. } => panic!("expected admission"),
        }
    }

    #[tokio::test]
    async fn default_reserve_applies_when_max_tokens_absent() {
        let engine = engine(StubStore::admitting(PerDimension::default()), FailPolicy::Closed);
        let decision = engine
            .admit_at(&ApiKey::new("k1"), &limits(), 10, None, 0)
            .await
            .unwrap();

        match decision {
            // out_reserve = 50 (default), ratio 150/200 < 80/100.
            Decision::Admitted { headers, .. } => assert_eq!(headers.remaining_tokens, 150),
            Decision::Rejected { .. } => panic!("expected admission"),
        }
    }

    #[tokio::test]
    async fn rejection_clamps_retry_after_into_window() {
        let used = PerDimension {
            input_tokens: 0,
            output_tokens: 200,
            requests: 1,
        };
        let engine = engine(StubStore::rejecting(used, 0), FailPolicy::Closed);
        let decision = engine
            .admit_at(&ApiKey::new("k1"), &limits(), 1, Some(10), 0)
            .await
            .unwrap();

        match decision {
            Decision::Rejected {
                retry_after_secs, ..
            } => assert_eq!(retry_after_secs, 1),
            Decision::Admitted { .. } => panic!("expected rejection"),
        }

        let engine = engine_with_retry(900);
        match engine
            .admit_at(&ApiKey::new("k1"), &limits(), 1, Some(10), 0)
            .await
            .unwrap()
        {
            Decision::Rejected {
                retry_after_secs, ..
            } => assert_eq!(retry_after_secs, 60),
            Decision::Admitted { .. } => panic!("expected rejection"),
        }
    }

    fn engine_with_retry(retry: u64) -> QuotaEngine {
        let used = PerDimension {
            input_tokens: 0,
            output_tokens: 200,
            requests: 1,
        };
        engine(StubStore::rejecting(used, retry), FailPolicy::Closed)
    }

    #[tokio::test]
    async fn fail_closed_surfaces_store_outage() {
        let engine = engine(StubStore::unavailable(), FailPolicy::Closed);
        let result = engine
            .admit_at(&ApiKey::new("k1"), &limits(), 1, None, 0)
            .await;
        assert!(matches!(result, Err(QuotaError::StoreUnavailable(_))));
    }

    #[tokio::test]
    async fn fail_open_admits_without_reservation() {
        let engine = engine(StubStore::unavailable(), FailPolicy::Open);
        let decision = engine
            .admit_at(&ApiKey::new("k1"), &limits(), 1, None, 0)
            .await
            .unwrap();

        match decision {
            Decision::Admitted { reservation, .. } => assert!(reservation.is_none()),
            Decision::Rejected { .. } => panic!("fail-open must admit"),
        }
    }

    #[tokio::test]
    async fn fail_policy_parses() {
        assert_eq!(FailPolicy::from_str("closed").unwrap(), FailPolicy::Closed);
        assert_eq!(FailPolicy::from_str("OPEN").unwrap(), FailPolicy::Open);
        assert!(FailPolicy::from_str("maybe").is_err());
    }

    #[tokio::test]
    async fn sweep_counts_reclaimed_reservations() {
        let engine = engine(StubStore::admitting(PerDimension::default()), FailPolicy::Closed);
        assert_eq!(engine.sweep_at(1_000).await.unwrap(), 1);
    }
}
