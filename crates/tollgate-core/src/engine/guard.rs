//! Scoped reconciliation of an admitted reservation.
//!
//! Every code path that obtained a reservation must end in exactly one
//! commit or release, including early returns, upstream timeouts, client
//! disconnects (future cancellation) and panics. The guard encodes that:
//! settling consumes it; dropping it armed releases the reservation on the
//! runtime.

use std::sync::Arc;

use crate::domain::ReservationId;
use crate::error::QuotaError;

use super::QuotaEngine;

#[must_use = "an admission guard must be committed or released"]
pub struct AdmissionGuard {
    engine: Arc<QuotaEngine>,
    reservation: Option<ReservationId>,
}

impl AdmissionGuard {
    /// Wrap the reservation returned by an admission. `None` (fail-open
    /// admissions) produces an inert guard whose settles are no-ops.
    pub fn new(engine: Arc<QuotaEngine>, reservation: Option<ReservationId>) -> Self {
        Self {
            engine,
            reservation,
        }
    }

    pub fn reservation(&self) -> Option<ReservationId> {
        self.reservation
    }

    /// Reconcile with true usage.
    pub async fn commit(
        mut self,
        prompt_tokens: u64,
        completion_tokens: u64,
    ) -> Result<(), QuotaError> {
        match self.reservation.take() {
            Some(id) => {
                self.engine
                    .commit(id, prompt_tokens, completion_tokens)
                    .await
            }
            None => Ok(()),
        }
    }

    /// Return the provisional additions (upstream failure, timeout).
    pub async fn release(mut self) -> Result<(), QuotaError> {
        match self.reservation.take() {
            Some(id) => self.engine.release(id).await,
            None => Ok(()),
        }
    }
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        let Some(id) = self.reservation.take() else {
            return;
        };
        tracing::warn!(reservation = %id, "admission guard dropped without settling, releasing");

        let engine = Arc::clone(&self.engine);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(error) = engine.release(id).await {
                        tracing::error!(reservation = %id, %error, "drop-path release failed, sweep will reclaim it");
                    }
                });
            }
            // No runtime left (process teardown): the sweep deadline bounds
            // the leak.
            Err(_) => {
                tracing::error!(reservation = %id, "no runtime for drop-path release, sweep will reclaim it");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{PerDimension, WindowConfig};
    use crate::engine::FailPolicy;
    use crate::ports::{
        CounterStore, SettleOutcome, StoreAdmit, StoreDecision, StoreError,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingStore {
        commits: AtomicUsize,
        releases: AtomicUsize,
    }

    #[async_trait]
    impl CounterStore for CountingStore {
        async fn admit(&self, _request: StoreAdmit) -> Result<StoreDecision, StoreError> {
            Ok(StoreDecision {
                admitted: true,
                used: PerDimension::default(),
                retry_after_secs: 0,
            })
        }

        async fn commit(
            &self,
            _id: &ReservationId,
            _in_actual: u64,
            _out_actual: u64,
            _now_secs: i64,
        ) -> Result<SettleOutcome, StoreError> {
            self.commits.fetch_add(1, Ordering::SeqCst);
            Ok(SettleOutcome::Applied)
        }

        async fn release(
            &self,
            _id: &ReservationId,
            _now_secs: i64,
        ) -> Result<SettleOutcome, StoreError> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            Ok(SettleOutcome::Applied)
        }

        async fn sweep(
            &self,
            _cutoff_secs: i64,
            _now_secs: i64,
        ) -> Result<Vec<ReservationId>, StoreError> {
            Ok(Vec::new())
        }

        async fn ping(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn engine_with(store: Arc<CountingStore>) -> Arc<QuotaEngine> {
        Arc::new(QuotaEngine::new(
            store,
            WindowConfig::default(),
            FailPolicy::Closed,
            50,
        ))
    }

    #[tokio::test]
    async fn commit_settles_once() {
        let store = Arc::new(CountingStore::default());
        let engine = engine_with(store.clone());

        let guard = AdmissionGuard::new(engine, Some(ReservationId::generate()));
        guard.commit(10, 5).await.unwrap();

        assert_eq!(store.commits.load(Ordering::SeqCst), 1);
        assert_eq!(store.releases.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn drop_without_settle_releases() {
        let store = Arc::new(CountingStore::default());
        let engine = engine_with(store.clone());

        drop(AdmissionGuard::new(engine, Some(ReservationId::generate())));

        // The release runs on a spawned task.
        for _ in 0..20 {
            if store.releases.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(store.releases.load(Ordering::SeqCst), 1);
        assert_eq!(store.commits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn inert_guard_settles_nothing() {
        let store = Arc::new(CountingStore::default());
        let engine = engine_with(store.clone());

        let guard = AdmissionGuard::new(engine.clone(), None);
        guard.commit(10, 5).await.unwrap();
        drop(AdmissionGuard::new(engine, None));

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(store.commits.load(Ordering::SeqCst), 0);
        assert_eq!(store.releases.load(Ordering::SeqCst), 0);
    }
}
