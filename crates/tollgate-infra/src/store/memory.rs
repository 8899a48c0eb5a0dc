//! In-process counter store.
//!
//! Runs the same segmented-window algorithm as the Redis scripts, with one
//! mutex standing in for the script-serialisation point. Limits are
//! per-process, not distributed; use it for single-node development and for
//! tests, where the injected `now` doubles as a virtual clock.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use tollgate_core::domain::{
    Dimension, PerDimension, ReservationId, ReservationRecord, WindowConfig,
};
use tollgate_core::ports::{
    CounterStore, SettleOutcome, StoreAdmit, StoreDecision, StoreError,
};

type SegmentKey = (String, Dimension, i64);

#[derive(Default)]
struct Inner {
    segments: HashMap<SegmentKey, u64>,
    reservations: HashMap<ReservationId, ReservationRecord>,
    late_settles: u64,
}

pub struct MemoryCounterStore {
    window: WindowConfig,
    inner: Mutex<Inner>,
}

impl MemoryCounterStore {
    pub fn new(window: WindowConfig) -> Self {
        Self {
            window,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Current sliding-window sums for one key. Diagnostic surface, also
    /// used by the invariant tests.
    pub fn window_usage(&self, key: &str, now_secs: i64) -> PerDimension<u64> {
        let inner = self.inner.lock().expect("store mutex");
        let bucket = self.window.bucket(now_secs);
        let mut usage = PerDimension::default();
        for dim in Dimension::ALL {
            usage.set(dim, window_sum(&inner, &self.window, key, dim, bucket));
        }
        usage
    }

    /// Number of reservations still OPEN.
    pub fn open_reservations(&self) -> usize {
        self.inner.lock().expect("store mutex").reservations.len()
    }

    /// How many settles had to fall back to the oldest live bucket.
    pub fn late_settles(&self) -> u64 {
        self.inner.lock().expect("store mutex").late_settles
    }

    fn settle(
        &self,
        id: &ReservationId,
        usage: Option<(u64, u64)>,
        now_secs: i64,
    ) -> SettleOutcome {
        let mut inner = self.inner.lock().expect("store mutex");
        let Some(record) = inner.reservations.remove(id) else {
            return SettleOutcome::AlreadySettled;
        };
        settle_record(&mut inner, &self.window, &record, usage, now_secs);
        SettleOutcome::Applied
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn admit(&self, request: StoreAdmit) -> Result<StoreDecision, StoreError> {
        let mut inner = self.inner.lock().expect("store mutex");
        let bucket = self.window.bucket(request.now_secs);
        prune(&mut inner, &self.window, bucket, request.now_secs);

        let key = request.key.as_str();
        let add = request.cost.additions();
        let mut used = PerDimension::default();
        for dim in Dimension::ALL {
            used.set(dim, window_sum(&inner, &self.window, key, dim, bucket));
        }

        let mut retry_after_secs = 0;
        for dim in Dimension::ALL {
            let ceiling = request.limits.ceiling(dim);
            if used.get(dim) + add.get(dim) > ceiling {
                let needed = used.get(dim) + add.get(dim) - ceiling;
                let wait = recovery_secs(
                    &inner,
                    &self.window,
                    key,
                    dim,
                    needed,
                    bucket,
                    request.now_secs,
                );
                retry_after_secs = retry_after_secs.max(wait);
            }
        }

        if retry_after_secs > 0 {
            return Ok(StoreDecision {
                admitted: false,
                used,
                retry_after_secs,
            });
        }

        for dim in Dimension::ALL {
            let amount = add.get(dim);
            if amount > 0 {
                *inner
                    .segments
                    .entry((key.to_string(), dim, bucket))
                    .or_insert(0) += amount;
            }
        }
        inner.reservations.insert(
            request.reservation,
            ReservationRecord {
                key: key.to_string(),
                bucket,
                admitted_at: request.now_secs,
                in_est: request.cost.input_tokens,
                out_reserve: request.cost.output_tokens,
            },
        );

        Ok(StoreDecision {
            admitted: true,
            used,
            retry_after_secs: 0,
        })
    }

    async fn commit(
        &self,
        id: &ReservationId,
        in_actual: u64,
        out_actual: u64,
        now_secs: i64,
    ) -> Result<SettleOutcome, StoreError> {
        Ok(self.settle(id, Some((in_actual, out_actual)), now_secs))
    }

    async fn release(
        &self,
        id: &ReservationId,
        now_secs: i64,
    ) -> Result<SettleOutcome, StoreError> {
        Ok(self.settle(id, None, now_secs))
    }

    async fn sweep(
        &self,
        cutoff_secs: i64,
        now_secs: i64,
    ) -> Result<Vec<ReservationId>, StoreError> {
        let mut inner = self.inner.lock().expect("store mutex");
        let stale: Vec<ReservationId> = inner
            .reservations
            .iter()
            .filter(|(_, record)| record.admitted_at <= cutoff_secs)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            if let Some(record) = inner.reservations.remove(id) {
                settle_record(&mut inner, &self.window, &record, None, now_secs);
            }
        }
        Ok(stale)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

fn window_sum(
    inner: &Inner,
    window: &WindowConfig,
    key: &str,
    dim: Dimension,
    now_bucket: i64,
) -> u64 {
    (window.oldest_live_bucket(now_bucket)..=now_bucket)
        .filter_map(|b| inner.segments.get(&(key.to_string(), dim, b)))
        .sum()
}

/// Seconds until enough old segments expire for `needed` units of headroom,
/// capped at one full window.
fn recovery_secs(
    inner: &Inner,
    window: &WindowConfig,
    key: &str,
    dim: Dimension,
    needed: u64,
    now_bucket: i64,
    now_secs: i64,
) -> u64 {
    let seg = i64::from(window.segment_secs());
    let mut freed = 0;
    for bucket in window.oldest_live_bucket(now_bucket)..=now_bucket {
        if let Some(count) = inner.segments.get(&(key.to_string(), dim, bucket)) {
            freed += *count;
            if freed >= needed {
                let wait = (bucket + window.segments()) * seg - now_secs;
                return wait.max(1) as u64;
            }
        }
    }
    u64::from(window.window_secs())
}

/// Apply a settle to the counters. `usage = Some((in, out))` commits,
/// `None` releases the full triple. Mirrors the store-side settle program.
fn settle_record(
    inner: &mut Inner,
    window: &WindowConfig,
    record: &ReservationRecord,
    usage: Option<(u64, u64)>,
    now_secs: i64,
) {
    let now_bucket = window.bucket(now_secs);
    let oldest = window.oldest_live_bucket(now_bucket);
    let mut target = record.bucket;
    if target < oldest {
        target = oldest;
        inner.late_settles += 1;
        tracing::warn!(
            key = %record.key,
            origin_bucket = record.bucket,
            "settle past the origin bucket's lifetime, applying to oldest live bucket"
        );
    }

    let deltas: [(Dimension, i64); 3] = match usage {
        Some((in_actual, out_actual)) => [
            (Dimension::InputTokens, in_actual as i64 - record.in_est as i64),
            (
                Dimension::OutputTokens,
                out_actual as i64 - record.out_reserve as i64,
            ),
            (Dimension::Requests, 0),
        ],
        None => [
            (Dimension::InputTokens, -(record.in_est as i64)),
            (Dimension::OutputTokens, -(record.out_reserve as i64)),
            (Dimension::Requests, -1),
        ],
    };

    for (dim, delta) in deltas {
        if delta != 0 {
            let entry = inner
                .segments
                .entry((record.key.clone(), dim, target))
                .or_insert(0);
            // Segments never go negative, even when a release races a large
            // commit near the window edge.
            *entry = entry.saturating_add_signed(delta);
        }
    }
}

/// Evaporate state the TTLs would have expired: segments older than 2W,
/// reservation records older than 2*T_sweep.
fn prune(inner: &mut Inner, window: &WindowConfig, now_bucket: i64, now_secs: i64) {
    let expired_before = now_bucket - 2 * window.segments() + 1;
    inner.segments.retain(|(_, _, bucket), _| *bucket >= expired_before);

    let record_deadline = now_secs - window.reservation_ttl_secs() as i64;
    inner
        .reservations
        .retain(|_, record| record.admitted_at > record_deadline);
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use tollgate_core::domain::{ApiKey, Cost, KeyLimits};

    fn limits() -> KeyLimits {
        KeyLimits {
            input_tpm: 100,
            output_tpm: 200,
            rpm: 3,
        }
    }

    fn admit_request(in_est: u64, out_reserve: u64, now_secs: i64) -> StoreAdmit {
        StoreAdmit {
            key: ApiKey::new("k1"),
            limits: limits(),
            cost: Cost {
                input_tokens: in_est,
                output_tokens: out_reserve,
            },
            reservation: ReservationId::generate(),
            now_secs,
        }
    }

    fn store() -> MemoryCounterStore {
        MemoryCounterStore::new(WindowConfig::default())
    }

    #[test]
    fn admits_exactly_rpm_requests_per_window() {
        let store = store();
        for _ in 0..3 {
            let decision = block_on(store.admit(admit_request(1, 10, 0))).unwrap();
            assert!(decision.admitted);
        }

        let fourth = block_on(store.admit(admit_request(1, 10, 0))).unwrap();
        assert!(!fourth.admitted);
        assert_eq!(fourth.used.requests, 3);
        // Everything was admitted in the bucket at t=0; it leaves the window
        // one full window later.
        assert_eq!(fourth.retry_after_secs, 60);
    }

    #[test]
    fn rejected_admission_touches_no_counters() {
        let store = store();
        block_on(store.admit(admit_request(1, 200, 0))).unwrap();
        let usage_before = store.window_usage("k1", 0);

        let rejected = block_on(store.admit(admit_request(1, 50, 0))).unwrap();
        assert!(!rejected.admitted);
        assert_eq!(store.window_usage("k1", 0), usage_before);
        assert_eq!(store.open_reservations(), 1);
    }

    #[test]
    fn commit_replaces_reserve_with_actual_usage() {
        let store = store();
        let request = admit_request(10, 20, 0);
        let id = request.reservation;
        block_on(store.admit(request)).unwrap();

        assert_eq!(
            block_on(store.commit(&id, 10, 5, 1)).unwrap(),
            SettleOutcome::Applied
        );

        let usage = store.window_usage("k1", 1);
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.output_tokens, 5);
        assert_eq!(usage.requests, 1);
        assert_eq!(store.open_reservations(), 0);
    }

    #[test]
    fn release_returns_the_full_triple() {
        let store = store();
        let request = admit_request(10, 20, 0);
        let id = request.reservation;
        block_on(store.admit(request)).unwrap();

        block_on(store.release(&id, 1)).unwrap();

        let usage = store.window_usage("k1", 1);
        assert_eq!(usage, PerDimension::default());
    }

    #[test]
    fn settles_are_idempotent() {
        let store = store();
        let request = admit_request(10, 20, 0);
        let id = request.reservation;
        block_on(store.admit(request)).unwrap();

        assert_eq!(
            block_on(store.commit(&id, 10, 5, 1)).unwrap(),
            SettleOutcome::Applied
        );
        let usage = store.window_usage("k1", 1);

        assert_eq!(
            block_on(store.commit(&id, 10, 5, 1)).unwrap(),
            SettleOutcome::AlreadySettled
        );
        assert_eq!(
            block_on(store.release(&id, 1)).unwrap(),
            SettleOutcome::AlreadySettled
        );
        assert_eq!(store.window_usage("k1", 1), usage);
    }

    #[test]
    fn counters_floor_at_zero_under_shrinking_commits() {
        let store = store();
        let request = admit_request(10, 20, 0);
        let id = request.reservation;
        block_on(store.admit(request)).unwrap();

        // Commit less than was reserved on both token dimensions.
        block_on(store.commit(&id, 0, 0, 1)).unwrap();

        let usage = store.window_usage("k1", 1);
        assert_eq!(usage.input_tokens, 0);
        assert_eq!(usage.output_tokens, 0);
        assert_eq!(usage.requests, 1);
    }

    #[test]
    fn late_commit_falls_back_to_oldest_live_bucket() {
        let store = store();
        let request = admit_request(10, 20, 0);
        let id = request.reservation;
        block_on(store.admit(request)).unwrap();

        // Settle 90 seconds later: the origin bucket left the window.
        block_on(store.commit(&id, 10, 5, 90)).unwrap();

        assert_eq!(store.late_settles(), 1);
        let usage = store.window_usage("k1", 90);
        // The reserve delta landed in a live bucket: output went from 20 to 5.
        assert_eq!(usage.output_tokens, 5);
    }

    #[test]
    fn sweep_releases_only_stale_reservations() {
        let store = store();
        let stale = admit_request(10, 20, 0);
        let stale_id = stale.reservation;
        block_on(store.admit(stale)).unwrap();

        let fresh = admit_request(1, 10, 100);
        let fresh_id = fresh.reservation;
        block_on(store.admit(fresh)).unwrap();

        // Sweep with the deadline at t=120: only the t=0 admission is past it.
        let released = block_on(store.sweep(0, 120)).unwrap();
        assert_eq!(released, vec![stale_id]);
        assert_eq!(store.open_reservations(), 1);

        // And the fresh one survives with its counters intact.
        assert_ne!(
            block_on(store.release(&fresh_id, 120)).unwrap(),
            SettleOutcome::AlreadySettled
        );
    }

    #[test]
    fn window_slides_as_time_advances() {
        let store = store();
        block_on(store.admit(admit_request(1, 10, 0))).unwrap();
        block_on(store.admit(admit_request(1, 10, 30))).unwrap();

        assert_eq!(store.window_usage("k1", 30).requests, 2);
        // t=65: the t=0 admission left the window, the t=30 one remains.
        assert_eq!(store.window_usage("k1", 65).requests, 1);
        // t=95: both gone.
        assert_eq!(store.window_usage("k1", 95).requests, 0);
    }

    #[test]
    fn retry_after_is_within_window_bounds() {
        let store = store();
        for second in [0, 20, 40] {
            let decision = block_on(store.admit(admit_request(1, 10, second))).unwrap();
            assert!(decision.admitted);
        }

        let rejected = block_on(store.admit(admit_request(1, 10, 41))).unwrap();
        assert!(!rejected.admitted);
        // One request must expire; the oldest was at t=0, expiring at t=60.
        assert_eq!(rejected.retry_after_secs, 19);
        assert!(rejected.retry_after_secs >= 1);
        assert!(rejected.retry_after_secs <= 60);
    }
}
