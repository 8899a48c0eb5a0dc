//! Reservations: the durable record that an admission happened but has not
//! yet been reconciled against true usage.
//!
//! A reservation is OPEN while its record exists in the store. Commit and
//! release delete the record inside the same atomic unit that adjusts the
//! counters, which makes the terminal transition exactly-once and repeated
//! settle calls no-ops.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Dimension, PerDimension};

/// Provisional token additions carried by one admission. The request count
/// addition is always 1 and is implicit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cost {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Cost {
    /// The full per-dimension additions `(in_est, out_reserve, 1)`.
    pub fn additions(&self) -> PerDimension<u64> {
        PerDimension {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            requests: 1,
        }
    }

    pub fn addition(&self, dim: Dimension) -> u64 {
        self.additions().get(dim)
    }
}

/// Unique handle for a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReservationId(Uuid);

impl ReservationId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl std::fmt::Display for ReservationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// The record persisted at `rl:res:{id}`. Field names are the wire format
/// read by the store-side settle program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationRecord {
    /// API key the counters belong to.
    pub key: String,
    /// Bucket of origin b₀; settle deltas are attributed here.
    pub bucket: i64,
    /// Admission instant t₀, unix seconds.
    pub admitted_at: i64,
    pub in_est: u64,
    pub out_reserve: u64,
}

impl ReservationRecord {
    pub fn cost(&self) -> Cost {
        Cost {
            input_tokens: self.in_est,
            output_tokens: self.out_reserve,
        }
    }
}
