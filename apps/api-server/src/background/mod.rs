//! Background jobs.

mod sweep;

pub use sweep::{ReservationSweeper, SweepConfig};
