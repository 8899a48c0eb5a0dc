//! Domain types: keys and their ceilings, quota dimensions, window geometry
//! and reservations.

mod dimension;
mod key;
mod reservation;
mod window;

pub use dimension::{Dimension, PerDimension};
pub use key::{ApiKey, KeyLimits, KeyRegistry};
pub use reservation::{Cost, ReservationId, ReservationRecord};
pub use window::WindowConfig;
