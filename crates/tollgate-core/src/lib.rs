//! # Tollgate Core
//!
//! The domain layer of the rate limiter: quota types, the sliding-window
//! quota engine, the reservation reconciler and the token estimator.
//! Backend crates (Redis, HTTP) stay out of this crate; all mutable counter
//! state lives behind the [`ports::CounterStore`] trait.

pub mod domain;
pub mod engine;
pub mod error;
pub mod estimator;
pub mod ports;

pub use error::QuotaError;
