//! Ports - trait definitions for the infrastructure this crate depends on.

mod store;

pub use store::{CounterStore, SettleOutcome, StoreAdmit, StoreDecision, StoreError};
