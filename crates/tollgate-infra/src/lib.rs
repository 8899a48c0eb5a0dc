//! # Tollgate Infrastructure
//!
//! Concrete implementations of the `tollgate-core` ports: the Redis
//! coordination store (atomic server-side scripts) and an in-process memory
//! store for single-node development and deterministic tests.

pub mod store;

pub use store::{MemoryCounterStore, RedisCounterStore, RedisStoreConfig};
