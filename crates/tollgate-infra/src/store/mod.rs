//! Counter-store implementations.

mod memory;
mod redis;

pub use memory::MemoryCounterStore;
pub use self::redis::{RedisCounterStore, RedisStoreConfig};
