//! Storage backends.
//!
//! - [`memory::MemoryStorage`]: bounded in-process LRU store.
//! - [`remote::RemoteStorage`]: a networked key/value store with native per-key expiry, accessed through the
//!   [`remote::KvStore`] trait. [`redis::RedisKv`] implements it for Redis when the `redis` feature is on.

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;
pub mod remote;

/// Name under which the process-wide default storage is registered.
pub const DEFAULT_STORAGE: &str = "default";

pub use memory::MemoryStorage;
pub use remote::KvStore;
pub use remote::RemoteStorage;
