//! Error types.
//!
//! Three families are kept apart:
//!
//! - [`ConfigError`] is raised synchronously while policies or options are registered and prevents the cache from
//!   being used with an invalid setup.
//! - [`StorageError`] is what a storage backend reports. It never reaches a caller of
//!   [`Cache::invoke()`](crate::Cache::invoke); the cache wraps it into a [`CacheError`], reports it, and falls
//!   through to direct computation.
//! - [`CacheError`] is the cache subsystem failure delivered to [`Observer::on_error()`](crate::traits::Observer).
//!
//! The wrapped computation's own error travels untouched as [`FieldError`].

use std::sync::Arc;

use thiserror::Error;

use crate::types::FieldIdentity;

/// Error of a wrapped field computation, shared by every coalesced waiter.
pub type FieldError = Arc<anyhow::Error>;

/// Outcome of a wrapped field call.
pub type FieldResult = Result<serde_json::Value, FieldError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field}: ttl must be a non-negative number of seconds, got {value}")]
    InvalidTtl { field: String, value: f64 },

    #[error("{field}: stale must be a non-negative number of seconds, got {value}")]
    InvalidStale { field: String, value: f64 },

    #[error("{0}: a custom key function cannot be combined with extend_key")]
    KeyConflict(FieldIdentity),

    #[error("{0}: a storage is configured but no ttl is set for the field and the default ttl is zero")]
    StorageWithoutTtl(FieldIdentity),

    #[error("storage '{0}' is not registered")]
    UnknownStorage(String),

    #[error("storage type '{0}' is not supported by this build")]
    UnsupportedStorage(&'static str),

    #[error("caching of all fields requires a positive default ttl")]
    AllWithoutTtl,

    #[error("invalid options: {0}")]
    Options(#[from] garde::Report),

    #[error("failed to parse options: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("failed to connect storage '{name}': {source}")]
    Connect {
        name:   String,
        #[source]
        source: StorageError,
    },

    #[error(transparent)]
    Builder(#[from] fieldx::error::FieldXError),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to (de)serialize cached value: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "redis")]
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("backend: {0}")]
    Backend(String),
}

/// A failure of the caching machinery itself. Never surfaces as a call result.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("key function failed: {0}")]
    Key(anyhow::Error),

    #[error("skip function failed: {0}")]
    Skip(anyhow::Error),

    #[error("references function failed: {0}")]
    References(anyhow::Error),

    #[error("invalidate function failed: {0}")]
    Invalidate(anyhow::Error),

    #[error("storage '{0}' is not registered")]
    UnknownStorage(String),

    #[error("background refresh of '{key}' failed: {cause}")]
    Refresh { key: String, cause: FieldError },
}

pub type Result<T, E = CacheError> = std::result::Result<T, E>;
