//! Declarative, process-wide cache configuration.
//!
//! ```json
//! {
//!     "ttl": 30,
//!     "stale": 5,
//!     "storage": { "type": "memory", "size": 10000, "invalidation": true },
//!     "storages": {
//!         "shared": { "type": "redis", "url": "redis://127.0.0.1/", "invalidation": true }
//!     },
//!     "report_interval": 60
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use garde::Validate;
use serde::Deserialize;
use serde::Serialize;

use crate::error::ConfigError;
use crate::storage::memory::DEFAULT_MEMORY_SIZE;
use crate::storage::MemoryStorage;
use crate::traits::Storage;

fn default_size() -> u64 {
    DEFAULT_MEMORY_SIZE
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageOptions {
    Memory {
        /// Maximum number of entries kept.
        #[serde(default = "default_size")]
        #[garde(range(min = 1))]
        size:         u64,
        #[serde(default)]
        #[garde(skip)]
        invalidation: bool,
    },
    Redis {
        #[garde(length(min = 1))]
        url:              String,
        #[serde(default)]
        #[garde(skip)]
        invalidation:     bool,
        #[serde(default)]
        #[garde(skip)]
        reference_prefix: String,
    },
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self::Memory {
            size:         DEFAULT_MEMORY_SIZE,
            invalidation: false,
        }
    }
}

impl StorageOptions {
    /// Instantiate the backend. Remote backends connect here, so this is where an unreachable server is reported.
    pub async fn build_storage(&self, name: &str) -> Result<Arc<dyn Storage>, ConfigError> {
        match self {
            Self::Memory { size, invalidation } => Ok(Arc::new(
                MemoryStorage::builder()
                    .size(*size)
                    .invalidation(*invalidation)
                    .build()?,
            )),
            #[cfg(feature = "redis")]
            Self::Redis {
                url,
                invalidation,
                reference_prefix,
            } => {
                let kv = crate::storage::redis::RedisKv::connect(url)
                    .await
                    .map_err(|source| ConfigError::Connect {
                        name: name.to_string(),
                        source,
                    })?;
                Ok(Arc::new(
                    crate::storage::RemoteStorage::<crate::storage::redis::RedisKv>::builder()
                        .kv(kv)
                        .invalidation(*invalidation)
                        .reference_prefix(reference_prefix.clone())
                        .build()?,
                ))
            }
            #[cfg(not(feature = "redis"))]
            Self::Redis { .. } => {
                tracing::error!("storage '{name}' needs the 'redis' feature");
                Err(ConfigError::UnsupportedStorage("redis"))
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
pub struct CacheOptions {
    /// Default time to live in seconds. Zero disables caching for fields without their own ttl.
    #[garde(range(min = 0.0))]
    pub ttl: f64,

    /// Default stale window in seconds.
    #[garde(range(min = 0.0))]
    pub stale: f64,

    /// Cache every field, not only those with a registered policy.
    #[garde(custom(Self::requires_ttl(&self.ttl)))]
    pub all: bool,

    /// Backend registered under the default storage name.
    #[garde(dive)]
    pub storage: StorageOptions,

    /// Additional named backends.
    #[garde(dive)]
    pub storages: HashMap<String, StorageOptions>,

    /// Seconds between report flushes. No interval, no reporting.
    #[garde(custom(Self::positive_interval))]
    pub report_interval: Option<f64>,
}

impl CacheOptions {
    fn requires_ttl<'a>(ttl: &'a f64) -> impl FnOnce(&'a bool, &()) -> garde::Result {
        move |all, _| {
            if *all && *ttl <= 0.0 {
                Err(garde::Error::new("caching of all fields requires a positive ttl"))
            }
            else {
                Ok(())
            }
        }
    }

    fn positive_interval(value: &Option<f64>, _: &()) -> garde::Result {
        match value {
            Some(secs) if !(secs.is_finite() && *secs > 0.0) => {
                Err(garde::Error::new(format!("report interval must be positive, got {secs}")))
            }
            Some(secs) if Duration::try_from_secs_f64(*secs).is_err() => {
                Err(garde::Error::new(format!("report interval is out of range, got {secs}")))
            }
            _ => Ok(()),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let options: Self = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    pub fn report_interval_duration(&self) -> Option<Duration> {
        self.report_interval.and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }
}
