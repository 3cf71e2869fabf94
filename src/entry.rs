use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// Freshness of an entry at a given moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// `now < expires_at`
    Fresh,
    /// `expires_at <= now < stale_until`; served while refreshed in background.
    Stale,
    /// Same as absent.
    Expired,
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// A stored value with its expiry timestamps. The timestamps are wall-clock milliseconds so that an entry means the
/// same thing after a round-trip through a remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    #[serde(rename = "v")]
    value:       Value,
    #[serde(rename = "e")]
    expires_at:  i64,
    #[serde(rename = "s")]
    stale_until: i64,
}

impl CacheEntry {
    pub fn new(value: Value, ttl: Duration, stale: Duration) -> Self {
        Self::created_at(now_millis(), value, ttl, stale)
    }

    pub fn created_at(now: i64, value: Value, ttl: Duration, stale: Duration) -> Self {
        let expires_at = now.saturating_add(millis(ttl));
        Self {
            value,
            expires_at,
            stale_until: expires_at.saturating_add(millis(stale)),
        }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    pub fn expires_at(&self) -> i64 {
        self.expires_at
    }

    pub fn stale_until(&self) -> i64 {
        self.stale_until
    }

    pub fn freshness_at(&self, now: i64) -> Freshness {
        if now < self.expires_at {
            Freshness::Fresh
        }
        else if now < self.stale_until {
            Freshness::Stale
        }
        else {
            Freshness::Expired
        }
    }

    pub fn freshness(&self) -> Freshness {
        self.freshness_at(now_millis())
    }

    /// How long the entry has to be kept by a backend, stale window included.
    pub fn remaining_lifetime(&self) -> Duration {
        Duration::from_millis(self.stale_until.saturating_sub(now_millis()).max(0) as u64)
    }
}
