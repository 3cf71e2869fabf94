use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::debug;

use crate::error::StorageError;

use super::remote::KvStore;

/// [`KvStore`] on a Redis server. The connection manager reconnects on its own after a failure.
#[derive(Clone)]
pub struct RedisKv {
    conn: ConnectionManager,
}

impl RedisKv {
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        debug!("connected to {url}");
        Ok(Self { conn })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut self.conn()).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), StorageError> {
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1))
            .query_async(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<usize, StorageError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let deleted: usize = redis::cmd("DEL").arg(keys).query_async(&mut self.conn()).await?;
        Ok(deleted)
    }

    async fn exists(&self, keys: &[String]) -> Result<Vec<bool>, StorageError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.cmd("EXISTS").arg(key);
        }
        let exists: Vec<bool> = pipe.query_async(&mut self.conn()).await?;
        Ok(exists)
    }

    async fn set_add(&self, set: &str, members: &[String]) -> Result<(), StorageError> {
        if members.is_empty() {
            return Ok(());
        }
        let _: () = redis::cmd("SADD")
            .arg(set)
            .arg(members)
            .query_async(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn set_members(&self, set: &str) -> Result<Vec<String>, StorageError> {
        let members: Vec<String> = redis::cmd("SMEMBERS").arg(set).query_async(&mut self.conn()).await?;
        Ok(members)
    }

    async fn set_remove(&self, set: &str, members: &[String]) -> Result<(), StorageError> {
        if members.is_empty() {
            return Ok(());
        }
        let _: () = redis::cmd("SREM")
            .arg(set)
            .arg(members)
            .query_async(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn is_set(&self, key: &str) -> Result<bool, StorageError> {
        let kind: String = redis::cmd("TYPE").arg(key).query_async(&mut self.conn()).await?;
        Ok(kind == "set")
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>), StorageError> {
        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut self.conn())
            .await?;
        Ok((next, keys))
    }

    async fn flush(&self) -> Result<(), StorageError> {
        let _: () = redis::cmd("FLUSHDB").query_async(&mut self.conn()).await?;
        Ok(())
    }
}

impl Debug for RedisKv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisKv").finish_non_exhaustive()
    }
}
