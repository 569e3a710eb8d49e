//! Shared lock and counter store
//!
//! Backs unique-job locks, overlap locks, rate-limit counters and the
//! cancellation registry. Every key carries a TTL; a zero TTL means the key
//! never expires.

use crate::error::QueueError;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Atomic key/value operations with expiry
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Set the key only if it is absent. Returns true if the key was set.
    async fn add(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, QueueError>;

    async fn get(&self, key: &str) -> Result<Option<String>, QueueError>;

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), QueueError>;

    /// Remove the key. Returns true if it existed.
    async fn forget(&self, key: &str) -> Result<bool, QueueError>;

    /// Increment a counter, starting its TTL window on first hit.
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, QueueError>;

    /// Remaining lifetime; `None` if the key is missing or never expires.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, QueueError>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

fn expiry(ttl: Duration) -> Option<Instant> {
    (!ttl.is_zero()).then(|| Instant::now() + ttl)
}

/// In-process lock store for single-worker deployments and tests
#[derive(Debug, Default)]
pub struct MemoryLockStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<R>(&self, f: impl FnOnce(&mut HashMap<String, Entry>, Instant) -> R) -> R {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        entries.retain(|_, entry| entry.is_live(now));
        f(&mut entries, now)
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn add(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, QueueError> {
        Ok(self.with_entries(|entries, _| {
            if entries.contains_key(key) {
                return false;
            }
            entries.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: expiry(ttl),
                },
            );
            true
        }))
    }

    async fn get(&self, key: &str) -> Result<Option<String>, QueueError> {
        Ok(self.with_entries(|entries, _| entries.get(key).map(|e| e.value.clone())))
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), QueueError> {
        self.with_entries(|entries, _| {
            entries.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: expiry(ttl),
                },
            );
        });
        Ok(())
    }

    async fn forget(&self, key: &str) -> Result<bool, QueueError> {
        Ok(self.with_entries(|entries, _| entries.remove(key).is_some()))
    }

    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, QueueError> {
        Ok(self.with_entries(|entries, _| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: "0".to_string(),
                expires_at: expiry(ttl),
            });
            let hits = entry.value.parse::<u64>().unwrap_or(0) + 1;
            entry.value = hits.to_string();
            hits
        }))
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, QueueError> {
        Ok(self.with_entries(|entries, now| {
            entries
                .get(key)
                .and_then(|e| e.expires_at)
                .map(|at| at.saturating_duration_since(now))
        }))
    }
}

const INCREMENT_SCRIPT: &str = r#"
local hits = redis.call('incr', KEYS[1])
if hits == 1 and tonumber(ARGV[1]) > 0 then
    redis.call('pexpire', KEYS[1], ARGV[1])
end
return hits
"#;

/// Redis-backed lock store shared by every worker
#[derive(Clone)]
pub struct RedisLockStore {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisLockStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self::with_prefix(conn, "queue:locks:")
    }

    pub fn with_prefix(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn set_cmd(&self, key: &str, value: &str, ttl: Duration) -> redis::Cmd {
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.key(key)).arg(value);
        if !ttl.is_zero() {
            cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
        }
        cmd
    }
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn add(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let mut cmd = self.set_cmd(key, value, ttl);
        cmd.arg("NX");
        let result: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(result.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, QueueError> {
        let mut conn = self.conn.clone();
        Ok(redis::cmd("GET")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await?)
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: () = self.set_cmd(key, value, ttl).query_async(&mut conn).await?;
        Ok(())
    }

    async fn forget(&self, key: &str) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let removed: u64 = redis::cmd("DEL")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        let hits: u64 = redis::Script::new(INCREMENT_SCRIPT)
            .key(self.key(key))
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(hits)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, QueueError> {
        let mut conn = self.conn.clone();
        let millis: i64 = redis::cmd("PTTL")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await?;
        Ok((millis >= 0).then(|| Duration::from_millis(millis as u64)))
    }
}
