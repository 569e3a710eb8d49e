//! Redis queue
//!
//! Key layout for a queue `q` under prefix `p`:
//! - `p{q}:p{n}`: ready list for priority `n`, FIFO
//! - `p{q}:priorities`: sorted set of priorities that have a ready list
//! - `p{q}:delayed`: sorted set scored by availability time
//! - `p{q}:reserved`: sorted set scored by lease expiry
//! - `p{q}:notify`: one entry per job made ready, used only to wake
//!   blocked consumers
//!
//! Every pop first migrates due delayed jobs and expired reservations back
//! onto the ready lists, then takes the head job and records its lease in a
//! single script. Reserved entries store the envelope with the attempt
//! already counted; a job whose worker dies comes back with that attempt on
//! the books. When nothing is ready and `block_for` is set, the consumer
//! blocks on the notify list and tries once more. The blocking wait runs on
//! its own connection so it never stalls the shared multiplexed one.

use super::{QueueBackend, ReservedJob, Receipt, decode_or_reject, resolve_queue, with_reconnect};
use crate::error::QueueError;
use crate::failed::{FailedJobStore, RedisFailedJobStore};
use crate::job::Job;
use ::redis::aio::{ConnectionManager, MultiplexedConnection};
use ::redis::{AsyncConnectionConfig, Client, Script};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// Move due members of a sorted set onto their priority ready lists.
///
/// KEYS[1] source sorted set, KEYS[2] priorities set, KEYS[3] notify list
/// ARGV[1] now, ARGV[2] ready list key prefix
const MIGRATE_SCRIPT: &str = r#"
local due = redis.call('zrangebyscore', KEYS[1], '-inf', ARGV[1])
if next(due) ~= nil then
    redis.call('zremrangebyrank', KEYS[1], 0, #due - 1)
    for i = 1, #due do
        local priority = 0
        local ok, decoded = pcall(cjson.decode, due[i])
        if ok and type(decoded) == 'table' and tonumber(decoded['priority']) then
            priority = tonumber(decoded['priority'])
        end
        redis.call('zadd', KEYS[2], priority, priority)
        redis.call('rpush', ARGV[2] .. priority, due[i])
        redis.call('rpush', KEYS[3], 1)
    end
end
return #due
"#;

/// Take the head of the highest-priority ready list and lease it.
///
/// The leased copy has its envelope `attempts` incremented. The envelope
/// serializes `attempts` ahead of the user payload, so the first match is
/// the envelope's own counter.
///
/// KEYS[1] priorities set, KEYS[2] reserved set, KEYS[3] notify list
/// ARGV[1] ready list key prefix, ARGV[2] lease expiry
const POP_SCRIPT: &str = r#"
local priorities = redis.call('zrevrange', KEYS[1], 0, -1)
if #priorities == 0 then
    priorities = {'0'}
end
for i = 1, #priorities do
    local job = redis.call('lpop', ARGV[1] .. priorities[i])
    if job then
        local reserved = string.gsub(job, '"attempts":(%d+)', function(n)
            return '"attempts":' .. (tonumber(n) + 1)
        end, 1)
        redis.call('zadd', KEYS[2], ARGV[2], reserved)
        redis.call('lpop', KEYS[3])
        return {job, reserved}
    end
end
return false
"#;

/// Drop a reservation and schedule the job again in one step.
///
/// KEYS[1] reserved set, KEYS[2] delayed set
/// ARGV[1] reserved member, ARGV[2] available at, ARGV[3] payload
const RELEASE_SCRIPT: &str = r#"
redis.call('zrem', KEYS[1], ARGV[1])
redis.call('zadd', KEYS[2], ARGV[2], ARGV[3])
return 1
"#;

/// Drop a reservation and push the job straight onto its ready list.
///
/// KEYS[1] reserved set, KEYS[2] priorities set, KEYS[3] ready list,
/// KEYS[4] notify list
/// ARGV[1] reserved member, ARGV[2] priority, ARGV[3] payload
const RELEASE_NOW_SCRIPT: &str = r#"
redis.call('zrem', KEYS[1], ARGV[1])
redis.call('zadd', KEYS[2], ARGV[2], ARGV[2])
redis.call('rpush', KEYS[3], ARGV[3])
redis.call('rpush', KEYS[4], 1)
return 1
"#;

/// Default wait of a blocking pop on an empty queue
pub const DEFAULT_BLOCK_FOR: Duration = Duration::from_secs(1);

/// Response timeout headroom on top of the BLPOP timeout
const BLOCKING_GRACE: Duration = Duration::from_secs(1);

/// Connection and key settings for a Redis queue
#[derive(Debug, Clone)]
pub struct RedisQueueConfig {
    pub connection: String,
    pub default_queue: String,
    pub prefix: String,
    /// Lease length before a reserved job is handed out again
    pub retry_after: Duration,
    /// How long an empty pop waits for a push; `None` returns straight away
    pub block_for: Option<Duration>,
}

impl Default for RedisQueueConfig {
    fn default() -> Self {
        Self {
            connection: "redis".to_string(),
            default_queue: "default".to_string(),
            prefix: "queues:".to_string(),
            retry_after: Duration::from_secs(3600),
            block_for: Some(DEFAULT_BLOCK_FOR),
        }
    }
}

impl RedisQueueConfig {
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = retry_after;
        self
    }

    /// Zero turns blocking off.
    pub fn with_block_for(mut self, block_for: Duration) -> Self {
        self.block_for = (!block_for.is_zero()).then_some(block_for);
        self
    }
}

struct Keys {
    base: String,
}

impl Keys {
    fn new(prefix: &str, queue: &str) -> Self {
        Self {
            base: format!("{prefix}{queue}"),
        }
    }

    fn ready_prefix(&self) -> String {
        format!("{}:p", self.base)
    }

    fn ready(&self, priority: i64) -> String {
        format!("{}:p{}", self.base, priority)
    }

    fn priorities(&self) -> String {
        format!("{}:priorities", self.base)
    }

    fn delayed(&self) -> String {
        format!("{}:delayed", self.base)
    }

    fn reserved(&self) -> String {
        format!("{}:reserved", self.base)
    }

    fn notify(&self) -> String {
        format!("{}:notify", self.base)
    }
}

fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Queue stored in Redis lists and sorted sets
pub struct RedisQueue {
    client: Client,
    conn: RwLock<ConnectionManager>,
    /// Dedicated connection for BLPOP, opened on first use
    blocking: Mutex<Option<MultiplexedConnection>>,
    config: RedisQueueConfig,
    failed: Arc<dyn FailedJobStore>,
}

impl RedisQueue {
    pub async fn connect(url: &str, config: RedisQueueConfig) -> Result<Self, QueueError> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        let failed = Arc::new(RedisFailedJobStore::new(
            conn.clone(),
            format!("{}failed", config.prefix),
        ));
        info!(prefix = %config.prefix, "Redis queue connected");
        Ok(Self {
            client,
            conn: RwLock::new(conn),
            blocking: Mutex::new(None),
            config,
            failed,
        })
    }

    pub fn with_failed_store(mut self, failed: Arc<dyn FailedJobStore>) -> Self {
        self.failed = failed;
        self
    }

    async fn conn(&self) -> ConnectionManager {
        self.conn.read().await.clone()
    }

    async fn reconnect(&self) -> Result<(), QueueError> {
        let fresh = ConnectionManager::new(self.client.clone()).await?;
        *self.conn.write().await = fresh;
        Ok(())
    }

    async fn try_push(&self, queue: &str, priority: i32, payload: &str) -> Result<(), QueueError> {
        let keys = Keys::new(&self.config.prefix, queue);
        let mut conn = self.conn().await;
        let _: () = ::redis::pipe()
            .atomic()
            .cmd("ZADD")
            .arg(keys.priorities())
            .arg(priority)
            .arg(priority)
            .ignore()
            .cmd("RPUSH")
            .arg(keys.ready(priority as i64))
            .arg(payload)
            .ignore()
            .cmd("RPUSH")
            .arg(keys.notify())
            .arg(1)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn try_later(&self, queue: &str, available_at: f64, payload: &str) -> Result<(), QueueError> {
        let keys = Keys::new(&self.config.prefix, queue);
        let mut conn = self.conn().await;
        let _: () = ::redis::cmd("ZADD")
            .arg(keys.delayed())
            .arg(available_at)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn migrate(&self, conn: &mut ConnectionManager, keys: &Keys) -> Result<(), QueueError> {
        let now = unix_now();
        let script = Script::new(MIGRATE_SCRIPT);
        for source in [keys.delayed(), keys.reserved()] {
            let moved: i64 = script
                .key(&source)
                .key(keys.priorities())
                .key(keys.notify())
                .arg(now)
                .arg(keys.ready_prefix())
                .invoke_async(conn)
                .await?;
            if moved > 0 {
                debug!(source = %source, moved, "Migrated jobs to ready lists");
            }
        }
        Ok(())
    }

    async fn try_pop(&self, queue: &str) -> Result<Option<(String, String)>, QueueError> {
        let keys = Keys::new(&self.config.prefix, queue);
        let mut conn = self.conn().await;
        self.migrate(&mut conn, &keys).await?;

        if let Some(popped) = self.claim(&mut conn, &keys).await? {
            return Ok(Some(popped));
        }
        let Some(block_for) = self.config.block_for else {
            return Ok(None);
        };

        if !self.wait_for_notify(&keys, block_for).await? {
            return Ok(None);
        }
        self.claim(&mut conn, &keys).await
    }

    /// Block on the notify list for up to `block_for`; true when a push
    /// woke us.
    async fn wait_for_notify(&self, keys: &Keys, block_for: Duration) -> Result<bool, QueueError> {
        let mut blocking = self.blocking.lock().await;
        let mut conn = match blocking.take() {
            Some(conn) => conn,
            None => {
                let config = AsyncConnectionConfig::new()
                    .set_response_timeout(Some(block_for + BLOCKING_GRACE));
                self.client
                    .get_multiplexed_async_connection_with_config(&config)
                    .await?
            }
        };

        // a failed connection is dropped here and reopened on the next wait
        let woken: Option<(String, String)> = ::redis::cmd("BLPOP")
            .arg(keys.notify())
            .arg(block_for.as_secs_f64())
            .query_async(&mut conn)
            .await?;
        *blocking = Some(conn);
        Ok(woken.is_some())
    }

    /// Pop and lease in one script, so a job is never off the ready list
    /// without a reservation.
    async fn claim(&self, conn: &mut ConnectionManager, keys: &Keys) -> Result<Option<(String, String)>, QueueError> {
        let expires_at = unix_now() + self.config.retry_after.as_secs_f64();
        let popped: Option<(String, String)> = Script::new(POP_SCRIPT)
            .key(keys.priorities())
            .key(keys.reserved())
            .key(keys.notify())
            .arg(keys.ready_prefix())
            .arg(expires_at)
            .invoke_async(conn)
            .await?;
        Ok(popped)
    }

    async fn try_ack(&self, queue: &str, member: &str) -> Result<(), QueueError> {
        let keys = Keys::new(&self.config.prefix, queue);
        let mut conn = self.conn().await;
        let _: i64 = ::redis::cmd("ZREM")
            .arg(keys.reserved())
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn try_release(&self, reserved: &ReservedJob, member: &str, delay: Duration) -> Result<(), QueueError> {
        let keys = Keys::new(&self.config.prefix, &reserved.queue);
        let payload = reserved.job.encode()?;
        let mut conn = self.conn().await;
        let _: i64 = if delay.is_zero() {
            let priority = reserved.job.priority as i64;
            Script::new(RELEASE_NOW_SCRIPT)
                .key(keys.reserved())
                .key(keys.priorities())
                .key(keys.ready(priority))
                .key(keys.notify())
                .arg(member)
                .arg(priority)
                .arg(&payload)
                .invoke_async(&mut conn)
                .await?
        } else {
            Script::new(RELEASE_SCRIPT)
                .key(keys.reserved())
                .key(keys.delayed())
                .arg(member)
                .arg(unix_now() + delay.as_secs_f64())
                .arg(&payload)
                .invoke_async(&mut conn)
                .await?
        };
        Ok(())
    }

    async fn try_size(&self, queue: &str) -> Result<u64, QueueError> {
        let keys = Keys::new(&self.config.prefix, queue);
        let mut conn = self.conn().await;
        let priorities: Vec<i64> = ::redis::cmd("ZRANGE")
            .arg(keys.priorities())
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;

        let mut pipe = ::redis::pipe();
        for priority in &priorities {
            pipe.cmd("LLEN").arg(keys.ready(*priority));
        }
        pipe.cmd("ZCARD").arg(keys.delayed());
        pipe.cmd("ZCARD").arg(keys.reserved());
        let counts: Vec<u64> = pipe.query_async(&mut conn).await?;
        Ok(counts.iter().sum())
    }

    async fn try_clear(&self, queue: &str) -> Result<u64, QueueError> {
        let total = self.try_size(queue).await?;
        let keys = Keys::new(&self.config.prefix, queue);
        let mut conn = self.conn().await;
        let priorities: Vec<i64> = ::redis::cmd("ZRANGE")
            .arg(keys.priorities())
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;

        let mut del = ::redis::cmd("DEL");
        for priority in &priorities {
            del.arg(keys.ready(*priority));
        }
        del.arg(keys.ready(0))
            .arg(keys.priorities())
            .arg(keys.delayed())
            .arg(keys.reserved())
            .arg(keys.notify());
        let _: i64 = del.query_async(&mut conn).await?;
        Ok(total)
    }
}

#[async_trait]
impl QueueBackend for RedisQueue {
    fn name(&self) -> &str {
        &self.config.connection
    }

    fn default_queue(&self) -> &str {
        &self.config.default_queue
    }

    async fn push(&self, job: &Job, queue: Option<&str>) -> Result<String, QueueError> {
        let queue = resolve_queue(queue, Some(job), &self.config.default_queue);
        let payload = job.encode()?;
        let payload = payload.as_str();
        with_reconnect(
            "push",
            move || self.try_push(queue, job.priority, payload),
            || self.reconnect(),
        )
        .await?;
        debug!(job_id = %job.id, queue, priority = job.priority, "Pushed job");
        Ok(job.id.clone())
    }

    async fn later(&self, job: &Job, delay: Duration, queue: Option<&str>) -> Result<String, QueueError> {
        let queue = resolve_queue(queue, Some(job), &self.config.default_queue);
        let payload = job.encode()?;
        let payload = payload.as_str();
        let available_at = unix_now() + delay.as_secs_f64();
        with_reconnect(
            "later",
            move || self.try_later(queue, available_at, payload),
            || self.reconnect(),
        )
        .await?;
        debug!(job_id = %job.id, queue, delay_secs = delay.as_secs(), "Scheduled job");
        Ok(job.id.clone())
    }

    async fn pop(&self, queue: Option<&str>) -> Result<Option<ReservedJob>, QueueError> {
        let queue = resolve_queue(queue, None, &self.config.default_queue);
        let popped = with_reconnect("pop", move || self.try_pop(queue), || self.reconnect()).await?;
        let Some((raw, reserved)) = popped else {
            return Ok(None);
        };

        match decode_or_reject(self.failed.as_ref(), self.name(), queue, &raw).await? {
            Some(job) => Ok(Some(ReservedJob {
                job,
                connection: self.config.connection.clone(),
                queue: queue.to_string(),
                raw,
                receipt: Receipt::Token(reserved),
            })),
            None => {
                self.try_ack(queue, &reserved).await?;
                Ok(None)
            }
        }
    }

    async fn size(&self, queue: Option<&str>) -> Result<u64, QueueError> {
        let queue = resolve_queue(queue, None, &self.config.default_queue);
        with_reconnect("size", move || self.try_size(queue), || self.reconnect()).await
    }

    async fn clear(&self, queue: Option<&str>) -> Result<u64, QueueError> {
        let queue = resolve_queue(queue, None, &self.config.default_queue);
        with_reconnect("clear", move || self.try_clear(queue), || self.reconnect()).await
    }

    async fn ack(&self, reserved: &ReservedJob) -> Result<(), QueueError> {
        let Receipt::Token(member) = &reserved.receipt else {
            return Ok(());
        };
        let queue = reserved.queue.as_str();
        let member = member.as_str();
        with_reconnect("ack", move || self.try_ack(queue, member), || self.reconnect()).await
    }

    async fn release(&self, reserved: &ReservedJob, delay: Duration) -> Result<(), QueueError> {
        let Receipt::Token(member) = &reserved.receipt else {
            return Ok(());
        };
        let member = member.as_str();
        with_reconnect(
            "release",
            move || self.try_release(reserved, member, delay),
            || self.reconnect(),
        )
        .await
    }

    fn failed_store(&self) -> Arc<dyn FailedJobStore> {
        Arc::clone(&self.failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let keys = Keys::new("queues:", "emails");
        assert_eq!(keys.ready(5), "queues:emails:p5");
        assert_eq!(keys.ready(-1), "queues:emails:p-1");
        assert_eq!(keys.ready_prefix(), "queues:emails:p");
        assert_eq!(keys.priorities(), "queues:emails:priorities");
        assert_eq!(keys.delayed(), "queues:emails:delayed");
        assert_eq!(keys.reserved(), "queues:emails:reserved");
        assert_eq!(keys.notify(), "queues:emails:notify");
    }

    #[test]
    fn test_default_lease_is_one_hour() {
        assert_eq!(RedisQueueConfig::default().retry_after, Duration::from_secs(3600));
    }

    #[test]
    fn test_pop_blocks_briefly_by_default() {
        let config = RedisQueueConfig::default();
        assert_eq!(config.block_for, Some(Duration::from_secs(1)));
        assert_eq!(config.with_block_for(Duration::ZERO).block_for, None);
    }

    #[test]
    fn test_envelope_attempts_precede_payload() {
        let job = Job::raw("noop", serde_json::json!({ "attempts": 99 }));
        let encoded = job.encode().unwrap();
        let counter = encoded.find("\"attempts\":").unwrap();
        let payload = encoded.find("\"payload\":").unwrap();
        assert!(counter < payload, "{encoded}");
    }
}
