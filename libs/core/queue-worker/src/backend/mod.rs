//! Queue backends
//!
//! Every backend stores the same [`Job`] envelope and offers the same
//! contract:
//! - a job handed out by `pop` is reserved for exactly one worker
//! - higher priority first, then oldest first (where the broker allows)
//! - jobs pushed with a delay are not claimable before it elapses
//! - a reserved job leaves active state through `ack`, `release` or
//!   `store_failed`

pub mod amqp;
pub mod database;
pub mod memory;
pub mod redis;

pub use self::amqp::{AmqpConfig, AmqpQueue};
pub use self::database::{DatabaseConfig, DatabaseFailedJobStore, DatabaseQueue, DbKind, LockStrategy};
pub use self::memory::MemoryQueue;
pub use self::redis::{RedisQueue, RedisQueueConfig};

use crate::error::{JobError, QueueError};
use crate::failed::{FailedJob, FailedJobStore};
use crate::job::Job;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

/// Backend-specific handle needed to acknowledge a reservation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Receipt {
    /// Nothing to acknowledge (the claim already removed the job)
    None,
    /// Opaque token, such as the reserved payload or an in-flight id
    Token(String),
    /// AMQP delivery tag on the channel that delivered the message
    DeliveryTag(u64),
}

/// A job claimed by one worker
#[derive(Debug, Clone)]
pub struct ReservedJob {
    pub job: Job,
    pub connection: String,
    pub queue: String,
    /// The envelope exactly as it was stored
    pub raw: String,
    pub receipt: Receipt,
}

/// Storage for jobs
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Connection name used in logs, metrics and failed records.
    fn name(&self) -> &str;

    fn default_queue(&self) -> &str;

    /// Enqueue for immediate availability. Returns the job id.
    async fn push(&self, job: &Job, queue: Option<&str>) -> Result<String, QueueError>;

    /// Enqueue, available once `delay` has elapsed.
    async fn later(&self, job: &Job, delay: Duration, queue: Option<&str>)
    -> Result<String, QueueError>;

    /// Claim the next available job, if any.
    async fn pop(&self, queue: Option<&str>) -> Result<Option<ReservedJob>, QueueError>;

    /// Pending, delayed and reserved jobs on the queue.
    async fn size(&self, queue: Option<&str>) -> Result<u64, QueueError>;

    /// Discard every job on the queue. Returns how many were removed.
    async fn clear(&self, queue: Option<&str>) -> Result<u64, QueueError>;

    /// Remove a reserved job for good.
    async fn ack(&self, reserved: &ReservedJob) -> Result<(), QueueError>;

    /// Put a reserved job back, available after `delay`.
    ///
    /// The stored envelope is `reserved.job`, so attempt changes made by the
    /// worker are kept. The copy is published before the reservation is
    /// acknowledged: if publishing fails the reservation stays and the job
    /// is redelivered, and if only the ack fails the job may run twice.
    async fn release(&self, reserved: &ReservedJob, delay: Duration) -> Result<(), QueueError> {
        let queue = Some(reserved.queue.as_str());
        if delay.is_zero() {
            self.push(&reserved.job, queue).await?;
        } else {
            self.later(&reserved.job, delay, queue).await?;
        }
        self.ack(reserved).await
    }

    fn failed_store(&self) -> Arc<dyn FailedJobStore>;

    /// Record a permanent failure and remove the job from active state.
    async fn store_failed(&self, reserved: &ReservedJob, error: &JobError) -> Result<(), QueueError> {
        let record = FailedJob::new(
            self.name(),
            &reserved.queue,
            reserved.job.encode()?,
            &reserved.job.id,
            error,
        );
        self.failed_store().log(record).await?;
        self.ack(reserved).await
    }
}

/// Resolve the target queue: explicit argument, then the job's own, then the default.
pub(crate) fn resolve_queue<'a>(queue: Option<&'a str>, job: Option<&'a Job>, default: &'a str) -> &'a str {
    queue
        .or_else(|| job.and_then(|j| j.queue.as_deref()))
        .unwrap_or(default)
}

/// Run an operation, reconnecting and retrying exactly once if the
/// connection was lost.
pub(crate) async fn with_reconnect<T, Op, OpFut, Re, ReFut>(
    operation: &str,
    mut attempt: Op,
    reconnect: Re,
) -> Result<T, QueueError>
where
    Op: FnMut() -> OpFut,
    OpFut: Future<Output = Result<T, QueueError>>,
    Re: FnOnce() -> ReFut,
    ReFut: Future<Output = Result<(), QueueError>>,
{
    match attempt().await {
        Err(e) if e.is_connection_error() => {
            warn!(operation, error = %e, "Lost connection, reconnecting and retrying once");
            reconnect().await?;
            attempt().await
        }
        result => result,
    }
}

/// Decode a popped payload; undecodable payloads go straight to the failed
/// store so they do not block the queue.
pub(crate) async fn decode_or_reject(
    failed: &dyn FailedJobStore,
    connection: &str,
    queue: &str,
    raw: &str,
) -> Result<Option<Job>, QueueError> {
    match Job::from_json(raw) {
        Ok(job) => Ok(Some(job)),
        Err(e) => {
            error!(connection, queue, error = %e, "Rejecting undecodable job payload");
            let error = JobError::InvalidPayload(e.to_string());
            let record = FailedJob::new(connection, queue, raw.to_string(), "", &error);
            failed.log(record).await?;
            Ok(None)
        }
    }
}
