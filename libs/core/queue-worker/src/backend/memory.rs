//! In-process queue
//!
//! Same semantics as the shared backends (priority, delay, reservation
//! leases) inside a single process. Used for tests and for running jobs
//! in the dispatching process.

use super::{QueueBackend, ReservedJob, Receipt, decode_or_reject, resolve_queue};
use crate::error::QueueError;
use crate::failed::{FailedJobStore, MemoryFailedJobStore};
use crate::job::Job;
use crate::time::{Clock, SystemClock};
use async_trait::async_trait;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct QueueState {
    /// Ordered by priority (highest first), then insertion order
    ready: BTreeMap<(Reverse<i32>, u64), String>,
    delayed: Vec<(i64, i32, String)>,
    reserved: HashMap<String, (i64, i32, String)>,
}

impl QueueState {
    fn migrate(&mut self, now: i64, seq: &mut u64) {
        let (due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.delayed)
            .into_iter()
            .partition(|(available_at, _, _)| *available_at <= now);
        self.delayed = pending;

        let mut due = due;
        due.sort_by_key(|(available_at, _, _)| *available_at);
        for (_, priority, raw) in due {
            *seq += 1;
            self.ready.insert((Reverse(priority), *seq), raw);
        }

        let expired: Vec<String> = self
            .reserved
            .iter()
            .filter(|(_, (expires_at, _, _))| *expires_at <= now)
            .map(|(token, _)| token.clone())
            .collect();
        for token in expired {
            if let Some((_, priority, raw)) = self.reserved.remove(&token) {
                *seq += 1;
                self.ready.insert((Reverse(priority), *seq), raw);
            }
        }
    }

    fn len(&self) -> usize {
        self.ready.len() + self.delayed.len() + self.reserved.len()
    }
}

#[derive(Debug, Default)]
struct Inner {
    queues: HashMap<String, QueueState>,
    seq: u64,
}

/// How long an empty `pop` waits for a push by default
pub const DEFAULT_BLOCK_FOR: Duration = Duration::from_secs(1);

/// Queue held in process memory
pub struct MemoryQueue {
    name: String,
    default_queue: String,
    retry_after: Duration,
    block_for: Option<Duration>,
    inner: Mutex<Inner>,
    notify: Notify,
    clock: Arc<dyn Clock>,
    failed: Arc<dyn FailedJobStore>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self {
            name: "memory".to_string(),
            default_queue: "default".to_string(),
            retry_after: Duration::from_secs(3600),
            block_for: Some(DEFAULT_BLOCK_FOR),
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            clock: Arc::new(SystemClock),
            failed: Arc::new(MemoryFailedJobStore::new()),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_default_queue(mut self, queue: impl Into<String>) -> Self {
        self.default_queue = queue.into();
        self
    }

    /// Lease length; reserved jobs not acked in time become claimable again.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = retry_after;
        self
    }

    /// Wait up to this long for a push when the queue is empty. Zero
    /// returns straight away.
    pub fn with_block_for(mut self, block_for: Duration) -> Self {
        self.block_for = (!block_for.is_zero()).then_some(block_for);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_failed_store(mut self, failed: Arc<dyn FailedJobStore>) -> Self {
        self.failed = failed;
        self
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(&self, job: &Job, queue: &str, available_at: Option<i64>) -> Result<String, QueueError> {
        let raw = job.encode()?;
        {
            let mut inner = self.inner();
            inner.seq += 1;
            let seq = inner.seq;
            let state = inner.queues.entry(queue.to_string()).or_default();
            match available_at {
                Some(at) => state.delayed.push((at, job.priority, raw)),
                None => {
                    state.ready.insert((Reverse(job.priority), seq), raw);
                }
            }
        }
        self.notify.notify_one();
        Ok(job.id.clone())
    }

    fn try_claim(&self, queue: &str) -> Option<(String, String)> {
        let now = self.clock.now();
        let lease = self.retry_after.as_secs() as i64;
        let mut inner = self.inner();
        let Inner { queues, seq } = &mut *inner;
        let state = queues.entry(queue.to_string()).or_default();
        state.migrate(now, seq);

        let (_, raw) = state.ready.pop_first()?;
        let token = uuid::Uuid::new_v4().to_string();
        // a lease that expires hands the job back with this attempt counted
        let (priority, reserved_raw) = match Job::from_json(&raw) {
            Ok(mut job) => {
                job.increment_attempts();
                (job.priority, job.encode().unwrap_or_else(|_| raw.clone()))
            }
            Err(_) => (0, raw.clone()),
        };
        state
            .reserved
            .insert(token.clone(), (now + lease, priority, reserved_raw));
        Some((raw, token))
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn default_queue(&self) -> &str {
        &self.default_queue
    }

    async fn push(&self, job: &Job, queue: Option<&str>) -> Result<String, QueueError> {
        let queue = resolve_queue(queue, Some(job), &self.default_queue);
        self.enqueue(job, queue, None)
    }

    async fn later(&self, job: &Job, delay: Duration, queue: Option<&str>) -> Result<String, QueueError> {
        let queue = resolve_queue(queue, Some(job), &self.default_queue);
        let available_at = self.clock.now() + delay.as_secs() as i64;
        self.enqueue(job, queue, Some(available_at))
    }

    async fn pop(&self, queue: Option<&str>) -> Result<Option<ReservedJob>, QueueError> {
        let queue = resolve_queue(queue, None, &self.default_queue);

        let mut claimed = self.try_claim(queue);
        if claimed.is_none()
            && let Some(block_for) = self.block_for
        {
            let _ = tokio::time::timeout(block_for, self.notify.notified()).await;
            claimed = self.try_claim(queue);
        }

        let Some((raw, token)) = claimed else {
            return Ok(None);
        };

        match decode_or_reject(self.failed.as_ref(), &self.name, queue, &raw).await? {
            Some(job) => Ok(Some(ReservedJob {
                job,
                connection: self.name.clone(),
                queue: queue.to_string(),
                raw,
                receipt: Receipt::Token(token),
            })),
            None => {
                if let Some(state) = self.inner().queues.get_mut(queue) {
                    state.reserved.remove(&token);
                }
                Ok(None)
            }
        }
    }

    async fn size(&self, queue: Option<&str>) -> Result<u64, QueueError> {
        let queue = resolve_queue(queue, None, &self.default_queue);
        Ok(self
            .inner()
            .queues
            .get(queue)
            .map(|state| state.len() as u64)
            .unwrap_or(0))
    }

    async fn clear(&self, queue: Option<&str>) -> Result<u64, QueueError> {
        let queue = resolve_queue(queue, None, &self.default_queue);
        Ok(self
            .inner()
            .queues
            .remove(queue)
            .map(|state| state.len() as u64)
            .unwrap_or(0))
    }

    async fn ack(&self, reserved: &ReservedJob) -> Result<(), QueueError> {
        if let Receipt::Token(token) = &reserved.receipt
            && let Some(state) = self.inner().queues.get_mut(&reserved.queue)
        {
            state.reserved.remove(token);
        }
        Ok(())
    }

    fn failed_store(&self) -> Arc<dyn FailedJobStore> {
        Arc::clone(&self.failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;

    fn job(priority: i32) -> Job {
        Job::raw("noop", serde_json::json!({})).priority(priority)
    }

    #[tokio::test]
    async fn test_priority_then_fifo() {
        let queue = MemoryQueue::new();
        let jobs = [job(5), job(1), job(5), job(3)];
        for j in &jobs {
            queue.push(j, None).await.unwrap();
        }

        let mut order = Vec::new();
        while let Some(reserved) = queue.pop(None).await.unwrap() {
            order.push(reserved.job.id.clone());
            queue.ack(&reserved).await.unwrap();
        }

        assert_eq!(
            order,
            vec![
                jobs[0].id.clone(),
                jobs[2].id.clone(),
                jobs[3].id.clone(),
                jobs[1].id.clone()
            ]
        );
    }

    #[tokio::test]
    async fn test_delay_is_honoured() {
        let clock = ManualClock::new(1_000);
        let queue = MemoryQueue::new().with_clock(Arc::new(clock.clone()));
        queue.later(&job(0), Duration::from_secs(10), None).await.unwrap();

        assert!(queue.pop(None).await.unwrap().is_none());
        clock.advance(9);
        assert!(queue.pop(None).await.unwrap().is_none());
        clock.advance(1);
        assert!(queue.pop(None).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed_with_attempt_counted() {
        let clock = ManualClock::new(1_000);
        let queue = MemoryQueue::new()
            .with_clock(Arc::new(clock.clone()))
            .with_retry_after(Duration::from_secs(30));
        queue.push(&job(0), None).await.unwrap();

        let first = queue.pop(None).await.unwrap().unwrap();
        assert_eq!(first.job.attempts, 0);
        assert!(queue.pop(None).await.unwrap().is_none());

        clock.advance(31);
        let again = queue.pop(None).await.unwrap().unwrap();
        assert_eq!(again.job.id, first.job.id);
        assert_eq!(again.job.attempts, 1);
    }

    #[tokio::test]
    async fn test_clear_is_idempotent() {
        let queue = MemoryQueue::new();
        queue.push(&job(0), None).await.unwrap();
        queue.later(&job(0), Duration::from_secs(60), None).await.unwrap();

        assert_eq!(queue.size(None).await.unwrap(), 2);
        assert_eq!(queue.clear(None).await.unwrap(), 2);
        assert_eq!(queue.size(None).await.unwrap(), 0);
        assert_eq!(queue.clear(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_invalid_payload_goes_to_failed_store() {
        let queue = MemoryQueue::new();
        {
            let mut inner = queue.inner();
            inner.seq += 1;
            let seq = inner.seq;
            inner
                .queues
                .entry("default".to_string())
                .or_default()
                .ready
                .insert((Reverse(0), seq), r#"{"job":"Illuminate\\Foo"}"#.to_string());
        }

        assert!(queue.pop(None).await.unwrap().is_none());
        assert_eq!(queue.size(None).await.unwrap(), 0);
        let failed = queue.failed_store().all().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].exception[0].class, "InvalidPayload");
    }

    #[test]
    fn test_defaults_block_briefly_and_lease_for_an_hour() {
        let queue = MemoryQueue::new();
        assert_eq!(queue.block_for, Some(Duration::from_secs(1)));
        assert_eq!(queue.retry_after, Duration::from_secs(3600));
        assert_eq!(MemoryQueue::new().with_block_for(Duration::ZERO).block_for, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_pop_waits_for_the_block_timeout() {
        let queue = MemoryQueue::new();
        let started = tokio::time::Instant::now();
        assert!(queue.pop(None).await.unwrap().is_none());
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_pop_wakes_on_push() {
        let queue = Arc::new(MemoryQueue::new().with_block_for(Duration::from_secs(5)));
        let producer = Arc::clone(&queue);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            producer.push(&job(0), None).await.unwrap();
        });

        assert!(queue.pop(None).await.unwrap().is_some());
    }
}
