//! The worker loop
//!
//! One worker polls its queues in priority order and executes one job at a
//! time. Scale out by running more workers against the same backend; the
//! backend's claim is what keeps two workers off the same job.
//!
//! Each iteration:
//! 1. stop if asked to, or if the memory or run-time limit is reached
//! 2. take the first available job from the queues, in order
//! 3. sleep in one-second chunks when there was nothing to do
//! 4. execute the job through its middleware pipeline and settle it:
//!    ack on success, release without an attempt for control errors,
//!    retry with backoff while attempts remain, otherwise store as failed

use crate::backend::{QueueBackend, ReservedJob};
use crate::cancel::CancellationRegistry;
use crate::config::WorkerOptions;
use crate::error::{FailureKind, JobError};
use crate::event::{EventSink, JobEvent, StopReason, TracingEventSink};
use crate::lock::{LockStore, MemoryLockStore};
use crate::metrics::QueueMetrics;
use crate::middleware::{Pipeline, unique};
use crate::registry::{HandlerRegistry, JobHandler};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const SLEEP_CHUNK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Control {
    stopping: bool,
    paused: bool,
}

/// Remote control for a running worker
#[derive(Clone)]
pub struct WorkerHandle {
    control: Arc<watch::Sender<Control>>,
}

impl WorkerHandle {
    /// Ask the worker to stop after the current job.
    pub fn stop(&self) {
        self.control.send_modify(|control| control.stopping = true);
    }

    pub fn pause(&self) {
        self.control.send_modify(|control| control.paused = true);
    }

    pub fn resume(&self) {
        self.control.send_modify(|control| control.paused = false);
    }

    pub fn is_stopping(&self) -> bool {
        self.control.borrow().stopping
    }

    pub fn is_paused(&self) -> bool {
        self.control.borrow().paused
    }
}

/// How one execution ended, for metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Succeeded,
    Released,
    Retried,
    Failed,
    Cancelled,
}

impl Outcome {
    fn as_str(&self) -> &'static str {
        match self {
            Outcome::Succeeded => "success",
            Outcome::Released => "released",
            Outcome::Retried => "retried",
            Outcome::Failed => "failed",
            Outcome::Cancelled => "cancelled",
        }
    }
}

pub struct Worker {
    backend: Arc<dyn QueueBackend>,
    registry: HandlerRegistry,
    options: WorkerOptions,
    locks: Arc<dyn LockStore>,
    events: Arc<dyn EventSink>,
    cancellations: CancellationRegistry,
    metrics: QueueMetrics,
    control: Arc<watch::Sender<Control>>,
    processed: AtomicU64,
}

impl Worker {
    pub fn new(backend: Arc<dyn QueueBackend>, registry: HandlerRegistry, options: WorkerOptions) -> Self {
        let locks: Arc<dyn LockStore> = Arc::new(MemoryLockStore::new());
        let metrics = QueueMetrics::new(backend.name(), &options.name);
        let (control, _) = watch::channel(Control::default());
        Self {
            backend,
            registry,
            options,
            cancellations: CancellationRegistry::new(Arc::clone(&locks)),
            locks,
            events: Arc::new(TracingEventSink),
            metrics,
            control: Arc::new(control),
            processed: AtomicU64::new(0),
        }
    }

    /// Lock store shared by middleware and cancellation flags.
    pub fn with_lock_store(mut self, locks: Arc<dyn LockStore>) -> Self {
        self.cancellations = CancellationRegistry::new(Arc::clone(&locks));
        self.locks = locks;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            control: Arc::clone(&self.control),
        }
    }

    pub fn cancellations(&self) -> &CancellationRegistry {
        &self.cancellations
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    /// Jobs executed so far, whatever their outcome.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    /// Run until stopped or a limit is reached.
    pub async fn run(&self) -> StopReason {
        let started = Instant::now();
        info!(
            worker = %self.options.name,
            connection = self.backend.name(),
            queues = ?self.options.queues,
            "Starting queue worker"
        );

        let reason = loop {
            if let Some(reason) = self.should_stop(started) {
                break reason;
            }

            if self.control.borrow().paused && !self.options.force {
                self.sleep(self.options.sleep).await;
                continue;
            }

            if !self.run_next_job().await {
                if self.options.stop_when_empty {
                    break StopReason::Empty;
                }
                self.record_depths().await;
                self.sleep(self.options.sleep).await;
                continue;
            }

            if self.options.max_jobs > 0 && self.processed() >= self.options.max_jobs {
                break StopReason::MaxJobs;
            }
            if !self.options.rest.is_zero() {
                self.sleep(self.options.rest).await;
            }
        };

        info!(
            worker = %self.options.name,
            reason = reason.as_str(),
            processed = self.processed(),
            "Queue worker stopping"
        );
        self.events.dispatch(&JobEvent::WorkerStopping {
            worker: self.options.name.clone(),
            reason,
        });
        reason
    }

    fn should_stop(&self, started: Instant) -> Option<StopReason> {
        if self.control.borrow().stopping {
            return Some(StopReason::Signal);
        }

        let rss = resident_memory_bytes();
        self.metrics.resident_memory(rss);
        let limit = self.options.memory_limit_mb.saturating_mul(1024 * 1024);
        if limit > 0 && rss >= limit {
            warn!(rss_bytes = rss, limit_bytes = limit, "Memory limit reached");
            return Some(StopReason::Memory);
        }

        if !self.options.max_time.is_zero() && started.elapsed() >= self.options.max_time {
            return Some(StopReason::MaxTime);
        }
        None
    }

    /// Sleep in chunks, waking early when stopped or resumed.
    async fn sleep(&self, duration: Duration) {
        let mut control = self.control.subscribe();
        let deadline = Instant::now() + duration;
        loop {
            if control.borrow_and_update().stopping {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            let chunk = (deadline - now).min(SLEEP_CHUNK);
            tokio::select! {
                _ = tokio::time::sleep(chunk) => {}
                changed = control.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// Take and execute at most one job. Returns whether a job was executed.
    pub async fn run_next_job(&self) -> bool {
        let Some(reserved) = self.next_job().await else {
            return false;
        };
        self.process(reserved).await;
        self.processed.fetch_add(1, Ordering::SeqCst);
        true
    }

    /// Queue depth gauges, refreshed while idle.
    async fn record_depths(&self) {
        for queue in &self.options.queues {
            match self.backend.size(Some(queue)).await {
                Ok(depth) => self.metrics.queue_depth(queue, depth),
                Err(e) => debug!(queue = %queue, error = %e, "Could not read queue size"),
            }
        }
    }

    async fn next_job(&self) -> Option<ReservedJob> {
        for queue in &self.options.queues {
            match self.backend.pop(Some(queue)).await {
                Ok(Some(reserved)) => return Some(reserved),
                Ok(None) => {}
                Err(e) => {
                    error!(queue = %queue, connection = self.backend.name(), error = %e, "Backend error while polling");
                    self.metrics.poll_error(queue);
                }
            }
        }
        None
    }

    async fn process(&self, mut reserved: ReservedJob) {
        let started = Instant::now();
        let memory_before = resident_memory_bytes();
        let outcome = self.execute(&mut reserved).await;

        self.metrics.job_executed(
            &reserved.queue,
            &reserved.job.job_type,
            outcome.as_str(),
            started.elapsed(),
        );
        let memory_after = resident_memory_bytes();
        if memory_before > 0 && memory_after > 0 {
            self.metrics
                .memory_delta(&reserved.queue, memory_after as i64 - memory_before as i64);
        }
    }

    async fn execute(&self, reserved: &mut ReservedJob) -> Outcome {
        match self.cancellations.is_cancelled(&reserved.job.id).await {
            Ok(true) => {
                info!(job_id = %reserved.job.id, queue = %reserved.queue, "Skipping cancelled job");
                if let Err(e) = self.backend.ack(reserved).await {
                    error!(job_id = %reserved.job.id, error = %e, "Failed to acknowledge cancelled job");
                }
                return Outcome::Cancelled;
            }
            Ok(false) => {}
            Err(e) => warn!(job_id = %reserved.job.id, error = %e, "Could not check cancellation"),
        }

        let Some(handler) = self.registry.get(&reserved.job.job_type) else {
            let error = JobError::InvalidPayload(format!(
                "no handler registered for job type '{}'",
                reserved.job.job_type
            ));
            self.fail(reserved, None, error).await;
            return Outcome::Failed;
        };

        reserved.job.apply_defaults(
            self.options.default_tries,
            self.options.default_timeout,
            self.options.default_backoff,
        );

        let max_attempts = reserved.job.max_attempts();
        if max_attempts > 0 && reserved.job.attempts() >= max_attempts {
            let error = JobError::MaxAttemptsExceeded {
                attempts: reserved.job.attempts(),
            };
            self.fail(reserved, Some(&handler), error).await;
            return Outcome::Failed;
        }

        reserved.job.increment_attempts();
        let job = &reserved.job;
        debug!(
            job_id = %job.id,
            job_type = %job.job_type,
            queue = %reserved.queue,
            attempts = job.attempts(),
            max_attempts,
            "Processing job"
        );
        self.events.dispatch(&JobEvent::JobProcessing {
            connection: reserved.connection.clone(),
            queue: reserved.queue.clone(),
            job_id: job.id.clone(),
            job_type: job.job_type.clone(),
            attempt: job.attempts(),
        });

        let started = Instant::now();
        let pipeline = Pipeline::for_job(job, handler.as_ref(), &self.locks);
        let result = pipeline.run(job, &handler, job.timeout_duration()).await;

        match result {
            Ok(()) => {
                self.complete(reserved, started.elapsed()).await;
                Outcome::Succeeded
            }
            Err(error) => self.handle_error(reserved, &handler, error).await,
        }
    }

    async fn complete(&self, reserved: &ReservedJob, duration: Duration) {
        if let Err(e) = self.backend.ack(reserved).await {
            error!(job_id = %reserved.job.id, error = %e, "Failed to acknowledge processed job");
        }
        info!(
            job_id = %reserved.job.id,
            job_type = %reserved.job.job_type,
            queue = %reserved.queue,
            attempts = reserved.job.attempts(),
            duration_ms = duration.as_millis() as u64,
            "Job processed"
        );
        self.events.dispatch(&JobEvent::JobProcessed {
            connection: reserved.connection.clone(),
            queue: reserved.queue.clone(),
            job_id: reserved.job.id.clone(),
            job_type: reserved.job.job_type.clone(),
            duration,
        });
    }

    async fn handle_error(
        &self,
        reserved: &mut ReservedJob,
        handler: &Arc<dyn JobHandler>,
        error: JobError,
    ) -> Outcome {
        match error.kind() {
            FailureKind::Control => {
                reserved.job.decrement_attempts();
                let delay = match &error {
                    JobError::AlreadyRunning { retry_after, .. } if retry_after.is_zero() => {
                        self.options.overlap_release_after
                    }
                    other => other.retry_after().unwrap_or_default(),
                };
                info!(
                    job_id = %reserved.job.id,
                    queue = %reserved.queue,
                    reason = error.class(),
                    delay_secs = delay.as_secs(),
                    "Job released without consuming an attempt"
                );
                if let Err(e) = self.backend.release(reserved, delay).await {
                    error!(job_id = %reserved.job.id, error = %e, "Failed to release job");
                }
                self.metrics.job_released(&reserved.queue, &reserved.job.job_type);
                self.events.dispatch(&JobEvent::JobReleased {
                    connection: reserved.connection.clone(),
                    job_id: reserved.job.id.clone(),
                    delay,
                });
                Outcome::Released
            }
            FailureKind::Timeout => {
                let timeout = match &error {
                    JobError::TimedOut(timeout) => *timeout,
                    _ => Duration::ZERO,
                };
                warn!(
                    job_id = %reserved.job.id,
                    queue = %reserved.queue,
                    attempts = reserved.job.attempts(),
                    timeout_secs = timeout.as_secs(),
                    "Job timed out"
                );
                handler.on_timeout(&reserved.job).await;
                self.metrics.job_timed_out(&reserved.queue, &reserved.job.job_type);
                self.events.dispatch(&JobEvent::JobTimedOut {
                    connection: reserved.connection.clone(),
                    job_id: reserved.job.id.clone(),
                    timeout,
                });
                self.retry_or_fail(reserved, handler, error).await
            }
            FailureKind::Failure => self.retry_or_fail(reserved, handler, error).await,
        }
    }

    async fn retry_or_fail(
        &self,
        reserved: &mut ReservedJob,
        handler: &Arc<dyn JobHandler>,
        error: JobError,
    ) -> Outcome {
        self.events.dispatch(&JobEvent::JobExceptionOccurred {
            connection: reserved.connection.clone(),
            job_id: reserved.job.id.clone(),
            error: error.to_string(),
        });

        if error.is_fatal() || !reserved.job.has_attempts_left() {
            self.fail(reserved, Some(handler), error).await;
            return Outcome::Failed;
        }

        let delay = Duration::from_secs(reserved.job.backoff_delay());
        info!(
            job_id = %reserved.job.id,
            queue = %reserved.queue,
            attempts = reserved.job.attempts(),
            max_attempts = reserved.job.max_attempts(),
            delay_secs = delay.as_secs(),
            error = %error,
            "Job failed, retry scheduled"
        );
        if let Err(e) = self.backend.release(reserved, delay).await {
            error!(job_id = %reserved.job.id, error = %e, "Failed to schedule retry");
        }
        self.metrics.job_retried(&reserved.queue, &reserved.job.job_type);
        self.events.dispatch(&JobEvent::JobRetrying {
            connection: reserved.connection.clone(),
            job_id: reserved.job.id.clone(),
            attempt: reserved.job.attempts(),
            delay,
        });
        Outcome::Retried
    }

    /// Store the job as failed, run the failure hook once and drop its
    /// unique lock.
    async fn fail(&self, reserved: &ReservedJob, handler: Option<&Arc<dyn JobHandler>>, error: JobError) {
        error!(
            job_id = %reserved.job.id,
            job_type = %reserved.job.job_type,
            queue = %reserved.queue,
            attempts = reserved.job.attempts(),
            error = %error,
            "Job permanently failed"
        );
        if let Err(e) = self.backend.store_failed(reserved, &error).await {
            error!(job_id = %reserved.job.id, error = %e, "Failed to store failed job");
        }
        if let Some(handler) = handler {
            handler.on_failure(&reserved.job, &error).await;
        }
        if let Err(e) = unique::release(self.locks.as_ref(), &reserved.job).await {
            warn!(job_id = %reserved.job.id, error = %e, "Failed to release unique lock");
        }
        self.metrics
            .job_failed(&reserved.queue, &reserved.job.job_type, error.class());
        self.events.dispatch(&JobEvent::JobFailed {
            connection: reserved.connection.clone(),
            queue: reserved.queue.clone(),
            job_id: reserved.job.id.clone(),
            job_type: reserved.job.job_type.clone(),
            error: error.to_string(),
        });
    }
}

/// Resident set size of this process in bytes, 0 when unknown.
#[cfg(target_os = "linux")]
pub fn resident_memory_bytes() -> u64 {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| parse_vm_rss(&status))
        .unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
pub fn resident_memory_bytes() -> u64 {
    0
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_vm_rss() {
        let status = "Name:\tqueue-worker\nVmPeak:\t  20000 kB\nVmRSS:\t   5120 kB\nThreads:\t4\n";
        assert_eq!(parse_vm_rss(status), Some(5 * 1024 * 1024));
        assert_eq!(parse_vm_rss("Name:\tx\n"), None);
    }

    #[test]
    fn test_handle_controls_state() {
        let worker = Worker::new(
            Arc::new(crate::backend::MemoryQueue::new()),
            HandlerRegistry::new(),
            WorkerOptions::default(),
        );
        let handle = worker.handle();
        handle.pause();
        assert!(handle.is_paused());
        handle.resume();
        assert!(!handle.is_paused());
        handle.stop();
        assert!(worker.handle().is_stopping());
    }
}
