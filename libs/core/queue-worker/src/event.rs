//! Job lifecycle events
//!
//! Emitted by the worker and dispatcher at each transition. Sinks are
//! fire-and-forget: a sink can never fail the job that produced the event.

use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Why a worker stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Stop requested by signal or handle
    Signal,
    MaxJobs,
    MaxTime,
    Memory,
    /// Queues drained with stop-when-empty set
    Empty,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Signal => "signal",
            StopReason::MaxJobs => "max_jobs",
            StopReason::MaxTime => "max_time",
            StopReason::Memory => "memory",
            StopReason::Empty => "empty",
        }
    }
}

/// Lifecycle events
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    JobQueued {
        connection: String,
        queue: String,
        job_id: String,
        job_type: String,
    },
    JobProcessing {
        connection: String,
        queue: String,
        job_id: String,
        job_type: String,
        attempt: u32,
    },
    JobProcessed {
        connection: String,
        queue: String,
        job_id: String,
        job_type: String,
        duration: Duration,
    },
    JobExceptionOccurred {
        connection: String,
        job_id: String,
        error: String,
    },
    JobRetrying {
        connection: String,
        job_id: String,
        attempt: u32,
        delay: Duration,
    },
    /// Released without consuming an attempt
    JobReleased {
        connection: String,
        job_id: String,
        delay: Duration,
    },
    JobTimedOut {
        connection: String,
        job_id: String,
        timeout: Duration,
    },
    JobFailed {
        connection: String,
        queue: String,
        job_id: String,
        job_type: String,
        error: String,
    },
    WorkerStopping {
        worker: String,
        reason: StopReason,
    },
}

impl JobEvent {
    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::JobQueued { .. } => "job_queued",
            JobEvent::JobProcessing { .. } => "job_processing",
            JobEvent::JobProcessed { .. } => "job_processed",
            JobEvent::JobExceptionOccurred { .. } => "job_exception_occurred",
            JobEvent::JobRetrying { .. } => "job_retrying",
            JobEvent::JobReleased { .. } => "job_released",
            JobEvent::JobTimedOut { .. } => "job_timed_out",
            JobEvent::JobFailed { .. } => "job_failed",
            JobEvent::WorkerStopping { .. } => "worker_stopping",
        }
    }
}

/// Receives lifecycle events
pub trait EventSink: Send + Sync {
    fn dispatch(&self, event: &JobEvent);
}

/// Writes events as structured log lines
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn dispatch(&self, event: &JobEvent) {
        match event {
            JobEvent::JobFailed { job_id, error, .. } => {
                warn!(event = event.name(), job_id = %job_id, error = %error, "Job event");
            }
            JobEvent::WorkerStopping { worker, reason } => {
                info!(event = event.name(), worker = %worker, reason = reason.as_str(), "Worker event");
            }
            other => debug!(event = other.name(), details = ?other, "Job event"),
        }
    }
}

/// Fans events out to any number of async subscribers
#[derive(Debug, Clone)]
pub struct BroadcastEventSink {
    sender: broadcast::Sender<JobEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

impl EventSink for BroadcastEventSink {
    fn dispatch(&self, event: &JobEvent) {
        // no subscribers is not an error
        let _ = self.sender.send(event.clone());
    }
}

/// Sends every event to several sinks
#[derive(Default)]
pub struct FanoutEventSink {
    sinks: Vec<std::sync::Arc<dyn EventSink>>,
}

impl FanoutEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: std::sync::Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutEventSink {
    fn dispatch(&self, event: &JobEvent) {
        for sink in &self.sinks {
            sink.dispatch(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_broadcast_delivers_to_subscribers() {
        let sink = BroadcastEventSink::new(16);
        let mut rx = sink.subscribe();
        sink.dispatch(&JobEvent::JobReleased {
            connection: "memory".into(),
            job_id: "j1".into(),
            delay: Duration::from_secs(3),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "job_released");
    }

    #[test]
    fn test_dispatch_without_subscribers_is_silent() {
        let sink = BroadcastEventSink::new(4);
        sink.dispatch(&JobEvent::WorkerStopping {
            worker: "w".into(),
            reason: StopReason::Signal,
        });
    }

    #[tokio::test]
    async fn test_fanout_reaches_every_sink() {
        let first = BroadcastEventSink::new(4);
        let second = BroadcastEventSink::new(4);
        let mut rx1 = first.subscribe();
        let mut rx2 = second.subscribe();
        let fanout = FanoutEventSink::new()
            .with(Arc::new(first))
            .with(Arc::new(TracingEventSink))
            .with(Arc::new(second));

        fanout.dispatch(&JobEvent::JobTimedOut {
            connection: "memory".into(),
            job_id: "j1".into(),
            timeout: Duration::from_secs(1),
        });

        assert_eq!(rx1.recv().await.unwrap().name(), "job_timed_out");
        assert_eq!(rx2.recv().await.unwrap().name(), "job_timed_out");
    }
}
