//! Queue Worker Framework
//!
//! Deferred jobs on interchangeable backends, executed by a worker runtime.
//!
//! ## Features
//!
//! - **Backends**: in-memory, relational (SQLite/PostgreSQL through `sqlx`),
//!   Redis, AMQP and NATS JetStream behind one [`QueueBackend`] trait
//! - **Exclusive claims**: a popped job is reserved for exactly one worker
//! - **Retries**: per-job attempts, fixed delay or backoff strategy
//! - **Middleware**: unique jobs, overlap prevention, rate limiting
//! - **Failed jobs**: stored with the full error chain, retryable
//! - **Observability**: structured logs, lifecycle events, Prometheus
//!   metrics and health endpoints
//!
//! ## Example
//!
//! ```ignore
//! use queue_worker::{HandlerRegistry, Job, JobPayload, MemoryQueue, Worker, WorkerOptions, handler_fn};
//!
//! #[derive(Serialize, Deserialize)]
//! struct SendEmail { to: String }
//!
//! impl JobPayload for SendEmail {
//!     const JOB_TYPE: &'static str = "send_email";
//! }
//!
//! let backend = Arc::new(MemoryQueue::new());
//! backend.push(&Job::new(&SendEmail { to: "a@example.com".into() })?.tries(3), None).await?;
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register_payload::<SendEmail>(handler_fn(|email: SendEmail| async move {
//!     send(email).await.map_err(|e| JobError::from_error("SmtpError", e))
//! }));
//!
//! let worker = Worker::new(backend, registry, WorkerOptions::default());
//! let reason = worker.run().await;
//! ```

pub mod backend;
mod backoff;
pub mod broker;
mod cancel;
mod config;
mod error;
mod event;
mod failed;
pub mod health;
mod job;
mod lock;
mod manager;
pub mod metrics;
pub mod middleware;
mod registry;
pub mod resilience;
pub mod time;
mod worker;

pub use backend::{
    AmqpConfig, AmqpQueue, DatabaseConfig, DatabaseFailedJobStore, DatabaseQueue, DbKind, LockStrategy, MemoryQueue,
    QueueBackend, Receipt, RedisQueue, RedisQueueConfig, ReservedJob,
};
pub use backoff::Backoff;
pub use broker::{BrokerPool, JetStreamConfig, JetStreamQueue};
pub use cancel::CancellationRegistry;
pub use config::{LockStoreConfig, QueueConnectionConfig, WorkerOptions};
pub use error::{Failure, FailureKind, JobError, QueueError, QueueResult};
pub use event::{BroadcastEventSink, EventSink, FanoutEventSink, JobEvent, StopReason, TracingEventSink};
pub use failed::{
    ExceptionFrame, FailedJob, FailedJobStore, MemoryFailedJobStore, RedisFailedJobStore,
};
pub use health::{HealthState, router as health_router};
pub use job::{ENVELOPE_VERSION, Job, JobPayload};
pub use lock::{LockStore, MemoryLockStore, RedisLockStore};
pub use manager::QueueManager;
pub use metrics::{QueueMetrics, init_metrics};
pub use middleware::{Middleware, MiddlewareSpec, Next, Pipeline};
pub use registry::{FnHandler, HandlerRegistry, JobHandler, handler_fn};
pub use worker::{Worker, WorkerHandle};
