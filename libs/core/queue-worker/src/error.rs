//! Queue and job error types
//!
//! Errors are split along the line the worker cares about:
//! - **QueueError**: backend or transport failures. Connection-loss errors are
//!   retried once after reconnecting, everything else propagates.
//! - **JobError**: raised by a job body or its middleware. Its [`FailureKind`]
//!   decides whether the worker retries, releases, or fails the job.

use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;
use std::panic::Location;
use std::time::Duration;
use thiserror::Error;
use tracing_error::{SpanTrace, SpanTraceStatus};

/// Substrings that identify a dropped connection across drivers.
const LOST_CONNECTION_PATTERNS: &[&str] = &[
    "server has gone away",
    "no connection to the server",
    "lost connection",
    "is dead or not enabled",
    "error while sending",
    "decryption failed or bad record mac",
    "server closed the connection unexpectedly",
    "ssl connection has been closed unexpectedly",
    "error writing data to the connection",
    "resource deadlock avoided",
    "child connection forced to terminate",
    "broken pipe",
    "connection reset",
    "connection refused",
    "connection closed",
    "connection aborted",
    "channel closed",
    "invalid channel state",
    "invalid connection state",
    "missed heartbeats",
    "socket closed",
    "unexpected end of file",
];

/// Returns true when an error message looks like a lost connection.
pub fn is_lost_connection_message(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    LOST_CONNECTION_PATTERNS
        .iter()
        .any(|pattern| message.contains(pattern))
}

/// Backend and transport errors
#[derive(Error, Debug)]
pub enum QueueError {
    /// Redis connection or command error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Relational database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// AMQP broker error
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    /// JetStream or other broker error
    #[error("Broker error: {0}")]
    Broker(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Payload could not be decoded into a job envelope
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Connection dropped mid-operation
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Too many deliveries awaiting confirmation
    #[error("Broker overloaded: {pending} deliveries unconfirmed after {waited:?}")]
    Overloaded { pending: usize, waited: Duration },

    /// Broker reports the queue or topic does not exist (after retries)
    #[error("Temporarily unavailable: {0}")]
    TemporarilyUnavailable(String),

    /// Broker rejected or never confirmed a publish
    #[error("Delivery not confirmed: {0}")]
    DeliveryFailed(String),

    /// No backend registered under this name
    #[error("Unknown queue connection: {0}")]
    UnknownConnection(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl QueueError {
    /// Whether the error indicates the underlying connection was lost.
    ///
    /// Backends reconnect and retry the operation exactly once when this
    /// returns true.
    pub fn is_connection_error(&self) -> bool {
        match self {
            QueueError::Redis(e) => {
                e.is_io_error()
                    || e.is_connection_dropped()
                    || e.is_connection_refusal()
                    || is_lost_connection_message(&e.to_string())
            }
            QueueError::Database(e) => match e {
                sqlx::Error::Io(_) | sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => true,
                other => is_lost_connection_message(&other.to_string()),
            },
            QueueError::Amqp(e) => {
                matches!(e, lapin::Error::IOError(_))
                    || is_lost_connection_message(&e.to_string())
            }
            QueueError::ConnectionLost(_) => true,
            QueueError::Broker(message) => is_lost_connection_message(message),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Serialization(err.to_string())
    }
}

/// How the worker treats a failed execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The job body failed. Consumes an attempt.
    Failure,
    /// The job body ran past its timeout. Consumes an attempt.
    Timeout,
    /// Not the job's fault (rate limited, already running elsewhere).
    /// The job is released without consuming an attempt.
    Control,
}

/// Stack and span trace at the caller, resolved to text.
///
/// The backtrace is captured whatever `RUST_BACKTRACE` says. The span trace
/// is appended when an `ErrorLayer` is installed and a span is active.
pub(crate) fn capture_trace() -> String {
    render_trace(&Backtrace::force_capture(), &SpanTrace::capture())
}

fn render_trace(backtrace: &Backtrace, spans: &SpanTrace) -> String {
    if spans.status() == SpanTraceStatus::CAPTURED {
        format!("{backtrace}\nspan trace:\n{spans}")
    } else {
        backtrace.to_string()
    }
}

/// A business failure raised by a job body.
///
/// Captures the call site and stack so failed-job records can show where
/// the error was raised. Symbols are only resolved when [`Failure::trace`]
/// is read.
pub struct Failure {
    pub class: String,
    pub message: String,
    pub code: i64,
    pub file: &'static str,
    pub line: u32,
    backtrace: Backtrace,
    spans: SpanTrace,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl Failure {
    #[track_caller]
    fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        let location = Location::caller();
        Self {
            class: class.into(),
            message: message.into(),
            code: 0,
            file: location.file(),
            line: location.line(),
            backtrace: Backtrace::force_capture(),
            spans: SpanTrace::capture(),
            source: None,
        }
    }

    pub fn trace(&self) -> String {
        render_trace(&self.backtrace, &self.spans)
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Failure")
            .field("class", &self.class)
            .field("message", &self.message)
            .field("code", &self.code)
            .field("file", &self.file)
            .field("line", &self.line)
            .field("source", &self.source)
            .finish()
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl StdError for Failure {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

/// Errors raised while executing a job
#[derive(Error, Debug)]
pub enum JobError {
    /// The job body reported a failure
    #[error(transparent)]
    Failed(Box<Failure>),

    /// The job body exceeded its timeout and was aborted
    #[error("Job timed out after {0:?}")]
    TimedOut(Duration),

    /// A rate limiter refused the execution
    #[error("Rate limit exceeded for '{key}', retry after {retry_after:?}")]
    RateLimited { key: String, retry_after: Duration },

    /// Another worker holds the overlap lock for this job
    #[error("Job is already running under lock '{key}'")]
    AlreadyRunning { key: String, retry_after: Duration },

    /// The payload could not be decoded, or no handler is registered
    #[error("Invalid job payload: {0}")]
    InvalidPayload(String),

    /// The job body panicked
    #[error("Job panicked: {0}")]
    Panicked(String),

    /// The job was already reserved as many times as it may be attempted
    #[error("Job has been attempted too many times ({attempts})")]
    MaxAttemptsExceeded { attempts: u32 },
}

impl JobError {
    /// A plain business failure raised at the caller's location.
    #[track_caller]
    pub fn failed(message: impl Into<String>) -> Self {
        JobError::Failed(Box::new(Failure::new("JobFailure", message)))
    }

    /// Wrap any error as a business failure, keeping it as the source.
    #[track_caller]
    pub fn from_error<E>(class: impl Into<String>, err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        let mut failure = Failure::new(class, err.to_string());
        failure.source = Some(Box::new(err));
        JobError::Failed(Box::new(failure))
    }

    /// Attach an application error code to a business failure.
    pub fn with_code(mut self, code: i64) -> Self {
        if let JobError::Failed(failure) = &mut self {
            failure.code = code;
        }
        self
    }

    /// How the worker should treat this error.
    pub fn kind(&self) -> FailureKind {
        match self {
            JobError::TimedOut(_) => FailureKind::Timeout,
            JobError::RateLimited { .. } | JobError::AlreadyRunning { .. } => FailureKind::Control,
            _ => FailureKind::Failure,
        }
    }

    /// Delay to wait before the job is released, for control errors.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            JobError::RateLimited { retry_after, .. }
            | JobError::AlreadyRunning { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Whether the job should be failed without further attempts.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            JobError::InvalidPayload(_) | JobError::MaxAttemptsExceeded { .. }
        )
    }

    /// Short class name used in failed-job records and metrics labels.
    pub fn class(&self) -> &str {
        match self {
            JobError::Failed(failure) => &failure.class,
            JobError::TimedOut(_) => "TimedOut",
            JobError::RateLimited { .. } => "RateLimited",
            JobError::AlreadyRunning { .. } => "AlreadyRunning",
            JobError::InvalidPayload(_) => "InvalidPayload",
            JobError::Panicked(_) => "Panicked",
            JobError::MaxAttemptsExceeded { .. } => "MaxAttemptsExceeded",
        }
    }
}

impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        JobError::InvalidPayload(err.to_string())
    }
}

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kind_classification() {
        assert_eq!(JobError::failed("boom").kind(), FailureKind::Failure);
        assert_eq!(
            JobError::TimedOut(Duration::from_secs(1)).kind(),
            FailureKind::Timeout
        );
        assert_eq!(
            JobError::RateLimited {
                key: "api".into(),
                retry_after: Duration::from_secs(5)
            }
            .kind(),
            FailureKind::Control
        );
        assert_eq!(
            JobError::AlreadyRunning {
                key: "lock".into(),
                retry_after: Duration::from_secs(2)
            }
            .kind(),
            FailureKind::Control
        );
    }

    #[test]
    fn test_retry_after_only_for_control_errors() {
        let err = JobError::RateLimited {
            key: "api".into(),
            retry_after: Duration::from_secs(7),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
        assert_eq!(JobError::failed("nope").retry_after(), None);
    }

    #[test]
    fn test_failed_captures_call_site() {
        let err = JobError::failed("boom");
        match err {
            JobError::Failed(failure) => {
                assert!(failure.file.ends_with("error.rs"));
                assert!(failure.line > 0);
                assert_eq!(failure.class, "JobFailure");
                assert!(failure.trace().contains("Failure::new"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_capture_trace_ignores_backtrace_env() {
        temp_env::with_var("RUST_BACKTRACE", Some("0"), || {
            let trace = capture_trace();
            assert!(trace.contains("capture_trace"), "{trace}");
            assert!(!trace.contains("disabled backtrace"));
        });
    }

    #[test]
    fn test_span_trace_is_appended_inside_a_span() {
        use tracing_subscriber::layer::SubscriberExt;

        let subscriber = tracing_subscriber::registry().with(tracing_error::ErrorLayer::default());
        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("render_report", report_id = 7);
            let _entered = span.enter();
            let trace = capture_trace();
            assert!(trace.contains("span trace:"));
            assert!(trace.contains("render_report"));
        });
    }

    #[test]
    fn test_from_error_keeps_source_chain() {
        let io = std::io::Error::other("disk full");
        let err = JobError::from_error("StorageError", io).with_code(28);

        assert_eq!(err.to_string(), "disk full");
        assert_eq!(err.class(), "StorageError");
        let source = err.source().expect("source is kept");
        assert_eq!(source.to_string(), "disk full");
        if let JobError::Failed(failure) = &err {
            assert_eq!(failure.code, 28);
        }
    }

    #[test]
    fn test_lost_connection_messages() {
        assert!(is_lost_connection_message("Broken pipe (os error 32)"));
        assert!(is_lost_connection_message(
            "invalid channel state: Closed"
        ));
        assert!(is_lost_connection_message("SERVER HAS GONE AWAY"));
        assert!(!is_lost_connection_message("syntax error at or near"));
    }

    #[test]
    fn test_connection_error_detection() {
        assert!(QueueError::ConnectionLost("reset".into()).is_connection_error());
        assert!(QueueError::Broker("connection reset by peer".into()).is_connection_error());
        assert!(!QueueError::InvalidPayload("bad".into()).is_connection_error());
        assert!(!QueueError::Database(sqlx::Error::RowNotFound).is_connection_error());
    }
}
