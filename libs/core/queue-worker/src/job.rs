//! Job envelope
//!
//! Every backend stores the same JSON envelope. Decoding is strict: unknown
//! fields and unsupported envelope versions are rejected, and the job type
//! is only turned into behaviour through a [`HandlerRegistry`] lookup.
//!
//! [`HandlerRegistry`]: crate::registry::HandlerRegistry

use crate::backoff::Backoff;
use crate::error::{JobError, QueueError};
use crate::middleware::MiddlewareSpec;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Current envelope version
pub const ENVELOPE_VERSION: u32 = 1;

/// Typed payload carried by a job.
///
/// `JOB_TYPE` is the registry key the worker uses to find the handler.
pub trait JobPayload: Serialize + DeserializeOwned + Send + Sync {
    const JOB_TYPE: &'static str;
}

/// A unit of deferred work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Job {
    pub version: u32,
    pub id: String,
    pub job_type: String,
    /// Serialized ahead of `payload`; the Redis pop script relies on it.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub queue: Option<String>,
    pub payload: serde_json::Value,
    /// `None` means the worker default applies; `Some(0)` means unlimited.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Fixed retry delay in seconds; takes precedence over `backoff`.
    #[serde(default)]
    pub retry_after: Option<u64>,
    #[serde(default)]
    pub backoff: Option<Backoff>,
    /// Execution timeout in seconds; `Some(0)` disables it.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub priority: i32,
    /// Initial dispatch delay in seconds.
    #[serde(default)]
    pub delay: u64,
    #[serde(default)]
    pub unique_id: Option<String>,
    #[serde(default)]
    pub unique_for: u64,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub track_progress: bool,
    #[serde(default)]
    pub middleware: Vec<MiddlewareSpec>,
    pub created_at: i64,
}

impl Job {
    /// Wrap a typed payload in a fresh envelope.
    pub fn new<T: JobPayload>(payload: &T) -> Result<Self, QueueError> {
        Ok(Self::raw(T::JOB_TYPE, serde_json::to_value(payload)?))
    }

    /// Build an envelope from an already-serialized payload.
    pub fn raw(job_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            id: uuid::Uuid::now_v7().to_string(),
            job_type: job_type.into(),
            queue: None,
            payload,
            attempts: 0,
            max_attempts: None,
            retry_after: None,
            backoff: None,
            timeout: None,
            priority: 0,
            delay: 0,
            unique_id: None,
            unique_for: 0,
            tags: BTreeSet::new(),
            track_progress: false,
            middleware: Vec::new(),
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn tries(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn retry_after(mut self, secs: u64) -> Self {
        self.retry_after = Some(secs);
        self
    }

    pub fn delay(mut self, secs: u64) -> Self {
        self.delay = secs;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Only one job with this id may be pending or running for `unique_for` seconds.
    pub fn unique(mut self, unique_id: impl Into<String>, unique_for: u64) -> Self {
        self.unique_id = Some(unique_id.into());
        self.unique_for = unique_for;
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn track_progress(mut self) -> Self {
        self.track_progress = true;
        self
    }

    pub fn timeout(mut self, secs: u64) -> Self {
        self.timeout = Some(secs);
        self
    }

    pub fn through(mut self, middleware: MiddlewareSpec) -> Self {
        self.middleware.push(middleware);
        self
    }

    /// Fill unset limits from worker defaults.
    pub fn apply_defaults(&mut self, tries: u32, timeout: u64, backoff: u64) {
        if self.max_attempts.is_none() {
            self.max_attempts = Some(tries);
        }
        if self.timeout.is_none() {
            self.timeout = Some(timeout);
        }
        if self.retry_after.is_none() && self.backoff.is_none() && backoff > 0 {
            self.backoff = Some(Backoff::constant(backoff));
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn increment_attempts(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
    }

    pub fn decrement_attempts(&mut self) {
        self.attempts = self.attempts.saturating_sub(1);
    }

    /// Maximum attempts, 1 when unset. 0 means unlimited.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.unwrap_or(1)
    }

    /// Whether another attempt is allowed after the current one.
    pub fn has_attempts_left(&self) -> bool {
        let max = self.max_attempts();
        max == 0 || self.attempts < max
    }

    /// Delay in seconds before the next retry.
    ///
    /// A fixed `retry_after` wins; otherwise the backoff strategy is evaluated
    /// with the current attempt count (at least 1); otherwise zero.
    pub fn backoff_delay(&self) -> u64 {
        if let Some(secs) = self.retry_after {
            return secs;
        }
        self.backoff
            .as_ref()
            .map(|backoff| backoff.calculate(self.attempts.max(1)))
            .unwrap_or(0)
    }

    /// Execution timeout, `None` when unbounded.
    pub fn timeout_duration(&self) -> Option<Duration> {
        match self.timeout {
            Some(0) | None => None,
            Some(secs) => Some(Duration::from_secs(secs)),
        }
    }

    /// Decode the payload into its typed form.
    pub fn decode<T: JobPayload>(&self) -> Result<T, JobError> {
        if self.job_type != T::JOB_TYPE {
            return Err(JobError::InvalidPayload(format!(
                "expected job type '{}', got '{}'",
                T::JOB_TYPE,
                self.job_type
            )));
        }
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    pub fn encode(&self) -> Result<String, QueueError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Strictly decode a stored envelope.
    pub fn from_json(raw: &str) -> Result<Self, QueueError> {
        let job: Job = serde_json::from_str(raw)
            .map_err(|e| QueueError::InvalidPayload(e.to_string()))?;
        if job.version != ENVELOPE_VERSION {
            return Err(QueueError::InvalidPayload(format!(
                "unsupported envelope version {}",
                job.version
            )));
        }
        if job.job_type.is_empty() {
            return Err(QueueError::InvalidPayload("empty job type".to_string()));
        }
        Ok(job)
    }

    /// Human-readable name for logs.
    pub fn display_name(&self) -> &str {
        &self.job_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct SendInvoice {
        invoice_id: u64,
    }

    impl JobPayload for SendInvoice {
        const JOB_TYPE: &'static str = "billing.send_invoice";
    }

    #[test]
    fn test_new_wraps_payload() {
        let job = Job::new(&SendInvoice { invoice_id: 42 }).unwrap();
        assert_eq!(job.job_type, "billing.send_invoice");
        assert_eq!(job.version, ENVELOPE_VERSION);
        assert_eq!(job.attempts(), 0);
        assert_eq!(job.decode::<SendInvoice>().unwrap().invoice_id, 42);
    }

    #[test]
    fn test_strict_decoding_rejects_unknown_fields() {
        let job = Job::raw("noop", serde_json::json!({}));
        let mut value = serde_json::to_value(&job).unwrap();
        value["command"] = serde_json::json!("O:8:\"Malicious\"");
        let err = Job::from_json(&value.to_string()).unwrap_err();
        assert!(matches!(err, QueueError::InvalidPayload(_)));
    }

    #[test]
    fn test_strict_decoding_rejects_other_versions() {
        let mut job = Job::raw("noop", serde_json::json!({}));
        job.version = 2;
        let err = Job::from_json(&job.encode().unwrap()).unwrap_err();
        assert!(err.to_string().contains("version"));
    }

    #[test]
    fn test_decode_checks_job_type() {
        let job = Job::raw("other", serde_json::json!({ "invoice_id": 1 }));
        assert!(matches!(
            job.decode::<SendInvoice>(),
            Err(JobError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_retry_after_overrides_backoff() {
        let mut job = Job::raw("noop", serde_json::json!({}))
            .backoff(Backoff::exponential(2))
            .retry_after(9);
        job.increment_attempts();
        job.increment_attempts();
        assert_eq!(job.backoff_delay(), 9);
    }

    #[test]
    fn test_backoff_uses_at_least_first_attempt() {
        let job = Job::raw("noop", serde_json::json!({})).backoff(Backoff::exponential(2));
        assert_eq!(job.backoff_delay(), 2);
        assert_eq!(Job::raw("noop", serde_json::json!({})).backoff_delay(), 0);
    }

    #[test]
    fn test_attempt_bookkeeping() {
        let mut job = Job::raw("noop", serde_json::json!({})).tries(2);
        job.increment_attempts();
        assert!(job.has_attempts_left());
        job.increment_attempts();
        assert!(!job.has_attempts_left());
        job.decrement_attempts();
        assert_eq!(job.attempts(), 1);

        let mut unlimited = Job::raw("noop", serde_json::json!({})).tries(0);
        unlimited.attempts = 1000;
        assert!(unlimited.has_attempts_left());
    }

    #[test]
    fn test_apply_defaults_keeps_explicit_values() {
        let mut job = Job::raw("noop", serde_json::json!({})).tries(5).timeout(0);
        job.apply_defaults(1, 60, 3);
        assert_eq!(job.max_attempts(), 5);
        assert_eq!(job.timeout_duration(), None);
        assert_eq!(job.backoff, Some(Backoff::constant(3)));
    }
}
