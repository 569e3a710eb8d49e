//! JetStream pull consumer with error classification

use crate::error::QueueError;
use crate::resilience::{CircuitBreaker, CircuitBreakerConfig};
use async_nats::jetstream::consumer::pull::Config as PullConfig;
use async_nats::jetstream::consumer::{AckPolicy, PullConsumer};
use async_nats::jetstream::stream::Config as StreamConfig;
use async_nats::jetstream::{Context, Message};
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// How a failed poll is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeErrorKind {
    /// Nothing left to read; benign
    NoMessages,
    /// The fetch expired; benign
    TimedOut,
    /// Stream or consumer missing; retried with backoff
    UnknownTopic,
    Other,
}

/// Classify a broker error message.
pub fn classify(message: &str) -> ConsumeErrorKind {
    let message = message.to_lowercase();
    if message.contains("no messages") || message.contains("404") {
        ConsumeErrorKind::NoMessages
    } else if message.contains("timed out") || message.contains("timeout") || message.contains("408") {
        ConsumeErrorKind::TimedOut
    } else if message.contains("stream not found")
        || message.contains("consumer not found")
        || message.contains("consumer deleted")
        || message.contains("no responders")
    {
        ConsumeErrorKind::UnknownTopic
    } else {
        ConsumeErrorKind::Other
    }
}

/// Consumer tuning
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    /// Redelivery window for unacknowledged messages (the lease)
    pub ack_wait: Duration,
    /// Retries while the stream or consumer is missing
    pub unknown_topic_retries: u32,
    /// First backoff step for a missing stream, doubled per retry
    pub unknown_topic_backoff: Duration,
    pub breaker: CircuitBreakerConfig,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            ack_wait: Duration::from_secs(3600),
            unknown_topic_retries: 5,
            unknown_topic_backoff: Duration::from_millis(100),
            breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Durable consumer names may not contain subject tokens.
fn durable_name(queue: &str) -> String {
    let sanitized: String = queue
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("{sanitized}_workers")
}

/// One durable pull consumer per queue, created on demand
pub struct JetStreamConsumer {
    context: Context,
    stream: String,
    prefix: String,
    settings: ConsumerSettings,
    consumers: Mutex<HashMap<String, PullConsumer>>,
    breaker: CircuitBreaker,
}

impl JetStreamConsumer {
    pub fn new(
        context: Context,
        stream: impl Into<String>,
        prefix: impl Into<String>,
        settings: ConsumerSettings,
    ) -> Self {
        let breaker = CircuitBreaker::new(settings.breaker.clone());
        Self {
            context,
            stream: stream.into(),
            prefix: prefix.into(),
            settings,
            consumers: Mutex::new(HashMap::new()),
            breaker,
        }
    }

    pub fn subject(&self, queue: &str) -> String {
        format!("{}.{}", self.prefix, queue)
    }

    pub fn stream_name(&self) -> &str {
        &self.stream
    }

    /// Create the stream covering every queue subject if it is missing.
    pub async fn ensure_stream(&self) -> Result<(), QueueError> {
        if self.context.get_stream(&self.stream).await.is_ok() {
            debug!(stream = %self.stream, "Stream already exists");
            return Ok(());
        }

        info!(stream = %self.stream, prefix = %self.prefix, "Creating stream");
        self.context
            .create_stream(StreamConfig {
                name: self.stream.clone(),
                subjects: vec![format!("{}.>", self.prefix)],
                ..Default::default()
            })
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?;
        Ok(())
    }

    /// Durable consumer for `queue`, created on first use.
    pub async fn consumer(&self, queue: &str) -> Result<PullConsumer, QueueError> {
        let mut consumers = self.consumers.lock().await;
        if let Some(consumer) = consumers.get(queue) {
            return Ok(consumer.clone());
        }

        let stream = self
            .context
            .get_stream(&self.stream)
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?;
        let name = durable_name(queue);
        let consumer = match stream.get_consumer::<PullConfig>(&name).await {
            Ok(consumer) => consumer,
            Err(_) => {
                info!(consumer = %name, stream = %self.stream, "Creating consumer");
                stream
                    .create_consumer(PullConfig {
                        durable_name: Some(name.clone()),
                        name: Some(name.clone()),
                        ack_policy: AckPolicy::Explicit,
                        ack_wait: self.settings.ack_wait,
                        filter_subject: self.subject(queue),
                        ..Default::default()
                    })
                    .await
                    .map_err(|e| QueueError::Broker(e.to_string()))?
            }
        };
        consumers.insert(queue.to_string(), consumer.clone());
        Ok(consumer)
    }

    async fn forget_consumer(&self, queue: &str) {
        self.consumers.lock().await.remove(queue);
    }

    async fn fetch_one(&self, queue: &str, wait: Duration) -> Result<Option<Message>, String> {
        let consumer = self.consumer(queue).await.map_err(|e| e.to_string())?;
        let mut messages = consumer
            .fetch()
            .max_messages(1)
            .expires(wait)
            .messages()
            .await
            .map_err(|e| e.to_string())?;
        match messages.next().await {
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(e)) => Err(e.to_string()),
            None => Ok(None),
        }
    }

    /// Wait up to `wait` for one message on `queue`.
    ///
    /// A missing stream or consumer is recreated with exponential backoff;
    /// once the retries run out the queue is reported temporarily
    /// unavailable. Repeated other errors open the circuit, which makes the
    /// next poll sit out the open window.
    pub async fn poll(&self, queue: &str, wait: Duration) -> Result<Option<Message>, QueueError> {
        let mut retries = 0u32;
        loop {
            let error = match self.fetch_one(queue, wait).await {
                Ok(message) => {
                    self.breaker.record_success();
                    return Ok(message);
                }
                Err(error) => error,
            };

            match classify(&error) {
                ConsumeErrorKind::NoMessages | ConsumeErrorKind::TimedOut => {
                    self.breaker.record_success();
                    return Ok(None);
                }
                ConsumeErrorKind::UnknownTopic => {
                    if retries >= self.settings.unknown_topic_retries {
                        error!(queue, retries, error = %error, "Queue stream unavailable");
                        return Err(QueueError::TemporarilyUnavailable(format!(
                            "{} after {} retries: {}",
                            self.subject(queue),
                            retries,
                            error
                        )));
                    }
                    let delay = self.settings.unknown_topic_backoff * 2u32.saturating_pow(retries);
                    retries += 1;
                    warn!(queue, retry = retries, delay_ms = delay.as_millis() as u64, error = %error, "Stream or consumer missing, retrying");
                    self.forget_consumer(queue).await;
                    tokio::time::sleep(delay).await;
                    if let Err(e) = self.ensure_stream().await {
                        warn!(error = %e, "Could not recreate stream");
                    }
                }
                ConsumeErrorKind::Other => {
                    self.breaker.record_failure();
                    sit_out_open_circuit(&self.breaker, queue).await;
                    return Err(QueueError::Broker(error));
                }
            }
        }
    }

    /// Messages not yet acknowledged on `queue`, delivered or not.
    pub async fn pending(&self, queue: &str) -> Result<u64, QueueError> {
        let mut consumer = self.consumer(queue).await?;
        let info = consumer
            .info()
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?;
        Ok(info.num_pending + info.num_ack_pending as u64)
    }

    /// Purge every message stored for `queue`.
    pub async fn purge(&self, queue: &str) -> Result<u64, QueueError> {
        let stream = self
            .context
            .get_stream(&self.stream)
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?;
        let response = stream
            .purge()
            .filter(self.subject(queue))
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?;
        Ok(response.purged)
    }
}

/// Sleep through an open circuit's window, leaving it half-open so the next
/// poll is a trial call. A closed or half-open circuit returns at once.
async fn sit_out_open_circuit(breaker: &CircuitBreaker, queue: &str) {
    if breaker.can_execute() {
        return;
    }
    let pause = breaker.remaining_open();
    error!(
        queue,
        failures = breaker.failure_count(),
        pause_ms = pause.as_millis() as u64,
        "Too many consecutive consume errors, pausing"
    );
    tokio::time::sleep(pause).await;
    let state = breaker.state();
    debug!(queue, ?state, "Consume circuit window elapsed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::CircuitState;

    fn tripped_breaker() -> CircuitBreaker {
        let breaker = CircuitBreaker::new(
            CircuitBreakerConfig::default()
                .with_failure_threshold(2)
                .with_success_threshold(2)
                .with_open_for(Duration::from_secs(5)),
        );
        breaker.record_failure();
        breaker.record_failure();
        breaker
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_pauses_then_goes_half_open() {
        let breaker = tripped_breaker();
        assert_eq!(breaker.state(), CircuitState::Open);

        let started = tokio::time::Instant::now();
        sit_out_open_circuit(&breaker, "emails").await;

        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens_the_circuit() {
        let breaker = tripped_breaker();
        sit_out_open_circuit(&breaker, "emails").await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.remaining_open(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_circuit_does_not_pause() {
        let breaker = CircuitBreaker::default();
        breaker.record_failure();
        let started = tokio::time::Instant::now();
        sit_out_open_circuit(&breaker, "emails").await;
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_classify_broker_errors() {
        assert_eq!(classify("no messages"), ConsumeErrorKind::NoMessages);
        assert_eq!(classify("request timed out"), ConsumeErrorKind::TimedOut);
        assert_eq!(classify("stream not found"), ConsumeErrorKind::UnknownTopic);
        assert_eq!(classify("no responders"), ConsumeErrorKind::UnknownTopic);
        assert_eq!(classify("permissions violation"), ConsumeErrorKind::Other);
    }

    #[test]
    fn test_durable_name_strips_subject_tokens() {
        assert_eq!(durable_name("emails"), "emails_workers");
        assert_eq!(durable_name("reports.daily"), "reports_daily_workers");
        assert_eq!(durable_name("a*b>"), "a_b__workers");
    }
}
