//! NATS JetStream queue
//!
//! High-throughput backend: every queue is the subject `{prefix}.{queue}` on
//! one stream, consumed through a durable pull consumer with explicit acks.
//! Publishes go through [`JetStreamProducer`], so they are confirmed and
//! backpressured. Delayed jobs carry an availability header; a worker that
//! receives one early naks it with the remaining delay.
//!
//! JetStream has no priorities, so jobs on one queue come out in publish
//! order. The NATS client reconnects by itself; operations issued while it
//! is reconnecting are buffered by the client.

use super::consumer::{ConsumerSettings, JetStreamConsumer};
use super::pool::BrokerPool;
use super::producer::{JetStreamProducer, ProducerConfig};
use crate::backend::{QueueBackend, Receipt, ReservedJob, decode_or_reject, resolve_queue};
use crate::error::QueueError;
use crate::failed::{FailedJob, FailedJobStore};
use crate::job::Job;
use crate::time::{self, Clock};
use async_nats::HeaderMap;
use async_nats::jetstream::{self, AckKind, Message};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Unix timestamp (seconds) before which a message must not be processed
pub const AVAILABLE_AT_HEADER: &str = "Queue-Available-At";

/// Early or undecodable deliveries one pop skips before giving up
const MAX_SKIPPED_PER_POP: usize = 64;

#[derive(Debug, Clone)]
pub struct JetStreamConfig {
    pub connection: String,
    pub url: String,
    pub stream: String,
    /// Subject prefix; queue `q` lives on `{prefix}.{q}`
    pub prefix: String,
    pub default_queue: String,
    /// How long `pop` waits for a message before returning nothing
    pub pop_wait: Duration,
    pub producer: ProducerConfig,
    pub consumer: ConsumerSettings,
}

impl JetStreamConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            connection: "jetstream".to_string(),
            url: url.into(),
            stream: "QUEUES".to_string(),
            prefix: "queues".to_string(),
            default_queue: "default".to_string(),
            pop_wait: Duration::from_secs(1),
            producer: ProducerConfig::default(),
            consumer: ConsumerSettings::default(),
        }
    }

    pub fn with_stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = stream.into();
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_pop_wait(mut self, wait: Duration) -> Self {
        self.pop_wait = wait;
        self
    }

    pub fn with_producer(mut self, producer: ProducerConfig) -> Self {
        self.producer = producer;
        self
    }

    fn failed_subject(&self) -> String {
        format!("{}._failed", self.prefix)
    }
}

fn available_at(headers: Option<&HeaderMap>) -> Option<i64> {
    headers?
        .get(AVAILABLE_AT_HEADER)?
        .as_str()
        .parse()
        .ok()
}

/// Remaining delay of a message stamped with `available_at`, if it is early.
fn not_due_for(available_at: Option<i64>, now: i64) -> Option<Duration> {
    let wait = available_at? - now;
    (wait > 0).then(|| Duration::from_secs(wait as u64))
}

/// Queue on a JetStream stream
pub struct JetStreamQueue {
    config: JetStreamConfig,
    producer: JetStreamProducer,
    consumer: JetStreamConsumer,
    in_flight: Mutex<HashMap<String, Message>>,
    clock: Arc<dyn Clock>,
    failed: Arc<dyn FailedJobStore>,
}

impl JetStreamQueue {
    pub async fn connect(config: JetStreamConfig, pool: &BrokerPool) -> Result<Self, QueueError> {
        let client = pool.nats(&config.url).await?;
        let context = jetstream::new(client);
        let producer = JetStreamProducer::new(context.clone(), config.producer.clone());
        let consumer = JetStreamConsumer::new(
            context,
            config.stream.clone(),
            config.prefix.clone(),
            config.consumer.clone(),
        );
        consumer.ensure_stream().await?;

        let failed = Arc::new(JetStreamFailedStore {
            producer: producer.clone(),
            subject: config.failed_subject(),
        });
        info!(stream = %config.stream, "JetStream queue connected");
        Ok(Self {
            config,
            producer,
            consumer,
            in_flight: Mutex::new(HashMap::new()),
            clock: time::system(),
            failed,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_failed_store(mut self, failed: Arc<dyn FailedJobStore>) -> Self {
        self.failed = failed;
        self
    }

    pub fn producer(&self) -> &JetStreamProducer {
        &self.producer
    }

    async fn publish(&self, job: &Job, queue: &str, available_at: Option<i64>) -> Result<String, QueueError> {
        let mut headers = HeaderMap::new();
        if let Some(at) = available_at {
            headers.insert(AVAILABLE_AT_HEADER, at.to_string().as_str());
        }
        let payload = job.encode()?.into_bytes();
        self.producer
            .publish(&self.consumer.subject(queue), headers, payload)
            .await?;
        Ok(job.id.clone())
    }
}

#[async_trait]
impl QueueBackend for JetStreamQueue {
    fn name(&self) -> &str {
        &self.config.connection
    }

    fn default_queue(&self) -> &str {
        &self.config.default_queue
    }

    async fn push(&self, job: &Job, queue: Option<&str>) -> Result<String, QueueError> {
        let queue = resolve_queue(queue, Some(job), &self.config.default_queue);
        self.publish(job, queue, None).await
    }

    async fn later(&self, job: &Job, delay: Duration, queue: Option<&str>) -> Result<String, QueueError> {
        let queue = resolve_queue(queue, Some(job), &self.config.default_queue);
        let at = self.clock.now() + delay.as_secs() as i64;
        self.publish(job, queue, Some(at)).await
    }

    /// Waits up to `pop_wait` in total. Early and undecodable deliveries are
    /// settled and skipped, so one pop can look past a run of delayed
    /// messages to a ready one behind them.
    async fn pop(&self, queue: Option<&str>) -> Result<Option<ReservedJob>, QueueError> {
        let queue = resolve_queue(queue, None, &self.config.default_queue);
        let deadline = Instant::now() + self.config.pop_wait;

        for _ in 0..MAX_SKIPPED_PER_POP {
            let wait = deadline.saturating_duration_since(Instant::now());
            if wait.is_zero() {
                break;
            }
            let Some(message) = self.consumer.poll(queue, wait).await? else {
                return Ok(None);
            };

            if let Some(delay) = not_due_for(available_at(message.headers.as_ref()), self.clock.now()) {
                debug!(queue, wait_secs = delay.as_secs(), "Message not yet available, deferring");
                message
                    .ack_with(AckKind::Nak(Some(delay)))
                    .await
                    .map_err(|e| QueueError::Broker(e.to_string()))?;
                continue;
            }

            let raw = String::from_utf8_lossy(&message.payload).into_owned();
            let Some(job) =
                decode_or_reject(self.failed.as_ref(), &self.config.connection, queue, &raw).await?
            else {
                message
                    .ack()
                    .await
                    .map_err(|e| QueueError::Broker(e.to_string()))?;
                continue;
            };

            let token = match message.info() {
                Ok(info) => info.stream_sequence.to_string(),
                Err(_) => uuid::Uuid::now_v7().to_string(),
            };
            self.in_flight.lock().await.insert(token.clone(), message);
            return Ok(Some(ReservedJob {
                job,
                connection: self.config.connection.clone(),
                queue: queue.to_string(),
                raw,
                receipt: Receipt::Token(token),
            }));
        }
        Ok(None)
    }

    async fn size(&self, queue: Option<&str>) -> Result<u64, QueueError> {
        let queue = resolve_queue(queue, None, &self.config.default_queue);
        self.consumer.pending(queue).await
    }

    async fn clear(&self, queue: Option<&str>) -> Result<u64, QueueError> {
        let queue = resolve_queue(queue, None, &self.config.default_queue);
        let purged = self.consumer.purge(queue).await?;
        info!(queue, purged, "Cleared queue");
        Ok(purged)
    }

    async fn ack(&self, reserved: &ReservedJob) -> Result<(), QueueError> {
        let Receipt::Token(token) = &reserved.receipt else {
            return Ok(());
        };
        let Some(message) = self.in_flight.lock().await.remove(token) else {
            warn!(job_id = %reserved.job.id, "Acknowledging unknown delivery");
            return Ok(());
        };
        message
            .ack()
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))
    }

    fn failed_store(&self) -> Arc<dyn FailedJobStore> {
        Arc::clone(&self.failed)
    }
}

/// Publishes failed jobs to a dead-letter subject on the same stream
pub struct JetStreamFailedStore {
    producer: JetStreamProducer,
    subject: String,
}

#[async_trait]
impl FailedJobStore for JetStreamFailedStore {
    async fn log(&self, record: FailedJob) -> Result<String, QueueError> {
        let data = serde_json::to_vec(&record)?;
        self.producer
            .publish_sync(&self.subject, HeaderMap::new(), data)
            .await?;
        warn!(failed_id = %record.id, job_id = %record.job_id, subject = %self.subject, "Dead-lettered failed job");
        Ok(record.id)
    }

    async fn all(&self) -> Result<Vec<FailedJob>, QueueError> {
        Ok(Vec::new())
    }

    async fn find(&self, _id: &str) -> Result<Option<FailedJob>, QueueError> {
        Ok(None)
    }

    async fn forget(&self, _id: &str) -> Result<bool, QueueError> {
        Ok(false)
    }

    async fn flush(&self) -> Result<u64, QueueError> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_due_for_only_defers_future_messages() {
        assert_eq!(not_due_for(None, 100), None);
        assert_eq!(not_due_for(Some(90), 100), None);
        assert_eq!(not_due_for(Some(100), 100), None);
        assert_eq!(not_due_for(Some(130), 100), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_available_at_reads_the_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(available_at(None), None);
        assert_eq!(available_at(Some(&headers)), None);

        headers.insert(AVAILABLE_AT_HEADER, "1700000000");
        assert_eq!(available_at(Some(&headers)), Some(1_700_000_000));

        headers.insert(AVAILABLE_AT_HEADER, "soon");
        assert_eq!(available_at(Some(&headers)), None);
    }
}
