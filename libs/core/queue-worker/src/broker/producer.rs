//! JetStream producer with delivery tracking and backpressure

use super::tracker::{DeliveryStatus, DeliveryTracker};
use crate::error::QueueError;
use async_nats::HeaderMap;
use async_nats::jetstream::Context;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Header carrying the message id, used by JetStream for de-duplication
pub const MSG_ID_HEADER: &str = "Nats-Msg-Id";

/// Resolves once the broker acknowledged (`Ok`) or rejected (`Err`) a
/// publish
pub type AckFuture = BoxFuture<'static, Result<(), String>>;

/// Hands a message to the broker client
#[async_trait]
pub trait PublishTransport: Send + Sync {
    /// Queue the message for sending. Errors here mean it never left.
    async fn send(&self, subject: String, headers: HeaderMap, payload: Vec<u8>) -> Result<AckFuture, QueueError>;
}

#[async_trait]
impl PublishTransport for Context {
    async fn send(&self, subject: String, headers: HeaderMap, payload: Vec<u8>) -> Result<AckFuture, QueueError> {
        let ack = self
            .publish_with_headers(subject, headers, payload.into())
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?;
        Ok(Box::pin(async move {
            let ack = ack.await.map_err(|e| e.to_string())?;
            debug!(stream = %ack.stream, sequence = ack.sequence, "Publish acknowledged");
            Ok(())
        }))
    }
}

/// Producer timing and limits
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// How long an async publish waits for its acknowledgement before
    /// returning with the delivery still pending
    pub confirm_wait: Duration,
    /// How long a synchronous publish waits for its acknowledgement
    pub sync_timeout: Duration,
    /// Pending deliveries above which publishing blocks
    pub max_pending: usize,
    /// How long a blocked publish waits for the backlog to drain
    pub backpressure_wait: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            confirm_wait: Duration::from_millis(100),
            sync_timeout: Duration::from_secs(5),
            max_pending: 10_000,
            backpressure_wait: Duration::from_secs(5),
        }
    }
}

/// Publishes to JetStream and tracks each delivery until acknowledged
#[derive(Clone)]
pub struct JetStreamProducer {
    transport: Arc<dyn PublishTransport>,
    tracker: Arc<DeliveryTracker>,
    config: ProducerConfig,
}

impl JetStreamProducer {
    pub fn new(context: Context, config: ProducerConfig) -> Self {
        Self::with_transport(Arc::new(context), config)
    }

    pub fn with_transport(transport: Arc<dyn PublishTransport>, config: ProducerConfig) -> Self {
        Self {
            transport,
            tracker: Arc::new(DeliveryTracker::new()),
            config,
        }
    }

    pub fn tracker(&self) -> &Arc<DeliveryTracker> {
        &self.tracker
    }

    /// Publish, briefly waiting for the acknowledgement.
    ///
    /// Returns once the broker confirmed, or with the delivery still pending
    /// after `confirm_wait`. A broker rejection within that window is
    /// returned as an error.
    pub async fn publish(
        &self,
        subject: &str,
        headers: HeaderMap,
        payload: Vec<u8>,
    ) -> Result<String, QueueError> {
        let id = self.send(subject, headers, payload).await?;
        match self.tracker.wait_for(&id, self.config.confirm_wait).await {
            Some(DeliveryStatus::Failed(reason)) => Err(QueueError::DeliveryFailed(reason)),
            _ => Ok(id),
        }
    }

    /// Publish and wait until the broker confirms or `sync_timeout` passes.
    pub async fn publish_sync(
        &self,
        subject: &str,
        headers: HeaderMap,
        payload: Vec<u8>,
    ) -> Result<String, QueueError> {
        let id = self.send(subject, headers, payload).await?;
        match self.tracker.wait_for(&id, self.config.sync_timeout).await {
            Some(DeliveryStatus::Delivered) => Ok(id),
            Some(DeliveryStatus::Failed(reason)) => Err(QueueError::DeliveryFailed(reason)),
            _ => Err(QueueError::DeliveryFailed(format!(
                "no acknowledgement within {:?}",
                self.config.sync_timeout
            ))),
        }
    }

    async fn send(
        &self,
        subject: &str,
        mut headers: HeaderMap,
        payload: Vec<u8>,
    ) -> Result<String, QueueError> {
        self.apply_backpressure().await?;
        self.tracker.gc();

        let id = uuid::Uuid::now_v7().to_string();
        headers.insert(MSG_ID_HEADER, id.as_str());
        self.tracker.track(&id);

        let ack = match self.transport.send(subject.to_string(), headers, payload).await {
            Ok(ack) => ack,
            Err(e) => {
                self.tracker.mark_failed(&id, e.to_string());
                return Err(e);
            }
        };

        let tracker = Arc::clone(&self.tracker);
        let delivery_id = id.clone();
        tokio::spawn(async move {
            match ack.await {
                Ok(()) => {
                    debug!(message_id = %delivery_id, "Delivery confirmed");
                    tracker.mark_delivered(&delivery_id);
                }
                Err(e) => {
                    warn!(message_id = %delivery_id, error = %e, "Delivery failed");
                    tracker.mark_failed(&delivery_id, e);
                }
            }
        });
        // let the acknowledgement task make progress before we check on it
        tokio::task::yield_now().await;

        Ok(id)
    }

    async fn apply_backpressure(&self) -> Result<(), QueueError> {
        if self.tracker.pending_count() < self.config.max_pending {
            return Ok(());
        }
        let started = Instant::now();
        warn!(
            pending = self.tracker.pending_count(),
            max_pending = self.config.max_pending,
            "Publish backlog full, waiting for confirmations"
        );
        let pending = self
            .tracker
            .wait_below(self.config.max_pending, self.config.backpressure_wait)
            .await;
        if pending >= self.config.max_pending {
            return Err(QueueError::Overloaded {
                pending,
                waited: started.elapsed(),
            });
        }
        Ok(())
    }
}
