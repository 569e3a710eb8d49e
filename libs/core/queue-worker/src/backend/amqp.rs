//! AMQP (RabbitMQ) queue
//!
//! Each queue is a durable, priority-enabled queue bound to a direct
//! exchange under its own name. Delays use either the delayed-message
//! exchange plugin (`x-delay` header) or a per-delay holding queue whose
//! messages dead-letter back onto the target queue when their TTL expires.
//!
//! Priority is honoured by the broker within `x-max-priority` (job
//! priorities are clamped to 0..=9); ordering among equal priorities is
//! FIFO per queue. Failed jobs are published to a durable dead-letter queue.

use super::{QueueBackend, ReservedJob, Receipt, decode_or_reject, resolve_queue, with_reconnect};
use crate::broker::BrokerPool;
use crate::error::QueueError;
use crate::failed::{FailedJob, FailedJobStore};
use crate::job::Job;
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicGetOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions, QueuePurgeOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, ExchangeKind};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const MAX_PRIORITY: i32 = 9;

/// AMQP connection and topology settings
#[derive(Debug, Clone)]
pub struct AmqpConfig {
    pub connection: String,
    pub url: String,
    pub default_queue: String,
    /// Direct exchange every queue is bound to
    pub exchange: String,
    /// Delayed-message exchange; `None` uses TTL holding queues
    pub delayed_exchange: Option<String>,
    /// Dead-letter queue for failed jobs
    pub failed_queue: String,
    /// How long `pop` waits for a push before giving up
    pub pop_wait: Duration,
}

impl AmqpConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            connection: "amqp".to_string(),
            url: url.into(),
            default_queue: "default".to_string(),
            exchange: "queues".to_string(),
            delayed_exchange: None,
            failed_queue: "failed_jobs".to_string(),
            pop_wait: Duration::from_secs(1),
        }
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    pub fn with_delayed_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.delayed_exchange = Some(exchange.into());
        self
    }

    pub fn with_pop_wait(mut self, wait: Duration) -> Self {
        self.pop_wait = wait;
        self
    }
}

fn holding_queue_name(queue: &str, delay: Duration) -> String {
    format!("{}.delay.{}", queue, delay.as_millis())
}

fn amqp_priority(priority: i32) -> u8 {
    priority.clamp(0, MAX_PRIORITY) as u8
}

/// Channel shared by the queue and its dead-letter store
struct Link {
    pool: BrokerPool,
    url: String,
    channel: Mutex<Option<Channel>>,
    declared: Mutex<HashSet<String>>,
}

impl Link {
    async fn channel(&self) -> Result<Channel, QueueError> {
        let mut slot = self.channel.lock().await;
        if let Some(channel) = slot.as_ref()
            && channel.status().connected()
        {
            return Ok(channel.clone());
        }

        let conn = self.pool.amqp(&self.url).await?;
        let channel = conn.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        *slot = Some(channel.clone());
        // topology must be re-checked on the new channel
        self.declared.lock().await.clear();
        Ok(channel)
    }

    async fn reset(&self) -> Result<(), QueueError> {
        self.channel.lock().await.take();
        self.pool.invalidate_amqp(&self.url).await;
        self.channel().await.map(|_| ())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), QueueError> {
        let channel = self.channel().await?;
        let confirmation = channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await?
            .await?;
        if confirmation.is_nack() {
            return Err(QueueError::DeliveryFailed(format!(
                "broker rejected message for '{routing_key}'"
            )));
        }
        Ok(())
    }

    async fn declare_durable_queue(&self, name: &str, arguments: FieldTable) -> Result<u32, QueueError> {
        let channel = self.channel().await?;
        let queue = channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                arguments,
            )
            .await?;
        Ok(queue.message_count())
    }
}

/// Queue on an AMQP broker
pub struct AmqpQueue {
    config: AmqpConfig,
    link: Arc<Link>,
    failed: Arc<dyn FailedJobStore>,
}

impl AmqpQueue {
    pub async fn connect(config: AmqpConfig, pool: BrokerPool) -> Result<Self, QueueError> {
        let link = Arc::new(Link {
            pool,
            url: config.url.clone(),
            channel: Mutex::new(None),
            declared: Mutex::new(HashSet::new()),
        });
        link.channel().await?;

        let failed = Arc::new(AmqpDeadLetterStore {
            link: Arc::clone(&link),
            queue: config.failed_queue.clone(),
        });
        info!(exchange = %config.exchange, "AMQP queue connected");
        Ok(Self {
            config,
            link,
            failed,
        })
    }

    pub fn with_failed_store(mut self, failed: Arc<dyn FailedJobStore>) -> Self {
        self.failed = failed;
        self
    }

    fn queue_arguments() -> FieldTable {
        let mut arguments = FieldTable::default();
        arguments.insert(
            ShortString::from("x-max-priority"),
            AMQPValue::LongInt(MAX_PRIORITY),
        );
        arguments
    }

    /// Declare the exchange, the queue and its binding once per channel.
    async fn declare(&self, queue: &str) -> Result<(), QueueError> {
        self.declare_counted(queue).await.map(|_| ())
    }

    /// Like [`declare`](Self::declare), returning the queue's message count
    /// when the declaration actually ran on this call.
    async fn declare_counted(&self, queue: &str) -> Result<Option<u32>, QueueError> {
        if self.link.declared.lock().await.contains(queue) {
            return Ok(None);
        }
        let channel = self.link.channel().await?;
        channel
            .exchange_declare(
                &self.config.exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        let count = self
            .link
            .declare_durable_queue(queue, Self::queue_arguments())
            .await?;
        channel
            .queue_bind(
                queue,
                &self.config.exchange,
                queue,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        if let Some(delayed) = &self.config.delayed_exchange {
            let mut arguments = FieldTable::default();
            arguments.insert(
                ShortString::from("x-delayed-type"),
                AMQPValue::LongString(LongString::from("direct")),
            );
            channel
                .exchange_declare(
                    delayed,
                    ExchangeKind::Custom("x-delayed-message".to_string()),
                    ExchangeDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    arguments,
                )
                .await?;
            channel
                .queue_bind(
                    queue,
                    delayed,
                    queue,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
        }

        self.link.declared.lock().await.insert(queue.to_string());
        Ok(Some(count))
    }

    /// Holding queue whose messages dead-letter onto `queue` after `delay`.
    async fn declare_holding_queue(&self, queue: &str, delay: Duration) -> Result<String, QueueError> {
        let name = holding_queue_name(queue, delay);
        if self.link.declared.lock().await.contains(&name) {
            return Ok(name);
        }
        let millis = delay.as_millis() as i64;
        let mut arguments = FieldTable::default();
        arguments.insert(
            ShortString::from("x-message-ttl"),
            AMQPValue::LongLongInt(millis),
        );
        arguments.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(LongString::from(self.config.exchange.clone())),
        );
        arguments.insert(
            ShortString::from("x-dead-letter-routing-key"),
            AMQPValue::LongString(LongString::from(queue.to_string())),
        );
        // drop idle holding queues once they have been empty for a while
        arguments.insert(
            ShortString::from("x-expires"),
            AMQPValue::LongLongInt(millis.saturating_mul(2).max(60_000)),
        );
        self.link.declare_durable_queue(&name, arguments).await?;
        self.link.declared.lock().await.insert(name.clone());
        Ok(name)
    }

    fn properties(job: &Job) -> BasicProperties {
        BasicProperties::default()
            .with_delivery_mode(2)
            .with_content_type(ShortString::from("application/json"))
            .with_message_id(ShortString::from(job.id.clone()))
            .with_priority(amqp_priority(job.priority))
    }

    async fn try_push(&self, job: &Job, queue: &str, payload: &[u8]) -> Result<(), QueueError> {
        self.declare(queue).await?;
        self.link
            .publish(&self.config.exchange, queue, payload, Self::properties(job))
            .await
    }

    async fn try_later(&self, job: &Job, queue: &str, delay: Duration, payload: &[u8]) -> Result<(), QueueError> {
        self.declare(queue).await?;
        match &self.config.delayed_exchange {
            Some(delayed) => {
                let mut headers = FieldTable::default();
                headers.insert(
                    ShortString::from("x-delay"),
                    AMQPValue::LongLongInt(delay.as_millis() as i64),
                );
                let properties = Self::properties(job).with_headers(headers);
                self.link.publish(delayed, queue, payload, properties).await
            }
            None => {
                let holding = self.declare_holding_queue(queue, delay).await?;
                self.link
                    .publish("", &holding, payload, Self::properties(job))
                    .await
            }
        }
    }

    /// Fetch one message: a cheap `basic.get` first, then a short-lived
    /// consumer bounded by `pop_wait`.
    async fn try_pop(&self, queue: &str) -> Result<Option<(u64, Vec<u8>)>, QueueError> {
        self.declare(queue).await?;
        let channel = self.link.channel().await?;

        if let Some(message) = channel
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await?
        {
            let delivery = message.delivery;
            return Ok(Some((delivery.delivery_tag, delivery.data)));
        }

        if self.config.pop_wait.is_zero() {
            return Ok(None);
        }

        channel.basic_qos(1, BasicQosOptions::default()).await?;
        let tag = format!("pop-{}", uuid::Uuid::new_v4());
        let mut consumer = channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let mut claimed = match tokio::time::timeout(self.config.pop_wait, consumer.next()).await {
            Ok(Some(Ok(delivery))) => Some((delivery.delivery_tag, delivery.data)),
            Ok(Some(Err(e))) => return Err(e.into()),
            _ => None,
        };

        channel
            .basic_cancel(&tag, BasicCancelOptions::default())
            .await?;

        // a delivery can race the cancel; keep the first, hand back the rest
        while let Ok(Some(Ok(delivery))) =
            tokio::time::timeout(Duration::from_millis(50), consumer.next()).await
        {
            if claimed.is_none() {
                claimed = Some((delivery.delivery_tag, delivery.data));
            } else {
                channel
                    .basic_nack(
                        delivery.delivery_tag,
                        BasicNackOptions {
                            requeue: true,
                            ..Default::default()
                        },
                    )
                    .await?;
            }
        }

        Ok(claimed)
    }
}

#[async_trait]
impl QueueBackend for AmqpQueue {
    fn name(&self) -> &str {
        &self.config.connection
    }

    fn default_queue(&self) -> &str {
        &self.config.default_queue
    }

    async fn push(&self, job: &Job, queue: Option<&str>) -> Result<String, QueueError> {
        let queue = resolve_queue(queue, Some(job), &self.config.default_queue);
        let payload = job.encode()?;
        let payload = payload.as_bytes();
        with_reconnect(
            "push",
            move || self.try_push(job, queue, payload),
            || self.link.reset(),
        )
        .await?;
        debug!(job_id = %job.id, queue, "Published job");
        Ok(job.id.clone())
    }

    async fn later(&self, job: &Job, delay: Duration, queue: Option<&str>) -> Result<String, QueueError> {
        if delay.is_zero() {
            return self.push(job, queue).await;
        }
        let queue = resolve_queue(queue, Some(job), &self.config.default_queue);
        let payload = job.encode()?;
        let payload = payload.as_bytes();
        with_reconnect(
            "later",
            move || self.try_later(job, queue, delay, payload),
            || self.link.reset(),
        )
        .await?;
        debug!(job_id = %job.id, queue, delay_ms = delay.as_millis() as u64, "Published delayed job");
        Ok(job.id.clone())
    }

    async fn pop(&self, queue: Option<&str>) -> Result<Option<ReservedJob>, QueueError> {
        let queue = resolve_queue(queue, None, &self.config.default_queue);
        let popped = with_reconnect("pop", move || self.try_pop(queue), || self.link.reset()).await?;
        let Some((delivery_tag, data)) = popped else {
            return Ok(None);
        };

        let raw = String::from_utf8_lossy(&data).into_owned();
        match decode_or_reject(self.failed.as_ref(), self.name(), queue, &raw).await? {
            Some(job) => Ok(Some(ReservedJob {
                job,
                connection: self.config.connection.clone(),
                queue: queue.to_string(),
                raw,
                receipt: Receipt::DeliveryTag(delivery_tag),
            })),
            None => {
                let channel = self.link.channel().await?;
                channel
                    .basic_ack(delivery_tag, BasicAckOptions::default())
                    .await?;
                Ok(None)
            }
        }
    }

    async fn size(&self, queue: Option<&str>) -> Result<u64, QueueError> {
        let queue = resolve_queue(queue, None, &self.config.default_queue);
        let count = with_reconnect(
            "size",
            move || async move {
                match self.declare_counted(queue).await? {
                    Some(count) => Ok(count),
                    None => {
                        self.link
                            .declare_durable_queue(queue, Self::queue_arguments())
                            .await
                    }
                }
            },
            || self.link.reset(),
        )
        .await?;
        Ok(count as u64)
    }

    async fn clear(&self, queue: Option<&str>) -> Result<u64, QueueError> {
        let queue = resolve_queue(queue, None, &self.config.default_queue);
        let purged = with_reconnect(
            "clear",
            move || async move {
                self.declare(queue).await?;
                let channel = self.link.channel().await?;
                let purged = channel
                    .queue_purge(queue, QueuePurgeOptions::default())
                    .await?;
                Ok::<u32, QueueError>(purged)
            },
            || self.link.reset(),
        )
        .await?;
        Ok(purged as u64)
    }

    async fn ack(&self, reserved: &ReservedJob) -> Result<(), QueueError> {
        let Receipt::DeliveryTag(tag) = reserved.receipt else {
            return Ok(());
        };
        // delivery tags are scoped to the channel, so no reconnect-and-retry here
        let channel = self.link.channel().await?;
        channel.basic_ack(tag, BasicAckOptions::default()).await?;
        Ok(())
    }

    fn failed_store(&self) -> Arc<dyn FailedJobStore> {
        Arc::clone(&self.failed)
    }
}

/// Failed jobs published to a durable dead-letter queue.
///
/// The broker is write-only from here: records can be inspected with broker
/// tooling, so listing, lookup and deletion are not available.
pub struct AmqpDeadLetterStore {
    link: Arc<Link>,
    queue: String,
}

#[async_trait]
impl FailedJobStore for AmqpDeadLetterStore {
    async fn log(&self, record: FailedJob) -> Result<String, QueueError> {
        self.link
            .declare_durable_queue(&self.queue, FieldTable::default())
            .await?;
        let data = serde_json::to_vec(&record)?;
        let properties = BasicProperties::default()
            .with_delivery_mode(2)
            .with_content_type(ShortString::from("application/json"))
            .with_message_id(ShortString::from(record.id.clone()));
        self.link.publish("", &self.queue, &data, properties).await?;
        warn!(failed_id = %record.id, job_id = %record.job_id, dead_letter = %self.queue, "Dead-lettered failed job");
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
        let channel = self.link.channel().await?;
        self.link
            .declare_durable_queue(&self.queue, FieldTable::default())
            .await?;
        Ok(channel
            .queue_purge(&self.queue, QueuePurgeOptions::default())
            .await? as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_holding_queue_name_includes_delay() {
        assert_eq!(
            holding_queue_name("emails", Duration::from_secs(10)),
            "emails.delay.10000"
        );
    }

    #[test]
    fn test_priority_is_clamped() {
        assert_eq!(amqp_priority(-5), 0);
        assert_eq!(amqp_priority(4), 4);
        assert_eq!(amqp_priority(100), 9);
    }
}
