//! Message broker plumbing: connection pool, confirmed publishing,
//! classified consumption and the JetStream queue built on them.

pub mod consumer;
pub mod jetstream;
pub mod pool;
pub mod producer;
pub mod tracker;

pub use consumer::{ConsumeErrorKind, ConsumerSettings, JetStreamConsumer};
pub use jetstream::{JetStreamConfig, JetStreamFailedStore, JetStreamQueue};
pub use pool::BrokerPool;
pub use producer::{AckFuture, JetStreamProducer, ProducerConfig, PublishTransport};
pub use tracker::{DeliveryStatus, DeliveryTracker};
