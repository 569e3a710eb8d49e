//! Shared test utilities for queue backends
//!
//! Each broker or database the queue library talks to has a container
//! helper that starts a throwaway instance and exposes its URL:
//! - `TestPostgres` (feature: "postgres")
//! - `TestRedis` (feature: "redis")
//! - `TestNats`, JetStream enabled (feature: "nats")
//! - `TestRabbitMq` (feature: "rabbitmq")
//!
//! The container stops when the helper is dropped. Tests using them need a
//! Docker daemon and are marked `#[ignore]`; run them with
//! `cargo test -- --ignored`.
//!
//! ```rust,ignore
//! use test_utils::TestRedis;
//!
//! #[tokio::test]
//! #[ignore]
//! async fn redis_backend_roundtrip() {
//!     let redis = TestRedis::new().await;
//!     let queue = RedisQueue::connect(redis.connection_string(), Default::default()).await.unwrap();
//! }
//! ```

use uuid::Uuid;

#[cfg(feature = "nats")]
mod nats;
#[cfg(feature = "postgres")]
mod postgres;
#[cfg(feature = "rabbitmq")]
mod rabbitmq;
#[cfg(feature = "redis")]
mod redis;

#[cfg(feature = "nats")]
pub use nats::TestNats;
#[cfg(feature = "postgres")]
pub use postgres::TestPostgres;
#[cfg(feature = "rabbitmq")]
pub use rabbitmq::TestRabbitMq;
#[cfg(feature = "redis")]
pub use redis::TestRedis;

/// Deterministic names so tests sharing a broker do not collide
pub struct TestDataBuilder {
    seed: u64,
}

impl TestDataBuilder {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Seed from the test name, so reruns reuse the same names.
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// Queue name unique to this test, e.g. `test-1234-emails`.
    pub fn queue(&self, suffix: &str) -> String {
        format!("test-{}-{}", self.seed, suffix)
    }

    /// Identifier derived from the seed, stable across runs
    pub fn id(&self) -> Uuid {
        let bytes = self.seed.to_le_bytes();
        let mut uuid_bytes = [0u8; 16];
        uuid_bytes[..8].copy_from_slice(&bytes);
        uuid_bytes[8..].copy_from_slice(&bytes);
        Uuid::from_bytes(uuid_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_is_deterministic() {
        let a = TestDataBuilder::from_test_name("test_a");
        let b = TestDataBuilder::from_test_name("test_a");
        let c = TestDataBuilder::from_test_name("test_c");
        assert_eq!(a.queue("emails"), b.queue("emails"));
        assert_ne!(a.queue("emails"), c.queue("emails"));
        assert_eq!(a.id(), b.id());
        assert!(a.queue("emails").ends_with("-emails"));
    }
}
