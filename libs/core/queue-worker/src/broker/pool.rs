//! Shared broker connections
//!
//! One connection per broker URL, created on first use and replaced when it
//! is found closed. The pool is an explicit value passed to the backends
//! that need it, never a process global.

use crate::error::QueueError;
use lapin::{Connection, ConnectionProperties};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Default)]
struct Connections {
    amqp: HashMap<String, Arc<Connection>>,
    nats: HashMap<String, async_nats::Client>,
}

/// Connection cache keyed by broker URL
#[derive(Clone, Default)]
pub struct BrokerPool {
    inner: Arc<Mutex<Connections>>,
}

impl BrokerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open AMQP connection for `url`, reconnecting if the cached one closed.
    pub async fn amqp(&self, url: &str) -> Result<Arc<Connection>, QueueError> {
        let mut connections = self.inner.lock().await;
        if let Some(conn) = connections.amqp.get(url) {
            if conn.status().connected() {
                return Ok(Arc::clone(conn));
            }
            warn!("Cached AMQP connection is closed, reconnecting");
        }

        let conn = Arc::new(Connection::connect(url, ConnectionProperties::default()).await?);
        info!("Connected to AMQP broker");
        connections.amqp.insert(url.to_string(), Arc::clone(&conn));
        Ok(conn)
    }

    /// Drop the cached AMQP connection so the next call reconnects.
    pub async fn invalidate_amqp(&self, url: &str) {
        if let Some(conn) = self.inner.lock().await.amqp.remove(url) {
            let _ = conn.close(0, "reconnecting").await;
        }
    }

    /// NATS client for `url`. The client reconnects on its own, so a cached
    /// client is reused unless it was explicitly invalidated.
    pub async fn nats(&self, url: &str) -> Result<async_nats::Client, QueueError> {
        let mut connections = self.inner.lock().await;
        if let Some(client) = connections.nats.get(url) {
            return Ok(client.clone());
        }

        let client = async_nats::connect(url)
            .await
            .map_err(|e| QueueError::ConnectionLost(e.to_string()))?;
        info!("Connected to NATS");
        connections.nats.insert(url.to_string(), client.clone());
        Ok(client)
    }

    pub async fn invalidate_nats(&self, url: &str) {
        self.inner.lock().await.nats.remove(url);
    }

    /// Number of cached connections across all brokers.
    pub async fn len(&self) -> usize {
        let connections = self.inner.lock().await;
        connections.amqp.len() + connections.nats.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pool_starts_empty_and_clones_share_state() {
        let pool = BrokerPool::new();
        let clone = pool.clone();
        assert!(pool.is_empty().await);
        clone.invalidate_nats("nats://nowhere:4222").await;
        assert_eq!(pool.len().await, 0);
    }
}
