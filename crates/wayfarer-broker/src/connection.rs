//! Broker connection capability

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{BrokerError, BrokerResult};

/// A message delivered to a subscriber
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Subject the message was published on
    pub subject: String,
    /// Reply subject for request/reply correlation, if the sender expects one
    pub reply: Option<String>,
    /// Raw payload
    pub data: Bytes,
}

/// A live subscription; dropping it unsubscribes
pub struct Subscription {
    receiver: mpsc::Receiver<Delivery>,
}

impl Subscription {
    pub fn new(receiver: mpsc::Receiver<Delivery>) -> Self {
        Self { receiver }
    }

    /// Next delivery; `None` when the connection is gone
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }
}

/// Subject-addressed transport against a shared message broker.
///
/// Handlers may be invoked concurrently from multiple deliveries; ordering
/// across subjects is not guaranteed.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Fire-and-forget publish
    async fn publish(&self, subject: &str, data: Bytes) -> BrokerResult<()>;

    /// Subscribe to a subject
    async fn subscribe(&self, subject: &str) -> BrokerResult<Subscription>;

    /// Send a request and wait for the correlated reply
    async fn request(&self, subject: &str, data: Bytes, timeout: Duration) -> BrokerResult<Bytes>;

    /// Close the connection; idempotent
    async fn close(&self);
}

/// Replies to a request delivery, if it carried a reply subject
pub async fn reply_to(
    connection: &dyn BrokerConnection,
    delivery: &Delivery,
    data: Bytes,
) -> BrokerResult<()> {
    match &delivery.reply {
        Some(reply) => connection.publish(reply, data).await,
        None => Err(BrokerError::Transport(
            "delivery has no reply subject".to_string(),
        )),
    }
}
