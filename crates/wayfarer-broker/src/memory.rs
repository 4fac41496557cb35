//! In-process broker
//!
//! Subject-addressed pub/sub with request/reply correlation, backed by
//! channels. Serves tests and single-process wiring where both ends of a
//! dialog live in the same node.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::RngCore;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::trace;

use crate::connection::{BrokerConnection, Delivery, Subscription};
use crate::error::{BrokerError, BrokerResult};

const SUBSCRIPTION_BUFFER: usize = 64;

type SubscriberMap = Mutex<HashMap<String, Vec<mpsc::Sender<Delivery>>>>;

/// Shared in-memory broker; cheap to clone
#[derive(Clone, Default)]
pub struct MemoryBroker {
    subscribers: Arc<SubscriberMap>,
    inbox_counter: Arc<AtomicU64>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a connection to this broker
    pub fn connect(&self) -> Arc<MemoryConnection> {
        Arc::new(MemoryConnection {
            broker: self.clone(),
            closed: AtomicBool::new(false),
        })
    }

    fn deliver(&self, subject: &str, reply: Option<String>, data: Bytes) {
        let mut subscribers = self.subscribers.lock().expect("subscriber lock poisoned");
        if let Some(senders) = subscribers.get_mut(subject) {
            senders.retain(|sender| {
                sender
                    .try_send(Delivery {
                        subject: subject.to_string(),
                        reply: reply.clone(),
                        data: data.clone(),
                    })
                    .is_ok()
            });
            if senders.is_empty() {
                subscribers.remove(subject);
            }
        } else {
            trace!(subject, "no subscribers for subject");
        }
    }

    fn add_subscriber(&self, subject: &str, sender: mpsc::Sender<Delivery>) {
        self.subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .entry(subject.to_string())
            .or_default()
            .push(sender);
    }

    fn next_inbox(&self) -> String {
        let mut nonce = [0u8; 8];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        format!(
            "_inbox.{}.{}",
            hex::encode(nonce),
            self.inbox_counter.fetch_add(1, Ordering::Relaxed)
        )
    }
}

/// A connection handle to a `MemoryBroker`
pub struct MemoryConnection {
    broker: MemoryBroker,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn ensure_open(&self) -> BrokerResult<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn publish(&self, subject: &str, data: Bytes) -> BrokerResult<()> {
        self.ensure_open()?;
        self.broker.deliver(subject, None, data);
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> BrokerResult<Subscription> {
        self.ensure_open()?;
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.broker.add_subscriber(subject, sender);
        Ok(Subscription::new(receiver))
    }

    async fn request(
        &self,
        subject: &str,
        data: Bytes,
        wait: Duration,
    ) -> BrokerResult<Bytes> {
        self.ensure_open()?;

        let inbox = self.broker.next_inbox();
        let (sender, mut receiver) = mpsc::channel(1);
        self.broker.add_subscriber(&inbox, sender);
        self.broker.deliver(subject, Some(inbox), data);

        match timeout(wait, receiver.recv()).await {
            Ok(Some(delivery)) => Ok(delivery.data),
            Ok(None) => Err(BrokerError::Transport("reply channel closed".to_string())),
            Err(_) => Err(BrokerError::Timeout(subject.to_string())),
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let broker = MemoryBroker::new();
        let publisher = broker.connect();
        let subscriber = broker.connect();

        let mut sub = subscriber.subscribe("peer.topic").await.unwrap();
        publisher
            .publish("peer.topic", Bytes::from_static(b"hello"))
            .await
            .unwrap();

        let delivery = sub.recv().await.unwrap();
        assert_eq!(delivery.subject, "peer.topic");
        assert_eq!(delivery.data.as_ref(), b"hello");
        assert!(delivery.reply.is_none());
    }

    #[tokio::test]
    async fn test_request_reply() {
        let broker = MemoryBroker::new();
        let requester = broker.connect();
        let responder = broker.connect();

        let mut sub = responder.subscribe("exchange").await.unwrap();
        let responder_clone = responder.clone();
        tokio::spawn(async move {
            let delivery = sub.recv().await.unwrap();
            crate::connection::reply_to(
                responder_clone.as_ref(),
                &delivery,
                Bytes::from_static(b"OK"),
            )
            .await
            .unwrap();
        });

        let reply = requester
            .request(
                "exchange",
                Bytes::from_static(b"ping"),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(reply.as_ref(), b"OK");
    }

    #[tokio::test]
    async fn test_request_times_out_without_responder() {
        let broker = MemoryBroker::new();
        let requester = broker.connect();

        let err = requester
            .request(
                "nobody.home",
                Bytes::from_static(b"ping"),
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_closed_connection_rejects_operations() {
        let broker = MemoryBroker::new();
        let conn = broker.connect();
        conn.close().await;

        let err = conn
            .publish("any", Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Closed));
    }

    #[tokio::test]
    async fn test_multiple_subscribers_each_receive() {
        let broker = MemoryBroker::new();
        let publisher = broker.connect();

        let mut sub_a = broker.connect().subscribe("fanout").await.unwrap();
        let mut sub_b = broker.connect().subscribe("fanout").await.unwrap();

        publisher
            .publish("fanout", Bytes::from_static(b"msg"))
            .await
            .unwrap();

        assert_eq!(sub_a.recv().await.unwrap().data.as_ref(), b"msg");
        assert_eq!(sub_b.recv().await.unwrap().data.as_ref(), b"msg");
    }
}
