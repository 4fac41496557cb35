//! Legacy broker-backed channel
//!
//! Peers that cannot punch a direct channel fall back to a dialog held
//! entirely over the broker: every topic maps to a subject derived from the
//! provider topic and the consumer identity, and every message travels in a
//! signed envelope. Same `Channel` capability, higher latency, no service
//! socket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use wayfarer_broker::{pack_signed, unpack_signed, BrokerClient};
use wayfarer_crypto::{Identity, Signer};

use crate::channel::{Channel, IncomingRequest, TopicHandler};
use crate::error::{P2pError, P2pResult};

#[derive(Debug, Serialize, Deserialize)]
struct DialogRequest {
    topic: String,
    data: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
enum DialogReply {
    Ok(Vec<u8>),
    Err(String),
}

/// Broker-mediated channel between one consumer and one provider
pub struct DialogChannel {
    client: Arc<BrokerClient>,
    signer: Arc<dyn Signer>,
    peer: Identity,
    base_subject: String,
    closed: AtomicBool,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl DialogChannel {
    /// Consumer side: open a dialog towards `provider` on its topic
    pub fn dial(
        client: Arc<BrokerClient>,
        signer: Arc<dyn Signer>,
        provider: Identity,
        provider_topic: &str,
    ) -> Arc<Self> {
        let base_subject = format!("{}.{}", provider_topic, signer.identity().to_hex());
        Arc::new(Self {
            client,
            signer,
            peer: provider,
            base_subject,
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Provider side: accept the dialog of one known consumer
    pub fn accept(
        client: Arc<BrokerClient>,
        signer: Arc<dyn Signer>,
        consumer: Identity,
        provider_topic: &str,
    ) -> Arc<Self> {
        let base_subject = format!("{}.{}", provider_topic, consumer.to_hex());
        Arc::new(Self {
            client,
            signer,
            peer: consumer,
            base_subject,
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    fn subject(&self, topic: &str) -> String {
        format!("{}.{}", self.base_subject, topic)
    }
}

#[async_trait]
impl Channel for DialogChannel {
    async fn send(&self, topic: &str, data: Bytes, wait: Duration) -> P2pResult<Bytes> {
        if self.closed.load(Ordering::Acquire) {
            return Err(P2pError::ChannelClosed);
        }

        let request = DialogRequest {
            topic: topic.to_string(),
            data: data.to_vec(),
        };
        let packed = pack_signed(self.signer.as_ref(), &request)?;

        let reply_bytes = self
            .client
            .request_with_timeout(&self.subject(topic), Bytes::from(packed), wait)
            .await?;
        let (reply, sender) = unpack_signed::<DialogReply>(&reply_bytes)?;
        if sender != self.peer {
            return Err(P2pError::UnexpectedPeer {
                expected: self.peer.to_hex(),
                actual: sender.to_hex(),
            });
        }

        match reply {
            DialogReply::Ok(payload) => Ok(Bytes::from(payload)),
            DialogReply::Err(message) => Err(P2pError::Peer(message)),
        }
    }

    async fn handle(&self, topic: &str, handler: TopicHandler) -> P2pResult<()> {
        let mut subscription = self.client.subscribe(&self.subject(topic)).await?;
        let client = self.client.clone();
        let signer = self.signer.clone();
        let peer = self.peer;

        let task = tokio::spawn(async move {
            while let Some(delivery) = subscription.recv().await {
                let (request, sender) = match unpack_signed::<DialogRequest>(&delivery.data) {
                    Ok(unpacked) => unpacked,
                    Err(err) => {
                        warn!(%err, "dropping undecodable dialog request");
                        continue;
                    }
                };
                if sender != peer {
                    warn!(%sender, "dropping dialog request from unexpected sender");
                    continue;
                }
                let Some(reply_subject) = delivery.reply else {
                    continue;
                };

                let result = handler(IncomingRequest {
                    peer: sender,
                    data: Bytes::from(request.data),
                })
                .await;
                let reply = match result {
                    Ok(payload) => DialogReply::Ok(payload.to_vec()),
                    Err(err) => DialogReply::Err(err.to_string()),
                };
                let packed = match pack_signed(signer.as_ref(), &reply) {
                    Ok(packed) => packed,
                    Err(err) => {
                        warn!(%err, "could not pack dialog reply");
                        continue;
                    }
                };
                if let Err(err) = client.publish(&reply_subject, Bytes::from(packed)).await {
                    warn!(%err, "could not publish dialog reply");
                }
            }
        });
        self.tasks.lock().await.push(task);
        Ok(())
    }

    fn peer_identity(&self) -> Identity {
        self.peer
    }

    async fn take_service_conn(&self) -> Option<UdpSocket> {
        None
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(peer = %self.peer, "closing dialog channel");
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{handler_fn, send_msg};
    use wayfarer_broker::{BrokerConfig, BrokerDialer, BrokerResult, MemoryBroker};
    use wayfarer_crypto::KeySigner;

    struct MemoryDialer(MemoryBroker);

    #[async_trait]
    impl BrokerDialer for MemoryDialer {
        async fn dial(
            &self,
            _addresses: &[String],
        ) -> BrokerResult<Arc<dyn wayfarer_broker::BrokerConnection>> {
            Ok(self.0.connect() as Arc<dyn wayfarer_broker::BrokerConnection>)
        }
    }

    fn client(broker: &MemoryBroker) -> Arc<BrokerClient> {
        Arc::new(BrokerClient::new(
            Arc::new(MemoryDialer(broker.clone())),
            vec!["mem".to_string()],
            BrokerConfig::default(),
        ))
    }

    #[tokio::test]
    async fn test_dialog_typed_request_reply() {
        let broker = MemoryBroker::new();
        let consumer_signer = Arc::new(KeySigner::generate());
        let provider_signer = Arc::new(KeySigner::generate());

        let provider_side = DialogChannel::accept(
            client(&broker),
            provider_signer.clone() as Arc<dyn Signer>,
            consumer_signer.identity(),
            "provider-topic",
        );
        provider_side
            .handle(
                "session.create",
                handler_fn(|request| async move {
                    let msg: String = bincode::deserialize(&request.data)
                        .map_err(|e| P2pError::Codec(e.to_string()))?;
                    let reply = format!("re:{}", msg);
                    Ok(Bytes::from(bincode::serialize(&reply).unwrap()))
                }),
            )
            .await
            .unwrap();

        let consumer_side = DialogChannel::dial(
            client(&broker),
            consumer_signer as Arc<dyn Signer>,
            provider_signer.identity(),
            "provider-topic",
        );

        let reply: String = send_msg(
            consumer_side.as_ref(),
            "session.create",
            &"ping".to_string(),
        )
        .await
        .unwrap();
        assert_eq!(reply, "re:ping");
    }

    #[tokio::test]
    async fn test_dialog_roundtrip_raw() {
        let broker = MemoryBroker::new();
        let consumer_signer = Arc::new(KeySigner::generate());
        let provider_signer = Arc::new(KeySigner::generate());

        let provider_side = DialogChannel::accept(
            client(&broker),
            provider_signer.clone() as Arc<dyn Signer>,
            consumer_signer.identity(),
            "topic",
        );
        provider_side
            .handle(
                "keepalive",
                handler_fn(|_| async move { Ok(Bytes::from_static(b"OK")) }),
            )
            .await
            .unwrap();

        let consumer_side = DialogChannel::dial(
            client(&broker),
            consumer_signer as Arc<dyn Signer>,
            provider_signer.identity(),
            "topic",
        );
        let reply = consumer_side
            .send("keepalive", Bytes::new(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply.as_ref(), b"OK");
    }

    #[tokio::test]
    async fn test_dialog_error_reply() {
        let broker = MemoryBroker::new();
        let consumer_signer = Arc::new(KeySigner::generate());
        let provider_signer = Arc::new(KeySigner::generate());

        let provider_side = DialogChannel::accept(
            client(&broker),
            provider_signer.clone() as Arc<dyn Signer>,
            consumer_signer.identity(),
            "topic",
        );
        provider_side
            .handle(
                "session.destroy",
                handler_fn(|_| async move { Err(P2pError::Peer("wrong owner".to_string())) }),
            )
            .await
            .unwrap();

        let consumer_side = DialogChannel::dial(
            client(&broker),
            consumer_signer as Arc<dyn Signer>,
            provider_signer.identity(),
            "topic",
        );
        let err = consumer_side
            .send("session.destroy", Bytes::new(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, P2pError::Peer(msg) if msg.contains("wrong owner")));
    }

    #[tokio::test]
    async fn test_dialog_ignores_imposter() {
        let broker = MemoryBroker::new();
        let consumer_signer = Arc::new(KeySigner::generate());
        let provider_signer = Arc::new(KeySigner::generate());
        let imposter_signer = Arc::new(KeySigner::generate());

        let provider_side = DialogChannel::accept(
            client(&broker),
            provider_signer.clone() as Arc<dyn Signer>,
            consumer_signer.identity(),
            "topic",
        );
        provider_side
            .handle(
                "keepalive",
                handler_fn(|_| async move { Ok(Bytes::from_static(b"OK")) }),
            )
            .await
            .unwrap();

        // The imposter signs with its own key but claims the consumer's
        // dialog subjects; the provider drops the request, so it times out.
        let imposter_side = DialogChannel {
            client: client(&broker),
            signer: imposter_signer as Arc<dyn Signer>,
            peer: provider_signer.identity(),
            base_subject: format!("topic.{}", consumer_signer.identity().to_hex()),
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        };
        let err = imposter_side
            .send("keepalive", Bytes::new(), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, P2pError::Broker(_)));
    }
}
