//! Peer channel
//!
//! A channel is the capability set `{send, handle, close}` between two
//! authenticated identities. The concrete `P2pChannel` runs encrypted,
//! reliable, topic-multiplexed request/reply RPC over a punched UDP socket;
//! a legacy broker-backed implementation lives in `dialog`.
//!
//! Framing: every datagram is `nonce || ChaCha20-Poly1305(frame)` under
//! per-direction keys derived from the exchange keypair. Request, Response,
//! Error and Close frames are retransmitted until acked; requests carry a
//! per-topic sequence so handlers observe FIFO order exactly once.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce as ChaNonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout};
use tracing::{debug, trace, warn};
use wayfarer_crypto::{BoxPublicKey, BoxSecretKey, Identity};

use crate::error::{P2pError, P2pResult};

/// Default timeout for channel request/reply round trips
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(20);

const NONCE_SIZE: usize = 12;
const MAX_DATAGRAM: usize = 65_000;
const SEEN_WINDOW: u64 = 4096;
const CHANNEL_KDF_INITIATOR: &[u8] = b"wayfarer:p2p:channel:initiator";
const CHANNEL_KDF_RESPONDER: &[u8] = b"wayfarer:p2p:channel:responder";

/// An incoming request handed to a topic handler
pub struct IncomingRequest {
    /// Authenticated identity of the peer
    pub peer: Identity,
    /// Raw request payload
    pub data: Bytes,
}

/// Future returned by a topic handler
pub type HandlerFuture = Pin<Box<dyn Future<Output = P2pResult<Bytes>> + Send>>;

/// Handler registered for one topic
pub type TopicHandler = Arc<dyn Fn(IncomingRequest) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure into a `TopicHandler`
pub fn handler_fn<F, Fut>(f: F) -> TopicHandler
where
    F: Fn(IncomingRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = P2pResult<Bytes>> + Send + 'static,
{
    Arc::new(move |request| Box::pin(f(request)))
}

/// The channel capability: request/reply RPC with named topics between two
/// authenticated identities.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Send a request on `topic` and wait for the reply
    async fn send(&self, topic: &str, data: Bytes, wait: Duration) -> P2pResult<Bytes>;

    /// Register the handler for `topic`; replaces any previous handler
    async fn handle(&self, topic: &str, handler: TopicHandler) -> P2pResult<()>;

    /// The authenticated peer on the other end
    fn peer_identity(&self) -> Identity;

    /// Hand over the pre-punched service socket, if this transport has one
    async fn take_service_conn(&self) -> Option<UdpSocket>;

    /// Close the channel; idempotent
    async fn close(&self);
}

/// Serialize `msg`, send it on `topic`, decode the reply as `R`
pub async fn send_msg<T, R>(channel: &dyn Channel, topic: &str, msg: &T) -> P2pResult<R>
where
    T: Serialize + Sync,
    R: DeserializeOwned,
{
    let reply = channel
        .send(topic, Bytes::from(bincode::serialize(msg)?), DEFAULT_SEND_TIMEOUT)
        .await?;
    Ok(bincode::deserialize(&reply)?)
}

/// Retransmission and pacing knobs
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Delay before a reliable frame is sent again
    pub retry_interval: Duration,
    /// Resend attempts before the frame is declared lost
    pub max_retries: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_millis(300),
            max_retries: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum FrameKind {
    Request,
    Response,
    Error,
    Ack,
    Close,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Frame {
    /// Sender-scoped unique id
    id: u64,
    /// Request id this frame responds to or acknowledges
    re: u64,
    /// Per-topic FIFO sequence (requests only)
    seq: u64,
    kind: FrameKind,
    topic: String,
    payload: Vec<u8>,
}

#[derive(Default)]
struct TopicOrdering {
    next_seq: u64,
    buffered: BTreeMap<u64, Frame>,
}

struct ChannelInner {
    socket: UdpSocket,
    // Both ends of a punch can settle on different winning pairs; frames
    // authenticate themselves, so the peer address follows the traffic.
    peer_addr: Mutex<SocketAddr>,
    send_cipher: ChaCha20Poly1305,
    recv_cipher: ChaCha20Poly1305,
    peer: Identity,
    config: ChannelConfig,

    next_id: AtomicU64,
    topic_seq: Mutex<HashMap<String, u64>>,
    pending_acks: Mutex<HashMap<u64, oneshot::Sender<()>>>,
    waiting_responses: Mutex<HashMap<u64, oneshot::Sender<P2pResult<Bytes>>>>,
    handlers: Mutex<HashMap<String, TopicHandler>>,
    // Requests that arrived before their handler was registered.
    parked_requests: Mutex<HashMap<String, Vec<Frame>>>,
    ordering: Mutex<HashMap<String, TopicOrdering>>,
    seen: Mutex<HashSet<u64>>,
    closed: AtomicBool,
}

/// Direct, encrypted, NAT-traversed channel over UDP
pub struct P2pChannel {
    inner: Arc<ChannelInner>,
    service_conn: Mutex<Option<UdpSocket>>,
    recv_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for P2pChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("P2pChannel").finish_non_exhaustive()
    }
}

impl P2pChannel {
    /// Open a channel over a punched, unconnected socket.
    ///
    /// `is_initiator` decides the key direction split; the dialing side
    /// passes `true`, the listening side `false`.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        socket: UdpSocket,
        peer_addr: SocketAddr,
        is_initiator: bool,
        secret: &BoxSecretKey,
        peer_key: &BoxPublicKey,
        peer_identity: Identity,
        service_conn: Option<UdpSocket>,
        config: ChannelConfig,
    ) -> Arc<Self> {
        let (send_key, recv_key) = derive_channel_keys(secret, peer_key, is_initiator);

        let inner = Arc::new(ChannelInner {
            socket,
            peer_addr: Mutex::new(peer_addr),
            send_cipher: ChaCha20Poly1305::new_from_slice(&send_key)
                .expect("key length is fixed"),
            recv_cipher: ChaCha20Poly1305::new_from_slice(&recv_key)
                .expect("key length is fixed"),
            peer: peer_identity,
            config,
            next_id: AtomicU64::new(1),
            topic_seq: Mutex::new(HashMap::new()),
            pending_acks: Mutex::new(HashMap::new()),
            waiting_responses: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
            parked_requests: Mutex::new(HashMap::new()),
            ordering: Mutex::new(HashMap::new()),
            seen: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        });

        let recv_task = tokio::spawn(receive_loop(inner.clone()));

        Arc::new(Self {
            inner,
            service_conn: Mutex::new(service_conn),
            recv_task: Mutex::new(Some(recv_task)),
        })
    }

    /// Remote address the control socket currently talks to
    pub fn peer_addr(&self) -> SocketAddr {
        *self.inner.peer_addr.lock().expect("lock poisoned")
    }
}

#[async_trait]
impl Channel for P2pChannel {
    async fn send(&self, topic: &str, data: Bytes, wait: Duration) -> P2pResult<Bytes> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(P2pError::ChannelClosed);
        }

        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let seq = {
            let mut seqs = inner.topic_seq.lock().expect("lock poisoned");
            let entry = seqs.entry(topic.to_string()).or_insert(0);
            let seq = *entry;
            *entry += 1;
            seq
        };

        let (response_tx, response_rx) = oneshot::channel();
        inner
            .waiting_responses
            .lock()
            .expect("lock poisoned")
            .insert(id, response_tx);

        let frame = Frame {
            id,
            re: 0,
            seq,
            kind: FrameKind::Request,
            topic: topic.to_string(),
            payload: data.to_vec(),
        };
        send_reliable(inner.clone(), frame).await?;

        let result = match timeout(wait, response_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(P2pError::ChannelClosed),
            Err(_) => Err(P2pError::Timeout(topic.to_string())),
        };
        inner
            .waiting_responses
            .lock()
            .expect("lock poisoned")
            .remove(&id);
        result
    }

    async fn handle(&self, topic: &str, handler: TopicHandler) -> P2pResult<()> {
        let parked = {
            let mut handlers = self.inner.handlers.lock().expect("lock poisoned");
            handlers.insert(topic.to_string(), handler.clone());
            self.inner
                .parked_requests
                .lock()
                .expect("lock poisoned")
                .remove(topic)
                .unwrap_or_default()
        };
        for frame in parked {
            dispatch_request(self.inner.clone(), handler.clone(), frame);
        }
        Ok(())
    }

    fn peer_identity(&self) -> Identity {
        self.inner.peer
    }

    async fn take_service_conn(&self) -> Option<UdpSocket> {
        self.service_conn.lock().expect("lock poisoned").take()
    }

    async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(peer = %self.inner.peer, "closing p2p channel");

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let close_frame = Frame {
            id,
            re: 0,
            seq: 0,
            kind: FrameKind::Close,
            topic: String::new(),
            payload: Vec::new(),
        };
        // Best effort: one close frame, no retransmit storm on shutdown.
        let _ = send_frame(&self.inner, &close_frame).await;

        if let Some(task) = self.recv_task.lock().expect("lock poisoned").take() {
            task.abort();
        }
        fail_waiters(&self.inner);
    }
}

fn derive_channel_keys(
    secret: &BoxSecretKey,
    peer_key: &BoxPublicKey,
    is_initiator: bool,
) -> ([u8; 32], [u8; 32]) {
    let shared = secret.diffie_hellman(peer_key);
    let hkdf = Hkdf::<Sha256>::new(None, &shared);

    let mut initiator_key = [0u8; 32];
    let mut responder_key = [0u8; 32];
    hkdf.expand(CHANNEL_KDF_INITIATOR, &mut initiator_key)
        .expect("HKDF output length is valid");
    hkdf.expand(CHANNEL_KDF_RESPONDER, &mut responder_key)
        .expect("HKDF output length is valid");

    if is_initiator {
        (initiator_key, responder_key)
    } else {
        (responder_key, initiator_key)
    }
}

async fn send_frame(inner: &ChannelInner, frame: &Frame) -> P2pResult<()> {
    let plaintext = bincode::serialize(frame)?;

    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    let ciphertext = inner
        .send_cipher
        .encrypt(ChaNonce::from_slice(&nonce), plaintext.as_slice())
        .map_err(|_| P2pError::Codec("frame encryption failed".to_string()))?;

    let mut datagram = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    datagram.extend_from_slice(&nonce);
    datagram.extend_from_slice(&ciphertext);
    let peer_addr = *inner.peer_addr.lock().expect("lock poisoned");
    inner.socket.send_to(&datagram, peer_addr).await?;
    Ok(())
}

/// Send a frame and retransmit until acked or the retry budget runs out.
async fn send_reliable(inner: Arc<ChannelInner>, frame: Frame) -> P2pResult<()> {
    let (ack_tx, mut ack_rx) = oneshot::channel();
    inner
        .pending_acks
        .lock()
        .expect("lock poisoned")
        .insert(frame.id, ack_tx);

    let result = async {
        for attempt in 0..=inner.config.max_retries {
            send_frame(&inner, &frame).await?;
            tokio::select! {
                _ = &mut ack_rx => return Ok(()),
                _ = sleep(inner.config.retry_interval) => {
                    trace!(id = frame.id, attempt, topic = %frame.topic, "retransmitting frame");
                }
            }
            if inner.closed.load(Ordering::Acquire) {
                return Err(P2pError::ChannelClosed);
            }
        }
        Err(P2pError::Timeout(frame.topic.clone()))
    }
    .await;

    inner
        .pending_acks
        .lock()
        .expect("lock poisoned")
        .remove(&frame.id);
    result
}

async fn receive_loop(inner: Arc<ChannelInner>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, from) = match inner.socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(err) => {
                if !inner.closed.load(Ordering::Acquire) {
                    warn!(%err, "channel socket receive failed");
                }
                break;
            }
        };
        if len < NONCE_SIZE {
            continue;
        }

        let (nonce, ciphertext) = buf[..len].split_at(NONCE_SIZE);
        let plaintext = match inner
            .recv_cipher
            .decrypt(ChaNonce::from_slice(nonce), ciphertext)
        {
            Ok(plaintext) => plaintext,
            Err(_) => {
                trace!(%from, "dropping datagram that failed authentication");
                continue;
            }
        };

        let frame: Frame = match bincode::deserialize(&plaintext) {
            Ok(frame) => frame,
            Err(err) => {
                trace!(%err, "dropping undecodable frame");
                continue;
            }
        };

        match frame.kind {
            FrameKind::Ack => {
                if let Some(waiter) = inner
                    .pending_acks
                    .lock()
                    .expect("lock poisoned")
                    .remove(&frame.re)
                {
                    update_peer_addr(&inner, from);
                    let _ = waiter.send(());
                }
            }
            FrameKind::Close => {
                send_ack(&inner, frame.id).await;
                debug!(peer = %inner.peer, "peer closed the channel");
                inner.closed.store(true, Ordering::Release);
                fail_waiters(&inner);
                break;
            }
            FrameKind::Response | FrameKind::Error => {
                send_ack(&inner, frame.id).await;
                if !mark_seen(&inner, frame.id) {
                    continue;
                }
                update_peer_addr(&inner, from);
                let waiter = inner
                    .waiting_responses
                    .lock()
                    .expect("lock poisoned")
                    .remove(&frame.re);
                if let Some(waiter) = waiter {
                    let result = if frame.kind == FrameKind::Response {
                        Ok(Bytes::from(frame.payload))
                    } else {
                        Err(P2pError::Peer(
                            String::from_utf8_lossy(&frame.payload).into_owned(),
                        ))
                    };
                    let _ = waiter.send(result);
                }
            }
            FrameKind::Request => {
                send_ack(&inner, frame.id).await;
                if !mark_seen(&inner, frame.id) {
                    continue;
                }
                update_peer_addr(&inner, from);
                for ready in take_in_order(&inner, frame) {
                    route_request(&inner, ready);
                }
            }
        }
    }
}

/// Both ends of a punch can settle on different winning pairs, so fresh
/// authenticated traffic defines where the peer actually is. Replayed
/// frames are filtered before this point and cannot move the address.
fn update_peer_addr(inner: &ChannelInner, from: SocketAddr) {
    let mut peer_addr = inner.peer_addr.lock().expect("lock poisoned");
    if *peer_addr != from {
        debug!(old = %peer_addr, new = %from, "peer address moved");
        *peer_addr = from;
    }
}

/// Records a peer frame id; returns false for retransmitted duplicates.
fn mark_seen(inner: &ChannelInner, id: u64) -> bool {
    let mut seen = inner.seen.lock().expect("lock poisoned");
    if !seen.insert(id) {
        return false;
    }
    if id > SEEN_WINDOW {
        let floor = id - SEEN_WINDOW;
        seen.retain(|&old| old >= floor);
    }
    true
}

/// Buffers out-of-order requests and returns the run that is now in order.
fn take_in_order(inner: &ChannelInner, frame: Frame) -> Vec<Frame> {
    let mut ordering = inner.ordering.lock().expect("lock poisoned");
    let state = ordering.entry(frame.topic.clone()).or_default();

    if frame.seq < state.next_seq {
        return Vec::new();
    }
    state.buffered.insert(frame.seq, frame);

    let mut ready = Vec::new();
    while let Some(next) = state.buffered.remove(&state.next_seq) {
        state.next_seq += 1;
        ready.push(next);
    }
    ready
}

fn route_request(inner: &Arc<ChannelInner>, frame: Frame) {
    let handler = inner
        .handlers
        .lock()
        .expect("lock poisoned")
        .get(&frame.topic)
        .cloned();
    match handler {
        Some(handler) => dispatch_request(inner.clone(), handler, frame),
        None => {
            trace!(topic = %frame.topic, "parking request until handler registers");
            inner
                .parked_requests
                .lock()
                .expect("lock poisoned")
                .entry(frame.topic.clone())
                .or_default()
                .push(frame);
        }
    }
}

fn dispatch_request(inner: Arc<ChannelInner>, handler: TopicHandler, frame: Frame) {
    tokio::spawn(async move {
        let request = IncomingRequest {
            peer: inner.peer,
            data: Bytes::from(frame.payload),
        };
        let result = handler(request).await;

        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let reply = match result {
            Ok(payload) => Frame {
                id,
                re: frame.id,
                seq: 0,
                kind: FrameKind::Response,
                topic: frame.topic,
                payload: payload.to_vec(),
            },
            Err(err) => Frame {
                id,
                re: frame.id,
                seq: 0,
                kind: FrameKind::Error,
                topic: frame.topic,
                payload: err.to_string().into_bytes(),
            },
        };
        if let Err(err) = send_reliable(inner, reply).await {
            warn!(%err, "could not deliver reply");
        }
    });
}

async fn send_ack(inner: &ChannelInner, re: u64) {
    let ack = Frame {
        id: 0,
        re,
        seq: 0,
        kind: FrameKind::Ack,
        topic: String::new(),
        payload: Vec::new(),
    };
    if let Err(err) = send_frame(inner, &ack).await {
        trace!(%err, "ack send failed");
    }
}

/// Completes every in-flight request with `ChannelClosed`.
fn fail_waiters(inner: &ChannelInner) {
    let waiters: Vec<_> = inner
        .waiting_responses
        .lock()
        .expect("lock poisoned")
        .drain()
        .collect();
    for (_, waiter) in waiters {
        let _ = waiter.send(Err(P2pError::ChannelClosed));
    }
    inner.pending_acks.lock().expect("lock poisoned").clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use wayfarer_crypto::{BoxKeyPair, KeySigner, Signer};

    async fn connected_pair() -> (Arc<P2pChannel>, Arc<P2pChannel>) {
        let socket_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let socket_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr_a = socket_a.local_addr().unwrap();
        let addr_b = socket_b.local_addr().unwrap();

        let keys_a = BoxKeyPair::generate();
        let keys_b = BoxKeyPair::generate();
        let id_a = KeySigner::generate().identity();
        let id_b = KeySigner::generate().identity();

        let channel_a = P2pChannel::open(
            socket_a,
            addr_b,
            true,
            &keys_a.secret,
            &keys_b.public,
            id_b,
            None,
            ChannelConfig::default(),
        );
        let channel_b = P2pChannel::open(
            socket_b,
            addr_a,
            false,
            &keys_b.secret,
            &keys_a.public,
            id_a,
            None,
            ChannelConfig::default(),
        );
        (channel_a, channel_b)
    }

    #[tokio::test]
    async fn test_request_reply() {
        let (consumer, provider) = connected_pair().await;

        provider
            .handle(
                "echo",
                handler_fn(|request| async move {
                    let mut out = b"re:".to_vec();
                    out.extend_from_slice(&request.data);
                    Ok(Bytes::from(out))
                }),
            )
            .await
            .unwrap();

        let reply = consumer
            .send("echo", Bytes::from_static(b"ping"), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(reply.as_ref(), b"re:ping");
    }

    #[tokio::test]
    async fn test_handler_error_propagates() {
        let (consumer, provider) = connected_pair().await;

        provider
            .handle(
                "fail",
                handler_fn(|_| async move {
                    Err(P2pError::Peer("session does not exist".to_string()))
                }),
            )
            .await
            .unwrap();

        let err = consumer
            .send("fail", Bytes::new(), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, P2pError::Peer(msg) if msg.contains("session does not exist")));
    }

    #[tokio::test]
    async fn test_requests_before_handler_are_parked() {
        let (consumer, provider) = connected_pair().await;

        let send = {
            let consumer = consumer.clone();
            tokio::spawn(async move {
                consumer
                    .send("late", Bytes::from_static(b"x"), Duration::from_secs(3))
                    .await
            })
        };

        sleep(Duration::from_millis(150)).await;
        provider
            .handle(
                "late",
                handler_fn(|_| async move { Ok(Bytes::from_static(b"finally")) }),
            )
            .await
            .unwrap();

        let reply = send.await.unwrap().unwrap();
        assert_eq!(reply.as_ref(), b"finally");
    }

    #[tokio::test]
    async fn test_per_topic_fifo_order() {
        let (consumer, provider) = connected_pair().await;

        let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
        provider
            .handle(
                "ordered",
                handler_fn(move |request| {
                    let seen_tx = seen_tx.clone();
                    async move {
                        seen_tx.send(request.data.to_vec()).unwrap();
                        Ok(Bytes::new())
                    }
                }),
            )
            .await
            .unwrap();

        for i in 0u8..5 {
            consumer
                .send("ordered", Bytes::from(vec![i]), Duration::from_secs(2))
                .await
                .unwrap();
        }

        for expected in 0u8..5 {
            assert_eq!(seen_rx.recv().await.unwrap(), vec![expected]);
        }
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (consumer, _provider) = connected_pair().await;

        consumer.close().await;
        consumer.close().await; // idempotent

        let err = consumer
            .send("any", Bytes::new(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, P2pError::ChannelClosed));
    }

    #[tokio::test]
    async fn test_peer_close_fails_pending_sends() {
        let (consumer, provider) = connected_pair().await;

        let pending = {
            let consumer = consumer.clone();
            tokio::spawn(async move {
                consumer
                    .send("void", Bytes::new(), Duration::from_secs(5))
                    .await
            })
        };
        sleep(Duration::from_millis(100)).await;
        provider.close().await;

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, P2pError::ChannelClosed));
    }

    #[tokio::test]
    async fn test_typed_send_msg() {
        let (consumer, provider) = connected_pair().await;

        #[derive(Serialize, Deserialize)]
        struct Ping {
            session_id: String,
        }

        provider
            .handle(
                "typed",
                handler_fn(|request| async move {
                    let ping: Ping = bincode::deserialize(&request.data)
                        .map_err(|e| P2pError::Codec(e.to_string()))?;
                    Ok(Bytes::from(bincode::serialize(&ping.session_id).unwrap()))
                }),
            )
            .await
            .unwrap();

        let reply: String = send_msg(
            consumer.as_ref(),
            "typed",
            &Ping {
                session_id: "abc".to_string(),
            },
        )
        .await
        .unwrap();
        assert_eq!(reply, "abc");
    }
}
