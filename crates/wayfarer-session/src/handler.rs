//! Provider-side channel wiring
//!
//! Registers the session topics on an accepted channel and translates
//! between wire messages and the session manager. Every operation that
//! names a session also names a consumer; the authenticated channel peer
//! must match the named consumer, and the manager additionally checks the
//! owner recorded at creation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info, warn};
use wayfarer_p2p::{handler_fn, send_msg, topics, Channel, P2pError, P2pResult};

use crate::error::{SessionError, SessionErrorKind, SessionResult};
use crate::manager::Manager;
use crate::messages::{
    KeepAlivePing, SessionInfo, SessionReply, SessionRequest, SessionResponse, SessionStatus,
    PAYMENT_VERSION_V3,
};
use crate::types::SessionId;

/// Keep-alive pacing shared by both directions
#[derive(Debug, Clone)]
pub struct KeepAliveConfig {
    pub send_interval: Duration,
    pub send_timeout: Duration,
    pub max_send_err_count: u32,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            send_interval: Duration::from_secs(20),
            send_timeout: Duration::from_secs(5),
            max_send_err_count: 5,
        }
    }
}

/// Produces the provider-side tunnel config during session create
#[async_trait]
pub trait ServiceConfigProvider: Send + Sync {
    async fn provide_config(
        &self,
        session_id: &SessionId,
        consumer_config: &[u8],
    ) -> SessionResult<Vec<u8>>;
}

/// Handles the session protocol on accepted channels
pub struct SessionHandler {
    manager: Arc<Manager>,
    config_provider: Arc<dyn ServiceConfigProvider>,
    keep_alive: KeepAliveConfig,
}

impl SessionHandler {
    pub fn new(
        manager: Arc<Manager>,
        config_provider: Arc<dyn ServiceConfigProvider>,
        keep_alive: KeepAliveConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            config_provider,
            keep_alive,
        })
    }

    /// Register all session topics on `channel`
    pub async fn attach(self: &Arc<Self>, channel: Arc<dyn Channel>) -> P2pResult<()> {
        let create = {
            let this = self.clone();
            let channel = channel.clone();
            handler_fn(move |request| {
                let this = this.clone();
                let channel = channel.clone();
                async move {
                    let req: SessionRequest = decode(&request.data)?;
                    let reply: SessionReply<SessionResponse> = this
                        .handle_create(request.peer, req, channel)
                        .await
                        .map_err(|err| wire_kind(&err));
                    encode(&reply)
                }
            })
        };
        channel.handle(topics::SESSION_CREATE, create).await?;

        let acknowledge = {
            let this = self.clone();
            handler_fn(move |request| {
                let this = this.clone();
                async move {
                    let info: SessionInfo = decode(&request.data)?;
                    let reply: SessionReply<()> = this
                        .checked(request.peer, &info, |manager, consumer, id| async move {
                            manager.acknowledge(consumer, &id).await
                        })
                        .await
                        .map_err(|err| wire_kind(&err));
                    encode(&reply)
                }
            })
        };
        channel.handle(topics::SESSION_ACKNOWLEDGE, acknowledge).await?;

        let destroy = {
            let this = self.clone();
            handler_fn(move |request| {
                let this = this.clone();
                async move {
                    let info: SessionInfo = decode(&request.data)?;
                    let reply: SessionReply<()> = this
                        .checked(request.peer, &info, |manager, consumer, id| async move {
                            manager.destroy(consumer, &id).await
                        })
                        .await
                        .map_err(|err| wire_kind(&err));
                    encode(&reply)
                }
            })
        };
        channel.handle(topics::SESSION_DESTROY, destroy).await?;

        let status = {
            handler_fn(move |request| async move {
                let status: SessionStatus = decode(&request.data)?;
                if status.consumer_id != request.peer {
                    warn!(sender = %request.peer, "session status with mismatched consumer id");
                } else {
                    // Telemetry only; the state machine is untouched.
                    info!(
                        session = %status.session_id,
                        code = ?status.code,
                        message = %status.message,
                        "peer reported connectivity status"
                    );
                }
                let reply: SessionReply<()> = Ok(());
                encode(&reply)
            })
        };
        channel.handle(topics::SESSION_STATUS, status).await?;

        let keep_alive = {
            let this = self.clone();
            handler_fn(move |request| {
                let this = this.clone();
                async move {
                    let ping: KeepAlivePing = decode(&request.data)?;
                    let session_id = SessionId::from(ping.session_id);
                    let reply: SessionReply<()> = match this.manager.find(&session_id) {
                        Some(session) if session.consumer_id == request.peer => {
                            session.touch();
                            Ok(())
                        }
                        Some(_) => Err(SessionErrorKind::WrongSessionOwner),
                        None => Err(SessionErrorKind::SessionNotFound),
                    };
                    encode(&reply)
                }
            })
        };
        channel.handle(topics::KEEP_ALIVE, keep_alive).await?;

        Ok(())
    }

    async fn handle_create(
        &self,
        peer: wayfarer_crypto::Identity,
        request: SessionRequest,
        channel: Arc<dyn Channel>,
    ) -> SessionResult<SessionResponse> {
        let consumer_info = request
            .consumer
            .ok_or(SessionError::UnsupportedVersion)?;
        if consumer_info.id != peer {
            return Err(SessionError::WrongSessionOwner);
        }

        let manager = self.manager.clone();
        let session = manager
            .start(peer, &consumer_info, request.proposal_id, request.config)
            .await?;

        let provider_config = self
            .config_provider
            .provide_config(&session.id, &session.config)
            .await?;

        self.spawn_keep_alive_sender(channel, session.clone());
        self.spawn_keep_alive_monitor(session.clone());

        Ok(SessionResponse {
            id: session.id.to_string(),
            config: provider_config,
            payment_info: PAYMENT_VERSION_V3.to_string(),
        })
    }

    /// Shared owner-rule plumbing for operations carrying `SessionInfo`
    async fn checked<F, Fut>(
        &self,
        peer: wayfarer_crypto::Identity,
        info: &SessionInfo,
        operation: F,
    ) -> SessionResult<()>
    where
        F: FnOnce(Arc<Manager>, wayfarer_crypto::Identity, SessionId) -> Fut,
        Fut: std::future::Future<Output = SessionResult<()>>,
    {
        if info.consumer_id != peer {
            return Err(SessionError::WrongSessionOwner);
        }
        operation(
            self.manager.clone(),
            info.consumer_id,
            SessionId::from(info.session_id.clone()),
        )
        .await
    }

    /// Provider pings the consumer too; repeated failures destroy the session.
    fn spawn_keep_alive_sender(&self, channel: Arc<dyn Channel>, session: crate::types::Session) {
        let config = self.keep_alive.clone();
        let manager = self.manager.clone();
        tokio::spawn(async move {
            let mut err_count = 0u32;
            loop {
                tokio::select! {
                    _ = session.done.wait() => {
                        debug!(id = %session.id, "keep-alive sender stopping, session done");
                        return;
                    }
                    _ = tokio::time::sleep(config.send_interval) => {}
                }

                let ping = KeepAlivePing {
                    session_id: session.id.to_string(),
                };
                let result: P2pResult<SessionReply<()>> = async {
                    let data = Bytes::from(
                        bincode::serialize(&ping).map_err(|e| P2pError::Codec(e.to_string()))?,
                    );
                    let reply = channel
                        .send(topics::KEEP_ALIVE, data, config.send_timeout)
                        .await?;
                    bincode::deserialize(&reply).map_err(|e| P2pError::Codec(e.to_string()))
                }
                .await;

                match result {
                    Ok(_) => err_count = 0,
                    Err(err) => {
                        warn!(id = %session.id, %err, "keep-alive ping failed");
                        err_count += 1;
                        if err_count >= config.max_send_err_count {
                            warn!(id = %session.id, "keep-alive failures exhausted, destroying session");
                            let _ = manager.destroy(session.consumer_id, &session.id).await;
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Passive liveness: a peer whose pings stop arriving is dead even if
    /// it still answers ours. Silence past 2.5 send intervals destroys the
    /// session.
    fn spawn_keep_alive_monitor(&self, session: crate::types::Session) {
        let config = self.keep_alive.clone();
        let manager = self.manager.clone();
        tokio::spawn(async move {
            // The create round trip counts as the first sign of life.
            session.touch();
            let max_silence = config.send_interval * 5 / 2;
            loop {
                tokio::select! {
                    _ = session.done.wait() => {
                        debug!(id = %session.id, "keep-alive monitor stopping, session done");
                        return;
                    }
                    _ = tokio::time::sleep(config.send_interval) => {}
                }

                let silent_for = session
                    .last_keep_alive()
                    .map(|at| at.elapsed())
                    .unwrap_or(max_silence);
                if silent_for >= max_silence {
                    warn!(
                        id = %session.id,
                        ?silent_for,
                        "no keep-alive from peer, destroying session"
                    );
                    let _ = manager.destroy(session.consumer_id, &session.id).await;
                    return;
                }
            }
        });
    }
}

fn decode<T: serde::de::DeserializeOwned>(data: &[u8]) -> P2pResult<T> {
    bincode::deserialize(data).map_err(|e| P2pError::Codec(e.to_string()))
}

fn encode<T: serde::Serialize>(value: &T) -> P2pResult<Bytes> {
    Ok(Bytes::from(
        bincode::serialize(value).map_err(|e| P2pError::Codec(e.to_string()))?,
    ))
}

fn wire_kind(err: &SessionError) -> SessionErrorKind {
    SessionErrorKind::from(err)
}

/// Consumer-facing helper: send one keep-alive ping
pub async fn send_keep_alive(
    channel: &dyn Channel,
    session_id: &SessionId,
    timeout: Duration,
) -> SessionResult<()> {
    let ping = KeepAlivePing {
        session_id: session_id.to_string(),
    };
    let reply = channel
        .send(topics::KEEP_ALIVE, encode(&ping)?, timeout)
        .await?;
    let reply: SessionReply<()> = bincode::deserialize(&reply)?;
    reply.map_err(SessionError::from)
}

/// Typed request helper shared by the consumer-side operations
pub(crate) async fn request<T, R>(
    channel: &dyn Channel,
    topic: &str,
    message: &T,
) -> SessionResult<R>
where
    T: serde::Serialize + Sync,
    R: serde::de::DeserializeOwned,
{
    let reply: SessionReply<R> = send_msg(channel, topic, message).await?;
    reply.map_err(SessionError::from)
}
