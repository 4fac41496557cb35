//! Consumer connection manager
//!
//! Wires broker, p2p channel, session protocol, payments and the tunnel
//! into one linear `connect` with strict cleanup discipline: every acquired
//! resource pushes a closure onto one of two LIFO stacks. The `cleanup`
//! stack runs on every exit; `cleanup_after_disconnect` runs after the
//! session context is cancelled, for steps that still need the channel
//! open, like the session destroy request.

use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use wayfarer_broker::{BrokerClient, BrokerError};
use wayfarer_crypto::{Identity, SignerFactory};
use wayfarer_market::Proposal;
use wayfarer_p2p::{Channel, Dialer, DialogChannel, IpResolver, P2pError};
use wayfarer_session::{
    acknowledge_session, request_session_create, request_session_destroy, send_keep_alive,
    send_session_status, ConsumerInfo, DoneSignal, PaymentEngine, SessionId, StatusCode,
    PAYMENT_VERSION_V3,
};

use crate::bus::{AppEvent, ConsumerSessionStatus, EventBus};
use crate::capabilities::{ConnectOptions, TunnelFactory, TunnelState};
use crate::config::NodeConfig;
use crate::error::{NodeError, NodeResult};
use crate::stats::{spawn_stats_publisher, SharedTraffic};

/// Consumer connection state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    NotConnected,
    Connecting,
    Connected,
    Reconnecting,
    Disconnecting,
    Canceled,
}

/// Current status exposed to the control plane
#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub session_id: Option<SessionId>,
    pub proposal: Option<Proposal>,
}

/// Caller-supplied connect options
#[derive(Debug, Clone, Default)]
pub struct ConnectParams {
    pub dns: Option<String>,
}

/// Everything a consumer payment engine needs at creation
pub struct PaymentChannelArgs {
    pub channel: Arc<dyn Channel>,
    pub consumer_id: Identity,
    pub provider_id: Identity,
    pub hermes_id: Identity,
    pub proposal: Proposal,
    pub session_id: SessionId,
    pub traffic: Arc<SharedTraffic>,
}

/// Builds the consumer payment engine for one session
pub type ConsumerPaymentEngineFactory =
    Arc<dyn Fn(PaymentChannelArgs) -> NodeResult<Arc<dyn PaymentEngine>> + Send + Sync>;

/// Opens broker clients for a contact's addresses
pub type BrokerClientFactory = Arc<dyn Fn(&[String]) -> Arc<BrokerClient> + Send + Sync>;

type CleanupFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

struct CleanupStep {
    name: &'static str,
    run: Box<dyn FnOnce() -> CleanupFuture + Send>,
}

#[derive(Clone)]
struct CurrentSession {
    session_id: SessionId,
    consumer_id: Identity,
    proposal: Proposal,
}

/// Orchestrates the consumer side of one connection at a time
pub struct ConnectionManager {
    broker_factory: BrokerClientFactory,
    dialer: Arc<Dialer>,
    signer_factory: SignerFactory,
    payment_factory: ConsumerPaymentEngineFactory,
    tunnel_factory: TunnelFactory,
    ip_resolver: Arc<dyn IpResolver>,
    validator: Arc<dyn crate::capabilities::ConnectValidator>,
    bus: EventBus,
    config: NodeConfig,

    status: Mutex<ConnectionStatus>,
    current_session: Arc<Mutex<Option<CurrentSession>>>,
    cleanup: Mutex<Vec<CleanupStep>>,
    cleanup_after_disconnect: Mutex<Vec<CleanupStep>>,
    ctx: Mutex<Option<DoneSignal>>,
    disco_lock: tokio::sync::Mutex<()>,
}

impl ConnectionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        broker_factory: BrokerClientFactory,
        dialer: Arc<Dialer>,
        signer_factory: SignerFactory,
        payment_factory: ConsumerPaymentEngineFactory,
        tunnel_factory: TunnelFactory,
        ip_resolver: Arc<dyn IpResolver>,
        validator: Arc<dyn crate::capabilities::ConnectValidator>,
        bus: EventBus,
        config: NodeConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            broker_factory,
            dialer,
            signer_factory,
            payment_factory,
            tunnel_factory,
            ip_resolver,
            validator,
            bus,
            config,
            status: Mutex::new(ConnectionStatus {
                state: ConnectionState::NotConnected,
                session_id: None,
                proposal: None,
            }),
            current_session: Arc::new(Mutex::new(None)),
            cleanup: Mutex::new(Vec::new()),
            cleanup_after_disconnect: Mutex::new(Vec::new()),
            ctx: Mutex::new(None),
            disco_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Current connection status
    pub fn status(&self) -> ConnectionStatus {
        self.status.lock().expect("status lock poisoned").clone()
    }

    /// Connect to `proposal` as `consumer_id`, paying through `hermes_id`.
    ///
    /// There is no overall timeout; the attempt is bounded by each step's
    /// own timeout and can be aborted with `cancel`.
    pub async fn connect(
        self: &Arc<Self>,
        consumer_id: Identity,
        hermes_id: Identity,
        proposal: Proposal,
        params: ConnectParams,
    ) -> NodeResult<()> {
        if self.status().state != ConnectionState::NotConnected {
            return Err(NodeError::AlreadyExists);
        }
        self.validator.validate(&consumer_id, &proposal)?;

        let ctx = DoneSignal::new();
        *self.ctx.lock().expect("ctx lock poisoned") = Some(ctx.clone());
        self.set_state(ConnectionState::Connecting);

        match self
            .do_connect(ctx, consumer_id, hermes_id, proposal, params)
            .await
        {
            Ok(()) => Ok(()),
            Err(err) => {
                error!(%err, "connect failed, disconnecting");
                self.disconnect_inner().await;
                Err(err)
            }
        }
    }

    async fn do_connect(
        self: &Arc<Self>,
        ctx: DoneSignal,
        consumer_id: Identity,
        hermes_id: Identity,
        proposal: Proposal,
        params: ConnectParams,
    ) -> NodeResult<()> {
        let signer = (self.signer_factory)(&consumer_id).ok_or(NodeError::Unregistered)?;
        let provider_id = proposal.provider_id;

        let contact = proposal
            .broker_contact()
            .cloned()
            .ok_or_else(|| NodeError::ConnectionFailed("proposal has no broker contact".into()))?;
        let broker = (self.broker_factory)(&contact.broker_addresses);

        // Direct channel first; a provider that does not serve the exchange
        // subjects gets the legacy broker dialog instead.
        let channel: Arc<dyn Channel> = match self
            .dialer
            .dial(&broker, signer.clone(), provider_id)
            .await
        {
            Ok(channel) => channel,
            Err(P2pError::Broker(BrokerError::Timeout(_))) => {
                debug!(%provider_id, "provider does not support p2p, falling back to dialog");
                DialogChannel::dial(broker.clone(), signer.clone(), provider_id, &contact.topic)
            }
            Err(err) => return Err(err.into()),
        };
        {
            let channel = channel.clone();
            self.add_cleanup_after_disconnect("closing peer channel", move || {
                Box::pin(async move { channel.close().await })
            });
        }

        let tunnel = (self.tunnel_factory)(&proposal.service_type)?;
        let session_config = tunnel.get_config().await?;

        let consumer_info = ConsumerInfo {
            id: consumer_id,
            hermes_id,
            payment_version: PAYMENT_VERSION_V3.to_string(),
        };
        let dto = match request_session_create(
            channel.as_ref(),
            consumer_info,
            proposal.id,
            session_config,
        )
        .await
        {
            Ok(dto) => dto,
            Err(err) => {
                let _ = send_session_status(
                    channel.as_ref(),
                    consumer_id,
                    &SessionId::from(String::new()),
                    StatusCode::SessionEstablishmentFailed,
                    err.to_string(),
                )
                .await;
                return Err(err.into());
            }
        };
        info!(session = %dto.id, %provider_id, "session created");

        self.save_session(CurrentSession {
            session_id: dto.id.clone(),
            consumer_id,
            proposal: proposal.clone(),
        });
        {
            let channel = channel.clone();
            let session_id = dto.id.clone();
            self.add_cleanup_after_disconnect("requesting session destroy", move || {
                Box::pin(async move {
                    if let Err(err) =
                        request_session_destroy(channel.as_ref(), consumer_id, &session_id).await
                    {
                        warn!(%err, "session destroy request failed");
                    }
                })
            });
        }

        // Payments run for exactly as long as the session exists.
        let traffic = Arc::new(SharedTraffic::default());
        let engine = (self.payment_factory)(PaymentChannelArgs {
            channel: channel.clone(),
            consumer_id,
            provider_id,
            hermes_id,
            proposal: proposal.clone(),
            session_id: dto.id.clone(),
            traffic: traffic.clone(),
        })?;
        {
            let engine = engine.clone();
            self.add_cleanup("stopping payments", move || {
                Box::pin(async move { engine.stop() })
            });
        }
        {
            let manager = self.clone();
            let channel = channel.clone();
            let session_id = dto.id.clone();
            self.bus.spawn_tracked("payments", async move {
                if let Err(err) = engine.start().await {
                    error!(%err, "payment error");
                    let _ = send_session_status(
                        channel.as_ref(),
                        consumer_id,
                        &session_id,
                        StatusCode::SessionPaymentsFailed,
                        err.clone(),
                    )
                    .await;
                    let _ = manager.disconnect().await;
                }
            });
        }

        let original_ip = self.ip_resolver.public_ip().await.ok();

        let options = ConnectOptions {
            session_id: dto.id.clone(),
            session_config: dto.config,
            consumer_id,
            provider_id,
            dns: params.dns,
            service_conn: channel.take_service_conn().await,
        };
        let mut states = tunnel.start(options).await?;
        {
            let tunnel = tunnel.clone();
            self.add_cleanup("stopping tunnel", move || {
                Box::pin(async move { tunnel.stop().await })
            });
        }

        let stats_done = DoneSignal::new();
        spawn_stats_publisher(
            self.bus.clone(),
            tunnel.clone(),
            dto.id.clone(),
            self.config.stats_report_interval,
            traffic,
            stats_done.clone(),
        );
        self.add_cleanup("stopping statistics publisher", move || {
            Box::pin(async move {
                stats_done.close();
            })
        });

        // Block until the tunnel reports Connected or the attempt is
        // cancelled out from under us.
        loop {
            tokio::select! {
                _ = ctx.wait() => return Err(NodeError::Cancelled),
                state = states.recv() => match state {
                    None => {
                        return Err(NodeError::ConnectionFailed(
                            "tunnel state channel closed".into(),
                        ))
                    }
                    Some(TunnelState::Connected) => break,
                    Some(state) => self.on_tunnel_state(state),
                },
            }
        }
        self.set_state(ConnectionState::Connected);

        // Acknowledge in the background; a lost ack is not fatal.
        {
            let channel = channel.clone();
            let session_id = dto.id.clone();
            tokio::spawn(async move {
                if let Err(err) =
                    acknowledge_session(channel.as_ref(), consumer_id, &session_id).await
                {
                    warn!(%err, "acknowledge failed");
                }
            });
        }

        // Remaining tunnel states drive the status; a closed channel means
        // the tunnel died underneath us.
        {
            let manager = self.clone();
            self.bus.spawn_tracked("tunnel state consumer", async move {
                while let Some(state) = states.recv().await {
                    manager.on_tunnel_state(state);
                }
                debug!("tunnel state channel closed");
                let _ = manager.disconnect().await;
            });
        }

        // Connection waiter: tunnel exit triggers disconnect.
        {
            let manager = self.clone();
            let tunnel = tunnel.clone();
            self.bus.spawn_tracked("connection waiter", async move {
                match tunnel.wait().await {
                    Ok(()) => info!("connection exited"),
                    Err(err) => warn!(%err, "connection exited with error"),
                }
                let _ = manager.disconnect().await;
            });
        }

        self.spawn_keep_alive_loop(channel.clone(), dto.id.clone(), ctx.clone());
        self.spawn_ip_check(channel, consumer_id, dto.id.clone(), original_ip, ctx);

        Ok(())
    }

    /// Tear the connection down; safe to call concurrently and repeatedly
    pub async fn disconnect(&self) -> NodeResult<()> {
        if self.status().state == ConnectionState::NotConnected {
            return Err(NodeError::NoConnection);
        }
        self.set_state(ConnectionState::Disconnecting);
        self.disconnect_inner().await;
        Ok(())
    }

    /// Abort a connect in progress
    pub async fn cancel(&self) {
        self.set_state(ConnectionState::Canceled);
        match self.disconnect().await {
            Ok(()) | Err(NodeError::NoConnection) => {}
            Err(err) => error!(%err, "disconnect error"),
        }
    }

    async fn disconnect_inner(&self) {
        let _guard = self.disco_lock.lock().await;

        if let Some(ctx) = self.ctx.lock().expect("ctx lock poisoned").take() {
            ctx.close();
        }

        self.run_cleanup_stack(&self.cleanup).await;
        self.set_state(ConnectionState::NotConnected);
        self.run_cleanup_stack(&self.cleanup_after_disconnect).await;
    }

    async fn run_cleanup_stack(&self, stack: &Mutex<Vec<CleanupStep>>) {
        let steps: Vec<CleanupStep> = {
            let mut stack = stack.lock().expect("cleanup lock poisoned");
            stack.drain(..).collect()
        };
        for step in steps.into_iter().rev() {
            debug!(step = step.name, "connection cleaning up");
            (step.run)().await;
        }
    }

    fn add_cleanup<F>(&self, name: &'static str, run: F)
    where
        F: FnOnce() -> CleanupFuture + Send + 'static,
    {
        self.cleanup
            .lock()
            .expect("cleanup lock poisoned")
            .push(CleanupStep {
                name,
                run: Box::new(run),
            });
    }

    fn add_cleanup_after_disconnect<F>(&self, name: &'static str, run: F)
    where
        F: FnOnce() -> CleanupFuture + Send + 'static,
    {
        self.cleanup_after_disconnect
            .lock()
            .expect("cleanup lock poisoned")
            .push(CleanupStep {
                name,
                run: Box::new(run),
            });
    }

    fn save_session(&self, session: CurrentSession) {
        let session_id = session.session_id.clone();
        *self
            .current_session
            .lock()
            .expect("session lock poisoned") = Some(session);

        self.bus.publish(AppEvent::ConsumerSession {
            status: ConsumerSessionStatus::Created,
            session_id: session_id.clone(),
        });

        let bus = self.bus.clone();
        let session_slot = self.current_session.clone();
        self.add_cleanup("publishing session ended", move || {
            Box::pin(async move {
                bus.publish(AppEvent::ConsumerSession {
                    status: ConsumerSessionStatus::Ended,
                    session_id,
                });
                *session_slot.lock().expect("session lock poisoned") = None;
            })
        });
    }

    fn on_tunnel_state(&self, state: TunnelState) {
        debug!(?state, "tunnel state changed");
        match state {
            TunnelState::Connected => self.set_state(ConnectionState::Connected),
            TunnelState::Reconnecting => self.set_state(ConnectionState::Reconnecting),
            _ => {
                let session_id = self.status().session_id;
                self.bus.publish(AppEvent::ConnectionState {
                    state: self.status().state,
                    session_id,
                });
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let session = self
            .current_session
            .lock()
            .expect("session lock poisoned")
            .clone();
        {
            let mut status = self.status.lock().expect("status lock poisoned");
            info!("connection state: {:?} -> {:?}", status.state, state);
            status.state = state;
            status.session_id = session.as_ref().map(|s| s.session_id.clone());
            status.proposal = session.as_ref().map(|s| s.proposal.clone());
        }
        self.bus.publish(AppEvent::ConnectionState {
            state,
            session_id: session.map(|s| s.session_id),
        });
    }

    fn spawn_keep_alive_loop(
        self: &Arc<Self>,
        channel: Arc<dyn Channel>,
        session_id: SessionId,
        ctx: DoneSignal,
    ) {
        let manager = self.clone();
        let config = self.config.keep_alive.clone();
        self.bus.spawn_tracked("keep-alive", async move {
            // Answer the provider's pings too; liveness runs both ways.
            let responder = wayfarer_p2p::handler_fn(|_request| async move {
                let reply: Result<(), wayfarer_session::SessionErrorKind> = Ok(());
                Ok(bytes::Bytes::from(
                    bincode::serialize(&reply).expect("unit reply encodes"),
                ))
            });
            if let Err(err) = channel
                .handle(wayfarer_p2p::topics::KEEP_ALIVE, responder)
                .await
            {
                warn!(%err, "could not register keep-alive responder");
            }

            let mut err_count = 0u32;
            loop {
                tokio::select! {
                    _ = ctx.wait() => {
                        debug!(%session_id, "stopping keep-alive");
                        return;
                    }
                    _ = sleep(config.send_interval) => {}
                }

                match send_keep_alive(channel.as_ref(), &session_id, config.send_timeout).await {
                    Ok(()) => err_count = 0,
                    Err(err) => {
                        warn!(%session_id, %err, "failed to send keep-alive ping");
                        err_count += 1;
                        if err_count >= config.max_send_err_count {
                            error!(%session_id, "max keep-alive errors reached, disconnecting");
                            let _ = manager.disconnect().await;
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Verifies the tunnel actually moved this node's public IP; notifies
    /// the provider either way.
    fn spawn_ip_check(
        self: &Arc<Self>,
        channel: Arc<dyn Channel>,
        consumer_id: Identity,
        session_id: SessionId,
        original_ip: Option<IpAddr>,
        ctx: DoneSignal,
    ) {
        let manager = self.clone();
        let config = self.config.ip_check.clone();
        self.bus.spawn_tracked("ip check", async move {
            for attempt in 1..=config.max_attempts {
                if manager.status().state != ConnectionState::Connected {
                    return;
                }

                let current_ip = manager.ip_resolver.public_ip().await.ok();
                if current_ip != original_ip {
                    let _ = send_session_status(
                        channel.as_ref(),
                        consumer_id,
                        &session_id,
                        StatusCode::ConnectionOk,
                        String::new(),
                    )
                    .await;
                    return;
                }

                if attempt == config.max_attempts {
                    let _ = send_session_status(
                        channel.as_ref(),
                        consumer_id,
                        &session_id,
                        StatusCode::SessionIpNotChanged,
                        String::new(),
                    )
                    .await;
                    manager
                        .bus
                        .publish(AppEvent::IpNotChanged { session_id });
                    return;
                }

                tokio::select! {
                    _ = ctx.wait() => return,
                    _ = sleep(config.sleep_after_check) => {}
                }
            }
        });
    }
}
