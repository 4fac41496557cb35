//! Config exchange and channel establishment
//!
//! Three signed messages over the broker bootstrap a direct channel between
//! two identities that have never met:
//!
//! 1. consumer -> provider: fresh public key
//! 2. provider -> consumer: fresh public key + sealed connect config
//! 3. consumer -> provider: sealed connect config (ack leg)
//!
//! The provider keeps a pending entry keyed by the consumer's public key
//! between legs 2 and 3. After leg 3 both sides hole punch; the provider
//! starts pinging before it publishes the final OK so its NAT opens first.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use wayfarer_broker::{pack_signed, unpack_signed, BrokerClient};
use wayfarer_crypto::{boxes, BoxKeyPair, BoxPublicKey, BoxSecretKey, Identity, Signer};

use crate::channel::{ChannelConfig, P2pChannel};
use crate::error::{P2pError, P2pResult};
use crate::ip::IpResolver;
use crate::messages::{
    exchange_ack_subject, exchange_subject, ConfigExchangeMsg, ConnectConfig,
};
use crate::pinger::{start_punch, PingConfig, PunchAttempt, PING_MAX_PORTS};
use crate::ports::{PortGuard, PortPool};

/// Callback invoked with every accepted channel on the provider side
pub type ChannelHandler = Arc<dyn Fn(Arc<P2pChannel>) + Send + Sync>;

/// Consumer-side channel establishment
pub struct Dialer {
    ip_resolver: Arc<dyn IpResolver>,
    port_pool: PortPool,
    channel_config: ChannelConfig,
    ping_config: PingConfig,
}

impl Dialer {
    pub fn new(ip_resolver: Arc<dyn IpResolver>, port_pool: PortPool) -> Self {
        Self {
            ip_resolver,
            port_pool,
            channel_config: ChannelConfig::default(),
            ping_config: PingConfig::consumer(),
        }
    }

    pub fn with_ping_config(mut self, ping_config: PingConfig) -> Self {
        self.ping_config = ping_config;
        self
    }

    /// Exchange configs with `provider` over the broker, traverse NAT and
    /// return a ready channel.
    pub async fn dial(
        &self,
        client: &BrokerClient,
        signer: Arc<dyn Signer>,
        provider: Identity,
    ) -> P2pResult<Arc<P2pChannel>> {
        let keys = BoxKeyPair::generate();

        // Leg 1: our fresh key, nothing else.
        let hello = ConfigExchangeMsg {
            public_key: keys.public.to_hex(),
            config_ciphertext: Vec::new(),
        };
        debug!(%provider, "sending p2p config exchange");
        let reply = client
            .request(
                &exchange_subject(&provider),
                Bytes::from(pack_signed(signer.as_ref(), &hello)?),
            )
            .await?;

        // Leg 2: the provider's key and sealed connect config.
        let (exchange, sender) = unpack_signed::<ConfigExchangeMsg>(&reply)?;
        if sender != provider {
            return Err(P2pError::UnexpectedPeer {
                expected: provider.to_hex(),
                actual: sender.to_hex(),
            });
        }
        let provider_key = BoxPublicKey::from_hex(&exchange.public_key)?;
        let provider_config: ConnectConfig = bincode::deserialize(&boxes::open(
            &keys.secret,
            &provider_key,
            &exchange.config_ciphertext,
        )?)?;
        debug!(?provider_config, "received provider connect config");

        // Leg 3: our sealed connect config on the ack subject.
        let public_ip = self.ip_resolver.public_ip().await?;
        let local_ports = self.port_pool.acquire_multiple(PING_MAX_PORTS)?;
        let my_config = ConnectConfig {
            public_ip,
            ports: local_ports.iter().map(|g| g.num()).collect(),
        };
        let ack = ConfigExchangeMsg {
            public_key: keys.public.to_hex(),
            config_ciphertext: boxes::seal(
                &keys.secret,
                &provider_key,
                &bincode::serialize(&my_config)?,
            )?,
        };
        client
            .request(
                &exchange_ack_subject(&provider),
                Bytes::from(pack_signed(signer.as_ref(), &ack)?),
            )
            .await?;

        let (socket, peer_addr, service_conn) = establish_conns(
            provider_config.public_ip,
            &provider_config.ports,
            local_ports,
            self.ping_config.clone(),
        )
        .await?;

        info!(%provider, %peer_addr, "p2p channel established");
        Ok(P2pChannel::open(
            socket,
            peer_addr,
            true,
            &keys.secret,
            &provider_key,
            provider,
            service_conn,
            self.channel_config.clone(),
        ))
    }
}

struct PendingExchange {
    secret: BoxSecretKey,
    peer_key: BoxPublicKey,
    consumer: Identity,
    local_ports: Vec<PortGuard>,
}

/// Provider-side channel acceptance
pub struct Listener {
    ip_resolver: Arc<dyn IpResolver>,
    port_pool: PortPool,
    channel_config: ChannelConfig,
    ping_config: PingConfig,
}

/// Stops serving exchange subjects when closed or dropped
pub struct ListenerHandle {
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl ListenerHandle {
    pub fn close(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl Listener {
    pub fn new(ip_resolver: Arc<dyn IpResolver>, port_pool: PortPool) -> Self {
        Self {
            ip_resolver,
            port_pool,
            channel_config: ChannelConfig::default(),
            ping_config: PingConfig::provider(),
        }
    }

    pub fn with_ping_config(mut self, ping_config: PingConfig) -> Self {
        self.ping_config = ping_config;
        self
    }

    /// Serve the exchange subjects of `signer`'s identity, invoking
    /// `handler` with every channel that completes establishment.
    pub async fn listen(
        &self,
        client: Arc<BrokerClient>,
        signer: Arc<dyn Signer>,
        handler: ChannelHandler,
    ) -> P2pResult<ListenerHandle> {
        let provider = signer.identity();
        let pending: Arc<Mutex<HashMap<String, PendingExchange>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let mut exchange_sub = client.subscribe(&exchange_subject(&provider)).await?;
        let mut ack_sub = client.subscribe(&exchange_ack_subject(&provider)).await?;
        info!(%provider, "listening for p2p config exchanges");

        let exchange_task = {
            let client = client.clone();
            let signer = signer.clone();
            let pending = pending.clone();
            let ip_resolver = self.ip_resolver.clone();
            let port_pool = self.port_pool.clone();
            tokio::spawn(async move {
                while let Some(delivery) = exchange_sub.recv().await {
                    let result = start_exchange(
                        &client,
                        signer.as_ref(),
                        &ip_resolver,
                        &port_pool,
                        &pending,
                        delivery.reply.as_deref(),
                        &delivery.data,
                    )
                    .await;
                    if let Err(err) = result {
                        error!(%err, "could not handle initial exchange");
                    }
                }
            })
        };

        let ack_task = {
            let client = client.clone();
            let pending = pending.clone();
            let channel_config = self.channel_config.clone();
            let ping_config = self.ping_config.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                while let Some(delivery) = ack_sub.recv().await {
                    let (entry, consumer_config) =
                        match finish_exchange(&pending, &delivery.data).await {
                            Ok(done) => done,
                            Err(err) => {
                                error!(%err, "could not handle exchange ack");
                                continue;
                            }
                        };
                    let PendingExchange {
                        secret,
                        peer_key,
                        consumer,
                        local_ports,
                    } = entry;

                    // The first pings must be on the wire before the ack
                    // reply: the consumer starts pinging on receipt of the
                    // reply, and its NAT would read provider packets that
                    // arrive sooner as unsolicited traffic.
                    let setup = match begin_conns(
                        consumer_config.public_ip,
                        &consumer_config.ports,
                        local_ports,
                        ping_config.clone(),
                    )
                    .await
                    {
                        Ok(setup) => setup,
                        Err(err) => {
                            error!(%err, "could not start nat traversal");
                            continue;
                        }
                    };

                    if let Some(reply) = delivery.reply.clone() {
                        let client = client.clone();
                        tokio::spawn(async move {
                            if let Err(err) =
                                client.publish(&reply, Bytes::from_static(b"OK")).await
                            {
                                warn!(%err, "could not publish exchange ack");
                            }
                        });
                    }

                    let channel_config = channel_config.clone();
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        match finish_conns(setup).await {
                            Ok((socket, peer_addr, service_conn)) => {
                                info!(%consumer, %peer_addr, "accepted p2p channel");
                                let channel = P2pChannel::open(
                                    socket,
                                    peer_addr,
                                    false,
                                    &secret,
                                    &peer_key,
                                    consumer,
                                    service_conn,
                                    channel_config,
                                );
                                handler(channel);
                            }
                            Err(err) => error!(%err, "could not establish p2p conns"),
                        }
                    });
                }
            })
        };

        Ok(ListenerHandle {
            tasks: vec![exchange_task, ack_task],
        })
    }
}

async fn start_exchange(
    client: &BrokerClient,
    signer: &dyn Signer,
    ip_resolver: &Arc<dyn IpResolver>,
    port_pool: &PortPool,
    pending: &Mutex<HashMap<String, PendingExchange>>,
    reply_subject: Option<&str>,
    data: &[u8],
) -> P2pResult<()> {
    let (hello, consumer) = unpack_signed::<ConfigExchangeMsg>(data)?;
    let consumer_key = BoxPublicKey::from_hex(&hello.public_key)?;
    debug!(%consumer, "received consumer public key");

    let keys = BoxKeyPair::generate();
    let public_ip = ip_resolver.public_ip().await?;
    let local_ports = port_pool.acquire_multiple(PING_MAX_PORTS)?;
    let config = ConnectConfig {
        public_ip,
        ports: local_ports.iter().map(|g| g.num()).collect(),
    };

    let reply = ConfigExchangeMsg {
        public_key: keys.public.to_hex(),
        config_ciphertext: boxes::seal(
            &keys.secret,
            &consumer_key,
            &bincode::serialize(&config)?,
        )?,
    };
    let reply_subject = reply_subject
        .ok_or_else(|| P2pError::Exchange("exchange request has no reply subject".to_string()))?;
    client
        .publish(reply_subject, Bytes::from(pack_signed(signer, &reply)?))
        .await?;

    pending.lock().await.insert(
        hello.public_key,
        PendingExchange {
            secret: keys.secret,
            peer_key: consumer_key,
            consumer,
            local_ports,
        },
    );
    Ok(())
}

async fn finish_exchange(
    pending: &Mutex<HashMap<String, PendingExchange>>,
    data: &[u8],
) -> P2pResult<(PendingExchange, ConnectConfig)> {
    let (ack, sender) = unpack_signed::<ConfigExchangeMsg>(data)?;

    let entry = pending
        .lock()
        .await
        .remove(&ack.public_key)
        .ok_or_else(|| {
            P2pError::Exchange(format!("pending config not found for key {}", ack.public_key))
        })?;
    if sender != entry.consumer {
        return Err(P2pError::UnexpectedPeer {
            expected: entry.consumer.to_hex(),
            actual: sender.to_hex(),
        });
    }

    let consumer_config: ConnectConfig = bincode::deserialize(&boxes::open(
        &entry.secret,
        &entry.peer_key,
        &ack.config_ciphertext,
    )?)?;
    debug!(?consumer_config, "decrypted consumer connect config");
    Ok((entry, consumer_config))
}

/// Channel establishment staged so the caller can sequence the broker
/// reply after the first pings have left.
enum ConnSetup {
    /// A single-port peer is reachable directly; nothing to punch
    Direct {
        socket: UdpSocket,
        peer_addr: SocketAddr,
    },
    /// A punch whose first ping burst is already on the wire
    Punching(PunchAttempt),
}

/// Stage one: bind the sockets and, when punching, fire the first pings.
async fn begin_conns(
    peer_ip: IpAddr,
    peer_ports: &[u16],
    local_ports: Vec<PortGuard>,
    ping_config: PingConfig,
) -> P2pResult<ConnSetup> {
    if peer_ports.len() == 1 {
        let local = local_ports
            .first()
            .ok_or(P2pError::PortPoolExhausted)?
            .num();
        let peer_addr = SocketAddr::new(peer_ip, peer_ports[0]);
        let socket = UdpSocket::bind(("0.0.0.0", local)).await?;
        debug!(local, %peer_addr, "single-port peer, skipping ping");
        return Ok(ConnSetup::Direct { socket, peer_addr });
    }

    let attempt = start_punch(peer_ip, local_ports, peer_ports, ping_config).await?;
    Ok(ConnSetup::Punching(attempt))
}

/// Stage two: wait the punch out and split the channel conn from the
/// service conn. The first two winning pairs are used.
async fn finish_conns(setup: ConnSetup) -> P2pResult<(UdpSocket, SocketAddr, Option<UdpSocket>)> {
    match setup {
        ConnSetup::Direct { socket, peer_addr } => Ok((socket, peer_addr, None)),
        ConnSetup::Punching(attempt) => {
            let mut conns = attempt.wait().await?;
            let service = conns.pop();
            let channel = conns.pop().ok_or(P2pError::NatTraversalFailed)?;

            let (socket, peer_addr) = channel.into_socket();
            Ok((
                socket,
                peer_addr,
                service.map(|conn| conn.into_socket().0),
            ))
        }
    }
}

/// Both stages back to back, for the consumer side
async fn establish_conns(
    peer_ip: IpAddr,
    peer_ports: &[u16],
    local_ports: Vec<PortGuard>,
    ping_config: PingConfig,
) -> P2pResult<(UdpSocket, SocketAddr, Option<UdpSocket>)> {
    let setup = begin_conns(peer_ip, peer_ports, local_ports, ping_config).await?;
    finish_conns(setup).await
}
