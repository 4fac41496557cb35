//! Parallel UDP hole punching
//!
//! Ports are paired by index: local port `i` pings only the peer's port
//! `i`, so both ends can independently agree on which punched pair carries
//! the control channel and which becomes the service conn. The provider
//! starts slightly earlier and with a low TTL so its packets open the NAT
//! without reaching the consumer before the consumer has sent anything.
//!
//! After enough pairs succeed, a short grace window collects stragglers,
//! then winners are ordered by pair index and the surplus sockets close.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, Instant};
use tracing::{debug, trace, warn};

use crate::error::{P2pError, P2pResult};
use crate::ports::PortGuard;

/// Upper bound of ports each side advertises for punching
pub const PING_MAX_PORTS: usize = 10;

const PING_MAGIC: &[u8] = b"WFPING";
const PONG_MAGIC: &[u8] = b"WFPONG";
const POST_SUCCESS_TTL: u32 = 64;

/// Hole punch parameters
#[derive(Debug, Clone)]
pub struct PingConfig {
    /// Delay between ping bursts per socket
    pub send_interval: Duration,
    /// Budget for the whole attempt
    pub timeout: Duration,
    /// Extra time to collect further pairs once enough have succeeded
    pub selection_grace: Duration,
    /// TTL of outgoing pings until the first packet arrives
    pub initial_ttl: u32,
    /// How many punched conns the caller needs
    pub needed_conns: usize,
}

impl PingConfig {
    /// Provider side: low TTL, starts first
    pub fn provider() -> Self {
        Self {
            send_interval: Duration::from_millis(100),
            timeout: Duration::from_secs(10),
            selection_grace: Duration::from_millis(300),
            initial_ttl: 2,
            needed_conns: 2,
        }
    }

    /// Consumer side: full TTL, starts after the ack round trip
    pub fn consumer() -> Self {
        Self {
            initial_ttl: 128,
            ..Self::provider()
        }
    }
}

/// A socket that passed bidirectional traffic on its index-paired port
pub struct PunchedConn {
    pub socket: UdpSocket,
    pub peer_addr: SocketAddr,
    /// Position of this pair in the advertised port lists
    pub index: usize,
    _guard: PortGuard,
}

impl PunchedConn {
    /// Local port of the punched socket
    pub fn local_port(&self) -> u16 {
        self.socket
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or_default()
    }

    /// Give up the punched socket; the port reservation is released, which
    /// is fine because the bound socket itself keeps the port taken.
    pub fn into_socket(self) -> (UdpSocket, SocketAddr) {
        (self.socket, self.peer_addr)
    }
}

impl std::fmt::Debug for PunchedConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "PunchedConn(pair {}, local {}, peer {})",
            self.index,
            self.local_port(),
            self.peer_addr
        )
    }
}

/// A punch whose first ping burst is already on the wire.
///
/// `start_punch` binds every socket and fires the first pings before it
/// returns, so a caller that must order other traffic after the pings
/// (the provider's exchange ack) can sequence on it; `wait` then collects
/// the winners.
pub struct PunchAttempt {
    handles: Vec<tokio::task::JoinHandle<()>>,
    success_rx: mpsc::Receiver<PunchedConn>,
    config: PingConfig,
}

/// Bind the index-paired sockets and put the first pings on the wire.
pub async fn start_punch(
    peer_ip: IpAddr,
    local_ports: Vec<PortGuard>,
    peer_ports: &[u16],
    config: PingConfig,
) -> P2pResult<PunchAttempt> {
    let pair_count = local_ports.len().min(peer_ports.len());
    debug!(%peer_ip, pairs = pair_count, "starting hole punch");

    let mut pairs = Vec::with_capacity(pair_count);
    for (index, guard) in local_ports.into_iter().take(pair_count).enumerate() {
        let target = SocketAddr::new(peer_ip, peer_ports[index]);
        let socket = UdpSocket::bind(("0.0.0.0", guard.num())).await?;
        socket.set_ttl(config.initial_ttl)?;
        if let Err(err) = socket.send_to(PING_MAGIC, target).await {
            trace!(%target, %err, "first ping send failed");
        }
        pairs.push((index, guard, socket, target));
    }

    let (success_tx, success_rx) = mpsc::channel(pair_count.max(1));
    let mut handles = Vec::with_capacity(pair_count);
    for (index, guard, socket, target) in pairs {
        let tx = success_tx.clone();
        let cfg = config.clone();
        handles.push(tokio::spawn(async move {
            if let Err(err) = punch_port(socket, guard, index, target, &cfg, tx).await {
                trace!(index, %err, "ping socket finished without success");
            }
        }));
    }

    Ok(PunchAttempt {
        handles,
        success_rx,
        config,
    })
}

impl PunchAttempt {
    /// Collect `needed_conns` winners ordered by pair index; losing
    /// sockets are closed.
    pub async fn wait(mut self) -> P2pResult<Vec<PunchedConn>> {
        let mut conns: Vec<PunchedConn> = Vec::new();
        let deadline = sleep(self.config.timeout);
        tokio::pin!(deadline);
        let mut grace_deadline: Option<Instant> = None;
        loop {
            let grace = async {
                match grace_deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                _ = &mut deadline => break,
                _ = grace => break,
                maybe = self.success_rx.recv() => match maybe {
                    Some(conn) => {
                        debug!(?conn, "ping pair succeeded");
                        conns.push(conn);
                        if conns.len() >= self.config.needed_conns && grace_deadline.is_none() {
                            grace_deadline = Some(Instant::now() + self.config.selection_grace);
                        }
                    }
                    None => break,
                },
            }
        }

        for handle in self.handles {
            handle.abort();
        }

        if conns.len() < self.config.needed_conns {
            warn!(
                got = conns.len(),
                needed = self.config.needed_conns,
                "hole punch exhausted its budget"
            );
            return Err(P2pError::NatTraversalFailed);
        }

        // Both sides pick the same pairs: lowest indexes win, the rest close.
        conns.sort_by_key(|conn| conn.index);
        conns.truncate(self.config.needed_conns);
        Ok(conns)
    }
}

/// Punch towards `peer_ip`, pairing local and peer ports by index.
pub async fn punch(
    peer_ip: IpAddr,
    local_ports: Vec<PortGuard>,
    peer_ports: &[u16],
    config: PingConfig,
) -> P2pResult<Vec<PunchedConn>> {
    start_punch(peer_ip, local_ports, peer_ports, config)
        .await?
        .wait()
        .await
}

async fn punch_port(
    socket: UdpSocket,
    guard: PortGuard,
    index: usize,
    target: SocketAddr,
    config: &PingConfig,
    success: mpsc::Sender<PunchedConn>,
) -> P2pResult<()> {
    let mut ticker = interval(config.send_interval);
    let mut buf = [0u8; 64];
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = socket.send_to(PING_MAGIC, target).await {
                    trace!(%target, %err, "ping send failed");
                }
            }
            received = socket.recv_from(&mut buf) => {
                let (len, from) = received?;
                // The peer's NAT may rewrite the source port; the address
                // family and host must still match.
                if from.ip() != target.ip() {
                    continue;
                }
                let payload = &buf[..len];
                if payload != PING_MAGIC && payload != PONG_MAGIC {
                    continue;
                }

                // Path is open both ways now; answer with full TTL so the
                // peer's confirmation actually arrives.
                socket.set_ttl(POST_SUCCESS_TTL)?;
                if payload == PING_MAGIC {
                    let _ = socket.send_to(PONG_MAGIC, from).await;
                    let _ = socket.send_to(PONG_MAGIC, from).await;
                }

                let _ = success
                    .send(PunchedConn {
                        socket,
                        peer_addr: from,
                        index,
                        _guard: guard,
                    })
                    .await;
                return Ok(());
            }
        }
    }
}
