//! External collaborator contracts
//!
//! The tunnel datapath, the proposal marketplace and connect validation are
//! not part of this crate; they are consumed through these capabilities.
//! Fake implementations live alongside for tests and local wiring.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use wayfarer_crypto::Identity;
use wayfarer_market::{Proposal, ProposalFilter};
use wayfarer_session::SessionId;

use crate::error::{NodeError, NodeResult};

/// Tunnel connection states reported on the state channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Connecting,
    Connected,
    Reconnecting,
    Disconnecting,
    NotConnected,
}

/// Transfer counters from the tunnel datapath
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub at: DateTime<Utc>,
}

impl Default for TunnelStats {
    fn default() -> Self {
        Self {
            bytes_sent: 0,
            bytes_received: 0,
            at: Utc::now(),
        }
    }
}

/// Everything the tunnel needs to come up in consumer mode
pub struct ConnectOptions {
    pub session_id: SessionId,
    pub session_config: Vec<u8>,
    pub consumer_id: Identity,
    pub provider_id: Identity,
    pub dns: Option<String>,
    /// Pre-punched UDP socket from the p2p channel, when there is one
    pub service_conn: Option<UdpSocket>,
}

/// The tunnel datapath capability (wireguard, openvpn, ...)
#[async_trait]
pub trait Tunnel: Send + Sync {
    /// Consumer-side config shipped to the provider at session create,
    /// e.g. the wireguard public key
    async fn get_config(&self) -> NodeResult<Vec<u8>>;

    /// Start in consumer mode; states arrive on the returned channel
    async fn start(&self, options: ConnectOptions) -> NodeResult<mpsc::Receiver<TunnelState>>;

    /// Stop the tunnel; idempotent
    async fn stop(&self);

    /// Current transfer counters
    async fn stats(&self) -> NodeResult<TunnelStats>;

    /// Block until the tunnel exits
    async fn wait(&self) -> NodeResult<()>;
}

/// Builds a tunnel for a service type
pub type TunnelFactory = Arc<dyn Fn(&str) -> NodeResult<Arc<dyn Tunnel>> + Send + Sync>;

/// Proposal marketplace lookup
#[async_trait]
pub trait ProposalRepository: Send + Sync {
    async fn find(&self, filter: &ProposalFilter) -> NodeResult<Vec<Proposal>>;
    async fn get(&self, id: i64) -> NodeResult<Option<Proposal>>;
}

/// Validates that the consumer may connect to the proposal
pub trait ConnectValidator: Send + Sync {
    fn validate(&self, consumer_id: &Identity, proposal: &Proposal) -> NodeResult<()>;
}

/// Validator that accepts everything
pub struct AllowAllValidator;

impl ConnectValidator for AllowAllValidator {
    fn validate(&self, _consumer_id: &Identity, _proposal: &Proposal) -> NodeResult<()> {
        Ok(())
    }
}

/// In-memory proposal repository
#[derive(Default)]
pub struct MemoryProposalRepository {
    proposals: Mutex<Vec<Proposal>>,
}

impl MemoryProposalRepository {
    pub fn add(&self, proposal: Proposal) {
        self.proposals
            .lock()
            .expect("proposal lock poisoned")
            .push(proposal);
    }
}

#[async_trait]
impl ProposalRepository for MemoryProposalRepository {
    async fn find(&self, filter: &ProposalFilter) -> NodeResult<Vec<Proposal>> {
        Ok(self
            .proposals
            .lock()
            .expect("proposal lock poisoned")
            .iter()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect())
    }

    async fn get(&self, id: i64) -> NodeResult<Option<Proposal>> {
        Ok(self
            .proposals
            .lock()
            .expect("proposal lock poisoned")
            .iter()
            .find(|p| p.id == id)
            .cloned())
    }
}

/// Scripted tunnel for tests: reports Connecting then Connected, counts
/// traffic linearly, and exits when stopped.
pub struct FakeTunnel {
    state_tx: Mutex<Option<mpsc::Sender<TunnelState>>>,
    stopped: Mutex<Option<mpsc::Sender<()>>>,
    wait_rx: tokio::sync::Mutex<Option<mpsc::Receiver<()>>>,
    stats: Mutex<TunnelStats>,
    pub received_service_conn: Mutex<bool>,
    fail_to_connect: bool,
}

impl FakeTunnel {
    pub fn new() -> Arc<Self> {
        Self::with_outcome(false)
    }

    pub fn failing() -> Arc<Self> {
        Self::with_outcome(true)
    }

    fn with_outcome(fail_to_connect: bool) -> Arc<Self> {
        Arc::new(Self {
            state_tx: Mutex::new(None),
            stopped: Mutex::new(None),
            wait_rx: tokio::sync::Mutex::new(None),
            stats: Mutex::new(TunnelStats::default()),
            received_service_conn: Mutex::new(false),
            fail_to_connect,
        })
    }

    pub fn set_stats(&self, bytes_sent: u64, bytes_received: u64) {
        let mut stats = self.stats.lock().expect("stats lock poisoned");
        stats.bytes_sent = bytes_sent;
        stats.bytes_received = bytes_received;
        stats.at = Utc::now();
    }

    /// Simulate the datapath dying underneath the session
    pub async fn kill(&self) {
        if let Some(tx) = self.state_tx.lock().expect("state lock poisoned").take() {
            let _ = tx.try_send(TunnelState::NotConnected);
        }
        self.stop().await;
    }
}

#[async_trait]
impl Tunnel for FakeTunnel {
    async fn get_config(&self) -> NodeResult<Vec<u8>> {
        Ok(b"fake-consumer-config".to_vec())
    }

    async fn start(&self, options: ConnectOptions) -> NodeResult<mpsc::Receiver<TunnelState>> {
        *self.received_service_conn.lock().expect("lock poisoned") =
            options.service_conn.is_some();

        let (state_tx, state_rx) = mpsc::channel(8);
        let (stop_tx, stop_rx) = mpsc::channel(1);
        if !self.fail_to_connect {
            // Keep a sender alive while "running" so the state channel only
            // closes when the tunnel dies.
            *self.state_tx.lock().expect("state lock poisoned") = Some(state_tx.clone());
        }
        *self.stopped.lock().expect("stopped lock poisoned") = Some(stop_tx);
        *self.wait_rx.lock().await = Some(stop_rx);

        let fail = self.fail_to_connect;
        tokio::spawn(async move {
            let _ = state_tx.send(TunnelState::Connecting).await;
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            if fail {
                let _ = state_tx.send(TunnelState::NotConnected).await;
            } else {
                let _ = state_tx.send(TunnelState::Connected).await;
            }
        });
        Ok(state_rx)
    }

    async fn stop(&self) {
        self.stopped.lock().expect("stopped lock poisoned").take();
        // The state stream ends with the tunnel.
        self.state_tx.lock().expect("state lock poisoned").take();
    }

    async fn stats(&self) -> NodeResult<TunnelStats> {
        Ok(*self.stats.lock().expect("stats lock poisoned"))
    }

    async fn wait(&self) -> NodeResult<()> {
        let mut wait_rx = self.wait_rx.lock().await;
        if let Some(rx) = wait_rx.as_mut() {
            // Sender dropped on stop.
            let _ = rx.recv().await;
            return Ok(());
        }
        Err(NodeError::Internal("tunnel was never started".to_string()))
    }
}
