//! Wayfarer Node Orchestration
//!
//! Ties the lower layers into a running node: the consumer-side connection
//! manager with its cleanup discipline, the provider-side service pool, the
//! in-process event bus, session history and statistics publishing, plus
//! the capability contracts for everything the core consumes from outside
//! (tunnel datapath, proposal marketplace, connect validation).

pub mod bus;
pub mod capabilities;
pub mod config;
pub mod error;
pub mod history;
pub mod manager;
pub mod pool;
pub mod stats;

pub use bus::{AppEvent, ConsumerSessionStatus, EventBus};
pub use capabilities::{
    AllowAllValidator, ConnectOptions, ConnectValidator, FakeTunnel, MemoryProposalRepository,
    ProposalRepository, Tunnel, TunnelFactory, TunnelState, TunnelStats,
};
pub use config::{IpCheckConfig, NodeConfig};
pub use error::{NodeError, NodeResult};
pub use history::{HistoryRecord, SessionHistory};
pub use manager::{
    BrokerClientFactory, ConnectParams, ConnectionManager, ConnectionState, ConnectionStatus,
    ConsumerPaymentEngineFactory, PaymentChannelArgs,
};
pub use pool::{DiscoveryAnnouncer, RunnableService, ServiceInstance, ServicePool, ServiceStatus};
pub use stats::{spawn_stats_publisher, SharedTraffic};
