//! Wayfarer P2P Channels
//!
//! Builds a direct, authenticated, encrypted, NAT-traversed UDP channel
//! between two identities, using the broker only for the initial key and
//! config exchange. A channel multiplexes named control topics with
//! reliable, per-topic-ordered request/reply RPC, and hands a separate
//! pre-punched UDP socket to the tunnel as the service conn.
//!
//! - `exchange` — the three-message broker handshake, dialer and listener
//! - `pinger` — parallel UDP hole punching
//! - `ports` — shared local port allocator
//! - `channel` — the `Channel` capability and its direct implementation
//! - `dialog` — legacy broker-backed fallback implementation

pub mod channel;
pub mod dialog;
pub mod error;
pub mod exchange;
pub mod ip;
pub mod messages;
pub mod pinger;
pub mod ports;

pub use channel::{
    handler_fn, send_msg, Channel, ChannelConfig, HandlerFuture, IncomingRequest, P2pChannel,
    TopicHandler, DEFAULT_SEND_TIMEOUT,
};
pub use dialog::DialogChannel;
pub use error::{P2pError, P2pResult};
pub use exchange::{ChannelHandler, Dialer, Listener, ListenerHandle};
pub use ip::{IpResolver, StaticIpResolver};
pub use messages::{topics, ConfigExchangeMsg, ConnectConfig};
pub use pinger::{punch, start_punch, PingConfig, PunchAttempt, PunchedConn, PING_MAX_PORTS};
pub use ports::{PortGuard, PortPool};
