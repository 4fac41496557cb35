//! P2P channel errors

use thiserror::Error;

/// Errors that can occur while establishing or using a peer channel
#[derive(Debug, Error)]
pub enum P2pError {
    /// Config exchange over the broker failed
    #[error("Config exchange failed: {0}")]
    Exchange(String),

    /// Envelope sender did not match the expected peer
    #[error("Unexpected peer: expected {expected}, got {actual}")]
    UnexpectedPeer { expected: String, actual: String },

    /// Every ping pair failed within the attempt budget
    #[error("NAT traversal failed: no ping pair succeeded")]
    NatTraversalFailed,

    /// No free ports left in the pool
    #[error("Port pool exhausted")]
    PortPoolExhausted,

    /// Request was not answered in time
    #[error("Request timed out on topic {0}")]
    Timeout(String),

    /// Channel closed locally or by the peer
    #[error("Channel closed")]
    ChannelClosed,

    /// No handler registered for a topic on the remote side
    #[error("Peer error: {0}")]
    Peer(String),

    /// Message could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(String),

    /// Cryptographic failure
    #[error(transparent)]
    Crypto(#[from] wayfarer_crypto::CryptoError),

    /// Broker transport failure
    #[error(transparent)]
    Broker(#[from] wayfarer_broker::BrokerError),

    /// Socket-level failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for p2p operations
pub type P2pResult<T> = Result<T, P2pError>;

impl From<bincode::Error> for P2pError {
    fn from(err: bincode::Error) -> Self {
        P2pError::Codec(err.to_string())
    }
}
