//! Broker transport errors

use thiserror::Error;

/// Errors that can occur while talking to the broker
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Request did not receive a reply in time
    #[error("Broker request timed out on subject {0}")]
    Timeout(String),

    /// Connection lost or broker unreachable
    #[error("Broker transport error: {0}")]
    Transport(String),

    /// Connection has been closed locally
    #[error("Broker connection closed")]
    Closed,

    /// Message could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(String),

    /// Envelope signature did not verify
    #[error("Crypto error: {0}")]
    Crypto(#[from] wayfarer_crypto::CryptoError),
}

/// Result type for broker operations
pub type BrokerResult<T> = Result<T, BrokerError>;

impl From<bincode::Error> for BrokerError {
    fn from(err: bincode::Error) -> Self {
        BrokerError::Codec(err.to_string())
    }
}
