//! Payment engine errors

use thiserror::Error;

/// Errors that can occur in the payment engine
#[derive(Debug, Error)]
pub enum PaymentError {
    /// Incoming invoice failed validation on the consumer
    #[error("Invoice validation failed: {0}")]
    InvoiceValidation(String),

    /// Incoming exchange message failed validation on the provider
    #[error("Promise validation failed: {0}")]
    PromiseValidation(String),

    /// No exchange message arrived within the wait window
    #[error("Did not get a new promise in time")]
    PromiseWaitTimeout,

    /// Hermes kept failing; the count is how many times in a row
    #[error("Hermes unreachable after {0} attempts")]
    HermesUnreachable(u32),

    /// Consumer cannot cover the invoiced amount
    #[error("Insufficient balance")]
    InsufficientBalance,

    /// Force-settle found no stored promise
    #[error("Nothing to settle for the given provider")]
    NothingToSettle,

    /// Settlement confirmation did not arrive within the wait window
    #[error("Settle timeout")]
    SettleTimeout,

    /// A settlement for this identity is already in flight
    #[error("Provider already has settlement in progress")]
    AlreadySettling,

    /// On-chain or hermes RPC failure
    #[error("Settlement error: {0}")]
    Settlement(String),

    /// Persistent storage failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Channel-level failure
    #[error(transparent)]
    Channel(#[from] wayfarer_p2p::P2pError),

    /// Cryptographic failure
    #[error(transparent)]
    Crypto(#[from] wayfarer_crypto::CryptoError),

    /// Message could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(String),
}

/// Result type for payment operations
pub type PaymentResult<T> = Result<T, PaymentError>;

impl From<bincode::Error> for PaymentError {
    fn from(err: bincode::Error) -> Self {
        PaymentError::Codec(err.to_string())
    }
}
