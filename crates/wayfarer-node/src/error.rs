//! Node lifecycle errors

use thiserror::Error;

/// Errors surfaced to the control-plane caller
#[derive(Debug, Error)]
pub enum NodeError {
    /// Action expects an active connection
    #[error("No connection exists")]
    NoConnection,

    /// Action expects no active connection
    #[error("Connection already exists")]
    AlreadyExists,

    /// Connection in progress was cancelled by request
    #[error("Connection was cancelled")]
    Cancelled,

    /// Consumer identity is not registered or not unlocked
    #[error("Identity not registered or locked")]
    Unregistered,

    /// Consumer cannot afford the selected proposal
    #[error("Insufficient balance")]
    InsufficientBalance,

    /// Connect did not reach the Connected phase
    #[error("Connection has failed: {0}")]
    ConnectionFailed(String),

    /// Proposal names a service this node cannot run
    #[error("Unsupported service type in proposal: {0}")]
    UnsupportedServiceType(String),

    /// No such service instance in the pool
    #[error("No such service instance: {0}")]
    NoSuchInstance(String),

    /// Several sub-resources failed while stopping
    #[error("Some instances did not stop: {}", .0.join(". "))]
    Collection(Vec<String>),

    /// Session protocol failure
    #[error(transparent)]
    Session(#[from] wayfarer_session::SessionError),

    /// Channel establishment failure
    #[error(transparent)]
    P2p(#[from] wayfarer_p2p::P2pError),

    /// Payment engine failure
    #[error(transparent)]
    Payment(#[from] wayfarer_payment::PaymentError),

    /// Broker transport failure
    #[error(transparent)]
    Broker(#[from] wayfarer_broker::BrokerError),

    /// Anything internal that should not leak details
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for node operations
pub type NodeResult<T> = Result<T, NodeError>;
