//! Session protocol errors

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur in the session protocol
#[derive(Debug, Error)]
pub enum SessionError {
    /// Requested proposal does not match the provider's current one
    #[error("Proposal does not exist")]
    InvalidProposal,

    /// Named session is unknown to the provider
    #[error("Session does not exist")]
    SessionNotFound,

    /// Operation named a session owned by a different consumer
    #[error("Wrong session owner")]
    WrongSessionOwner,

    /// Peer speaks an unsupported protocol version
    #[error("Unsupported session protocol version")]
    UnsupportedVersion,

    /// Anything that should not leak details to the peer
    #[error("Internal error: {0}")]
    Internal(String),

    /// Channel-level failure
    #[error(transparent)]
    Channel(#[from] wayfarer_p2p::P2pError),

    /// Message could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(String),
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

impl From<bincode::Error> for SessionError {
    fn from(err: bincode::Error) -> Self {
        SessionError::Codec(err.to_string())
    }
}

/// Error kinds that cross the wire in replies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionErrorKind {
    InvalidProposal,
    SessionNotFound,
    WrongSessionOwner,
    UnsupportedVersion,
    Internal,
}

impl From<&SessionError> for SessionErrorKind {
    fn from(err: &SessionError) -> Self {
        match err {
            SessionError::InvalidProposal => SessionErrorKind::InvalidProposal,
            SessionError::SessionNotFound => SessionErrorKind::SessionNotFound,
            SessionError::WrongSessionOwner => SessionErrorKind::WrongSessionOwner,
            SessionError::UnsupportedVersion => SessionErrorKind::UnsupportedVersion,
            _ => SessionErrorKind::Internal,
        }
    }
}

impl From<SessionErrorKind> for SessionError {
    fn from(kind: SessionErrorKind) -> Self {
        match kind {
            SessionErrorKind::InvalidProposal => SessionError::InvalidProposal,
            SessionErrorKind::SessionNotFound => SessionError::SessionNotFound,
            SessionErrorKind::WrongSessionOwner => SessionError::WrongSessionOwner,
            SessionErrorKind::UnsupportedVersion => SessionError::UnsupportedVersion,
            SessionErrorKind::Internal => {
                SessionError::Internal("provider internal error".to_string())
            }
        }
    }
}
