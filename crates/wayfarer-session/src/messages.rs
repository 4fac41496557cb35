//! Session protocol wire messages

use serde::{Deserialize, Serialize};
use wayfarer_crypto::Identity;

use crate::error::SessionErrorKind;

/// Payment protocol version this node speaks
pub const PAYMENT_VERSION_V3: &str = "v3";

/// Consumer self-description sent with session create
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerInfo {
    pub id: Identity,
    pub hermes_id: Identity,
    pub payment_version: String,
}

/// `session.create` request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRequest {
    /// Absent on peers predating version negotiation
    pub consumer: Option<ConsumerInfo>,
    pub proposal_id: i64,
    /// Opaque tunnel config from the consumer
    pub config: Vec<u8>,
}

/// Successful `session.create` reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResponse {
    pub id: String,
    /// Opaque tunnel config from the provider
    pub config: Vec<u8>,
    pub payment_info: String,
}

/// `session.ack` and `session.destroy` request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub consumer_id: Identity,
    pub session_id: String,
}

/// Connectivity outcomes reported over `session.status`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum StatusCode {
    ConnectionOk = 1000,
    SessionEstablishmentFailed = 1001,
    SessionIpNotChanged = 1002,
    ConnectionFailed = 1003,
    SessionPaymentsFailed = 1004,
}

/// `session.status` request; telemetry only, no state machine effect
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatus {
    pub consumer_id: Identity,
    pub session_id: String,
    pub code: StatusCode,
    pub message: String,
}

/// `keepalive` request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepAlivePing {
    pub session_id: String,
}

/// Wire reply for session operations
pub type SessionReply<T> = Result<T, SessionErrorKind>;
