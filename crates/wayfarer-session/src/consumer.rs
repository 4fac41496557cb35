//! Consumer-side session operations

use tracing::debug;
use wayfarer_crypto::Identity;
use wayfarer_p2p::{topics, Channel};

use crate::error::SessionResult;
use crate::handler::request;
use crate::messages::{
    ConsumerInfo, SessionInfo, SessionRequest, SessionResponse, SessionStatus, StatusCode,
};
use crate::types::SessionId;

/// What the consumer keeps from a successful create
#[derive(Debug, Clone)]
pub struct SessionDto {
    pub id: SessionId,
    pub config: Vec<u8>,
    pub payment_info: String,
}

/// `session.create`: returns the session id, provider tunnel config and
/// payment info, or the provider's typed rejection.
pub async fn request_session_create(
    channel: &dyn Channel,
    consumer: ConsumerInfo,
    proposal_id: i64,
    config: Vec<u8>,
) -> SessionResult<SessionDto> {
    let message = SessionRequest {
        consumer: Some(consumer),
        proposal_id,
        config,
    };
    debug!(proposal_id, "requesting session create");
    let response: SessionResponse =
        request(channel, topics::SESSION_CREATE, &message).await?;
    Ok(SessionDto {
        id: SessionId::from(response.id),
        config: response.config,
        payment_info: response.payment_info,
    })
}

/// `session.ack`: tell the provider the tunnel came up
pub async fn acknowledge_session(
    channel: &dyn Channel,
    consumer_id: Identity,
    session_id: &SessionId,
) -> SessionResult<()> {
    let message = SessionInfo {
        consumer_id,
        session_id: session_id.to_string(),
    };
    debug!(%session_id, "acknowledging session");
    request(channel, topics::SESSION_ACKNOWLEDGE, &message).await
}

/// `session.destroy`: owner-checked teardown request
pub async fn request_session_destroy(
    channel: &dyn Channel,
    consumer_id: Identity,
    session_id: &SessionId,
) -> SessionResult<()> {
    let message = SessionInfo {
        consumer_id,
        session_id: session_id.to_string(),
    };
    debug!(%session_id, "requesting session destroy");
    request(channel, topics::SESSION_DESTROY, &message).await
}

/// `session.status`: report a connectivity outcome for telemetry
pub async fn send_session_status(
    channel: &dyn Channel,
    consumer_id: Identity,
    session_id: &SessionId,
    code: StatusCode,
    message: String,
) -> SessionResult<()> {
    let status = SessionStatus {
        consumer_id,
        session_id: session_id.to_string(),
        code,
        message,
    };
    debug!(%session_id, ?code, "sending session status");
    request(channel, topics::SESSION_STATUS, &status).await
}
