//! Wayfarer Session Protocol
//!
//! Request/reply state machine between consumer and provider, layered on a
//! peer channel (direct or broker fallback): create, acknowledge,
//! keep-alive, destroy and connectivity status. The provider keeps one
//! record per accepted session, guarded by the owner rule, and ties exactly
//! one payment engine to each session's lifetime.

pub mod consumer;
pub mod error;
pub mod handler;
pub mod manager;
pub mod messages;
pub mod storage;
pub mod types;

pub use consumer::{
    acknowledge_session, request_session_create, request_session_destroy, send_session_status,
    SessionDto,
};
pub use error::{SessionError, SessionErrorKind, SessionResult};
pub use handler::{
    send_keep_alive, KeepAliveConfig, ServiceConfigProvider, SessionHandler,
};
pub use manager::{Manager, PaymentEngine, PaymentEngineFactory};
pub use messages::{
    ConsumerInfo, KeepAlivePing, SessionInfo, SessionRequest, SessionResponse, SessionStatus,
    StatusCode, PAYMENT_VERSION_V3,
};
pub use storage::{NoopPublisher, SessionEvent, SessionEventPublisher, SessionStorage};
pub use types::{DataTransferred, DoneSignal, Session, SessionId, SessionStats};
