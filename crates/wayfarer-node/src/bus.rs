//! In-process event bus
//!
//! Every component publishes onto one broadcast bus; subscribers filter the
//! variants they care about. Background tasks are spawned through the bus
//! so a panic surfaces as a `TaskAborted` event instead of dying silently.

use std::future::Future;

use tokio::sync::broadcast;
use tracing::{debug, error};
use wayfarer_payment::{PaymentEvent, PaymentEventPublisher};
use wayfarer_session::{SessionEvent, SessionEventPublisher, SessionId};

use crate::capabilities::TunnelStats;
use crate::manager::ConnectionState;

const BUS_CAPACITY: usize = 256;

/// Consumer-side session lifecycle markers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerSessionStatus {
    Created,
    Ended,
}

/// Everything observable on the bus
#[derive(Debug, Clone)]
pub enum AppEvent {
    /// Consumer connection state machine transition
    ConnectionState {
        state: ConnectionState,
        session_id: Option<SessionId>,
    },
    /// Consumer-side session lifecycle
    ConsumerSession {
        status: ConsumerSessionStatus,
        session_id: SessionId,
    },
    /// Periodic tunnel transfer counters
    Statistics {
        session_id: SessionId,
        stats: TunnelStats,
    },
    /// The IP check exhausted its budget without seeing a new address
    IpNotChanged { session_id: SessionId },
    /// Provider-side session lifecycle
    ProviderSession(SessionEvent),
    /// Monetary events from the payment engine
    Payment(PaymentEvent),
    /// Provider service instance status
    ServiceStatus { id: String, status: String },
    /// A background task panicked
    TaskAborted { name: String },
}

/// Broadcast-backed typed event bus; cheap to clone
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<AppEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    /// Publish an event; lagging subscribers lose oldest events first
    pub fn publish(&self, event: AppEvent) {
        debug!(?event, "bus event");
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.sender.subscribe()
    }

    /// Spawn a task whose panic becomes a `TaskAborted` event
    pub fn spawn_tracked<F>(&self, name: &'static str, future: F) -> tokio::task::JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let bus = self.clone();
        tokio::spawn(async move {
            let result = tokio::spawn(future).await;
            if let Err(err) = result {
                if err.is_panic() {
                    error!(name, "background task panicked");
                    bus.publish(AppEvent::TaskAborted {
                        name: name.to_string(),
                    });
                }
            }
        })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionEventPublisher for EventBus {
    fn publish(&self, event: SessionEvent) {
        EventBus::publish(self, AppEvent::ProviderSession(event));
    }
}

impl PaymentEventPublisher for EventBus {
    fn publish(&self, event: PaymentEvent) {
        EventBus::publish(self, AppEvent::Payment(event));
    }
}
