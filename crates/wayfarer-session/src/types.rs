//! Session records

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use uuid::Uuid;
use wayfarer_crypto::Identity;

/// Unique session identifier (UUIDv4), unique within a provider
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh random id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Closed exactly once when the session is torn down; everything owning a
/// piece of the session (tunnel, payment engine, record) watches it.
#[derive(Clone)]
pub struct DoneSignal {
    inner: Arc<DoneInner>,
}

struct DoneInner {
    closed: AtomicBool,
    notify: Notify,
}

impl DoneSignal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DoneInner {
                closed: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Close the signal; returns true only for the first caller
    pub fn close(&self) -> bool {
        let first = !self.inner.closed.swap(true, Ordering::AcqRel);
        if first {
            self.inner.notify.notify_waiters();
        }
        first
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Wait until the signal is closed
    pub async fn wait(&self) {
        while !self.is_closed() {
            let notified = self.inner.notify.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for DoneSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Bytes moved through the tunnel in each direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataTransferred {
    pub up: u64,
    pub down: u64,
}

impl DataTransferred {
    pub fn total(&self) -> u64 {
        self.up + self.down
    }
}

/// Mutable per-session counters shared across tasks
#[derive(Debug, Default)]
pub struct SessionStats {
    pub data_transferred: DataTransferred,
    pub tokens_earned: u128,
    pub last_keep_alive: Option<Instant>,
}

/// Provider-side record of an accepted dialog
#[derive(Clone)]
pub struct Session {
    pub id: SessionId,
    pub consumer_id: Identity,
    pub hermes_id: Identity,
    pub service_type: String,
    pub service_id: String,
    /// Opaque tunnel config negotiated at create
    pub config: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub stats: Arc<Mutex<SessionStats>>,
    pub done: DoneSignal,
}

impl Session {
    /// Record transferred bytes
    pub fn set_data_transferred(&self, up: u64, down: u64) {
        let mut stats = self.stats.lock().expect("session stats lock poisoned");
        stats.data_transferred = DataTransferred { up, down };
    }

    /// Record the latest accepted agreement total
    pub fn set_tokens_earned(&self, total: u128) {
        let mut stats = self.stats.lock().expect("session stats lock poisoned");
        stats.tokens_earned = total;
    }

    pub fn tokens_earned(&self) -> u128 {
        self.stats
            .lock()
            .expect("session stats lock poisoned")
            .tokens_earned
    }

    pub fn data_transferred(&self) -> DataTransferred {
        self.stats
            .lock()
            .expect("session stats lock poisoned")
            .data_transferred
    }

    /// Mark the peer as alive now
    pub fn touch(&self) {
        let mut stats = self.stats.lock().expect("session stats lock poisoned");
        stats.last_keep_alive = Some(Instant::now());
    }

    /// When the peer last proved liveness
    pub fn last_keep_alive(&self) -> Option<Instant> {
        self.stats
            .lock()
            .expect("session stats lock poisoned")
            .last_keep_alive
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("consumer_id", &self.consumer_id)
            .field("service_type", &self.service_type)
            .field("created_at", &self.created_at)
            .finish()
    }
}
