//! Provider session storage
//!
//! In-memory map of live sessions that mirrors every lifecycle change onto
//! the node event bus: `Created` on add, `Ended` exactly once on remove.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use wayfarer_crypto::Identity;

use crate::types::{Session, SessionId};

/// Session lifecycle events observed on the bus
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Created {
        id: SessionId,
        consumer_id: Identity,
        service_type: String,
    },
    Acknowledged {
        id: SessionId,
    },
    Ended {
        id: SessionId,
    },
}

/// Sink for session lifecycle events
pub trait SessionEventPublisher: Send + Sync {
    fn publish(&self, event: SessionEvent);
}

/// Publisher that drops everything; for wiring without a bus
pub struct NoopPublisher;

impl SessionEventPublisher for NoopPublisher {
    fn publish(&self, _event: SessionEvent) {}
}

/// In-memory session store
pub struct SessionStorage {
    sessions: Mutex<HashMap<SessionId, Session>>,
    publisher: Arc<dyn SessionEventPublisher>,
}

impl SessionStorage {
    pub fn new(publisher: Arc<dyn SessionEventPublisher>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            publisher,
        }
    }

    /// Register a freshly accepted session
    pub fn add(&self, session: Session) {
        let event = SessionEvent::Created {
            id: session.id.clone(),
            consumer_id: session.consumer_id,
            service_type: session.service_type.clone(),
        };
        self.sessions
            .lock()
            .expect("session storage lock poisoned")
            .insert(session.id.clone(), session);
        self.publisher.publish(event);
    }

    pub fn find(&self, id: &SessionId) -> Option<Session> {
        self.sessions
            .lock()
            .expect("session storage lock poisoned")
            .get(id)
            .cloned()
    }

    /// Remove a session; publishes `Ended` only when it was present
    pub fn remove(&self, id: &SessionId) -> Option<Session> {
        let removed = self
            .sessions
            .lock()
            .expect("session storage lock poisoned")
            .remove(id);
        if removed.is_some() {
            self.publisher.publish(SessionEvent::Ended { id: id.clone() });
        }
        removed
    }

    pub fn list(&self) -> Vec<Session> {
        self.sessions
            .lock()
            .expect("session storage lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub(crate) fn publish(&self, event: SessionEvent) {
        self.publisher.publish(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DoneSignal;
    use chrono::Utc;
    use std::sync::Mutex as StdMutex;
    use wayfarer_crypto::{KeySigner, Signer};

    pub(crate) struct RecordingPublisher(pub StdMutex<Vec<SessionEvent>>);

    impl SessionEventPublisher for RecordingPublisher {
        fn publish(&self, event: SessionEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    fn session() -> Session {
        Session {
            id: SessionId::generate(),
            consumer_id: KeySigner::generate().identity(),
            hermes_id: KeySigner::generate().identity(),
            service_type: "wireguard".to_string(),
            service_id: "service-1".to_string(),
            config: Vec::new(),
            created_at: Utc::now(),
            stats: Default::default(),
            done: DoneSignal::new(),
        }
    }

    #[test]
    fn test_add_find_remove() {
        let publisher = Arc::new(RecordingPublisher(StdMutex::new(Vec::new())));
        let storage = SessionStorage::new(publisher.clone());
        let s = session();
        let id = s.id.clone();

        storage.add(s);
        assert!(storage.find(&id).is_some());

        assert!(storage.remove(&id).is_some());
        assert!(storage.find(&id).is_none());

        let events = publisher.0.lock().unwrap();
        assert!(matches!(events[0], SessionEvent::Created { .. }));
        assert!(matches!(events[1], SessionEvent::Ended { .. }));
    }

    #[test]
    fn test_double_remove_publishes_ended_once() {
        let publisher = Arc::new(RecordingPublisher(StdMutex::new(Vec::new())));
        let storage = SessionStorage::new(publisher.clone());
        let s = session();
        let id = s.id.clone();

        storage.add(s);
        assert!(storage.remove(&id).is_some());
        assert!(storage.remove(&id).is_none());

        let ended = publisher
            .0
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, SessionEvent::Ended { .. }))
            .count();
        assert_eq!(ended, 1);
    }
}
