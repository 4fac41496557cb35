//! Provider session manager
//!
//! Owns the provider-side lifecycle: validates create requests against the
//! current proposal, enforces the session owner rule, and ties exactly one
//! payment engine to every session between creation and teardown.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};
use wayfarer_crypto::Identity;
use wayfarer_market::Proposal;

use crate::error::{SessionError, SessionResult};
use crate::messages::ConsumerInfo;
use crate::storage::{SessionEvent, SessionStorage};
use crate::types::{DoneSignal, Session, SessionId};

/// One payment engine runs per session; `start` blocks until the engine
/// stops or fails, `stop` asks it to wind down.
#[async_trait]
pub trait PaymentEngine: Send + Sync {
    async fn start(self: Arc<Self>) -> Result<(), String>;
    fn stop(&self);
}

/// Builds the payment engine for an accepted session
pub type PaymentEngineFactory = Arc<
    dyn Fn(Identity, Identity, &SessionId) -> SessionResult<Arc<dyn PaymentEngine>> + Send + Sync,
>;

/// Provider-side session lifecycle
pub struct Manager {
    current_proposal: Proposal,
    storage: Arc<SessionStorage>,
    payment_engine_factory: PaymentEngineFactory,
    service_id: String,
    creation_lock: Mutex<()>,
}

impl Manager {
    pub fn new(
        current_proposal: Proposal,
        storage: Arc<SessionStorage>,
        payment_engine_factory: PaymentEngineFactory,
        service_id: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            current_proposal,
            storage,
            payment_engine_factory,
            service_id,
            creation_lock: Mutex::new(()),
        })
    }

    /// The proposal this manager accepts sessions for
    pub fn proposal(&self) -> &Proposal {
        &self.current_proposal
    }

    /// Accept a session for `consumer_id`.
    ///
    /// The payment engine starts in the background; an engine failure
    /// destroys the session, and session teardown stops the engine.
    pub async fn start(
        self: &Arc<Self>,
        consumer_id: Identity,
        consumer_info: &ConsumerInfo,
        proposal_id: i64,
        config: Vec<u8>,
    ) -> SessionResult<Session> {
        let _guard = self.creation_lock.lock().await;

        if self.current_proposal.id != proposal_id {
            return Err(SessionError::InvalidProposal);
        }

        let session = Session {
            id: SessionId::generate(),
            consumer_id,
            hermes_id: consumer_info.hermes_id,
            service_type: self.current_proposal.service_type.clone(),
            service_id: self.service_id.clone(),
            config,
            created_at: Utc::now(),
            stats: Default::default(),
            done: DoneSignal::new(),
        };
        info!(id = %session.id, consumer = %consumer_id, "starting session");

        let engine = (self.payment_engine_factory)(
            self.current_proposal.provider_id,
            consumer_info.hermes_id,
            &session.id,
        )?;

        // Stop the engine once the session is torn down.
        {
            let done = session.done.clone();
            let engine = engine.clone();
            tokio::spawn(async move {
                done.wait().await;
                engine.stop();
            });
        }

        // Run the engine; a payment failure kills the session.
        {
            let manager = self.clone();
            let session_id = session.id.clone();
            tokio::spawn(async move {
                if let Err(err) = engine.start().await {
                    error!(id = %session_id, %err, "payment engine error");
                    if let Err(destroy_err) = manager.destroy(consumer_id, &session_id).await {
                        debug!(id = %session_id, %destroy_err, "session cleanup failed");
                    }
                }
            });
        }

        self.storage.add(session.clone());
        Ok(session)
    }

    /// Mark the session as established from the consumer's point of view
    pub async fn acknowledge(
        &self,
        consumer_id: Identity,
        session_id: &SessionId,
    ) -> SessionResult<()> {
        let _guard = self.creation_lock.lock().await;

        let session = self
            .storage
            .find(session_id)
            .ok_or(SessionError::SessionNotFound)?;
        if session.consumer_id != consumer_id {
            return Err(SessionError::WrongSessionOwner);
        }

        self.storage.publish(SessionEvent::Acknowledged {
            id: session_id.clone(),
        });
        Ok(())
    }

    /// Destroy the session named by its owner
    pub async fn destroy(&self, consumer_id: Identity, session_id: &SessionId) -> SessionResult<()> {
        let _guard = self.creation_lock.lock().await;

        let session = self
            .storage
            .find(session_id)
            .ok_or(SessionError::SessionNotFound)?;
        if session.consumer_id != consumer_id {
            return Err(SessionError::WrongSessionOwner);
        }

        info!(id = %session_id, "destroying session");
        self.storage.remove(session_id);
        session.done.close();
        Ok(())
    }

    /// Find a live session
    pub fn find(&self, session_id: &SessionId) -> Option<Session> {
        self.storage.find(session_id)
    }

    /// All live sessions
    pub fn list(&self) -> Vec<Session> {
        self.storage.list()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::PAYMENT_VERSION_V3;
    use crate::storage::NoopPublisher;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;
    use wayfarer_crypto::{KeySigner, Signer};
    use wayfarer_market::{Location, Price, Quality};

    struct MockEngine {
        started: AtomicU32,
        stopped: AtomicBool,
        fail: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl PaymentEngine for MockEngine {
        async fn start(self: Arc<Self>) -> Result<(), String> {
            self.started.fetch_add(1, Ordering::SeqCst);
            match &self.fail {
                Some(trigger) => {
                    trigger.notified().await;
                    Err("promise wait timeout".to_string())
                }
                None => {
                    std::future::pending::<()>().await;
                    Ok(())
                }
            }
        }

        fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    fn proposal(provider_id: Identity) -> Proposal {
        Proposal {
            id: 42,
            provider_id,
            service_type: "wireguard".to_string(),
            contacts: vec![],
            access_policies: vec![],
            price: Price::new(50_000, 7_000),
            location: Location::default(),
            quality: Quality::default(),
        }
    }

    fn consumer_info(consumer: Identity) -> ConsumerInfo {
        ConsumerInfo {
            id: consumer,
            hermes_id: KeySigner::generate().identity(),
            payment_version: PAYMENT_VERSION_V3.to_string(),
        }
    }

    fn manager_with_engine(fail: Option<Arc<Notify>>) -> (Arc<Manager>, Arc<MockEngine>) {
        let engine = Arc::new(MockEngine {
            started: AtomicU32::new(0),
            stopped: AtomicBool::new(false),
            fail,
        });
        let factory: PaymentEngineFactory = {
            let engine = engine.clone();
            Arc::new(move |_, _, _| Ok(engine.clone() as Arc<dyn PaymentEngine>))
        };
        let provider = KeySigner::generate().identity();
        let manager = Manager::new(
            proposal(provider),
            Arc::new(SessionStorage::new(Arc::new(NoopPublisher))),
            factory,
            "service-1".to_string(),
        );
        (manager, engine)
    }

    #[tokio::test]
    async fn test_start_rejects_unknown_proposal() {
        let (manager, _) = manager_with_engine(None);
        let consumer = KeySigner::generate().identity();

        let err = manager
            .start(consumer, &consumer_info(consumer), 7, Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidProposal));
    }

    #[tokio::test]
    async fn test_start_creates_session_and_engine() {
        let (manager, engine) = manager_with_engine(None);
        let consumer = KeySigner::generate().identity();

        let session = manager
            .start(consumer, &consumer_info(consumer), 42, b"cfg".to_vec())
            .await
            .unwrap();
        assert_eq!(session.consumer_id, consumer);
        assert!(manager.find(&session.id).is_some());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(engine.started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_destroy_enforces_owner() {
        let (manager, _) = manager_with_engine(None);
        let owner = KeySigner::generate().identity();
        let stranger = KeySigner::generate().identity();

        let session = manager
            .start(owner, &consumer_info(owner), 42, Vec::new())
            .await
            .unwrap();

        let err = manager.destroy(stranger, &session.id).await.unwrap_err();
        assert!(matches!(err, SessionError::WrongSessionOwner));
        assert!(manager.find(&session.id).is_some());

        manager.destroy(owner, &session.id).await.unwrap();
        assert!(manager.find(&session.id).is_none());
        assert!(session.done.is_closed());
    }

    #[tokio::test]
    async fn test_destroy_unknown_session() {
        let (manager, _) = manager_with_engine(None);
        let err = manager
            .destroy(KeySigner::generate().identity(), &SessionId::generate())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::SessionNotFound));
    }

    #[tokio::test]
    async fn test_session_teardown_stops_engine() {
        let (manager, engine) = manager_with_engine(None);
        let owner = KeySigner::generate().identity();

        let session = manager
            .start(owner, &consumer_info(owner), 42, Vec::new())
            .await
            .unwrap();
        manager.destroy(owner, &session.id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(engine.stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_engine_failure_destroys_session() {
        let trigger = Arc::new(Notify::new());
        let (manager, _) = manager_with_engine(Some(trigger.clone()));
        let owner = KeySigner::generate().identity();

        let session = manager
            .start(owner, &consumer_info(owner), 42, Vec::new())
            .await
            .unwrap();
        assert!(manager.find(&session.id).is_some());

        trigger.notify_waiters();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(manager.find(&session.id).is_none());
        assert!(session.done.is_closed());
    }

    #[tokio::test]
    async fn test_acknowledge_enforces_owner() {
        let (manager, _) = manager_with_engine(None);
        let owner = KeySigner::generate().identity();
        let stranger = KeySigner::generate().identity();

        let session = manager
            .start(owner, &consumer_info(owner), 42, Vec::new())
            .await
            .unwrap();

        assert!(manager.acknowledge(owner, &session.id).await.is_ok());
        let err = manager
            .acknowledge(stranger, &session.id)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::WrongSessionOwner));
    }
}
