//! Promise settler
//!
//! Background actor that redeems accumulated hermes promises on-chain once
//! the off-chain balance drops below a threshold of the available balance.
//! At most one settlement is in flight per provider identity; confirmation
//! is awaited on the chain event stream, then state is resynced. Settlement
//! failures never fail sessions, they are retried on the next trigger.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use wayfarer_crypto::Identity;
use wayfarer_session::DoneSignal;

use crate::config::SettlerConfig;
use crate::error::{PaymentError, PaymentResult};
use crate::events::{PaymentEvent, PaymentEventPublisher};
use crate::messages::{HermesPromise, Promise};
use crate::storage::PromiseStorage;

const SETTLE_QUEUE_DEPTH: usize = 5;

/// Provider channel status as read from chain
#[derive(Debug, Clone, Copy, Default)]
pub struct ProviderChannel {
    pub balance: u128,
    pub settled: u128,
    pub stake: u128,
}

/// Confirmation that a promise was settled on-chain
#[derive(Debug, Clone)]
pub struct PromiseSettledEvent {
    pub provider: Identity,
    pub hermes: Identity,
    pub amount: u128,
}

/// On-chain settlement capability
#[async_trait]
pub trait SettlementClient: Send + Sync {
    async fn settle_and_rebalance(&self, hermes: Identity, promise: Promise) -> PaymentResult<()>;

    async fn get_provider_channel(
        &self,
        hermes: Identity,
        provider: Identity,
    ) -> PaymentResult<ProviderChannel>;

    async fn subscribe_promise_settled(
        &self,
        provider: Identity,
        hermes: Identity,
    ) -> PaymentResult<mpsc::Receiver<PromiseSettledEvent>>;
}

#[derive(Debug, Clone, Copy, Default)]
struct SettlerState {
    registered: bool,
    settle_in_progress: bool,
    balance: u128,
    available_balance: u128,
    last_promise_amount: u128,
}

impl SettlerState {
    fn needs_settling(&self, threshold: f64) -> bool {
        if !self.registered || self.settle_in_progress {
            return false;
        }
        if self.balance == 0 {
            return true;
        }
        (self.balance as f64) <= threshold * (self.available_balance as f64)
    }
}

/// Settles hermes promises per provider identity
pub struct PromiseSettler {
    client: Arc<dyn SettlementClient>,
    promise_storage: Arc<dyn PromiseStorage>,
    publisher: Arc<dyn PaymentEventPublisher>,
    config: SettlerConfig,
    state: Mutex<HashMap<Identity, SettlerState>>,
    settle_tx: mpsc::Sender<Identity>,
    settle_rx: tokio::sync::Mutex<mpsc::Receiver<Identity>>,
    stop: DoneSignal,
}

impl PromiseSettler {
    pub fn new(
        client: Arc<dyn SettlementClient>,
        promise_storage: Arc<dyn PromiseStorage>,
        publisher: Arc<dyn PaymentEventPublisher>,
        config: SettlerConfig,
    ) -> Arc<Self> {
        let (settle_tx, settle_rx) = mpsc::channel(SETTLE_QUEUE_DEPTH);
        Arc::new(Self {
            client,
            promise_storage,
            publisher,
            config,
            state: Mutex::new(HashMap::new()),
            settle_tx,
            settle_rx: tokio::sync::Mutex::new(settle_rx),
            stop: DoneSignal::new(),
        })
    }

    /// Load the chain state for `provider`; idempotent, meant for startup
    pub async fn load_state(&self, provider: Identity) -> PaymentResult<()> {
        if self
            .state
            .lock()
            .expect("settler state lock poisoned")
            .contains_key(&provider)
        {
            debug!(%provider, "state already loaded, skipping");
            return Ok(());
        }
        self.resync_state(provider).await
    }

    async fn resync_state(&self, provider: Identity) -> PaymentResult<()> {
        let channel = self
            .client
            .get_provider_channel(self.config.hermes_id, provider)
            .await?;
        let promised = self
            .promise_storage
            .get(&provider, &self.config.hermes_id)?
            .map(|p| p.promise.amount)
            .unwrap_or(0);

        let available_balance = channel.balance + channel.settled;
        let balance = available_balance.saturating_sub(promised);

        let mut state = self.state.lock().expect("settler state lock poisoned");
        let entry = state.entry(provider).or_default();
        entry.registered = true;
        entry.balance = balance;
        entry.available_balance = available_balance;
        entry.last_promise_amount = promised;
        info!(%provider, balance, available_balance, "loaded settler state");
        Ok(())
    }

    /// Account a freshly received hermes promise; enqueues a settlement
    /// when the threshold is crossed.
    pub fn handle_promise(&self, provider: Identity, promise: &Promise) {
        let mut state = self.state.lock().expect("settler state lock poisoned");
        let Some(entry) = state.get_mut(&provider) else {
            error!(%provider, "no settler state for provider, skipping promise");
            return;
        };
        if !entry.registered {
            error!(%provider, "provider not registered, skipping promise");
            return;
        }

        let diff = promise.amount.saturating_sub(entry.last_promise_amount);
        entry.balance = entry.balance.saturating_sub(diff);
        entry.last_promise_amount = promise.amount;
        debug!(%provider, balance = entry.balance, "settler state updated");

        if entry.needs_settling(self.config.threshold) {
            if let Err(err) = self.settle_tx.try_send(provider) {
                warn!(%provider, %err, "settle queue full, trigger dropped");
            }
        }
    }

    /// Serve the settlement queue until stopped
    pub async fn run(self: Arc<Self>) {
        info!("listening for settlement requests");
        let mut settle_rx = self.settle_rx.lock().await;
        loop {
            tokio::select! {
                _ = self.stop.wait() => break,
                request = settle_rx.recv() => match request {
                    Some(provider) => {
                        let this = self.clone();
                        tokio::spawn(async move {
                            if let Err(err) = this.settle(provider).await {
                                error!(%provider, %err, "settlement failed");
                            }
                        });
                    }
                    None => break,
                },
            }
        }
        info!("stopped listening for settlement requests");
    }

    pub fn stop(&self) {
        self.stop.close();
    }

    /// Settle regardless of threshold
    pub async fn force_settle(&self, provider: Identity) -> PaymentResult<()> {
        self.settle(provider).await
    }

    async fn settle(&self, provider: Identity) -> PaymentResult<()> {
        let stored = self
            .promise_storage
            .get(&provider, &self.config.hermes_id)?
            .ok_or(PaymentError::NothingToSettle)?;

        self.mark_settling(provider, true)?;
        let result = self.settle_inner(provider, stored).await;
        let _ = self.mark_settling(provider, false);
        result
    }

    async fn settle_inner(&self, provider: Identity, stored: HermesPromise) -> PaymentResult<()> {
        let mut promise = stored.promise;
        promise.r = stored.preimage.as_bytes().to_vec();

        let mut settled_events = self
            .client
            .subscribe_promise_settled(provider, self.config.hermes_id)
            .await?;

        info!(%provider, amount = promise.amount, "requesting settlement");
        self.client
            .settle_and_rebalance(self.config.hermes_id, promise)
            .await?;

        tokio::select! {
            _ = self.stop.wait() => return Ok(()),
            event = timeout(self.config.max_wait_for_settlement, settled_events.recv()) => {
                match event {
                    Ok(Some(_)) => {
                        info!(%provider, "settling complete");
                        // A resync failure here is retried with the next
                        // settlement; it never fails sessions.
                        self.state
                            .lock()
                            .expect("settler state lock poisoned")
                            .remove(&provider);
                        if let Err(err) = self.resync_state(provider).await {
                            error!(%provider, %err, "resync failed");
                        }
                        self.publisher.publish(PaymentEvent::SettlementComplete {
                            provider,
                            hermes: self.config.hermes_id,
                        });
                        Ok(())
                    }
                    Ok(None) => Err(PaymentError::Settlement(
                        "settlement event stream closed".to_string(),
                    )),
                    Err(_) => Err(PaymentError::SettleTimeout),
                }
            }
        }
    }

    fn mark_settling(&self, provider: Identity, settling: bool) -> PaymentResult<()> {
        let mut state = self.state.lock().expect("settler state lock poisoned");
        let entry = state.entry(provider).or_default();
        if settling && entry.settle_in_progress {
            return Err(PaymentError::AlreadySettling);
        }
        entry.settle_in_progress = settling;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopPaymentPublisher;
    use crate::storage::MemoryPromiseStorage;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use wayfarer_crypto::{KeySigner, Preimage, Signer};

    struct MockChain {
        settle_calls: AtomicU32,
        channel: ProviderChannel,
        confirm_delay: Duration,
        event_tx: Mutex<Vec<mpsc::Sender<PromiseSettledEvent>>>,
    }

    impl MockChain {
        fn new(channel: ProviderChannel, confirm_delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                settle_calls: AtomicU32::new(0),
                channel,
                confirm_delay,
                event_tx: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl SettlementClient for MockChain {
        async fn settle_and_rebalance(
            &self,
            hermes: Identity,
            _promise: Promise,
        ) -> PaymentResult<()> {
            self.settle_calls.fetch_add(1, Ordering::SeqCst);
            let senders: Vec<_> = self.event_tx.lock().unwrap().clone();
            let delay = self.confirm_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                for sender in senders {
                    let _ = sender
                        .send(PromiseSettledEvent {
                            provider: KeySigner::generate().identity(),
                            hermes,
                            amount: 0,
                        })
                        .await;
                }
            });
            Ok(())
        }

        async fn get_provider_channel(
            &self,
            _hermes: Identity,
            _provider: Identity,
        ) -> PaymentResult<ProviderChannel> {
            Ok(self.channel)
        }

        async fn subscribe_promise_settled(
            &self,
            _provider: Identity,
            _hermes: Identity,
        ) -> PaymentResult<mpsc::Receiver<PromiseSettledEvent>> {
            let (tx, rx) = mpsc::channel(1);
            self.event_tx.lock().unwrap().push(tx);
            Ok(rx)
        }
    }

    fn promise(amount: u128) -> (Promise, HermesPromise) {
        let preimage = Preimage::generate();
        let promise = Promise {
            channel_id: [1u8; 32],
            amount,
            fee: 0,
            hashlock: preimage.lock(),
            r: Vec::new(),
            signature: None,
        };
        let hermes_promise = HermesPromise {
            promise: promise.clone(),
            agreement_id: 1,
            agreement_total: amount,
            preimage,
        };
        (promise, hermes_promise)
    }

    fn settler(
        chain: Arc<MockChain>,
        storage: Arc<MemoryPromiseStorage>,
        hermes: Identity,
    ) -> Arc<PromiseSettler> {
        let config = SettlerConfig {
            max_wait_for_settlement: Duration::from_secs(2),
            ..SettlerConfig::new(hermes)
        };
        PromiseSettler::new(chain, storage, Arc::new(NoopPaymentPublisher), config)
    }

    #[tokio::test]
    async fn test_threshold_triggers_exactly_one_settlement() {
        let provider = KeySigner::generate().identity();
        let hermes = KeySigner::generate().identity();
        let chain = MockChain::new(
            ProviderChannel {
                balance: 1000,
                settled: 0,
                stake: 0,
            },
            Duration::from_millis(50),
        );
        let storage = Arc::new(MemoryPromiseStorage::default());
        let settler = settler(chain.clone(), storage.clone(), hermes);

        settler.load_state(provider).await.unwrap();
        let runner = tokio::spawn(settler.clone().run());

        // Two promises in quick succession, both pushing balance under the
        // 10% threshold. Single-flight coalesces them into one chain call.
        let (p1, h1) = promise(950);
        storage.store(&provider, &hermes, h1).unwrap();
        settler.handle_promise(provider, &p1);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (p2, h2) = promise(990);
        storage.store(&provider, &hermes, h2).unwrap();
        settler.handle_promise(provider, &p2);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(chain.settle_calls.load(Ordering::SeqCst), 1);

        settler.stop();
        let _ = runner.await;
    }

    #[tokio::test]
    async fn test_promise_above_threshold_does_not_settle() {
        let provider = KeySigner::generate().identity();
        let hermes = KeySigner::generate().identity();
        let chain = MockChain::new(
            ProviderChannel {
                balance: 1000,
                settled: 0,
                stake: 0,
            },
            Duration::from_millis(10),
        );
        let storage = Arc::new(MemoryPromiseStorage::default());
        let settler = settler(chain.clone(), storage.clone(), hermes);

        settler.load_state(provider).await.unwrap();
        let runner = tokio::spawn(settler.clone().run());

        let (p, h) = promise(100);
        storage.store(&provider, &hermes, h).unwrap();
        settler.handle_promise(provider, &p);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(chain.settle_calls.load(Ordering::SeqCst), 0);

        settler.stop();
        let _ = runner.await;
    }

    #[tokio::test]
    async fn test_force_settle_bypasses_threshold() {
        let provider = KeySigner::generate().identity();
        let hermes = KeySigner::generate().identity();
        let chain = MockChain::new(
            ProviderChannel {
                balance: 1000,
                settled: 0,
                stake: 0,
            },
            Duration::from_millis(10),
        );
        let storage = Arc::new(MemoryPromiseStorage::default());
        let settler = settler(chain.clone(), storage.clone(), hermes);
        settler.load_state(provider).await.unwrap();

        let (_, h) = promise(50);
        storage.store(&provider, &hermes, h).unwrap();

        settler.force_settle(provider).await.unwrap();
        assert_eq!(chain.settle_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_force_settle_without_promise() {
        let provider = KeySigner::generate().identity();
        let hermes = KeySigner::generate().identity();
        let chain = MockChain::new(ProviderChannel::default(), Duration::from_millis(10));
        let settler = settler(chain, Arc::new(MemoryPromiseStorage::default()), hermes);

        let err = settler.force_settle(provider).await.unwrap_err();
        assert!(matches!(err, PaymentError::NothingToSettle));
    }

    #[tokio::test]
    async fn test_unknown_provider_promise_is_skipped() {
        let provider = KeySigner::generate().identity();
        let hermes = KeySigner::generate().identity();
        let chain = MockChain::new(ProviderChannel::default(), Duration::from_millis(10));
        let settler = settler(chain.clone(), Arc::new(MemoryPromiseStorage::default()), hermes);

        // No load_state call for this identity.
        let (p, _) = promise(10);
        settler.handle_promise(provider, &p);
        assert_eq!(chain.settle_calls.load(Ordering::SeqCst), 0);
    }
}
