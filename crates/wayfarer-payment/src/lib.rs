//! Wayfarer Pingpong Payments
//!
//! The micropayment engine that keeps a session solvent invoice-by-invoice:
//! the provider's `InvoiceTracker` issues running invoices, the consumer's
//! `InvoicePayer` answers with signed exchange promises, the hermes
//! countersigns them into redeemable instruments, and the `PromiseSettler`
//! force-redeems accumulated value on-chain once a balance threshold is
//! crossed.

pub mod channel_address;
pub mod config;
pub mod error;
pub mod events;
pub mod invoice_payer;
pub mod invoice_tracker;
pub mod messages;
pub mod settler;
pub mod storage;

pub use channel_address::channel_address;
pub use config::{
    InvoicePayerConfig, InvoiceTrackerConfig, SettlerConfig, DATA_LEEWAY_MEGABYTES,
    MAX_UNPAID_INVOICE_VALUE,
};
pub use error::{PaymentError, PaymentResult};
pub use events::{NoopPaymentPublisher, PaymentEvent, PaymentEventPublisher};
pub use invoice_payer::{
    ConsumerBalanceProvider, InvoicePayer, NoTrafficObserver, TrafficObserver, UnlimitedBalance,
};
pub use invoice_tracker::{HermesClient, InvoiceTracker};
pub use messages::{ExchangeMessage, HermesPromise, Invoice, Promise};
pub use settler::{
    PromiseSettledEvent, PromiseSettler, ProviderChannel, SettlementClient,
};
pub use storage::{
    ConsumerTotal, ConsumerTotalsStorage, MemoryConsumerTotalsStorage, MemoryPromiseStorage,
    PromiseStorage,
};

#[cfg(test)]
mod pingpong_tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use wayfarer_crypto::{BoxKeyPair, Identity, KeySigner, Signer};
    use wayfarer_market::{AmountCalc, Price};
    use wayfarer_p2p::{handler_fn, topics, Channel, ChannelConfig, P2pChannel};
    use wayfarer_session::{DoneSignal, PaymentEngine, Session, SessionId};

    struct EchoHermes;

    #[async_trait]
    impl HermesClient for EchoHermes {
        async fn exchange_promise(&self, message: &ExchangeMessage) -> PaymentResult<Promise> {
            Ok(message.promise.clone())
        }
    }

    struct FixedBalance(u128);

    #[async_trait]
    impl ConsumerBalanceProvider for FixedBalance {
        async fn balance(&self, _consumer: &Identity) -> PaymentResult<u128> {
            Ok(self.0)
        }
    }

    async fn channel_pair(
        consumer: Identity,
        provider: Identity,
    ) -> (Arc<P2pChannel>, Arc<P2pChannel>) {
        let socket_a = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let socket_b = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr_a = socket_a.local_addr().unwrap();
        let addr_b = socket_b.local_addr().unwrap();

        let keys_a = BoxKeyPair::generate();
        let keys_b = BoxKeyPair::generate();
        let consumer_channel = P2pChannel::open(
            socket_a,
            addr_b,
            true,
            &keys_a.secret,
            &keys_b.public,
            provider,
            None,
            ChannelConfig::default(),
        );
        let provider_channel = P2pChannel::open(
            socket_b,
            addr_a,
            false,
            &keys_b.secret,
            &keys_a.public,
            consumer,
            None,
            ChannelConfig::default(),
        );
        (consumer_channel, provider_channel)
    }

    fn session(consumer: Identity, hermes: Identity) -> Session {
        Session {
            id: SessionId::generate(),
            consumer_id: consumer,
            hermes_id: hermes,
            service_type: "wireguard".to_string(),
            service_id: "service-1".to_string(),
            config: Vec::new(),
            created_at: chrono::Utc::now(),
            stats: Default::default(),
            done: DoneSignal::new(),
        }
    }

    fn quick_tracker_config(registry: Identity, implementation: Identity) -> InvoiceTrackerConfig {
        InvoiceTrackerConfig {
            charge_period: Duration::from_millis(120),
            charge_period_leeway: Duration::ZERO,
            exchange_message_wait_timeout: Duration::from_secs(2),
            first_invoice_send_duration: Duration::from_millis(40),
            first_invoice_send_timeout: Duration::from_secs(2),
            ..InvoiceTrackerConfig::new(registry, implementation)
        }
    }

    #[tokio::test]
    async fn test_pingpong_happy_path() {
        let consumer_signer = Arc::new(KeySigner::generate());
        let provider = KeySigner::generate().identity();
        let hermes = KeySigner::generate().identity();
        let registry = KeySigner::generate().identity();
        let implementation = KeySigner::generate().identity();
        let (consumer_channel, provider_channel) =
            channel_pair(consumer_signer.identity(), provider).await;

        let session = session(consumer_signer.identity(), hermes);
        let promise_storage = Arc::new(MemoryPromiseStorage::default());
        // 3.6M per hour prices out to 1 per millisecond of session time.
        let calc = AmountCalc::new(Price::new(3_600_000, 0));

        let tracker = InvoiceTracker::new(
            provider_channel,
            session.clone(),
            calc,
            Arc::new(EchoHermes),
            hermes,
            provider,
            promise_storage.clone(),
            Arc::new(NoopPaymentPublisher),
            quick_tracker_config(registry, implementation),
        );
        let payer = InvoicePayer::new(
            consumer_channel,
            consumer_signer.clone() as Arc<dyn Signer>,
            provider,
            hermes,
            calc,
            Arc::new(MemoryConsumerTotalsStorage::default()),
            Arc::new(NoTrafficObserver),
            Arc::new(UnlimitedBalance),
            InvoicePayerConfig::new(registry, implementation),
        );

        let tracker_task = tokio::spawn(tracker.clone().start());
        let payer_task = tokio::spawn(payer.clone().start());

        tokio::time::sleep(Duration::from_millis(600)).await;

        // At least the first invoice cycle completed and money moved.
        assert!(session.tokens_earned() > 0);
        assert!(promise_storage.get(&provider, &hermes).unwrap().is_some());

        tracker.stop();
        payer.stop();
        assert!(tracker_task.await.unwrap().is_ok());
        assert!(payer_task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_exchange_timeout_fails_engine() {
        let consumer_signer = Arc::new(KeySigner::generate());
        let provider = KeySigner::generate().identity();
        let hermes = KeySigner::generate().identity();
        let registry = KeySigner::generate().identity();
        let implementation = KeySigner::generate().identity();
        let (consumer_channel, provider_channel) =
            channel_pair(consumer_signer.identity(), provider).await;

        // The consumer acknowledges invoices but never pays.
        consumer_channel
            .handle(
                topics::PAYMENT_INVOICE,
                handler_fn(|_| async move { Ok(Bytes::from_static(b"OK")) }),
            )
            .await
            .unwrap();

        let session = session(consumer_signer.identity(), hermes);
        let tracker = InvoiceTracker::new(
            provider_channel,
            session.clone(),
            AmountCalc::new(Price::new(3_600_000, 0)),
            Arc::new(EchoHermes),
            hermes,
            provider,
            Arc::new(MemoryPromiseStorage::default()),
            Arc::new(NoopPaymentPublisher),
            InvoiceTrackerConfig {
                first_invoice_send_timeout: Duration::from_millis(200),
                ..quick_tracker_config(registry, implementation)
            },
        );

        let err = tracker.start().await.unwrap_err();
        assert!(err.contains("promise"));
        assert_eq!(session.tokens_earned(), 0);
    }

    #[tokio::test]
    async fn test_delinquent_exchange_rejected() {
        let consumer_signer = Arc::new(KeySigner::generate());
        let provider = KeySigner::generate().identity();
        let hermes = KeySigner::generate().identity();
        let registry = KeySigner::generate().identity();
        let implementation = KeySigner::generate().identity();
        let (consumer_channel, provider_channel) =
            channel_pair(consumer_signer.identity(), provider).await;

        // A cheapskate consumer: answers every invoice with a correctly
        // signed exchange pledging a fraction of what was invoiced.
        {
            let signer = consumer_signer.clone();
            let channel = consumer_channel.clone();
            consumer_channel
                .handle(
                    topics::PAYMENT_INVOICE,
                    handler_fn(move |request| {
                        let signer = signer.clone();
                        let channel = channel.clone();
                        async move {
                            let invoice: Invoice =
                                bincode::deserialize(&request.data).unwrap();
                            let exchange = ExchangeMessage {
                                promise: Promise {
                                    channel_id: channel_address(
                                        &signer.identity(),
                                        &invoice.provider,
                                        &invoice.provider,
                                        &invoice.provider,
                                    ),
                                    amount: 40,
                                    fee: 0,
                                    hashlock: invoice.hashlock,
                                    r: Vec::new(),
                                    signature: None,
                                }
                                .sign(signer.as_ref())
                                .unwrap(),
                                agreement_id: invoice.agreement_id,
                                agreement_total: 40,
                                provider: invoice.provider,
                                signature: None,
                            }
                            .sign(signer.as_ref())
                            .unwrap();
                            tokio::spawn(async move {
                                let _ = channel
                                    .send(
                                        topics::PAYMENT_EXCHANGE,
                                        Bytes::from(bincode::serialize(&exchange).unwrap()),
                                        Duration::from_secs(2),
                                    )
                                    .await;
                            });
                            Ok(Bytes::from_static(b"OK"))
                        }
                    }),
                )
                .await
                .unwrap();
        }

        let session = session(consumer_signer.identity(), hermes);
        let tracker = InvoiceTracker::new(
            provider_channel,
            session.clone(),
            AmountCalc::new(Price::new(3_600_000, 0)),
            Arc::new(EchoHermes),
            hermes,
            provider,
            Arc::new(MemoryPromiseStorage::default()),
            Arc::new(NoopPaymentPublisher),
            InvoiceTrackerConfig {
                max_unpaid_invoice_value: 30,
                first_invoice_send_duration: Duration::from_millis(200),
                ..quick_tracker_config(registry, implementation)
            },
        );

        let err = tracker.start().await.unwrap_err();
        assert!(err.to_lowercase().contains("promise validation"));
        assert_eq!(session.tokens_earned(), 0);
    }

    #[tokio::test]
    async fn test_payer_respects_persisted_floor() {
        let consumer_signer = Arc::new(KeySigner::generate());
        let provider_signer = Arc::new(KeySigner::generate());
        let provider = provider_signer.identity();
        let hermes = KeySigner::generate().identity();
        let registry = KeySigner::generate().identity();
        let implementation = KeySigner::generate().identity();
        let (consumer_channel, provider_channel) =
            channel_pair(consumer_signer.identity(), provider).await;

        // Totals persisted by a previous run of this node.
        let totals = Arc::new(MemoryConsumerTotalsStorage::default());
        totals
            .store(
                &hermes,
                &consumer_signer.identity(),
                ConsumerTotal {
                    agreement_id: 1,
                    agreement_total: 500,
                },
            )
            .unwrap();

        let payer = InvoicePayer::new(
            consumer_channel,
            consumer_signer.clone() as Arc<dyn Signer>,
            provider,
            hermes,
            AmountCalc::new(Price::new(3_600_000_000, 0)),
            totals.clone(),
            Arc::new(NoTrafficObserver),
            Arc::new(UnlimitedBalance),
            InvoicePayerConfig::new(registry, implementation),
        );
        let _payer_task = tokio::spawn(payer.clone().start());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (exchange_tx, mut exchange_rx) = mpsc::channel::<ExchangeMessage>(1);
        provider_channel
            .handle(
                topics::PAYMENT_EXCHANGE,
                handler_fn(move |request| {
                    let exchange_tx = exchange_tx.clone();
                    async move {
                        let exchange: ExchangeMessage =
                            bincode::deserialize(&request.data).unwrap();
                        let _ = exchange_tx.send(exchange).await;
                        Ok(Bytes::from_static(b"OK"))
                    }
                }),
            )
            .await
            .unwrap();

        let preimage = wayfarer_crypto::Preimage::generate();
        let invoice = Invoice {
            agreement_id: 2,
            agreement_total: 100,
            transactor_fee: 0,
            hashlock: preimage.lock(),
            provider,
        };
        provider_channel
            .send(
                topics::PAYMENT_INVOICE,
                Bytes::from(bincode::serialize(&invoice).unwrap()),
                Duration::from_secs(2),
            )
            .await
            .unwrap();

        let exchange = tokio::time::timeout(Duration::from_secs(2), exchange_rx.recv())
            .await
            .expect("exchange expected")
            .unwrap();
        // Restart safety: the emitted total never drops below the floor.
        assert_eq!(exchange.agreement_total, 500);
        assert_eq!(
            exchange.recover_signer().unwrap(),
            consumer_signer.identity()
        );

        payer.stop();
    }

    #[tokio::test]
    async fn test_payer_insufficient_balance() {
        let consumer_signer = Arc::new(KeySigner::generate());
        let provider_signer = Arc::new(KeySigner::generate());
        let provider = provider_signer.identity();
        let hermes = KeySigner::generate().identity();
        let registry = KeySigner::generate().identity();
        let implementation = KeySigner::generate().identity();
        let (consumer_channel, provider_channel) =
            channel_pair(consumer_signer.identity(), provider).await;

        let payer = InvoicePayer::new(
            consumer_channel,
            consumer_signer.clone() as Arc<dyn Signer>,
            provider,
            hermes,
            AmountCalc::new(Price::new(3_600_000_000, 0)),
            Arc::new(MemoryConsumerTotalsStorage::default()),
            Arc::new(NoTrafficObserver),
            Arc::new(FixedBalance(10)),
            InvoicePayerConfig::new(registry, implementation),
        );
        let payer_task = tokio::spawn(payer.clone().start());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let preimage = wayfarer_crypto::Preimage::generate();
        let invoice = Invoice {
            agreement_id: 1,
            agreement_total: 100,
            transactor_fee: 0,
            hashlock: preimage.lock(),
            provider,
        };
        let reply = provider_channel
            .send(
                topics::PAYMENT_INVOICE,
                Bytes::from(bincode::serialize(&invoice).unwrap()),
                Duration::from_secs(2),
            )
            .await;
        assert!(reply.is_err());

        let result = tokio::time::timeout(Duration::from_secs(2), payer_task)
            .await
            .expect("payer should stop")
            .unwrap();
        assert!(result.unwrap_err().contains("balance"));
    }
}
