//! Provider-side invoice loop
//!
//! Issues a running invoice every charge period, waits for the consumer's
//! signed exchange message, validates it against the session owner, the
//! hashlock and the channel derivation, and forwards it to the hermes. The
//! first invoice goes out almost immediately with a short wait window so a
//! dead consumer is detected fast.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};
use wayfarer_crypto::{Identity, Preimage};
use wayfarer_market::AmountCalc;
use wayfarer_p2p::{handler_fn, topics, Channel, P2pError};
use wayfarer_session::{DoneSignal, PaymentEngine, Session};

use crate::channel_address::channel_address;
use crate::config::InvoiceTrackerConfig;
use crate::error::{PaymentError, PaymentResult};
use crate::events::{PaymentEvent, PaymentEventPublisher};
use crate::messages::{ExchangeMessage, HermesPromise, Invoice};
use crate::storage::PromiseStorage;

const INVOICE_SEND_TIMEOUT: Duration = Duration::from_secs(10);
const EXCHANGE_BUFFER: usize = 8;

/// Hermes accountant RPC: countersigns exchange messages into promises
#[async_trait]
pub trait HermesClient: Send + Sync {
    async fn exchange_promise(&self, message: &ExchangeMessage) -> PaymentResult<crate::messages::Promise>;
}

/// Tracks invoices and exchange messages for one session
pub struct InvoiceTracker {
    channel: Arc<dyn Channel>,
    session: Session,
    calc: AmountCalc,
    hermes: Arc<dyn HermesClient>,
    hermes_id: Identity,
    provider: Identity,
    promise_storage: Arc<dyn PromiseStorage>,
    publisher: Arc<dyn PaymentEventPublisher>,
    config: InvoiceTrackerConfig,
    stop: DoneSignal,
    exchange_tx: mpsc::Sender<ExchangeMessage>,
    exchange_rx: Mutex<mpsc::Receiver<ExchangeMessage>>,
}

impl InvoiceTracker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        channel: Arc<dyn Channel>,
        session: Session,
        calc: AmountCalc,
        hermes: Arc<dyn HermesClient>,
        hermes_id: Identity,
        provider: Identity,
        promise_storage: Arc<dyn PromiseStorage>,
        publisher: Arc<dyn PaymentEventPublisher>,
        config: InvoiceTrackerConfig,
    ) -> Arc<Self> {
        let (exchange_tx, exchange_rx) = mpsc::channel(EXCHANGE_BUFFER);
        Arc::new(Self {
            channel,
            session,
            calc,
            hermes,
            hermes_id,
            provider,
            promise_storage,
            publisher,
            config,
            stop: DoneSignal::new(),
            exchange_tx,
            exchange_rx: Mutex::new(exchange_rx),
        })
    }

    async fn run(&self) -> PaymentResult<()> {
        self.register_exchange_handler().await?;
        let mut exchange_rx = self.exchange_rx.lock().await;

        let started_at = Instant::now();
        let agreement_id: u64 = rand::random();
        let mut last_exchange_total: u128 = 0;
        let mut hermes_failures = 0u32;
        let mut first_invoice = true;
        debug!(session = %self.session.id, agreement_id, "invoice tracker starting");

        loop {
            let pace = if first_invoice {
                self.config.first_invoice_send_duration
            } else {
                self.config.charge_period
            };
            tokio::select! {
                _ = self.stop.wait() => return Ok(()),
                _ = sleep(pace) => {}
            }

            let elapsed = started_at.elapsed();
            let transferred = self.session.data_transferred().total();
            let agreement_total = self.calc.total_amount(elapsed, transferred).amount;

            let preimage = Preimage::generate();
            let invoice = Invoice {
                agreement_id,
                agreement_total,
                transactor_fee: self.config.transactor_fee,
                hashlock: preimage.lock(),
                provider: self.provider,
            };
            debug!(
                session = %self.session.id,
                agreement_total,
                "sending invoice"
            );
            self.channel
                .send(
                    topics::PAYMENT_INVOICE,
                    Bytes::from(bincode::serialize(&invoice)?),
                    INVOICE_SEND_TIMEOUT,
                )
                .await?;

            let wait = if first_invoice {
                self.config.first_invoice_send_timeout
            } else {
                self.config.exchange_message_wait_timeout
            };
            let exchange = tokio::select! {
                _ = self.stop.wait() => return Ok(()),
                received = timeout(wait, exchange_rx.recv()) => match received {
                    Ok(Some(exchange)) => exchange,
                    Ok(None) => return Err(PaymentError::Channel(P2pError::ChannelClosed)),
                    Err(_) => return Err(PaymentError::PromiseWaitTimeout),
                },
            };

            self.validate_exchange(&invoice, &exchange, last_exchange_total)?;

            match self.hermes.exchange_promise(&exchange).await {
                Ok(promise) => {
                    hermes_failures = 0;
                    last_exchange_total = exchange.agreement_total;
                    self.session.set_tokens_earned(last_exchange_total);

                    self.promise_storage.store(
                        &self.provider,
                        &self.hermes_id,
                        HermesPromise {
                            promise: promise.clone(),
                            agreement_id,
                            agreement_total: exchange.agreement_total,
                            preimage,
                        },
                    )?;
                    self.publisher.publish(PaymentEvent::InvoicePaid {
                        session_id: self.session.id.to_string(),
                        consumer: self.session.consumer_id,
                        agreement_id,
                        agreement_total: exchange.agreement_total,
                    });
                    self.publisher.publish(PaymentEvent::HermesPromiseStored {
                        provider: self.provider,
                        hermes: self.hermes_id,
                        promise,
                    });
                    first_invoice = false;
                }
                Err(err) => {
                    hermes_failures += 1;
                    warn!(
                        session = %self.session.id,
                        %err,
                        count = hermes_failures,
                        "hermes rejected or unreachable"
                    );
                    if hermes_failures >= self.config.max_hermes_failure_count {
                        return Err(PaymentError::HermesUnreachable(hermes_failures));
                    }
                }
            }
        }
    }

    async fn register_exchange_handler(&self) -> PaymentResult<()> {
        let exchange_tx = self.exchange_tx.clone();
        self.channel
            .handle(
                topics::PAYMENT_EXCHANGE,
                handler_fn(move |request| {
                    let exchange_tx = exchange_tx.clone();
                    async move {
                        let exchange: ExchangeMessage = bincode::deserialize(&request.data)
                            .map_err(|e| P2pError::Codec(e.to_string()))?;
                        let _ = exchange_tx.send(exchange).await;
                        Ok(Bytes::from_static(b"OK"))
                    }
                }),
            )
            .await?;
        Ok(())
    }

    fn validate_exchange(
        &self,
        invoice: &Invoice,
        exchange: &ExchangeMessage,
        last_exchange_total: u128,
    ) -> PaymentResult<()> {
        let signer = exchange.recover_signer()?;
        if signer != self.session.consumer_id {
            return Err(PaymentError::PromiseValidation(format!(
                "exchange signed by {}, session owned by {}",
                signer, self.session.consumer_id
            )));
        }
        let promise_signer = exchange.promise.recover_signer()?;
        if promise_signer != self.session.consumer_id {
            return Err(PaymentError::PromiseValidation(
                "promise signer does not match session owner".to_string(),
            ));
        }

        if exchange.agreement_id != invoice.agreement_id {
            return Err(PaymentError::PromiseValidation(
                "exchange references a foreign agreement".to_string(),
            ));
        }
        if exchange.provider != self.provider {
            return Err(PaymentError::PromiseValidation(
                "exchange addressed to a different provider".to_string(),
            ));
        }
        if exchange.agreement_total < last_exchange_total {
            return Err(PaymentError::PromiseValidation(format!(
                "agreement total regressed: {} < {}",
                exchange.agreement_total, last_exchange_total
            )));
        }

        // The consumer may lag behind the invoice by the unpaid cap plus
        // one leeway window worth of time-priced value.
        let leeway_value = self
            .calc
            .total_amount(self.config.charge_period_leeway, 0)
            .amount;
        let max_unpaid = self.config.max_unpaid_invoice_value + leeway_value;
        if exchange.agreement_total + max_unpaid < invoice.agreement_total {
            return Err(PaymentError::PromiseValidation(format!(
                "unpaid value too large: promised {}, invoiced {}",
                exchange.agreement_total, invoice.agreement_total
            )));
        }

        if exchange.promise.hashlock != invoice.hashlock {
            return Err(PaymentError::PromiseValidation(
                "promise hashlock does not match invoice".to_string(),
            ));
        }
        if exchange.promise.amount < exchange.agreement_total {
            return Err(PaymentError::PromiseValidation(
                "promise amount below agreement total".to_string(),
            ));
        }

        let expected_channel = channel_address(
            &self.session.consumer_id,
            &self.hermes_id,
            &self.config.registry,
            &self.config.channel_implementation,
        );
        if exchange.promise.channel_id != expected_channel {
            return Err(PaymentError::PromiseValidation(
                "promise drawn on unexpected channel".to_string(),
            ));
        }

        Ok(())
    }
}

#[async_trait]
impl PaymentEngine for InvoiceTracker {
    async fn start(self: Arc<Self>) -> Result<(), String> {
        self.run().await.map_err(|err| err.to_string())
    }

    fn stop(&self) {
        self.stop.close();
    }
}
