//! Consumer-side invoice payer
//!
//! Validates every incoming invoice against the proposal price, the locally
//! observed traffic and the configured leeways, then answers with a signed
//! exchange message. The last emitted total is persisted before the message
//! leaves, so a restarted consumer can never sign for less than it already
//! promised.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use wayfarer_crypto::{Identity, Signer};
use wayfarer_market::AmountCalc;
use wayfarer_p2p::{handler_fn, topics, Channel, P2pError, DEFAULT_SEND_TIMEOUT};
use wayfarer_session::{DoneSignal, PaymentEngine};

use crate::channel_address::channel_address;
use crate::config::InvoicePayerConfig;
use crate::error::{PaymentError, PaymentResult};
use crate::messages::{ExchangeMessage, Invoice, Promise};
use crate::storage::{ConsumerTotal, ConsumerTotalsStorage};

const BYTES_PER_MEGABYTE: u64 = 1024 * 1024;

/// How much traffic this node has seen on the session so far
pub trait TrafficObserver: Send + Sync {
    fn bytes_transferred(&self) -> u64;
}

/// Observer for nodes that do not meter locally; invoices are then bounded
/// by time-priced value and the data leeway alone.
pub struct NoTrafficObserver;

impl TrafficObserver for NoTrafficObserver {
    fn bytes_transferred(&self) -> u64 {
        0
    }
}

/// Source of the consumer's spendable balance
#[async_trait]
pub trait ConsumerBalanceProvider: Send + Sync {
    async fn balance(&self, consumer: &Identity) -> PaymentResult<u128>;
}

/// Balance provider that never runs out; for wiring without an accountant
pub struct UnlimitedBalance;

#[async_trait]
impl ConsumerBalanceProvider for UnlimitedBalance {
    async fn balance(&self, _consumer: &Identity) -> PaymentResult<u128> {
        Ok(u128::MAX)
    }
}

struct PayerState {
    last_invoice_total: u128,
    last_sent_total: u128,
    started_at: Instant,
}

/// Pays invoices for one session
pub struct InvoicePayer {
    channel: Arc<dyn Channel>,
    signer: Arc<dyn Signer>,
    provider: Identity,
    hermes_id: Identity,
    calc: AmountCalc,
    totals: Arc<dyn ConsumerTotalsStorage>,
    traffic: Arc<dyn TrafficObserver>,
    balance: Arc<dyn ConsumerBalanceProvider>,
    config: InvoicePayerConfig,
    stop: DoneSignal,
    state: Mutex<PayerState>,
    fatal_tx: mpsc::Sender<PaymentError>,
    fatal_rx: tokio::sync::Mutex<mpsc::Receiver<PaymentError>>,
}

impl InvoicePayer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        channel: Arc<dyn Channel>,
        signer: Arc<dyn Signer>,
        provider: Identity,
        hermes_id: Identity,
        calc: AmountCalc,
        totals: Arc<dyn ConsumerTotalsStorage>,
        traffic: Arc<dyn TrafficObserver>,
        balance: Arc<dyn ConsumerBalanceProvider>,
        config: InvoicePayerConfig,
    ) -> Arc<Self> {
        let (fatal_tx, fatal_rx) = mpsc::channel(1);
        Arc::new(Self {
            channel,
            signer,
            provider,
            hermes_id,
            calc,
            totals,
            traffic,
            balance,
            config,
            stop: DoneSignal::new(),
            state: Mutex::new(PayerState {
                last_invoice_total: 0,
                last_sent_total: 0,
                started_at: Instant::now(),
            }),
            fatal_tx,
            fatal_rx: tokio::sync::Mutex::new(fatal_rx),
        })
    }

    async fn run(self: &Arc<Self>) -> PaymentResult<()> {
        let consumer = self.signer.identity();

        // Crash-safety floor: never promise less than what was persisted.
        let floor = self
            .totals
            .get(&self.hermes_id, &consumer)?
            .map(|total| total.agreement_total)
            .unwrap_or(0);
        {
            let mut state = self.state.lock().expect("payer state lock poisoned");
            state.last_sent_total = floor;
            state.started_at = Instant::now();
        }
        debug!(%consumer, floor, "invoice payer starting");

        let this = self.clone();
        self.channel
            .handle(
                topics::PAYMENT_INVOICE,
                handler_fn(move |request| {
                    let this = this.clone();
                    async move {
                        let invoice: Invoice = bincode::deserialize(&request.data)
                            .map_err(|e| P2pError::Codec(e.to_string()))?;
                        match this.on_invoice(invoice).await {
                            Ok(()) => Ok(Bytes::from_static(b"OK")),
                            Err(err) => {
                                let message = err.to_string();
                                let _ = this.fatal_tx.try_send(err);
                                Err(P2pError::Peer(message))
                            }
                        }
                    }
                }),
            )
            .await?;

        let mut fatal_rx = self.fatal_rx.lock().await;
        tokio::select! {
            _ = self.stop.wait() => Ok(()),
            fatal = fatal_rx.recv() => match fatal {
                Some(err) => Err(err),
                None => Ok(()),
            },
        }
    }

    async fn on_invoice(self: &Arc<Self>, invoice: Invoice) -> PaymentResult<()> {
        let consumer = self.signer.identity();
        self.validate_invoice(&invoice).await?;

        let total_to_send = {
            let state = self.state.lock().expect("payer state lock poisoned");
            invoice.agreement_total.max(state.last_sent_total)
        };

        // Persist before signing: a crash between here and the send must
        // leave the floor at or above anything the provider ever sees.
        self.totals.store(
            &self.hermes_id,
            &consumer,
            ConsumerTotal {
                agreement_id: invoice.agreement_id,
                agreement_total: total_to_send,
            },
        )?;

        let promise = Promise {
            channel_id: channel_address(
                &consumer,
                &self.hermes_id,
                &self.config.registry,
                &self.config.channel_implementation,
            ),
            amount: total_to_send,
            fee: invoice.transactor_fee,
            hashlock: invoice.hashlock,
            r: Vec::new(),
            signature: None,
        }
        .sign(self.signer.as_ref())?;

        let exchange = ExchangeMessage {
            promise,
            agreement_id: invoice.agreement_id,
            agreement_total: total_to_send,
            provider: invoice.provider,
            signature: None,
        }
        .sign(self.signer.as_ref())?;

        {
            let mut state = self.state.lock().expect("payer state lock poisoned");
            state.last_invoice_total = invoice.agreement_total;
            state.last_sent_total = total_to_send;
        }

        // Reply to the invoice first; the exchange goes out as its own
        // request so the provider's wait window sees it either way.
        let channel = self.channel.clone();
        let encoded = Bytes::from(bincode::serialize(&exchange)?);
        tokio::spawn(async move {
            if let Err(err) = channel
                .send(topics::PAYMENT_EXCHANGE, encoded, DEFAULT_SEND_TIMEOUT)
                .await
            {
                warn!(%err, "could not deliver exchange message");
            }
        });

        debug!(
            agreement_id = invoice.agreement_id,
            total = total_to_send,
            "exchange message issued"
        );
        Ok(())
    }

    async fn validate_invoice(&self, invoice: &Invoice) -> PaymentResult<()> {
        if invoice.provider != self.provider {
            return Err(PaymentError::InvoiceValidation(format!(
                "invoice from {}, expected {}",
                invoice.provider, self.provider
            )));
        }

        let last_invoice_total = self
            .state
            .lock()
            .expect("payer state lock poisoned")
            .last_invoice_total;
        if invoice.agreement_total < last_invoice_total {
            return Err(PaymentError::InvoiceValidation(format!(
                "agreement total regressed: {} < {}",
                invoice.agreement_total, last_invoice_total
            )));
        }

        // Ceiling: what this node would owe for the observed session, with
        // time and data leeways on top.
        let elapsed = self
            .state
            .lock()
            .expect("payer state lock poisoned")
            .started_at
            .elapsed()
            + self.config.time_leeway;
        let observed_bytes = self.traffic.bytes_transferred()
            + self.config.data_leeway_megabytes * BYTES_PER_MEGABYTE;
        let ceiling = self.calc.total_amount(elapsed, observed_bytes).amount;
        if invoice.agreement_total > ceiling {
            return Err(PaymentError::InvoiceValidation(format!(
                "invoiced {} over local ceiling {}",
                invoice.agreement_total, ceiling
            )));
        }

        let balance = self.balance.balance(&self.signer.identity()).await?;
        if invoice.agreement_total > balance {
            return Err(PaymentError::InsufficientBalance);
        }

        Ok(())
    }
}

#[async_trait]
impl PaymentEngine for InvoicePayer {
    async fn start(self: Arc<Self>) -> Result<(), String> {
        self.run().await.map_err(|err| err.to_string())
    }

    fn stop(&self) {
        self.stop.close();
    }
}
