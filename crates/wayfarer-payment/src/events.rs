//! Payment events observed on the bus

use wayfarer_crypto::Identity;

use crate::messages::Promise;

/// Monetary events published by the payment engine
#[derive(Debug, Clone)]
pub enum PaymentEvent {
    /// The provider accepted an exchange message for an invoice
    InvoicePaid {
        session_id: String,
        consumer: Identity,
        agreement_id: u64,
        agreement_total: u128,
    },
    /// A hermes-countersigned promise was stored
    HermesPromiseStored {
        provider: Identity,
        hermes: Identity,
        promise: Promise,
    },
    /// A settlement round trip finished on-chain
    SettlementComplete {
        provider: Identity,
        hermes: Identity,
    },
}

/// Sink for payment events
pub trait PaymentEventPublisher: Send + Sync {
    fn publish(&self, event: PaymentEvent);
}

/// Publisher that drops everything
pub struct NoopPaymentPublisher;

impl PaymentEventPublisher for NoopPaymentPublisher {
    fn publish(&self, _event: PaymentEvent) {}
}
