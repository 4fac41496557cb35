//! Payment configuration

use std::time::Duration;

use wayfarer_crypto::Identity;

/// Upper limit of unpaid session value before the session is delinquent,
/// in base token units.
pub const MAX_UNPAID_INVOICE_VALUE: u128 = 30_000_000_000_000_000;

/// Data the consumer agrees to pay for beyond what it observed locally
pub const DATA_LEEWAY_MEGABYTES: u64 = 20;

/// Provider-side invoice loop configuration
#[derive(Debug, Clone)]
pub struct InvoiceTrackerConfig {
    /// Pacing between invoices
    pub charge_period: Duration,
    /// Grace window of value a slow consumer may lag behind
    pub charge_period_leeway: Duration,
    /// How long to wait for an exchange message
    pub exchange_message_wait_timeout: Duration,
    /// Delay before the very first invoice; short, to probe the consumer
    pub first_invoice_send_duration: Duration,
    /// Wait window for the first exchange; detects dead consumers fast
    pub first_invoice_send_timeout: Duration,
    /// Unpaid value cap before the session is failed
    pub max_unpaid_invoice_value: u128,
    /// Consecutive hermes failures before the session is failed
    pub max_hermes_failure_count: u32,
    /// Fee forwarded to the transactor with every invoice
    pub transactor_fee: u128,
    /// Registry address used in channel id derivation
    pub registry: Identity,
    /// Channel implementation address used in channel id derivation
    pub channel_implementation: Identity,
}

impl InvoiceTrackerConfig {
    pub fn new(registry: Identity, channel_implementation: Identity) -> Self {
        Self {
            charge_period: Duration::from_secs(60),
            charge_period_leeway: Duration::from_secs(120),
            exchange_message_wait_timeout: Duration::from_secs(50),
            first_invoice_send_duration: Duration::from_secs(1),
            first_invoice_send_timeout: Duration::from_secs(10),
            max_unpaid_invoice_value: MAX_UNPAID_INVOICE_VALUE,
            max_hermes_failure_count: 10,
            transactor_fee: 0,
            registry,
            channel_implementation,
        }
    }
}

/// Consumer-side invoice payer configuration
#[derive(Debug, Clone)]
pub struct InvoicePayerConfig {
    /// Extra data volume the consumer will pay for without complaint
    pub data_leeway_megabytes: u64,
    /// Time skew allowed between provider and consumer clocks
    pub time_leeway: Duration,
    /// Registry address used in channel id derivation
    pub registry: Identity,
    /// Channel implementation address used in channel id derivation
    pub channel_implementation: Identity,
}

impl InvoicePayerConfig {
    pub fn new(registry: Identity, channel_implementation: Identity) -> Self {
        Self {
            data_leeway_megabytes: DATA_LEEWAY_MEGABYTES,
            time_leeway: Duration::from_secs(120),
            registry,
            channel_implementation,
        }
    }
}

/// Settler configuration
#[derive(Debug, Clone)]
pub struct SettlerConfig {
    pub hermes_id: Identity,
    /// Settle once balance drops to this fraction of available balance
    pub threshold: f64,
    /// How long to wait for on-chain settlement confirmation
    pub max_wait_for_settlement: Duration,
}

impl SettlerConfig {
    pub fn new(hermes_id: Identity) -> Self {
        Self {
            hermes_id,
            threshold: 0.1,
            max_wait_for_settlement: Duration::from_secs(2 * 60 * 60),
        }
    }
}
