//! Wayfarer Broker Transport
//!
//! A thin publish/subscribe + request/reply client against a shared message
//! broker. The broker is used for first-contact signalling only: identities
//! that have never met exchange signed envelopes over subjects derived from
//! the provider's address, then move to a direct channel.
//!
//! Provides:
//! - `BrokerConnection` — the subject-addressed transport capability
//! - `BrokerClient` — reconnecting wrapper with exponential backoff
//! - `MemoryBroker` — in-process broker for tests and local wiring
//! - signed envelopes: sign on pack, recover the sender identity on unpack

pub mod client;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod memory;

pub use client::{BrokerClient, BrokerConfig, BrokerDialer};
pub use connection::{BrokerConnection, Delivery, Subscription};
pub use envelope::{pack_signed, unpack_signed, SignedEnvelope};
pub use error::{BrokerError, BrokerResult};
pub use memory::MemoryBroker;

use std::time::Duration;

/// Default timeout for request/reply round trips
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
