//! Payment state persistence surfaces
//!
//! Two small stores keep monetary state across restarts: the consumer's
//! last emitted totals per `(hermes, consumer)` pair, and the provider's
//! latest hermes promise per `(provider, hermes)` pair. The traits are the
//! persistence boundary; the in-memory implementations back tests and
//! single-process nodes.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use wayfarer_crypto::Identity;

use crate::error::PaymentResult;
use crate::messages::HermesPromise;

/// Last `(agreement_id, agreement_total)` the consumer ever signed for a
/// `(hermes, consumer)` pair. After a restart the consumer must never emit
/// a promise below this floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerTotal {
    pub agreement_id: u64,
    pub agreement_total: u128,
}

/// Store of consumer totals keyed by `(hermes, consumer)`
pub trait ConsumerTotalsStorage: Send + Sync {
    fn get(&self, hermes: &Identity, consumer: &Identity) -> PaymentResult<Option<ConsumerTotal>>;
    fn store(
        &self,
        hermes: &Identity,
        consumer: &Identity,
        total: ConsumerTotal,
    ) -> PaymentResult<()>;
}

/// Store of hermes promises keyed by `(provider, hermes)`
pub trait PromiseStorage: Send + Sync {
    fn get(&self, provider: &Identity, hermes: &Identity) -> PaymentResult<Option<HermesPromise>>;
    fn store(
        &self,
        provider: &Identity,
        hermes: &Identity,
        promise: HermesPromise,
    ) -> PaymentResult<()>;
}

/// In-memory consumer totals store
#[derive(Default)]
pub struct MemoryConsumerTotalsStorage {
    totals: Mutex<HashMap<(Identity, Identity), ConsumerTotal>>,
}

impl ConsumerTotalsStorage for MemoryConsumerTotalsStorage {
    fn get(&self, hermes: &Identity, consumer: &Identity) -> PaymentResult<Option<ConsumerTotal>> {
        Ok(self
            .totals
            .lock()
            .expect("totals lock poisoned")
            .get(&(*hermes, *consumer))
            .copied())
    }

    fn store(
        &self,
        hermes: &Identity,
        consumer: &Identity,
        total: ConsumerTotal,
    ) -> PaymentResult<()> {
        self.totals
            .lock()
            .expect("totals lock poisoned")
            .insert((*hermes, *consumer), total);
        Ok(())
    }
}

/// In-memory hermes promise store
#[derive(Default)]
pub struct MemoryPromiseStorage {
    promises: Mutex<HashMap<(Identity, Identity), HermesPromise>>,
}

impl PromiseStorage for MemoryPromiseStorage {
    fn get(&self, provider: &Identity, hermes: &Identity) -> PaymentResult<Option<HermesPromise>> {
        Ok(self
            .promises
            .lock()
            .expect("promises lock poisoned")
            .get(&(*provider, *hermes))
            .cloned())
    }

    fn store(
        &self,
        provider: &Identity,
        hermes: &Identity,
        promise: HermesPromise,
    ) -> PaymentResult<()> {
        self.promises
            .lock()
            .expect("promises lock poisoned")
            .insert((*provider, *hermes), promise);
        Ok(())
    }
}
