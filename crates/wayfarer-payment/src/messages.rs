//! Payment wire messages
//!
//! The provider issues `Invoice`s carrying a running `agreement_total`; the
//! consumer answers with a signed `ExchangeMessage` whose inner `Promise` is
//! the redeemable instrument. Signatures cover the canonical encoding of
//! everything except the signature field itself, so the provider can recover
//! the consumer identity straight from the message.

use serde::{Deserialize, Serialize};
use wayfarer_crypto::{Hashlock, Identity, Signature, Signer};

use crate::error::{PaymentError, PaymentResult};

/// Provider-signed running tally of what the consumer owes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    pub agreement_id: u64,
    /// Strictly non-decreasing within an agreement
    pub agreement_total: u128,
    pub transactor_fee: u128,
    pub hashlock: Hashlock,
    pub provider: Identity,
}

/// The consumer's pledge of a redeemable value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Promise {
    /// Payment channel this promise draws from
    pub channel_id: [u8; 32],
    pub amount: u128,
    pub fee: u128,
    pub hashlock: Hashlock,
    /// Preimage, empty until revealed at settlement
    pub r: Vec<u8>,
    pub signature: Option<Signature>,
}

impl Promise {
    fn signing_bytes(&self) -> PaymentResult<Vec<u8>> {
        let unsigned = Promise {
            signature: None,
            ..self.clone()
        };
        Ok(bincode::serialize(&unsigned)?)
    }

    /// Sign the promise fields with the consumer key
    pub fn sign(mut self, signer: &dyn Signer) -> PaymentResult<Self> {
        let signature = signer.sign(&self.signing_bytes()?)?;
        self.signature = Some(signature);
        Ok(self)
    }

    /// Recover the identity that signed this promise
    pub fn recover_signer(&self) -> PaymentResult<Identity> {
        let signature = self
            .signature
            .ok_or_else(|| PaymentError::PromiseValidation("promise is unsigned".to_string()))?;
        Ok(signature.recover(&self.signing_bytes()?)?)
    }
}

/// Consumer-signed acknowledgement of an invoice
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeMessage {
    pub promise: Promise,
    pub agreement_id: u64,
    pub agreement_total: u128,
    pub provider: Identity,
    pub signature: Option<Signature>,
}

impl ExchangeMessage {
    fn signing_bytes(&self) -> PaymentResult<Vec<u8>> {
        let unsigned = ExchangeMessage {
            signature: None,
            ..self.clone()
        };
        Ok(bincode::serialize(&unsigned)?)
    }

    /// Sign the whole message with the consumer key
    pub fn sign(mut self, signer: &dyn Signer) -> PaymentResult<Self> {
        let signature = signer.sign(&self.signing_bytes()?)?;
        self.signature = Some(signature);
        Ok(self)
    }

    /// Recover the identity that signed this message
    pub fn recover_signer(&self) -> PaymentResult<Identity> {
        let signature = self.signature.ok_or_else(|| {
            PaymentError::PromiseValidation("exchange message is unsigned".to_string())
        })?;
        Ok(signature.recover(&self.signing_bytes()?)?)
    }
}

/// The provider's stored copy of the latest hermes-countersigned promise,
/// together with the preimage it will reveal at settlement. One live entry
/// per (provider, hermes) pair; newer replaces older.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HermesPromise {
    pub promise: Promise,
    pub agreement_id: u64,
    pub agreement_total: u128,
    pub preimage: wayfarer_crypto::Preimage,
}
