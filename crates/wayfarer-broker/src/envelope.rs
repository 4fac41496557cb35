//! Signed envelopes
//!
//! The only trust bootstrap between strangers: the sender signs the payload
//! bytes, the receiver recovers the identity from the signature and treats
//! it as the authenticated peer id. Everything after first contact runs over
//! the P2P channel's own keys.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use wayfarer_crypto::{Identity, Signature, Signer};

use crate::error::BrokerResult;

/// Wire envelope: payload bytes plus a recoverable signature over them
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedEnvelope {
    pub data: Vec<u8>,
    pub signature: Signature,
}

/// Serialize `payload`, sign it and return ready-to-send envelope bytes
pub fn pack_signed<T: Serialize>(signer: &dyn Signer, payload: &T) -> BrokerResult<Vec<u8>> {
    let data = bincode::serialize(payload)?;
    let signature = signer.sign(&data)?;
    let envelope = SignedEnvelope { data, signature };
    Ok(bincode::serialize(&envelope)?)
}

/// Open an envelope: decode the payload and recover the sender identity
pub fn unpack_signed<T: DeserializeOwned>(bytes: &[u8]) -> BrokerResult<(T, Identity)> {
    let envelope: SignedEnvelope = bincode::deserialize(bytes)?;
    let sender = envelope.signature.recover(&envelope.data)?;
    let payload = bincode::deserialize(&envelope.data)?;
    Ok((payload, sender))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wayfarer_crypto::KeySigner;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Greeting {
        public_key: String,
    }

    #[test]
    fn test_pack_unpack_recovers_sender() {
        let signer = KeySigner::generate();
        let payload = Greeting {
            public_key: "aa".repeat(32),
        };

        let bytes = pack_signed(&signer, &payload).unwrap();
        let (decoded, sender) = unpack_signed::<Greeting>(&bytes).unwrap();

        assert_eq!(decoded, payload);
        assert_eq!(sender, signer.identity());
    }

    #[test]
    fn test_tampered_payload_changes_recovered_identity() {
        let signer = KeySigner::generate();
        let payload = Greeting {
            public_key: "aa".repeat(32),
        };

        let bytes = pack_signed(&signer, &payload).unwrap();
        let mut envelope: SignedEnvelope = bincode::deserialize(&bytes).unwrap();
        envelope.data[8] ^= 0x01;
        let tampered = bincode::serialize(&envelope).unwrap();

        // Either the unpack fails outright or the recovered identity no
        // longer matches the signer; both reject the message upstream.
        match unpack_signed::<Greeting>(&tampered) {
            Ok((_, sender)) => assert_ne!(sender, signer.identity()),
            Err(_) => {}
        }
    }

    #[test]
    fn test_garbage_bytes_rejected() {
        assert!(unpack_signed::<Greeting>(b"not an envelope").is_err());
    }
}
