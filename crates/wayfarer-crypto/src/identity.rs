//! Node Identity Management
//!
//! An identity is a 20-byte address derived from a secp256k1 public key
//! (last 20 bytes of the Keccak-256 of the uncompressed key). Signatures
//! are 65-byte recoverable ECDSA over the Keccak-256 of the message, so a
//! receiver can authenticate a peer it has never met by recovering the
//! address straight from the signature.

use std::fmt;
use std::sync::Arc;

use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, PublicKey, SecretKey, SECP256K1};
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;
use zeroize::ZeroizeOnDrop;

use crate::constants::{ADDRESS_SIZE, SIGNATURE_SIZE};
use crate::error::{CryptoError, CryptoResult};
use crate::hashlock::keccak256;

/// A 160-bit node address
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity {
    bytes: [u8; ADDRESS_SIZE],
}

/// A 65-byte recoverable ECDSA signature (r || s || v)
#[derive(Clone, Copy, Serialize, Deserialize)]
pub struct Signature {
    #[serde(with = "BigArray")]
    bytes: [u8; SIGNATURE_SIZE],
}

impl Identity {
    /// Create an identity from raw address bytes
    pub fn from_bytes(bytes: [u8; ADDRESS_SIZE]) -> Self {
        Self { bytes }
    }

    /// Derive the identity from an uncompressed secp256k1 public key
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        let uncompressed = public_key.serialize_uncompressed();
        // Skip the 0x04 tag, hash the 64-byte (x || y) point.
        let hash = keccak256(&uncompressed[1..]);
        let mut bytes = [0u8; ADDRESS_SIZE];
        bytes.copy_from_slice(&hash[12..]);
        Self { bytes }
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; ADDRESS_SIZE] {
        &self.bytes
    }

    /// Convert to a lowercase hex string with `0x` prefix
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.bytes))
    }

    /// Parse from a hex string, with or without `0x` prefix
    pub fn from_hex(s: &str) -> CryptoResult<Self> {
        let stripped = s.strip_prefix("0x").unwrap_or(s);
        let decoded =
            hex::decode(stripped).map_err(|e| CryptoError::InvalidAddress(e.to_string()))?;
        if decoded.len() != ADDRESS_SIZE {
            return Err(CryptoError::InvalidAddress(format!(
                "expected {} bytes, got {}",
                ADDRESS_SIZE,
                decoded.len()
            )));
        }
        let mut bytes = [0u8; ADDRESS_SIZE];
        bytes.copy_from_slice(&decoded);
        Ok(Self { bytes })
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({}…)", &self.to_hex()[..10])
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Signature {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; SIGNATURE_SIZE]) -> Self {
        Self { bytes }
    }

    /// Try to create from a slice
    pub fn try_from_slice(slice: &[u8]) -> CryptoResult<Self> {
        if slice.len() != SIGNATURE_SIZE {
            return Err(CryptoError::InvalidSignature);
        }
        let mut bytes = [0u8; SIGNATURE_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self { bytes })
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.bytes
    }

    /// Recover the identity that signed `message`
    pub fn recover(&self, message: &[u8]) -> CryptoResult<Identity> {
        let recovery_id = RecoveryId::from_i32(i32::from(self.bytes[SIGNATURE_SIZE - 1]))
            .map_err(|_| CryptoError::InvalidSignature)?;
        let signature =
            RecoverableSignature::from_compact(&self.bytes[..SIGNATURE_SIZE - 1], recovery_id)
                .map_err(|_| CryptoError::InvalidSignature)?;

        let digest = Message::from_digest(keccak256(message));
        let public_key = SECP256K1
            .recover_ecdsa(&digest, &signature)
            .map_err(|_| CryptoError::RecoveryFailed)?;
        Ok(Identity::from_public_key(&public_key))
    }

    /// Verify that `message` was signed by `expected`
    pub fn verify(&self, message: &[u8], expected: &Identity) -> CryptoResult<()> {
        let recovered = self.recover(message)?;
        if recovered != *expected {
            return Err(CryptoError::SignatureVerificationFailed);
        }
        Ok(())
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}…)", hex::encode(&self.bytes[..4]))
    }
}

impl PartialEq for Signature {
    fn eq(&self, other: &Self) -> bool {
        self.bytes[..] == other.bytes[..]
    }
}

impl Eq for Signature {}

/// A signing oracle for one identity
pub trait Signer: Send + Sync {
    /// Sign arbitrary bytes
    fn sign(&self, message: &[u8]) -> CryptoResult<Signature>;

    /// The identity the signatures recover to
    fn identity(&self) -> Identity;
}

/// Resolves a signer for an unlocked identity; `None` when the identity
/// is unknown or still locked.
pub type SignerFactory = Arc<dyn Fn(&Identity) -> Option<Arc<dyn Signer>> + Send + Sync>;

/// In-memory signer holding a secp256k1 secret key
#[derive(ZeroizeOnDrop)]
pub struct KeySigner {
    #[zeroize(skip)]
    secret_key: SecretKey,
    #[zeroize(skip)]
    identity: Identity,
}

impl KeySigner {
    /// Generate a signer with a fresh random key
    pub fn generate() -> Self {
        let secret_key = SecretKey::new(&mut rand::rngs::OsRng);
        Self::from_secret_key(secret_key)
    }

    /// Create from an existing secret key
    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let public_key = secret_key.public_key(SECP256K1);
        Self {
            secret_key,
            identity: Identity::from_public_key(&public_key),
        }
    }

    /// Create from raw secret key bytes (for loading from storage)
    pub fn from_bytes(bytes: &[u8; 32]) -> CryptoResult<Self> {
        let secret_key = SecretKey::from_slice(bytes).map_err(|_| CryptoError::InvalidKeyLength {
            expected: 32,
            actual: bytes.len(),
        })?;
        Ok(Self::from_secret_key(secret_key))
    }
}

impl Signer for KeySigner {
    fn sign(&self, message: &[u8]) -> CryptoResult<Signature> {
        let digest = Message::from_digest(keccak256(message));
        let signature = SECP256K1.sign_ecdsa_recoverable(&digest, &self.secret_key);
        let (recovery_id, compact) = signature.serialize_compact();

        let mut bytes = [0u8; SIGNATURE_SIZE];
        bytes[..SIGNATURE_SIZE - 1].copy_from_slice(&compact);
        bytes[SIGNATURE_SIZE - 1] = recovery_id.to_i32() as u8;
        Ok(Signature::from_bytes(bytes))
    }

    fn identity(&self) -> Identity {
        self.identity
    }
}
