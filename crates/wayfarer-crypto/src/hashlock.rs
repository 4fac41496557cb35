//! Hashlock commitments
//!
//! Every invoice carries `lock = Keccak256(r)` for a fresh random preimage
//! `r` held by the provider until settlement reveals it.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

use crate::constants::HASHLOCK_SIZE;
use crate::error::{CryptoError, CryptoResult};

/// Keccak-256 digest of arbitrary bytes
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// A secret 32-byte preimage
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preimage {
    bytes: [u8; HASHLOCK_SIZE],
}

/// The public commitment to a preimage
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hashlock {
    bytes: [u8; HASHLOCK_SIZE],
}

impl Preimage {
    /// Generate a fresh random preimage
    pub fn generate() -> Self {
        let mut bytes = [0u8; HASHLOCK_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; HASHLOCK_SIZE]) -> Self {
        Self { bytes }
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; HASHLOCK_SIZE] {
        &self.bytes
    }

    /// The commitment this preimage opens
    pub fn lock(&self) -> Hashlock {
        Hashlock {
            bytes: keccak256(&self.bytes),
        }
    }
}

impl Hashlock {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; HASHLOCK_SIZE]) -> Self {
        Self { bytes }
    }

    /// Try to create from a slice
    pub fn try_from_slice(slice: &[u8]) -> CryptoResult<Self> {
        if slice.len() != HASHLOCK_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: HASHLOCK_SIZE,
                actual: slice.len(),
            });
        }
        let mut bytes = [0u8; HASHLOCK_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self { bytes })
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; HASHLOCK_SIZE] {
        &self.bytes
    }

    /// Check whether `preimage` opens this lock
    pub fn matches(&self, preimage: &Preimage) -> bool {
        keccak256(&preimage.bytes) == self.bytes
    }
}

impl std::fmt::Debug for Hashlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hashlock({}…)", hex::encode(&self.bytes[..4]))
    }
}

impl std::fmt::Debug for Preimage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the secret.
        write!(f, "Preimage(…)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_matches_own_preimage() {
        let preimage = Preimage::generate();
        let lock = preimage.lock();

        assert!(lock.matches(&preimage));
        assert!(!lock.matches(&Preimage::generate()));
    }

    #[test]
    fn test_keccak256_known_vector() {
        // Keccak-256 of the empty string.
        assert_eq!(
            hex::encode(keccak256(b"")),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn test_hashlock_slice_parsing() {
        let lock = Preimage::generate().lock();
        let parsed = Hashlock::try_from_slice(lock.as_bytes()).unwrap();
        assert_eq!(parsed, lock);
        assert!(Hashlock::try_from_slice(&[0u8; 16]).is_err());
    }
}
