//! Sealed Boxes (X25519 + ChaCha20-Poly1305)
//!
//! Authenticated asymmetric encryption between two ephemeral keys, used to
//! ship connect configs over the broker before any shared secret exists.
//! The X25519 shared point is run through HKDF-SHA256 and the payload is
//! sealed with ChaCha20-Poly1305 under a random nonce prepended to the
//! ciphertext.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce as ChaNonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::ZeroizeOnDrop;

use crate::constants::{AUTH_TAG_SIZE, NONCE_SIZE, SYMMETRIC_KEY_SIZE, X25519_KEY_SIZE};
use crate::error::{CryptoError, CryptoResult};

const BOX_KDF_INFO: &[u8] = b"wayfarer:p2p:sealed-box";

/// An X25519 public key, hex-encodable for the wire
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BoxPublicKey {
    bytes: [u8; X25519_KEY_SIZE],
}

/// An X25519 secret key
#[derive(ZeroizeOnDrop)]
pub struct BoxSecretKey {
    #[zeroize(skip)]
    inner: StaticSecret,
}

/// A per-connection ephemeral keypair
pub struct BoxKeyPair {
    pub secret: BoxSecretKey,
    pub public: BoxPublicKey,
}

impl BoxPublicKey {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; X25519_KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; X25519_KEY_SIZE] {
        &self.bytes
    }

    /// Hex form used inside exchange messages
    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    /// Parse from the hex form
    pub fn from_hex(s: &str) -> CryptoResult<Self> {
        let decoded = hex::decode(s).map_err(|_| CryptoError::InvalidKeyLength {
            expected: X25519_KEY_SIZE,
            actual: 0,
        })?;
        if decoded.len() != X25519_KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: X25519_KEY_SIZE,
                actual: decoded.len(),
            });
        }
        let mut bytes = [0u8; X25519_KEY_SIZE];
        bytes.copy_from_slice(&decoded);
        Ok(Self { bytes })
    }
}

impl std::fmt::Debug for BoxPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BoxPublicKey({}…)", &self.to_hex()[..8])
    }
}

impl BoxSecretKey {
    /// Generate a new random secret key
    pub fn generate() -> Self {
        Self {
            inner: StaticSecret::random_from_rng(rand::rngs::OsRng),
        }
    }

    /// Get the corresponding public key
    pub fn public_key(&self) -> BoxPublicKey {
        BoxPublicKey {
            bytes: X25519Public::from(&self.inner).to_bytes(),
        }
    }

    /// Raw X25519 shared point with `peer`, for callers that run their own KDF
    pub fn diffie_hellman(&self, peer: &BoxPublicKey) -> [u8; X25519_KEY_SIZE] {
        self.inner
            .diffie_hellman(&X25519Public::from(peer.bytes))
            .to_bytes()
    }

    fn shared_key(&self, peer: &BoxPublicKey) -> [u8; SYMMETRIC_KEY_SIZE] {
        let shared = self.diffie_hellman(peer);

        let hkdf = Hkdf::<Sha256>::new(None, &shared);
        let mut key = [0u8; SYMMETRIC_KEY_SIZE];
        hkdf.expand(BOX_KDF_INFO, &mut key)
            .expect("HKDF output length is valid");
        key
    }
}

impl BoxKeyPair {
    /// Generate a fresh ephemeral keypair
    pub fn generate() -> Self {
        let secret = BoxSecretKey::generate();
        let public = secret.public_key();
        Self { secret, public }
    }
}

/// Seal `plaintext` from `secret` to `peer`. Output is `nonce || ciphertext`.
pub fn seal(secret: &BoxSecretKey, peer: &BoxPublicKey, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
    let key = secret.shared_key(peer);
    let cipher = ChaCha20Poly1305::new_from_slice(&key)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(ChaNonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed("sealed box encryption failed".into()))?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a sealed box produced by the peer
pub fn open(secret: &BoxSecretKey, peer: &BoxPublicKey, data: &[u8]) -> CryptoResult<Vec<u8>> {
    if data.len() < NONCE_SIZE + AUTH_TAG_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    let key = secret.shared_key(peer);
    let cipher =
        ChaCha20Poly1305::new_from_slice(&key).map_err(|_| CryptoError::DecryptionFailed)?;

    let (nonce, ciphertext) = data.split_at(NONCE_SIZE);
    cipher
        .decrypt(ChaNonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open() {
        let alice = BoxKeyPair::generate();
        let bob = BoxKeyPair::generate();
        let plaintext = b"public_ip=5.6.7.8";

        let sealed = seal(&alice.secret, &bob.public, plaintext).unwrap();
        assert_ne!(&sealed[NONCE_SIZE..], plaintext);

        let opened = open(&bob.secret, &alice.public, &sealed).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn test_wrong_peer_fails() {
        let alice = BoxKeyPair::generate();
        let bob = BoxKeyPair::generate();
        let eve = BoxKeyPair::generate();

        let sealed = seal(&alice.secret, &bob.public, b"secret").unwrap();
        assert!(open(&eve.secret, &alice.public, &sealed).is_err());
    }

    #[test]
    fn test_tampered_box_fails() {
        let alice = BoxKeyPair::generate();
        let bob = BoxKeyPair::generate();

        let mut sealed = seal(&alice.secret, &bob.public, b"secret").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        assert!(open(&bob.secret, &alice.public, &sealed).is_err());
    }

    #[test]
    fn test_truncated_box_fails() {
        let alice = BoxKeyPair::generate();
        let bob = BoxKeyPair::generate();
        assert!(open(&bob.secret, &alice.public, &[0u8; 8]).is_err());
    }

    #[test]
    fn test_public_key_hex_roundtrip() {
        let keys = BoxKeyPair::generate();
        let parsed = BoxPublicKey::from_hex(&keys.public.to_hex()).unwrap();
        assert_eq!(parsed, keys.public);
        assert!(BoxPublicKey::from_hex("abcd").is_err());
    }
}
