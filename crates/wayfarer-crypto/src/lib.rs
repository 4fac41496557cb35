//! Wayfarer Cryptographic Primitives
//!
//! This crate provides all cryptographic operations for the Wayfarer network:
//! - Node identities and recoverable signatures (secp256k1 + Keccak-256)
//! - Sealed boxes for config exchange (X25519 + ChaCha20-Poly1305)
//! - Hashlock commitments for invoices
//! - Key derivation (HKDF-SHA256)

pub mod boxes;
pub mod error;
pub mod hashlock;
pub mod identity;

pub use boxes::{BoxKeyPair, BoxPublicKey, BoxSecretKey};
pub use error::{CryptoError, CryptoResult};
pub use hashlock::{keccak256, Hashlock, Preimage};
pub use identity::{Identity, KeySigner, Signature, Signer, SignerFactory};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::boxes::*;
    pub use crate::error::*;
    pub use crate::hashlock::*;
    pub use crate::identity::*;
}

/// Protocol constants
pub mod constants {
    /// Identity address size (truncated Keccak-256 of the public key)
    pub const ADDRESS_SIZE: usize = 20;

    /// Recoverable ECDSA signature size (r || s || v)
    pub const SIGNATURE_SIZE: usize = 65;

    /// X25519 key size in bytes
    pub const X25519_KEY_SIZE: usize = 32;

    /// ChaCha20-Poly1305 key size
    pub const SYMMETRIC_KEY_SIZE: usize = 32;

    /// ChaCha20-Poly1305 nonce size
    pub const NONCE_SIZE: usize = 12;

    /// Poly1305 authentication tag size
    pub const AUTH_TAG_SIZE: usize = 16;

    /// Hashlock commitment and preimage size
    pub const HASHLOCK_SIZE: usize = 32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_crypto_flow() {
        // Two strangers: sign a payload, recover the sender, then exchange
        // an encrypted config both ways with fresh box keys.
        let consumer = KeySigner::generate();
        let provider = KeySigner::generate();

        let payload = b"connect config exchange";
        let signature = consumer.sign(payload).expect("signing failed");
        let recovered = signature.recover(payload).expect("recover failed");
        assert_eq!(recovered, consumer.identity());
        assert_ne!(recovered, provider.identity());

        let consumer_keys = BoxKeyPair::generate();
        let provider_keys = BoxKeyPair::generate();

        let secret_config = b"public_ip=1.2.3.4 ports=40000-40009";
        let sealed = boxes::seal(&consumer_keys.secret, &provider_keys.public, secret_config)
            .expect("seal failed");
        let opened = boxes::open(&provider_keys.secret, &consumer_keys.public, &sealed)
            .expect("open failed");
        assert_eq!(opened, secret_config);

        // And a hashlock the provider can later reveal.
        let preimage = Preimage::generate();
        assert!(preimage.lock().matches(&preimage));
    }
}
