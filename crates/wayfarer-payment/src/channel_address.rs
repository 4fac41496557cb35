//! Payment channel address derivation
//!
//! A consumer's payment channel is deterministic in the four addresses that
//! define it. The provider recomputes the id for every exchange message and
//! rejects promises drawn against a foreign channel.

use wayfarer_crypto::{keccak256, Identity};

const CHANNEL_DOMAIN: &[u8] = b"wayfarer:payment:channel";

/// Derive the channel id for `(consumer, hermes)` under the given registry
/// and channel implementation addresses.
pub fn channel_address(
    consumer: &Identity,
    hermes: &Identity,
    registry: &Identity,
    channel_implementation: &Identity,
) -> [u8; 32] {
    let mut preimage = Vec::with_capacity(CHANNEL_DOMAIN.len() + 4 * 20);
    preimage.extend_from_slice(CHANNEL_DOMAIN);
    preimage.extend_from_slice(registry.as_bytes());
    preimage.extend_from_slice(channel_implementation.as_bytes());
    preimage.extend_from_slice(consumer.as_bytes());
    preimage.extend_from_slice(hermes.as_bytes());
    keccak256(&preimage)
}
