//! Wire messages for the config exchange and channel framing

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Broker subject suffix for the initial exchange
pub const CONFIG_EXCHANGE_SUBJECT: &str = "p2p-config-exchange";
/// Broker subject suffix for the exchange acknowledgement
pub const CONFIG_EXCHANGE_ACK_SUBJECT: &str = "p2p-config-exchange-ack";

/// Subject for the initial exchange of provider `P`
pub fn exchange_subject(provider: &wayfarer_crypto::Identity) -> String {
    format!("{}.{}", provider.to_hex(), CONFIG_EXCHANGE_SUBJECT)
}

/// Subject for the exchange ack of provider `P`
pub fn exchange_ack_subject(provider: &wayfarer_crypto::Identity) -> String {
    format!("{}.{}", provider.to_hex(), CONFIG_EXCHANGE_ACK_SUBJECT)
}

/// One leg of the three-message key exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigExchangeMsg {
    /// Sender's ephemeral X25519 public key, hex encoded
    pub public_key: String,
    /// Connect config sealed to the peer's key; empty on the first leg
    pub config_ciphertext: Vec<u8>,
}

/// Connectivity parameters shipped inside the sealed box
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectConfig {
    pub public_ip: IpAddr,
    pub ports: Vec<u16>,
}

/// Control channel topics multiplexed over one peer channel
pub mod topics {
    pub const SESSION_CREATE: &str = "session.create";
    pub const SESSION_ACKNOWLEDGE: &str = "session.ack";
    pub const SESSION_DESTROY: &str = "session.destroy";
    pub const SESSION_STATUS: &str = "session.status";
    pub const KEEP_ALIVE: &str = "keepalive";
    pub const PAYMENT_INVOICE: &str = "payment.invoice";
    pub const PAYMENT_EXCHANGE: &str = "payment.exchange";
}

#[cfg(test)]
mod tests {
    use super::*;
    use wayfarer_crypto::{KeySigner, Signer};

    #[test]
    fn test_subjects_derive_from_provider_address() {
        let provider = KeySigner::generate().identity();
        let subject = exchange_subject(&provider);

        assert!(subject.starts_with(&provider.to_hex()));
        assert!(subject.ends_with(".p2p-config-exchange"));
        assert_eq!(
            exchange_ack_subject(&provider),
            format!("{}-ack", subject)
        );
    }

    #[test]
    fn test_connect_config_roundtrip() {
        let config = ConnectConfig {
            public_ip: "203.0.113.7".parse().unwrap(),
            ports: vec![40000, 40001, 40002],
        };
        let bytes = bincode::serialize(&config).unwrap();
        let decoded: ConnectConfig = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, config);
    }
}
