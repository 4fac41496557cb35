//! Service proposals and provider contacts

use serde::{Deserialize, Serialize};
use wayfarer_crypto::Identity;

use crate::money::Price;

/// How to reach a provider over a shared broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerContact {
    pub broker_addresses: Vec<String>,
    pub topic: String,
}

/// A single contact definition shipped inside a proposal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Contact {
    /// Broker-mediated first contact, the transport this node speaks
    Broker(BrokerContact),
    /// A transport this node does not understand; kept for forward compat
    Unknown { contact_type: String },
}

/// Access policy reference attached to a proposal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessPolicy {
    pub id: String,
    pub source: String,
}

/// Provider location as advertised
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub country: Option<String>,
    pub city: Option<String>,
}

/// Quality metrics from the quality oracle
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Quality {
    pub quality: f64,
    pub latency_ms: f64,
    pub bandwidth_mbps: f64,
}

/// An immutable provider offering. Consumed, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: i64,
    pub provider_id: Identity,
    pub service_type: String,
    pub contacts: Vec<Contact>,
    pub access_policies: Vec<AccessPolicy>,
    pub price: Price,
    pub location: Location,
    pub quality: Quality,
}

impl Proposal {
    /// First contact that supports broker-mediated dialing, if any
    pub fn broker_contact(&self) -> Option<&BrokerContact> {
        self.contacts.iter().find_map(|c| match c {
            Contact::Broker(contact) => Some(contact),
            Contact::Unknown { .. } => None,
        })
    }
}

/// Criteria for discovering proposals
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProposalFilter {
    pub provider_id: Option<Identity>,
    pub service_type: Option<String>,
    pub country: Option<String>,
    pub max_price_per_hour: Option<u128>,
    pub max_price_per_gib: Option<u128>,
}

impl ProposalFilter {
    /// Whether `proposal` satisfies every set criterion
    pub fn matches(&self, proposal: &Proposal) -> bool {
        if let Some(provider_id) = &self.provider_id {
            if proposal.provider_id != *provider_id {
                return false;
            }
        }
        if let Some(service_type) = &self.service_type {
            if proposal.service_type != *service_type {
                return false;
            }
        }
        if let Some(country) = &self.country {
            if proposal.location.country.as_deref() != Some(country.as_str()) {
                return false;
            }
        }
        if let Some(max) = self.max_price_per_hour {
            if proposal.price.per_hour.amount > max {
                return false;
            }
        }
        if let Some(max) = self.max_price_per_gib {
            if proposal.price.per_gib.amount > max {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wayfarer_crypto::{KeySigner, Signer};

    fn proposal(provider_id: Identity) -> Proposal {
        Proposal {
            id: 1,
            provider_id,
            service_type: crate::SERVICE_TYPE_WIREGUARD.to_string(),
            contacts: vec![
                Contact::Unknown {
                    contact_type: "http/v1".to_string(),
                },
                Contact::Broker(BrokerContact {
                    broker_addresses: vec!["broker.wayfarer.network:4222".to_string()],
                    topic: "provider-topic".to_string(),
                }),
            ],
            access_policies: vec![],
            price: Price::new(50_000, 7_000),
            location: Location {
                country: Some("LT".to_string()),
                city: None,
            },
            quality: Quality::default(),
        }
    }

    #[test]
    fn test_broker_contact_skips_unknown_transports() {
        let p = proposal(KeySigner::generate().identity());
        let contact = p.broker_contact().expect("broker contact present");
        assert_eq!(contact.topic, "provider-topic");
    }

    #[test]
    fn test_broker_contact_absent() {
        let mut p = proposal(KeySigner::generate().identity());
        p.contacts = vec![Contact::Unknown {
            contact_type: "http/v1".to_string(),
        }];
        assert!(p.broker_contact().is_none());
    }

    #[test]
    fn test_filter_by_provider_and_price() {
        let provider_id = KeySigner::generate().identity();
        let p = proposal(provider_id);

        let mut filter = ProposalFilter {
            provider_id: Some(provider_id),
            max_price_per_hour: Some(100_000),
            ..Default::default()
        };
        assert!(filter.matches(&p));

        filter.max_price_per_hour = Some(10_000);
        assert!(!filter.matches(&p));

        filter = ProposalFilter {
            provider_id: Some(KeySigner::generate().identity()),
            ..Default::default()
        };
        assert!(!filter.matches(&p));
    }

    #[test]
    fn test_filter_by_country() {
        let p = proposal(KeySigner::generate().identity());

        let filter = ProposalFilter {
            country: Some("LT".to_string()),
            ..Default::default()
        };
        assert!(filter.matches(&p));

        let filter = ProposalFilter {
            country: Some("DE".to_string()),
            ..Default::default()
        };
        assert!(!filter.matches(&p));
    }

    #[test]
    fn test_proposal_serde_roundtrip() {
        let p = proposal(KeySigner::generate().identity());
        let bytes = bincode::serialize(&p).unwrap();
        let decoded: Proposal = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, p);
    }
}
