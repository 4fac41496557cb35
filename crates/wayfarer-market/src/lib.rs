//! Wayfarer Marketplace Types
//!
//! Proposals are immutable advertisements of a provider's service offering.
//! This crate holds the proposal record itself, the contact definitions used
//! for first contact over a broker, and the money/pricing arithmetic that
//! turns elapsed time and transferred bytes into token amounts.

pub mod money;
pub mod proposal;

pub use money::{AmountCalc, Currency, Money, Price};
pub use proposal::{
    AccessPolicy, BrokerContact, Contact, Location, Proposal, ProposalFilter, Quality,
};

/// Service type string for wireguard-based tunnels
pub const SERVICE_TYPE_WIREGUARD: &str = "wireguard";

/// Service type string for openvpn-based tunnels
pub const SERVICE_TYPE_OPENVPN: &str = "openvpn";
