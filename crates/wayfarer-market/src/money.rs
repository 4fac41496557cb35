//! Token amounts and pricing arithmetic
//!
//! Amounts are kept in base units (18 decimals) as u128, wide enough for
//! any realistic tally without overflow during prorating.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Base units per whole token
pub const TOKEN_BASE: u128 = 1_000_000_000_000_000_000;

/// Bytes per GiB used for per-volume pricing
pub const BYTES_PER_GIB: u128 = 1024 * 1024 * 1024;

/// Supported settlement currencies
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum Currency {
    #[default]
    Myst,
}

/// A token amount in base units
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Money {
    pub amount: u128,
    pub currency: Currency,
}

impl Money {
    /// Create an amount in base units
    pub fn new(amount: u128) -> Self {
        Self {
            amount,
            currency: Currency::Myst,
        }
    }

    /// Create an amount from whole tokens
    pub fn from_tokens(tokens: u128) -> Self {
        Self::new(tokens * TOKEN_BASE)
    }

    /// Whether the amount is zero
    pub fn is_zero(&self) -> bool {
        self.amount == 0
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.amount / TOKEN_BASE;
        let frac = self.amount % TOKEN_BASE;
        if frac == 0 {
            write!(f, "{} MYST", whole)
        } else {
            write!(f, "{}.{:018} MYST", whole, frac)
        }
    }
}

/// Proposal price: time component plus volume component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Price {
    pub per_hour: Money,
    pub per_gib: Money,
}

impl Price {
    pub fn new(per_hour: u128, per_gib: u128) -> Self {
        Self {
            per_hour: Money::new(per_hour),
            per_gib: Money::new(per_gib),
        }
    }

    /// A free service
    pub fn free() -> Self {
        Self::default()
    }
}

/// Computes the total owed for a session from elapsed time and bytes moved
#[derive(Debug, Clone, Copy)]
pub struct AmountCalc {
    price: Price,
}

impl AmountCalc {
    pub fn new(price: Price) -> Self {
        Self { price }
    }

    /// Total amount for `elapsed` wall time and `bytes` transferred,
    /// prorated in milliseconds and bytes respectively.
    pub fn total_amount(&self, elapsed: Duration, bytes: u64) -> Money {
        let time_component =
            self.price.per_hour.amount * elapsed.as_millis() / (60 * 60 * 1000);
        let volume_component = self.price.per_gib.amount * u128::from(bytes) / BYTES_PER_GIB;
        Money::new(time_component + volume_component)
    }
}
