use crate::error::GateError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A non-negative monetary amount in major currency units.
///
/// Processor payloads carry totals in minor units (cents); `from_minor_units`
/// is the only place that conversion happens.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Amount(Decimal);

impl Amount {
    pub const ZERO: Self = Self(Decimal::ZERO);

    pub fn new(value: Decimal) -> Result<Self, GateError> {
        if value >= Decimal::ZERO {
            Ok(Self(value))
        } else {
            Err(GateError::ValidationError(
                "Amount must not be negative".to_string(),
            ))
        }
    }

    pub fn from_minor_units(minor: i64) -> Result<Self, GateError> {
        Self::new(Decimal::new(minor, 2))
    }

    pub fn value(&self) -> Decimal {
        self.0
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = GateError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Amount> for Decimal {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

impl std::fmt::Display for Amount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
