//! Coin and resource ledgers over the shared store.

pub mod coins;
pub mod resources;

use rust_decimal::Decimal;

use crate::error::{Result, TalonError};

pub(crate) fn require_positive(amount: Decimal) -> Result<()> {
    if amount <= Decimal::ZERO {
        return Err(TalonError::Validation(
            "amount must be positive".to_string(),
        ));
    }
    Ok(())
}
