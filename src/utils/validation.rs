//! Validation utilities for wallet requests

use bigdecimal::BigDecimal;

use crate::types::*;

/// Validate that an amount is positive and within `[minimum, maximum]`
pub fn validate_amount(amount: i64, minimum: i64, maximum: i64) -> LedgerResult<()> {
    if amount <= 0 {
        return Err(ValidationError::NonPositiveAmount.into());
    }

    if amount < minimum {
        return Err(ValidationError::BelowMinimum { amount, minimum }.into());
    }

    if amount > maximum {
        return Err(ValidationError::AboveMaximum { amount, maximum }.into());
    }

    Ok(())
}

/// Validate a transfer fee and return the total debited from the sender
pub fn validate_fee(amount: i64, fee: i64) -> LedgerResult<i64> {
    if fee < 0 {
        return Err(ValidationError::NegativeFee.into());
    }

    amount.checked_add(fee).ok_or_else(|| {
        ValidationError::AboveMaximum {
            amount: fee,
            maximum: i64::MAX - amount,
        }
        .into()
    })
}

/// Validate that an idempotency key was supplied
pub fn validate_idempotency_key(key: &str) -> LedgerResult<()> {
    if key.trim().is_empty() {
        return Err(ValidationError::MissingIdempotencyKey.into());
    }
    Ok(())
}

/// Validate that a transfer moves money between two different owners
pub fn validate_distinct_owners(from: OwnerId, to: OwnerId) -> LedgerResult<()> {
    if from == to {
        return Err(ValidationError::SameAccount.into());
    }
    Ok(())
}

/// Render an amount in minor units as major units with two decimals
pub fn format_major_units(amount: i64, currency: &str) -> String {
    let major = (BigDecimal::from(amount) / BigDecimal::from(100)).with_scale(2);
    format!("{} {}", currency, major)
}

/// Generate a reference for requests that carry none
pub fn generate_reference(kind: TransactionKind) -> String {
    let prefix = match kind {
        TransactionKind::Deposit => "DEP",
        TransactionKind::Withdrawal => "WDR",
        TransactionKind::P2p => "P2P",
        TransactionKind::Fee => "FEE",
        TransactionKind::Refund => "RFD",
    };
    format!("{}-{}", prefix, uuid::Uuid::new_v4().simple())
}
