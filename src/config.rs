//! Ledger configuration: amount limits and system account names

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Errors raised while loading configuration
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Business limits and system account settings.
///
/// All amounts are in the smallest currency unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub currency: String,
    pub min_deposit: i64,
    pub min_withdraw: i64,
    pub min_transfer: i64,
    pub max_amount: i64,
    /// Fee applied to transfers that do not carry one
    pub default_transfer_fee: i64,
    /// External ID of the reserve account
    pub reserve_account: String,
    /// External ID of the fee account
    pub fee_account: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            currency: "NGN".to_string(),
            min_deposit: 10_000,
            min_withdraw: 10_000,
            min_transfer: 10_000,
            max_amount: 100_000_000,
            default_transfer_fee: 0,
            reserve_account: "sys_reserve".to_string(),
            fee_account: "sys_fees".to_string(),
        }
    }
}

impl LedgerConfig {
    /// Defaults overlaid with `LEDGER_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(currency) = lookup("LEDGER_CURRENCY") {
            config.currency = currency;
        }
        overlay(&lookup, "LEDGER_MIN_DEPOSIT", &mut config.min_deposit)?;
        overlay(&lookup, "LEDGER_MIN_WITHDRAW", &mut config.min_withdraw)?;
        overlay(&lookup, "LEDGER_MIN_TRANSFER", &mut config.min_transfer)?;
        overlay(&lookup, "LEDGER_MAX_AMOUNT", &mut config.max_amount)?;
        overlay(&lookup, "LEDGER_DEFAULT_TRANSFER_FEE", &mut config.default_transfer_fee)?;
        if let Some(reserve) = lookup("LEDGER_RESERVE_ACCOUNT") {
            config.reserve_account = reserve;
        }
        if let Some(fee) = lookup("LEDGER_FEE_ACCOUNT") {
            config.fee_account = fee;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check that the limits are usable
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.currency.trim().is_empty() {
            return Err(ConfigError::Invalid("currency cannot be empty".to_string()));
        }

        for (name, minimum) in [
            ("min_deposit", self.min_deposit),
            ("min_withdraw", self.min_withdraw),
            ("min_transfer", self.min_transfer),
        ] {
            if minimum <= 0 {
                return Err(ConfigError::Invalid(format!("{} must be positive", name)));
            }
            if minimum > self.max_amount {
                return Err(ConfigError::Invalid(format!(
                    "{} ({}) exceeds max_amount ({})",
                    name, minimum, self.max_amount
                )));
            }
        }

        if self.default_transfer_fee < 0 {
            return Err(ConfigError::Invalid(
                "default_transfer_fee cannot be negative".to_string(),
            ));
        }

        if self.reserve_account == self.fee_account {
            return Err(ConfigError::Invalid(
                "reserve and fee accounts must differ".to_string(),
            ));
        }

        Ok(())
    }
}

fn overlay<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) -> Result<(), ConfigError> {
    if let Some(raw) = lookup(key) {
        *target = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.clone(),
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(LedgerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_overlay_from_lookup() {
        let config = LedgerConfig::from_lookup(lookup(&[
            ("LEDGER_MIN_DEPOSIT", "500"),
            ("LEDGER_DEFAULT_TRANSFER_FEE", "25"),
            ("LEDGER_CURRENCY", "KES"),
        ]))
        .unwrap();
        assert_eq!(config.min_deposit, 500);
        assert_eq!(config.default_transfer_fee, 25);
        assert_eq!(config.currency, "KES");
        assert_eq!(config.max_amount, 100_000_000);
    }

    #[test]
    fn test_rejects_bad_values() {
        let err = LedgerConfig::from_lookup(lookup(&[("LEDGER_MAX_AMOUNT", "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = LedgerConfig::from_lookup(lookup(&[("LEDGER_MIN_WITHDRAW", "200000000")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_deserialize_partial_config() {
        let config: LedgerConfig = serde_json::from_str(r#"{"min_transfer": 100}"#).unwrap();
        assert_eq!(config.min_transfer, 100);
        assert_eq!(config.reserve_account, "sys_reserve");
    }
}
