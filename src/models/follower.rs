//! Follower accounts and the per-symbol precision rules applied to them.

use std::collections::HashMap;
use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// API key pair for one account.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.api_key.is_empty() && !self.api_secret.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &mask_secret(&self.api_key))
            .field("api_secret", &"***")
            .finish()
    }
}

/// Mask a secret while keeping a hint of which one it is.
pub fn mask_secret(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.is_empty() {
        return String::new();
    }
    if chars.len() <= 4 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..2].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    format!("{}***{}", head, tail)
}

/// Exchange trading filters for a symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolRules {
    /// Quantity must be a multiple of this (LOT_SIZE stepSize)
    pub quantity_step: Decimal,

    /// Price must be a multiple of this (PRICE_FILTER tickSize)
    pub price_tick: Decimal,

    /// Minimum order value in quote asset (MIN_NOTIONAL notional)
    pub min_notional: Decimal,

    /// Minimum order quantity (LOT_SIZE minQty)
    #[serde(default)]
    pub min_quantity: Decimal,
}

impl SymbolRules {
    /// Steps must be positive for rounding to be defined.
    pub fn is_valid(&self) -> bool {
        self.quantity_step > Decimal::ZERO
            && self.price_tick > Decimal::ZERO
            && self.min_notional >= Decimal::ZERO
            && self.min_quantity >= Decimal::ZERO
    }
}

/// An account that receives scaled replicas of the master's fills.
#[derive(Debug, Clone, PartialEq)]
pub struct FollowerAccount {
    pub id: String,
    pub credentials: Credentials,

    /// Multiplier applied to master quantity (> 0)
    pub copy_ratio: Decimal,

    pub enabled: bool,

    /// Per-symbol overrides of the exchange's rules
    pub precision: HashMap<String, SymbolRules>,
}

impl FollowerAccount {
    pub fn new(id: impl Into<String>, credentials: Credentials, copy_ratio: Decimal) -> Self {
        Self {
            id: id.into(),
            credentials,
            copy_ratio,
            enabled: true,
            precision: HashMap::new(),
        }
    }

    pub fn rules_for(&self, symbol: &str) -> Option<&SymbolRules> {
        self.precision.get(symbol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret(""), "");
        assert_eq!(mask_secret("abc"), "***");
        assert_eq!(mask_secret("ABCDEFGH"), "AB***GH");
    }

    #[test]
    fn test_credentials_debug_hides_secret() {
        let creds = Credentials::new("KEY123456", "SUPERSECRET");
        let debug = format!("{:?}", creds);
        assert!(!debug.contains("SUPERSECRET"));
        assert!(!debug.contains("KEY123456"));
        assert!(debug.contains("KE***56"));
    }

    #[test]
    fn test_rules_validity() {
        let rules = SymbolRules {
            quantity_step: dec!(0.001),
            price_tick: dec!(0.1),
            min_notional: dec!(100),
            min_quantity: dec!(0.001),
        };
        assert!(rules.is_valid());

        let broken = SymbolRules {
            quantity_step: Decimal::ZERO,
            ..rules
        };
        assert!(!broken.is_valid());
    }
}
