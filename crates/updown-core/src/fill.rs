//! Fill ingestion types.
//!
//! `RawFillEvent` is what the venue reports; it is untrusted. A
//! `ConfirmedFill` only exists after the fill ledger has validated the
//! transaction id and classified the side.

use crate::decimal::{Price, Size};
use crate::error::{CoreError, Result};
use crate::market::TokenId;
use crate::order::IntentSide;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Minimum length of a trusted transaction id.
pub const MIN_TX_ID_LEN: usize = 10;

/// Values venues emit when they do not know the transaction hash.
const PLACEHOLDER_IDS: &[&str] = &["unknown", "none", "null", "undefined", "n/a", "nan"];

/// Venue-reported trade direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    /// Buying the cycle token is an entry, selling it is an exit.
    pub fn intent(&self) -> IntentSide {
        match self {
            Self::Buy => IntentSide::Entry,
            Self::Sell => IntentSide::Exit,
        }
    }
}

/// Unique on-chain transaction identifier of a fill.
///
/// Never synthesized: a missing or placeholder id is an error, not a
/// candidate for a generated one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxId(String);

impl TxId {
    /// Validate a raw id.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();

        if trimmed.is_empty() {
            return Err(CoreError::InvalidTxId("missing".to_string()));
        }
        if PLACEHOLDER_IDS
            .iter()
            .any(|p| trimmed.eq_ignore_ascii_case(p))
        {
            return Err(CoreError::InvalidTxId(format!("placeholder '{trimmed}'")));
        }
        if trimmed.len() < MIN_TX_ID_LEN {
            return Err(CoreError::InvalidTxId(format!("too short '{trimmed}'")));
        }
        if trimmed.chars().any(char::is_whitespace) {
            return Err(CoreError::InvalidTxId(format!("contains whitespace '{trimmed}'")));
        }

        Ok(Self(trimmed.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A trade event as reported by the venue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFillEvent {
    /// Transaction id as reported (may be missing or garbage).
    pub tx_id: Option<String>,
    pub token_id: TokenId,
    pub side: TradeSide,
    pub size: Size,
    pub price: Price,
    /// Trade timestamp (Unix ms).
    pub timestamp_ms: u64,
}

/// A fill accepted into the ledger. Immutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmedFill {
    pub unique_tx_id: TxId,
    pub side: IntentSide,
    pub size: Size,
    pub price: Price,
    /// Trade timestamp (Unix ms).
    pub observed_at_ms: u64,
}

impl ConfirmedFill {
    /// Signed inventory contribution (entry positive, exit negative).
    #[must_use]
    pub fn signed_size(&self) -> rust_decimal::Decimal {
        match self.side {
            IntentSide::Entry => self.size.inner(),
            IntentSide::Exit => -self.size.inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_tx_id_rejects_placeholders() {
        assert!(TxId::parse("unknown").is_err());
        assert!(TxId::parse("UNKNOWN").is_err());
        assert!(TxId::parse("null").is_err());
        assert!(TxId::parse("").is_err());
        assert!(TxId::parse("   ").is_err());
    }

    #[test]
    fn test_tx_id_rejects_short_and_spaced() {
        assert!(TxId::parse("0x1234").is_err());
        assert!(TxId::parse("0xabc def0123").is_err());
    }

    #[test]
    fn test_tx_id_normalizes_case() {
        let a = TxId::parse("0xABCDEF0123456789").unwrap();
        let b = TxId::parse(" 0xabcdef0123456789 ").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_trade_side_intent() {
        assert_eq!(TradeSide::Buy.intent(), IntentSide::Entry);
        assert_eq!(TradeSide::Sell.intent(), IntentSide::Exit);
    }

    #[test]
    fn test_signed_size() {
        let fill = ConfirmedFill {
            unique_tx_id: TxId::parse("0xabcdef0123456789").unwrap(),
            side: IntentSide::Exit,
            size: Size::new(dec!(3)),
            price: Price::new(dec!(0.5)),
            observed_at_ms: 0,
        };
        assert_eq!(fill.signed_size(), dec!(-3));
    }
}
