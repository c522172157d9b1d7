//! Market identity and window timing.
//!
//! A trading cycle is bound to exactly one market window: one outcome token
//! of one binary condition, tradeable between `opens_at_ms` and
//! `closes_at_ms`.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Outcome token identifier (venue asset id, decimal string).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenId(String);

impl TokenId {
    /// Create a token id. Rejects empty or whitespace-only strings.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.is_empty() {
            return Err(CoreError::InvalidTokenId("empty token id".to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short suffix for log lines (token ids are ~77 digits long).
    pub fn short(&self) -> &str {
        let len = self.0.len();
        &self.0[len.saturating_sub(8)..]
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Binary condition identifier (32-byte hex, `0x`-prefixed, lowercase).
///
/// Decoded once in `parse`; the bytes and the text always agree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ConditionId {
    text: String,
    bytes: [u8; 32],
}

impl ConditionId {
    /// Parse and normalize a condition id.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let hex_part = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);

        let mut bytes = [0u8; 32];
        hex::decode_to_slice(hex_part, &mut bytes)
            .map_err(|e| CoreError::InvalidConditionId(format!("{raw}: {e}")))?;

        Ok(Self {
            text: format!("0x{}", hex::encode(bytes)),
            bytes,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Raw 32 bytes of the condition id.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.bytes
    }
}

impl FromStr for ConditionId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ConditionId {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<ConditionId> for String {
    fn from(id: ConditionId) -> Self {
        id.text
    }
}

impl fmt::Display for ConditionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text)
    }
}

/// Identifier of one trading cycle (one market window).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CycleId(pub u64);

impl fmt::Display for CycleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cycle-{}", self.0)
    }
}

/// One tradeable market window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketWindow {
    /// Cycle bound to this window.
    pub cycle: CycleId,
    /// Human-readable market slug (e.g., "btc-updown-15m-1760000000").
    pub slug: String,
    /// Outcome token this cycle trades.
    pub token_id: TokenId,
    /// Condition the token belongs to.
    pub condition_id: ConditionId,
    /// Outcome slot of `token_id` within the condition (0 = first outcome).
    pub outcome_index: u8,
    /// Window open (Unix ms).
    pub opens_at_ms: u64,
    /// Window close (Unix ms). Trading ends here; settlement follows.
    pub closes_at_ms: u64,
}

impl MarketWindow {
    /// Whether the window has closed at `now_ms`.
    #[must_use]
    pub fn is_closed(&self, now_ms: u64) -> bool {
        now_ms >= self.closes_at_ms
    }

    /// Milliseconds until close (0 once closed).
    #[must_use]
    pub fn remaining_ms(&self, now_ms: u64) -> u64 {
        self.closes_at_ms.saturating_sub(now_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CID: &str = "0x4a629eb456c10ea56e4819f5b54c6727be8010b03c31375fed5b9f100f0dee53";

    #[test]
    fn test_condition_id_normalizes() {
        let upper = CID.to_ascii_uppercase().replacen("0X", "0x", 1);
        let id = ConditionId::parse(&upper).unwrap();
        assert_eq!(id.as_str(), CID);
    }

    #[test]
    fn test_condition_id_rejects_short() {
        assert!(ConditionId::parse("0x1234").is_err());
        assert!(ConditionId::parse("").is_err());
    }

    #[test]
    fn test_condition_id_bytes() {
        let id = ConditionId::parse(CID).unwrap();
        let bytes = id.to_bytes();
        assert_eq!(bytes[0], 0x4a);
        assert_eq!(bytes[31], 0x53);
    }

    #[test]
    fn test_condition_id_rejects_non_hex() {
        // Right length, one bad digit
        let bad = format!("0x{}g", &CID[2..65]);
        assert_eq!(bad.len(), CID.len());
        assert!(matches!(
            ConditionId::parse(&bad),
            Err(CoreError::InvalidConditionId(_))
        ));
        assert!(ConditionId::parse(&CID[2..]).is_ok());
    }

    #[test]
    fn test_token_id_rejects_blank() {
        assert!(TokenId::new("  ").is_err());
        assert_eq!(TokenId::new("123456789").unwrap().short(), "23456789");
    }

    #[test]
    fn test_window_timing() {
        let window = MarketWindow {
            cycle: CycleId(1),
            slug: "btc-updown-15m".to_string(),
            token_id: TokenId::new("1").unwrap(),
            condition_id: ConditionId::parse(CID).unwrap(),
            outcome_index: 0,
            opens_at_ms: 1_000,
            closes_at_ms: 10_000,
        };
        assert!(!window.is_closed(9_999));
        assert!(window.is_closed(10_000));
        assert_eq!(window.remaining_ms(4_000), 6_000);
        assert_eq!(window.remaining_ms(20_000), 0);
    }
}
