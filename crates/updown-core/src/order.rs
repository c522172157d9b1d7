//! Order-related types and identifiers.
//!
//! Provides the intent side (entry/exit), client and venue order ids, and the
//! order intent owned by the position state machine.

use crate::decimal::{Price, Size};
use crate::market::TokenId;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Which leg of the position lifecycle an order or fill belongs to.
///
/// Entries buy the cycle's outcome token; exits sell it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentSide {
    Entry,
    Exit,
}

impl IntentSide {
    /// Returns 1 for entry, -1 for exit (for inventory calculations).
    pub fn sign(&self) -> i8 {
        match self {
            Self::Entry => 1,
            Self::Exit => -1,
        }
    }
}

impl fmt::Display for IntentSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Entry => write!(f, "entry"),
            Self::Exit => write!(f, "exit"),
        }
    }
}

/// Client order ID for idempotency.
///
/// Submits are retried with the same id; the venue must treat a repeated id
/// as the same order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientOrderId(String);

impl ClientOrderId {
    /// Create a new unique client order ID.
    ///
    /// Format: `ud_{timestamp_ms}_{uuid_short}`
    pub fn new() -> Self {
        let ts = chrono::Utc::now().timestamp_millis();
        let uuid_short = &Uuid::new_v4().to_string()[..8];
        Self(format!("ud_{ts}_{uuid_short}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ClientOrderId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientOrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Order id assigned by the venue on acceptance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VenueOrderId(String);

impl VenueOrderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VenueOrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An order the state machine wants resting at the venue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub side: IntentSide,
    pub size: Size,
    pub limit_price: Price,
    /// When the submit was first attempted (Unix ms).
    pub submitted_at_ms: u64,
    /// Venue id once the submit has been acknowledged.
    pub external_id: Option<VenueOrderId>,
}

impl OrderIntent {
    #[must_use]
    pub fn new(side: IntentSide, size: Size, limit_price: Price, submitted_at_ms: u64) -> Self {
        Self {
            side,
            size,
            limit_price,
            submitted_at_ms,
            external_id: None,
        }
    }

    /// Notional value at the limit price.
    #[must_use]
    pub fn notional(&self) -> rust_decimal::Decimal {
        self.size.notional(self.limit_price)
    }
}

/// Wire-neutral submit request handed to the order venue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_id: ClientOrderId,
    pub token_id: TokenId,
    pub side: IntentSide,
    pub size: Size,
    pub limit_price: Price,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_intent_side_sign() {
        assert_eq!(IntentSide::Entry.sign(), 1);
        assert_eq!(IntentSide::Exit.sign(), -1);
    }

    #[test]
    fn test_client_order_id_unique() {
        let id1 = ClientOrderId::new();
        let id2 = ClientOrderId::new();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("ud_"));
    }

    #[test]
    fn test_intent_notional() {
        let intent = OrderIntent::new(
            IntentSide::Entry,
            Size::new(dec!(5)),
            Price::new(dec!(0.45)),
            0,
        );
        assert_eq!(intent.notional(), dec!(2.25));
        assert!(intent.external_id.is_none());
    }
}
