//! Entry regime filter.
//!
//! Decides whether market conditions allow a new entry at all. Exits are
//! never filtered.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::book::BookTop;

pub trait RegimeFilter: Send + Sync {
    /// `Err` carries the reason the entry is refused.
    fn permits(&self, top: &BookTop, volatility: Option<Decimal>) -> Result<(), String>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceBandConfig {
    /// Lowest ask an entry may be placed at.
    #[serde(default = "default_min_entry_price")]
    pub min_entry_price: Decimal,
    #[serde(default = "default_max_entry_price")]
    pub max_entry_price: Decimal,
    #[serde(default = "default_max_spread")]
    pub max_spread: Decimal,
    /// Range of recent mids above which entries pause. `None` disables.
    #[serde(default)]
    pub max_volatility: Option<Decimal>,
}

fn default_min_entry_price() -> Decimal {
    dec!(0.30)
}

fn default_max_entry_price() -> Decimal {
    dec!(0.70)
}

fn default_max_spread() -> Decimal {
    dec!(0.05)
}

impl Default for PriceBandConfig {
    fn default() -> Self {
        Self {
            min_entry_price: default_min_entry_price(),
            max_entry_price: default_max_entry_price(),
            max_spread: default_max_spread(),
            max_volatility: None,
        }
    }
}

/// Permits entries only in a balanced, liquid, calm book.
#[derive(Debug, Clone, Default)]
pub struct PriceBandRegime {
    config: PriceBandConfig,
}

impl PriceBandRegime {
    pub fn new(config: PriceBandConfig) -> Self {
        Self { config }
    }
}

impl RegimeFilter for PriceBandRegime {
    fn permits(&self, top: &BookTop, volatility: Option<Decimal>) -> Result<(), String> {
        let (Some(_), Some(ask)) = (top.best_bid, top.best_ask) else {
            return Err("one-sided book".to_string());
        };
        let ask = ask.inner();
        if ask < self.config.min_entry_price || ask > self.config.max_entry_price {
            return Err(format!(
                "ask {ask} outside [{}, {}]",
                self.config.min_entry_price, self.config.max_entry_price
            ));
        }
        if let Some(spread) = top.spread() {
            if spread > self.config.max_spread {
                return Err(format!("spread {spread} above {}", self.config.max_spread));
            }
        }
        if let (Some(max), Some(vol)) = (self.config.max_volatility, volatility) {
            if vol > max {
                return Err(format!("volatility {vol} above {max}"));
            }
        }
        Ok(())
    }
}

/// Filter that permits every entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysPermit;

impl RegimeFilter for AlwaysPermit {
    fn permits(&self, _top: &BookTop, _volatility: Option<Decimal>) -> Result<(), String> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use updown_core::Price;

    fn top(bid: Decimal, ask: Decimal) -> BookTop {
        BookTop {
            best_bid: Some(Price::new(bid)),
            best_ask: Some(Price::new(ask)),
        }
    }

    #[test]
    fn test_price_band() {
        let regime = PriceBandRegime::default();
        assert!(regime.permits(&top(dec!(0.44), dec!(0.46)), None).is_ok());
        assert!(regime.permits(&top(dec!(0.84), dec!(0.86)), None).is_err());
        assert!(regime.permits(&top(dec!(0.10), dec!(0.12)), None).is_err());
    }

    #[test]
    fn test_wide_spread_and_one_sided() {
        let regime = PriceBandRegime::default();
        assert!(regime.permits(&top(dec!(0.35), dec!(0.55)), None).is_err());
        assert!(regime.permits(&BookTop::default(), None).is_err());
    }

    #[test]
    fn test_volatility_pause() {
        let regime = PriceBandRegime::new(PriceBandConfig {
            max_volatility: Some(dec!(0.10)),
            ..PriceBandConfig::default()
        });
        let book = top(dec!(0.44), dec!(0.46));
        assert!(regime.permits(&book, Some(dec!(0.05))).is_ok());
        assert!(regime.permits(&book, Some(dec!(0.15))).is_err());
        assert!(regime.permits(&book, None).is_ok());
    }
}
