//! Exit price ladder.
//!
//! An open position is offered at entry+Δ first, then at entry, then at
//! entry−Δ, stepping down every `step_ms`. Crossing the spread (selling into
//! the best bid) is only permitted once the flatten deadline before market
//! close has been reached.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use updown_core::Price;

/// One step of the exit ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rung {
    AboveEntry,
    AtEntry,
    BelowEntry,
    CrossSpread,
}

impl std::fmt::Display for Rung {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AboveEntry => write!(f, "entry+delta"),
            Self::AtEntry => write!(f, "entry"),
            Self::BelowEntry => write!(f, "entry-delta"),
            Self::CrossSpread => write!(f, "cross"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitLadderConfig {
    /// Price offset Δ from the entry price.
    #[serde(default = "default_delta")]
    pub delta: Decimal,
    /// Time spent on each passive rung.
    #[serde(default = "default_step_ms")]
    pub step_ms: u64,
    /// Crossing the spread is allowed this long before market close.
    #[serde(default = "default_flatten_deadline_ms")]
    pub flatten_deadline_ms: u64,
    #[serde(default = "default_tick_size")]
    pub tick_size: Decimal,
}

fn default_delta() -> Decimal {
    dec!(0.02)
}

fn default_step_ms() -> u64 {
    60_000
}

fn default_flatten_deadline_ms() -> u64 {
    120_000
}

fn default_tick_size() -> Decimal {
    dec!(0.01)
}

impl Default for ExitLadderConfig {
    fn default() -> Self {
        Self {
            delta: default_delta(),
            step_ms: default_step_ms(),
            flatten_deadline_ms: default_flatten_deadline_ms(),
            tick_size: default_tick_size(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExitLadder {
    config: ExitLadderConfig,
}

impl ExitLadder {
    pub fn new(config: ExitLadderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExitLadderConfig {
        &self.config
    }

    /// Rung for a position opened at `opened_at_ms`, in a window closing at
    /// `closes_at_ms`.
    pub fn rung_at(&self, opened_at_ms: u64, now_ms: u64, closes_at_ms: u64) -> Rung {
        let deadline = closes_at_ms.saturating_sub(self.config.flatten_deadline_ms);
        if now_ms >= deadline {
            return Rung::CrossSpread;
        }

        let step = self.config.step_ms.max(1);
        match now_ms.saturating_sub(opened_at_ms) / step {
            0 => Rung::AboveEntry,
            1 => Rung::AtEntry,
            _ => Rung::BelowEntry,
        }
    }

    /// Limit price for a rung.
    ///
    /// Passive rungs are rounded to the tick and kept inside the tradeable
    /// range. `CrossSpread` sells into the best bid; without a bid it falls
    /// back to the lowest passive rung.
    pub fn price(&self, rung: Rung, entry: Price, best_bid: Option<Price>) -> Price {
        let tick = Price::new(self.config.tick_size);
        let delta = self.config.delta;

        let raw = match rung {
            Rung::AboveEntry => Price::new(entry.inner() + delta).ceil_to_tick(tick),
            Rung::AtEntry => entry.ceil_to_tick(tick),
            Rung::BelowEntry => Price::new(entry.inner() - delta).floor_to_tick(tick),
            Rung::CrossSpread => match best_bid {
                Some(bid) if bid.is_positive() => bid,
                _ => Price::new(entry.inner() - delta).floor_to_tick(tick),
            },
        };

        raw.clamp_outcome()
    }
}

impl Default for ExitLadder {
    fn default() -> Self {
        Self::new(ExitLadderConfig::default())
    }
}
