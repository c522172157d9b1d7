//! Reported-position sanity reconciliation.
//!
//! The venue's reported position is a lower-reliability signal. It never
//! drives a transition; it only raises alerts, and a stop when the reported
//! size keeps changing while the ledger does not.

use std::collections::VecDeque;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use updown_core::Size;

use crate::error::{RiskError, RiskResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SanityConfig {
    /// Consecutive mismatches before an alert.
    #[serde(default = "default_mismatch_threshold")]
    pub mismatch_threshold: u32,
    /// Reported-size changes without ledger fills that count as flapping.
    #[serde(default = "default_flap_threshold")]
    pub flap_threshold: usize,
    #[serde(default = "default_flap_window_ms")]
    pub flap_window_ms: u64,
}

fn default_mismatch_threshold() -> u32 {
    2
}

fn default_flap_threshold() -> usize {
    3
}

fn default_flap_window_ms() -> u64 {
    60_000
}

impl Default for SanityConfig {
    fn default() -> Self {
        Self {
            mismatch_threshold: default_mismatch_threshold(),
            flap_threshold: default_flap_threshold(),
            flap_window_ms: default_flap_window_ms(),
        }
    }
}

impl SanityConfig {
    pub fn validate(&self) -> RiskResult<()> {
        if self.mismatch_threshold == 0 || self.flap_threshold == 0 {
            return Err(RiskError::ConfigError(
                "sanity thresholds must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SanityVerdict {
    Consistent,
    /// Mismatch seen, below the alert threshold.
    Mismatch { consecutive: u32 },
    Alert { consecutive: u32 },
    Flapping { changes: usize },
}

#[derive(Debug)]
pub struct SanityMonitor {
    config: SanityConfig,
    consecutive_mismatches: u32,
    last_reported: Option<Decimal>,
    last_ledger_version: u64,
    changes: VecDeque<u64>,
}

impl SanityMonitor {
    pub fn new(config: SanityConfig) -> Self {
        Self {
            config,
            consecutive_mismatches: 0,
            last_reported: None,
            last_ledger_version: 0,
            changes: VecDeque::new(),
        }
    }

    /// Compare the venue's reported size against the ledger.
    ///
    /// `reported = None` means the venue gave no reading; that is neither a
    /// mismatch nor a change.
    pub fn observe(
        &mut self,
        reported: Option<Size>,
        ledger_inventory: Decimal,
        ledger_version: u64,
        now_ms: u64,
    ) -> SanityVerdict {
        let Some(reported) = reported.map(|s| s.inner()) else {
            return SanityVerdict::Consistent;
        };

        let ledger_moved = ledger_version != self.last_ledger_version;
        self.last_ledger_version = ledger_version;

        if ledger_moved {
            self.changes.clear();
        } else if self.last_reported.is_some_and(|prev| prev != reported) {
            self.changes.push_back(now_ms);
        }
        self.last_reported = Some(reported);

        let window_start = now_ms.saturating_sub(self.config.flap_window_ms);
        while self.changes.front().is_some_and(|t| *t < window_start) {
            self.changes.pop_front();
        }
        if self.changes.len() >= self.config.flap_threshold {
            warn!(
                changes = self.changes.len(),
                window_ms = self.config.flap_window_ms,
                "Reported position flapping without ledger fills"
            );
            return SanityVerdict::Flapping {
                changes: self.changes.len(),
            };
        }

        if reported == ledger_inventory {
            self.consecutive_mismatches = 0;
            return SanityVerdict::Consistent;
        }

        self.consecutive_mismatches += 1;
        debug!(
            %reported,
            ledger = %ledger_inventory,
            consecutive = self.consecutive_mismatches,
            "Reported position differs from ledger"
        );
        if self.consecutive_mismatches == self.config.mismatch_threshold {
            SanityVerdict::Alert {
                consecutive: self.consecutive_mismatches,
            }
        } else {
            SanityVerdict::Mismatch {
                consecutive: self.consecutive_mismatches,
            }
        }
    }
}
