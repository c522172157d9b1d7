//! Stop reasons and the emergency stop latch.
//!
//! Policy reasons put a single cycle into exit-only mode. Data-integrity
//! reasons trip the shared `StopLatch`, which halts trading in every cycle
//! until an operator resets it. Neither ever touches a pending redemption.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;
use rust_decimal::Decimal;
use tracing::{error, info, warn};

use updown_core::ErrorClass;

/// Why trading was stopped or restricted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Fill with a missing or malformed transaction id.
    UntrustedFill { detail: String },
    /// Fill with a non-positive size or price.
    MalformedFill { detail: String },
    /// Venue-reported position changing without ledger fills.
    SanityFlapping { changes: usize },
    /// Exits exceeded entries.
    NegativeInventory { inventory: Decimal },
    /// Venue refused an exit for balance or allowance.
    ExitBalanceError { detail: String },
    /// Orders still unconfirmed after every cancel attempt at close.
    CancelUnconfirmed { count: usize },
    ExposureBreach { exposure: Decimal, ceiling: Decimal },
    OrderCountExceeded { count: usize, max: usize },
    Manual { message: String },
}

impl StopReason {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::ExposureBreach { .. } | Self::OrderCountExceeded { .. } => ErrorClass::Policy,
            _ => ErrorClass::DataIntegrity,
        }
    }

    /// Whether this reason halts all trading (as opposed to exit-only).
    pub fn halts(&self) -> bool {
        self.class() == ErrorClass::DataIntegrity
    }

    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::UntrustedFill { .. } => "untrusted_fill",
            Self::MalformedFill { .. } => "malformed_fill",
            Self::SanityFlapping { .. } => "sanity_flapping",
            Self::NegativeInventory { .. } => "negative_inventory",
            Self::ExitBalanceError { .. } => "exit_balance_error",
            Self::CancelUnconfirmed { .. } => "cancel_unconfirmed",
            Self::ExposureBreach { .. } => "exposure_breach",
            Self::OrderCountExceeded { .. } => "order_count_exceeded",
            Self::Manual { .. } => "manual",
        }
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UntrustedFill { detail } => write!(f, "Untrusted fill: {detail}"),
            Self::MalformedFill { detail } => write!(f, "Malformed fill: {detail}"),
            Self::SanityFlapping { changes } => {
                write!(f, "Reported position flapping: {changes} changes")
            }
            Self::NegativeInventory { inventory } => {
                write!(f, "Negative inventory: {inventory}")
            }
            Self::ExitBalanceError { detail } => write!(f, "Exit balance error: {detail}"),
            Self::CancelUnconfirmed { count } => {
                write!(f, "{count} order(s) left without a confirmed cancel")
            }
            Self::ExposureBreach { exposure, ceiling } => {
                write!(f, "Exposure {exposure} above ceiling {ceiling}")
            }
            Self::OrderCountExceeded { count, max } => {
                write!(f, "Outstanding orders {count} above max {max}")
            }
            Self::Manual { message } => write!(f, "Manual: {message}"),
        }
    }
}

/// Emergency stop latch.
///
/// Once triggered, remains triggered until manually reset. Shared across
/// cycles via `Arc<StopLatch>`.
pub struct StopLatch {
    triggered: AtomicBool,
    /// Unix ms, 0 if not triggered.
    triggered_at: AtomicU64,
    reason: RwLock<Option<StopReason>>,
}

impl Default for StopLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl StopLatch {
    #[must_use]
    pub fn new() -> Self {
        Self {
            triggered: AtomicBool::new(false),
            triggered_at: AtomicU64::new(0),
            reason: RwLock::new(None),
        }
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Trigger the latch. Returns `true` if this call tripped it; a second
    /// trigger keeps the original reason.
    pub fn trigger(&self, reason: StopReason) -> bool {
        if self
            .triggered
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
            self.triggered_at.store(now, Ordering::SeqCst);
            *self.reason.write() = Some(reason.clone());

            error!(reason = %reason, "STOP TRIGGERED");
            true
        } else {
            warn!(new_reason = %reason, "Stop already triggered, ignoring new trigger");
            false
        }
    }

    #[must_use]
    pub fn triggered_at(&self) -> Option<u64> {
        if self.is_triggered() {
            let ts = self.triggered_at.load(Ordering::SeqCst);
            if ts > 0 {
                return Some(ts);
            }
        }
        None
    }

    #[must_use]
    pub fn reason(&self) -> Option<StopReason> {
        if self.is_triggered() {
            self.reason.read().clone()
        } else {
            None
        }
    }

    /// Manual reset after an operator has investigated.
    pub fn reset(&self) {
        if self.is_triggered() {
            let reason = self.reason.read().clone();
            info!(previous_reason = ?reason, "Stop manually reset");

            self.triggered.store(false, Ordering::SeqCst);
            self.triggered_at.store(0, Ordering::SeqCst);
            *self.reason.write() = None;
        }
    }
}
