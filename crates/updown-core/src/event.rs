//! Structured engine event stream.
//!
//! Every transition, fill outcome, order action, stop and claim step is
//! published as an `EngineEvent`. Rejected, duplicate and failed paths all
//! have a variant so nothing is only visible in a log line.

use crate::decimal::{Price, Size};
use crate::fill::TxId;
use crate::lifecycle::{ErrorClass, PositionState};
use crate::market::{ConditionId, CycleId};
use crate::order::{ClientOrderId, IntentSide, VenueOrderId};
use crate::settlement::WalletKind;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Log level an event should be reported at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventSeverity {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    Transition {
        cycle: CycleId,
        from: PositionState,
        to: PositionState,
        trigger: String,
        at_ms: u64,
    },
    FillApplied {
        cycle: CycleId,
        tx_id: TxId,
        side: IntentSide,
        size: Size,
        price: Price,
        inventory: Decimal,
    },
    FillDuplicate {
        cycle: CycleId,
        tx_id: TxId,
    },
    FillRejected {
        cycle: CycleId,
        reason: String,
    },
    FillIgnored {
        cycle: CycleId,
        reason: String,
    },
    OrderSubmitted {
        cycle: CycleId,
        client_id: ClientOrderId,
        side: IntentSide,
        size: Size,
        limit_price: Price,
    },
    OrderAccepted {
        cycle: CycleId,
        client_id: ClientOrderId,
        venue_id: VenueOrderId,
        side: IntentSide,
    },
    OrderRejected {
        cycle: CycleId,
        client_id: ClientOrderId,
        side: IntentSide,
        reason: String,
    },
    OrderCancelled {
        cycle: CycleId,
        client_id: ClientOrderId,
        side: IntentSide,
    },
    StopTriggered {
        cycle: CycleId,
        class: ErrorClass,
        reason: String,
    },
    /// Orders whose cancel was never confirmed; they may still rest.
    CancelUnconfirmed {
        cycle: CycleId,
        client_ids: Vec<ClientOrderId>,
    },
    ExitOnly {
        cycle: CycleId,
        reason: String,
    },
    SanityAlert {
        cycle: CycleId,
        reported: Option<Size>,
        ledger: Decimal,
        consecutive: u32,
    },
    ClaimRegistered {
        condition_id: ConditionId,
        size: Size,
    },
    ClaimSubmitted {
        condition_id: ConditionId,
        backend: WalletKind,
        tx_hash: String,
    },
    ClaimAttemptFailed {
        condition_id: ConditionId,
        backend: WalletKind,
        error: String,
    },
    ClaimConfirmed {
        condition_id: ConditionId,
        backend: WalletKind,
        delta: Decimal,
    },
    ClaimDiscrepancy {
        condition_id: ConditionId,
        expected: Decimal,
        observed: Decimal,
    },
    ClaimEscalated {
        condition_id: ConditionId,
        attempts: u32,
        last_error: Option<String>,
    },
    ClaimWorthless {
        condition_id: ConditionId,
    },
    CycleClosed {
        cycle: CycleId,
        fills: usize,
        realized_pnl: Decimal,
        final_state: PositionState,
        stop_reason: Option<String>,
    },
}

impl EngineEvent {
    /// Short label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transition { .. } => "transition",
            Self::FillApplied { .. } => "fill_applied",
            Self::FillDuplicate { .. } => "fill_duplicate",
            Self::FillRejected { .. } => "fill_rejected",
            Self::FillIgnored { .. } => "fill_ignored",
            Self::OrderSubmitted { .. } => "order_submitted",
            Self::OrderAccepted { .. } => "order_accepted",
            Self::OrderRejected { .. } => "order_rejected",
            Self::OrderCancelled { .. } => "order_cancelled",
            Self::StopTriggered { .. } => "stop_triggered",
            Self::CancelUnconfirmed { .. } => "cancel_unconfirmed",
            Self::ExitOnly { .. } => "exit_only",
            Self::SanityAlert { .. } => "sanity_alert",
            Self::ClaimRegistered { .. } => "claim_registered",
            Self::ClaimSubmitted { .. } => "claim_submitted",
            Self::ClaimAttemptFailed { .. } => "claim_attempt_failed",
            Self::ClaimConfirmed { .. } => "claim_confirmed",
            Self::ClaimDiscrepancy { .. } => "claim_discrepancy",
            Self::ClaimEscalated { .. } => "claim_escalated",
            Self::ClaimWorthless { .. } => "claim_worthless",
            Self::CycleClosed { .. } => "cycle_closed",
        }
    }

    pub fn severity(&self) -> EventSeverity {
        match self {
            Self::StopTriggered { .. }
            | Self::CancelUnconfirmed { .. }
            | Self::ClaimEscalated { .. } => EventSeverity::Error,
            Self::FillRejected { .. }
            | Self::OrderRejected { .. }
            | Self::ExitOnly { .. }
            | Self::SanityAlert { .. }
            | Self::ClaimAttemptFailed { .. }
            | Self::ClaimDiscrepancy { .. } => EventSeverity::Warn,
            _ => EventSeverity::Info,
        }
    }

    /// Cycle the event belongs to; `None` for settlement events, which
    /// outlive their cycle.
    pub fn cycle(&self) -> Option<CycleId> {
        match self {
            Self::Transition { cycle, .. }
            | Self::FillApplied { cycle, .. }
            | Self::FillDuplicate { cycle, .. }
            | Self::FillRejected { cycle, .. }
            | Self::FillIgnored { cycle, .. }
            | Self::OrderSubmitted { cycle, .. }
            | Self::OrderAccepted { cycle, .. }
            | Self::OrderRejected { cycle, .. }
            | Self::OrderCancelled { cycle, .. }
            | Self::StopTriggered { cycle, .. }
            | Self::CancelUnconfirmed { cycle, .. }
            | Self::ExitOnly { cycle, .. }
            | Self::SanityAlert { cycle, .. }
            | Self::CycleClosed { cycle, .. } => Some(*cycle),
            _ => None,
        }
    }
}
