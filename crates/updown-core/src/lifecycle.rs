//! Position lifecycle states and error classification.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Position lifecycle state.
///
/// Exactly one state per cycle. Transitions are driven by order acks, fill
/// observations, cancel confirmations and the stop path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionState {
    /// No inventory, no outstanding entry.
    Idle,
    /// Entry submitted (or filled before ack), waiting for the ledger.
    EntryPending,
    /// Inventory held, no exit resting.
    PositionOpen,
    /// Exit order outstanding.
    ExitPending,
}

impl PositionState {
    /// Whether a transition `self -> to` is one the machine may make.
    ///
    /// `ExitPending -> ExitPending` is the partial-fill self loop. Stop-driven
    /// returns to `Idle` are allowed from every state.
    #[must_use]
    pub fn can_transition_to(&self, to: PositionState) -> bool {
        use PositionState::*;
        matches!(
            (self, to),
            (Idle, EntryPending)
                | (Idle, PositionOpen)
                | (EntryPending, PositionOpen)
                | (EntryPending, Idle)
                | (PositionOpen, ExitPending)
                | (ExitPending, ExitPending)
                | (ExitPending, PositionOpen)
                | (ExitPending, Idle)
                | (PositionOpen, Idle)
        )
    }
}

impl fmt::Display for PositionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "IDLE",
            Self::EntryPending => "ENTRY_PENDING",
            Self::PositionOpen => "POSITION_OPEN",
            Self::ExitPending => "EXIT_PENDING",
        };
        write!(f, "{s}")
    }
}

/// How a failure is handled.
///
/// - `Transient`: retry with backoff, same idempotency key
/// - `DataIntegrity`: halt, cancel everything, page a human
/// - `Policy`: exit-only mode, no new entries
/// - `Settlement`: escalate the claim, never halts trading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transient,
    DataIntegrity,
    Policy,
    Settlement,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Transient => "transient",
            Self::DataIntegrity => "data_integrity",
            Self::Policy => "policy",
            Self::Settlement => "settlement",
        };
        write!(f, "{s}")
    }
}
