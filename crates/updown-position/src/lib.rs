//! Position management for one market window.
//!
//! # Key Components
//!
//! - [`FillLedger`]: Deduplicating fill store, source of truth for inventory
//! - [`PositionMachine`]: IDLE / ENTRY_PENDING / POSITION_OPEN / EXIT_PENDING
//!   lifecycle with single-order-per-side discipline
//! - [`ExitLadder`]: Exit price schedule bounded by a flatten deadline

pub mod error;
pub mod exit_ladder;
pub mod ledger;
pub mod machine;

pub use error::{PositionError, PositionResult};
pub use exit_ladder::{ExitLadder, ExitLadderConfig, Rung};
pub use ledger::{
    FillLedger, IgnoreReason, IngestOutcome, InventorySnapshot, RejectReason,
    DEFAULT_BOUNDARY_SKEW_MS,
};
pub use machine::{
    ActionContext, MachineConfig, OrderAction, OrderSlot, PositionMachine, PositionRecord,
    SlotPhase, TradingMode, Transition, TransitionTrigger,
};
