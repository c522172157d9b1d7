//! Core domain types for the up/down window trader.
//!
//! This crate provides the vocabulary shared by every other crate:
//! - `Price`, `Size`: Precision-safe numeric types
//! - `TokenId`, `ConditionId`, `MarketWindow`: Market identity and timing
//! - `OrderIntent`, `OrderRequest`: Order-side types owned by the state machine
//! - `RawFillEvent`, `ConfirmedFill`, `TxId`: Fill ingestion types
//! - `PositionState`, `WalletKind`, `EngineEvent`: Lifecycle and event stream
//! - `RetryPolicy`, `call_with_retry`: Bounded retry for remote calls

pub mod decimal;
pub mod error;
pub mod event;
pub mod fill;
pub mod lifecycle;
pub mod market;
pub mod order;
pub mod retry;
pub mod settlement;

pub use decimal::{Price, Size};
pub use error::{CoreError, Result};
pub use event::{EngineEvent, EventSeverity};
pub use fill::{ConfirmedFill, RawFillEvent, TradeSide, TxId};
pub use lifecycle::{ErrorClass, PositionState};
pub use market::{ConditionId, CycleId, MarketWindow, TokenId};
pub use order::{ClientOrderId, IntentSide, OrderIntent, OrderRequest, VenueOrderId};
pub use retry::{call_with_retry, with_timeout, RetryPolicy, Transient};
pub use settlement::{ClaimStage, WalletKind};
