//! Order execution for one market window.
//!
//! # Key Components
//!
//! - [`OrderVenue`]: Venue seam (submit, cancel, trades, reported position)
//! - [`BookFeed`]: Top-of-book seam, with [`ClobBookFeed`] over HTTP
//! - [`RegimeFilter`]: Market-condition filter for new entries
//! - [`PaperVenue`]: Simulated venue filling against the live book
//! - [`MarketCycle`]: Tick driver tying ledger, state machine and gates

pub mod book;
pub mod cycle;
pub mod error;
pub mod paper;
pub mod regime;
pub mod venue;

pub use book::{BookFeed, BookTop, ClobBookFeed, MockBookFeed};
pub use cycle::{CycleConfig, CycleDeps, CycleSummary, MarketCycle};
pub use error::{ExecutorError, ExecutorResult, VenueError};
pub use paper::PaperVenue;
pub use regime::{AlwaysPermit, PriceBandConfig, PriceBandRegime, RegimeFilter};
pub use venue::{
    BoxFuture, CancelAck, MockVenue, OrderVenue, RejectKind, SubmitAck, VenueCall,
};
