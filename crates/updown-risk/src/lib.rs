//! Risk controls for the up/down trader.
//!
//! - ExposureGate: per-cycle entry permission and ceiling breach detection
//! - AccountExposure: account-level ceiling shared by concurrent cycles
//! - StopLatch: data-integrity emergency stop, manual reset only
//! - SanityMonitor: venue-reported position vs ledger reconciliation

pub mod error;
pub mod exposure;
pub mod sanity;
pub mod stop;

pub use error::{RiskError, RiskResult};
pub use exposure::{AccountExposure, EntryBlock, ExposureGate, ExposureInputs};
pub use sanity::{SanityConfig, SanityMonitor, SanityVerdict};
pub use stop::{StopLatch, StopReason};
