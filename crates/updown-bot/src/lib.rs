//! Up/down window trader.
//!
//! Orchestrates the per-window trading cycles and the settlement loop:
//! - Configuration loading and window scheduling
//! - One cycle runner per market window, sharing account exposure and the stop latch
//! - Hand-over of held inventory to on-chain redemption

pub mod app;
pub mod claims;
pub mod config;
pub mod error;
pub mod runner;

pub use app::{Application, RunReport, Services};
pub use claims::ClaimBook;
pub use config::{AppConfig, OperatingMode};
pub use error::{AppError, AppResult};
pub use runner::CycleRunner;
