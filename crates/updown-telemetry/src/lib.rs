//! Prometheus metrics, structured logging and the engine event stream.
//!
//! - Prometheus metrics for fills, transitions, stops, claims and exposure
//! - Structured JSON logging with tracing
//! - `EventBus`: broadcast of every `EngineEvent` to interested consumers

pub mod error;
pub mod events;
pub mod logging;
pub mod metrics;

pub use error::{TelemetryError, TelemetryResult};
pub use events::EventBus;
pub use logging::init_logging;
pub use metrics::Metrics;
