//! Executor error types.

use thiserror::Error;
use updown_core::Transient;
use updown_position::PositionError;

/// Failure talking to the order venue or book feed.
#[derive(Debug, Clone, Error)]
pub enum VenueError {
    #[error("Timed out after {0}ms")]
    Timeout(u64),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Rate limited")]
    RateLimited,

    #[error("Decode error: {0}")]
    Decode(String),
}

impl VenueError {
    /// Whether retrying the same request may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Transport(_) | Self::RateLimited => true,
            Self::Http { status, .. } => *status >= 500 || *status == 429,
            Self::Decode(_) => false,
        }
    }
}

impl Transient for VenueError {
    fn is_transient(&self) -> bool {
        VenueError::is_transient(self)
    }

    fn timed_out(after_ms: u64) -> Self {
        Self::Timeout(after_ms)
    }
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Venue error: {0}")]
    Venue(#[from] VenueError),

    #[error("Position error: {0}")]
    Position(#[from] PositionError),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type ExecutorResult<T> = Result<T, ExecutorError>;
