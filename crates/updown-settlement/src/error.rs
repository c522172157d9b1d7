//! Settlement error types.

use alloy::primitives::B256;
use thiserror::Error;
use updown_core::Transient;

use crate::key::KeyError;

/// Failure talking to the chain.
#[derive(Debug, Clone, Error)]
pub enum ChainError {
    #[error("Timed out after {0}ms")]
    Timeout(u64),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// JSON-RPC error object. Reverted `eth_call`s land here.
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Transaction {tx_hash} reverted")]
    Reverted { tx_hash: String },

    /// Broadcast, but no receipt was seen before giving up on waiting.
    #[error("Transaction {tx_hash} sent, no receipt yet")]
    Unconfirmed { tx_hash: B256 },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("No signing key loaded")]
    NoSigner,
}

/// JSON-RPC codes nodes use for overload and rate limiting.
const TRANSIENT_RPC_CODES: [i64; 3] = [-32005, -32603, 429];

impl ChainError {
    /// Whether retrying the same request may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Transport(_) | Self::Unconfirmed { .. } => true,
            Self::Http { status, .. } => *status >= 500 || *status == 429,
            Self::Rpc { code, .. } => TRANSIENT_RPC_CODES.contains(code),
            Self::Reverted { .. } | Self::Decode(_) | Self::Signing(_) | Self::NoSigner => false,
        }
    }

    /// Hash of a transaction that may still be mined.
    pub fn pending_tx(&self) -> Option<B256> {
        match self {
            Self::Unconfirmed { tx_hash } => Some(*tx_hash),
            _ => None,
        }
    }
}

impl Transient for ChainError {
    fn is_transient(&self) -> bool {
        ChainError::is_transient(self)
    }

    fn timed_out(after_ms: u64) -> Self {
        Self::Timeout(after_ms)
    }
}

#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type SettlementResult<T> = Result<T, SettlementError>;
