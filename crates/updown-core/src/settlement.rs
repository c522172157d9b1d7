//! Settlement vocabulary: wallet kinds and claim stages.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of wallet holding the winning tokens.
///
/// Decides which claim backend is tried first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WalletKind {
    /// Proxy wallet exposing `execute(address,uint256,bytes)`.
    Custom,
    /// Multisig with owners and a threshold.
    Safe,
    /// Neither detection call matched (or the address is an EOA).
    Unknown,
}

impl WalletKind {
    /// The other backend, used as fallback.
    #[must_use]
    pub fn alternate(&self) -> Option<WalletKind> {
        match self {
            Self::Custom => Some(Self::Safe),
            Self::Safe => Some(Self::Custom),
            Self::Unknown => None,
        }
    }
}

impl fmt::Display for WalletKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Custom => "CUSTOM",
            Self::Safe => "SAFE",
            Self::Unknown => "UNKNOWN",
        };
        write!(f, "{s}")
    }
}

/// Stage of a pending redemption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClaimStage {
    /// Registered, market not yet resolved.
    AwaitingResolution,
    /// Resolved, wallet kind not yet known.
    DetectWallet,
    /// Submitting through a backend.
    ClaimAttempt,
    /// Collateral balance increase observed.
    Confirmed,
    /// Every backend failed; needs a human.
    Escalated,
    /// Resolved against us; nothing to claim.
    Worthless,
}

impl ClaimStage {
    /// Whether no further work will be done for this claim.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Escalated | Self::Worthless)
    }
}

impl fmt::Display for ClaimStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AwaitingResolution => "AWAITING_RESOLUTION",
            Self::DetectWallet => "DETECT_WALLET",
            Self::ClaimAttempt => "CLAIM_ATTEMPT",
            Self::Confirmed => "CONFIRMED",
            Self::Escalated => "ESCALATED",
            Self::Worthless => "WORTHLESS",
        };
        write!(f, "{s}")
    }
}
