//! Signing key loading.
//!
//! The key signs both the outer transaction (as the EOA paying gas) and the
//! Safe envelope (as a Safe owner). It is read once at startup from an
//! environment variable or a file and never logged.

use std::path::PathBuf;

use alloy::primitives::Address;
use alloy::signers::local::PrivateKeySigner;
use thiserror::Error;
use zeroize::Zeroizing;

/// Where the claim-signing key is read from.
#[derive(Debug, Clone)]
pub enum KeySource {
    /// Hex key in an environment variable.
    EnvVar { var_name: String },
    /// Hex key in a file readable only by the bot.
    File { path: PathBuf },
}

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("Failed to decode hex: {0}")]
    HexDecode(#[from] hex::FromHexError),

    #[error("Invalid private key: {0}")]
    InvalidKey(String),

    #[error("Address mismatch: expected {expected}, got {actual}")]
    AddressMismatch { expected: Address, actual: Address },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Holds the claim signer, if one was configured.
///
/// Without a key the router can still detect resolution and wallet kinds,
/// but every claim attempt fails and the claim escalates.
pub struct KeyManager {
    signer: Option<PrivateKeySigner>,
}

fn parse_hex_key(hex_str: &str) -> Result<Zeroizing<Vec<u8>>, KeyError> {
    let trimmed = hex_str.trim().trim_start_matches("0x");
    Ok(Zeroizing::new(hex::decode(trimmed)?))
}

fn checked_signer(
    secret_bytes: &[u8],
    expected_address: Option<Address>,
) -> Result<PrivateKeySigner, KeyError> {
    let signer = PrivateKeySigner::from_slice(secret_bytes)
        .map_err(|e| KeyError::InvalidKey(e.to_string()))?;

    if let Some(expected) = expected_address {
        if signer.address() != expected {
            return Err(KeyError::AddressMismatch {
                expected,
                actual: signer.address(),
            });
        }
    }
    Ok(signer)
}

impl KeyManager {
    /// Load the key from `source` and verify its address when `expected`
    /// is given. `None` yields a manager without a signer.
    pub fn load(source: Option<KeySource>, expected: Option<Address>) -> Result<Self, KeyError> {
        let Some(source) = source else {
            return Ok(Self::without_key());
        };

        let secret_bytes: Zeroizing<Vec<u8>> = match source {
            KeySource::EnvVar { ref var_name } => {
                let hex = Zeroizing::new(
                    std::env::var(var_name)
                        .map_err(|_| KeyError::EnvVarNotFound(var_name.clone()))?,
                );
                parse_hex_key(&hex)?
            }
            KeySource::File { ref path } => {
                let content = Zeroizing::new(std::fs::read_to_string(path)?);
                parse_hex_key(&content)?
            }
        };

        Ok(Self {
            signer: Some(checked_signer(&secret_bytes, expected)?),
        })
    }

    /// Load from raw bytes (tests and tooling, no environment dependency).
    pub fn from_bytes(secret_bytes: &[u8], expected: Option<Address>) -> Result<Self, KeyError> {
        Ok(Self {
            signer: Some(checked_signer(secret_bytes, expected)?),
        })
    }

    pub fn without_key() -> Self {
        Self { signer: None }
    }

    pub fn signer(&self) -> Option<&PrivateKeySigner> {
        self.signer.as_ref()
    }

    pub fn address(&self) -> Option<Address> {
        self.signer.as_ref().map(|s| s.address())
    }
}

impl std::fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyManager")
            .field("address", &self.address())
            .finish()
    }
}
