//! Holding wallet detection.
//!
//! Safe first: a wallet answering `getOwners()` with at least one owner and
//! `getThreshold()` with a non-zero threshold is a Safe. Otherwise a wallet
//! whose bytecode carries the `execute(address,uint256,bytes)` selector is a
//! custom proxy. Anything else is unknown. Results are cached per address;
//! transient read failures are not cached.

use std::sync::Arc;

use alloy::primitives::{Address, U256};
use alloy::sol_types::{SolCall, SolValue};
use dashmap::DashMap;
use tracing::{debug, info};

use updown_core::WalletKind;

use crate::chain::ChainClient;
use crate::contracts::{self, GnosisSafe};
use crate::error::ChainError;

pub struct WalletDetector {
    chain: Arc<dyn ChainClient>,
    cache: DashMap<Address, WalletKind>,
}

impl WalletDetector {
    pub fn new(chain: Arc<dyn ChainClient>) -> Self {
        Self {
            chain,
            cache: DashMap::new(),
        }
    }

    pub fn cached(&self, wallet: &Address) -> Option<WalletKind> {
        self.cache.get(wallet).map(|k| *k)
    }

    pub async fn detect(&self, wallet: Address) -> Result<WalletKind, ChainError> {
        if let Some(kind) = self.cached(&wallet) {
            return Ok(kind);
        }

        let kind = if self.is_safe(wallet).await? {
            WalletKind::Safe
        } else if contracts::has_execute_selector(&self.chain.code_at(wallet).await?) {
            WalletKind::Custom
        } else {
            WalletKind::Unknown
        };

        info!(%wallet, %kind, "Wallet kind detected");
        self.cache.insert(wallet, kind);
        Ok(kind)
    }

    /// `Ok(false)` when the Safe interface is absent; `Err` only when the
    /// answer is unknown because of a transient failure.
    async fn is_safe(&self, wallet: Address) -> Result<bool, ChainError> {
        let owners = match self
            .chain
            .call(wallet, GnosisSafe::getOwnersCall {}.abi_encode().into())
            .await
        {
            Ok(raw) => match GnosisSafe::getOwnersCall::abi_decode_returns(&raw, true) {
                Ok(ret) => ret._0,
                Err(e) => {
                    debug!(%wallet, error = %e, "getOwners returned garbage");
                    return Ok(false);
                }
            },
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => {
                debug!(%wallet, error = %e, "getOwners unavailable");
                return Ok(false);
            }
        };
        if owners.is_empty() {
            return Ok(false);
        }

        match self
            .chain
            .call(wallet, GnosisSafe::getThresholdCall {}.abi_encode().into())
            .await
        {
            Ok(raw) => Ok(U256::abi_decode(&raw, true).is_ok_and(|t| !t.is_zero())),
            Err(e) if e.is_transient() => Err(e),
            Err(_) => Ok(false),
        }
    }
}
