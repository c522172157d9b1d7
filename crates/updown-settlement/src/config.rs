//! Chain and settlement configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use alloy::primitives::Address;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use updown_core::RetryPolicy;

use crate::claim::ClaimTargets;
use crate::contracts;
use crate::error::{SettlementError, SettlementResult};
use crate::key::KeySource;
use crate::router::RouterConfig;
use crate::rpc::RpcSettings;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,
    #[serde(default = "default_receipt_timeout_ms")]
    pub receipt_timeout_ms: u64,
    #[serde(default = "default_receipt_poll_ms")]
    pub receipt_poll_ms: u64,
    /// Environment variable holding the hex private key.
    #[serde(default)]
    pub key_env: Option<String>,
    /// File holding the hex private key. Takes precedence over `key_env`.
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    /// Address the loaded key must derive to.
    #[serde(default)]
    pub signer_address: Option<String>,
}

fn default_rpc_url() -> String {
    "https://polygon-rpc.com".to_string()
}

fn default_chain_id() -> u64 {
    contracts::POLYGON_CHAIN_ID
}

fn default_receipt_timeout_ms() -> u64 {
    120_000
}

fn default_receipt_poll_ms() -> u64 {
    2_000
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            rpc_url: default_rpc_url(),
            chain_id: default_chain_id(),
            receipt_timeout_ms: default_receipt_timeout_ms(),
            receipt_poll_ms: default_receipt_poll_ms(),
            key_env: None,
            key_file: None,
            signer_address: None,
        }
    }
}

fn parse_address(field: &str, raw: &str) -> SettlementResult<Address> {
    Address::from_str(raw.trim())
        .map_err(|e| SettlementError::Config(format!("{field} '{raw}': {e}")))
}

impl ChainConfig {
    pub fn key_source(&self) -> Option<KeySource> {
        if let Some(path) = &self.key_file {
            return Some(KeySource::File { path: path.clone() });
        }
        self.key_env.as_ref().map(|var_name| KeySource::EnvVar {
            var_name: var_name.clone(),
        })
    }

    pub fn expected_signer(&self) -> SettlementResult<Option<Address>> {
        self.signer_address
            .as_deref()
            .map(|raw| parse_address("signer_address", raw))
            .transpose()
    }

    pub fn rpc_settings(&self) -> RpcSettings {
        RpcSettings {
            url: self.rpc_url.clone(),
            chain_id: self.chain_id,
            receipt_timeout: Duration::from_millis(self.receipt_timeout_ms),
            receipt_poll_interval: Duration::from_millis(self.receipt_poll_ms),
        }
    }

    pub fn validate(&self) -> SettlementResult<()> {
        if self.rpc_url.trim().is_empty() {
            return Err(SettlementError::Config("rpc_url is empty".to_string()));
        }
        if self.receipt_poll_ms == 0 {
            return Err(SettlementError::Config(
                "receipt_poll_ms must be positive".to_string(),
            ));
        }
        self.expected_signer().map(|_| ())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementConfig {
    /// Wallet holding the outcome shares. Redemption is off without one.
    #[serde(default)]
    pub holding_wallet: Option<String>,
    #[serde(default = "default_ctf_address")]
    pub ctf_address: String,
    #[serde(default = "default_collateral_address")]
    pub collateral_address: String,
    #[serde(default = "default_collateral_decimals")]
    pub collateral_decimals: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Balance re-reads after a mined claim before calling it a no-op.
    #[serde(default = "default_confirm_reads")]
    pub confirm_reads: u32,
    #[serde(default = "default_confirm_delay_ms")]
    pub confirm_delay_ms: u64,
    /// Polls a broadcast claim may stay unmined before it escalates.
    #[serde(default = "default_max_pending_polls")]
    pub max_pending_polls: u32,
    /// Largest |observed - expected| payout accepted without a discrepancy.
    #[serde(default = "default_discrepancy_tolerance")]
    pub discrepancy_tolerance: Decimal,
    #[serde(default = "default_custom_gas_limit")]
    pub custom_gas_limit: u64,
    #[serde(default = "default_safe_gas_limit")]
    pub safe_gas_limit: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_ctf_address() -> String {
    contracts::POLYGON_CTF.to_string()
}

fn default_collateral_address() -> String {
    contracts::POLYGON_USDC.to_string()
}

fn default_collateral_decimals() -> u32 {
    6
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_confirm_reads() -> u32 {
    3
}

fn default_confirm_delay_ms() -> u64 {
    2_000
}

fn default_max_pending_polls() -> u32 {
    60
}

fn default_discrepancy_tolerance() -> Decimal {
    dec!(0.01)
}

fn default_custom_gas_limit() -> u64 {
    contracts::CUSTOM_GAS_LIMIT
}

fn default_safe_gas_limit() -> u64 {
    contracts::SAFE_GAS_LIMIT
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            holding_wallet: None,
            ctf_address: default_ctf_address(),
            collateral_address: default_collateral_address(),
            collateral_decimals: default_collateral_decimals(),
            poll_interval_ms: default_poll_interval_ms(),
            confirm_reads: default_confirm_reads(),
            confirm_delay_ms: default_confirm_delay_ms(),
            max_pending_polls: default_max_pending_polls(),
            discrepancy_tolerance: default_discrepancy_tolerance(),
            custom_gas_limit: default_custom_gas_limit(),
            safe_gas_limit: default_safe_gas_limit(),
            retry: RetryPolicy::default(),
        }
    }
}

impl SettlementConfig {
    pub fn ctf(&self) -> SettlementResult<Address> {
        parse_address("ctf_address", &self.ctf_address)
    }

    pub fn collateral(&self) -> SettlementResult<Address> {
        parse_address("collateral_address", &self.collateral_address)
    }

    /// Router settings, or `None` when no holding wallet is configured.
    pub fn router_config(&self, chain_id: u64) -> SettlementResult<Option<RouterConfig>> {
        let Some(wallet) = self.holding_wallet.as_deref() else {
            return Ok(None);
        };
        Ok(Some(RouterConfig {
            targets: ClaimTargets {
                wallet: parse_address("holding_wallet", wallet)?,
                ctf: self.ctf()?,
                collateral: self.collateral()?,
                chain_id,
                custom_gas_limit: self.custom_gas_limit,
                safe_gas_limit: self.safe_gas_limit,
            },
            confirm_reads: self.confirm_reads,
            confirm_delay: Duration::from_millis(self.confirm_delay_ms),
            max_pending_polls: self.max_pending_polls,
            discrepancy_tolerance: self.discrepancy_tolerance,
            retry: self.retry.clone(),
        }))
    }

    pub fn validate(&self) -> SettlementResult<()> {
        self.ctf()?;
        self.collateral()?;
        if let Some(wallet) = self.holding_wallet.as_deref() {
            parse_address("holding_wallet", wallet)?;
        }
        if self.poll_interval_ms == 0 {
            return Err(SettlementError::Config(
                "poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.max_pending_polls == 0 {
            return Err(SettlementError::Config(
                "max_pending_polls must be positive".to_string(),
            ));
        }
        if self.discrepancy_tolerance < Decimal::ZERO {
            return Err(SettlementError::Config(
                "discrepancy_tolerance must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}
