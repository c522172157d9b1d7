//! Settlement for held outcome shares.
//!
//! - `SettlementDetector`: one-shot resolution detection per condition
//! - `WalletDetector`: SAFE / CUSTOM / UNKNOWN holding wallet detection
//! - `ClaimTargets`: redeem calldata through either wallet kind
//! - `RedemptionRouter`: claim lifecycle with backend fallback and
//!   balance-delta confirmation
//! - `ChainClient`: JSON-RPC seam (`RpcChainClient`, `MockChain`)

pub mod chain;
pub mod claim;
pub mod config;
pub mod contracts;
pub mod detector;
pub mod error;
pub mod key;
pub mod router;
pub mod rpc;
pub mod wallet;

pub use chain::{
    units_to_decimal, BalanceReader, BoxFuture, ChainClient, Erc20Balance, MockChain, MockSend,
    TxReceipt, TxRequest,
};
pub use claim::ClaimTargets;
pub use config::{ChainConfig, SettlementConfig};
pub use detector::{Resolution, SettlementDetector};
pub use error::{ChainError, SettlementError, SettlementResult};
pub use key::{KeyError, KeyManager, KeySource};
pub use router::{fallback_order, ClaimRecord, RedemptionRouter, RouterConfig};
pub use rpc::{RpcChainClient, RpcSettings};
pub use wallet::WalletDetector;
