//! Chain client trait.
//!
//! Abstracts the JSON-RPC node so detection and redemption can run against
//! `RpcChainClient` or `MockChain`.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::Arc;

use alloy::primitives::{Address, Bytes, B256, U256};
use parking_lot::Mutex;
use rust_decimal::Decimal;

use crate::contracts;
use crate::error::ChainError;

/// Boxed future for dyn-compatible async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// Transaction to sign and send from the configured key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRequest {
    pub to: Address,
    pub data: Bytes,
    pub gas_limit: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: B256,
    /// Receipt status; `false` means the transaction reverted.
    pub success: bool,
}

pub trait ChainClient: Send + Sync {
    /// Read-only call (`eth_call` at latest).
    fn call(&self, to: Address, data: Bytes) -> BoxFuture<'_, Result<Bytes, ChainError>>;

    /// Deployed bytecode (empty for an EOA).
    fn code_at(&self, address: Address) -> BoxFuture<'_, Result<Bytes, ChainError>>;

    /// Sign, broadcast and wait for the receipt.
    ///
    /// A broadcast transaction whose receipt does not show up in time fails
    /// with `ChainError::Unconfirmed` carrying its hash.
    fn send_transaction(&self, tx: TxRequest) -> BoxFuture<'_, Result<TxReceipt, ChainError>>;

    /// Receipt of a broadcast transaction, `None` while it is unmined.
    fn receipt(&self, tx_hash: B256) -> BoxFuture<'_, Result<Option<TxReceipt>, ChainError>>;
}

pub trait BalanceReader: Send + Sync {
    /// Collateral balance of `holder` in whole units.
    fn balance_of(&self, holder: Address) -> BoxFuture<'_, Result<Decimal, ChainError>>;
}

/// Convert raw token units to a decimal amount.
pub fn units_to_decimal(raw: U256, decimals: u32) -> Result<Decimal, ChainError> {
    let units = u128::try_from(raw)
        .ok()
        .and_then(|u| i128::try_from(u).ok())
        .ok_or_else(|| ChainError::Decode(format!("amount {raw} out of range")))?;
    Decimal::try_from_i128_with_scale(units, decimals)
        .map_err(|e| ChainError::Decode(format!("amount {raw}: {e}")))
}

/// ERC-20 balance reader over a chain client.
pub struct Erc20Balance {
    chain: Arc<dyn ChainClient>,
    token: Address,
    decimals: u32,
}

impl Erc20Balance {
    pub fn new(chain: Arc<dyn ChainClient>, token: Address, decimals: u32) -> Self {
        Self {
            chain,
            token,
            decimals,
        }
    }
}

impl BalanceReader for Erc20Balance {
    fn balance_of(&self, holder: Address) -> BoxFuture<'_, Result<Decimal, ChainError>> {
        Box::pin(async move {
            let raw = self
                .chain
                .call(self.token, contracts::balance_of_call(holder))
                .await?;
            let units = contracts::decode_uint(&raw)
                .map_err(|e| ChainError::Decode(format!("balanceOf: {e}")))?;
            units_to_decimal(units, self.decimals)
        })
    }
}

/// Scripted outcome of a `MockChain::send_transaction`.
#[derive(Debug, Clone)]
pub enum MockSend {
    /// Mined with a failed status.
    Revert,
    /// Mined successfully; credits `credit` to the transaction's target.
    Succeed { credit: Decimal },
    /// Broadcast but not mined until `MockChain::mine_pending`.
    Pending,
    Fail(ChainError),
}

/// Mock chain for testing.
///
/// Calls are scripted per target and selector; unscripted calls revert like
/// a missing function would. Unscripted sends succeed without effect. The
/// mock also serves balances so a successful claim can move them.
#[derive(Debug, Default)]
pub struct MockChain {
    calls: Mutex<HashMap<(Address, [u8; 4]), Result<Bytes, ChainError>>>,
    call_log: Mutex<Vec<(Address, Bytes)>>,
    code: Mutex<HashMap<Address, Bytes>>,
    sends: Mutex<VecDeque<MockSend>>,
    sent: Mutex<Vec<TxRequest>>,
    pending: Mutex<VecDeque<(B256, Address)>>,
    receipts: Mutex<HashMap<B256, TxReceipt>>,
    balances: Mutex<HashMap<Address, Decimal>>,
}

impl MockChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_call(&self, to: Address, selector: [u8; 4], result: Result<Bytes, ChainError>) {
        self.calls.lock().insert((to, selector), result);
    }

    pub fn set_code(&self, address: Address, code: Bytes) {
        self.code.lock().insert(address, code);
    }

    pub fn push_send(&self, outcome: MockSend) {
        self.sends.lock().push_back(outcome);
    }

    pub fn set_balance(&self, holder: Address, amount: Decimal) {
        self.balances.lock().insert(holder, amount);
    }

    pub fn balance(&self, holder: Address) -> Decimal {
        self.balances
            .lock()
            .get(&holder)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    pub fn sent(&self) -> Vec<TxRequest> {
        self.sent.lock().clone()
    }

    /// Mine the oldest pending transaction, crediting `credit` to its target
    /// (or reverting it when `credit` is `None`).
    pub fn mine_pending(&self, credit: Option<Decimal>) -> Option<B256> {
        let (tx_hash, to) = self.pending.lock().pop_front()?;
        if let Some(credit) = credit {
            *self.balances.lock().entry(to).or_default() += credit;
        }
        self.receipts.lock().insert(
            tx_hash,
            TxReceipt {
                tx_hash,
                success: credit.is_some(),
            },
        );
        Some(tx_hash)
    }

    /// Number of calls made with `selector`.
    pub fn call_count(&self, selector: [u8; 4]) -> usize {
        self.call_log
            .lock()
            .iter()
            .filter(|(_, data)| data.len() >= 4 && data[..4] == selector)
            .count()
    }
}

fn tx_hash(n: usize) -> B256 {
    B256::from(U256::from(n as u64 + 1))
}

impl ChainClient for MockChain {
    fn call(&self, to: Address, data: Bytes) -> BoxFuture<'_, Result<Bytes, ChainError>> {
        Box::pin(async move {
            self.call_log.lock().push((to, data.clone()));
            let mut selector = [0u8; 4];
            if data.len() >= 4 {
                selector.copy_from_slice(&data[..4]);
            }
            self.calls
                .lock()
                .get(&(to, selector))
                .cloned()
                .unwrap_or_else(|| {
                    Err(ChainError::Rpc {
                        code: 3,
                        message: "execution reverted".to_string(),
                    })
                })
        })
    }

    fn code_at(&self, address: Address) -> BoxFuture<'_, Result<Bytes, ChainError>> {
        Box::pin(async move { Ok(self.code.lock().get(&address).cloned().unwrap_or_default()) })
    }

    fn send_transaction(&self, tx: TxRequest) -> BoxFuture<'_, Result<TxReceipt, ChainError>> {
        Box::pin(async move {
            let n = {
                let mut sent = self.sent.lock();
                sent.push(tx.clone());
                sent.len()
            };
            let outcome = self
                .sends
                .lock()
                .pop_front()
                .unwrap_or(MockSend::Succeed {
                    credit: Decimal::ZERO,
                });
            let hash = tx_hash(n);
            let receipt = match outcome {
                MockSend::Revert => TxReceipt {
                    tx_hash: hash,
                    success: false,
                },
                MockSend::Succeed { credit } => {
                    *self.balances.lock().entry(tx.to).or_default() += credit;
                    TxReceipt {
                        tx_hash: hash,
                        success: true,
                    }
                }
                MockSend::Pending => {
                    self.pending.lock().push_back((hash, tx.to));
                    return Err(ChainError::Unconfirmed { tx_hash: hash });
                }
                MockSend::Fail(e) => return Err(e),
            };
            self.receipts.lock().insert(hash, receipt.clone());
            Ok(receipt)
        })
    }

    fn receipt(&self, tx_hash: B256) -> BoxFuture<'_, Result<Option<TxReceipt>, ChainError>> {
        Box::pin(async move { Ok(self.receipts.lock().get(&tx_hash).cloned()) })
    }
}

impl BalanceReader for MockChain {
    fn balance_of(&self, holder: Address) -> BoxFuture<'_, Result<Decimal, ChainError>> {
        Box::pin(async move { Ok(self.balance(holder)) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::sol_types::{SolCall, SolValue};
    use rust_decimal_macros::dec;

    #[test]
    fn test_units_to_decimal() {
        assert_eq!(
            units_to_decimal(U256::from(2_500_000u64), 6).unwrap(),
            dec!(2.5)
        );
        assert_eq!(units_to_decimal(U256::ZERO, 6).unwrap(), Decimal::ZERO);
        assert!(units_to_decimal(U256::MAX, 6).is_err());
    }

    #[tokio::test]
    async fn test_erc20_balance_through_chain() {
        let chain = Arc::new(MockChain::new());
        let holder = Address::repeat_byte(0x42);
        chain.set_call(
            contracts::POLYGON_USDC,
            contracts::IERC20::balanceOfCall::SELECTOR,
            Ok(U256::from(12_340_000u64).abi_encode().into()),
        );
        let reader = Erc20Balance::new(chain.clone(), contracts::POLYGON_USDC, 6);
        assert_eq!(reader.balance_of(holder).await.unwrap(), dec!(12.34));
    }

    #[tokio::test]
    async fn test_mock_send_credits_target() {
        let chain = MockChain::new();
        let wallet = Address::repeat_byte(0x07);
        chain.push_send(MockSend::Revert);
        chain.push_send(MockSend::Succeed { credit: dec!(5) });
        let tx = TxRequest {
            to: wallet,
            data: Bytes::new(),
            gas_limit: 21_000,
        };

        assert!(!chain.send_transaction(tx.clone()).await.unwrap().success);
        assert_eq!(chain.balance(wallet), Decimal::ZERO);
        assert!(chain.send_transaction(tx).await.unwrap().success);
        assert_eq!(chain.balance(wallet), dec!(5));
        assert_eq!(chain.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_pending_send_mines_later() {
        let chain = MockChain::new();
        let wallet = Address::repeat_byte(0x07);
        chain.push_send(MockSend::Pending);
        let tx = TxRequest {
            to: wallet,
            data: Bytes::new(),
            gas_limit: 21_000,
        };

        let err = chain.send_transaction(tx).await.unwrap_err();
        let hash = err.pending_tx().unwrap();
        assert_eq!(chain.receipt(hash).await.unwrap(), None);

        assert_eq!(chain.mine_pending(Some(dec!(3))), Some(hash));
        assert!(chain.receipt(hash).await.unwrap().unwrap().success);
        assert_eq!(chain.balance(wallet), dec!(3));
        assert_eq!(chain.mine_pending(None), None);
    }

    #[tokio::test]
    async fn test_unscripted_call_reverts() {
        let chain = MockChain::new();
        let err = chain
            .call(Address::ZERO, contracts::GnosisSafe::getOwnersCall {}.abi_encode().into())
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(chain.call_count(contracts::GnosisSafe::getOwnersCall::SELECTOR), 1);
    }
}
