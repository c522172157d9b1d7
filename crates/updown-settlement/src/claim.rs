//! Claim transaction builders.
//!
//! Both backends route the same `redeemPositions` call through the holding
//! wallet, so winnings land in the wallet that held the shares:
//! - CUSTOM: `execute(ctf, 0, redeem)` on the proxy wallet.
//! - SAFE: `execTransaction(ctf, 0, redeem, CALL, 0, 0, 0, 0x0, 0x0, sig)`
//!   where `sig` is an owner signature over the EIP-712 `SafeTx` hash.

use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::signers::Signer as AlloySigner;
use alloy::sol_types::{eip712_domain, SolCall, SolStruct};

use crate::chain::TxRequest;
use crate::contracts::{self, GnosisSafe, SafeTx};
use crate::error::ChainError;

/// Safe operation code for a plain call.
const OPERATION_CALL: u8 = 0;

#[derive(Debug, Clone, Copy)]
pub struct ClaimTargets {
    pub wallet: Address,
    pub ctf: Address,
    pub collateral: Address,
    pub chain_id: u64,
    pub custom_gas_limit: u64,
    pub safe_gas_limit: u64,
}

impl ClaimTargets {
    fn redeem(&self, condition: B256) -> Bytes {
        contracts::redeem_call(self.collateral, condition)
    }

    pub fn custom_claim(&self, condition: B256) -> TxRequest {
        TxRequest {
            to: self.wallet,
            data: contracts::execute_call(self.ctf, self.redeem(condition)),
            gas_limit: self.custom_gas_limit,
        }
    }

    /// Typed Safe transaction wrapping the redeem call.
    pub fn safe_tx(&self, condition: B256, nonce: U256) -> SafeTx {
        SafeTx {
            to: self.ctf,
            value: U256::ZERO,
            data: self.redeem(condition),
            operation: OPERATION_CALL,
            safeTxGas: U256::ZERO,
            baseGas: U256::ZERO,
            gasPrice: U256::ZERO,
            gasToken: Address::ZERO,
            refundReceiver: Address::ZERO,
            nonce,
        }
    }

    /// EIP-712 hash the Safe owner signs.
    pub fn safe_tx_hash(&self, safe_tx: &SafeTx) -> B256 {
        let domain = eip712_domain! {
            chain_id: self.chain_id,
            verifying_contract: self.wallet,
        };
        safe_tx.eip712_signing_hash(&domain)
    }

    pub async fn safe_claim<S: AlloySigner + Send + Sync>(
        &self,
        condition: B256,
        nonce: U256,
        signer: &S,
    ) -> Result<TxRequest, ChainError> {
        let safe_tx = self.safe_tx(condition, nonce);
        let hash = self.safe_tx_hash(&safe_tx);
        let signature = signer
            .sign_hash(&hash)
            .await
            .map_err(|e| ChainError::Signing(e.to_string()))?;

        let data = GnosisSafe::execTransactionCall {
            to: safe_tx.to,
            value: safe_tx.value,
            data: safe_tx.data,
            operation: safe_tx.operation,
            safeTxGas: safe_tx.safeTxGas,
            baseGas: safe_tx.baseGas,
            gasPrice: safe_tx.gasPrice,
            gasToken: safe_tx.gasToken,
            refundReceiver: safe_tx.refundReceiver,
            signatures: pack_signature(signature.r(), signature.s(), signature.v()),
        }
        .abi_encode();

        Ok(TxRequest {
            to: self.wallet,
            data: data.into(),
            gas_limit: self.safe_gas_limit,
        })
    }
}

/// Safe signature bytes: r (32) ‖ s (32) ‖ v (1) with v in {27, 28}.
pub fn pack_signature(r: U256, s: U256, y_parity: bool) -> Bytes {
    let mut out = Vec::with_capacity(65);
    out.extend_from_slice(&r.to_be_bytes::<32>());
    out.extend_from_slice(&s.to_be_bytes::<32>());
    out.push(27 + u8::from(y_parity));
    out.into()
}
