//! Contract bindings and calldata builders.
//!
//! Only the functions the router touches are declared. Addresses default to
//! the Polygon deployments.

use alloy::primitives::{address, Address, Bytes, B256, U256};
use alloy::sol;
use alloy::sol_types::{SolCall, SolValue};

/// Conditional tokens framework on Polygon.
pub const POLYGON_CTF: Address = address!("4D97DCd97eC945f40cF65F87097ACe5EA0476045");

/// Bridged USDC on Polygon (6 decimals).
pub const POLYGON_USDC: Address = address!("2791Bca1f2de4661ED88A30C99A7a9449Aa84174");

pub const POLYGON_CHAIN_ID: u64 = 137;

/// Gas limit for a claim through the proxy wallet.
pub const CUSTOM_GAS_LIMIT: u64 = 400_000;

/// Gas limit for a claim through the Safe.
pub const SAFE_GAS_LIMIT: u64 = 500_000;

/// Index sets covering both outcomes of a binary condition.
const BINARY_INDEX_SETS: [u64; 2] = [1, 2];

sol! {
    interface ConditionalTokens {
        function payoutDenominator(bytes32 conditionId) external view returns (uint256);
        function payoutNumerators(bytes32 conditionId, uint256 index) external view returns (uint256);
        function redeemPositions(
            address collateralToken,
            bytes32 parentCollectionId,
            bytes32 conditionId,
            uint256[] indexSets
        ) external;
    }

    interface IERC20 {
        function balanceOf(address account) external view returns (uint256);
    }

    interface GnosisSafe {
        function getOwners() external view returns (address[]);
        function getThreshold() external view returns (uint256);
        function nonce() external view returns (uint256);
        function execTransaction(
            address to,
            uint256 value,
            bytes data,
            uint8 operation,
            uint256 safeTxGas,
            uint256 baseGas,
            uint256 gasPrice,
            address gasToken,
            address refundReceiver,
            bytes signatures
        ) external payable returns (bool);
    }

    interface ProxyWallet {
        function execute(address to, uint256 value, bytes data) external returns (bytes);
    }

    /// Typed transaction a Safe owner signs.
    struct SafeTx {
        address to;
        uint256 value;
        bytes data;
        uint8 operation;
        uint256 safeTxGas;
        uint256 baseGas;
        uint256 gasPrice;
        address gasToken;
        address refundReceiver;
        uint256 nonce;
    }
}

/// 4-byte selector of `execute(address,uint256,bytes)`.
pub const EXECUTE_SELECTOR: [u8; 4] = ProxyWallet::executeCall::SELECTOR;

pub fn payout_denominator_call(condition: B256) -> Bytes {
    ConditionalTokens::payoutDenominatorCall {
        conditionId: condition,
    }
    .abi_encode()
    .into()
}

pub fn payout_numerator_call(condition: B256, index: u8) -> Bytes {
    ConditionalTokens::payoutNumeratorsCall {
        conditionId: condition,
        index: U256::from(index),
    }
    .abi_encode()
    .into()
}

pub fn balance_of_call(account: Address) -> Bytes {
    IERC20::balanceOfCall { account }.abi_encode().into()
}

/// `redeemPositions(collateral, 0x0, condition, [1, 2])`.
pub fn redeem_call(collateral: Address, condition: B256) -> Bytes {
    ConditionalTokens::redeemPositionsCall {
        collateralToken: collateral,
        parentCollectionId: B256::ZERO,
        conditionId: condition,
        indexSets: BINARY_INDEX_SETS.iter().map(|i| U256::from(*i)).collect(),
    }
    .abi_encode()
    .into()
}

/// Proxy wallet call forwarding `data` to `to`.
pub fn execute_call(to: Address, data: Bytes) -> Bytes {
    ProxyWallet::executeCall {
        to,
        value: U256::ZERO,
        data,
    }
    .abi_encode()
    .into()
}

/// Whether deployed bytecode carries the proxy `execute` selector.
pub fn has_execute_selector(code: &[u8]) -> bool {
    code.windows(EXECUTE_SELECTOR.len())
        .any(|w| w == EXECUTE_SELECTOR)
}

/// Decode a single `uint256` return value.
pub fn decode_uint(data: &[u8]) -> Result<U256, alloy::sol_types::Error> {
    U256::abi_decode(data, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::keccak256;

    #[test]
    fn test_execute_selector_matches_signature() {
        let hash = keccak256("execute(address,uint256,bytes)");
        assert_eq!(EXECUTE_SELECTOR, hash[..4]);
        assert_eq!(hex::encode(EXECUTE_SELECTOR), "b61d27f6");
    }

    #[test]
    fn test_redeem_call_layout() {
        let condition = B256::repeat_byte(0x11);
        let data = redeem_call(POLYGON_USDC, condition);
        let decoded = ConditionalTokens::redeemPositionsCall::abi_decode(&data, true).unwrap();
        assert_eq!(decoded.collateralToken, POLYGON_USDC);
        assert_eq!(decoded.parentCollectionId, B256::ZERO);
        assert_eq!(decoded.conditionId, condition);
        assert_eq!(decoded.indexSets, vec![U256::from(1), U256::from(2)]);
    }

    #[test]
    fn test_execute_wraps_inner_call() {
        let inner = redeem_call(POLYGON_USDC, B256::repeat_byte(0x22));
        let outer = execute_call(POLYGON_CTF, inner.clone());
        assert_eq!(outer[..4], EXECUTE_SELECTOR);
        let decoded = ProxyWallet::executeCall::abi_decode(&outer, true).unwrap();
        assert_eq!(decoded.to, POLYGON_CTF);
        assert_eq!(decoded.value, U256::ZERO);
        assert_eq!(decoded.data, inner);
    }

    #[test]
    fn test_selector_scan() {
        let mut code = vec![0x60, 0x80, 0x60, 0x40];
        assert!(!has_execute_selector(&code));
        code.extend_from_slice(&EXECUTE_SELECTOR);
        code.push(0x14);
        assert!(has_execute_selector(&code));
    }

    #[test]
    fn test_decode_uint() {
        let encoded = U256::from(1_000_000u64).abi_encode();
        assert_eq!(decode_uint(&encoded).unwrap(), U256::from(1_000_000u64));
        assert!(decode_uint(&[0x01]).is_err());
    }
}
