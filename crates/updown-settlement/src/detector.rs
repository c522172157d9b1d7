//! Resolution detection.
//!
//! A condition is resolved once `payoutDenominator(conditionId)` is
//! non-zero. The detector reports the unset-to-set edge exactly once per
//! condition; later polls see `Resolved`.

use std::collections::HashSet;
use std::sync::Arc;

use alloy::primitives::{Address, Bytes, B256, U256};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::{debug, info};

use updown_core::ConditionId;

use crate::chain::ChainClient;
use crate::contracts;
use crate::error::ChainError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Pending,
    /// First poll that saw the payout recorded.
    JustResolved,
    Resolved,
}

impl Resolution {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

pub struct SettlementDetector {
    chain: Arc<dyn ChainClient>,
    ctf: Address,
    resolved: Mutex<HashSet<ConditionId>>,
}

fn condition_bytes(condition: &ConditionId) -> B256 {
    B256::from(condition.to_bytes())
}

impl SettlementDetector {
    pub fn new(chain: Arc<dyn ChainClient>, ctf: Address) -> Self {
        Self {
            chain,
            ctf,
            resolved: Mutex::new(HashSet::new()),
        }
    }

    async fn read_uint(&self, data: Bytes) -> Result<U256, ChainError> {
        let raw = self.chain.call(self.ctf, data).await?;
        contracts::decode_uint(&raw).map_err(|e| ChainError::Decode(e.to_string()))
    }

    pub async fn poll(&self, condition: &ConditionId) -> Result<Resolution, ChainError> {
        if self.resolved.lock().contains(condition) {
            return Ok(Resolution::Resolved);
        }

        let denominator = self
            .read_uint(contracts::payout_denominator_call(condition_bytes(condition)))
            .await?;
        if denominator.is_zero() {
            debug!(%condition, "Not resolved yet");
            return Ok(Resolution::Pending);
        }

        if self.resolved.lock().insert(condition.clone()) {
            info!(%condition, %denominator, "Condition resolved");
            Ok(Resolution::JustResolved)
        } else {
            Ok(Resolution::Resolved)
        }
    }

    /// Fraction of a share paid to `outcome_index`, in [0, 1].
    pub async fn payout_fraction(
        &self,
        condition: &ConditionId,
        outcome_index: u8,
    ) -> Result<Decimal, ChainError> {
        let cid = condition_bytes(condition);
        let denominator = self
            .read_uint(contracts::payout_denominator_call(cid))
            .await?;
        if denominator.is_zero() {
            return Err(ChainError::Decode(format!("{condition} has no payout yet")));
        }
        let numerator = self
            .read_uint(contracts::payout_numerator_call(cid, outcome_index))
            .await?;

        let to_decimal = |v: U256| {
            u64::try_from(v)
                .map(Decimal::from)
                .map_err(|_| ChainError::Decode(format!("payout value {v} out of range")))
        };
        Ok(to_decimal(numerator)? / to_decimal(denominator)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockChain;
    use alloy::sol_types::{SolCall, SolValue};
    use rust_decimal_macros::dec;

    const CID: &str = "0x4a629eb456c10ea56e4819f5b54c6727be8010b03c31375fed5b9f100f0dee53";

    fn set_payout(chain: &MockChain, denominator: u64, numerator: u64) {
        chain.set_call(
            contracts::POLYGON_CTF,
            contracts::ConditionalTokens::payoutDenominatorCall::SELECTOR,
            Ok(U256::from(denominator).abi_encode().into()),
        );
        chain.set_call(
            contracts::POLYGON_CTF,
            contracts::ConditionalTokens::payoutNumeratorsCall::SELECTOR,
            Ok(U256::from(numerator).abi_encode().into()),
        );
    }

    #[tokio::test]
    async fn test_resolves_exactly_once() {
        let chain = Arc::new(MockChain::new());
        let detector = SettlementDetector::new(chain.clone(), contracts::POLYGON_CTF);
        let cid = ConditionId::parse(CID).unwrap();

        set_payout(&chain, 0, 0);
        assert_eq!(detector.poll(&cid).await.unwrap(), Resolution::Pending);
        assert_eq!(detector.poll(&cid).await.unwrap(), Resolution::Pending);

        set_payout(&chain, 1, 1);
        assert_eq!(detector.poll(&cid).await.unwrap(), Resolution::JustResolved);
        assert_eq!(detector.poll(&cid).await.unwrap(), Resolution::Resolved);
        assert_eq!(detector.poll(&cid).await.unwrap(), Resolution::Resolved);
    }

    #[tokio::test]
    async fn test_payout_fraction() {
        let chain = Arc::new(MockChain::new());
        let detector = SettlementDetector::new(chain.clone(), contracts::POLYGON_CTF);
        let cid = ConditionId::parse(CID).unwrap();

        set_payout(&chain, 2, 1);
        assert_eq!(detector.payout_fraction(&cid, 0).await.unwrap(), dec!(0.5));
        set_payout(&chain, 1, 0);
        assert_eq!(detector.payout_fraction(&cid, 1).await.unwrap(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_read_failure_propagates() {
        let chain = Arc::new(MockChain::new());
        chain.set_call(
            contracts::POLYGON_CTF,
            contracts::ConditionalTokens::payoutDenominatorCall::SELECTOR,
            Err(ChainError::Timeout(100)),
        );
        let detector = SettlementDetector::new(chain, contracts::POLYGON_CTF);
        let cid = ConditionId::parse(CID).unwrap();
        assert!(detector.poll(&cid).await.unwrap_err().is_transient());
    }
}
