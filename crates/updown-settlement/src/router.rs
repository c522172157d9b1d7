//! Redemption router.
//!
//! Drives each registered claim through
//! `AWAITING_RESOLUTION -> DETECT_WALLET -> CLAIM_ATTEMPT -> CONFIRMED | ESCALATED`
//! (or `WORTHLESS` when the held outcome pays nothing).
//!
//! A claim attempt sends the redeem call through the holding wallet using
//! one backend at a time: the detected kind first, then the other one. An
//! attempt counts as successful only when the wallet's collateral balance
//! rises; a mined transaction without a balance change is a failure. Once
//! every backend has failed the claim escalates and is never retried.
//!
//! A broadcast transaction whose receipt has not appeared stays in flight:
//! later polls look up its receipt and nothing is resent until it is mined.
//! One that is never mined escalates after `max_pending_polls` polls.
//!
//! At most one attempt per condition runs at a time, and attempts from the
//! same wallet are serialized so balance deltas can be attributed.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, B256};
use alloy::sol_types::SolCall;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use updown_core::{
    call_with_retry, ClaimStage, ConditionId, EngineEvent, RetryPolicy, Size, WalletKind,
};
use updown_telemetry::EventBus;

use crate::chain::{BalanceReader, ChainClient, TxRequest};
use crate::claim::ClaimTargets;
use crate::contracts::{self, GnosisSafe};
use crate::detector::SettlementDetector;
use crate::error::{ChainError, SettlementResult};
use crate::key::KeyManager;
use crate::wallet::WalletDetector;

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub targets: ClaimTargets,
    pub confirm_reads: u32,
    pub confirm_delay: Duration,
    pub max_pending_polls: u32,
    pub discrepancy_tolerance: Decimal,
    pub retry: RetryPolicy,
}

/// Send whose outcome is not known yet (receipt or balance read failed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnsettledSend {
    pub backend: WalletKind,
    pub balance_before: Decimal,
    /// Set once the transaction is known to have been broadcast.
    pub tx_hash: Option<B256>,
    /// Polls that found it still unmined.
    pub polls: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRecord {
    pub condition_id: ConditionId,
    pub outcome_index: u8,
    pub size: Size,
    pub stage: ClaimStage,
    pub wallet_kind: Option<WalletKind>,
    pub expected_payout: Option<Decimal>,
    /// Failed backend attempts so far.
    pub attempts: u32,
    /// Position in the fallback order of the next backend to try.
    pub next_backend: usize,
    pub unsettled: Option<UnsettledSend>,
    pub last_error: Option<String>,
    pub tx_hashes: Vec<String>,
    pub confirmed_delta: Option<Decimal>,
}

impl ClaimRecord {
    fn new(condition_id: ConditionId, outcome_index: u8, size: Size) -> Self {
        Self {
            condition_id,
            outcome_index,
            size,
            stage: ClaimStage::AwaitingResolution,
            wallet_kind: None,
            expected_payout: None,
            attempts: 0,
            next_backend: 0,
            unsettled: None,
            last_error: None,
            tx_hashes: Vec::new(),
            confirmed_delta: None,
        }
    }
}

/// Backends in the order they are tried.
pub fn fallback_order(kind: WalletKind) -> Vec<WalletKind> {
    match kind.alternate() {
        Some(alternate) => vec![kind, alternate],
        None => vec![WalletKind::Custom, WalletKind::Safe],
    }
}

/// Marks a condition as being worked on; released on drop.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<ConditionId>>,
    condition: ConditionId,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(set: &'a Mutex<HashSet<ConditionId>>, condition: &ConditionId) -> Option<Self> {
        if set.lock().insert(condition.clone()) {
            Some(Self {
                set,
                condition: condition.clone(),
            })
        } else {
            None
        }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.condition);
    }
}

enum AttemptOutcome {
    Confirmed(Decimal),
    Failed(String),
    InFlight,
}

/// What a later poll learned about an unsettled send.
enum Unsettled {
    Confirmed,
    InFlight,
    Failed,
    Escalated,
}

pub struct RedemptionRouter {
    config: RouterConfig,
    chain: Arc<dyn ChainClient>,
    balances: Arc<dyn BalanceReader>,
    keys: Arc<KeyManager>,
    detector: SettlementDetector,
    wallets: WalletDetector,
    claims: Mutex<HashMap<ConditionId, ClaimRecord>>,
    in_flight: Mutex<HashSet<ConditionId>>,
    wallet_lock: tokio::sync::Mutex<()>,
    events: EventBus,
}

impl RedemptionRouter {
    pub fn new(
        config: RouterConfig,
        chain: Arc<dyn ChainClient>,
        balances: Arc<dyn BalanceReader>,
        keys: Arc<KeyManager>,
        events: EventBus,
    ) -> Self {
        let detector = SettlementDetector::new(chain.clone(), config.targets.ctf);
        let wallets = WalletDetector::new(chain.clone());
        Self {
            config,
            chain,
            balances,
            keys,
            detector,
            wallets,
            claims: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            wallet_lock: tokio::sync::Mutex::new(()),
            events,
        }
    }

    pub fn holding_wallet(&self) -> Address {
        self.config.targets.wallet
    }

    /// Register held shares for redemption once `condition_id` resolves.
    ///
    /// Shares for an already pending condition are added to it. Returns
    /// `false` when nothing was registered.
    pub fn register(&self, condition_id: ConditionId, outcome_index: u8, size: Size) -> bool {
        if !size.is_positive() {
            return false;
        }

        let total = {
            let mut claims = self.claims.lock();
            match claims.entry(condition_id.clone()) {
                Entry::Occupied(mut entry) => {
                    let existing = entry.get_mut();
                    if existing.stage.is_terminal() {
                        warn!(
                            condition = %condition_id,
                            stage = %existing.stage,
                            "Claim already finished, not re-registering"
                        );
                        return false;
                    }
                    if existing.outcome_index != outcome_index {
                        warn!(
                            condition = %condition_id,
                            held = existing.outcome_index,
                            offered = outcome_index,
                            "Claim registered for another outcome"
                        );
                        return false;
                    }
                    existing.size = Size::new(existing.size.inner() + size.inner());
                    existing.size
                }
                Entry::Vacant(entry) => {
                    entry.insert(ClaimRecord::new(condition_id.clone(), outcome_index, size));
                    size
                }
            }
        };

        info!(condition = %condition_id, outcome_index, size = %total, "Claim registered");
        self.events.publish(EngineEvent::ClaimRegistered {
            condition_id,
            size: total,
        });
        true
    }

    pub fn claim(&self, condition_id: &ConditionId) -> Option<ClaimRecord> {
        self.claims.lock().get(condition_id).cloned()
    }

    /// Claims not yet in a terminal stage, ordered by condition id.
    pub fn pending_claims(&self) -> Vec<ClaimRecord> {
        let mut pending: Vec<ClaimRecord> = self
            .claims
            .lock()
            .values()
            .filter(|c| !c.stage.is_terminal())
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.condition_id.cmp(&b.condition_id));
        pending
    }

    /// Give up on a claim that will not resolve; it escalates for manual
    /// handling. Returns `false` for finished claims and for claims being
    /// advanced right now.
    pub fn abandon(&self, condition_id: &ConditionId, reason: &str) -> bool {
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight, condition_id) else {
            debug!(condition = %condition_id, "Claim in flight, not abandoning");
            return false;
        };
        let pending = self
            .claim(condition_id)
            .is_some_and(|c| !c.stage.is_terminal());
        if pending {
            self.escalate(condition_id, format!("abandoned: {reason}"));
        }
        pending
    }

    /// Advance every pending claim once. Returns the number still pending.
    pub async fn advance_all(&self) -> usize {
        for record in self.pending_claims() {
            if let Err(e) = self.advance(&record.condition_id).await {
                warn!(
                    condition = %record.condition_id,
                    stage = %record.stage,
                    error = %e,
                    "Claim step failed, retrying next tick"
                );
            }
        }
        self.pending_claims().len()
    }

    /// Advance one claim as far as it can go now.
    ///
    /// Returns the stage reached, or `None` when the claim is unknown or
    /// already being advanced elsewhere. `Err` means a transient failure;
    /// the claim stays where it was.
    pub async fn advance(&self, condition_id: &ConditionId) -> SettlementResult<Option<ClaimStage>> {
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight, condition_id) else {
            debug!(condition = %condition_id, "Claim already in flight");
            return Ok(None);
        };

        loop {
            let Some(record) = self.claim(condition_id) else {
                return Ok(None);
            };
            let next = match record.stage {
                ClaimStage::AwaitingResolution => self.check_resolution(&record).await?,
                ClaimStage::DetectWallet => self.detect_wallet(&record).await?,
                ClaimStage::ClaimAttempt => self.attempt_claim(&record).await?,
                terminal => return Ok(Some(terminal)),
            };
            if next == record.stage {
                return Ok(Some(next));
            }
        }
    }

    fn update(&self, condition_id: &ConditionId, f: impl FnOnce(&mut ClaimRecord)) {
        if let Some(record) = self.claims.lock().get_mut(condition_id) {
            f(record);
        }
    }

    async fn check_resolution(&self, record: &ClaimRecord) -> SettlementResult<ClaimStage> {
        let cid = &record.condition_id;
        let resolution = call_with_retry("payout_denominator", &self.config.retry, || {
            self.detector.poll(cid)
        })
        .await?;
        if !resolution.is_resolved() {
            return Ok(ClaimStage::AwaitingResolution);
        }

        let fraction = call_with_retry("payout_numerators", &self.config.retry, || {
            self.detector.payout_fraction(cid, record.outcome_index)
        })
        .await?;
        let expected = record.size.inner() * fraction;

        if expected.is_zero() {
            info!(condition = %cid, "Held outcome pays nothing");
            self.update(cid, |r| {
                r.stage = ClaimStage::Worthless;
                r.expected_payout = Some(Decimal::ZERO);
            });
            self.events.publish(EngineEvent::ClaimWorthless {
                condition_id: cid.clone(),
            });
            return Ok(ClaimStage::Worthless);
        }

        info!(condition = %cid, %expected, "Claim payable");
        self.update(cid, |r| {
            r.stage = ClaimStage::DetectWallet;
            r.expected_payout = Some(expected);
        });
        Ok(ClaimStage::DetectWallet)
    }

    async fn detect_wallet(&self, record: &ClaimRecord) -> SettlementResult<ClaimStage> {
        let wallet = self.holding_wallet();
        let kind = call_with_retry("detect_wallet", &self.config.retry, || {
            self.wallets.detect(wallet)
        })
        .await?;
        self.update(&record.condition_id, |r| {
            r.stage = ClaimStage::ClaimAttempt;
            r.wallet_kind = Some(kind);
        });
        Ok(ClaimStage::ClaimAttempt)
    }

    async fn read_balance(&self) -> Result<Decimal, ChainError> {
        let wallet = self.holding_wallet();
        call_with_retry("balance_of", &self.config.retry, || {
            self.balances.balance_of(wallet)
        })
        .await
    }

    /// Balance increase over `before`, re-read a few times to allow for
    /// node lag. Zero when nothing moved.
    async fn observe_delta(&self, before: Decimal) -> Result<Decimal, ChainError> {
        for read in 0..self.config.confirm_reads.max(1) {
            if read > 0 {
                tokio::time::sleep(self.config.confirm_delay).await;
            }
            let delta = self.read_balance().await? - before;
            if delta > Decimal::ZERO {
                return Ok(delta);
            }
        }
        Ok(Decimal::ZERO)
    }

    async fn build_claim(&self, backend: WalletKind, condition: B256) -> Result<TxRequest, ChainError> {
        let targets = &self.config.targets;
        match backend {
            WalletKind::Safe => {
                let signer = self.keys.signer().ok_or(ChainError::NoSigner)?;
                let raw = call_with_retry("safe_nonce", &self.config.retry, || {
                    self.chain
                        .call(targets.wallet, GnosisSafe::nonceCall {}.abi_encode().into())
                })
                .await?;
                let nonce = contracts::decode_uint(&raw)
                    .map_err(|e| ChainError::Decode(format!("nonce: {e}")))?;
                targets.safe_claim(condition, nonce, signer).await
            }
            WalletKind::Custom | WalletKind::Unknown => Ok(targets.custom_claim(condition)),
        }
    }

    async fn attempt_claim(&self, record: &ClaimRecord) -> SettlementResult<ClaimStage> {
        let _wallet = self.wallet_lock.lock().await;
        let cid = &record.condition_id;
        let backends = fallback_order(record.wallet_kind.unwrap_or(WalletKind::Unknown));

        if let Some(unsettled) = record.unsettled {
            match self.settle(cid, unsettled).await? {
                Unsettled::Confirmed => return Ok(ClaimStage::Confirmed),
                Unsettled::InFlight => return Ok(ClaimStage::ClaimAttempt),
                Unsettled::Escalated => return Ok(ClaimStage::Escalated),
                Unsettled::Failed => {}
            }
        }

        let condition = B256::from(cid.to_bytes());
        let start = self.claim(cid).map_or(record.next_backend, |r| r.next_backend);
        for &backend in backends.iter().skip(start) {
            match self.attempt_backend(cid, backend, condition).await? {
                AttemptOutcome::Confirmed(delta) => {
                    self.confirm(cid, backend, delta);
                    return Ok(ClaimStage::Confirmed);
                }
                AttemptOutcome::Failed(error) => self.record_failure(cid, backend, error),
                AttemptOutcome::InFlight => return Ok(ClaimStage::ClaimAttempt),
            }
        }

        let last_error = self.claim(cid).and_then(|r| r.last_error);
        self.escalate(cid, last_error.unwrap_or_else(|| "no backend available".to_string()));
        Ok(ClaimStage::Escalated)
    }

    /// Look at a send left unsettled by an earlier poll.
    ///
    /// With a hash, its receipt decides: unmined waits, reverted or mined
    /// without a balance change fails over. Without one only the balance can
    /// tell, so it waits the same number of polls before failing over.
    async fn settle(
        &self,
        cid: &ConditionId,
        unsettled: UnsettledSend,
    ) -> SettlementResult<Unsettled> {
        let backend = unsettled.backend;
        if let Some(tx_hash) = unsettled.tx_hash {
            let receipt = call_with_retry("tx_receipt", &self.config.retry, || {
                self.chain.receipt(tx_hash)
            })
            .await?;
            match receipt {
                Some(receipt) if !receipt.success => {
                    self.record_failure(cid, backend, format!("transaction {tx_hash} reverted"));
                    return Ok(Unsettled::Failed);
                }
                Some(_) => {
                    let delta = self.observe_delta(unsettled.balance_before).await?;
                    if delta > Decimal::ZERO {
                        self.confirm(cid, backend, delta);
                        return Ok(Unsettled::Confirmed);
                    }
                    self.record_failure(
                        cid,
                        backend,
                        format!("transaction {tx_hash} mined without balance change"),
                    );
                    return Ok(Unsettled::Failed);
                }
                None => {}
            }
        } else {
            let delta = self.observe_delta(unsettled.balance_before).await?;
            if delta > Decimal::ZERO {
                self.confirm(cid, backend, delta);
                return Ok(Unsettled::Confirmed);
            }
        }

        let polls = unsettled.polls + 1;
        if polls < self.config.max_pending_polls {
            self.update(cid, |r| {
                if let Some(pending) = r.unsettled.as_mut() {
                    pending.polls = polls;
                }
            });
            debug!(condition = %cid, %backend, polls, "Claim send still in flight");
            return Ok(Unsettled::InFlight);
        }

        match unsettled.tx_hash {
            Some(tx_hash) => {
                self.escalate(
                    cid,
                    format!("transaction {tx_hash} not mined after {polls} polls"),
                );
                Ok(Unsettled::Escalated)
            }
            None => {
                self.record_failure(
                    cid,
                    backend,
                    "no balance change after unconfirmed send".to_string(),
                );
                Ok(Unsettled::Failed)
            }
        }
    }

    /// One send through `backend`. `Err` leaves the send unsettled for the
    /// next tick.
    async fn attempt_backend(
        &self,
        cid: &ConditionId,
        backend: WalletKind,
        condition: B256,
    ) -> SettlementResult<AttemptOutcome> {
        let before = self.read_balance().await?;
        let tx = match self.build_claim(backend, condition).await {
            Ok(tx) => tx,
            Err(e) if e.is_transient() => return Err(e.into()),
            Err(e) => return Ok(AttemptOutcome::Failed(e.to_string())),
        };

        self.update(cid, |r| {
            r.unsettled = Some(UnsettledSend {
                backend,
                balance_before: before,
                tx_hash: None,
                polls: 0,
            })
        });
        info!(condition = %cid, %backend, to = %tx.to, "Submitting claim");

        let receipt = match self.chain.send_transaction(tx).await {
            Ok(receipt) => receipt,
            Err(e) => {
                if let Some(hash) = e.pending_tx() {
                    warn!(condition = %cid, %backend, tx_hash = %hash, "Claim sent, receipt pending");
                    self.submitted(cid, backend, hash);
                    return Ok(AttemptOutcome::InFlight);
                }
                if e.is_transient() {
                    warn!(condition = %cid, %backend, error = %e, "Claim send outcome unknown");
                    return Err(e.into());
                }
                return Ok(AttemptOutcome::Failed(e.to_string()));
            }
        };

        self.submitted(cid, backend, receipt.tx_hash);
        let tx_hash = receipt.tx_hash.to_string();
        if !receipt.success {
            return Ok(AttemptOutcome::Failed(format!("transaction {tx_hash} reverted")));
        }

        let delta = self.observe_delta(before).await?;
        if delta > Decimal::ZERO {
            Ok(AttemptOutcome::Confirmed(delta))
        } else {
            Ok(AttemptOutcome::Failed(format!(
                "transaction {tx_hash} mined without balance change"
            )))
        }
    }

    fn submitted(&self, cid: &ConditionId, backend: WalletKind, hash: B256) {
        let tx_hash = hash.to_string();
        self.update(cid, |r| {
            if let Some(pending) = r.unsettled.as_mut() {
                pending.tx_hash = Some(hash);
            }
            r.tx_hashes.push(tx_hash.clone());
        });
        self.events.publish(EngineEvent::ClaimSubmitted {
            condition_id: cid.clone(),
            backend,
            tx_hash,
        });
    }

    fn confirm(&self, cid: &ConditionId, backend: WalletKind, delta: Decimal) {
        let mut expected = None;
        self.update(cid, |r| {
            r.stage = ClaimStage::Confirmed;
            r.unsettled = None;
            r.confirmed_delta = Some(delta);
            expected = r.expected_payout;
        });
        info!(condition = %cid, %backend, %delta, "Claim confirmed");
        self.events.publish(EngineEvent::ClaimConfirmed {
            condition_id: cid.clone(),
            backend,
            delta,
        });

        if let Some(expected) = expected {
            if (delta - expected).abs() > self.config.discrepancy_tolerance {
                self.events.publish(EngineEvent::ClaimDiscrepancy {
                    condition_id: cid.clone(),
                    expected,
                    observed: delta,
                });
            }
        }
    }

    fn record_failure(&self, cid: &ConditionId, backend: WalletKind, error: String) {
        self.update(cid, |r| {
            r.attempts += 1;
            r.next_backend += 1;
            r.unsettled = None;
            r.last_error = Some(error.clone());
        });
        self.events.publish(EngineEvent::ClaimAttemptFailed {
            condition_id: cid.clone(),
            backend,
            error,
        });
    }

    fn escalate(&self, cid: &ConditionId, reason: String) {
        let mut attempts = 0;
        self.update(cid, |r| {
            r.stage = ClaimStage::Escalated;
            r.unsettled = None;
            r.last_error = Some(reason.clone());
            attempts = r.attempts;
        });
        self.events.publish(EngineEvent::ClaimEscalated {
            condition_id: cid.clone(),
            attempts,
            last_error: Some(reason),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{MockChain, MockSend};
    use crate::contracts::{ConditionalTokens, ProxyWallet, POLYGON_CTF, POLYGON_USDC};
    use alloy::primitives::{Bytes, U256};
    use alloy::sol_types::SolValue;
    use rust_decimal_macros::dec;

    const CID: &str = "0x4a629eb456c10ea56e4819f5b54c6727be8010b03c31375fed5b9f100f0dee53";
    const TEST_PRIVATE_KEY: &str =
        "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn wallet() -> Address {
        Address::repeat_byte(0x5a)
    }

    fn cid() -> ConditionId {
        ConditionId::parse(CID).unwrap()
    }

    fn config() -> RouterConfig {
        RouterConfig {
            targets: ClaimTargets {
                wallet: wallet(),
                ctf: POLYGON_CTF,
                collateral: POLYGON_USDC,
                chain_id: 137,
                custom_gas_limit: contracts::CUSTOM_GAS_LIMIT,
                safe_gas_limit: contracts::SAFE_GAS_LIMIT,
            },
            confirm_reads: 2,
            confirm_delay: Duration::from_millis(1),
            max_pending_polls: 3,
            discrepancy_tolerance: dec!(0.01),
            retry: RetryPolicy {
                timeout_ms: 200,
                max_attempts: 2,
                base_delay_ms: 1,
                max_delay_ms: 2,
            },
        }
    }

    fn proxy_code() -> Bytes {
        let mut code = vec![0x60, 0x80, 0x60, 0x40];
        code.extend_from_slice(&contracts::EXECUTE_SELECTOR);
        code.into()
    }

    fn resolve(chain: &MockChain, numerator: u64) {
        chain.set_call(
            POLYGON_CTF,
            ConditionalTokens::payoutDenominatorCall::SELECTOR,
            Ok(U256::from(1).abi_encode().into()),
        );
        chain.set_call(
            POLYGON_CTF,
            ConditionalTokens::payoutNumeratorsCall::SELECTOR,
            Ok(U256::from(numerator).abi_encode().into()),
        );
    }

    fn custom_wallet(chain: &MockChain) {
        chain.set_code(wallet(), proxy_code());
        chain.set_call(
            wallet(),
            GnosisSafe::nonceCall::SELECTOR,
            Ok(U256::from(3).abi_encode().into()),
        );
    }

    fn router(chain: Arc<MockChain>, events: EventBus) -> RedemptionRouter {
        let key = hex::decode(TEST_PRIVATE_KEY).unwrap();
        RedemptionRouter::new(
            config(),
            chain.clone(),
            chain,
            Arc::new(KeyManager::from_bytes(&key, None).unwrap()),
            events,
        )
    }

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<EngineEvent>) -> Vec<&'static str> {
        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind());
        }
        kinds
    }

    #[test]
    fn test_fallback_order() {
        assert_eq!(
            fallback_order(WalletKind::Custom),
            vec![WalletKind::Custom, WalletKind::Safe]
        );
        assert_eq!(
            fallback_order(WalletKind::Safe),
            vec![WalletKind::Safe, WalletKind::Custom]
        );
        assert_eq!(
            fallback_order(WalletKind::Unknown),
            vec![WalletKind::Custom, WalletKind::Safe]
        );
    }

    #[test]
    fn test_in_flight_guard_exclusive() {
        let set = Mutex::new(HashSet::new());
        let first = InFlightGuard::acquire(&set, &cid());
        assert!(first.is_some());
        assert!(InFlightGuard::acquire(&set, &cid()).is_none());
        drop(first);
        assert!(InFlightGuard::acquire(&set, &cid()).is_some());
    }

    #[tokio::test]
    async fn test_register_merges_and_ignores_zero() {
        let chain = Arc::new(MockChain::new());
        let router = router(chain, EventBus::default());

        assert!(!router.register(cid(), 0, Size::new(Decimal::ZERO)));
        assert!(router.register(cid(), 0, Size::new(dec!(5))));
        assert!(router.register(cid(), 0, Size::new(dec!(2))));
        assert!(!router.register(cid(), 1, Size::new(dec!(1))));

        let pending = router.pending_claims();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].size, Size::new(dec!(7)));
        assert_eq!(pending[0].stage, ClaimStage::AwaitingResolution);
    }

    #[tokio::test]
    async fn test_unresolved_waits_without_touching_wallet() {
        let chain = Arc::new(MockChain::new());
        chain.set_call(
            POLYGON_CTF,
            ConditionalTokens::payoutDenominatorCall::SELECTOR,
            Ok(U256::ZERO.abi_encode().into()),
        );
        let router = router(chain.clone(), EventBus::default());
        router.register(cid(), 0, Size::new(dec!(5)));

        let stage = router.advance(&cid()).await.unwrap();
        assert_eq!(stage, Some(ClaimStage::AwaitingResolution));
        assert_eq!(chain.call_count(GnosisSafe::getOwnersCall::SELECTOR), 0);
        assert!(chain.sent().is_empty());
    }

    #[tokio::test]
    async fn test_custom_revert_falls_back_to_safe() {
        let chain = Arc::new(MockChain::new());
        resolve(&chain, 1);
        custom_wallet(&chain);
        chain.set_balance(wallet(), dec!(100));
        chain.push_send(MockSend::Revert);
        chain.push_send(MockSend::Succeed { credit: dec!(5) });

        let events = EventBus::default();
        let mut rx = events.subscribe();
        let router = router(chain.clone(), events);
        router.register(cid(), 0, Size::new(dec!(5)));

        let stage = router.advance(&cid()).await.unwrap();
        assert_eq!(stage, Some(ClaimStage::Confirmed));

        let sent = chain.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].data[..4], ProxyWallet::executeCall::SELECTOR);
        assert_eq!(sent[1].data[..4], GnosisSafe::execTransactionCall::SELECTOR);
        assert_eq!(chain.balance(wallet()), dec!(105));

        let record = router.claim(&cid()).unwrap();
        assert_eq!(record.wallet_kind, Some(WalletKind::Custom));
        assert_eq!(record.confirmed_delta, Some(dec!(5)));
        assert_eq!(record.attempts, 1);
        assert_eq!(record.tx_hashes.len(), 2);

        assert_eq!(
            drain(&mut rx),
            vec![
                "claim_registered",
                "claim_submitted",
                "claim_attempt_failed",
                "claim_submitted",
                "claim_confirmed",
            ]
        );
        assert!(router.pending_claims().is_empty());
    }

    #[tokio::test]
    async fn test_losing_outcome_is_worthless() {
        let chain = Arc::new(MockChain::new());
        resolve(&chain, 0);
        let router = router(chain.clone(), EventBus::default());
        router.register(cid(), 1, Size::new(dec!(5)));

        assert_eq!(
            router.advance(&cid()).await.unwrap(),
            Some(ClaimStage::Worthless)
        );
        assert!(chain.sent().is_empty());
    }

    #[tokio::test]
    async fn test_no_balance_change_on_both_backends_escalates() {
        let chain = Arc::new(MockChain::new());
        resolve(&chain, 1);
        custom_wallet(&chain);

        let events = EventBus::default();
        let mut rx = events.subscribe();
        let router = router(chain.clone(), events);
        router.register(cid(), 0, Size::new(dec!(5)));

        assert_eq!(
            router.advance(&cid()).await.unwrap(),
            Some(ClaimStage::Escalated)
        );
        let record = router.claim(&cid()).unwrap();
        assert_eq!(record.attempts, 2);
        assert!(record.last_error.unwrap().contains("without balance change"));
        assert!(drain(&mut rx).contains(&"claim_escalated"));

        // Escalated claims are never retried
        assert_eq!(
            router.advance(&cid()).await.unwrap(),
            Some(ClaimStage::Escalated)
        );
        assert_eq!(chain.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_unexpected_amount_flags_discrepancy() {
        let chain = Arc::new(MockChain::new());
        resolve(&chain, 1);
        custom_wallet(&chain);
        chain.push_send(MockSend::Succeed { credit: dec!(4) });

        let events = EventBus::default();
        let mut rx = events.subscribe();
        let router = router(chain, events);
        router.register(cid(), 0, Size::new(dec!(5)));

        assert_eq!(
            router.advance(&cid()).await.unwrap(),
            Some(ClaimStage::Confirmed)
        );
        let kinds = drain(&mut rx);
        assert!(kinds.contains(&"claim_confirmed"));
        assert!(kinds.contains(&"claim_discrepancy"));
    }

    #[tokio::test]
    async fn test_unknown_send_outcome_resolved_next_tick() {
        let chain = Arc::new(MockChain::new());
        resolve(&chain, 1);
        custom_wallet(&chain);
        chain.set_balance(wallet(), dec!(10));
        chain.push_send(MockSend::Fail(ChainError::Timeout(100)));

        let router = router(chain.clone(), EventBus::default());
        router.register(cid(), 0, Size::new(dec!(5)));

        assert!(router.advance(&cid()).await.is_err());
        let record = router.claim(&cid()).unwrap();
        assert_eq!(record.stage, ClaimStage::ClaimAttempt);
        assert!(record.unsettled.is_some());

        // The timed-out transaction landed after all
        chain.set_balance(wallet(), dec!(15));
        assert_eq!(
            router.advance(&cid()).await.unwrap(),
            Some(ClaimStage::Confirmed)
        );
        assert_eq!(chain.sent().len(), 1);
        assert_eq!(router.claim(&cid()).unwrap().confirmed_delta, Some(dec!(5)));
    }

    #[tokio::test]
    async fn test_timed_out_send_is_not_resent_next_poll() {
        let chain = Arc::new(MockChain::new());
        resolve(&chain, 1);
        custom_wallet(&chain);
        chain.set_balance(wallet(), dec!(10));
        chain.push_send(MockSend::Fail(ChainError::Timeout(100)));

        let router = router(chain.clone(), EventBus::default());
        router.register(cid(), 0, Size::new(dec!(5)));

        assert!(router.advance(&cid()).await.is_err());
        // Nothing moved yet; the first send may still land
        assert_eq!(
            router.advance(&cid()).await.unwrap(),
            Some(ClaimStage::ClaimAttempt)
        );
        assert_eq!(chain.sent().len(), 1);
        let record = router.claim(&cid()).unwrap();
        assert_eq!(record.attempts, 0);
        assert_eq!(record.unsettled.unwrap().polls, 1);
    }

    #[tokio::test]
    async fn test_pending_claim_tx_polled_until_mined() {
        let chain = Arc::new(MockChain::new());
        resolve(&chain, 1);
        custom_wallet(&chain);
        chain.set_balance(wallet(), dec!(10));
        chain.push_send(MockSend::Pending);

        let events = EventBus::default();
        let mut rx = events.subscribe();
        let router = router(chain.clone(), events);
        router.register(cid(), 0, Size::new(dec!(5)));

        assert_eq!(
            router.advance(&cid()).await.unwrap(),
            Some(ClaimStage::ClaimAttempt)
        );
        let unsettled = router.claim(&cid()).unwrap().unsettled.unwrap();
        assert!(unsettled.tx_hash.is_some());

        assert_eq!(
            router.advance(&cid()).await.unwrap(),
            Some(ClaimStage::ClaimAttempt)
        );
        assert_eq!(chain.sent().len(), 1);

        chain.mine_pending(Some(dec!(5)));
        assert_eq!(
            router.advance(&cid()).await.unwrap(),
            Some(ClaimStage::Confirmed)
        );
        assert_eq!(chain.sent().len(), 1);
        let record = router.claim(&cid()).unwrap();
        assert_eq!(record.confirmed_delta, Some(dec!(5)));
        assert_eq!(record.attempts, 0);
        assert_eq!(record.tx_hashes.len(), 1);
        assert_eq!(
            drain(&mut rx),
            vec!["claim_registered", "claim_submitted", "claim_confirmed"]
        );
    }

    #[tokio::test]
    async fn test_pending_claim_reverted_falls_back() {
        let chain = Arc::new(MockChain::new());
        resolve(&chain, 1);
        custom_wallet(&chain);
        chain.set_balance(wallet(), dec!(10));
        chain.push_send(MockSend::Pending);
        chain.push_send(MockSend::Succeed { credit: dec!(5) });

        let router = router(chain.clone(), EventBus::default());
        router.register(cid(), 0, Size::new(dec!(5)));

        router.advance(&cid()).await.unwrap();
        chain.mine_pending(None);
        assert_eq!(
            router.advance(&cid()).await.unwrap(),
            Some(ClaimStage::Confirmed)
        );

        let sent = chain.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].data[..4], GnosisSafe::execTransactionCall::SELECTOR);
        let record = router.claim(&cid()).unwrap();
        assert_eq!(record.attempts, 1);
        assert!(record.last_error.unwrap().contains("reverted"));
    }

    #[tokio::test]
    async fn test_never_mined_claim_escalates_without_resend() {
        let chain = Arc::new(MockChain::new());
        resolve(&chain, 1);
        custom_wallet(&chain);
        chain.push_send(MockSend::Pending);

        let router = router(chain.clone(), EventBus::default());
        router.register(cid(), 0, Size::new(dec!(5)));

        router.advance(&cid()).await.unwrap();
        for _ in 0..2 {
            assert_eq!(
                router.advance(&cid()).await.unwrap(),
                Some(ClaimStage::ClaimAttempt)
            );
        }
        assert_eq!(
            router.advance(&cid()).await.unwrap(),
            Some(ClaimStage::Escalated)
        );
        assert_eq!(chain.sent().len(), 1);
        assert!(router
            .claim(&cid())
            .unwrap()
            .last_error
            .unwrap()
            .contains("not mined"));
    }

    #[tokio::test]
    async fn test_abandon_skips_claim_being_advanced() {
        let chain = Arc::new(MockChain::new());
        let router = router(chain, EventBus::default());
        router.register(cid(), 0, Size::new(dec!(5)));

        let guard = InFlightGuard::acquire(&router.in_flight, &cid());
        assert!(!router.abandon(&cid(), "market voided"));
        assert_eq!(
            router.claim(&cid()).unwrap().stage,
            ClaimStage::AwaitingResolution
        );

        drop(guard);
        assert!(router.abandon(&cid(), "market voided"));
    }

    #[tokio::test]
    async fn test_abandon_escalates() {
        let chain = Arc::new(MockChain::new());
        let router = router(chain, EventBus::default());
        router.register(cid(), 0, Size::new(dec!(5)));

        assert!(router.abandon(&cid(), "market voided"));
        let record = router.claim(&cid()).unwrap();
        assert_eq!(record.stage, ClaimStage::Escalated);
        assert!(!router.abandon(&cid(), "again"));
    }
}
