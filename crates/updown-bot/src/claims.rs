//! Hand-over of held inventory to the redemption router.
//!
//! Inventory still held when a window closes keeps counting against the
//! account ceiling until its claim reaches a terminal stage. The cycle
//! moves its reservation over to the held notional when it closes; the
//! book only releases it once the claim is done.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use updown_core::{ConditionId, CycleId};
use updown_executor::CycleSummary;
use updown_risk::AccountExposure;
use updown_settlement::RedemptionRouter;

pub struct ClaimBook {
    router: Arc<RedemptionRouter>,
    account: Arc<AccountExposure>,
    reserved: Mutex<HashMap<ConditionId, Vec<CycleId>>>,
}

impl ClaimBook {
    pub fn new(router: Arc<RedemptionRouter>, account: Arc<AccountExposure>) -> Self {
        Self {
            router,
            account,
            reserved: Mutex::new(HashMap::new()),
        }
    }

    pub fn router(&self) -> &Arc<RedemptionRouter> {
        &self.router
    }

    /// Register a closed cycle's held inventory. Its reservation is
    /// released once the claim finishes.
    pub fn hand_over(&self, summary: &CycleSummary) -> bool {
        if !summary.held.is_positive() {
            return false;
        }
        let window = &summary.window;
        if !self.router.register(
            window.condition_id.clone(),
            window.outcome_index,
            summary.held,
        ) {
            return false;
        }

        self.reserved
            .lock()
            .entry(window.condition_id.clone())
            .or_default()
            .push(window.cycle);
        info!(
            cycle = %window.cycle,
            condition = %window.condition_id,
            held = %summary.held,
            held_notional = %summary.held_notional,
            "Held inventory handed to redemption"
        );
        true
    }

    /// Advance every pending claim and release the exposure of finished
    /// ones. Returns the number still pending.
    pub async fn advance(&self) -> usize {
        let pending = self.router.advance_all().await;
        self.release_finished();
        pending
    }

    fn release_finished(&self) {
        self.reserved.lock().retain(|condition, cycles| {
            let done = self
                .router
                .claim(condition)
                .map_or(true, |c| c.stage.is_terminal());
            if done {
                for cycle in cycles.iter() {
                    self.account.release(*cycle);
                }
                debug!(%condition, "Released redeemed exposure");
            }
            !done
        });
    }
}

/// Advance claims every `interval` until shutdown, or until trading has
/// finished and nothing is pending.
pub async fn settlement_loop(
    claims: Arc<ClaimBook>,
    interval: Duration,
    shutdown: CancellationToken,
    trading_done: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let pending = claims.router().pending_claims().len();
                if pending > 0 {
                    warn!(pending, "Shutdown with claims still pending");
                }
                return;
            }
            _ = ticker.tick() => {}
        }

        let pending = claims.advance().await;
        if pending == 0 && trading_done.is_cancelled() {
            info!("No claims pending, settlement loop done");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use updown_core::{MarketWindow, PositionState, Size, TokenId};
    use updown_settlement::{KeyManager, MockChain, SettlementConfig};
    use updown_telemetry::EventBus;

    const CID: &str = "0x4a629eb456c10ea56e4819f5b54c6727be8010b03c31375fed5b9f100f0dee53";

    fn book() -> (ClaimBook, Arc<AccountExposure>) {
        let settlement = SettlementConfig {
            holding_wallet: Some("0x5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a".to_string()),
            ..SettlementConfig::default()
        };
        let chain = Arc::new(MockChain::new());
        let router = RedemptionRouter::new(
            settlement.router_config(137).unwrap().unwrap(),
            chain.clone(),
            chain,
            Arc::new(KeyManager::without_key()),
            EventBus::default(),
        );
        let account = Arc::new(AccountExposure::new(dec!(10)));
        (ClaimBook::new(Arc::new(router), account.clone()), account)
    }

    fn summary(held: Decimal, held_notional: Decimal) -> CycleSummary {
        CycleSummary {
            window: MarketWindow {
                cycle: CycleId(4),
                slug: "eth-updown-15m-test".to_string(),
                token_id: TokenId::new("1234567890").unwrap(),
                condition_id: ConditionId::parse(CID).unwrap(),
                outcome_index: 1,
                opens_at_ms: 0,
                closes_at_ms: 900_000,
            },
            fills: 1,
            realized_pnl: Decimal::ZERO,
            final_state: PositionState::PositionOpen,
            held: Size::new(held),
            held_notional,
            unconfirmed_orders: 0,
            stop_reason: None,
        }
    }

    #[test]
    fn test_flat_cycle_hands_over_nothing() {
        let (claims, account) = book();
        assert!(!claims.hand_over(&summary(Decimal::ZERO, Decimal::ZERO)));
        assert!(claims.router().pending_claims().is_empty());
        assert_eq!(account.total(), Decimal::ZERO);
    }

    #[test]
    fn test_held_exposure_reserved_until_claim_ends() {
        let (claims, account) = book();
        account.transfer(CycleId(4), dec!(2.25));
        assert!(claims.hand_over(&summary(dec!(5), dec!(2.25))));
        assert_eq!(account.total(), dec!(2.25));

        // Unresolved: the claim stays pending and keeps its reservation
        tokio_test::block_on(claims.advance());
        assert_eq!(account.total(), dec!(2.25));

        let cid = ConditionId::parse(CID).unwrap();
        assert!(claims.router().abandon(&cid, "operator"));
        assert_eq!(tokio_test::block_on(claims.advance()), 0);
        assert_eq!(account.total(), Decimal::ZERO);
    }
}
