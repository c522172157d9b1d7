//! Window-level flows across ledger, state machine and gates.

use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use updown_core::{
    ConditionId, CycleId, IntentSide, MarketWindow, PositionState, Price, RawFillEvent,
    RetryPolicy, Size, TokenId, TradeSide,
};
use updown_executor::{
    AlwaysPermit, CycleConfig, CycleDeps, MarketCycle, MockBookFeed, MockVenue, VenueCall,
    VenueError,
};
use updown_position::{ExitLadder, TradingMode};
use updown_risk::{AccountExposure, ExposureGate, StopLatch, StopReason};
use updown_telemetry::EventBus;

const OPEN_MS: u64 = 1_760_000_000_000;
const CLOSE_MS: u64 = OPEN_MS + 900_000;
const TOKEN: &str = "71321045679252212594626385532706912750332728571942532289631379312455583992563";

fn window(cycle: u64) -> MarketWindow {
    MarketWindow {
        cycle: CycleId(cycle),
        slug: format!("btc-updown-15m-{cycle}"),
        token_id: TokenId::new(TOKEN).unwrap(),
        condition_id: ConditionId::parse(
            "0x4a629eb456c10ea56e4819f5b54c6727be8010b03c31375fed5b9f100f0dee53",
        )
        .unwrap(),
        outcome_index: 0,
        opens_at_ms: OPEN_MS,
        closes_at_ms: CLOSE_MS,
    }
}

fn config() -> CycleConfig {
    CycleConfig {
        retry: RetryPolicy {
            timeout_ms: 100,
            max_attempts: 2,
            base_delay_ms: 1,
            max_delay_ms: 1,
        },
        ..CycleConfig::default()
    }
}

struct Shared {
    venue: Arc<MockVenue>,
    feed: Arc<MockBookFeed>,
    account: Arc<AccountExposure>,
    latch: Arc<StopLatch>,
    events: EventBus,
}

impl Shared {
    fn new(account_ceiling: Decimal) -> Self {
        Self {
            venue: Arc::new(MockVenue::new()),
            feed: Arc::new(MockBookFeed::new(dec!(0.44), dec!(0.45))),
            account: Arc::new(AccountExposure::new(account_ceiling)),
            latch: Arc::new(StopLatch::new()),
            events: EventBus::default(),
        }
    }

    fn cycle(&self, id: u64) -> MarketCycle {
        let deps = CycleDeps {
            venue: self.venue.clone(),
            feed: self.feed.clone(),
            regime: Arc::new(AlwaysPermit),
            account: self.account.clone(),
            latch: self.latch.clone(),
            events: self.events.clone(),
        };
        MarketCycle::new(
            window(id),
            config(),
            ExitLadder::default(),
            ExposureGate::new(dec!(2.50)).unwrap(),
            deps,
        )
    }
}

fn fill(tx_id: &str, side: TradeSide, size: Decimal, price: Decimal, at: u64) -> RawFillEvent {
    RawFillEvent {
        tx_id: Some(tx_id.to_string()),
        token_id: TokenId::new(TOKEN).unwrap(),
        side,
        size: Size::new(size),
        price: Price::new(price),
        timestamp_ms: at,
    }
}

/// Enter 5 @ 0.45 and get the fill confirmed. Leaves the cycle in
/// `PositionOpen`.
async fn open_position(shared: &Shared, cycle: &mut MarketCycle) {
    let t = cycle.tick(OPEN_MS + 1_000).await.unwrap().unwrap();
    assert_eq!(t.to, PositionState::EntryPending);

    shared.venue.push_trade(fill(
        "0x1f2e3d4c5b6a7988aa01",
        TradeSide::Buy,
        dec!(5),
        dec!(0.45),
        OPEN_MS + 1_500,
    ));
    let t = cycle.tick(OPEN_MS + 2_000).await.unwrap().unwrap();
    assert_eq!(t.to, PositionState::PositionOpen);
}

#[tokio::test]
async fn test_full_round_trip_through_four_states() {
    let shared = Shared::new(dec!(10));
    let mut cycle = shared.cycle(1);
    open_position(&shared, &mut cycle).await;

    let t = cycle.tick(OPEN_MS + 3_000).await.unwrap().unwrap();
    assert_eq!(t.to, PositionState::ExitPending);
    let exit = shared.venue.submits().last().cloned().unwrap();
    assert_eq!(exit.side, IntentSide::Exit);
    assert_eq!(exit.size, Size::new(dec!(5)));
    assert_eq!(exit.limit_price, Price::new(dec!(0.47)));

    shared.venue.push_trade(fill(
        "0x1f2e3d4c5b6a7988aa02",
        TradeSide::Sell,
        dec!(5),
        dec!(0.47),
        OPEN_MS + 3_500,
    ));
    let t = cycle.tick(OPEN_MS + 4_000).await.unwrap().unwrap();
    assert_eq!(t.to, PositionState::Idle);
    assert_eq!(cycle.ledger().current_inventory(), Decimal::ZERO);
    assert_eq!(cycle.ledger().realized_pnl(), dec!(0.10));

    let summary = cycle.close(CLOSE_MS).await;
    assert_eq!(summary.fills, 2);
    assert_eq!(summary.held, Size::new(Decimal::ZERO));
    assert_eq!(shared.account.total(), Decimal::ZERO);
}

#[tokio::test]
async fn test_partial_exit_stays_pending() {
    let shared = Shared::new(dec!(10));
    let mut cycle = shared.cycle(1);
    open_position(&shared, &mut cycle).await;
    cycle.tick(OPEN_MS + 3_000).await.unwrap();
    assert_eq!(cycle.state(), PositionState::ExitPending);

    shared.venue.push_trade(fill(
        "0x1f2e3d4c5b6a7988aa02",
        TradeSide::Sell,
        dec!(3),
        dec!(0.47),
        OPEN_MS + 3_500,
    ));
    assert!(cycle.tick(OPEN_MS + 4_000).await.unwrap().is_none());
    assert_eq!(cycle.state(), PositionState::ExitPending);
    assert_eq!(cycle.ledger().current_inventory(), dec!(2));
}

#[tokio::test]
async fn test_replayed_fill_applies_once() {
    let shared = Shared::new(dec!(10));
    let mut cycle = shared.cycle(1);
    open_position(&shared, &mut cycle).await;

    // The venue reports the same trade again on later polls
    shared.venue.push_trade(fill(
        "0x1f2e3d4c5b6a7988aa01",
        TradeSide::Buy,
        dec!(5),
        dec!(0.45),
        OPEN_MS + 1_500,
    ));
    cycle.tick(OPEN_MS + 3_000).await.unwrap();
    cycle.tick(OPEN_MS + 4_000).await.unwrap();

    assert_eq!(cycle.ledger().fill_count(), 1);
    assert_eq!(cycle.ledger().current_inventory(), dec!(5));
    assert!(!shared.latch.is_triggered());
}

#[tokio::test]
async fn test_account_ceiling_spans_cycles() {
    // Each cycle may hold 2.25; two together exceed 4
    let shared = Shared::new(dec!(4));
    let mut first = shared.cycle(1);
    let mut second = shared.cycle(2);

    let t = first.tick(OPEN_MS + 1_000).await.unwrap().unwrap();
    assert_eq!(t.to, PositionState::EntryPending);
    assert!(second.tick(OPEN_MS + 1_000).await.unwrap().is_none());
    assert_eq!(second.state(), PositionState::Idle);
    assert_eq!(shared.venue.submits().len(), 1);

    // Closing the first cycle frees its reservation
    first.close(CLOSE_MS - 300_000).await;
    let t = second.tick(OPEN_MS + 2_000).await.unwrap().unwrap();
    assert_eq!(t.to, PositionState::EntryPending);
}

#[tokio::test]
async fn test_untrusted_fill_halts_every_cycle() {
    let shared = Shared::new(dec!(10));
    let mut first = shared.cycle(1);
    let mut second = shared.cycle(2);
    first.tick(OPEN_MS + 1_000).await.unwrap();

    shared.venue.push_trade(fill(
        "unknown",
        TradeSide::Buy,
        dec!(5),
        dec!(0.45),
        OPEN_MS + 1_500,
    ));
    first.tick(OPEN_MS + 2_000).await.unwrap();
    assert!(shared.latch.is_triggered());
    assert_eq!(first.mode(), TradingMode::Halted);
    assert_eq!(first.ledger().fill_count(), 0);
    assert!(shared
        .venue
        .calls()
        .iter()
        .any(|c| matches!(c, VenueCall::Cancel(_))));

    let submits_before = shared.venue.submits().len();
    second.tick(OPEN_MS + 3_000).await.unwrap();
    assert_eq!(second.mode(), TradingMode::Halted);
    assert_eq!(shared.venue.submits().len(), submits_before);
}

#[tokio::test]
async fn test_unconfirmed_cancel_at_close_blocks_other_cycles() {
    let shared = Shared::new(dec!(4));
    let mut first = shared.cycle(1);
    let mut second = shared.cycle(2);
    first.tick(OPEN_MS + 1_000).await.unwrap();
    assert_eq!(first.state(), PositionState::EntryPending);

    // Every cancel attempt of every round fails
    let rounds = config().close_cancel_rounds as usize;
    for _ in 0..rounds * 2 {
        shared
            .venue
            .push_cancel_result(Err(VenueError::Timeout(100)));
    }
    let summary = first.close(CLOSE_MS - 300_000).await;
    assert_eq!(summary.unconfirmed_orders, 1);
    assert_eq!(shared.venue.cancels().len(), rounds * 2);
    assert!(matches!(
        shared.latch.reason(),
        Some(StopReason::CancelUnconfirmed { count: 1 })
    ));

    // The order may still rest: its notional stays on the account and no
    // other cycle trades
    assert_eq!(shared.account.total(), dec!(2.25));
    second.tick(OPEN_MS + 2_000).await.unwrap();
    assert_eq!(second.mode(), TradingMode::Halted);
    assert_eq!(shared.venue.submits().len(), 1);
}

#[tokio::test]
async fn test_halt_reaches_venue_while_book_feed_down() {
    let shared = Shared::new(dec!(10));
    let mut first = shared.cycle(1);
    let mut second = shared.cycle(2);
    first.tick(OPEN_MS + 1_000).await.unwrap();
    second.tick(OPEN_MS + 1_000).await.unwrap();
    assert_eq!(shared.venue.submits().len(), 2);

    shared.feed.set_down(Some(VenueError::Timeout(100)));
    shared.latch.trigger(StopReason::Manual {
        message: "operator".to_string(),
    });
    for i in 2..6 {
        let _ = first.tick(OPEN_MS + i * 1_000).await;
        let _ = second.tick(OPEN_MS + i * 1_000).await;
    }

    assert_eq!(shared.venue.cancels().len(), 2);
    for cycle in [&first, &second] {
        assert_eq!(cycle.mode(), TradingMode::Halted);
        assert_eq!(cycle.state(), PositionState::Idle);
    }
}
