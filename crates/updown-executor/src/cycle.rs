//! Per-window trading cycle.
//!
//! `MarketCycle` drives one market window through ticks. Each tick:
//!
//! 1. polls venue trades into the fill ledger
//! 2. reads the book
//! 3. runs integrity checks (rejected fills, negative inventory, sanity)
//! 4. on a tripped stop latch: cancels everything, then moves to IDLE,
//!    even when step 1 or 2 failed
//! 5. syncs the state machine with the ledger
//! 6. runs policy checks (exposure ceiling, order count)
//! 7. executes at most one order action, or proposes an entry
//!
//! A tick makes at most one state transition. All remote calls are bounded
//! by the retry policy; a failed tick leaves state untouched for the next.
//!
//! Closing retries cancels for `close_cancel_rounds` rounds. Orders still
//! unconfirmed after that trip the stop latch and keep their exposure
//! reserved on the account.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use updown_core::{
    call_with_retry, with_timeout, ClientOrderId, EngineEvent, ErrorClass, IntentSide,
    MarketWindow, OrderRequest, PositionState, RetryPolicy, Size, TokenId,
};
use updown_position::{
    ActionContext, ExitLadder, FillLedger, IngestOutcome, MachineConfig, OrderAction,
    PositionMachine, RejectReason, TradingMode, Transition, DEFAULT_BOUNDARY_SKEW_MS,
};
use updown_risk::{
    AccountExposure, ExposureGate, ExposureInputs, SanityConfig, SanityMonitor, SanityVerdict,
    StopLatch, StopReason,
};
use updown_telemetry::{EventBus, Metrics};

use crate::book::{BookFeed, BookTop};
use crate::error::{ExecutorError, ExecutorResult};
use crate::regime::RegimeFilter;
use crate::venue::{OrderVenue, RejectKind, SubmitAck};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleConfig {
    /// Shares per entry.
    #[serde(default = "default_entry_size")]
    pub entry_size: Decimal,
    #[serde(default = "default_max_outstanding_orders")]
    pub max_outstanding_orders: usize,
    #[serde(default = "default_entry_ttl_ms")]
    pub entry_ttl_ms: u64,
    /// No new entries this close to the window end.
    #[serde(default = "default_entry_cutoff_ms")]
    pub entry_cutoff_ms: u64,
    #[serde(default = "default_boundary_skew_ms")]
    pub boundary_skew_ms: u64,
    /// Trades older than the newest fill minus this are not re-polled.
    #[serde(default = "default_poll_lookback_ms")]
    pub poll_lookback_ms: u64,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Cancel rounds at close before unconfirmed orders escalate.
    #[serde(default = "default_close_cancel_rounds")]
    pub close_cancel_rounds: u32,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub sanity: SanityConfig,
    /// Observation mode: read and record only, never submit.
    #[serde(skip)]
    pub observe_only: bool,
}

fn default_entry_size() -> Decimal {
    dec!(5)
}

fn default_max_outstanding_orders() -> usize {
    2
}

fn default_entry_ttl_ms() -> u64 {
    updown_position::machine::DEFAULT_ENTRY_TTL_MS
}

fn default_entry_cutoff_ms() -> u64 {
    180_000
}

fn default_boundary_skew_ms() -> u64 {
    DEFAULT_BOUNDARY_SKEW_MS
}

fn default_poll_lookback_ms() -> u64 {
    60_000
}

fn default_tick_interval_ms() -> u64 {
    1_000
}

fn default_close_cancel_rounds() -> u32 {
    5
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            entry_size: default_entry_size(),
            max_outstanding_orders: default_max_outstanding_orders(),
            entry_ttl_ms: default_entry_ttl_ms(),
            entry_cutoff_ms: default_entry_cutoff_ms(),
            boundary_skew_ms: default_boundary_skew_ms(),
            poll_lookback_ms: default_poll_lookback_ms(),
            tick_interval_ms: default_tick_interval_ms(),
            close_cancel_rounds: default_close_cancel_rounds(),
            retry: RetryPolicy::default(),
            sanity: SanityConfig::default(),
            observe_only: false,
        }
    }
}

impl CycleConfig {
    pub fn validate(&self) -> ExecutorResult<()> {
        if self.entry_size <= Decimal::ZERO {
            return Err(ExecutorError::Config(format!(
                "entry_size must be positive, got {}",
                self.entry_size
            )));
        }
        if self.max_outstanding_orders == 0 {
            return Err(ExecutorError::Config(
                "max_outstanding_orders must be at least 1".to_string(),
            ));
        }
        if self.tick_interval_ms == 0 {
            return Err(ExecutorError::Config(
                "tick_interval_ms must be positive".to_string(),
            ));
        }
        if self.close_cancel_rounds == 0 {
            return Err(ExecutorError::Config(
                "close_cancel_rounds must be at least 1".to_string(),
            ));
        }
        self.sanity
            .validate()
            .map_err(|e| ExecutorError::Config(e.to_string()))
    }
}

/// Shared collaborators of every cycle.
#[derive(Clone)]
pub struct CycleDeps {
    pub venue: Arc<dyn OrderVenue>,
    pub feed: Arc<dyn BookFeed>,
    pub regime: Arc<dyn RegimeFilter>,
    pub account: Arc<AccountExposure>,
    pub latch: Arc<StopLatch>,
    pub events: EventBus,
}

/// What a closed cycle leaves behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleSummary {
    pub window: MarketWindow,
    pub fills: usize,
    pub realized_pnl: Decimal,
    pub final_state: PositionState,
    /// Inventory still held, to be redeemed after resolution.
    pub held: Size,
    /// `held` at its average entry price; stays reserved on the account.
    pub held_notional: Decimal,
    /// Orders whose cancel was never confirmed. Their cycle's exposure is
    /// not released.
    pub unconfirmed_orders: usize,
    pub stop_reason: Option<StopReason>,
}

pub struct MarketCycle {
    window: MarketWindow,
    config: CycleConfig,
    ledger: FillLedger,
    machine: PositionMachine,
    gate: ExposureGate,
    sanity: SanityMonitor,
    deps: CycleDeps,
    boundary_ms: u64,
    last_top: Option<BookTop>,
    stop_reason: Option<StopReason>,
    halt_reported: bool,
    published_outstanding: i64,
}

impl MarketCycle {
    pub fn new(
        window: MarketWindow,
        config: CycleConfig,
        ladder: ExitLadder,
        gate: ExposureGate,
        deps: CycleDeps,
    ) -> Self {
        let ledger = FillLedger::new(
            window.cycle,
            window.token_id.clone(),
            window.opens_at_ms,
            config.boundary_skew_ms,
        );
        let machine = PositionMachine::new(
            window.cycle,
            window.token_id.clone(),
            window.closes_at_ms,
            MachineConfig {
                entry_ttl_ms: config.entry_ttl_ms,
            },
            ladder,
        );
        let sanity = SanityMonitor::new(config.sanity.clone());
        let boundary_ms = window.opens_at_ms.saturating_sub(config.boundary_skew_ms);

        info!(
            cycle = %window.cycle,
            slug = %window.slug,
            token = %window.token_id.short(),
            observe_only = config.observe_only,
            "Cycle started"
        );

        Self {
            window,
            config,
            ledger,
            machine,
            gate,
            sanity,
            deps,
            boundary_ms,
            last_top: None,
            stop_reason: None,
            halt_reported: false,
            published_outstanding: 0,
        }
    }

    pub fn window(&self) -> &MarketWindow {
        &self.window
    }

    pub fn ledger(&self) -> &FillLedger {
        &self.ledger
    }

    pub fn machine(&self) -> &PositionMachine {
        &self.machine
    }

    pub fn state(&self) -> PositionState {
        self.machine.state()
    }

    pub fn mode(&self) -> TradingMode {
        self.machine.mode()
    }

    pub fn stop_reason(&self) -> Option<&StopReason> {
        self.stop_reason.as_ref()
    }

    fn token(&self) -> TokenId {
        self.window.token_id.clone()
    }

    /// Run one tick. Returns the transition made, if any.
    pub async fn tick(&mut self, now_ms: u64) -> ExecutorResult<Option<Transition>> {
        let ingested = self.ingest_trades().await;
        let top = self.read_book().await;
        if let Ok(top) = &top {
            self.last_top = Some(*top);
        }
        self.check_integrity(now_ms).await;

        // Stopping never waits on market data
        if self.deps.latch.is_triggered() {
            if let Err(e) = ingested.as_ref().and(top.as_ref()) {
                warn!(cycle = %self.window.cycle, error = %e, "Halting with stale data");
            }
            let result = self.halt(now_ms).await;
            if let Some(top) = self.last_top {
                self.publish_exposure(&top);
            }
            return result;
        }

        ingested?;
        let top = top?;

        let synced = self.machine.sync_with_ledger(&self.ledger.snapshot(), now_ms);
        if let Some(t) = &synced {
            self.publish_transition(t);
        }
        self.check_policy(&top);

        let result = if synced.is_some() || self.config.observe_only {
            Ok(synced)
        } else {
            self.act(&top, now_ms).await
        };
        self.publish_exposure(&top);
        result
    }

    /// Close the window: cancel everything, take a final fill read and
    /// publish the cycle summary.
    ///
    /// The cycle's account reservation becomes the notional it still holds.
    /// If some cancel is never confirmed the reservation is left as it was,
    /// the stop latch trips and the summary reports the orders.
    pub async fn close(&mut self, now_ms: u64) -> CycleSummary {
        let cycle = self.window.cycle;
        let mut cancels = self.machine.close_window();
        for round in 1..=self.config.close_cancel_rounds {
            for action in cancels {
                if let OrderAction::Cancel { side, client_id } = action {
                    if let Err(e) = self.cancel(side, client_id, now_ms).await {
                        warn!(cycle = %cycle, round, error = %e, "Cancel at window close failed");
                    }
                }
            }
            cancels = self.machine.pending_cancels();
            if cancels.is_empty() {
                break;
            }
            if round < self.config.close_cancel_rounds {
                tokio::time::sleep(Duration::from_millis(self.config.retry.max_delay_ms)).await;
            }
        }

        if let Err(e) = self.ingest_trades().await {
            warn!(cycle = %cycle, error = %e, "Final fill poll failed");
        }
        if let Some(t) = self.machine.sync_with_ledger(&self.ledger.snapshot(), now_ms) {
            self.publish_transition(&t);
        }

        let held = self.ledger.held_size();
        let held_notional = self
            .ledger
            .avg_entry_price()
            .map_or(Decimal::ZERO, |price| held.notional(price));
        let unconfirmed = self.machine.pending_cancels();
        let unconfirmed_orders = unconfirmed.len();
        if unconfirmed.is_empty() {
            let total = self.deps.account.transfer(cycle, held_notional);
            Metrics::account_exposure(total);
        } else {
            let client_ids: Vec<ClientOrderId> = unconfirmed
                .into_iter()
                .filter_map(|action| match action {
                    OrderAction::Cancel { client_id, .. } => Some(client_id),
                    OrderAction::Submit(_) => None,
                })
                .collect();
            warn!(
                cycle = %cycle,
                orders = client_ids.len(),
                "Orders may still rest after close, keeping exposure reserved"
            );
            self.deps.events.publish(EngineEvent::CancelUnconfirmed {
                cycle,
                client_ids: client_ids.clone(),
            });
            self.trip(StopReason::CancelUnconfirmed {
                count: client_ids.len(),
            });
        }
        let outstanding = self.machine.outstanding_count() as i64;
        Metrics::orders_outstanding_delta(outstanding - self.published_outstanding);
        self.published_outstanding = outstanding;

        let summary = CycleSummary {
            window: self.window.clone(),
            fills: self.ledger.fill_count(),
            realized_pnl: self.ledger.realized_pnl(),
            final_state: self.machine.state(),
            held,
            held_notional,
            unconfirmed_orders,
            stop_reason: self.stop_reason.clone(),
        };
        info!(
            cycle = %cycle,
            fills = summary.fills,
            realized_pnl = %summary.realized_pnl,
            final_state = %summary.final_state,
            held = %summary.held,
            unconfirmed_orders = summary.unconfirmed_orders,
            stop_reason = ?summary.stop_reason,
            "Cycle closed"
        );
        self.deps.events.publish(EngineEvent::CycleClosed {
            cycle,
            fills: summary.fills,
            realized_pnl: summary.realized_pnl,
            final_state: summary.final_state,
            stop_reason: summary.stop_reason.as_ref().map(ToString::to_string),
        });
        summary
    }

    async fn ingest_trades(&mut self) -> ExecutorResult<()> {
        let since = self
            .ledger
            .last_fill()
            .map(|f| f.observed_at_ms.saturating_sub(self.config.poll_lookback_ms))
            .unwrap_or(0)
            .max(self.boundary_ms);
        let venue = Arc::clone(&self.deps.venue);
        let token = self.token();

        let started = Instant::now();
        let trades = call_with_retry("poll_trades", &self.config.retry, || {
            venue.poll_trades(token.clone(), since)
        })
        .await;
        Metrics::remote_call("poll_trades", started.elapsed().as_secs_f64() * 1000.0);
        let trades = trades?;

        let cycle = self.window.cycle;
        for trade in &trades {
            match self.ledger.ingest(trade) {
                IngestOutcome::Applied(fill) => {
                    self.deps.events.publish(EngineEvent::FillApplied {
                        cycle,
                        tx_id: fill.unique_tx_id,
                        side: fill.side,
                        size: fill.size,
                        price: fill.price,
                        inventory: self.ledger.current_inventory(),
                    });
                }
                IngestOutcome::Duplicate(tx_id) => {
                    self.deps
                        .events
                        .publish(EngineEvent::FillDuplicate { cycle, tx_id });
                }
                IngestOutcome::Ignored(reason) => {
                    self.deps.events.publish(EngineEvent::FillIgnored {
                        cycle,
                        reason: reason.to_string(),
                    });
                }
                IngestOutcome::Rejected(reason) => {
                    self.deps.events.publish(EngineEvent::FillRejected {
                        cycle,
                        reason: reason.to_string(),
                    });
                    let stop = match reason {
                        RejectReason::UntrustedTxId(detail) => StopReason::UntrustedFill { detail },
                        other => StopReason::MalformedFill {
                            detail: other.to_string(),
                        },
                    };
                    self.trip(stop);
                }
            }
        }
        Ok(())
    }

    async fn read_book(&self) -> ExecutorResult<BookTop> {
        let feed = Arc::clone(&self.deps.feed);
        let token = self.token();
        let top = call_with_retry("book_top", &self.config.retry, || feed.top(token.clone())).await?;
        Ok(top)
    }

    /// Data-integrity checks. Any failure trips the shared latch.
    async fn check_integrity(&mut self, now_ms: u64) {
        let inventory = self.ledger.current_inventory();
        if inventory < Decimal::ZERO {
            self.trip(StopReason::NegativeInventory { inventory });
        }

        let venue = Arc::clone(&self.deps.venue);
        let token = self.token();
        let reported = match call_with_retry("reported_position", &self.config.retry, || {
            venue.reported_position(token.clone())
        })
        .await
        {
            Ok(reported) => reported,
            Err(e) => {
                debug!(cycle = %self.window.cycle, error = %e, "No reported position this tick");
                None
            }
        };

        match self
            .sanity
            .observe(reported, inventory, self.ledger.version(), now_ms)
        {
            SanityVerdict::Alert { consecutive } => {
                self.deps.events.publish(EngineEvent::SanityAlert {
                    cycle: self.window.cycle,
                    reported,
                    ledger: inventory,
                    consecutive,
                });
            }
            SanityVerdict::Flapping { changes } => {
                self.trip(StopReason::SanityFlapping { changes });
            }
            SanityVerdict::Consistent | SanityVerdict::Mismatch { .. } => {}
        }
    }

    /// Policy checks. A breach restricts this cycle to exits.
    fn check_policy(&mut self, top: &BookTop) {
        let inputs = self.exposure_inputs(top);
        if self.gate.is_breached(&inputs) {
            self.restrict(StopReason::ExposureBreach {
                exposure: self.gate.projected(&inputs),
                ceiling: self.gate.ceiling(),
            });
        }

        let count = self.machine.outstanding_count();
        if count > self.config.max_outstanding_orders {
            self.restrict(StopReason::OrderCountExceeded {
                count,
                max: self.config.max_outstanding_orders,
            });
        }
    }

    fn trip(&mut self, reason: StopReason) {
        if self.stop_reason.is_none() {
            self.stop_reason = Some(reason.clone());
        }
        self.deps.latch.trigger(reason);
    }

    fn restrict(&mut self, reason: StopReason) {
        if self.machine.mode() != TradingMode::Normal {
            return;
        }
        warn!(cycle = %self.window.cycle, reason = %reason, "Entering exit-only mode");
        self.deps.events.publish(EngineEvent::ExitOnly {
            cycle: self.window.cycle,
            reason: reason.label().to_string(),
        });
        self.machine.stop(TradingMode::ExitOnly);
        if self.stop_reason.is_none() {
            self.stop_reason = Some(reason);
        }
    }

    /// Cancel every outstanding order, then move to IDLE.
    async fn halt(&mut self, now_ms: u64) -> ExecutorResult<Option<Transition>> {
        if !self.halt_reported {
            self.halt_reported = true;
            let reason = self.deps.latch.reason();
            if self.stop_reason.is_none() {
                self.stop_reason = reason.clone();
            }
            self.deps.events.publish(EngineEvent::StopTriggered {
                cycle: self.window.cycle,
                class: reason
                    .as_ref()
                    .map(StopReason::class)
                    .unwrap_or(ErrorClass::DataIntegrity),
                reason: reason
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "stop latch triggered".to_string()),
            });
        }

        let mut failed = None;
        for action in self.machine.stop(TradingMode::Halted) {
            if let OrderAction::Cancel { side, client_id } = action {
                if let Err(e) = self.cancel(side, client_id, now_ms).await {
                    failed = Some(e);
                }
            }
        }
        // The transition waits until every cancel has been confirmed
        if let Some(e) = failed {
            return Err(e);
        }

        let transition = self.machine.finish_stop(now_ms);
        if let Some(t) = &transition {
            self.publish_transition(t);
        }
        Ok(transition)
    }

    async fn act(&mut self, top: &BookTop, now_ms: u64) -> ExecutorResult<Option<Transition>> {
        let ctx = ActionContext {
            now_ms,
            best_bid: top.best_bid,
            inventory: self.ledger.current_inventory(),
        };
        match self.machine.next_action(&ctx) {
            Some(OrderAction::Submit(request)) => self.submit(request, now_ms).await,
            Some(OrderAction::Cancel { side, client_id }) => {
                self.cancel(side, client_id, now_ms).await
            }
            None => self.maybe_enter(top, now_ms).await,
        }
    }

    async fn maybe_enter(
        &mut self,
        top: &BookTop,
        now_ms: u64,
    ) -> ExecutorResult<Option<Transition>> {
        if self.machine.mode() != TradingMode::Normal
            || self.machine.is_closed()
            || self.machine.state() != PositionState::Idle
            || now_ms < self.window.opens_at_ms
            || self.window.remaining_ms(now_ms) <= self.config.entry_cutoff_ms
        {
            return Ok(None);
        }
        let Some(ask) = top.best_ask else {
            return Ok(None);
        };

        let volatility = match self.deps.feed.recent_volatility(self.token()).await {
            Ok(v) => v,
            Err(e) => {
                debug!(cycle = %self.window.cycle, error = %e, "Volatility unavailable");
                None
            }
        };
        if let Err(reason) = self.deps.regime.permits(top, volatility) {
            Metrics::gate_blocked("regime");
            debug!(cycle = %self.window.cycle, %reason, "Regime filter blocks entry");
            return Ok(None);
        }

        let size = Size::new(self.config.entry_size);
        let inputs = self.exposure_inputs(top);
        if let Err(block) = self.gate.check_entry(&inputs, size, ask) {
            Metrics::gate_blocked(block.gate());
            debug!(cycle = %self.window.cycle, %block, "Exposure gate blocks entry");
            return Ok(None);
        }
        let current = self.gate.projected(&inputs);
        if !self
            .deps
            .account
            .try_reserve(self.window.cycle, current, size.notional(ask))
        {
            Metrics::gate_blocked("account_ceiling");
            return Ok(None);
        }

        match self.machine.plan_entry(size, ask, now_ms)? {
            OrderAction::Submit(request) => self.submit(request, now_ms).await,
            OrderAction::Cancel { side, client_id } => self.cancel(side, client_id, now_ms).await,
        }
    }

    /// Single timed attempt. A transient failure leaves the slot in
    /// `Submitting`; the next tick re-sends the same client id.
    async fn submit(
        &mut self,
        request: OrderRequest,
        now_ms: u64,
    ) -> ExecutorResult<Option<Transition>> {
        let cycle = self.window.cycle;
        let side = request.side;
        let client_id = request.client_id.clone();
        self.deps.events.publish(EngineEvent::OrderSubmitted {
            cycle,
            client_id: client_id.clone(),
            side,
            size: request.size,
            limit_price: request.limit_price,
        });

        let started = Instant::now();
        let result = with_timeout(
            self.config.retry.timeout_ms,
            self.deps.venue.submit(request),
        )
        .await;
        Metrics::remote_call("submit", started.elapsed().as_secs_f64() * 1000.0);

        match result {
            Ok(SubmitAck::Accepted(venue_id)) => {
                self.deps.events.publish(EngineEvent::OrderAccepted {
                    cycle,
                    client_id,
                    venue_id: venue_id.clone(),
                    side,
                });
                let transition = self.machine.on_submit_accepted(
                    side,
                    venue_id,
                    self.ledger.current_inventory(),
                    now_ms,
                );
                if let Some(t) = &transition {
                    self.publish_transition(t);
                }
                Ok(transition)
            }
            Ok(SubmitAck::Rejected { kind, reason }) => {
                self.deps.events.publish(EngineEvent::OrderRejected {
                    cycle,
                    client_id,
                    side,
                    reason: reason.clone(),
                });
                self.machine.on_submit_rejected(side, &reason);
                if side == IntentSide::Exit && kind == RejectKind::BalanceOrAllowance {
                    self.trip(StopReason::ExitBalanceError { detail: reason });
                    return self.halt(now_ms).await;
                }
                Ok(None)
            }
            Err(e) if e.is_transient() => {
                warn!(
                    cycle = %cycle,
                    client_id = %client_id,
                    error = %e,
                    "Submit failed, will re-send with the same client id"
                );
                Err(e.into())
            }
            Err(e) => {
                self.deps.events.publish(EngineEvent::OrderRejected {
                    cycle,
                    client_id,
                    side,
                    reason: e.to_string(),
                });
                self.machine.on_submit_rejected(side, &e.to_string());
                Err(e.into())
            }
        }
    }

    async fn cancel(
        &mut self,
        side: IntentSide,
        client_id: ClientOrderId,
        now_ms: u64,
    ) -> ExecutorResult<Option<Transition>> {
        let venue = Arc::clone(&self.deps.venue);
        let started = Instant::now();
        let ack = call_with_retry("cancel", &self.config.retry, || {
            venue.cancel(client_id.clone())
        })
        .await;
        Metrics::remote_call("cancel", started.elapsed().as_secs_f64() * 1000.0);
        let ack = ack?;

        debug!(cycle = %self.window.cycle, client_id = %client_id, ?ack, "Cancel confirmed");
        self.deps.events.publish(EngineEvent::OrderCancelled {
            cycle: self.window.cycle,
            client_id,
            side,
        });
        let transition =
            self.machine
                .on_cancel_confirmed(side, self.ledger.current_inventory(), now_ms);
        if let Some(t) = &transition {
            self.publish_transition(t);
        }
        Ok(transition)
    }

    fn exposure_inputs(&self, top: &BookTop) -> ExposureInputs {
        ExposureInputs {
            inventory: self.ledger.current_inventory(),
            reference_price: top.best_bid,
            avg_entry_price: self.ledger.avg_entry_price(),
            entry_outstanding: self.machine.has_outstanding_entry(),
            outstanding_entry_notional: self.machine.outstanding_entry_notional(),
        }
    }

    fn publish_exposure(&mut self, top: &BookTop) {
        let projected = self.gate.projected(&self.exposure_inputs(top));
        self.deps.account.publish(self.window.cycle, projected);
        Metrics::account_exposure(self.deps.account.total());

        let outstanding = self.machine.outstanding_count() as i64;
        Metrics::orders_outstanding_delta(outstanding - self.published_outstanding);
        self.published_outstanding = outstanding;
    }

    fn publish_transition(&self, t: &Transition) {
        self.deps.events.publish(EngineEvent::Transition {
            cycle: self.window.cycle,
            from: t.from,
            to: t.to,
            trigger: t.trigger.to_string(),
            at_ms: t.at_ms,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::MockBookFeed;
    use crate::error::VenueError;
    use crate::regime::AlwaysPermit;
    use crate::venue::{MockVenue, VenueCall};
    use updown_core::{ConditionId, CycleId, RawFillEvent, TradeSide};

    const OPEN_MS: u64 = 1_700_000_000_000;
    const CLOSE_MS: u64 = OPEN_MS + 900_000;

    struct Harness {
        cycle: MarketCycle,
        venue: Arc<MockVenue>,
        feed: Arc<MockBookFeed>,
        account: Arc<AccountExposure>,
        latch: Arc<StopLatch>,
        events: EventBus,
    }

    fn window() -> MarketWindow {
        MarketWindow {
            cycle: CycleId(1),
            slug: "btc-updown-15m-test".to_string(),
            token_id: TokenId::new(
                "71321045679252212594626385532706912750332728571942532289631379312455583992563",
            )
            .unwrap(),
            condition_id: ConditionId::parse(
                "0x4a629eb456c10ea56e4819f5b54c6727be8010b03c31375fed5b9f100f0dee53",
            )
            .unwrap(),
            outcome_index: 0,
            opens_at_ms: OPEN_MS,
            closes_at_ms: CLOSE_MS,
        }
    }

    fn harness(config: CycleConfig) -> Harness {
        let venue = Arc::new(MockVenue::new());
        let feed = Arc::new(MockBookFeed::new(dec!(0.44), dec!(0.45)));
        let latch = Arc::new(StopLatch::new());
        let events = EventBus::default();
        let account = Arc::new(AccountExposure::new(dec!(10)));
        let deps = CycleDeps {
            venue: venue.clone(),
            feed: feed.clone(),
            regime: Arc::new(AlwaysPermit),
            account: account.clone(),
            latch: latch.clone(),
            events: events.clone(),
        };
        let cycle = MarketCycle::new(
            window(),
            config,
            ExitLadder::default(),
            ExposureGate::new(dec!(2.50)).unwrap(),
            deps,
        );
        Harness {
            cycle,
            venue,
            feed,
            account,
            latch,
            events,
        }
    }

    fn fast_config() -> CycleConfig {
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

    fn trade(
        tx_id: Option<&str>,
        side: TradeSide,
        size: Decimal,
        price: Decimal,
        at: u64,
    ) -> RawFillEvent {
        RawFillEvent {
            tx_id: tx_id.map(str::to_string),
            token_id: window().token_id,
            side,
            size: Size::new(size),
            price: updown_core::Price::new(price),
            timestamp_ms: at,
        }
    }

    #[tokio::test]
    async fn test_entry_then_gate_blocks_second() {
        let mut h = harness(fast_config());

        let t = h.cycle.tick(OPEN_MS + 1_000).await.unwrap().unwrap();
        assert_eq!(t.to, PositionState::EntryPending);
        assert_eq!(h.venue.submits().len(), 1);
        assert_eq!(h.venue.submits()[0].size, Size::new(dec!(5)));

        assert!(h.cycle.tick(OPEN_MS + 2_000).await.unwrap().is_none());
        assert_eq!(h.venue.submits().len(), 1);
    }

    #[tokio::test]
    async fn test_untrusted_fill_cancels_before_transition() {
        let mut h = harness(fast_config());
        let mut rx = h.events.subscribe();
        h.cycle.tick(OPEN_MS + 1_000).await.unwrap();

        h.venue.push_trade(trade(
            Some("unknown"),
            TradeSide::Buy,
            dec!(5),
            dec!(0.45),
            OPEN_MS + 1_500,
        ));
        let t = h.cycle.tick(OPEN_MS + 2_000).await.unwrap().unwrap();
        assert_eq!(t.to, PositionState::Idle);
        assert!(h.latch.is_triggered());
        assert_eq!(h.cycle.mode(), TradingMode::Halted);
        assert_eq!(h.cycle.ledger().fill_count(), 0);
        assert!(matches!(h.venue.calls().last(), Some(VenueCall::Cancel(_))));

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind());
        }
        let cancelled = kinds.iter().position(|k| *k == "order_cancelled").unwrap();
        let stopped = kinds.iter().rposition(|k| *k == "transition").unwrap();
        assert!(kinds.contains(&"fill_rejected"));
        assert!(kinds.contains(&"stop_triggered"));
        assert!(cancelled < stopped);
    }

    #[tokio::test]
    async fn test_observation_mode_never_submits() {
        let mut h = harness(CycleConfig {
            observe_only: true,
            ..fast_config()
        });
        for i in 1..5 {
            h.cycle.tick(OPEN_MS + i * 1_000).await.unwrap();
        }
        assert!(h.venue.calls().is_empty());
        assert_eq!(h.cycle.state(), PositionState::Idle);
    }

    #[tokio::test]
    async fn test_transient_submit_resent_with_same_id() {
        let mut h = harness(fast_config());
        h.venue.push_submit_result(Err(VenueError::Timeout(100)));

        assert!(h.cycle.tick(OPEN_MS + 1_000).await.is_err());
        assert_eq!(h.cycle.state(), PositionState::Idle);

        let t = h.cycle.tick(OPEN_MS + 2_000).await.unwrap().unwrap();
        assert_eq!(t.to, PositionState::EntryPending);
        let submits = h.venue.submits();
        assert_eq!(submits.len(), 2);
        assert_eq!(submits[0].client_id, submits[1].client_id);
    }

    #[tokio::test]
    async fn test_exit_balance_error_halts() {
        let mut h = harness(fast_config());
        h.cycle.tick(OPEN_MS + 1_000).await.unwrap();
        h.venue.push_trade(trade(
            Some("0xfeedfacecafebeef01"),
            TradeSide::Buy,
            dec!(5),
            dec!(0.45),
            OPEN_MS + 1_500,
        ));
        let t = h.cycle.tick(OPEN_MS + 2_000).await.unwrap().unwrap();
        assert_eq!(t.to, PositionState::PositionOpen);

        h.venue.push_submit_result(Ok(SubmitAck::Rejected {
            kind: RejectKind::BalanceOrAllowance,
            reason: "not enough balance / allowance".to_string(),
        }));
        h.cycle.tick(OPEN_MS + 3_000).await.unwrap();
        assert!(h.latch.is_triggered());
        assert_eq!(h.cycle.mode(), TradingMode::Halted);
        assert!(matches!(
            h.cycle.stop_reason(),
            Some(StopReason::ExitBalanceError { .. })
        ));
        // Inventory stays in the ledger for redemption
        assert_eq!(h.cycle.ledger().held_size(), Size::new(dec!(5)));
    }

    #[tokio::test]
    async fn test_exposure_breach_goes_exit_only() {
        let mut h = harness(fast_config());
        h.cycle.tick(OPEN_MS + 1_000).await.unwrap();
        h.venue.push_trade(trade(
            Some("0xfeedfacecafebeef01"),
            TradeSide::Buy,
            dec!(5),
            dec!(0.45),
            OPEN_MS + 1_500,
        ));
        h.cycle.tick(OPEN_MS + 2_000).await.unwrap();

        // 5 * 0.60 = 3.00 > 2.50
        h.feed.set_top(dec!(0.60), dec!(0.61));
        h.cycle.tick(OPEN_MS + 3_000).await.unwrap();
        assert_eq!(h.cycle.mode(), TradingMode::ExitOnly);
        assert!(!h.latch.is_triggered());
        let last = h.venue.submits().last().cloned().unwrap();
        assert_eq!(last.side, IntentSide::Exit);
    }

    #[tokio::test]
    async fn test_close_reports_held_inventory() {
        let mut h = harness(fast_config());
        h.cycle.tick(OPEN_MS + 1_000).await.unwrap();
        h.venue.push_trade(trade(
            Some("0xfeedfacecafebeef01"),
            TradeSide::Buy,
            dec!(5),
            dec!(0.45),
            OPEN_MS + 1_500,
        ));
        h.cycle.tick(OPEN_MS + 2_000).await.unwrap();

        let summary = h.cycle.close(CLOSE_MS).await;
        assert_eq!(summary.fills, 1);
        assert_eq!(summary.held, Size::new(dec!(5)));
        assert_eq!(summary.final_state, PositionState::PositionOpen);
        // Held inventory stays reserved at cost
        assert_eq!(summary.held_notional, dec!(2.25));
        assert_eq!(h.account.total(), dec!(2.25));
    }

    fn kinds(rx: &mut tokio::sync::broadcast::Receiver<EngineEvent>) -> Vec<&'static str> {
        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind());
        }
        kinds
    }

    #[tokio::test]
    async fn test_stop_cancels_while_book_feed_down() {
        let mut h = harness(fast_config());
        h.cycle.tick(OPEN_MS + 1_000).await.unwrap();
        assert_eq!(h.cycle.state(), PositionState::EntryPending);

        h.latch.trigger(StopReason::Manual {
            message: "operator".to_string(),
        });
        h.feed.set_down(Some(VenueError::Timeout(100)));
        for i in 2..6 {
            let _ = h.cycle.tick(OPEN_MS + i * 1_000).await;
        }

        assert_eq!(h.venue.cancels().len(), 1);
        assert_eq!(h.cycle.mode(), TradingMode::Halted);
        assert_eq!(h.cycle.state(), PositionState::Idle);
        assert_eq!(h.cycle.machine().outstanding_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_cancels_while_trade_poll_down() {
        let mut h = harness(fast_config());
        h.cycle.tick(OPEN_MS + 1_000).await.unwrap();

        h.latch.trigger(StopReason::Manual {
            message: "operator".to_string(),
        });
        h.venue.set_trades_down(Some(VenueError::Transport("reset".to_string())));
        let t = h.cycle.tick(OPEN_MS + 2_000).await.unwrap().unwrap();

        assert_eq!(t.to, PositionState::Idle);
        assert_eq!(h.venue.cancels().len(), 1);
        assert_eq!(h.cycle.mode(), TradingMode::Halted);
    }

    #[tokio::test]
    async fn test_rejected_fill_halts_same_tick_without_book() {
        let mut h = harness(fast_config());
        h.cycle.tick(OPEN_MS + 1_000).await.unwrap();

        h.venue.push_trade(trade(
            Some("unknown"),
            TradeSide::Buy,
            dec!(5),
            dec!(0.45),
            OPEN_MS + 1_500,
        ));
        h.feed.set_down(Some(VenueError::Timeout(100)));
        let t = h.cycle.tick(OPEN_MS + 2_000).await.unwrap().unwrap();

        assert_eq!(t.to, PositionState::Idle);
        assert!(h.latch.is_triggered());
        assert_eq!(h.venue.cancels().len(), 1);
        assert!(matches!(
            h.cycle.stop_reason(),
            Some(StopReason::UntrustedFill { .. })
        ));
    }

    #[tokio::test]
    async fn test_close_retries_failed_cancel() {
        let mut h = harness(fast_config());
        h.cycle.tick(OPEN_MS + 1_000).await.unwrap();
        assert_eq!(h.account.total(), dec!(2.25));

        // Both attempts of the first round time out
        h.venue.push_cancel_result(Err(VenueError::Timeout(100)));
        h.venue.push_cancel_result(Err(VenueError::Timeout(100)));
        let summary = h.cycle.close(CLOSE_MS).await;

        assert_eq!(h.venue.cancels().len(), 3);
        assert_eq!(summary.unconfirmed_orders, 0);
        assert_eq!(summary.final_state, PositionState::Idle);
        assert!(h.cycle.machine().slot(IntentSide::Entry).is_none());
        assert!(!h.latch.is_triggered());
        assert_eq!(h.account.total(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_close_escalates_unconfirmed_cancel() {
        let mut h = harness(CycleConfig {
            close_cancel_rounds: 2,
            ..fast_config()
        });
        let mut rx = h.events.subscribe();
        h.cycle.tick(OPEN_MS + 1_000).await.unwrap();
        for _ in 0..4 {
            h.venue.push_cancel_result(Err(VenueError::Timeout(100)));
        }

        let summary = h.cycle.close(CLOSE_MS).await;
        assert_eq!(h.venue.cancels().len(), 4);
        assert_eq!(summary.unconfirmed_orders, 1);
        assert!(h.cycle.machine().slot(IntentSide::Entry).is_some());
        assert!(h.latch.is_triggered());
        assert!(matches!(
            summary.stop_reason,
            Some(StopReason::CancelUnconfirmed { count: 1 })
        ));
        // The resting entry keeps its reservation
        assert_eq!(h.account.total(), dec!(2.25));
        assert!(kinds(&mut rx).contains(&"cancel_unconfirmed"));
    }
}
