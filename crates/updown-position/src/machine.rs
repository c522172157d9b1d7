//! Position lifecycle state machine.
//!
//! Owns the position record and the order intents for one market window.
//! Transitions are driven by three inputs only:
//!
//! - venue acknowledgements (`on_submit_accepted`, `on_cancel_confirmed`)
//! - the fill ledger (`sync_with_ledger`)
//! - the stop path (`stop` / `finish_stop`)
//!
//! Inventory always comes from the ledger. A venue-reported position balance
//! never moves the machine.
//!
//! # Order discipline
//!
//! At most one order per side exists at any time. A reprice is always
//! cancel → cancel confirmed → post new; the replacement is only planned
//! once the old slot is gone. Submits that fail transiently stay in
//! `Submitting` and are re-sent with the same client order id.

use std::fmt;

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};

use updown_core::{
    ClientOrderId, CycleId, IntentSide, OrderIntent, OrderRequest, PositionState, Price, Size,
    TokenId, VenueOrderId,
};

use crate::error::{PositionError, PositionResult};
use crate::exit_ladder::{ExitLadder, Rung};
use crate::ledger::InventorySnapshot;

/// Default time an unfilled entry rests before it is cancelled.
pub const DEFAULT_ENTRY_TTL_MS: u64 = 30_000;

/// Trading mode of the cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TradingMode {
    Normal,
    /// Entries cancelled and blocked; exits keep working.
    ExitOnly,
    /// Everything cancelled; the machine no longer follows the ledger.
    Halted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionTrigger {
    EntryAccepted,
    EntryFilledBeforeAck,
    EntryFilled,
    EntryCancelled,
    ExitAccepted,
    ExitCancelled,
    ExitFilled,
    /// Fill arrived after its order was already cancelled.
    LateFill,
    EmergencyStop,
}

impl fmt::Display for TransitionTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::EntryAccepted => "entry_accepted",
            Self::EntryFilledBeforeAck => "entry_filled_before_ack",
            Self::EntryFilled => "entry_filled",
            Self::EntryCancelled => "entry_cancelled",
            Self::ExitAccepted => "exit_accepted",
            Self::ExitCancelled => "exit_cancelled",
            Self::ExitFilled => "exit_filled",
            Self::LateFill => "late_fill",
            Self::EmergencyStop => "emergency_stop",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub from: PositionState,
    pub to: PositionState,
    pub trigger: TransitionTrigger,
    pub at_ms: u64,
}

/// Position record for the current round trip. Reset on return to IDLE.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PositionRecord {
    pub state: PositionState,
    pub entry_price: Option<Price>,
    pub entry_time_ms: Option<u64>,
    pub pending_order_id: Option<ClientOrderId>,
}

impl PositionRecord {
    fn idle() -> Self {
        Self {
            state: PositionState::Idle,
            entry_price: None,
            entry_time_ms: None,
            pending_order_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SlotPhase {
    /// Submit sent (or about to be re-sent), no ack yet.
    Submitting,
    /// Acknowledged by the venue.
    Resting,
    /// Cancel requested, waiting for confirmation.
    Cancelling,
}

/// One outstanding order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderSlot {
    pub client_id: ClientOrderId,
    pub intent: OrderIntent,
    pub phase: SlotPhase,
    /// Ledger shares attributed to this order.
    pub filled: Decimal,
    /// Ladder rung an exit was priced at.
    pub rung: Option<Rung>,
}

impl OrderSlot {
    fn new(intent: OrderIntent, rung: Option<Rung>) -> Self {
        Self {
            client_id: ClientOrderId::new(),
            intent,
            phase: SlotPhase::Submitting,
            filled: Decimal::ZERO,
            rung,
        }
    }

    pub fn remaining(&self) -> Decimal {
        (self.intent.size.inner() - self.filled).max(Decimal::ZERO)
    }

    pub fn is_filled(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Notional of the unfilled remainder at the limit price.
    pub fn remaining_notional(&self) -> Decimal {
        self.remaining() * self.intent.limit_price.inner()
    }
}

/// Action the driver must execute against the venue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderAction {
    Submit(OrderRequest),
    Cancel {
        side: IntentSide,
        client_id: ClientOrderId,
    },
}

/// Market inputs for `next_action`.
#[derive(Debug, Clone, Copy)]
pub struct ActionContext {
    pub now_ms: u64,
    pub best_bid: Option<Price>,
    pub inventory: Decimal,
}

#[derive(Debug, Clone)]
pub struct MachineConfig {
    pub entry_ttl_ms: u64,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            entry_ttl_ms: DEFAULT_ENTRY_TTL_MS,
        }
    }
}

#[derive(Debug)]
pub struct PositionMachine {
    cycle: CycleId,
    token_id: TokenId,
    closes_at_ms: u64,
    config: MachineConfig,
    ladder: ExitLadder,
    record: PositionRecord,
    mode: TradingMode,
    /// Window closed: only cancels are issued from here on.
    closed: bool,
    entry: Option<OrderSlot>,
    exit: Option<OrderSlot>,
    seen_entry_shares: Decimal,
    seen_exit_shares: Decimal,
    history: Vec<Transition>,
}

impl PositionMachine {
    pub fn new(
        cycle: CycleId,
        token_id: TokenId,
        closes_at_ms: u64,
        config: MachineConfig,
        ladder: ExitLadder,
    ) -> Self {
        Self {
            cycle,
            token_id,
            closes_at_ms,
            config,
            ladder,
            record: PositionRecord::idle(),
            mode: TradingMode::Normal,
            closed: false,
            entry: None,
            exit: None,
            seen_entry_shares: Decimal::ZERO,
            seen_exit_shares: Decimal::ZERO,
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> PositionState {
        self.record.state
    }

    pub fn record(&self) -> &PositionRecord {
        &self.record
    }

    pub fn mode(&self) -> TradingMode {
        self.mode
    }

    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    pub fn slot(&self, side: IntentSide) -> Option<&OrderSlot> {
        match side {
            IntentSide::Entry => self.entry.as_ref(),
            IntentSide::Exit => self.exit.as_ref(),
        }
    }

    /// Orders the venue may still be holding (including unacked submits).
    pub fn outstanding_count(&self) -> usize {
        usize::from(self.entry.is_some()) + usize::from(self.exit.is_some())
    }

    pub fn has_outstanding_entry(&self) -> bool {
        self.entry.is_some()
    }

    pub fn outstanding_entry_notional(&self) -> Decimal {
        self.entry
            .as_ref()
            .map(OrderSlot::remaining_notional)
            .unwrap_or(Decimal::ZERO)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn slot_mut(&mut self, side: IntentSide) -> &mut Option<OrderSlot> {
        match side {
            IntentSide::Entry => &mut self.entry,
            IntentSide::Exit => &mut self.exit,
        }
    }

    fn refresh_pending(&mut self) {
        self.record.pending_order_id = self
            .exit
            .as_ref()
            .or(self.entry.as_ref())
            .map(|s| s.client_id.clone());
    }

    fn request_for(&self, slot: &OrderSlot) -> OrderRequest {
        OrderRequest {
            client_id: slot.client_id.clone(),
            token_id: self.token_id.clone(),
            side: slot.intent.side,
            size: slot.intent.size,
            limit_price: slot.intent.limit_price,
        }
    }

    fn transition(
        &mut self,
        to: PositionState,
        trigger: TransitionTrigger,
        now_ms: u64,
    ) -> Option<Transition> {
        let from = self.record.state;
        if from == to {
            return None;
        }
        if !from.can_transition_to(to) {
            warn!(
                cycle = %self.cycle,
                from = %from,
                to = %to,
                trigger = %trigger,
                "Refusing illegal transition"
            );
            return None;
        }

        if to == PositionState::Idle {
            self.record = PositionRecord::idle();
            self.refresh_pending();
        } else {
            self.record.state = to;
        }

        let transition = Transition {
            from,
            to,
            trigger,
            at_ms: now_ms,
        };
        info!(
            cycle = %self.cycle,
            from = %from,
            to = %to,
            trigger = %trigger,
            "Position transition"
        );
        self.history.push(transition.clone());
        Some(transition)
    }

    fn open_position(&mut self, snap: &InventorySnapshot, now_ms: u64) {
        self.record.entry_price = snap.avg_entry_price;
        self.record.entry_time_ms = Some(now_ms);
    }

    /// Plan a new entry. The caller has already consulted the exposure gate
    /// and the regime filter.
    pub fn plan_entry(
        &mut self,
        size: Size,
        limit_price: Price,
        now_ms: u64,
    ) -> PositionResult<OrderAction> {
        if self.closed {
            return Err(PositionError::EntryNotPermitted("window closed".to_string()));
        }
        if self.mode != TradingMode::Normal {
            return Err(PositionError::EntryNotPermitted(format!(
                "mode {:?}",
                self.mode
            )));
        }
        if self.record.state != PositionState::Idle {
            return Err(PositionError::InvalidState(format!(
                "entry planned in {}",
                self.record.state
            )));
        }
        if self.entry.is_some() || self.exit.is_some() {
            return Err(PositionError::EntryNotPermitted(
                "order already outstanding".to_string(),
            ));
        }
        if !size.is_positive() || !limit_price.is_positive() {
            return Err(PositionError::EntryNotPermitted(format!(
                "invalid proposal {size} @ {limit_price}"
            )));
        }

        let slot = OrderSlot::new(
            OrderIntent::new(IntentSide::Entry, size, limit_price, now_ms),
            None,
        );
        let request = self.request_for(&slot);
        self.entry = Some(slot);
        self.refresh_pending();

        debug!(cycle = %self.cycle, client_id = %request.client_id, "Entry planned");
        Ok(OrderAction::Submit(request))
    }

    /// Venue acknowledged a submit.
    pub fn on_submit_accepted(
        &mut self,
        side: IntentSide,
        venue_id: VenueOrderId,
        inventory: Decimal,
        now_ms: u64,
    ) -> Option<Transition> {
        let cancelling = {
            let Some(slot) = self.slot_mut(side).as_mut() else {
                debug!(side = %side, "Ack for an order no longer tracked");
                return None;
            };
            slot.intent.external_id = Some(venue_id);
            if slot.phase == SlotPhase::Submitting {
                slot.phase = SlotPhase::Resting;
            }
            slot.phase == SlotPhase::Cancelling
        };

        if cancelling {
            return None;
        }

        match (side, self.record.state) {
            (IntentSide::Entry, PositionState::Idle) => {
                self.transition(PositionState::EntryPending, TransitionTrigger::EntryAccepted, now_ms)
            }
            (IntentSide::Exit, PositionState::PositionOpen) if inventory > Decimal::ZERO => {
                self.transition(PositionState::ExitPending, TransitionTrigger::ExitAccepted, now_ms)
            }
            _ => None,
        }
    }

    /// Venue rejected a submit. The intent is dropped.
    pub fn on_submit_rejected(&mut self, side: IntentSide, reason: &str) {
        if let Some(slot) = self.slot_mut(side).take() {
            warn!(
                cycle = %self.cycle,
                side = %side,
                client_id = %slot.client_id,
                reason,
                "Submit rejected"
            );
        }
        self.refresh_pending();
    }

    /// Venue confirmed a cancel (or reported the order unknown).
    pub fn on_cancel_confirmed(
        &mut self,
        side: IntentSide,
        inventory: Decimal,
        now_ms: u64,
    ) -> Option<Transition> {
        if self.slot_mut(side).take().is_none() {
            return None;
        }
        self.refresh_pending();

        if self.mode == TradingMode::Halted {
            return None;
        }

        match (side, self.record.state) {
            (IntentSide::Entry, PositionState::EntryPending) if inventory.is_zero() => {
                self.transition(PositionState::Idle, TransitionTrigger::EntryCancelled, now_ms)
            }
            (IntentSide::Exit, PositionState::ExitPending) if inventory > Decimal::ZERO => {
                self.transition(PositionState::PositionOpen, TransitionTrigger::ExitCancelled, now_ms)
            }
            _ => None,
        }
    }

    /// Re-read the ledger and make at most one transition.
    pub fn sync_with_ledger(&mut self, snap: &InventorySnapshot, now_ms: u64) -> Option<Transition> {
        let entry_delta = snap.entry_shares - self.seen_entry_shares;
        let exit_delta = snap.exit_shares - self.seen_exit_shares;
        self.seen_entry_shares = snap.entry_shares;
        self.seen_exit_shares = snap.exit_shares;

        if let Some(slot) = self.entry.as_mut() {
            slot.filled += entry_delta;
        }
        if let Some(slot) = self.exit.as_mut() {
            slot.filled += exit_delta;
        }
        let had_entry = self.entry.is_some();

        // A fully filled order is destroyed; nothing is left to cancel.
        if self.entry.as_ref().is_some_and(OrderSlot::is_filled) {
            self.entry = None;
        }
        if self.exit.as_ref().is_some_and(OrderSlot::is_filled) {
            self.exit = None;
        }
        self.refresh_pending();

        if self.mode == TradingMode::Halted {
            return None;
        }

        let inventory = snap.inventory;
        let holding = inventory > Decimal::ZERO;

        let transition = match self.record.state {
            PositionState::Idle if holding => {
                let (to, trigger) = if had_entry {
                    (PositionState::EntryPending, TransitionTrigger::EntryFilledBeforeAck)
                } else {
                    (PositionState::PositionOpen, TransitionTrigger::LateFill)
                };
                let t = self.transition(to, trigger, now_ms);
                if to == PositionState::PositionOpen {
                    self.open_position(snap, now_ms);
                }
                t
            }
            PositionState::EntryPending if holding => {
                let t = self.transition(
                    PositionState::PositionOpen,
                    TransitionTrigger::EntryFilled,
                    now_ms,
                );
                self.open_position(snap, now_ms);
                // Partially filled entry: cancel the remainder
                if let Some(slot) = self.entry.as_mut() {
                    slot.phase = SlotPhase::Cancelling;
                }
                t
            }
            PositionState::EntryPending if self.entry.is_none() => {
                self.transition(PositionState::Idle, TransitionTrigger::EntryCancelled, now_ms)
            }
            PositionState::PositionOpen | PositionState::ExitPending if !holding => {
                self.transition(PositionState::Idle, TransitionTrigger::ExitFilled, now_ms)
            }
            PositionState::ExitPending if self.exit.is_none() => self.transition(
                PositionState::PositionOpen,
                TransitionTrigger::ExitFilled,
                now_ms,
            ),
            _ => None,
        };

        if self.mode == TradingMode::ExitOnly
            && inventory.is_zero()
            && self.entry.is_none()
            && self.exit.is_none()
        {
            info!(cycle = %self.cycle, "Inventory flat, leaving exit-only mode");
            self.mode = TradingMode::Normal;
        }

        transition
    }

    /// Next order action for existing slots or the exit ladder.
    ///
    /// Entries are not proposed here; see `plan_entry`.
    pub fn next_action(&mut self, ctx: &ActionContext) -> Option<OrderAction> {
        // 1. Outstanding cancels are retried until confirmed
        for side in [IntentSide::Entry, IntentSide::Exit] {
            if let Some(slot) = self.slot(side) {
                if slot.phase == SlotPhase::Cancelling {
                    return Some(OrderAction::Cancel {
                        side,
                        client_id: slot.client_id.clone(),
                    });
                }
            }
        }

        // 2. Unacked submits are re-sent with the same client id
        for side in [IntentSide::Entry, IntentSide::Exit] {
            if let Some(slot) = self.slot(side) {
                if slot.phase == SlotPhase::Submitting {
                    return Some(OrderAction::Submit(self.request_for(slot)));
                }
            }
        }

        // 3. Stale or late entries
        let entry_expired = self.entry.as_ref().is_some_and(|slot| {
            slot.phase == SlotPhase::Resting
                && (ctx.now_ms.saturating_sub(slot.intent.submitted_at_ms)
                    >= self.config.entry_ttl_ms
                    || ctx.now_ms >= self.closes_at_ms)
        });
        if entry_expired {
            return self.begin_cancel(IntentSide::Entry);
        }

        if self.closed || self.mode == TradingMode::Halted {
            return None;
        }

        let opened_at = self.record.entry_time_ms.unwrap_or(ctx.now_ms);
        let desired = self.ladder.rung_at(opened_at, ctx.now_ms, self.closes_at_ms);

        // 4. Post an exit for open inventory
        if self.record.state == PositionState::PositionOpen
            && ctx.inventory > Decimal::ZERO
            && self.exit.is_none()
        {
            let entry_price = self.record.entry_price?;
            let price = self.ladder.price(desired, entry_price, ctx.best_bid);
            let slot = OrderSlot::new(
                OrderIntent::new(IntentSide::Exit, Size::new(ctx.inventory), price, ctx.now_ms),
                Some(desired),
            );
            let request = self.request_for(&slot);
            debug!(
                cycle = %self.cycle,
                rung = %desired,
                price = %price,
                size = %ctx.inventory,
                "Exit planned"
            );
            self.exit = Some(slot);
            self.refresh_pending();
            return Some(OrderAction::Submit(request));
        }

        // 5. Reprice a resting exit: cancel first, post on the next pass
        let needs_reprice = self.exit.as_ref().is_some_and(|slot| {
            slot.phase == SlotPhase::Resting && slot.rung.is_some_and(|r| r != desired)
        });
        if self.record.state == PositionState::ExitPending && needs_reprice {
            debug!(cycle = %self.cycle, rung = %desired, "Exit reprice: cancelling");
            return self.begin_cancel(IntentSide::Exit);
        }

        None
    }

    fn begin_cancel(&mut self, side: IntentSide) -> Option<OrderAction> {
        let slot = self.slot_mut(side).as_mut()?;
        slot.phase = SlotPhase::Cancelling;
        Some(OrderAction::Cancel {
            side,
            client_id: slot.client_id.clone(),
        })
    }

    /// Cancels still waiting for confirmation.
    pub fn pending_cancels(&self) -> Vec<OrderAction> {
        [IntentSide::Entry, IntentSide::Exit]
            .into_iter()
            .filter_map(|side| {
                self.slot(side)
                    .filter(|slot| slot.phase == SlotPhase::Cancelling)
                    .map(|slot| OrderAction::Cancel {
                        side,
                        client_id: slot.client_id.clone(),
                    })
            })
            .collect()
    }

    /// Enter a restricted mode and return the cancels to flush.
    ///
    /// `Halted` marks every slot for cancel; `ExitOnly` only the entry.
    /// A halted machine never downgrades.
    pub fn stop(&mut self, mode: TradingMode) -> Vec<OrderAction> {
        match (self.mode, mode) {
            (TradingMode::Halted, _) | (_, TradingMode::Normal) => {}
            (_, TradingMode::Halted) => {
                self.mode = TradingMode::Halted;
                for slot in [self.entry.as_mut(), self.exit.as_mut()].into_iter().flatten() {
                    slot.phase = SlotPhase::Cancelling;
                }
            }
            (_, TradingMode::ExitOnly) => {
                self.mode = TradingMode::ExitOnly;
                if let Some(slot) = self.entry.as_mut() {
                    slot.phase = SlotPhase::Cancelling;
                }
            }
        }
        self.pending_cancels()
    }

    /// Complete an emergency stop once cancels have been flushed.
    pub fn finish_stop(&mut self, now_ms: u64) -> Option<Transition> {
        if self.mode != TradingMode::Halted {
            return None;
        }
        self.transition(PositionState::Idle, TransitionTrigger::EmergencyStop, now_ms)
    }

    /// Window closed: cancel everything, plan nothing new.
    pub fn close_window(&mut self) -> Vec<OrderAction> {
        self.closed = true;
        for slot in [self.entry.as_mut(), self.exit.as_mut()].into_iter().flatten() {
            slot.phase = SlotPhase::Cancelling;
        }
        self.pending_cancels()
    }
}
