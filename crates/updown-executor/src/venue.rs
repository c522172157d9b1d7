//! Order venue trait.
//!
//! Abstracts the exchange order API so the trading cycle can be driven by
//! the paper venue, a mock, or a live adapter.
//!
//! Submits carry a client order id and must be idempotent per id: a
//! re-submit of the same id returns the original acknowledgement. Cancels
//! are addressed by client order id; an unknown id counts as cancelled.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;

use parking_lot::Mutex;

use updown_core::{ClientOrderId, OrderRequest, RawFillEvent, Size, TokenId, VenueOrderId};

use crate::error::VenueError;

/// Boxed future for dyn-compatible async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectKind {
    /// Insufficient balance or allowance.
    BalanceOrAllowance,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitAck {
    Accepted(VenueOrderId),
    Rejected { kind: RejectKind, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelAck {
    Cancelled,
    /// Venue does not know the order (already filled, cancelled or never
    /// placed). Treated as confirmation.
    NotFound,
}

pub trait OrderVenue: Send + Sync {
    fn submit(&self, request: OrderRequest) -> BoxFuture<'_, Result<SubmitAck, VenueError>>;

    fn cancel(&self, client_id: ClientOrderId) -> BoxFuture<'_, Result<CancelAck, VenueError>>;

    /// Trades for `token_id` stamped at or after `since_ms`. May repeat
    /// trades already returned; the ledger deduplicates.
    fn poll_trades(
        &self,
        token_id: TokenId,
        since_ms: u64,
    ) -> BoxFuture<'_, Result<Vec<RawFillEvent>, VenueError>>;

    /// Venue-reported position size, if the venue offers one.
    fn reported_position(&self, token_id: TokenId)
        -> BoxFuture<'_, Result<Option<Size>, VenueError>>;
}

/// Call recorded by `MockVenue`, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VenueCall {
    Submit(OrderRequest),
    Cancel(ClientOrderId),
}

/// Mock venue for testing.
///
/// Honors client-id idempotency like a real venue. Results can be scripted
/// per call; unscripted submits are accepted and cancels confirmed.
#[derive(Debug, Default)]
pub struct MockVenue {
    calls: Mutex<Vec<VenueCall>>,
    submit_results: Mutex<VecDeque<Result<SubmitAck, VenueError>>>,
    cancel_results: Mutex<VecDeque<Result<CancelAck, VenueError>>>,
    accepted: Mutex<HashMap<ClientOrderId, VenueOrderId>>,
    trades: Mutex<Vec<RawFillEvent>>,
    trades_down: Mutex<Option<VenueError>>,
    reported: Mutex<Option<Size>>,
}

impl MockVenue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_submit_result(&self, result: Result<SubmitAck, VenueError>) {
        self.submit_results.lock().push_back(result);
    }

    pub fn push_cancel_result(&self, result: Result<CancelAck, VenueError>) {
        self.cancel_results.lock().push_back(result);
    }

    /// Queue a trade for the next poll. Polls return every queued trade
    /// until `clear_trades`, so replays are exercised.
    pub fn push_trade(&self, trade: RawFillEvent) {
        self.trades.lock().push(trade);
    }

    pub fn clear_trades(&self) {
        self.trades.lock().clear();
    }

    /// Fail every trade poll with `error` until called again with `None`.
    pub fn set_trades_down(&self, error: Option<VenueError>) {
        *self.trades_down.lock() = error;
    }

    pub fn set_reported_position(&self, size: Option<Size>) {
        *self.reported.lock() = size;
    }

    pub fn calls(&self) -> Vec<VenueCall> {
        self.calls.lock().clone()
    }

    pub fn submits(&self) -> Vec<OrderRequest> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                VenueCall::Submit(r) => Some(r.clone()),
                VenueCall::Cancel(_) => None,
            })
            .collect()
    }

    pub fn cancels(&self) -> Vec<ClientOrderId> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                VenueCall::Cancel(id) => Some(id.clone()),
                VenueCall::Submit(_) => None,
            })
            .collect()
    }
}

impl OrderVenue for MockVenue {
    fn submit(&self, request: OrderRequest) -> BoxFuture<'_, Result<SubmitAck, VenueError>> {
        Box::pin(async move {
            self.calls.lock().push(VenueCall::Submit(request.clone()));

            if let Some(existing) = self.accepted.lock().get(&request.client_id) {
                return Ok(SubmitAck::Accepted(existing.clone()));
            }

            let result = self.submit_results.lock().pop_front().unwrap_or_else(|| {
                Ok(SubmitAck::Accepted(VenueOrderId::new(format!(
                    "mock-{}",
                    request.client_id
                ))))
            });
            if let Ok(SubmitAck::Accepted(id)) = &result {
                self.accepted
                    .lock()
                    .insert(request.client_id.clone(), id.clone());
            }
            result
        })
    }

    fn cancel(&self, client_id: ClientOrderId) -> BoxFuture<'_, Result<CancelAck, VenueError>> {
        Box::pin(async move {
            self.calls.lock().push(VenueCall::Cancel(client_id));
            self.cancel_results
                .lock()
                .pop_front()
                .unwrap_or(Ok(CancelAck::Cancelled))
        })
    }

    fn poll_trades(
        &self,
        token_id: TokenId,
        since_ms: u64,
    ) -> BoxFuture<'_, Result<Vec<RawFillEvent>, VenueError>> {
        Box::pin(async move {
            if let Some(e) = self.trades_down.lock().clone() {
                return Err(e);
            }
            Ok(self
                .trades
                .lock()
                .iter()
                .filter(|t| t.token_id == token_id && t.timestamp_ms >= since_ms)
                .cloned()
                .collect())
        })
    }

    fn reported_position(
        &self,
        _token_id: TokenId,
    ) -> BoxFuture<'_, Result<Option<Size>, VenueError>> {
        Box::pin(async move { Ok(*self.reported.lock()) })
    }
}
