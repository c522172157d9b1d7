//! Paper venue.
//!
//! Acknowledges every order and fills a resting order in full once its
//! limit crosses the current book: entries when the ask is at or below the
//! limit, exits when the bid is at or above it. Fills are reported through
//! `poll_trades` like venue trades, with `paper-` transaction ids.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::{debug, info};
use uuid::Uuid;

use updown_core::{
    ClientOrderId, IntentSide, OrderRequest, RawFillEvent, Size, TokenId, TradeSide, VenueOrderId,
};

use crate::book::{BookFeed, BookTop};
use crate::error::VenueError;
use crate::venue::{BoxFuture, CancelAck, OrderVenue, SubmitAck};

#[derive(Debug, Clone)]
struct RestingOrder {
    request: OrderRequest,
    venue_id: VenueOrderId,
}

impl RestingOrder {
    fn crosses(&self, top: &BookTop) -> bool {
        let limit = self.request.limit_price;
        match self.request.side {
            IntentSide::Entry => top.best_ask.is_some_and(|ask| ask <= limit),
            IntentSide::Exit => top.best_bid.is_some_and(|bid| bid >= limit),
        }
    }
}

pub struct PaperVenue {
    feed: Arc<dyn BookFeed>,
    acked: Mutex<HashMap<ClientOrderId, VenueOrderId>>,
    resting: Mutex<Vec<RestingOrder>>,
    trades: Mutex<Vec<RawFillEvent>>,
}

impl PaperVenue {
    pub fn new(feed: Arc<dyn BookFeed>) -> Self {
        Self {
            feed,
            acked: Mutex::new(HashMap::new()),
            resting: Mutex::new(Vec::new()),
            trades: Mutex::new(Vec::new()),
        }
    }

    pub fn resting_count(&self) -> usize {
        self.resting.lock().len()
    }

    /// Fill every resting order for `token_id` that crosses `top`.
    fn match_resting(&self, token_id: &TokenId, top: &BookTop, now_ms: u64) {
        let crossed: Vec<RestingOrder> = {
            let mut resting = self.resting.lock();
            let (hit, keep): (Vec<_>, Vec<_>) = resting
                .drain(..)
                .partition(|o| o.request.token_id == *token_id && o.crosses(top));
            *resting = keep;
            hit
        };

        let mut trades = self.trades.lock();
        for order in crossed {
            let side = match order.request.side {
                IntentSide::Entry => TradeSide::Buy,
                IntentSide::Exit => TradeSide::Sell,
            };
            let tx_id = format!("paper-{}", Uuid::new_v4().simple());
            info!(
                client_id = %order.request.client_id,
                venue_id = %order.venue_id,
                side = %order.request.side,
                size = %order.request.size,
                price = %order.request.limit_price,
                %tx_id,
                "Paper fill"
            );
            trades.push(RawFillEvent {
                tx_id: Some(tx_id),
                token_id: order.request.token_id.clone(),
                side,
                size: order.request.size,
                price: order.request.limit_price,
                timestamp_ms: now_ms,
            });
        }
    }

    fn position(&self, token_id: &TokenId) -> Decimal {
        self.trades
            .lock()
            .iter()
            .filter(|t| t.token_id == *token_id)
            .map(|t| match t.side {
                TradeSide::Buy => t.size.inner(),
                TradeSide::Sell => -t.size.inner(),
            })
            .sum()
    }
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

impl OrderVenue for PaperVenue {
    fn submit(&self, request: OrderRequest) -> BoxFuture<'_, Result<SubmitAck, VenueError>> {
        Box::pin(async move {
            let venue_id = {
                let mut acked = self.acked.lock();
                if let Some(existing) = acked.get(&request.client_id) {
                    return Ok(SubmitAck::Accepted(existing.clone()));
                }
                let venue_id = VenueOrderId::new(format!("paper-order-{}", acked.len() + 1));
                acked.insert(request.client_id.clone(), venue_id.clone());
                venue_id
            };
            debug!(
                client_id = %request.client_id,
                venue_id = %venue_id,
                side = %request.side,
                "Paper order resting"
            );
            self.resting.lock().push(RestingOrder {
                request,
                venue_id: venue_id.clone(),
            });
            Ok(SubmitAck::Accepted(venue_id))
        })
    }

    fn cancel(&self, client_id: ClientOrderId) -> BoxFuture<'_, Result<CancelAck, VenueError>> {
        Box::pin(async move {
            let mut resting = self.resting.lock();
            let before = resting.len();
            resting.retain(|o| o.request.client_id != client_id);
            if resting.len() < before {
                Ok(CancelAck::Cancelled)
            } else {
                Ok(CancelAck::NotFound)
            }
        })
    }

    fn poll_trades(
        &self,
        token_id: TokenId,
        since_ms: u64,
    ) -> BoxFuture<'_, Result<Vec<RawFillEvent>, VenueError>> {
        Box::pin(async move {
            let top = self.feed.top(token_id.clone()).await?;
            self.match_resting(&token_id, &top, now_ms());
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
        token_id: TokenId,
    ) -> BoxFuture<'_, Result<Option<Size>, VenueError>> {
        Box::pin(async move { Ok(Some(Size::new(self.position(&token_id)))) })
    }
}
