//! Order book feed.
//!
//! `ClobBookFeed` reads the top of book over HTTP and derives a short-term
//! volatility figure from the mids it has seen. It is read-only; quote
//! construction lives elsewhere.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::Client;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use tracing::{debug, trace};

use updown_core::{Price, TokenId};

use crate::error::VenueError;
use crate::venue::BoxFuture;

/// Default timeout for book requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Mids kept per token for the volatility estimate.
const MID_HISTORY: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BookTop {
    pub best_bid: Option<Price>,
    pub best_ask: Option<Price>,
}

impl BookTop {
    pub fn mid(&self) -> Option<Price> {
        match (self.best_bid, self.best_ask) {
            (Some(bid), Some(ask)) => Some(Price::new((bid.inner() + ask.inner()) / dec!(2))),
            _ => None,
        }
    }

    pub fn spread(&self) -> Option<Decimal> {
        match (self.best_bid, self.best_ask) {
            (Some(bid), Some(ask)) => Some(ask.inner() - bid.inner()),
            _ => None,
        }
    }
}

pub trait BookFeed: Send + Sync {
    fn top(&self, token_id: TokenId) -> BoxFuture<'_, Result<BookTop, VenueError>>;

    /// Range of recent mids, `None` until enough samples exist.
    fn recent_volatility(&self, token_id: TokenId)
        -> BoxFuture<'_, Result<Option<Decimal>, VenueError>>;
}

#[derive(Debug, Deserialize)]
struct RawLevel {
    price: String,
    #[allow(dead_code)]
    size: String,
}

#[derive(Debug, Deserialize)]
struct RawBook {
    #[serde(default)]
    bids: Vec<RawLevel>,
    #[serde(default)]
    asks: Vec<RawLevel>,
}

fn parse_levels(levels: &[RawLevel]) -> Result<Vec<Price>, VenueError> {
    levels
        .iter()
        .map(|l| {
            l.price
                .parse::<Price>()
                .map_err(|e| VenueError::Decode(format!("price '{}': {e}", l.price)))
        })
        .collect()
}

/// HTTP book feed against a CLOB REST host (`GET {host}/book?token_id=`).
pub struct ClobBookFeed {
    client: Client,
    host: String,
    mids: Mutex<HashMap<TokenId, VecDeque<Decimal>>>,
}

impl ClobBookFeed {
    pub fn new(host: impl Into<String>) -> Result<Self, VenueError> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| VenueError::Transport(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            host: host.into().trim_end_matches('/').to_string(),
            mids: Mutex::new(HashMap::new()),
        })
    }

    async fn fetch_top(&self, token_id: &TokenId) -> Result<BookTop, VenueError> {
        let url = format!("{}/book", self.host);
        let response = self
            .client
            .get(&url)
            .query(&[("token_id", token_id.as_str())])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    VenueError::Timeout(DEFAULT_TIMEOUT.as_millis() as u64)
                } else {
                    VenueError::Transport(format!("HTTP request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VenueError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let raw: RawBook = response
            .json()
            .await
            .map_err(|e| VenueError::Decode(format!("Failed to parse book: {e}")))?;

        // Level ordering differs between hosts; take extremes explicitly
        let top = BookTop {
            best_bid: parse_levels(&raw.bids)?.into_iter().max(),
            best_ask: parse_levels(&raw.asks)?.into_iter().min(),
        };
        trace!(token = %token_id.short(), ?top, "Book top");

        if let Some(mid) = top.mid() {
            let mut mids = self.mids.lock();
            let history = mids.entry(token_id.clone()).or_default();
            history.push_back(mid.inner());
            if history.len() > MID_HISTORY {
                history.pop_front();
            }
        }
        Ok(top)
    }

    fn volatility(&self, token_id: &TokenId) -> Option<Decimal> {
        let mids = self.mids.lock();
        let history = mids.get(token_id)?;
        if history.len() < 2 {
            return None;
        }
        let max = history.iter().max()?;
        let min = history.iter().min()?;
        Some(*max - *min)
    }
}

impl BookFeed for ClobBookFeed {
    fn top(&self, token_id: TokenId) -> BoxFuture<'_, Result<BookTop, VenueError>> {
        Box::pin(async move { self.fetch_top(&token_id).await })
    }

    fn recent_volatility(
        &self,
        token_id: TokenId,
    ) -> BoxFuture<'_, Result<Option<Decimal>, VenueError>> {
        Box::pin(async move {
            let vol = self.volatility(&token_id);
            debug!(token = %token_id.short(), ?vol, "Recent volatility");
            Ok(vol)
        })
    }
}

/// Mock book feed for testing.
#[derive(Debug, Default)]
pub struct MockBookFeed {
    top: Mutex<BookTop>,
    volatility: Mutex<Option<Decimal>>,
    fail_next: Mutex<Option<VenueError>>,
    down: Mutex<Option<VenueError>>,
}

impl MockBookFeed {
    pub fn new(best_bid: Decimal, best_ask: Decimal) -> Self {
        let feed = Self::default();
        feed.set_top(best_bid, best_ask);
        feed
    }

    pub fn set_top(&self, best_bid: Decimal, best_ask: Decimal) {
        *self.top.lock() = BookTop {
            best_bid: Some(Price::new(best_bid)),
            best_ask: Some(Price::new(best_ask)),
        };
    }

    pub fn set_empty(&self) {
        *self.top.lock() = BookTop::default();
    }

    pub fn set_volatility(&self, vol: Option<Decimal>) {
        *self.volatility.lock() = vol;
    }

    pub fn fail_next(&self, error: VenueError) {
        *self.fail_next.lock() = Some(error);
    }

    /// Fail every read with `error` until called again with `None`.
    pub fn set_down(&self, error: Option<VenueError>) {
        *self.down.lock() = error;
    }
}

impl BookFeed for MockBookFeed {
    fn top(&self, _token_id: TokenId) -> BoxFuture<'_, Result<BookTop, VenueError>> {
        Box::pin(async move {
            if let Some(e) = self.fail_next.lock().take() {
                return Err(e);
            }
            if let Some(e) = self.down.lock().clone() {
                return Err(e);
            }
            Ok(*self.top.lock())
        })
    }

    fn recent_volatility(
        &self,
        _token_id: TokenId,
    ) -> BoxFuture<'_, Result<Option<Decimal>, VenueError>> {
        Box::pin(async move { Ok(*self.volatility.lock()) })
    }
}
