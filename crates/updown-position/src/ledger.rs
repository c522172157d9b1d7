//! Fill ledger: the single source of truth for confirmed inventory.
//!
//! Every raw trade event passes through `FillLedger::ingest`, which either
//! applies it, drops it as a duplicate, rejects it as untrustworthy, or
//! ignores it as out of scope for this cycle.
//!
//! # Deduplication
//!
//! Transaction ids are remembered for the lifetime of the ledger. Unlike an
//! order-update cache there is no size-based eviction: replaying an old fill
//! must never be re-applied, no matter how late it arrives.
//!
//! # Notification
//!
//! Every applied fill bumps `version` and publishes it on a `watch` channel.
//! Consumers re-read the ledger on wake-up, so a missed or coalesced
//! notification is harmless.

use std::collections::HashSet;

use rust_decimal::Decimal;
use tokio::sync::watch;
use tracing::{debug, warn};

use updown_core::{
    ConfirmedFill, CycleId, IntentSide, Price, RawFillEvent, Size, TokenId, TxId,
};

/// Default tolerance for trades stamped slightly before the cycle boundary.
pub const DEFAULT_BOUNDARY_SKEW_MS: u64 = 2_000;

/// Why a raw event was rejected. Rejections are data-integrity failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// Missing, placeholder or malformed transaction id.
    UntrustedTxId(String),
    NonPositiveSize,
    NonPositivePrice,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UntrustedTxId(detail) => write!(f, "untrusted tx id: {detail}"),
            Self::NonPositiveSize => write!(f, "non-positive size"),
            Self::NonPositivePrice => write!(f, "non-positive price"),
        }
    }
}

/// Why a raw event was ignored. Ignored events are not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Trade for a token this cycle does not trade.
    ForeignToken,
    /// Trade stamped before the cycle's ingestion boundary.
    BeforeBoundary { timestamp_ms: u64, boundary_ms: u64 },
}

impl std::fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ForeignToken => write!(f, "foreign token"),
            Self::BeforeBoundary {
                timestamp_ms,
                boundary_ms,
            } => write!(f, "before boundary ({timestamp_ms} < {boundary_ms})"),
        }
    }
}

/// Result of ingesting one raw event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Applied(ConfirmedFill),
    Duplicate(TxId),
    Rejected(RejectReason),
    Ignored(IgnoreReason),
}

impl IngestOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// Point-in-time view of the ledger, used by the state machine and gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InventorySnapshot {
    /// Signed inventory (entries positive, exits negative).
    pub inventory: Decimal,
    /// Volume-weighted entry price of the open inventory.
    pub avg_entry_price: Option<Price>,
    /// Cumulative entry shares over the ledger's lifetime.
    pub entry_shares: Decimal,
    /// Cumulative exit shares over the ledger's lifetime.
    pub exit_shares: Decimal,
    /// Bumped on every applied fill.
    pub version: u64,
}

/// Per-cycle fill ledger.
#[derive(Debug)]
pub struct FillLedger {
    cycle: CycleId,
    token_id: TokenId,
    /// Trades stamped before this are ignored.
    boundary_ms: u64,
    seen: HashSet<TxId>,
    fills: Vec<ConfirmedFill>,
    inventory: Decimal,
    avg_entry: Option<Decimal>,
    entry_shares: Decimal,
    exit_shares: Decimal,
    realized_pnl: Decimal,
    version: u64,
    notify: watch::Sender<u64>,
}

impl FillLedger {
    /// Create a ledger for one cycle's token.
    ///
    /// `opens_at_ms - skew_ms` becomes the ingestion boundary.
    pub fn new(cycle: CycleId, token_id: TokenId, opens_at_ms: u64, skew_ms: u64) -> Self {
        let (notify, _) = watch::channel(0);
        Self {
            cycle,
            token_id,
            boundary_ms: opens_at_ms.saturating_sub(skew_ms),
            seen: HashSet::new(),
            fills: Vec::new(),
            inventory: Decimal::ZERO,
            avg_entry: None,
            entry_shares: Decimal::ZERO,
            exit_shares: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            version: 0,
            notify,
        }
    }

    pub fn cycle(&self) -> CycleId {
        self.cycle
    }

    pub fn token_id(&self) -> &TokenId {
        &self.token_id
    }

    /// Ingest one raw event.
    ///
    /// Order of checks: scope (token, boundary), id trust, duplicate, then
    /// size and price sanity. Out-of-scope trades never reach the id check,
    /// so a malformed id on someone else's trade cannot halt this cycle.
    pub fn ingest(&mut self, event: &RawFillEvent) -> IngestOutcome {
        if event.token_id != self.token_id {
            debug!(
                cycle = %self.cycle,
                token = %event.token_id.short(),
                "Ignoring fill for foreign token"
            );
            return IngestOutcome::Ignored(IgnoreReason::ForeignToken);
        }

        if event.timestamp_ms < self.boundary_ms {
            debug!(
                cycle = %self.cycle,
                timestamp_ms = event.timestamp_ms,
                boundary_ms = self.boundary_ms,
                "Ignoring fill before cycle boundary"
            );
            return IngestOutcome::Ignored(IgnoreReason::BeforeBoundary {
                timestamp_ms: event.timestamp_ms,
                boundary_ms: self.boundary_ms,
            });
        }

        let tx_id = match TxId::parse(event.tx_id.as_deref().unwrap_or("")) {
            Ok(id) => id,
            Err(e) => {
                warn!(cycle = %self.cycle, error = %e, "Rejecting fill with untrusted id");
                return IngestOutcome::Rejected(RejectReason::UntrustedTxId(e.to_string()));
            }
        };

        if self.seen.contains(&tx_id) {
            debug!(cycle = %self.cycle, tx_id = %tx_id, "Skipping duplicate fill");
            return IngestOutcome::Duplicate(tx_id);
        }

        if !event.size.is_positive() {
            return IngestOutcome::Rejected(RejectReason::NonPositiveSize);
        }
        if !event.price.is_positive() {
            return IngestOutcome::Rejected(RejectReason::NonPositivePrice);
        }

        let fill = ConfirmedFill {
            unique_tx_id: tx_id.clone(),
            side: event.side.intent(),
            size: event.size,
            price: event.price,
            observed_at_ms: event.timestamp_ms,
        };

        self.seen.insert(tx_id);
        self.apply(&fill);
        self.fills.push(fill.clone());

        self.version += 1;
        self.notify.send_replace(self.version);

        IngestOutcome::Applied(fill)
    }

    /// Update inventory, average entry and realized PnL for one fill.
    fn apply(&mut self, fill: &ConfirmedFill) {
        let size = fill.size.inner();
        let price = fill.price.inner();

        match fill.side {
            IntentSide::Entry => {
                // New average = (old_inv * old_avg + size * price) / new_inv
                let held = self.inventory.max(Decimal::ZERO);
                let new_inv = held + size;
                let old_notional = held * self.avg_entry.unwrap_or(Decimal::ZERO);
                if !new_inv.is_zero() {
                    self.avg_entry = Some((old_notional + size * price) / new_inv);
                }
                self.entry_shares += size;
            }
            IntentSide::Exit => {
                if let Some(avg) = self.avg_entry {
                    self.realized_pnl += size * (price - avg);
                }
                self.exit_shares += size;
            }
        }

        self.inventory += fill.signed_size();
        if self.inventory <= Decimal::ZERO {
            self.avg_entry = None;
        }
    }

    /// Signed running sum of confirmed fills.
    pub fn current_inventory(&self) -> Decimal {
        self.inventory
    }

    pub fn last_fill(&self) -> Option<&ConfirmedFill> {
        self.fills.last()
    }

    pub fn fills(&self) -> &[ConfirmedFill] {
        &self.fills
    }

    pub fn fill_count(&self) -> usize {
        self.fills.len()
    }

    pub fn avg_entry_price(&self) -> Option<Price> {
        self.avg_entry.map(Price::new)
    }

    /// Exit revenue minus exited shares at the average entry price.
    pub fn realized_pnl(&self) -> Decimal {
        self.realized_pnl
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Inventory as an unsigned size (zero when flat or negative).
    pub fn held_size(&self) -> Size {
        Size::new(self.inventory.max(Decimal::ZERO))
    }

    pub fn snapshot(&self) -> InventorySnapshot {
        InventorySnapshot {
            inventory: self.inventory,
            avg_entry_price: self.avg_entry_price(),
            entry_shares: self.entry_shares,
            exit_shares: self.exit_shares,
            version: self.version,
        }
    }

    /// Subscribe to ledger change notifications (latest version).
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.notify.subscribe()
    }
}
