//! Drives one market window from open to close.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use updown_core::MarketWindow;
use updown_executor::{CycleConfig, CycleDeps, CycleSummary, MarketCycle};
use updown_position::{ExitLadder, ExitLadderConfig};
use updown_risk::ExposureGate;

use crate::claims::ClaimBook;
use crate::error::AppResult;

pub(crate) fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

pub struct CycleRunner {
    window: MarketWindow,
    config: CycleConfig,
    ladder: ExitLadderConfig,
    ceiling: Decimal,
    deps: CycleDeps,
    claims: Option<Arc<ClaimBook>>,
    shutdown: CancellationToken,
}

impl CycleRunner {
    pub fn new(
        window: MarketWindow,
        config: CycleConfig,
        ladder: ExitLadderConfig,
        ceiling: Decimal,
        deps: CycleDeps,
        claims: Option<Arc<ClaimBook>>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            window,
            config,
            ladder,
            ceiling,
            deps,
            claims,
            shutdown,
        }
    }

    /// Run the window. `None` when it was skipped.
    pub async fn run(self) -> AppResult<Option<CycleSummary>> {
        let cycle_id = self.window.cycle;
        if self.window.is_closed(now_ms()) {
            info!(cycle = %cycle_id, slug = %self.window.slug, "Window already closed, skipping");
            return Ok(None);
        }
        if !self.wait_for_open().await {
            return Ok(None);
        }
        if self.deps.latch.is_triggered() {
            warn!(cycle = %cycle_id, reason = ?self.deps.latch.reason(), "Trading stopped, skipping window");
            return Ok(None);
        }

        let gate = ExposureGate::new(self.ceiling)?;
        let mut cycle = MarketCycle::new(
            self.window.clone(),
            self.config.clone(),
            ExitLadder::new(self.ladder.clone()),
            gate,
            self.deps.clone(),
        );

        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.tick_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!(cycle = %cycle_id, "Shutdown, closing window early");
                    break;
                }
                _ = ticker.tick() => {
                    let now = now_ms();
                    if self.window.is_closed(now) {
                        break;
                    }
                    if let Err(e) = cycle.tick(now).await {
                        warn!(cycle = %cycle_id, error = %e, "Tick failed");
                    }
                }
            }
        }

        let summary = cycle.close(now_ms()).await;
        if summary.unconfirmed_orders > 0 {
            // Reservation stays; the latch has stopped every other cycle
            return Ok(Some(summary));
        }
        let handed = match &self.claims {
            Some(claims) => claims.hand_over(&summary),
            None => false,
        };
        if !handed && summary.held.is_positive() {
            warn!(
                cycle = %cycle_id,
                held = %summary.held,
                "Held inventory not redeemable here, releasing its reservation"
            );
            self.deps.account.release(cycle_id);
        }
        Ok(Some(summary))
    }

    async fn wait_for_open(&self) -> bool {
        let wait = self.window.opens_at_ms.saturating_sub(now_ms());
        if wait == 0 {
            return true;
        }
        info!(cycle = %self.window.cycle, wait_ms = wait, "Waiting for window open");
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(Duration::from_millis(wait)) => true,
        }
    }
}
