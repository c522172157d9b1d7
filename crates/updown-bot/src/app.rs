//! Application wiring.
//!
//! Builds the venue, book feed and (when a holding wallet is configured)
//! the redemption router, then runs one [`CycleRunner`] task per configured
//! window concurrently with the settlement loop.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use updown_executor::{
    BookFeed, ClobBookFeed, CycleDeps, CycleSummary, ExecutorError, OrderVenue, PaperVenue,
    PriceBandRegime,
};
use updown_risk::{AccountExposure, StopLatch};
use updown_settlement::{
    BalanceReader, ChainClient, ClaimRecord, Erc20Balance, KeyManager, RedemptionRouter,
    RpcChainClient, SettlementError,
};
use updown_telemetry::EventBus;

use crate::claims::{settlement_loop, ClaimBook};
use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::runner::CycleRunner;

/// External collaborators of the application.
pub struct Services {
    pub venue: Arc<dyn OrderVenue>,
    pub feed: Arc<dyn BookFeed>,
    pub router: Option<Arc<RedemptionRouter>>,
}

impl Services {
    pub fn from_config(config: &AppConfig, events: &EventBus) -> AppResult<Self> {
        let feed: Arc<dyn BookFeed> =
            Arc::new(ClobBookFeed::new(&config.venue.clob_host).map_err(ExecutorError::from)?);
        let venue: Arc<dyn OrderVenue> = Arc::new(PaperVenue::new(feed.clone()));

        let router = match config.settlement.router_config(config.chain.chain_id)? {
            Some(router_config) => {
                let keys = KeyManager::load(config.chain.key_source(), config.chain.expected_signer()?)
                    .map_err(SettlementError::from)?;
                if keys.address().is_none() {
                    warn!("No signing key loaded, claims will escalate instead of redeeming");
                }
                let keys = Arc::new(keys);
                let chain: Arc<dyn ChainClient> = Arc::new(
                    RpcChainClient::new(config.chain.rpc_settings(), keys.clone())
                        .map_err(SettlementError::from)?,
                );
                let balances: Arc<dyn BalanceReader> = Arc::new(Erc20Balance::new(
                    chain.clone(),
                    router_config.targets.collateral,
                    config.settlement.collateral_decimals,
                ));
                info!(
                    wallet = %router_config.targets.wallet,
                    rpc = %config.chain.rpc_url,
                    "Redemption enabled"
                );
                Some(Arc::new(RedemptionRouter::new(
                    router_config,
                    chain,
                    balances,
                    keys,
                    events.clone(),
                )))
            }
            None => None,
        };

        Ok(Self {
            venue,
            feed,
            router,
        })
    }
}

/// Outcome of a full run.
#[derive(Debug)]
pub struct RunReport {
    pub cycles: Vec<CycleSummary>,
    pub pending_claims: Vec<ClaimRecord>,
}

pub struct Application {
    config: AppConfig,
    services: Services,
    events: EventBus,
    account: Arc<AccountExposure>,
    latch: Arc<StopLatch>,
    shutdown: CancellationToken,
}

impl Application {
    pub fn new(config: AppConfig) -> AppResult<Self> {
        let events = EventBus::default();
        let services = Services::from_config(&config, &events)?;
        Ok(Self::with_services(config, events, services))
    }

    pub fn with_services(config: AppConfig, events: EventBus, services: Services) -> Self {
        let account = Arc::new(AccountExposure::new(config.exposure.account_ceiling));
        Self {
            config,
            services,
            events,
            account,
            latch: Arc::new(StopLatch::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn latch(&self) -> &Arc<StopLatch> {
        &self.latch
    }

    pub fn account(&self) -> &Arc<AccountExposure> {
        &self.account
    }

    /// Run every configured window, then keep settling until no claim is
    /// pending. Cancelling the shutdown token stops both.
    pub async fn run(&self) -> AppResult<RunReport> {
        let windows = self.config.windows()?;
        info!(
            mode = ?self.config.mode,
            windows = windows.len(),
            redemption = self.services.router.is_some(),
            "Application starting"
        );

        let deps = CycleDeps {
            venue: self.services.venue.clone(),
            feed: self.services.feed.clone(),
            regime: Arc::new(PriceBandRegime::new(self.config.regime.clone())),
            account: self.account.clone(),
            latch: self.latch.clone(),
            events: self.events.clone(),
        };
        let claims = self
            .services
            .router
            .as_ref()
            .map(|router| Arc::new(ClaimBook::new(router.clone(), self.account.clone())));

        let trading_done = CancellationToken::new();
        let settlement = claims.clone().map(|claims| {
            tokio::spawn(settlement_loop(
                claims,
                Duration::from_millis(self.config.settlement.poll_interval_ms),
                self.shutdown.clone(),
                trading_done.clone(),
            ))
        });

        let handles: Vec<_> = windows
            .into_iter()
            .map(|window| {
                let runner = CycleRunner::new(
                    window,
                    self.config.cycle_config(),
                    self.config.exit_ladder.clone(),
                    self.config.exposure.ceiling,
                    deps.clone(),
                    claims.clone(),
                    self.shutdown.clone(),
                );
                tokio::spawn(runner.run())
            })
            .collect();

        let mut cycles = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(Ok(Some(summary))) => cycles.push(summary),
                Ok(Ok(None)) => {}
                Ok(Err(e)) => error!(error = %e, "Cycle failed"),
                Err(e) => error!(error = %e, "Cycle task aborted"),
            }
        }
        trading_done.cancel();
        info!(cycles = cycles.len(), "Trading finished");

        if let Some(handle) = settlement {
            handle.await.map_err(|e| AppError::Task(e.to_string()))?;
        }

        let pending_claims = self
            .services
            .router
            .as_ref()
            .map(|router| router.pending_claims())
            .unwrap_or_default();
        if let Some(reason) = self.latch.reason() {
            warn!(%reason, "Run ended with trading stopped");
        }
        Ok(RunReport {
            cycles,
            pending_claims,
        })
    }
}
