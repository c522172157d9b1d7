//! Application configuration.

use crate::error::{AppError, AppResult};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use updown_core::{ConditionId, CycleId, MarketWindow, TokenId};
use updown_executor::{CycleConfig, PriceBandConfig};
use updown_position::ExitLadderConfig;
use updown_settlement::{ChainConfig, SettlementConfig};

/// Operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatingMode {
    /// Read and record only; no order is ever submitted.
    #[default]
    Observation,
    /// Orders go to the paper venue and fill against the live book.
    Paper,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueConfig {
    /// CLOB REST host serving `/book`.
    #[serde(default = "default_clob_host")]
    pub clob_host: String,
}

fn default_clob_host() -> String {
    "https://clob.polymarket.com".to_string()
}

impl Default for VenueConfig {
    fn default() -> Self {
        Self {
            clob_host: default_clob_host(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExposureConfig {
    /// Per-cycle ceiling on held plus pending notional (USD).
    #[serde(default = "default_ceiling")]
    pub ceiling: Decimal,
    /// Ceiling across all concurrent cycles and unredeemed inventory (USD).
    #[serde(default = "default_account_ceiling")]
    pub account_ceiling: Decimal,
}

fn default_ceiling() -> Decimal {
    dec!(2.50)
}

fn default_account_ceiling() -> Decimal {
    dec!(10)
}

impl Default for ExposureConfig {
    fn default() -> Self {
        Self {
            ceiling: default_ceiling(),
            account_ceiling: default_account_ceiling(),
        }
    }
}

/// One market window to trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketConfig {
    /// Market slug (e.g., "btc-updown-15m-1760000000").
    pub slug: String,
    /// Outcome token to trade.
    pub token_id: String,
    pub condition_id: String,
    /// Outcome slot of `token_id` (0 = first outcome).
    #[serde(default)]
    pub outcome_index: u8,
    /// Window open (Unix ms).
    pub opens_at_ms: u64,
    /// Window close (Unix ms).
    pub closes_at_ms: u64,
}

impl MarketConfig {
    fn to_window(&self, cycle: CycleId) -> AppResult<MarketWindow> {
        Ok(MarketWindow {
            cycle,
            slug: self.slug.clone(),
            token_id: TokenId::new(self.token_id.as_str())?,
            condition_id: ConditionId::parse(&self.condition_id)?,
            outcome_index: self.outcome_index,
            opens_at_ms: self.opens_at_ms,
            closes_at_ms: self.closes_at_ms,
        })
    }
}

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub mode: OperatingMode,
    #[serde(default)]
    pub venue: VenueConfig,
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub exposure: ExposureConfig,
    #[serde(default)]
    pub exit_ladder: ExitLadderConfig,
    #[serde(default)]
    pub cycle: CycleConfig,
    #[serde(default)]
    pub regime: PriceBandConfig,
    #[serde(default)]
    pub settlement: SettlementConfig,
    #[serde(default)]
    pub markets: Vec<MarketConfig>,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &str) -> AppResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("Failed to read config: {e}")))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> AppResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.exposure.ceiling <= Decimal::ZERO {
            return Err(AppError::Config(format!(
                "exposure.ceiling must be positive, got {}",
                self.exposure.ceiling
            )));
        }
        if self.exposure.account_ceiling < self.exposure.ceiling {
            return Err(AppError::Config(format!(
                "exposure.account_ceiling {} is below the per-cycle ceiling {}",
                self.exposure.account_ceiling, self.exposure.ceiling
            )));
        }
        if self.regime.min_entry_price > self.regime.max_entry_price {
            return Err(AppError::Config(
                "regime.min_entry_price above max_entry_price".to_string(),
            ));
        }
        self.cycle.validate()?;
        self.chain.validate()?;
        self.settlement.validate()?;

        for market in &self.markets {
            if market.closes_at_ms <= market.opens_at_ms {
                return Err(AppError::Config(format!(
                    "market {}: closes_at_ms must be after opens_at_ms",
                    market.slug
                )));
            }
        }
        self.windows().map(|_| ())
    }

    pub fn is_observation_mode(&self) -> bool {
        self.mode == OperatingMode::Observation
    }

    /// Cycle config with the mode applied.
    pub fn cycle_config(&self) -> CycleConfig {
        CycleConfig {
            observe_only: self.is_observation_mode(),
            ..self.cycle.clone()
        }
    }

    /// Market windows ordered by open time, numbered from cycle 1.
    pub fn windows(&self) -> AppResult<Vec<MarketWindow>> {
        let mut markets: Vec<&MarketConfig> = self.markets.iter().collect();
        markets.sort_by_key(|m| (m.opens_at_ms, m.closes_at_ms));
        markets
            .iter()
            .enumerate()
            .map(|(i, m)| m.to_window(CycleId(i as u64 + 1)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CID: &str = "0x4a629eb456c10ea56e4819f5b54c6727be8010b03c31375fed5b9f100f0dee53";

    fn market(slug: &str, opens: u64, closes: u64) -> String {
        format!(
            r#"
            [[markets]]
            slug = "{slug}"
            token_id = "1234567890"
            condition_id = "{CID}"
            opens_at_ms = {opens}
            closes_at_ms = {closes}
            "#
        )
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_toml("").unwrap();
        assert!(config.is_observation_mode());
        assert_eq!(config.exposure.ceiling, dec!(2.50));
        assert!(config.cycle_config().observe_only);
        assert!(config.markets.is_empty());
    }

    #[test]
    fn test_paper_mode_and_sections() {
        let toml = format!(
            r#"
            mode = "paper"

            [exposure]
            ceiling = 3.0

            [cycle]
            entry_size = 4

            [settlement]
            holding_wallet = "0x5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a"
            {}
            "#,
            market("btc-updown-15m", 1_000, 901_000)
        );
        let config = AppConfig::from_toml(&toml).unwrap();
        assert_eq!(config.mode, OperatingMode::Paper);
        assert!(!config.cycle_config().observe_only);
        assert_eq!(config.exposure.ceiling, dec!(3.0));
        assert_eq!(config.cycle.entry_size, dec!(4));
        assert!(config.settlement.holding_wallet.is_some());
    }

    #[test]
    fn test_windows_sorted_and_numbered() {
        let toml = format!(
            "{}{}",
            market("later", 2_000_000, 2_900_000),
            market("earlier", 1_000, 901_000)
        );
        let windows = AppConfig::from_toml(&toml).unwrap().windows().unwrap();
        assert_eq!(windows[0].slug, "earlier");
        assert_eq!(windows[0].cycle, CycleId(1));
        assert_eq!(windows[1].cycle, CycleId(2));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(AppConfig::from_toml("[exposure]\nceiling = 0").is_err());
        assert!(AppConfig::from_toml(&market("backwards", 5_000, 1_000)).is_err());
        let bad_cid = market("bad", 1_000, 2_000).replace(CID, "0x1234");
        assert!(AppConfig::from_toml(&bad_cid).is_err());
    }
}
