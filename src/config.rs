//! Engine settings: TOML loading and validation.
//!
//! The source of truth for every tunable knob of the allocation and
//! order-synthesis engines. Built once, passed by reference, never
//! mutated mid-session.

use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Immutable engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Reference currency for valuations and descriptions.
    #[serde(default = "default_currency")]
    pub currency: String,

    /// Allowed deviation band around each anchor's fair share of a target
    /// amount (0.20 = ±20%).
    #[serde(default = "default_deviation")]
    pub balance_target_deviation: f64,

    /// Minimum notional value for a synthesized offer, in reference
    /// currency. Trades below it are skipped unless the target is in
    /// amount mode or being fully liquidated.
    #[serde(default = "default_min_offer_value")]
    pub min_offer_value: f64,

    /// Maximum deviation of a posted price from the global market price.
    #[serde(default = "default_max_spread")]
    pub max_spread: f64,

    /// Fraction of the pair's spread by which a proposed price is shifted
    /// toward mid-market.
    #[serde(default = "default_spread_tightening")]
    pub spread_tightening: f64,

    /// Margin by which a counter-offer's volume must exceed the requested
    /// size before we consume it.
    #[serde(default = "default_skip_marginal_offers")]
    pub skip_marginal_offers: f64,

    /// Tolerated gap between the sum of allocations and the portfolio
    /// total before an allocation error is raised.
    #[serde(default = "default_misallocation_tolerance")]
    pub misallocation_tolerance: f64,

    /// Cap on the volume moved per step when evening out anchors,
    /// expressed relative to the target's current value drift.
    #[serde(default = "default_risk_max")]
    pub anchor_rebalance_risk_max: f64,

    /// Per-entry native reserve used for the account minimum balance.
    #[serde(default = "default_base_reserve")]
    pub base_reserve: f64,
}

fn default_currency() -> String {
    "USD".into()
}
fn default_deviation() -> f64 {
    0.20
}
fn default_min_offer_value() -> f64 {
    1.0
}
fn default_max_spread() -> f64 {
    0.05
}
fn default_spread_tightening() -> f64 {
    0.01
}
fn default_skip_marginal_offers() -> f64 {
    0.10
}
fn default_misallocation_tolerance() -> f64 {
    0.01
}
fn default_risk_max() -> f64 {
    0.05
}
fn default_base_reserve() -> f64 {
    0.5
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            currency: default_currency(),
            balance_target_deviation: default_deviation(),
            min_offer_value: default_min_offer_value(),
            max_spread: default_max_spread(),
            spread_tightening: default_spread_tightening(),
            skip_marginal_offers: default_skip_marginal_offers(),
            misallocation_tolerance: default_misallocation_tolerance(),
            anchor_rebalance_risk_max: default_risk_max(),
            base_reserve: default_base_reserve(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::ConfigRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let settings: Settings = toml::from_str(&contents)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate settings invariants.
    pub fn validate(&self) -> Result<()> {
        if self.currency.is_empty() {
            return Err(Error::Config("currency must not be empty".into()));
        }
        if !(0.0..1.0).contains(&self.balance_target_deviation) {
            return Err(Error::Config(
                "balance_target_deviation must be in [0.0, 1.0)".into(),
            ));
        }
        if self.min_offer_value < 0.0 {
            return Err(Error::Config("min_offer_value must be >= 0".into()));
        }
        if !(0.0..1.0).contains(&self.max_spread) {
            return Err(Error::Config("max_spread must be in [0.0, 1.0)".into()));
        }
        if !(0.0..=1.0).contains(&self.spread_tightening) {
            return Err(Error::Config(
                "spread_tightening must be in [0.0, 1.0]".into(),
            ));
        }
        if self.skip_marginal_offers < 0.0 {
            return Err(Error::Config("skip_marginal_offers must be >= 0".into()));
        }
        if self.misallocation_tolerance < 0.0 {
            return Err(Error::Config(
                "misallocation_tolerance must be >= 0".into(),
            ));
        }
        if self.anchor_rebalance_risk_max < 0.0 {
            return Err(Error::Config(
                "anchor_rebalance_risk_max must be >= 0".into(),
            ));
        }
        if self.base_reserve <= 0.0 {
            return Err(Error::Config("base_reserve must be > 0".into()));
        }
        Ok(())
    }
}
