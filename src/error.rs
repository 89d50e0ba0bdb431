//! Error types for the rebalancing engine.

use std::path::PathBuf;

/// All errors that can occur during engine operation.
///
/// Allocation errors (`OverAllocated`, `UnderAllocated`, `NegativeTotal`,
/// `InsufficientLiquidity`) are raised during strategy recomputation and
/// caught at the target-tree root, where they surface as a user-visible
/// message rather than propagating to the caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("failed to read config file {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("rebalance setup is over portfolio value by {amount:.2} {currency} ({percent:.2}%)")]
    OverAllocated {
        amount: f64,
        percent: f64,
        currency: String,
    },

    #[error("rebalance setup is under portfolio value by {amount:.2} {currency} ({percent:.2}%)")]
    UnderAllocated {
        amount: f64,
        percent: f64,
        currency: String,
    },

    #[error("portfolio total value is not positive")]
    NegativeTotal,

    #[error("not enough {0} to trade")]
    InsufficientLiquidity(String),

    #[error("failed to parse target plan: {0}")]
    PlanParse(#[from] serde_json::Error),

    #[error("invalid target plan: {0}")]
    Plan(String),

    #[error("missing issuer for {0}")]
    MissingIssuer(String),

    #[error("target is not a group")]
    NotAGroup,

    #[error("asset already has a target: {0}")]
    DuplicateTarget(String),
}

pub type Result<T> = std::result::Result<T, Error>;
