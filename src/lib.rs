//! # lumenfolio
//!
//! A portfolio-rebalancing engine for a Stellar DEX account. Users
//! declare a target allocation as a tree of weight/percentage/amount
//! nodes; the engine compares it against live holdings and synthesizes
//! the maker offers that close the gap, subject to venue liquidity,
//! spread and anchor-diversification constraints.
//!
//! ## Features
//!
//! - **Allocation modes**: weight, percentage, fixed amount, ignore,
//!   remove (full liquidation)
//! - **Multi-anchor assets**: per-anchor target bands, inter-anchor
//!   rebalancing with a per-step risk cap
//! - **Liquidity throttle**: trades scale back when planned buys exceed
//!   the free native-asset liquidity
//! - **Maker pricing**: spread tightening with clamping around the
//!   global market price, exact rational prices for the ledger
//! - **Plan persistence**: compact JSON serialization with
//!   change-tracking against the last-saved plan
//!
//! ## Quick Start
//!
//! ```
//! use lumenfolio::{NATIVE, Portfolio, RawOffer, Settings, Target};
//!
//! let settings = Settings::default();
//! let mut portfolio = Portfolio::new();
//!
//! // Live account state, fed by external collaborators: 500 XLM at
//! // 0.10 USD and 100 MOBI at 0.40 USD, with a MOBI/XLM order book.
//! portfolio.set_global_price(NATIVE, 0.10);
//! portfolio.update_balance(NATIVE, "", 500.0, 0.0, 0.0);
//! portfolio.set_global_price("MOBI", 0.40);
//! portfolio.update_balance("MOBI", "GA7FCCMXFN4WTTCXI245Z7KWHSMWMJGVN4SIXY67IK6RIZVVAYWGV4LP", 100.0, 0.0, 0.0);
//! let bids = [RawOffer { price: 4.0, amount: 40_000.0, offer_id: 1 }];
//! let asks = [RawOffer { price: 4.2, amount: 10_000.0, offer_id: 2 }];
//! portfolio.ingest_book("MOBI", "GA7FCCMXFN4WTTCXI245Z7KWHSMWMJGVN4SIXY67IK6RIZVVAYWGV4LP", &bids, &asks);
//!
//! // The plan: split portfolio value evenly between XLM and MOBI.
//! let mut plan = Target::from_json(r#"{"childs":["MOBI","XLM"]}"#, &mut portfolio)?;
//! plan.rebalance(&mut portfolio, &settings);
//!
//! assert!(plan.error().is_none());
//! assert_eq!(plan.operations().len(), 1);
//! for line in plan.descriptions(&settings.currency) {
//!     println!("{line}"); // "Buy 12.5 MOBI at 0.4 USD"
//! }
//! # Ok::<(), lumenfolio::Error>(())
//! ```
//!
//! ## Architecture
//!
//! The engine is synchronous and single-threaded. External collaborators
//! inject prices, balances and order-book snapshots into [`Portfolio`];
//! each [`Target::rebalance`] call then runs two discrete passes over
//! the plan: the allocation strategy (values, shares, amounts, top-down)
//! and order synthesis (per-leaf operation sets). Outputs are ledger
//! consumable [`OfferDescriptor`]s, display strings, and the serialized
//! plan. Allocation errors never panic or propagate: they surface via
//! [`Target::error`].

pub mod asset;
pub mod book;
pub mod config;
pub mod error;
pub mod num;
pub mod order;
pub mod portfolio;
mod strategy;
pub mod target;

pub use asset::{Anchor, Asset, AssetKind, Balance, OpenOffer, TrustlineAction};
pub use book::{BookEntry, OrderBook, RawOffer, Side};
pub use config::Settings;
pub use error::{Error, Result};
pub use order::{OfferDescriptor, Operation, Order, OrderStatus, PriceRatio, TradeDirection};
pub use portfolio::{NATIVE, Portfolio};
pub use target::{Mode, Target, TrustlineChange};
