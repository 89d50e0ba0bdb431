//! Live order-book view for one asset/anchor pair against the native quote.
//!
//! Snapshots are ingested from an external stream and normalized once:
//! bid amounts arrive denominated in the quote asset and are converted to
//! base units, prices are re-expressed in the reference currency through
//! the quote asset's own price, and cumulative depth fields are rebuilt.
//! The synthesis engine only ever reads the normalized view.

use serde::Serialize;

use crate::num::fixed7;

/// Book side an entry rests on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Side {
    Bid,
    Ask,
}

impl Side {
    /// The side a trade of `size` base units joins as a maker.
    /// Buying joins the bids, selling joins the asks.
    pub fn for_size(size: f64) -> Side {
        if size > 0.0 { Side::Bid } else { Side::Ask }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Bid => write!(f, "bid"),
            Side::Ask => write!(f, "ask"),
        }
    }
}

/// A raw order-book row as delivered by the market-data collaborator.
/// Prices are in quote terms; bid amounts are in quote units, ask amounts
/// in base units (ledger convention).
#[derive(Debug, Clone, Copy)]
pub struct RawOffer {
    pub price: f64,
    pub amount: f64,
    pub offer_id: u64,
}

/// A normalized order-book entry.
#[derive(Debug, Clone)]
pub struct BookEntry {
    pub side: Side,
    /// Price in quote-asset terms (as quoted on the ledger).
    pub base_price: f64,
    /// Price in reference currency.
    pub price: f64,
    /// Amount in base-asset units.
    pub amount: f64,
    /// Cumulative base-asset amount up to and including this entry.
    pub base_volume: f64,
    /// Cumulative reference-currency value up to and including this entry.
    pub volume: f64,
    pub offer_id: u64,
}

/// Best-bid/best-ask view of one trading pair.
#[derive(Debug, Clone, Default)]
pub struct OrderBook {
    bids: Vec<BookEntry>,
    asks: Vec<BookEntry>,
    fetched: bool,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the book content with a fresh snapshot.
    ///
    /// `quote_price` is the quote asset's price in reference currency and
    /// is used to re-express entry prices; cumulative fields are rebuilt
    /// from scratch.
    pub fn ingest(&mut self, bids: &[RawOffer], asks: &[RawOffer], quote_price: f64) {
        self.bids = normalize(bids, Side::Bid, quote_price);
        self.asks = normalize(asks, Side::Ask, quote_price);
        self.fetched = true;
    }

    /// Whether a snapshot has been received yet.
    pub fn is_fetched(&self) -> bool {
        self.fetched
    }

    pub fn side(&self, side: Side) -> &[BookEntry] {
        match side {
            Side::Bid => &self.bids,
            Side::Ask => &self.asks,
        }
    }

    pub fn bids(&self) -> &[BookEntry] {
        &self.bids
    }

    pub fn asks(&self) -> &[BookEntry] {
        &self.asks
    }

    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|entry| entry.price)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|entry| entry.price)
    }

    pub fn spread(&self) -> Option<f64> {
        Some(self.best_ask()? - self.best_bid()?)
    }

    /// Spread as a percentage of the best ask.
    pub fn spread_pct(&self) -> Option<f64> {
        let ask = self.best_ask()?;
        if ask == 0.0 {
            return None;
        }
        Some(100.0 * self.spread()? / ask)
    }

    /// Midpoint of best bid and best ask.
    pub fn mid(&self) -> Option<f64> {
        Some((self.best_bid()? + self.best_ask()?) / 2.0)
    }

    /// Price of the asset at a depth of 10% of `holdings` base units,
    /// read from the bid side. Falls back to `None` on an empty book.
    pub fn market_price(&self, holdings: f64) -> Option<f64> {
        self.bids
            .iter()
            .find(|entry| entry.volume > holdings * entry.price / 10.0)
            .map(|entry| entry.price)
    }

    /// Effective price of the pair: midpoint when the base asset carries a
    /// global quote, depth-weighted bid price otherwise.
    pub fn price(&self, has_global_price: bool, holdings: f64) -> Option<f64> {
        if !self.fetched {
            return None;
        }
        if has_global_price {
            self.mid()
        } else {
            self.market_price(holdings)
        }
    }

    /// First (best-priced) entry of `side` satisfying `filter`.
    pub fn find(&self, side: Side, filter: impl Fn(&BookEntry) -> bool) -> Option<&BookEntry> {
        self.side(side).iter().find(|entry| filter(entry))
    }
}

fn normalize(rows: &[RawOffer], side: Side, quote_price: f64) -> Vec<BookEntry> {
    let mut entries: Vec<BookEntry> = rows
        .iter()
        .map(|row| {
            let amount = match side {
                Side::Ask => row.amount,
                // Bid amounts arrive in quote units.
                Side::Bid => fixed7(row.amount / row.price),
            };
            BookEntry {
                side,
                base_price: row.price,
                price: fixed7(row.price * quote_price),
                amount,
                base_volume: 0.0,
                volume: 0.0,
                offer_id: row.offer_id,
            }
        })
        .collect();

    // Best prices first: bids descending, asks ascending.
    match side {
        Side::Bid => entries.sort_by(|a, b| b.price.total_cmp(&a.price)),
        Side::Ask => entries.sort_by(|a, b| a.price.total_cmp(&b.price)),
    }

    let mut base_volume = 0.0;
    let mut volume = 0.0;
    for entry in &mut entries {
        base_volume += entry.amount;
        volume += fixed7(entry.amount * entry.price);
        entry.base_volume = base_volume;
        entry.volume = volume;
    }
    entries
}
