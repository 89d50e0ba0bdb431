//! Market entities: assets, anchors and per-anchor balances.
//!
//! An [`Asset`] aggregates one account holding across every anchor that
//! issues it; each [`Balance`] carries its own order book against the
//! native asset plus the target-allocation window the synthesis engine
//! derives from the leaf target's amount.

use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::book::{BookEntry, OrderBook, Side};
use crate::num::{fixed7, negative, positive};

/// Broad classification of a tradable instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    Native,
    Fiat,
    Crypto,
    Unknown,
}

const KNOWN_FIATS: &[&str] = &["USD", "EUR", "CNY"];
const KNOWN_CRYPTOS: &[&str] = &[
    "BTC", "ETH", "XRP", "KIN", "BAT", "ZRX", "BCH", "STEEM", "SBD", "LINK", "SLT", "MOBI", "SHX",
    "RMT", "TERN", "PEDI", "GRAT", "REPO",
];

impl AssetKind {
    /// Classification for a bare asset code.
    pub fn for_code(code: &str) -> AssetKind {
        if code == "XLM" {
            AssetKind::Native
        } else if KNOWN_FIATS.contains(&code) {
            AssetKind::Fiat
        } else if KNOWN_CRYPTOS.contains(&code) {
            AssetKind::Crypto
        } else {
            AssetKind::Unknown
        }
    }
}

/// An issuer of non-native assets, identified by its public key.
/// Immutable once registered.
#[derive(Debug, Clone)]
pub struct Anchor {
    pub pubkey: String,
    pub name: String,
    /// Asset code → the code this anchor issues it under, when they differ.
    tethers: FxHashMap<String, String>,
}

impl Anchor {
    pub fn new(pubkey: impl Into<String>, name: impl Into<String>) -> Self {
        Anchor {
            pubkey: pubkey.into(),
            name: name.into(),
            tethers: FxHashMap::default(),
        }
    }

    /// Declare that this anchor issues `code` under the local code `tether`.
    pub fn with_tether(mut self, code: impl Into<String>, tether: impl Into<String>) -> Self {
        self.tethers.insert(code.into(), tether.into());
        self
    }

    /// The anchor-local issuance code for `code`.
    pub fn tether_code<'a>(&'a self, code: &'a str) -> &'a str {
        self.tethers.get(code).map(String::as_str).unwrap_or(code)
    }

    /// The asset code this anchor issues under the local code `tether`,
    /// when a mapping exists.
    pub fn reverse_tether(&self, tether: &str) -> Option<&str> {
        self.tethers
            .iter()
            .find(|(_, local)| local.as_str() == tether)
            .map(|(code, _)| code.as_str())
    }
}

/// Trustline transition in progress for a balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustlineAction {
    Opening,
    Closing,
}

/// An open offer of the account contributing to an asset's liabilities.
#[derive(Debug, Clone)]
pub struct OpenOffer {
    pub id: u64,
    pub amount: f64,
    pub price: f64,
    /// Set by the offer-tracking collaborator when the offer no longer
    /// matches the current plan and should be replaced.
    pub outdated: bool,
}

/// One (asset, anchor) holding on the account.
#[derive(Debug, Clone)]
pub struct Balance {
    /// Anchor-local issuance code.
    pub code: String,
    /// Issuer public key. Empty for the native balance.
    pub issuer: String,
    /// Anchor display name, resolved at creation.
    pub anchor_name: String,
    pub amount: f64,
    /// Buying liabilities (open-offer exposure).
    pub buying: f64,
    /// Selling liabilities.
    pub selling: f64,
    pub has_trustline: bool,
    pub action: Option<TrustlineAction>,
    /// Per-anchor fair share of the leaf target amount. `None` while the
    /// balance is untradable (no book price, or trustline inactive).
    pub target_amount: Option<f64>,
    /// Order book of this balance's pair against the native asset.
    pub book: OrderBook,
}

impl Balance {
    pub fn new(code: impl Into<String>, issuer: impl Into<String>) -> Self {
        let issuer = issuer.into();
        Balance {
            code: code.into(),
            anchor_name: shorten(&issuer),
            issuer,
            amount: 0.0,
            buying: 0.0,
            selling: 0.0,
            has_trustline: false,
            action: None,
            target_amount: None,
            book: OrderBook::new(),
        }
    }

    /// Refresh held amount and open-offer exposure from an account update.
    pub fn update(&mut self, amount: f64, buying: f64, selling: f64) {
        self.amount = amount;
        self.buying = buying;
        self.selling = selling;
    }

    /// Whether this balance takes part in trading: an open trustline that
    /// is not being closed, or one being opened.
    pub fn is_active(&self) -> bool {
        if self.has_trustline {
            self.action != Some(TrustlineAction::Closing)
        } else {
            self.action == Some(TrustlineAction::Opening)
        }
    }

    /// Lower bound of the allowed deviation band, given the global
    /// tolerance.
    pub fn target_min(&self, deviation: f64) -> Option<f64> {
        self.target_amount.map(|t| fixed7(t * (1.0 - deviation)))
    }

    /// Upper bound of the allowed deviation band.
    pub fn target_max(&self, deviation: f64) -> Option<f64> {
        self.target_amount.map(|t| fixed7(t * (1.0 + deviation)))
    }

    fn target_min_diff(&self, deviation: f64) -> Option<f64> {
        self.target_min(deviation).map(|min| fixed7(min - self.amount))
    }

    fn target_max_diff(&self, deviation: f64) -> Option<f64> {
        self.target_max(deviation).map(|max| fixed7(max - self.amount))
    }

    /// Largest sell (≤ 0) that keeps the balance within its band.
    pub fn size_min(&self, deviation: f64) -> f64 {
        self.target_min_diff(deviation).map_or(0.0, negative)
    }

    /// Largest buy (≥ 0) that keeps the balance within its band.
    pub fn size_max(&self, deviation: f64) -> f64 {
        self.target_max_diff(deviation).map_or(0.0, positive)
    }

    /// Shortfall below the band's lower bound, as a negative number.
    pub fn under_min(&self, deviation: f64) -> f64 {
        self.target_min_diff(deviation)
            .map_or(0.0, |diff| negative(-diff))
    }

    /// Excess above the band's upper bound, as a positive number.
    pub fn over_max(&self, deviation: f64) -> f64 {
        self.target_max_diff(deviation)
            .map_or(0.0, |diff| positive(-diff))
    }
}

/// A tradable instrument, aggregated over its per-anchor balances.
#[derive(Debug, Clone)]
pub struct Asset {
    pub code: String,
    pub kind: AssetKind,
    /// External reference price, when a global quote exists.
    pub global_price: Option<f64>,
    pub balances: Vec<Balance>,
    /// Open offers of the account involving this asset.
    pub offers: Vec<OpenOffer>,
    /// Minimum amount that must stay on the account (native reserve).
    pub amount_min: f64,
}

impl Asset {
    pub fn new(code: impl Into<String>) -> Self {
        let code = code.into();
        Asset {
            kind: AssetKind::for_code(&code),
            code,
            global_price: None,
            balances: Vec::new(),
            offers: Vec::new(),
            amount_min: 0.0,
        }
    }

    /// Total held amount over all balances.
    pub fn amount(&self) -> f64 {
        self.balances.iter().map(|b| b.amount).sum()
    }

    /// Current price in reference currency: the global quote when one
    /// exists, the aggregated order-book price otherwise, zero when
    /// unpriced.
    pub fn price(&self) -> f64 {
        if let Some(price) = self.global_price {
            return price;
        }
        let holdings = self.amount();
        self.balances
            .iter()
            .filter_map(|b| b.book.price(false, holdings))
            .next()
            .unwrap_or(0.0)
    }

    /// Current held value in reference currency.
    pub fn value(&self) -> f64 {
        let amount = self.amount();
        if amount == 0.0 { 0.0 } else { amount * self.price() }
    }

    /// Net open-offer exposure in reference currency.
    pub fn liabilities(&self) -> f64 {
        let raw: f64 = self.balances.iter().map(|b| b.buying - b.selling).sum();
        self.price() * raw
    }

    /// Whether rebalancing is supported: either a known classification or
    /// a discoverable price.
    pub fn is_supported(&self) -> bool {
        self.kind != AssetKind::Unknown || self.price() != 0.0
    }

    /// Whether at least one balance has received a book snapshot.
    pub fn is_book_fetched(&self) -> bool {
        self.balances.iter().any(|b| b.book.is_fetched())
    }

    /// Best bid over every anchor's book.
    pub fn best_bid(&self) -> Option<f64> {
        self.balances
            .iter()
            .filter_map(|b| b.book.best_bid())
            .max_by(f64::total_cmp)
    }

    /// Best ask over every anchor's book.
    pub fn best_ask(&self) -> Option<f64> {
        self.balances
            .iter()
            .filter_map(|b| b.book.best_ask())
            .min_by(f64::total_cmp)
    }

    /// Aggregated spread as a percentage of the best ask.
    pub fn spread_pct(&self) -> Option<f64> {
        let (bid, ask) = (self.best_bid()?, self.best_ask()?);
        if ask == 0.0 {
            return None;
        }
        Some(100.0 * (ask - bid) / ask)
    }

    /// First (best-priced) entry of `side` across all anchors' books that
    /// satisfies `filter`. An entry failing the filter falls through to
    /// the next one in price order, deeper levels of the same anchor
    /// included. Returns the owning balance's index along with the entry.
    pub fn find_offer(
        &self,
        side: Side,
        filter: impl Fn(&Balance, &BookEntry) -> bool,
    ) -> Option<(usize, &BookEntry)> {
        let mut merged: Vec<(usize, &BookEntry)> = self
            .balances
            .iter()
            .enumerate()
            .flat_map(|(i, b)| b.book.side(side).iter().map(move |entry| (i, entry)))
            .collect();
        match side {
            Side::Bid => merged.sort_by(|a, b| b.1.price.total_cmp(&a.1.price)),
            Side::Ask => merged.sort_by(|a, b| a.1.price.total_cmp(&b.1.price)),
        }

        merged
            .into_iter()
            .find(|(index, entry)| filter(&self.balances[*index], entry))
    }

    /// The balance held with `issuer`, if any.
    pub fn balance(&self, issuer: &str) -> Option<&Balance> {
        self.balances.iter().find(|b| b.issuer == issuer)
    }

    pub fn balance_mut(&mut self, issuer: &str) -> Option<&mut Balance> {
        self.balances.iter_mut().find(|b| b.issuer == issuer)
    }

    /// Whether any non-outdated open offer is still working.
    pub fn has_live_offers(&self) -> bool {
        self.offers.iter().any(|offer| !offer.outdated)
    }
}

/// Short display form of a public key, in the usual `GABC...WXYZ` style.
fn shorten(pubkey: &str) -> String {
    if pubkey.len() > 12 {
        format!("{}...{}", &pubkey[..4], &pubkey[pubkey.len() - 4..])
    } else {
        pubkey.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::RawOffer;

    fn raw(price: f64, amount: f64) -> RawOffer {
        RawOffer {
            price,
            amount,
            offer_id: 0,
        }
    }

    fn balance_with_book(issuer: &str, amount: f64, bid: f64, ask: f64) -> Balance {
        let mut balance = Balance::new("BTC", issuer);
        balance.has_trustline = true;
        balance.amount = amount;
        balance
            .book
            .ingest(&[raw(bid, bid * 100.0)], &[raw(ask, 100.0)], 1.0);
        balance
    }

    #[test]
    fn kind_classification() {
        assert_eq!(AssetKind::for_code("XLM"), AssetKind::Native);
        assert_eq!(AssetKind::for_code("USD"), AssetKind::Fiat);
        assert_eq!(AssetKind::for_code("BTC"), AssetKind::Crypto);
        assert_eq!(AssetKind::for_code("WAT"), AssetKind::Unknown);
    }

    #[test]
    fn anchor_tether_codes() {
        let anchor = Anchor::new("GABC", "apay.io").with_tether("BTC", "BTCA");
        assert_eq!(anchor.tether_code("BTC"), "BTCA");
        assert_eq!(anchor.tether_code("ETH"), "ETH");
    }

    #[test]
    fn balance_activity_follows_trustline_state() {
        let mut balance = Balance::new("BTC", "GABC");
        assert!(!balance.is_active());

        balance.action = Some(TrustlineAction::Opening);
        assert!(balance.is_active());

        balance.has_trustline = true;
        balance.action = None;
        assert!(balance.is_active());

        balance.action = Some(TrustlineAction::Closing);
        assert!(!balance.is_active());
    }

    #[test]
    fn target_window_derivation() {
        let mut balance = Balance::new("BTC", "GABC");
        balance.amount = 30.0;
        balance.target_amount = Some(50.0);

        // ±20% band around 50: [40, 60].
        assert_eq!(balance.target_min(0.2), Some(40.0));
        assert_eq!(balance.target_max(0.2), Some(60.0));
        // Holding 30: under the band by 10, may buy up to 30 more.
        assert_eq!(balance.under_min(0.2), -10.0);
        assert_eq!(balance.over_max(0.2), 0.0);
        assert_eq!(balance.size_min(0.2), 0.0);
        assert_eq!(balance.size_max(0.2), 30.0);
    }

    #[test]
    fn target_window_over_band() {
        let mut balance = Balance::new("BTC", "GABC");
        balance.amount = 70.0;
        balance.target_amount = Some(50.0);

        assert_eq!(balance.under_min(0.2), 0.0);
        assert_eq!(balance.over_max(0.2), 10.0);
        // May sell down to 40, i.e. up to 30 units.
        assert_eq!(balance.size_min(0.2), -30.0);
        assert_eq!(balance.size_max(0.2), 0.0);
    }

    #[test]
    fn target_window_absent_without_target() {
        let balance = Balance::new("BTC", "GABC");
        assert_eq!(balance.target_min(0.2), None);
        assert_eq!(balance.size_min(0.2), 0.0);
        assert_eq!(balance.over_max(0.2), 0.0);
    }

    #[test]
    fn asset_aggregates_balances() {
        let mut asset = Asset::new("BTC");
        asset.global_price = Some(10_000.0);
        let mut b1 = Balance::new("BTC", "GAAA");
        b1.update(0.5, 0.0, 0.1);
        let mut b2 = Balance::new("BTC", "GBBB");
        b2.update(1.5, 0.2, 0.0);
        asset.balances.push(b1);
        asset.balances.push(b2);

        assert_eq!(asset.amount(), 2.0);
        assert_eq!(asset.value(), 20_000.0);
        // Net exposure: (0 - 0.1) + (0.2 - 0) = 0.1 BTC.
        assert!((asset.liabilities() - 1_000.0).abs() < 1e-9);
    }

    #[test]
    fn asset_best_prices_across_anchors() {
        let mut asset = Asset::new("BTC");
        asset.balances.push(balance_with_book("GAAA", 1.0, 0.98, 1.04));
        asset.balances.push(balance_with_book("GBBB", 1.0, 0.99, 1.06));

        assert_eq!(asset.best_bid(), Some(0.99));
        assert_eq!(asset.best_ask(), Some(1.04));
    }

    #[test]
    fn find_offer_best_priced_across_anchors() {
        let mut asset = Asset::new("BTC");
        asset.balances.push(balance_with_book("GAAA", 1.0, 0.98, 1.04));
        asset.balances.push(balance_with_book("GBBB", 1.0, 0.99, 1.06));

        let (index, entry) = asset.find_offer(Side::Bid, |_, _| true).unwrap();
        assert_eq!(asset.balances[index].issuer, "GBBB");
        assert_eq!(entry.price, 0.99);

        // Filter rejecting the better anchor falls through to the next one.
        let (index, _) = asset
            .find_offer(Side::Bid, |balance, _| balance.issuer == "GAAA")
            .unwrap();
        assert_eq!(asset.balances[index].issuer, "GAAA");
    }

    #[test]
    fn find_offer_falls_through_within_one_anchor() {
        // A thin top level must not disqualify the anchor's deeper levels.
        let mut asset = Asset::new("BTC");
        let mut balance = Balance::new("BTC", "GAAA");
        balance.has_trustline = true;
        balance.amount = 1.0;
        balance
            .book
            .ingest(&[raw(1.0, 2.0), raw(0.9, 500.0)], &[raw(1.1, 100.0)], 1.0);
        asset.balances.push(balance);

        let (index, entry) = asset
            .find_offer(Side::Bid, |_, entry| entry.base_volume > 50.0)
            .unwrap();
        assert_eq!(index, 0);
        assert_eq!(entry.price, 0.9);
    }

    #[test]
    fn unknown_asset_with_price_is_supported() {
        let mut asset = Asset::new("WAT");
        assert!(!asset.is_supported());
        asset.global_price = Some(3.0);
        assert!(asset.is_supported());
    }

    #[test]
    fn live_offers_ignore_outdated() {
        let mut asset = Asset::new("BTC");
        asset.offers.push(OpenOffer {
            id: 1,
            amount: 5.0,
            price: 1.0,
            outdated: true,
        });
        assert!(!asset.has_live_offers());
        asset.offers.push(OpenOffer {
            id: 2,
            amount: 5.0,
            price: 1.0,
            outdated: false,
        });
        assert!(asset.has_live_offers());
    }
}
