//! Account-level aggregate: the set of held assets, the anchor registry,
//! and the ingestion points external collaborators feed with prices,
//! balances and order-book snapshots.
//!
//! The portfolio never initiates I/O. Price feeds, account polling and
//! book streams call into [`Portfolio::set_global_price`],
//! [`Portfolio::update_balance`] and [`Portfolio::ingest_book`]; the
//! target tree then recomputes from the updated state.

use rustc_hash::FxHashMap;

use crate::asset::{Anchor, Asset, Balance};
use crate::book::RawOffer;

/// The native asset code. Quotes, reserves and liquidity are expressed
/// against it.
pub const NATIVE: &str = "XLM";

#[derive(Debug, Clone)]
pub struct Portfolio {
    assets: Vec<Asset>,
    anchors: FxHashMap<String, Anchor>,
    /// Account data entries, counted into the minimum reserve.
    pub data_entries: usize,
    /// Signers beyond the master key.
    pub extra_signers: usize,
}

impl Default for Portfolio {
    fn default() -> Self {
        Self::new()
    }
}

impl Portfolio {
    /// An empty portfolio holding only the native asset.
    pub fn new() -> Self {
        Portfolio {
            assets: vec![Asset::new(NATIVE)],
            anchors: FxHashMap::default(),
            data_entries: 0,
            extra_signers: 0,
        }
    }

    pub fn assets(&self) -> &[Asset] {
        &self.assets
    }

    pub fn asset(&self, code: &str) -> Option<&Asset> {
        self.assets.iter().find(|a| a.code == code)
    }

    pub fn asset_mut(&mut self, code: &str) -> Option<&mut Asset> {
        self.assets.iter_mut().find(|a| a.code == code)
    }

    /// The asset for `code`, created on first reference.
    pub fn resolve_asset(&mut self, code: &str) -> &mut Asset {
        if let Some(index) = self.assets.iter().position(|a| a.code == code) {
            &mut self.assets[index]
        } else {
            self.assets.push(Asset::new(code));
            self.assets.last_mut().expect("just pushed")
        }
    }

    pub fn native(&self) -> &Asset {
        self.asset(NATIVE).expect("native asset always present")
    }

    pub fn native_mut(&mut self) -> &mut Asset {
        self.asset_mut(NATIVE).expect("native asset always present")
    }

    /// Register a known anchor. Later balance updates resolve display
    /// names and tether codes through this registry.
    pub fn register_anchor(&mut self, anchor: Anchor) {
        self.anchors.insert(anchor.pubkey.clone(), anchor);
    }

    pub fn anchor(&self, pubkey: &str) -> Option<&Anchor> {
        self.anchors.get(pubkey)
    }

    /// Total portfolio value in reference currency.
    pub fn total(&self) -> f64 {
        self.assets.iter().map(Asset::value).sum()
    }

    /// Number of open trustlines (non-native balances).
    pub fn trustline_count(&self) -> usize {
        self.assets
            .iter()
            .flat_map(|a| &a.balances)
            .filter(|b| b.has_trustline && !b.issuer.is_empty())
            .count()
    }

    /// Minimum native balance the account must keep: the network reserve,
    /// one offer entry reserved per trustline, and half a unit of headroom
    /// for fees and rounding.
    pub fn minimum_balance(&self, base_reserve: f64) -> f64 {
        let entries = 2 * self.trustline_count() + self.data_entries + self.extra_signers;
        (3 + entries) as f64 * base_reserve
    }

    /// Recompute the native reserve floor after an account refresh.
    pub fn refresh_reserve(&mut self, base_reserve: f64) {
        let minimum = self.minimum_balance(base_reserve);
        self.native_mut().amount_min = minimum;
    }

    /// Set an asset's external reference price. Zero clears it (unpriced).
    pub fn set_global_price(&mut self, code: &str, price: f64) {
        let asset = self.resolve_asset(code);
        asset.global_price = if price == 0.0 { None } else { Some(price) };
    }

    /// Apply one account-refresh record for a (code, issuer) holding,
    /// creating the asset and balance on first reference.
    pub fn update_balance(
        &mut self,
        code: &str,
        issuer: &str,
        amount: f64,
        buying: f64,
        selling: f64,
    ) {
        let asset_code = self.asset_code_for(code, issuer);
        let anchor_name = self.anchors.get(issuer).map(|a| a.name.clone());
        let asset = self.resolve_asset(&asset_code);

        let balance = match asset.balance_mut(issuer) {
            Some(balance) => balance,
            None => {
                asset.balances.push(Balance::new(code, issuer));
                asset.balances.last_mut().expect("just pushed")
            }
        };
        balance.update(amount, buying, selling);
        balance.has_trustline = true;
        if let Some(name) = anchor_name {
            balance.anchor_name = name;
        }
    }

    /// Replace the order-book snapshot of the (code, issuer) pair. The
    /// native asset's current price converts quoted prices into reference
    /// currency.
    pub fn ingest_book(&mut self, code: &str, issuer: &str, bids: &[RawOffer], asks: &[RawOffer]) {
        let quote_price = self.native().price();
        let asset_code = self.asset_code_for(code, issuer);
        if let Some(balance) = self
            .asset_mut(&asset_code)
            .and_then(|asset| asset.balance_mut(issuer))
        {
            balance.book.ingest(bids, asks, quote_price);
        }
    }

    /// Ids of open offers flagged outdated, available for replacement.
    pub fn outdated_offer_ids(&self) -> Vec<u64> {
        self.assets
            .iter()
            .flat_map(|a| &a.offers)
            .filter(|offer| offer.outdated)
            .map(|offer| offer.id)
            .collect()
    }

    /// Map an anchor-local issuance code back to the asset code.
    fn asset_code_for(&self, code: &str, issuer: &str) -> String {
        if issuer.is_empty() {
            return NATIVE.into();
        }
        // Reverse tether lookup: which asset does this anchor issue
        // under `code`?
        if let Some(asset_code) = self
            .anchors
            .get(issuer)
            .and_then(|anchor| anchor.reverse_tether(code))
        {
            return asset_code.to_string();
        }
        code.to_string()
    }
}
