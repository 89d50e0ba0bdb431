//! Order synthesis: turning a leaf target's amount delta into concrete
//! maker offers against the live order books.
//!
//! Synthesis is a pure recomputation: `refresh` clears the operation set
//! and rebuilds it from current inputs, so a fresh tick never leaks stale
//! entries. Operations are keyed by `(anchor, price)` and merged within a
//! pass, which keeps the list stable across recomputation with unchanged
//! inputs.

use log::debug;
use serde::Serialize;

use crate::asset::{Asset, Balance, TrustlineAction};
use crate::book::{BookEntry, Side};
use crate::config::Settings;
use crate::num::{absolute_min, array_scale, array_sum, clamp, fixed7, negative, positive};
use crate::target::Mode;

/// Largest numerator/denominator the ledger accepts for an offer price.
const PRICE_DIGITS_MAX: u64 = 999_999_999;

/// An exact rational price, as required by ledger offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PriceRatio {
    pub n: u64,
    pub d: u64,
}

impl PriceRatio {
    /// Build the integer ratio `price / quote_price`, right-shifting both
    /// terms until they fit the ledger's digit bound.
    pub fn from_prices(price: f64, quote_price: f64) -> PriceRatio {
        let mut n = (price * 1e10).round() as u64;
        let mut d = (quote_price * 1e10).round() as u64;
        while n > PRICE_DIGITS_MAX || d > PRICE_DIGITS_MAX {
            n = (n + 5) / 10;
            d = (d + 5) / 10;
        }
        PriceRatio { n, d: d.max(1) }
    }

    /// The reciprocal ratio.
    pub fn inverse(self) -> PriceRatio {
        PriceRatio {
            n: self.d,
            d: self.n.max(1),
        }
    }
}

/// A synthesized offer derived from (but not aliasing) a live book entry:
/// same pair and depth information, tightened and clamped price.
#[derive(Debug, Clone)]
pub struct ProposedOffer {
    pub side: Side,
    /// Anchor-local issuance code of the traded balance.
    pub code: String,
    pub issuer: String,
    pub anchor_name: String,
    /// Price in reference currency, after tightening and clamping.
    pub price: f64,
    /// Exact price in native-asset terms, as an integer ratio.
    pub price_r: PriceRatio,
    /// Cumulative base volume of the source entry.
    pub base_volume: f64,
}

/// Trade direction of an operation, from the account's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TradeDirection {
    Buy,
    Sell,
}

impl std::fmt::Display for TradeDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradeDirection::Buy => write!(f, "Buy"),
            TradeDirection::Sell => write!(f, "Sell"),
        }
    }
}

/// One planned trade: a proposed offer plus the base amount to trade.
#[derive(Debug, Clone)]
pub struct Operation {
    /// Identity key: `{anchor}:{price}`. Repeated synthesis against the
    /// same anchor/price updates the existing operation.
    pub key: String,
    /// Base-asset amount, 7-decimal fixed, always positive.
    pub amount: f64,
    /// Reference-currency cost of the trade.
    pub cost: f64,
    pub offer: ProposedOffer,
}

impl Operation {
    /// Joining the bid side buys the asset; joining the ask side sells it.
    pub fn direction(&self) -> TradeDirection {
        match self.offer.side {
            Side::Bid => TradeDirection::Buy,
            Side::Ask => TradeDirection::Sell,
        }
    }

    /// The ledger-consumable descriptor for this operation.
    pub fn descriptor(&self) -> OfferDescriptor {
        let base = if self.offer.issuer.is_empty() {
            self.offer.code.clone()
        } else {
            format!("{}:{}", self.offer.code, self.offer.issuer)
        };
        let quote = crate::portfolio::NATIVE.to_string();
        let ratio = self.offer.price_r;

        match self.direction() {
            TradeDirection::Buy => OfferDescriptor {
                buying: base,
                selling: quote,
                // Amount is what we sell: native units at the offer price.
                amount: fixed7(self.amount * ratio.n as f64 / ratio.d as f64),
                price: ratio.inverse(),
                offer_id: 0,
            },
            TradeDirection::Sell => OfferDescriptor {
                buying: quote,
                selling: base,
                amount: self.amount,
                price: ratio,
                offer_id: 0,
            },
        }
    }

    /// Human-readable description, e.g. `Buy 5 BTC at 0.5 USD`.
    pub fn describe(&self, currency: &str) -> String {
        format!(
            "{} {} {} at {} {}",
            self.direction(),
            fmt_num(self.amount),
            self.offer.code,
            fmt_num(self.offer.price),
            currency,
        )
    }
}

/// A ledger-consumable offer description.
#[derive(Debug, Clone, Serialize)]
pub struct OfferDescriptor {
    pub buying: String,
    pub selling: String,
    pub amount: f64,
    pub price: PriceRatio,
    /// Id of an existing offer to replace, 0 to create a new one.
    pub offer_id: u64,
}

/// Waiting state of an order, when operations are deliberately withheld.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderStatus {
    /// Operations reflect current inputs.
    #[default]
    Ready,
    /// The pair's order book has not been fetched yet.
    FetchingBook,
    /// Open offers from a previous pass are still settling.
    Rebalancing,
}

/// The operation set bound to one leaf target.
#[derive(Debug, Clone, Default)]
pub struct Order {
    pub status: OrderStatus,
    pub operations: Vec<Operation>,
}

impl Order {
    pub fn new() -> Self {
        Self::default()
    }

    fn clear(&mut self, status: OrderStatus) {
        self.operations.clear();
        self.status = status;
    }

    /// Record a trade of `amount` base units against `offer`, merging
    /// with an existing operation on the same anchor/price.
    fn add(&mut self, offer: ProposedOffer, amount: f64) {
        let key = format!("{}:{}", offer.anchor_name, offer.price);
        let amount = fixed7(amount);
        let cost = amount * offer.price;
        if let Some(operation) = self.operations.iter_mut().find(|op| op.key == key) {
            operation.amount = amount;
            operation.cost = cost;
            operation.offer = offer;
        } else {
            self.operations.push(Operation {
                key,
                amount,
                cost,
                offer,
            });
        }
    }

    /// Display lines for this order: a waiting placeholder, or one line
    /// per operation.
    pub fn descriptions(&self, currency: &str) -> Vec<String> {
        match self.status {
            OrderStatus::FetchingBook => vec!["Fetching orderbook...".into()],
            OrderStatus::Rebalancing => vec!["Rebalancing...".into()],
            OrderStatus::Ready => self
                .operations
                .iter()
                .map(|op| op.describe(currency))
                .collect(),
        }
    }
}

/// Leaf-target inputs the synthesis engine works from.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LeafContext {
    pub mode: Mode,
    /// Target amount assigned by the strategy engine.
    pub amount: f64,
    /// Target minus current amount (positive: buy).
    pub amount_diff: f64,
    /// Value drift relative to the target value.
    pub value_diff_pct: f64,
}

/// Recompute the operation set for one non-native leaf target.
pub(crate) fn refresh(
    order: &mut Order,
    ctx: &LeafContext,
    asset: &mut Asset,
    quote_price: f64,
    settings: &Settings,
) {
    order.clear(OrderStatus::Ready);

    if ctx.amount_diff == 0.0 {
        return;
    }
    if !asset.is_book_fetched() {
        order.status = OrderStatus::FetchingBook;
        return;
    }
    if asset.liabilities() != 0.0 && asset.has_live_offers() {
        order.status = OrderStatus::Rebalancing;
        return;
    }

    set_balance_targets(asset, ctx.amount);
    let deviation = settings.balance_target_deviation;

    if !anchors_balanced(asset, deviation) {
        balance_anchors(order, ctx, asset, ctx.amount_diff, quote_price, settings);
    } else if one_operation_enough(asset, ctx.amount_diff, deviation) {
        add_one_operation(order, ctx, asset, ctx.amount_diff, None, quote_price, settings);
    } else {
        add_multiple_operations(order, ctx, asset, ctx.amount_diff, quote_price, settings);
    }
}

/// Assign each balance's fair share of the target amount. Balances
/// without a usable book price, or with an inactive trustline, are
/// excluded from trading.
fn set_balance_targets(asset: &mut Asset, target_amount: f64) {
    let has_global = asset.global_price.is_some();
    let holdings = asset.amount();

    let tradable: Vec<usize> = (0..asset.balances.len())
        .filter(|&i| {
            let balance = &asset.balances[i];
            balance.is_active() && balance.book.price(has_global, holdings).is_some()
        })
        .collect();

    for (index, balance) in asset.balances.iter_mut().enumerate() {
        if !tradable.contains(&index) {
            balance.target_amount = None;
        }
    }

    match tradable.len() {
        0 => {}
        1 => asset.balances[tradable[0]].target_amount = Some(target_amount),
        n => {
            let share = fixed7(target_amount / n as f64);
            for index in tradable {
                asset.balances[index].target_amount = Some(share);
            }
        }
    }
}

/// Anchors are imbalanced when one sits under its band's floor while
/// another sits over its ceiling at the same time.
fn anchors_balanced(asset: &Asset, deviation: f64) -> bool {
    let under: f64 = asset.balances.iter().map(|b| b.under_min(deviation)).sum();
    let over: f64 = asset.balances.iter().map(|b| b.over_max(deviation)).sum();
    !(under != 0.0 && over != 0.0)
}

/// Even out anchor holdings with matched buy and sell legs, capped by the
/// per-step risk budget, while still converging toward the overall delta.
fn balance_anchors(
    order: &mut Order,
    ctx: &LeafContext,
    asset: &Asset,
    size: f64,
    quote_price: f64,
    settings: &Settings,
) {
    let deviation = settings.balance_target_deviation;
    let under: f64 = -asset
        .balances
        .iter()
        .map(|b| b.under_min(deviation))
        .sum::<f64>();
    let over: f64 = asset.balances.iter().map(|b| b.over_max(deviation)).sum();

    // Volume sitting outside the bands, net of what the overall delta
    // already absorbs.
    let misallocated = f64::max(under - positive(size), over + negative(size));

    // Cap the transfer by the remaining risk budget for this step.
    let current_risk = ctx.value_diff_pct.abs();
    let amount_cap = ctx.amount * positive(settings.anchor_rebalance_risk_max - current_risk);
    let transfer = misallocated.min(amount_cap);

    let buy = fixed7(transfer + positive(size));
    let sell = fixed7(transfer - negative(size));
    debug!(
        "{}: evening out anchors, transfer {} (buy {}, sell {})",
        asset.code, transfer, buy, sell
    );

    add_multiple_operations(order, ctx, asset, buy, quote_price, settings);
    add_multiple_operations(order, ctx, asset, -sell, quote_price, settings);
}

/// Whether some single anchor's tradable window covers the whole delta.
fn one_operation_enough(asset: &Asset, size: f64, deviation: f64) -> bool {
    asset
        .balances
        .iter()
        .any(|b| b.size_min(deviation) <= size && size <= b.size_max(deviation))
}

/// Split a trade of `size` base units over multiple anchors: liquidating
/// balances first, then misallocated capacity, then balanced capacity in
/// proportion.
fn add_multiple_operations(
    order: &mut Order,
    ctx: &LeafContext,
    asset: &Asset,
    size: f64,
    quote_price: f64,
    settings: &Settings,
) {
    if size == 0.0 {
        return;
    }
    let deviation = settings.balance_target_deviation;
    let buying = size > 0.0;
    let mut trade = vec![0.0; asset.balances.len()];
    let mut trade_size = 0.0;

    // 1. Sell balances being closed.
    if negative(size) != 0.0 {
        let liquidate: Vec<f64> = asset
            .balances
            .iter()
            .map(|b| {
                if b.action == Some(TrustlineAction::Closing) {
                    -b.amount
                } else {
                    0.0
                }
            })
            .collect();
        trade_size = add_to_trade(&mut trade, &liquidate, size);
    }

    // 2. If this was not enough, trade imbalanced anchors.
    if trade_size != size {
        let misallocated: Vec<f64> = asset
            .balances
            .iter()
            .map(|b| {
                if b.action == Some(TrustlineAction::Closing) {
                    0.0
                } else if buying {
                    -b.under_min(deviation)
                } else {
                    -b.over_max(deviation)
                }
            })
            .collect();
        trade_size = add_to_trade(&mut trade, &misallocated, size - trade_size);
    }

    // 3. If this was not enough, trade balanced anchors: their window
    // minus the misallocated capacity already used above.
    if trade_size != size {
        let tradable: Vec<f64> = asset
            .balances
            .iter()
            .map(|b| {
                if b.action == Some(TrustlineAction::Closing) {
                    0.0
                } else if buying {
                    b.size_max(deviation) + b.under_min(deviation)
                } else {
                    b.size_min(deviation) + b.over_max(deviation)
                }
            })
            .collect();
        add_to_trade(&mut trade, &tradable, size - trade_size);
    }

    for index in 0..trade.len() {
        let size = fixed7(trade[index]);
        add_one_operation(order, ctx, asset, size, Some(index), quote_price, settings);
    }
}

/// Adds `amounts` into `trade`, capping the added sum at `size_cap`
/// (whichever of the cap and the available sum is smaller in magnitude).
/// Returns the new summed trade size.
fn add_to_trade(trade: &mut [f64], amounts: &[f64], size_cap: f64) -> f64 {
    let available = array_sum(amounts);
    let step = absolute_min(size_cap, available);
    for (slot, add) in trade.iter_mut().zip(array_scale(amounts, step)) {
        *slot += add;
    }
    fixed7(array_sum(trade))
}

/// Add a single operation trading `size` base units, against one specific
/// anchor's book (`balance_index`) or across all anchors.
fn add_one_operation(
    order: &mut Order,
    ctx: &LeafContext,
    asset: &Asset,
    size: f64,
    balance_index: Option<usize>,
    quote_price: f64,
    settings: &Settings,
) {
    if size == 0.0 {
        return;
    }

    // Sub-minimum trades are skipped, except explicit amount targets and
    // full liquidations, which always go through.
    let no_min_value = matches!(ctx.mode, Mode::Amount(_)) || ctx.amount == 0.0;
    let best_ask = match balance_index {
        Some(index) => asset.balances[index].book.best_ask(),
        None => asset.best_ask(),
    };
    let Some(best_ask) = best_ask else { return };
    if !no_min_value && (size * best_ask).abs() < settings.min_offer_value {
        return;
    }

    let deviation = settings.balance_target_deviation;
    let margin = 1.0 + settings.skip_marginal_offers;
    let filter = |balance: &Balance, entry: &BookEntry| {
        // A closing balance carries no target window; its capacity is
        // selling everything it holds.
        let in_window = if balance.action == Some(TrustlineAction::Closing) {
            -balance.amount <= size && size <= 0.0
        } else {
            size >= balance.size_min(deviation) && size <= balance.size_max(deviation)
        };
        in_window && entry.base_volume > size.abs() * margin
    };

    let side = Side::for_size(size);
    let found = match balance_index {
        Some(index) => {
            let balance = &asset.balances[index];
            balance
                .book
                .find(side, |entry| filter(balance, entry))
                .map(|entry| (index, entry))
        }
        None => asset.find_offer(side, filter),
    };

    if let Some((index, entry)) = found {
        let offer = tighten_spread(entry, &asset.balances[index], asset, quote_price, settings);
        order.add(offer, size.abs());
    }
}

/// Derive a proposed offer from a book entry, shifting its price toward
/// mid-market by a fraction of the pair's spread and clamping it around
/// the global market price when one exists.
fn tighten_spread(
    entry: &BookEntry,
    balance: &Balance,
    asset: &Asset,
    quote_price: f64,
    settings: &Settings,
) -> ProposedOffer {
    let spread_fraction = asset.spread_pct().unwrap_or(0.0) / 100.0;
    let diff = settings.spread_tightening * spread_fraction;

    let mut price = match entry.side {
        Side::Bid => entry.price * (1.0 + diff),
        Side::Ask => entry.price * (1.0 - diff),
    };

    if asset.global_price.is_some() {
        price = clamp_offer_price(price, entry.side, balance, asset, settings);
    }

    ProposedOffer {
        side: entry.side,
        code: balance.code.clone(),
        issuer: balance.issuer.clone(),
        anchor_name: balance.anchor_name.clone(),
        price,
        price_r: PriceRatio::from_prices(price, quote_price),
        base_volume: entry.base_volume,
    }
}

/// Floor/ceil a proposed price between the global market price and a
/// premium; the anchor's own book price is the hard cap on the far side.
fn clamp_offer_price(
    price: f64,
    side: Side,
    balance: &Balance,
    asset: &Asset,
    settings: &Settings,
) -> f64 {
    let premium = settings.max_spread / 2.0;
    let global_price = asset.price();
    let anchor_price = balance
        .book
        .price(true, asset.amount())
        .unwrap_or(global_price);

    match side {
        Side::Bid => {
            let min_price = anchor_price.min(global_price * (1.0 - premium));
            clamp(price, min_price, global_price)
        }
        Side::Ask => {
            let max_price = anchor_price.max(global_price * (1.0 + premium));
            clamp(price, global_price, max_price)
        }
    }
}

/// Trim a number for display: up to 7 decimals, no trailing zeros.
fn fmt_num(x: f64) -> String {
    let mut s = format!("{:.7}", x);
    while s.ends_with('0') {
        s.pop();
    }
    if s.ends_with('.') {
        s.pop();
    }
    s
}
