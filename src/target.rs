//! The target tree: the user's hierarchical rebalancing plan.
//!
//! A [`Target`] is either a leaf bound to one asset or a group of child
//! targets. The root drives recomputation: [`Target::rebalance`] runs the
//! allocation strategy over the whole tree, then resynthesizes every
//! leaf's order. Allocation errors are caught at the root and stored as a
//! user-visible message; the tree keeps its last-good values.
//!
//! The tree serializes to a compact JSON plan (a bare asset code when a
//! leaf carries no other state) and parses historical plan schemas.

use log::error;
use serde_json::{Map, Value};

use crate::asset::{Balance, TrustlineAction};
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::num::positive;
use crate::order::{LeafContext, OfferDescriptor, Operation, Order};
use crate::portfolio::{NATIVE, Portfolio};
use crate::strategy;

/// Allocation mode of a target node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Mode {
    /// Proportional split of whatever value remains in the parent after
    /// fixed and percentage allocations.
    Weight(f64),
    /// Fixed percentage of the parent's value.
    Percentage(f64),
    /// Fixed quantity of the asset.
    Amount(f64),
    /// Track current holdings, no rebalancing pressure.
    Ignore,
    /// Liquidate to zero and close the trustlines.
    Remove,
}

impl Mode {
    /// Clamp sizes into their meaningful range.
    fn normalized(self) -> Mode {
        match self {
            Mode::Weight(w) => Mode::Weight(positive(w)),
            Mode::Percentage(p) => Mode::Percentage(positive(p).min(100.0)),
            Mode::Amount(a) => Mode::Amount(positive(a)),
            other => other,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Node {
    Group {
        name: Option<String>,
        children: Vec<Target>,
    },
    Leaf {
        asset: String,
        /// Issuers whose trustline opening is pending.
        opening: Vec<String>,
        /// Issuers whose liquidation/closure is pending.
        closing: Vec<String>,
        order: Order,
    },
}

/// A pending trustline transition derived from the current plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustlineChange {
    pub action: TrustlineAction,
    pub code: String,
    pub issuer: String,
}

/// One node of the rebalancing plan.
#[derive(Debug, Clone)]
pub struct Target {
    pub mode: Mode,
    /// Monetary allocation in reference currency, handed down from the
    /// parent by the strategy engine.
    pub value: f64,
    /// Target quantity (leaves only).
    pub amount: f64,
    /// `value` relative to the portfolio total.
    pub share: f64,
    /// Target value minus current value (positive: buy).
    pub value_diff: f64,
    /// `value_diff` relative to `value`.
    pub value_diff_pct: f64,
    /// Target amount minus current amount, 7-decimal fixed.
    pub amount_diff: f64,
    error: Option<String>,
    saved_plan: Option<String>,
    pub(crate) node: Node,
}

impl Default for Target {
    fn default() -> Self {
        Target::group(None)
    }
}

impl Target {
    /// An empty root/group node.
    pub fn group(name: Option<String>) -> Target {
        Target {
            mode: Mode::Weight(1.0),
            value: 0.0,
            amount: 0.0,
            share: 0.0,
            value_diff: 0.0,
            value_diff_pct: 0.0,
            amount_diff: 0.0,
            error: None,
            saved_plan: None,
            node: Node::Group {
                name,
                children: Vec::new(),
            },
        }
    }

    /// A leaf bound to one asset. Defaults to `ignore`; the native asset
    /// is never ignored and defaults to an equal weight instead.
    pub fn leaf(code: impl Into<String>) -> Target {
        let code = code.into();
        let mode = if code == NATIVE {
            Mode::Weight(1.0)
        } else {
            Mode::Ignore
        };
        Target {
            mode,
            value: 0.0,
            amount: 0.0,
            share: 0.0,
            value_diff: 0.0,
            value_diff_pct: 0.0,
            amount_diff: 0.0,
            error: None,
            saved_plan: None,
            node: Node::Leaf {
                asset: code,
                opening: Vec::new(),
                closing: Vec::new(),
                order: Order::new(),
            },
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self.node, Node::Group { .. })
    }

    /// Group name or leaf asset code.
    pub fn name(&self) -> Option<&str> {
        match &self.node {
            Node::Group { name, .. } => name.as_deref(),
            Node::Leaf { asset, .. } => Some(asset),
        }
    }

    pub fn asset_code(&self) -> Option<&str> {
        match &self.node {
            Node::Leaf { asset, .. } => Some(asset),
            Node::Group { .. } => None,
        }
    }

    pub fn children(&self) -> &[Target] {
        match &self.node {
            Node::Group { children, .. } => children,
            Node::Leaf { .. } => &[],
        }
    }

    pub(crate) fn children_mut(&mut self) -> Option<&mut Vec<Target>> {
        match &mut self.node {
            Node::Group { children, .. } => Some(children),
            Node::Leaf { .. } => None,
        }
    }

    /// Find a direct child by group name or asset code, for editing.
    pub fn child_mut(&mut self, name: &str) -> Option<&mut Target> {
        self.children_mut()?
            .iter_mut()
            .find(|child| child.name() == Some(name))
    }

    /// The synthesized order of a leaf target.
    pub fn order(&self) -> Option<&Order> {
        match &self.node {
            Node::Leaf { order, .. } => Some(order),
            Node::Group { .. } => None,
        }
    }

    pub fn opening(&self) -> &[String] {
        match &self.node {
            Node::Leaf { opening, .. } => opening,
            Node::Group { .. } => &[],
        }
    }

    pub fn closing(&self) -> &[String] {
        match &self.node {
            Node::Leaf { closing, .. } => closing,
            Node::Group { .. } => &[],
        }
    }

    /// The current allocation error, if the last recomputation failed.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Whether submitting the plan should be blocked.
    pub fn is_invalid(&self) -> bool {
        self.error.is_some()
    }

    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode.normalized();
    }

    pub fn add_child(&mut self, child: Target) -> Result<()> {
        let children = self.children_mut().ok_or(Error::NotAGroup)?;
        children.push(child);
        Ok(())
    }

    /// Add a weighted leaf for `code` under this group, registering a
    /// trustline opening for every anchor the asset already has.
    pub fn add_asset(&mut self, portfolio: &mut Portfolio, code: &str) -> Result<()> {
        if !self.is_group() {
            return Err(Error::NotAGroup);
        }
        if self.children().iter().any(|c| c.asset_code() == Some(code)) {
            return Err(Error::DuplicateTarget(code.to_string()));
        }

        let mut leaf = Target::leaf(code);
        leaf.set_mode(Mode::Weight(1.0));
        let issuers: Vec<String> = portfolio
            .resolve_asset(code)
            .balances
            .iter()
            .map(|b| b.issuer.clone())
            .collect();
        for issuer in issuers {
            leaf.add_anchor(portfolio, &issuer)?;
        }

        let children = self.children_mut().ok_or(Error::NotAGroup)?;
        children.push(leaf);
        Ok(())
    }

    /// Open a trustline with `issuer`, or cancel its pending closure.
    /// Idempotent toggle with [`Target::remove_anchor`].
    pub fn add_anchor(&mut self, portfolio: &mut Portfolio, issuer: &str) -> Result<()> {
        let Node::Leaf {
            asset: code,
            opening,
            closing,
            ..
        } = &mut self.node
        else {
            return Err(Error::Plan("anchors belong to asset targets".into()));
        };

        let (local_code, anchor_name) = match portfolio.anchor(issuer) {
            Some(anchor) => (anchor.tether_code(code).to_string(), Some(anchor.name.clone())),
            None => (code.clone(), None),
        };

        let code = code.clone();
        let asset = portfolio.resolve_asset(&code);
        if asset.balance(issuer).is_none() {
            let mut balance = Balance::new(local_code, issuer);
            if let Some(name) = anchor_name {
                balance.anchor_name = name;
            }
            asset.balances.push(balance);
        }
        if let Some(balance) = asset.balance_mut(issuer) {
            if balance.action == Some(TrustlineAction::Closing) {
                closing.retain(|i| i != issuer);
                balance.action = None;
            } else {
                balance.action = Some(TrustlineAction::Opening);
                if !opening.iter().any(|i| i == issuer) {
                    opening.push(issuer.to_string());
                }
            }
        }
        Ok(())
    }

    /// Begin liquidating the position held with `issuer`, or cancel its
    /// pending opening.
    pub fn remove_anchor(&mut self, portfolio: &mut Portfolio, issuer: &str) -> Result<()> {
        let Node::Leaf {
            asset: code,
            opening,
            closing,
            ..
        } = &mut self.node
        else {
            return Err(Error::Plan("anchors belong to asset targets".into()));
        };

        let code = code.clone();
        let asset = portfolio.resolve_asset(&code);
        let Some(balance) = asset.balance_mut(issuer) else {
            return Err(Error::MissingIssuer(issuer.to_string()));
        };

        if balance.action == Some(TrustlineAction::Opening) {
            opening.retain(|i| i != issuer);
            balance.action = None;
            if !balance.has_trustline {
                asset.balances.retain(|b| b.issuer != issuer);
            }
        } else {
            balance.action = Some(TrustlineAction::Closing);
            if !closing.iter().any(|i| i == issuer) {
                closing.push(issuer.to_string());
            }
        }
        Ok(())
    }

    /// Reconcile the tree with the portfolio: add leaves for supported
    /// assets that have none, drop leaves whose asset is gone or
    /// unsupported.
    pub fn sync(&mut self, portfolio: &Portfolio) -> Result<()> {
        if !self.is_group() {
            return Err(Error::NotAGroup);
        }

        let mut missing: Vec<String> = Vec::new();
        for asset in portfolio.assets() {
            let present = self
                .children()
                .iter()
                .any(|c| c.asset_code() == Some(asset.code.as_str()));
            if !present && asset.is_supported() {
                missing.push(asset.code.clone());
            }
        }

        let children = self.children_mut().ok_or(Error::NotAGroup)?;
        children.retain(|child| match child.asset_code() {
            Some(code) => portfolio
                .asset(code)
                .map(|asset| asset.is_supported())
                .unwrap_or(false),
            None => true,
        });
        for code in missing {
            children.push(Target::leaf(code));
        }
        Ok(())
    }

    /// Recompute the whole tree against current holdings: run the
    /// allocation strategy root-down, then resynthesize every leaf's
    /// order. Allocation failures are captured into the root's error
    /// field; previously computed values stay in place.
    pub fn rebalance(&mut self, portfolio: &mut Portfolio, settings: &Settings) {
        self.error = None;
        portfolio.refresh_reserve(settings.base_reserve);

        let total = portfolio.total();
        if total < 0.0 {
            let err = Error::NegativeTotal;
            error!("rebalance aborted: {err}");
            self.error = Some(err.to_string());
            return;
        }
        if total == 0.0 {
            return;
        }

        self.value = total;
        if let Err(err) = strategy::apply(self, portfolio, settings) {
            error!("rebalance failed: {err}");
            self.error = Some(err.to_string());
            return;
        }
        let quote_price = portfolio.native().price();
        self.refresh_orders(portfolio, quote_price, settings);
    }

    fn refresh_orders(&mut self, portfolio: &mut Portfolio, quote_price: f64, settings: &Settings) {
        let Target {
            mode,
            amount,
            amount_diff,
            value_diff_pct,
            node,
            ..
        } = self;
        match node {
            Node::Group { children, .. } => {
                for child in children {
                    child.refresh_orders(portfolio, quote_price, settings);
                }
            }
            Node::Leaf { asset, order, .. } => {
                // The native asset is the quote side of every trade; it
                // rebalances implicitly through the others.
                if asset == NATIVE {
                    return;
                }
                let ctx = LeafContext {
                    mode: *mode,
                    amount: *amount,
                    amount_diff: *amount_diff,
                    value_diff_pct: *value_diff_pct,
                };
                if let Some(asset) = portfolio.asset_mut(asset) {
                    crate::order::refresh(order, &ctx, asset, quote_price, settings);
                }
            }
        }
    }

    /// Every operation of every leaf, in tree order.
    pub fn operations(&self) -> Vec<&Operation> {
        match &self.node {
            Node::Group { children, .. } => {
                children.iter().flat_map(|c| c.operations()).collect()
            }
            Node::Leaf { order, .. } => order.operations.iter().collect(),
        }
    }

    /// Ledger-consumable descriptors for every operation. Outdated open
    /// offers on the same asset are recycled as replacement targets.
    pub fn descriptors(&self, portfolio: &Portfolio) -> Vec<OfferDescriptor> {
        let mut descriptors = Vec::new();
        self.collect_descriptors(portfolio, &mut descriptors);
        descriptors
    }

    fn collect_descriptors(&self, portfolio: &Portfolio, out: &mut Vec<OfferDescriptor>) {
        match &self.node {
            Node::Group { children, .. } => {
                for child in children {
                    child.collect_descriptors(portfolio, out);
                }
            }
            Node::Leaf { asset, order, .. } => {
                let mut outdated: Vec<u64> = portfolio
                    .asset(asset)
                    .map(|a| {
                        a.offers
                            .iter()
                            .filter(|o| o.outdated)
                            .map(|o| o.id)
                            .collect()
                    })
                    .unwrap_or_default();
                for operation in &order.operations {
                    let mut descriptor = operation.descriptor();
                    if let Some(id) = outdated.pop() {
                        descriptor.offer_id = id;
                    }
                    out.push(descriptor);
                }
            }
        }
    }

    /// Display lines for the whole plan: each leaf's operation
    /// descriptions or waiting placeholder.
    pub fn descriptions(&self, currency: &str) -> Vec<String> {
        match &self.node {
            Node::Group { children, .. } => children
                .iter()
                .flat_map(|c| c.descriptions(currency))
                .collect(),
            Node::Leaf { order, .. } => order.descriptions(currency),
        }
    }

    /// Trustline operations implied by the current plan: open pending
    /// anchors (unless the whole asset is being removed), close drained
    /// ones.
    pub fn trustline_changes(&self, portfolio: &Portfolio) -> Vec<TrustlineChange> {
        let mut changes = Vec::new();
        self.collect_trustline_changes(portfolio, &mut changes);
        changes
    }

    fn collect_trustline_changes(&self, portfolio: &Portfolio, out: &mut Vec<TrustlineChange>) {
        match &self.node {
            Node::Group { children, .. } => {
                for child in children {
                    child.collect_trustline_changes(portfolio, out);
                }
            }
            Node::Leaf { asset: code, .. } => {
                let Some(asset) = portfolio.asset(code) else { return };
                let removing = self.mode == Mode::Remove;
                for balance in &asset.balances {
                    if !removing && balance.action == Some(TrustlineAction::Opening) {
                        out.push(TrustlineChange {
                            action: TrustlineAction::Opening,
                            code: balance.code.clone(),
                            issuer: balance.issuer.clone(),
                        });
                    }
                    let drained = balance.amount == 0.0
                        && balance.action == Some(TrustlineAction::Closing)
                        || removing && asset.amount() == 0.0;
                    if balance.has_trustline && drained {
                        out.push(TrustlineChange {
                            action: TrustlineAction::Closing,
                            code: balance.code.clone(),
                            issuer: balance.issuer.clone(),
                        });
                    }
                }
            }
        }
    }

    // ---- serialization ----

    /// Parse a persisted JSON plan. The parsed string becomes the
    /// reference for [`Target::has_changed`].
    pub fn from_json(json: &str, portfolio: &mut Portfolio) -> Result<Target> {
        let value: Value = serde_json::from_str(json)?;
        let mut target = Target::from_value(&value, portfolio)?;
        if !target.is_group() {
            return Err(Error::Plan("root target must be a group".into()));
        }
        target.saved_plan = Some(json.to_string());
        Ok(target)
    }

    /// The compact JSON form of the plan.
    pub fn to_json(&self) -> String {
        let value = self.to_value().unwrap_or_else(|| Value::Null);
        value.to_string()
    }

    /// Whether the plan differs from the last parsed/saved serialization.
    pub fn has_changed(&self) -> bool {
        let reference = self.saved_plan.as_deref().unwrap_or("{\"childs\":[]}");
        self.to_json() != reference
    }

    /// Record the current serialization as persisted.
    pub fn mark_saved(&mut self) {
        self.saved_plan = Some(self.to_json());
    }

    fn from_value(value: &Value, portfolio: &mut Portfolio) -> Result<Target> {
        // A bare string is a leaf with default mode.
        if let Some(code) = value.as_str() {
            let mut map = Map::new();
            map.insert("asset".into(), Value::String(code.to_string()));
            return Target::from_value(&Value::Object(map), portfolio);
        }
        let object = value
            .as_object()
            .ok_or_else(|| Error::Plan(format!("unexpected plan node: {value}")))?;

        let mode = object.get("mode").and_then(Value::as_str);
        let size = object.get("size").and_then(Value::as_f64);

        if let Some(children) = object.get("childs") {
            let children = children
                .as_array()
                .ok_or_else(|| Error::Plan("childs must be an array".into()))?;
            let name = object
                .get("group")
                .and_then(Value::as_str)
                .map(str::to_string);

            let mut target = Target::group(name);
            target.set_mode(parse_mode(mode, size)?);
            if !matches!(target.mode, Mode::Weight(_) | Mode::Percentage(_)) {
                return Err(Error::Plan("groups only support weight or percentage".into()));
            }

            let mut parsed: Vec<Target> = children
                .iter()
                .map(|child| Target::from_value(child, portfolio))
                .collect::<Result<_>>()?;
            reclassify_legacy_percentages(&mut parsed);
            if let Node::Group { children, .. } = &mut target.node {
                *children = parsed;
            }
            return Ok(target);
        }

        let code = object
            .get("asset")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Plan("plan node has neither asset nor childs".into()))?;

        let mut target = Target::leaf(code);
        let mut mode = parse_mode(mode, size)?;
        // Historical plans could ignore the native asset; it never is.
        if code == NATIVE && mode == Mode::Ignore {
            mode = Mode::Weight(1.0);
        }
        target.set_mode(mode);

        let list_of = |key: &str| -> Vec<String> {
            object
                .get(key)
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        };
        let mut opening = list_of("opening");
        let mut closing = list_of("closing");

        // Reconcile pending trustline transitions with actual balances.
        let asset = portfolio.resolve_asset(code);
        for balance in &mut asset.balances {
            if closing.iter().any(|i| *i == balance.issuer) {
                balance.action = Some(TrustlineAction::Closing);
            } else {
                // An opening that now has its trustline is done.
                opening.retain(|i| *i != balance.issuer);
            }
        }
        // A closure whose balance is gone is done.
        closing.retain(|issuer| asset.balance(issuer).is_some());

        if let Node::Leaf {
            opening: o,
            closing: c,
            ..
        } = &mut target.node
        {
            *o = opening;
            *c = closing;
        }
        Ok(target)
    }

    fn to_value(&self) -> Option<Value> {
        if self.mode == Mode::Ignore {
            return None;
        }

        let mut object = Map::new();
        match self.mode.normalized() {
            Mode::Weight(w) => {
                if w != 1.0 {
                    object.insert("size".into(), number(w));
                }
            }
            Mode::Percentage(p) => {
                object.insert("mode".into(), Value::String("percentage".into()));
                object.insert("size".into(), number(p));
            }
            Mode::Amount(a) => {
                object.insert("mode".into(), Value::String("amount".into()));
                object.insert("size".into(), number(a));
            }
            Mode::Remove => {
                object.insert("mode".into(), Value::String("remove".into()));
            }
            Mode::Ignore => return None,
        }

        match &self.node {
            Node::Leaf {
                asset,
                opening,
                closing,
                ..
            } => {
                object.insert("asset".into(), Value::String(asset.clone()));
                if !opening.is_empty() {
                    object.insert("opening".into(), string_array(opening));
                }
                if !closing.is_empty() {
                    object.insert("closing".into(), string_array(closing));
                }
                // Parameters reduction: a plain leaf is a bare string.
                if object.len() == 1 {
                    return Some(Value::String(asset.clone()));
                }
            }
            Node::Group { name, children } => {
                if let Some(name) = name {
                    object.insert("group".into(), Value::String(name.clone()));
                }
                let mut sorted: Vec<&Target> = children.iter().collect();
                sorted.sort_by(|a, b| a.name().unwrap_or("").cmp(b.name().unwrap_or("")));
                let serialized: Vec<Value> =
                    sorted.iter().filter_map(|child| child.to_value()).collect();
                object.insert("childs".into(), Value::Array(serialized));
            }
        }
        Some(Value::Object(object))
    }
}

fn parse_mode(mode: Option<&str>, size: Option<f64>) -> Result<Mode> {
    // Schema renames from plans <= 0.5.
    let mode = match mode {
        Some("equal") => Some("weight"),
        Some("skip") => Some("ignore"),
        other => other,
    };
    match mode {
        None | Some("weight") => Ok(Mode::Weight(size.unwrap_or(1.0))),
        Some("percentage") => Ok(Mode::Percentage(size.unwrap_or(0.0))),
        Some("amount") => Ok(Mode::Amount(size.unwrap_or(0.0))),
        Some("ignore") => Ok(Mode::Ignore),
        Some("remove") => Ok(Mode::Remove),
        Some(other) => Err(Error::Plan(format!("unknown mode: {other}"))),
    }
}

/// Plans <= 0.5 used percentages not summing to 100 as weights, as long
/// as no explicit weight was present.
fn reclassify_legacy_percentages(children: &mut [Target]) {
    let mut sum = 0.0;
    let mut count = 0;
    for child in children.iter() {
        match child.mode {
            Mode::Percentage(p) => {
                sum += p;
                count += 1;
            }
            Mode::Weight(_) => return,
            _ => {}
        }
    }
    if count == 0 || sum == 100.0 {
        return;
    }
    for child in children.iter_mut() {
        if let Mode::Percentage(p) = child.mode {
            child.mode = Mode::Weight(p);
        }
    }
}

fn number(x: f64) -> Value {
    serde_json::Number::from_f64(x)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn string_array(items: &[String]) -> Value {
    Value::Array(items.iter().map(|i| Value::String(i.clone())).collect())
}
