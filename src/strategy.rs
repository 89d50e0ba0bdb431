//! Allocation strategy: turning the target tree's modes and sizes into
//! concrete monetary values and amounts, top-down.
//!
//! For each group, children are split into three buckets: fixed
//! (`amount`/`ignore`/`remove`, valued from the asset itself), sized
//! (`percentage` of the group's value) and weighted (proportional split
//! of whatever remains). Groups recurse with their freshly assigned
//! value. A final pass throttles target amounts when the planned buys
//! exceed the native asset's free liquidity.

use log::warn;

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::num::{fixed7, positive};
use crate::portfolio::{NATIVE, Portfolio};
use crate::target::{Mode, Node, Target};

/// Run the allocation over the whole tree. The root's `value` must hold
/// the portfolio total.
pub(crate) fn apply(root: &mut Target, portfolio: &Portfolio, settings: &Settings) -> Result<()> {
    let total = root.value;
    root.share = 1.0;
    apply_group(root, portfolio, settings, total)?;
    throttle_amounts(root, portfolio, settings)
}

fn apply_group(
    group: &mut Target,
    portfolio: &Portfolio,
    settings: &Settings,
    total: f64,
) -> Result<()> {
    let available = group.value;
    let Node::Group { children, .. } = &mut group.node else {
        return Ok(());
    };

    // Fixed and sized children allocate first.
    let mut allocated = 0.0;
    let mut weights = 0.0;
    for child in children.iter_mut() {
        match child.mode {
            Mode::Weight(w) => weights += w,
            Mode::Percentage(p) => {
                child.value = p * available / 100.0;
                allocated += child.value;
            }
            Mode::Amount(a) => {
                child.amount = a;
                child.value = a * leaf_price(child, portfolio);
                allocated += child.value;
            }
            Mode::Ignore => {
                let (value, amount) = leaf_holdings(child, portfolio);
                child.value = value;
                child.amount = amount;
                allocated += child.value;
            }
            Mode::Remove => {
                child.value = 0.0;
                child.amount = 0.0;
            }
        }
    }

    // Weighted children split the remainder.
    let remains = positive(available - allocated);
    let has_weighted = weights != 0.0
        || children
            .iter()
            .any(|c| matches!(c.mode, Mode::Weight(_)));
    for child in children.iter_mut() {
        if let Mode::Weight(w) = child.mode {
            child.value = if weights == 0.0 {
                0.0
            } else {
                w * remains / weights
            };
        }
    }

    check_allocation_limits(allocated, available, has_weighted, settings)?;

    for child in children.iter_mut() {
        child.share = if total != 0.0 { child.value / total } else { 0.0 };
        if child.is_group() {
            apply_group(child, portfolio, settings, total)?;
        } else {
            finalize_leaf(child, portfolio);
        }
    }
    Ok(())
}

/// Derive a leaf's amount from its value and fill in the diff fields
/// against current holdings.
fn finalize_leaf(leaf: &mut Target, portfolio: &Portfolio) {
    let (current_value, current_amount) = leaf_holdings(leaf, portfolio);

    if matches!(leaf.mode, Mode::Weight(_) | Mode::Percentage(_)) {
        let price = leaf_price(leaf, portfolio);
        leaf.amount = if price == 0.0 {
            0.0
        } else {
            fixed7(leaf.value / price)
        };
    }

    leaf.value_diff = leaf.value - current_value;
    leaf.value_diff_pct = if leaf.value != 0.0 {
        leaf.value_diff / leaf.value
    } else {
        0.0
    };
    leaf.amount_diff = fixed7(leaf.amount - current_amount);
}

fn leaf_price(leaf: &Target, portfolio: &Portfolio) -> f64 {
    leaf.asset_code()
        .and_then(|code| portfolio.asset(code))
        .map(|asset| asset.price())
        .unwrap_or(0.0)
}

fn leaf_holdings(leaf: &Target, portfolio: &Portfolio) -> (f64, f64) {
    leaf.asset_code()
        .and_then(|code| portfolio.asset(code))
        .map(|asset| (asset.value(), asset.amount()))
        .unwrap_or((0.0, 0.0))
}

/// Fixed and sized allocations must stay within the misallocation
/// tolerance of the available value. Falling short is fine as long as
/// weighted children absorb the remainder.
fn check_allocation_limits(
    allocated: f64,
    available: f64,
    has_weighted: bool,
    settings: &Settings,
) -> Result<()> {
    let margin = settings.misallocation_tolerance;
    if allocated > available * (1.0 + margin) {
        let over = allocated - available;
        return Err(Error::OverAllocated {
            amount: round2(over),
            percent: round2(100.0 * over / available),
            currency: settings.currency.clone(),
        });
    }
    if !has_weighted && allocated < available * (1.0 - margin) {
        let under = available - allocated;
        return Err(Error::UnderAllocated {
            amount: round2(under),
            percent: round2(100.0 * under / available),
            currency: settings.currency.clone(),
        });
    }
    Ok(())
}

/// When planned buys exceed the native asset's liquidity net of the
/// account reserve, scale every leaf's target amount back by a single
/// ratio, so the gap closes over several passes as sells settle.
fn throttle_amounts(root: &mut Target, portfolio: &Portfolio, settings: &Settings) -> Result<()> {
    let native = portfolio.native();
    let liquidity = native.value() - native.amount_min * native.price();

    let mut buy_value = 0.0;
    let mut sell_value = 0.0;
    for_each_leaf(root, &mut |leaf| {
        // The native asset funds the buys; it is the liquidity, not a
        // consumer of it.
        if leaf.asset_code() == Some(NATIVE) {
            return;
        }
        buy_value += positive(leaf.value_diff);
        sell_value += positive(-leaf.value_diff);
    });

    let shortfall = positive(buy_value - liquidity);
    if shortfall == 0.0 {
        return Ok(());
    }
    if shortfall >= sell_value {
        return Err(Error::InsufficientLiquidity(NATIVE.to_string()));
    }

    let ratio = 1.0 - positive((sell_value - shortfall) / sell_value);
    warn!(
        "throttling target amounts by {:.4}: buys exceed liquidity by {:.2} {}",
        ratio, shortfall, settings.currency
    );

    for_each_leaf_mut(root, &mut |leaf| {
        if leaf.asset_code() == Some(NATIVE) {
            return;
        }
        let current = leaf.amount - leaf.amount_diff;
        leaf.amount = fixed7(leaf.amount - leaf.amount_diff * ratio);
        leaf.amount_diff = fixed7(leaf.amount - current);
    });
    Ok(())
}

fn for_each_leaf(target: &Target, f: &mut impl FnMut(&Target)) {
    if target.is_group() {
        for child in target.children() {
            for_each_leaf(child, f);
        }
    } else {
        f(target);
    }
}

fn for_each_leaf_mut(target: &mut Target, f: &mut impl FnMut(&mut Target)) {
    if target.is_group() {
        if let Node::Group { children, .. } = &mut target.node {
            for child in children {
                for_each_leaf_mut(child, f);
            }
        }
    } else {
        f(target);
    }
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}
