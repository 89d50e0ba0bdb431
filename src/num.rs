//! Numeric helpers shared by the allocation and order-synthesis engines.
//!
//! Amounts on the ledger carry 7 decimal places; [`fixed7`] is the single
//! rounding point applied at computation boundaries so that intermediate
//! floating-point noise never reaches an operation descriptor.

/// Returns `x` if it is greater than 0, else 0.
#[inline]
pub fn positive(x: f64) -> f64 {
    x.max(0.0)
}

/// Returns `x` if it is lesser than 0, else 0.
#[inline]
pub fn negative(x: f64) -> f64 {
    x.min(0.0)
}

/// Rounds `x` to 7 decimal places, the ledger's native precision.
#[inline]
pub fn fixed7(x: f64) -> f64 {
    (x * 10_000_000.0).round() / 10_000_000.0
}

/// Limits `x` to the `[min, max]` range.
#[inline]
pub fn clamp(x: f64, min: f64, max: f64) -> f64 {
    x.max(min).min(max)
}

/// Returns whichever of `a` and `b` has the smaller absolute value,
/// preferring `a` on ties.
#[inline]
pub fn absolute_min(a: f64, b: f64) -> f64 {
    if a.abs() <= b.abs() { a } else { b }
}

/// Sum of a slice.
pub fn array_sum(values: &[f64]) -> f64 {
    values.iter().sum()
}

/// Proportionally scales `values` so their sum equals `target_sum`.
///
/// An all-zero input yields an all-zero output (no direction to scale in).
/// Signs are preserved, so a mixed-sign input renormalizes to the requested
/// *net* sum.
pub fn array_scale(values: &[f64], target_sum: f64) -> Vec<f64> {
    let sum = array_sum(values);
    if sum == 0.0 {
        return vec![0.0; values.len()];
    }
    values.iter().map(|x| x * target_sum / sum).collect()
}
