// =============================================================================
// Grid Math — pure arithmetic over the averaging grid
// =============================================================================
//
// No I/O, no locks: every function here is a plain numeric transform, in the
// same shape as the indicator functions (`calculate_ema`, `calculate_atr`, …)
// this engine's strategy layer would otherwise live beside. Undefined cases
// return `None` rather than panicking.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::types::Side;

/// One step of a configured averaging grid: `indent_pct` is the cumulative
/// drawdown (negative for LONG steps past the first) at which the step
/// fires, and `volume_pct` is its share of `base_notional`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridStep {
    pub indent_pct: f64,
    pub volume_pct: f64,
}

/// `base_notional = margin × leverage` (§4.2).
pub fn base_notional(margin: f64, leverage: f64) -> f64 {
    margin * leverage
}

/// Cumulative notional after executing steps `1..=k` (1-based, `k` clamped to
/// `grid.len()`).
fn cum_notional(grid: &[GridStep], base: f64, k: usize) -> f64 {
    grid.iter()
        .take(k)
        .map(|step| base * step.volume_pct / 100.0)
        .sum()
}

/// Returns the `k ∈ [1, N]` whose cumulative notional is closest to
/// `actual_notional`. `actual_notional <= 0` always returns `1` (§4.2).
pub fn estimate_progress(grid: &[GridStep], base: f64, actual_notional: f64) -> usize {
    if grid.is_empty() {
        return 1;
    }
    if actual_notional <= 0.0 {
        return 1;
    }

    let mut best_k = 1usize;
    let mut best_diff = f64::INFINITY;
    for k in 1..=grid.len() {
        let diff = (cum_notional(grid, base, k) - actual_notional).abs();
        if diff < best_diff {
            best_diff = diff;
            best_k = k;
        }
    }
    best_k
}

/// Recovers the logical first-step entry price from the exchange-reported
/// volume-weighted average, assuming every fill after the first landed
/// exactly on its configured indent (§4.2). Returns `None` if any used step
/// would imply a non-positive fill price (`k_i <= 0`).
pub fn reconstruct_entry_price(
    avg_price: f64,
    grid: &[GridStep],
    progress: usize,
    side: Side,
) -> Option<f64> {
    if grid.is_empty() || avg_price <= 0.0 {
        return None;
    }

    let used = &grid[..progress.min(grid.len())];

    let mut weighted_sum = 0.0;
    let mut volume_sum = 0.0;
    for step in used {
        let k_i = match side {
            Side::Long => 1.0 + step.indent_pct / 100.0,
            Side::Short => 1.0 - step.indent_pct / 100.0,
        };
        if k_i <= 0.0 {
            return None;
        }
        weighted_sum += step.volume_pct / k_i;
        volume_sum += step.volume_pct;
    }

    if volume_sum <= 0.0 {
        return None;
    }

    Some(avg_price * (weighted_sum / volume_sum))
}
