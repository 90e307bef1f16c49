// =============================================================================
// Shared primitive types used across the trading control plane
// =============================================================================

use serde::{Deserialize, Serialize};
use std::fmt;

/// Distinct sides of a hedged futures account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// `+1` for LONG, `-1` for SHORT — the sign convention used throughout
    /// PnL and grid arithmetic (§4.5, §4.2).
    pub fn sign(self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }

    /// The opposite side, used when an exchange order must close a position.
    pub fn opposite(self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Long => write!(f, "LONG"),
            Side::Short => write!(f, "SHORT"),
        }
    }
}

/// Exchange order side, distinct from [`Side`] (position side). A LONG open
/// buys; a LONG close sells; a SHORT open sells; a SHORT close buys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Identifies a configured user. Newtype around `String` so position and
/// config maps cannot be accidentally keyed by a bare symbol or strategy name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub String);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        UserId(s.to_string())
    }
}

/// Current UNIX timestamp in milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Round `value` down to `precision` decimal digits (§4.7 step 1 — exchange
/// lot-size compliance). Callers are expected to reject non-positive results
/// themselves; this function only truncates.
pub fn round_down_to_precision(value: f64, precision: i32) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    let factor = 10f64.powi(precision.max(0));
    (value * factor).floor() / factor
}

/// Round `value` to `precision` decimal digits (nearest, used for TP/SL
/// target prices, §4.8).
pub fn round_to_precision(value: f64, precision: i32) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    let factor = 10f64.powi(precision.max(0));
    (value * factor).round() / factor
}
