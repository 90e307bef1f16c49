// =============================================================================
// Position Store — typed (user, strategy, symbol, side) -> PositionState map
// =============================================================================
//
// The nested `position_vars[user][strategy][symbol][side]` dict-tree of the
// design notes (§9) becomes one flat map keyed by a typed `PositionKey`
// instead of raw JSON. All mutable state lives behind a single
// `parking_lot::RwLock` — the `store_lock` of §5.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{now_ms, Side, UserId};

/// Identifies one tracked position slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PositionKey {
    pub user: UserId,
    pub strategy: String,
    pub symbol: String,
    pub side: Side,
}

impl PositionKey {
    pub fn new(user: impl Into<UserId>, strategy: impl Into<String>, symbol: impl Into<String>, side: Side) -> Self {
        Self {
            user: user.into(),
            strategy: strategy.into(),
            symbol: symbol.into(),
            side,
        }
    }
}

/// Per-(user, strategy, symbol, side) state (§3). `qty_precision` and
/// `price_precision` are captured once at startup and survive full-close
/// resets — every other mutable field reverts to its startup default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionState {
    pub in_position: bool,
    pub comul_qty: f64,
    pub avg_price: Option<f64>,
    pub entry_price: Option<f64>,
    pub notional: f64,
    pub avg_progress_counter: u32,
    pub avg_progress_real: u32,
    pub process_volume: f64,
    pub is_tp: bool,
    /// Sticky fallback-SL latch, mirroring `is_tp` (SPEC_FULL §4.5 expansion).
    pub is_fallback_closed: bool,
    pub c_time: Option<i64>,
    pub qty_precision: i32,
    pub price_precision: i32,
}

impl PositionState {
    /// The startup default template (§3 "Lifecycle"): every configured slot
    /// starts here, and a full close reinitialises back to it — except for
    /// the precision fields, which are symbol metadata, not position state.
    pub fn default_with_precision(qty_precision: i32, price_precision: i32) -> Self {
        Self {
            in_position: false,
            comul_qty: 0.0,
            avg_price: None,
            entry_price: None,
            notional: 0.0,
            avg_progress_counter: 1,
            avg_progress_real: 1,
            process_volume: 0.0,
            is_tp: false,
            is_fallback_closed: false,
            c_time: None,
            qty_precision,
            price_precision,
        }
    }

    /// Reset every mutable field to the startup template in place (Invariants
    /// 2 & 3, I1). Precision fields are untouched.
    pub fn reset_to_default(&mut self) {
        let qty_precision = self.qty_precision;
        let price_precision = self.price_precision;
        *self = Self::default_with_precision(qty_precision, price_precision);
    }
}

/// Thread-safe (user, strategy, symbol, side) -> [`PositionState`] map.
pub struct PositionStore {
    inner: RwLock<HashMap<PositionKey, PositionState>>,
}

impl PositionStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Create the default-template entry for `key` if it does not already
    /// exist (startup population, §3 "Lifecycle").
    pub fn ensure(&self, key: &PositionKey, qty_precision: i32, price_precision: i32) {
        let mut map = self.inner.write();
        map.entry(key.clone())
            .or_insert_with(|| PositionState::default_with_precision(qty_precision, price_precision));
    }

    /// Read a consistent snapshot of the full state for `key`. Returns `None`
    /// if the key was never `ensure`d.
    pub fn get(&self, key: &PositionKey) -> Option<PositionState> {
        self.inner.read().get(key).cloned()
    }

    /// Every key currently tracked (used by the main loop and the syncer to
    /// enumerate work).
    pub fn keys(&self) -> Vec<PositionKey> {
        self.inner.read().keys().cloned().collect()
    }

    /// Mutate `key`'s state under the store lock. `mutator` must not suspend;
    /// it runs while the write lock is held (§5 "Computations ... are
    /// non-suspending").
    pub fn update<F>(&self, key: &PositionKey, mutator: F)
    where
        F: FnOnce(&mut PositionState),
    {
        let mut map = self.inner.write();
        if let Some(state) = map.get_mut(key) {
            mutator(state);
        } else {
            debug!(?key, "update() called on an un-ensured position key");
        }
    }

    /// Full-close cleanup: reset the position's mutable fields to the
    /// startup template (§4.4 step 6c, I1).
    pub fn reset(&self, key: &PositionKey) {
        self.update(key, |state| state.reset_to_default());
    }

    /// Transition a slot to `in_position` with a fresh `c_time`, as the
    /// syncer does on a **new** classification (§4.4 step 4).
    pub fn mark_opened(&self, key: &PositionKey, entry_price: f64, qty: f64, avg_price: f64, notional: f64) {
        self.update(key, |state| {
            state.in_position = true;
            state.entry_price = Some(entry_price);
            state.avg_price = Some(avg_price);
            state.comul_qty = qty;
            state.notional = notional;
            state.c_time = Some(now_ms());
        });
    }
}

impl Default for PositionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PositionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionStore")
            .field("tracked_keys", &self.inner.read().len())
            .finish()
    }
}
