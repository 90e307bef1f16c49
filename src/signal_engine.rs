// =============================================================================
// Signal Engine — timeframe-boundary entry signals (§4.6)
// =============================================================================
//
// Real indicator computation (EMA/RSI/etc.) is out of scope here; SignalEngine
// only needs a directional verdict per timeframe boundary, supplied through
// the pluggable `SignalSource` trait so the boundary bookkeeping can be
// tested against a deterministic fake.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::intent::{Intent, IntentStatus};
use crate::position_store::{PositionKey, PositionState};
use crate::types::{Side, UserId};

/// Supplies the directional verdict for one (user, strategy, symbol) at a
/// given timeframe-bucket boundary. `None` means no signal this bucket.
#[async_trait]
pub trait SignalSource: Send + Sync {
    async fn signal_at(
        &self,
        user: &UserId,
        strategy: &str,
        symbol: &str,
        bucket_start_ms: i64,
    ) -> Option<Side>;
}

/// Converts a timeframe string (e.g. `"5m"`, `"1h"`) into a bucket length in
/// milliseconds.
pub fn timeframe_ms(timeframe: &str) -> Option<i64> {
    let (num_part, unit) = timeframe.split_at(timeframe.len().checked_sub(1)?);
    let n: i64 = num_part.parse().ok()?;
    let unit_ms = match unit {
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        _ => return None,
    };
    Some(n * unit_ms)
}

fn bucket_start(now_ms: i64, bucket_ms: i64) -> i64 {
    if bucket_ms <= 0 {
        return now_ms;
    }
    now_ms - (now_ms.rem_euclid(bucket_ms))
}

/// Tracks, per (strategy, symbol), the signal computed for the current
/// timeframe bucket (so concurrent Long/Short evaluations share one
/// `signal_at` call), and per (strategy, symbol, side) the bucket a side last
/// fired for, so each side fires at most once per boundary (§4.6).
pub struct SignalEngine {
    bucket_cache: RwLock<HashMap<(String, String), (i64, Option<Side>)>>,
    fired: RwLock<HashMap<(String, String, Side), i64>>,
}

impl SignalEngine {
    pub fn new() -> Self {
        Self {
            bucket_cache: RwLock::new(HashMap::new()),
            fired: RwLock::new(HashMap::new()),
        }
    }

    /// Evaluates one (user, strategy, symbol, side) for an opening signal.
    /// `active_count` and `cap` are the caller-supplied (side, user) position
    /// count and configured limit (I7).
    pub async fn evaluate(
        &self,
        source: &dyn SignalSource,
        key: &PositionKey,
        state: &PositionState,
        timeframe: &str,
        now_ms: i64,
        active_count: u32,
        cap: u32,
    ) -> Option<Intent> {
        if state.in_position {
            return None;
        }

        let bucket_ms = timeframe_ms(timeframe)?;
        let start = bucket_start(now_ms, bucket_ms);

        let fired_key = (key.strategy.clone(), key.symbol.clone(), key.side);
        {
            let fired = self.fired.read();
            if fired.get(&fired_key) == Some(&start) {
                // This side already fired for this boundary.
                return None;
            }
        }

        let bucket_key = (key.strategy.clone(), key.symbol.clone());
        let cached = {
            let cache = self.bucket_cache.read();
            cache
                .get(&bucket_key)
                .and_then(|(cached_start, sig)| (*cached_start == start).then_some(*sig))
        };

        let signal = match cached {
            Some(sig) => sig,
            None => {
                let sig = source
                    .signal_at(&key.user, &key.strategy, &key.symbol, start)
                    .await;
                self.bucket_cache.write().insert(bucket_key, (start, sig));
                sig
            }
        };

        let signal = signal?;
        if signal != key.side {
            return None;
        }

        if active_count >= cap {
            return None;
        }

        self.fired.write().insert(fired_key, start);

        Some(Intent::new(
            key.user.clone(),
            key.strategy.clone(),
            key.symbol.clone(),
            key.side,
            IntentStatus::IsOpening,
        ))
    }
}

impl Default for SignalEngine {
    fn default() -> Self {
        Self::new()
    }
}
