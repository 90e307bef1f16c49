// =============================================================================
// Price Feed — cached last-trade price with a REST fallback
// =============================================================================
//
// A streaming task keeps a `parking_lot::RwLock<HashMap<String, f64>>` warm,
// and a synchronous getter
// serves readers without ever blocking on network I/O in the common case
// (§4.3). When the cache is cold, `get_price` falls back to
// `ExchangeGateway::fetch_last_price`, retried a bounded number of times.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::gateway::{ExchangeGateway, PriceStream};

const REST_FALLBACK_RETRIES: u32 = 5;
const REST_FALLBACK_DELAY: Duration = Duration::from_millis(200);

/// Cached last-trade price per symbol, with a REST fallback for cold starts.
pub struct PriceFeed {
    last_price: RwLock<HashMap<String, f64>>,
}

impl PriceFeed {
    pub fn new() -> Self {
        Self {
            last_price: RwLock::new(HashMap::new()),
        }
    }

    /// Ingest one trade tick (§4.3: "take the last trade price if > 0").
    pub fn on_trade(&self, symbol: &str, price: f64) {
        if price <= 0.0 {
            return;
        }
        self.last_price.write().insert(symbol.to_string(), price);
    }

    /// Synchronous cache read, no fallback.
    pub fn cached(&self, symbol: &str) -> Option<f64> {
        self.last_price.read().get(symbol).copied()
    }

    /// Returns the cached last price for `symbol`, falling back to a
    /// retried REST lookup via `gateway` when the cache is cold. Returns
    /// `None` after exhausting retries — callers must abort the current
    /// intent in that case (§4.3, §7).
    pub async fn get_price(&self, gateway: &dyn ExchangeGateway, symbol: &str) -> Option<f64> {
        if let Some(price) = self.cached(symbol) {
            return Some(price);
        }

        for attempt in 1..=REST_FALLBACK_RETRIES {
            match gateway.fetch_last_price(symbol).await {
                Ok(price) if price > 0.0 => {
                    self.on_trade(symbol, price);
                    return Some(price);
                }
                Ok(_) => {
                    debug!(symbol, attempt, "fetch_last_price returned a non-positive price");
                }
                Err(err) => {
                    warn!(symbol, attempt, error = %err, "fetch_last_price failed");
                }
            }
            if attempt < REST_FALLBACK_RETRIES {
                tokio::time::sleep(REST_FALLBACK_DELAY).await;
            }
        }

        warn!(symbol, "price feed exhausted REST fallback retries");
        None
    }

    /// Drives the streaming ingestion task (T3): consumes every tick from
    /// `stream` for `symbol` until the stream ends.
    pub async fn run_stream(self: Arc<Self>, symbol: String, mut stream: Box<dyn PriceStream>) {
        while let Some(tick) = stream.next_trade().await {
            self.on_trade(&symbol, tick.price);
        }
        warn!(symbol = %symbol, "price stream ended");
    }
}

impl Default for PriceFeed {
    fn default() -> Self {
        Self::new()
    }
}
