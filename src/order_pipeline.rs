// =============================================================================
// Order Pipeline — the execution engine (§4.7)
// =============================================================================
//
// Per-(user, symbol) serialization is an async mutex keyed by (user, symbol),
// looked up/inserted under a short-lived lock on the map itself and never
// held across an await — generalizing a per-user exclusive session to a
// serialization domain. Every outcome is logged with the same structured
// info!/warn! pairing used throughout the execution path.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock as SyncRwLock;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::config::{MarginType, UserConfig};
use crate::gateway::ExchangeGateway;
use crate::intent::{Intent, IntentStatus};
use crate::position_store::{PositionKey, PositionStore};
use crate::price_feed::PriceFeed;
use crate::risk_order_placer::{self, RiskSuffix};
use crate::types::{round_down_to_precision, OrderSide, Side, UserId};

const POSITION_UPDATE_POLL_INTERVAL: Duration = Duration::from_millis(150);
const POSITION_UPDATE_MAX_ATTEMPTS: u32 = 80;

/// Outcome of executing one [`Intent`].
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// Preconditions failed or computed qty was non-positive; no exchange
    /// call was made.
    Aborted { reason: String },
    /// The market order failed.
    MarketOrderFailed { reason: String },
    /// The market order succeeded and any follow-up (risk orders,
    /// cancellation) completed to the extent described for this status.
    Executed { position_confirmed: bool },
}

/// Keyed per-(user, symbol) exclusive execution lanes.
pub struct OrderPipeline {
    locks: SyncRwLock<HashMap<(UserId, String), Arc<AsyncMutex<()>>>>,
}

impl OrderPipeline {
    pub fn new() -> Self {
        Self {
            locks: SyncRwLock::new(HashMap::new()),
        }
    }

    fn lane(&self, user: &UserId, symbol: &str) -> Arc<AsyncMutex<()>> {
        let key = (user.clone(), symbol.to_string());
        if let Some(lane) = self.locks.read().get(&key) {
            return lane.clone();
        }
        self.locks
            .write()
            .entry(key)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Executes `intents` — already risk-first sorted by the caller — one
    /// lane (user, symbol) at a time, all lanes running concurrently.
    pub async fn execute_batch(
        &self,
        intents: Vec<Intent>,
        store: &PositionStore,
        user_cfg: &UserConfig,
        gateway: &dyn ExchangeGateway,
        price_feed: &PriceFeed,
    ) -> Vec<ExecutionOutcome> {
        let mut grouped: HashMap<(UserId, String), Vec<Intent>> = HashMap::new();
        for intent in intents {
            grouped
                .entry((intent.user.clone(), intent.symbol.clone()))
                .or_default()
                .push(intent);
        }

        let mut lane_futures = Vec::with_capacity(grouped.len());
        for ((user, symbol), lane_intents) in grouped {
            let lane = self.lane(&user, &symbol);
            lane_futures.push(async move {
                let _guard = lane.lock().await;
                let mut outcomes = Vec::with_capacity(lane_intents.len());
                for intent in lane_intents {
                    outcomes.push(self.execute_one(&intent, store, user_cfg, gateway, price_feed).await);
                }
                outcomes
            });
        }

        futures_util::future::join_all(lane_futures)
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    async fn execute_one(
        &self,
        intent: &Intent,
        store: &PositionStore,
        user_cfg: &UserConfig,
        gateway: &dyn ExchangeGateway,
        price_feed: &PriceFeed,
    ) -> ExecutionOutcome {
        let key = PositionKey::new(
            intent.user.clone(),
            intent.strategy.clone(),
            intent.symbol.clone(),
            intent.position_side,
        );

        let Some(state) = store.get(&key) else {
            return ExecutionOutcome::Aborted {
                reason: "position key not tracked".into(),
            };
        };

        // Step 1: compute qty.
        let qty = match intent.status {
            IntentStatus::IsClosing => state.comul_qty,
            IntentStatus::IsOpening | IntentStatus::IsAvg => {
                let Some(risk) = user_cfg.risk_for(&intent.symbol) else {
                    return ExecutionOutcome::Aborted {
                        reason: "no risk policy configured for symbol".into(),
                    };
                };
                let Some(price) = price_feed.get_price(gateway, &intent.symbol).await else {
                    return ExecutionOutcome::Aborted {
                        reason: "price unavailable".into(),
                    };
                };
                let notional = risk.margin_size * risk.leverage * state.process_volume / 100.0;
                round_down_to_precision(notional / price, state.qty_precision)
            }
        };
        if qty <= 0.0 {
            return ExecutionOutcome::Aborted {
                reason: "computed qty <= 0".into(),
            };
        }

        // Step 2: re-check preconditions.
        let preconditions_ok = match intent.status {
            IntentStatus::IsClosing => state.in_position,
            IntentStatus::IsOpening => !state.in_position,
            IntentStatus::IsAvg => state.in_position,
        };
        if !preconditions_ok {
            return ExecutionOutcome::Aborted {
                reason: "precondition failed on re-check".into(),
            };
        }
        let prev_avg_price = state.avg_price;

        // Step 3: configure leverage/margin (open/avg only).
        if matches!(intent.status, IntentStatus::IsOpening | IntentStatus::IsAvg) {
            if let Some(risk) = user_cfg.risk_for(&intent.symbol) {
                let mode = match user_cfg.core.margin_type {
                    MarginType::Crossed => crate::gateway::MarginMode::Crossed,
                    MarginType::Isolated => crate::gateway::MarginMode::Isolated,
                };
                if let Err(err) = gateway.set_margin_type(&intent.symbol, mode).await {
                    warn!(symbol = %intent.symbol, error = %err, "set_margin_type failed, continuing");
                }
                if let Err(err) = gateway.set_leverage(&intent.symbol, risk.leverage as u32).await {
                    warn!(symbol = %intent.symbol, error = %err, "set_leverage failed, continuing");
                }
            }
        }

        // Step 4: place MARKET order.
        let order_side = match (intent.status, intent.position_side) {
            (IntentStatus::IsOpening | IntentStatus::IsAvg, Side::Long) => OrderSide::Buy,
            (IntentStatus::IsOpening | IntentStatus::IsAvg, Side::Short) => OrderSide::Sell,
            (IntentStatus::IsClosing, Side::Long) => OrderSide::Sell,
            (IntentStatus::IsClosing, Side::Short) => OrderSide::Buy,
        };

        let receipt = gateway
            .make_order(&intent.symbol, order_side, intent.position_side, qty)
            .await;
        let receipt = match receipt {
            Ok(r) => r,
            Err(err) => {
                warn!(symbol = %intent.symbol, side = %intent.position_side, error = %err, "market order failed");
                return ExecutionOutcome::MarketOrderFailed {
                    reason: err.to_string(),
                };
            }
        };
        info!(
            symbol = %intent.symbol, side = %intent.position_side, status = ?intent.status,
            order_id = %receipt.order_id, qty, "market order placed"
        );

        // Step 5: branch by status.
        match intent.status {
            IntentStatus::IsClosing => {
                risk_order_placer::cancel_all(gateway, &intent.symbol, intent.position_side).await;
                ExecutionOutcome::Executed {
                    position_confirmed: true,
                }
            }
            IntentStatus::IsAvg | IntentStatus::IsOpening => {
                if matches!(intent.status, IntentStatus::IsAvg) {
                    risk_order_placer::cancel_all(gateway, &intent.symbol, intent.position_side).await;
                }

                let confirmed = wait_for_position_update(store, &key, prev_avg_price).await;
                if confirmed {
                    if let Some(confirmed_state) = store.get(&key) {
                        if let (Some(avg_price), Some(risk)) =
                            (confirmed_state.avg_price, user_cfg.risk_for(&intent.symbol))
                        {
                            risk_order_placer::place_all(
                                gateway,
                                &intent.symbol,
                                intent.position_side,
                                avg_price,
                                confirmed_state.price_precision,
                                confirmed_state.comul_qty,
                                risk,
                                &[RiskSuffix::Tp, RiskSuffix::Sl],
                            )
                            .await;
                        }
                    }
                } else {
                    warn!(symbol = %intent.symbol, side = %intent.position_side, "position-update wait timed out, skipping risk orders");
                }
                ExecutionOutcome::Executed {
                    position_confirmed: confirmed,
                }
            }
        }
    }
}

impl Default for OrderPipeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Polls `store` for confirmation that `key`'s position changed following an
/// order (§4.7 "position-update wait"): `in_position && avg_price !=
/// prev_avg_price && comul_qty > 0`, at 150ms intervals up to 80 attempts.
async fn wait_for_position_update(
    store: &PositionStore,
    key: &PositionKey,
    prev_avg_price: Option<f64>,
) -> bool {
    for _ in 0..POSITION_UPDATE_MAX_ATTEMPTS {
        if let Some(state) = store.get(key) {
            if state.in_position && state.avg_price != prev_avg_price && state.comul_qty > 0.0 {
                return true;
            }
        }
        tokio::time::sleep(POSITION_UPDATE_POLL_INTERVAL).await;
    }
    false
}
