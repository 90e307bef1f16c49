// =============================================================================
// Position Syncer — reconciles exchange-reported positions into PositionStore
// (§4.4)
// =============================================================================
//
// One `ReconcileResult` summary per cycle, logged with the same structured
// `info!`/`warn!` pairing used elsewhere. All per-user
// reconciliations run concurrently; every mutation goes through the store
// lock via `PositionStore`'s own methods.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::config::{RootConfig, StrategyConfig, UserConfig};
use crate::gateway::ExchangeGateway;
use crate::grid_math::{self, GridStep};
use crate::notifier::{NotifyEvent, Notifier};
use crate::position_store::{PositionKey, PositionStore};
use crate::types::{now_ms, OrderSide, Side, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    New,
    Update,
    PartialClose,
    FullClose,
    NoChange,
}

/// Per-cycle reconciliation summary for one user (expansion: adds the
/// gray-band/repair counters alongside the base transition counts).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileResult {
    pub new_count: u32,
    pub update_count: u32,
    pub partial_close_count: u32,
    pub full_close_count: u32,
    pub problem_closed: bool,
    /// I10 decision: observability for the `old/2 <= amount < old` gray band
    /// that the partial-close heuristic leaves as a plain update.
    pub updates_in_gray_band_total: u32,
    pub partial_close_repairs_total: u32,
}

/// A minimal view of one exchange-reported open position, keyed for lookup
/// by (symbol, side).
#[derive(Debug, Clone, Copy)]
struct ExchangeRecord {
    amount: f64,
    entry_price: f64,
    notional: f64,
}

pub struct PositionSyncer {
    first_update_done: RwLock<HashMap<UserId, bool>>,
}

impl PositionSyncer {
    pub fn new() -> Self {
        Self {
            first_update_done: RwLock::new(HashMap::new()),
        }
    }

    fn is_first_cycle(&self, user: &UserId) -> bool {
        !*self.first_update_done.read().get(user).unwrap_or(&false)
    }

    fn mark_first_cycle_done(&self, user: &UserId) {
        self.first_update_done.write().insert(user.clone(), true);
    }

    /// Runs one reconciliation cycle for every user in `config`, concurrently.
    pub async fn run_cycle(
        &self,
        store: &PositionStore,
        config: &RootConfig,
        gateways: &HashMap<UserId, Arc<dyn ExchangeGateway>>,
        notifier: &dyn Notifier,
    ) -> Vec<(UserId, anyhow::Result<ReconcileResult>)> {
        let futures = config.users.iter().filter_map(|user_cfg| {
            let user = UserId(user_cfg.user_id.clone());
            let gateway = gateways.get(&user)?.clone();
            Some(async move {
                let result = self
                    .reconcile_user(gateway.as_ref(), store, user_cfg, &config.strategies, notifier)
                    .await;
                (user, result)
            })
        });

        join_all(futures).await
    }

    /// Reconciles every tracked (strategy, symbol, side) key belonging to
    /// `user_cfg` against the exchange's reported positions.
    pub async fn reconcile_user(
        &self,
        gateway: &dyn ExchangeGateway,
        store: &PositionStore,
        user_cfg: &UserConfig,
        strategies: &HashMap<String, StrategyConfig>,
        notifier: &dyn Notifier,
    ) -> anyhow::Result<ReconcileResult> {
        let user = UserId(user_cfg.user_id.clone());
        let positions = gateway.fetch_positions().await?;

        let mut by_symbol_side: HashMap<(String, Side), ExchangeRecord> = HashMap::new();
        for p in &positions {
            by_symbol_side.insert(
                (p.symbol.clone(), p.position_side),
                ExchangeRecord {
                    amount: p.position_amt.abs(),
                    entry_price: p.entry_price,
                    notional: p.notional,
                },
            );
        }

        let is_first_cycle = self.is_first_cycle(&user);
        let mut result = ReconcileResult::default();

        for key in store.keys() {
            if key.user != user {
                continue;
            }
            let Some(strategy_cfg) = strategies.get(&key.strategy) else {
                continue;
            };
            let grid: &[GridStep] = &strategy_cfg.grid_orders;
            let Some(risk) = user_cfg.risk_for(&key.symbol) else {
                continue;
            };
            let base = grid_math::base_notional(risk.margin_size, risk.leverage);

            let record = by_symbol_side.get(&(key.symbol.clone(), key.side)).copied();
            let Some(old_state) = store.get(&key) else {
                continue;
            };

            let amount = record.map(|r| r.amount).unwrap_or(0.0);
            let was_in_position = old_state.in_position;
            let old_amount = old_state.comul_qty;

            let transition = if amount > 0.0 && !was_in_position {
                Transition::New
            } else if amount > 0.0 && was_in_position && old_amount > 0.0 && amount < old_amount / 2.0 {
                Transition::PartialClose
            } else if amount > 0.0 && was_in_position {
                Transition::Update
            } else if amount == 0.0 && was_in_position {
                Transition::FullClose
            } else {
                Transition::NoChange
            };

            if transition == Transition::Update && amount < old_amount {
                result.updates_in_gray_band_total += 1;
            }

            let real = if let Some(r) = record {
                grid_math::estimate_progress(grid, base, r.notional)
            } else {
                1
            };

            match transition {
                Transition::New => {
                    let record = record.expect("New transition implies a record");
                    let reconstructed = if real > 1 && is_first_cycle {
                        grid_math::reconstruct_entry_price(record.entry_price, grid, real, key.side)
                    } else {
                        None
                    };
                    let entry_price = reconstructed.unwrap_or(record.entry_price);

                    store.update(&key, |s| {
                        s.in_position = true;
                        s.entry_price = Some(entry_price);
                        s.avg_price = Some(record.entry_price);
                        s.comul_qty = amount;
                        s.notional = record.notional;
                        s.c_time = Some(now_ms());
                        s.avg_progress_counter = s.avg_progress_counter.max(real as u32);
                        s.avg_progress_real = real as u32;
                    });
                    result.new_count += 1;
                    info!(symbol = %key.symbol, side = %key.side, user = %user, "position opened (reconciled)");
                    notifier
                        .notify(NotifyEvent::PositionOpened {
                            user: user.0.clone(),
                            symbol: key.symbol.clone(),
                        })
                        .await;
                }
                Transition::Update => {
                    let record = record.expect("Update transition implies a record");
                    store.update(&key, |s| {
                        s.avg_price = Some(record.entry_price);
                        s.comul_qty = amount;
                        s.notional = record.notional;
                        s.avg_progress_counter = s.avg_progress_counter.max(real as u32);
                        s.avg_progress_real = real as u32;
                    });
                    result.update_count += 1;
                }
                Transition::PartialClose => {
                    result.partial_close_count += 1;
                    let opposite = match key.side {
                        Side::Long => OrderSide::Sell,
                        Side::Short => OrderSide::Buy,
                    };
                    match gateway
                        .make_order(&key.symbol, opposite, key.side, old_amount)
                        .await
                    {
                        Ok(_) => {
                            result.partial_close_repairs_total += 1;
                            info!(symbol = %key.symbol, side = %key.side, user = %user, "partial-close repair order placed");
                        }
                        Err(err) => {
                            result.problem_closed = true;
                            warn!(symbol = %key.symbol, side = %key.side, user = %user, error = %err, "partial-close repair order failed, will retry next cycle");
                            notifier
                                .notify(NotifyEvent::ReconcileProblem {
                                    user: user.0.clone(),
                                    symbol: key.symbol.clone(),
                                })
                                .await;
                        }
                    }
                }
                Transition::FullClose => {
                    let start_ms = old_state.c_time.unwrap_or(0);
                    match gateway
                        .get_realized_pnl(&key.symbol, key.side, start_ms, now_ms())
                        .await
                    {
                        Ok(pnl) => {
                            info!(
                                symbol = %key.symbol, side = %key.side, user = %user,
                                pnl_usdt = pnl.pnl_usdt, commission = pnl.commission,
                                "position closed"
                            );
                            notifier
                                .notify(NotifyEvent::PositionClosed {
                                    user: user.0.clone(),
                                    symbol: key.symbol.clone(),
                                    pnl_usdt: pnl.pnl_usdt,
                                })
                                .await;
                        }
                        Err(err) => warn!(symbol = %key.symbol, side = %key.side, user = %user, error = %err, "failed to fetch realized PnL on close"),
                    }

                    if let Err(err) = gateway.cancel_orders_by_symbol_side(&key.symbol, key.side).await {
                        warn!(symbol = %key.symbol, side = %key.side, user = %user, error = %err, "failed to cancel risk orders on close");
                    }

                    store.reset(&key);
                    result.full_close_count += 1;
                }
                Transition::NoChange => {}
            }
        }

        if is_first_cycle {
            self.mark_first_cycle_done(&user);
        }

        Ok(result)
    }
}

impl Default for PositionSyncer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CoreConfig, Direction, MarginType, SymbolRisk, TpOrderType};
    use crate::gateway::{ExchangePosition, MarginMode, OrderReceipt, RealizedPnl, RiskOrderType, SymbolInfo};
    use crate::notifier::RecordingNotifier;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;

    struct FakeGateway {
        positions: Vec<ExchangePosition>,
        make_order_calls: StdMutex<Vec<(String, OrderSide, f64)>>,
        fail_make_order: bool,
    }

    #[async_trait]
    impl ExchangeGateway for FakeGateway {
        async fn fetch_positions(&self) -> anyhow::Result<Vec<ExchangePosition>> {
            Ok(self.positions.clone())
        }
        async fn fetch_exchange_info(&self, _symbol: &str) -> anyhow::Result<SymbolInfo> {
            unimplemented!()
        }
        async fn make_order(
            &self,
            symbol: &str,
            side: OrderSide,
            _position_side: Side,
            qty: f64,
        ) -> anyhow::Result<OrderReceipt> {
            self.make_order_calls
                .lock()
                .unwrap()
                .push((symbol.to_string(), side, qty));
            if self.fail_make_order {
                anyhow::bail!("simulated repair order failure");
            }
            Ok(OrderReceipt {
                order_id: "1".into(),
                status: "FILLED".into(),
                avg_price: Some(1.0),
                executed_qty: Some(qty),
            })
        }
        async fn place_risk_order(
            &self,
            _symbol: &str,
            _side: OrderSide,
            _position_side: Side,
            _qty: f64,
            _target_price: f64,
            _suffix: &str,
            _order_type: RiskOrderType,
        ) -> anyhow::Result<OrderReceipt> {
            unimplemented!()
        }
        async fn cancel_orders_by_symbol_side(
            &self,
            _symbol: &str,
            _position_side: Side,
        ) -> anyhow::Result<bool> {
            Ok(true)
        }
        async fn set_margin_type(&self, _symbol: &str, _mode: MarginMode) -> anyhow::Result<()> {
            unimplemented!()
        }
        async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> anyhow::Result<()> {
            unimplemented!()
        }
        async fn get_realized_pnl(
            &self,
            _symbol: &str,
            _direction: Side,
            _start_ms: i64,
            _end_ms: i64,
        ) -> anyhow::Result<RealizedPnl> {
            Ok(RealizedPnl {
                pnl_usdt: 5.0,
                commission: 0.1,
            })
        }
        async fn fetch_last_price(&self, _symbol: &str) -> anyhow::Result<f64> {
            unimplemented!()
        }
    }

    fn user_config() -> UserConfig {
        let mut symbols_risk = HashMap::new();
        symbols_risk.insert(
            "ANY_COINS".to_string(),
            SymbolRisk {
                margin_size: 26.0,
                leverage: 10.0,
                sl: Some(20.0),
                tp: Some(0.6),
                tp_order_type: TpOrderType::Market,
                fallback_tp: None,
                fallback_sl: None,
            },
        );
        UserConfig {
            user_id: "u1".to_string(),
            proxies: vec![],
            core: CoreConfig {
                margin_type: MarginType::Isolated,
                quote_asset: "USDT".to_string(),
                direction: Direction::Both,
                long_positions_limit: 2,
                short_positions_limit: 2,
            },
            symbols_risk,
            strategies_symbols: HashSet::new(),
            active_strategies: vec!["grid_v1".to_string()],
        }
    }

    fn strategies() -> HashMap<String, StrategyConfig> {
        let mut m = HashMap::new();
        m.insert(
            "grid_v1".to_string(),
            StrategyConfig {
                timeframe: "5m".to_string(),
                grid_orders: vec![
                    GridStep { indent_pct: 0.0, volume_pct: 10.52 },
                    GridStep { indent_pct: -8.0, volume_pct: 11.57 },
                ],
            },
        );
        m
    }

    fn key() -> PositionKey {
        PositionKey::new("u1", "grid_v1", "BTCUSDT", Side::Long)
    }

    #[tokio::test]
    async fn classifies_new_position_and_opens_it() {
        let store = PositionStore::new();
        store.ensure(&key(), 3, 2);
        let gateway = FakeGateway {
            positions: vec![ExchangePosition {
                symbol: "BTCUSDT".into(),
                position_side: Side::Long,
                position_amt: 27.0,
                entry_price: 1.0,
                notional: 27.0,
                leverage: 10.0,
                isolated_margin: 2.6,
            }],
            make_order_calls: StdMutex::new(vec![]),
            fail_make_order: false,
        };

        let syncer = PositionSyncer::new();
        let notifier = RecordingNotifier::new();
        let result = syncer
            .reconcile_user(&gateway, &store, &user_config(), &strategies(), &notifier)
            .await
            .unwrap();

        assert_eq!(result.new_count, 1);
        let state = store.get(&key()).unwrap();
        assert!(state.in_position);
        assert_eq!(state.comul_qty, 27.0);
        assert_eq!(
            notifier.events(),
            vec![NotifyEvent::PositionOpened {
                user: "u1".into(),
                symbol: "BTCUSDT".into(),
            }]
        );
    }

    #[tokio::test]
    async fn full_close_resets_state_and_queries_pnl() {
        let store = PositionStore::new();
        store.ensure(&key(), 3, 2);
        store.update(&key(), |s| {
            s.in_position = true;
            s.comul_qty = 27.0;
            s.avg_price = Some(1.0);
            s.entry_price = Some(1.0);
            s.c_time = Some(1000);
        });

        let gateway = FakeGateway {
            positions: vec![],
            make_order_calls: StdMutex::new(vec![]),
            fail_make_order: false,
        };
        let syncer = PositionSyncer::new();
        let notifier = RecordingNotifier::new();
        let result = syncer
            .reconcile_user(&gateway, &store, &user_config(), &strategies(), &notifier)
            .await
            .unwrap();

        assert_eq!(result.full_close_count, 1);
        let state = store.get(&key()).unwrap();
        assert!(!state.in_position);
        assert_eq!(state.comul_qty, 0.0);
        assert_eq!(
            notifier.events(),
            vec![NotifyEvent::PositionClosed {
                user: "u1".into(),
                symbol: "BTCUSDT".into(),
                pnl_usdt: 5.0,
            }]
        );
    }

    #[tokio::test]
    async fn partial_close_triggers_repair_order_on_opposite_side() {
        let store = PositionStore::new();
        store.ensure(&key(), 3, 2);
        store.update(&key(), |s| {
            s.in_position = true;
            s.comul_qty = 27.0;
            s.avg_price = Some(1.0);
            s.entry_price = Some(1.0);
            s.c_time = Some(1000);
        });

        // Reported amount < old/2: triggers a partial-close repair.
        let gateway = FakeGateway {
            positions: vec![ExchangePosition {
                symbol: "BTCUSDT".into(),
                position_side: Side::Long,
                position_amt: 10.0,
                entry_price: 1.0,
                notional: 10.0,
                leverage: 10.0,
                isolated_margin: 1.0,
            }],
            make_order_calls: StdMutex::new(vec![]),
            fail_make_order: false,
        };
        let syncer = PositionSyncer::new();
        let notifier = RecordingNotifier::new();
        let result = syncer
            .reconcile_user(&gateway, &store, &user_config(), &strategies(), &notifier)
            .await
            .unwrap();

        assert_eq!(result.partial_close_count, 1);
        assert_eq!(result.partial_close_repairs_total, 1);
        let calls = gateway.make_order_calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, OrderSide::Sell);
        assert_eq!(calls[0].2, 27.0);
    }

    // I10 expansion: gray-band updates (old/2 <= amount < old) are observable.
    #[tokio::test]
    async fn update_in_gray_band_is_counted_without_changing_semantics() {
        let store = PositionStore::new();
        store.ensure(&key(), 3, 2);
        store.update(&key(), |s| {
            s.in_position = true;
            s.comul_qty = 20.0;
            s.avg_price = Some(1.0);
            s.entry_price = Some(1.0);
            s.c_time = Some(1000);
        });

        // 15 is >= old/2 (10) but < old (20): gray band, plain update.
        let gateway = FakeGateway {
            positions: vec![ExchangePosition {
                symbol: "BTCUSDT".into(),
                position_side: Side::Long,
                position_amt: 15.0,
                entry_price: 1.0,
                notional: 15.0,
                leverage: 10.0,
                isolated_margin: 1.5,
            }],
            make_order_calls: StdMutex::new(vec![]),
            fail_make_order: false,
        };
        let syncer = PositionSyncer::new();
        let notifier = RecordingNotifier::new();
        let result = syncer
            .reconcile_user(&gateway, &store, &user_config(), &strategies(), &notifier)
            .await
            .unwrap();

        assert_eq!(result.update_count, 1);
        assert_eq!(result.updates_in_gray_band_total, 1);
        assert_eq!(result.partial_close_count, 0);
    }

    // Regression: entry-price reconstruction must only happen on the user's
    // first-ever reconciliation cycle. A later re-open (after a prior full
    // close) keeps the raw exchange entry_price even when estimated progress
    // is past the first grid step.
    #[tokio::test]
    async fn entry_price_reconstruction_only_applies_on_first_ever_cycle() {
        let store = PositionStore::new();
        store.ensure(&key(), 3, 2);
        let syncer = PositionSyncer::new();
        let notifier = RecordingNotifier::new();

        let gateway_open = FakeGateway {
            positions: vec![ExchangePosition {
                symbol: "BTCUSDT".into(),
                position_side: Side::Long,
                position_amt: 21.6,
                entry_price: 0.96,
                notional: 57.43,
                leverage: 10.0,
                isolated_margin: 5.743,
            }],
            make_order_calls: StdMutex::new(vec![]),
            fail_make_order: false,
        };

        // Cycle 1 (first-ever): reconstructs entry_price from estimated progress.
        syncer
            .reconcile_user(&gateway_open, &store, &user_config(), &strategies(), &notifier)
            .await
            .unwrap();
        let reconstructed_entry = store.get(&key()).unwrap().entry_price.unwrap();
        assert_ne!(reconstructed_entry, 0.96);

        // Cycle 2: exchange reports the position closed.
        let gateway_closed = FakeGateway {
            positions: vec![],
            make_order_calls: StdMutex::new(vec![]),
            fail_make_order: false,
        };
        syncer
            .reconcile_user(&gateway_closed, &store, &user_config(), &strategies(), &notifier)
            .await
            .unwrap();
        assert!(!store.get(&key()).unwrap().in_position);

        // Cycle 3: a later re-open, same estimated progress, must use the raw
        // exchange entry_price unmodified.
        syncer
            .reconcile_user(&gateway_open, &store, &user_config(), &strategies(), &notifier)
            .await
            .unwrap();
        let second_open_entry = store.get(&key()).unwrap().entry_price.unwrap();
        assert_eq!(second_open_entry, 0.96);
    }

    #[tokio::test]
    async fn partial_close_failure_notifies_reconcile_problem() {
        let store = PositionStore::new();
        store.ensure(&key(), 3, 2);
        store.update(&key(), |s| {
            s.in_position = true;
            s.comul_qty = 27.0;
            s.avg_price = Some(1.0);
            s.entry_price = Some(1.0);
            s.c_time = Some(1000);
        });

        let gateway = FakeGateway {
            positions: vec![ExchangePosition {
                symbol: "BTCUSDT".into(),
                position_side: Side::Long,
                position_amt: 10.0,
                entry_price: 1.0,
                notional: 10.0,
                leverage: 10.0,
                isolated_margin: 1.0,
            }],
            make_order_calls: StdMutex::new(vec![]),
            fail_make_order: true,
        };
        let syncer = PositionSyncer::new();
        let notifier = RecordingNotifier::new();
        let result = syncer
            .reconcile_user(&gateway, &store, &user_config(), &strategies(), &notifier)
            .await
            .unwrap();

        assert!(result.problem_closed);
        assert_eq!(
            notifier.events(),
            vec![NotifyEvent::ReconcileProblem {
                user: "u1".into(),
                symbol: "BTCUSDT".into(),
            }]
        );
    }
}
