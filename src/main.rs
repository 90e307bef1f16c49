// =============================================================================
// Control Plane — Main Entry Point (A5: Scheduler)
// =============================================================================
//
// Wires the three cooperative tasks (T1 main decision loop, T2 PositionSyncer
// loop, T3 price-feed stream) plus the auxiliary tasks (log flush every 5s,
// exchange-metadata refresh every 1800s) around a single `Arc<BotContext>`,
// one `tokio::spawn` per long-running task, each with its own interval.
// =============================================================================

mod config;
mod context;
mod event_log;
mod gateway;
mod grid_math;
mod intent;
mod notifier;
mod order_pipeline;
mod position_store;
mod position_syncer;
mod price_feed;
mod risk_monitor;
mod risk_order_placer;
mod signal_engine;
mod types;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::RootConfig;
use crate::context::BotContext;
use crate::event_log::EventLevel;
use crate::gateway::{
    ExchangeGateway, ExchangePosition, MarginMode, OrderReceipt, RealizedPnl, RiskOrderType, SymbolInfo,
};
use crate::intent::sort_risk_first;
use crate::notifier::NoopNotifier;
use crate::order_pipeline::OrderPipeline;
use crate::position_syncer::PositionSyncer;
use crate::signal_engine::SignalSource;
use crate::types::{OrderSide, Side, UserId};

const RUTINE_CYCLE_FREQUENCY: Duration = Duration::from_secs(1);
const POS_UPDATE_FREQUENCY: Duration = Duration::from_secs(1);
const LOG_FLUSH_FREQUENCY: Duration = Duration::from_secs(5);
const EXCHANGE_METADATA_REFRESH_FREQUENCY: Duration = Duration::from_secs(1800);

/// Extension seam for the out-of-scope concrete exchange client (§1 — the
/// venue's REST/WebSocket internals are explicitly not part of this crate).
/// Every call fails; a real deployment replaces this with a concrete
/// `ExchangeGateway` per user before calling [`BotContext::build`].
struct UnimplementedGateway;

#[async_trait]
impl ExchangeGateway for UnimplementedGateway {
    async fn fetch_positions(&self) -> Result<Vec<ExchangePosition>> {
        anyhow::bail!("no concrete ExchangeGateway wired into this build")
    }
    async fn fetch_exchange_info(&self, _symbol: &str) -> Result<SymbolInfo> {
        anyhow::bail!("no concrete ExchangeGateway wired into this build")
    }
    async fn make_order(
        &self,
        _symbol: &str,
        _side: OrderSide,
        _position_side: Side,
        _qty: f64,
    ) -> Result<OrderReceipt> {
        anyhow::bail!("no concrete ExchangeGateway wired into this build")
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
    ) -> Result<OrderReceipt> {
        anyhow::bail!("no concrete ExchangeGateway wired into this build")
    }
    async fn cancel_orders_by_symbol_side(&self, _symbol: &str, _position_side: Side) -> Result<bool> {
        anyhow::bail!("no concrete ExchangeGateway wired into this build")
    }
    async fn set_margin_type(&self, _symbol: &str, _mode: MarginMode) -> Result<()> {
        anyhow::bail!("no concrete ExchangeGateway wired into this build")
    }
    async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> Result<()> {
        anyhow::bail!("no concrete ExchangeGateway wired into this build")
    }
    async fn get_realized_pnl(
        &self,
        _symbol: &str,
        _direction: Side,
        _start_ms: i64,
        _end_ms: i64,
    ) -> Result<RealizedPnl> {
        anyhow::bail!("no concrete ExchangeGateway wired into this build")
    }
    async fn fetch_last_price(&self, _symbol: &str) -> Result<f64> {
        anyhow::bail!("no concrete ExchangeGateway wired into this build")
    }
}

/// Extension seam for the out-of-scope concrete indicator engine (§4.6): a
/// real deployment's EMA/RSI computation plugs in here. Never fires on its
/// own.
struct NoSignalSource;

#[async_trait]
impl SignalSource for NoSignalSource {
    async fn signal_at(&self, _user: &UserId, _strategy: &str, _symbol: &str, _bucket_start_ms: i64) -> Option<Side> {
        None
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("control plane starting up");

    let config_path = std::env::var("CONTROL_PLANE_CONFIG").unwrap_or_else(|_| "config.json".to_string());
    let config = RootConfig::load(&config_path).unwrap_or_else(|e| {
        error!(error = %e, path = %config_path, "failed to load configuration, halting");
        std::process::exit(1);
    });

    let mut gateways: HashMap<UserId, Arc<dyn ExchangeGateway>> = HashMap::new();
    for user in &config.users {
        gateways.insert(UserId(user.user_id.clone()), Arc::new(UnimplementedGateway));
    }

    let ctx = match BotContext::build(config, gateways, Arc::new(NoopNotifier)).await {
        Ok(ctx) => Arc::new(ctx),
        Err(e) => {
            error!(error = %e, "fatal startup error, exiting before spawning any task");
            std::process::exit(1);
        }
    };

    let stop_bot = Arc::new(AtomicBool::new(false));
    {
        let stop_bot = stop_bot.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("shutdown signal received");
                stop_bot.store(true, Ordering::SeqCst);
            }
        });
    }

    let pipeline = Arc::new(OrderPipeline::new());
    let syncer = Arc::new(PositionSyncer::new());

    let t1 = tokio::spawn(run_main_loop(ctx.clone(), pipeline, stop_bot.clone()));
    let t2 = tokio::spawn(run_syncer_loop(ctx.clone(), syncer, stop_bot.clone()));
    let log_flush = tokio::spawn(run_log_flush(ctx.clone(), stop_bot.clone()));
    let metadata_refresh = tokio::spawn(run_metadata_refresh(ctx.clone(), stop_bot.clone()));

    let _ = tokio::join!(t1, t2, log_flush, metadata_refresh);

    info!("control plane shut down");
    Ok(())
}

/// T1: the main decision loop (§4.5 RiskMonitor + §4.6 SignalEngine + §4.7
/// OrderPipeline dispatch), at `RUTINE_CYCLE_FREQUENCY`.
async fn run_main_loop(ctx: Arc<BotContext>, pipeline: Arc<OrderPipeline>, stop_bot: Arc<AtomicBool>) {
    let signal_source = NoSignalSource;
    let mut ticker = tokio::time::interval(RUTINE_CYCLE_FREQUENCY);

    while !stop_bot.load(Ordering::SeqCst) {
        ticker.tick().await;

        for user_cfg in &ctx.config.users {
            let user = UserId(user_cfg.user_id.clone());
            let Some(gateway) = ctx.gateway_for(&user) else {
                continue;
            };

            let mut risk_intents = Vec::new();
            let mut open_intents = Vec::new();

            for key in ctx.store.keys() {
                if key.user != user {
                    continue;
                }
                let Some(state) = ctx.store.get(&key) else {
                    continue;
                };
                let Some(strategy_cfg) = ctx.config.strategies.get(&key.strategy) else {
                    continue;
                };
                let Some(risk) = user_cfg.risk_for(&key.symbol) else {
                    continue;
                };

                let price = ctx.price_feed.get_price(gateway.as_ref(), &key.symbol).await;
                let verdict = risk_monitor::evaluate(&key, &state, price, risk, &strategy_cfg.grid_orders);
                if let Some(intent) =
                    risk_monitor::apply_verdict(&ctx.store, &key, user.clone(), &verdict, ctx.notifier.as_ref()).await
                {
                    risk_intents.push(intent);
                    continue;
                }

                let active_count = ctx
                    .store
                    .keys()
                    .iter()
                    .filter(|k| k.user == user && k.side == key.side)
                    .filter(|k| ctx.store.get(k).map(|s| s.in_position).unwrap_or(false))
                    .count() as u32;
                let cap = user_cfg.cap_for(key.side);

                if let Some(intent) = ctx
                    .signal_engine
                    .evaluate(
                        &signal_source,
                        &key,
                        &state,
                        &strategy_cfg.timeframe,
                        crate::types::now_ms(),
                        active_count,
                        cap,
                    )
                    .await
                {
                    open_intents.push(intent);
                }
            }

            // Risk-first dispatch (§5): risk intents flush before opens.
            sort_risk_first(&mut risk_intents);
            let mut batch = risk_intents;
            batch.append(&mut open_intents);

            if !batch.is_empty() {
                let outcomes = pipeline
                    .execute_batch(batch, &ctx.store, user_cfg, gateway.as_ref(), &ctx.price_feed)
                    .await;
                for outcome in outcomes {
                    ctx.event_log.push(EventLevel::Info, format!("{outcome:?}"));
                }
            }
        }
    }
}

/// T2: the PositionSyncer loop (§4.4), at `POS_UPDATE_FREQUENCY`.
async fn run_syncer_loop(ctx: Arc<BotContext>, syncer: Arc<PositionSyncer>, stop_bot: Arc<AtomicBool>) {
    let mut ticker = tokio::time::interval(POS_UPDATE_FREQUENCY);
    while !stop_bot.load(Ordering::SeqCst) {
        ticker.tick().await;
        let results = syncer
            .run_cycle(&ctx.store, &ctx.config, &ctx.gateways, ctx.notifier.as_ref())
            .await;
        for (user, result) in results {
            match result {
                Ok(r) if r.problem_closed => {
                    warn!(%user, ?r, "reconcile cycle completed with a problem_closed flag");
                }
                Ok(r) => info!(%user, ?r, "reconcile cycle completed"),
                Err(e) => warn!(%user, error = %e, "reconcile cycle failed, retrying next tick"),
            }
        }
    }
}

/// Flushes the bounded event log every `LOG_FLUSH_FREQUENCY` (disk writing is
/// out of scope; this only demonstrates the drain cadence).
async fn run_log_flush(ctx: Arc<BotContext>, stop_bot: Arc<AtomicBool>) {
    let mut ticker = tokio::time::interval(LOG_FLUSH_FREQUENCY);
    while !stop_bot.load(Ordering::SeqCst) {
        ticker.tick().await;
        let drained = ctx.event_log.flush();
        if !drained.is_empty() {
            info!(count = drained.len(), "flushed event log");
        }
    }
}

/// Refreshes exchange symbol metadata (precisions) every
/// `EXCHANGE_METADATA_REFRESH_FREQUENCY`.
async fn run_metadata_refresh(ctx: Arc<BotContext>, stop_bot: Arc<AtomicBool>) {
    let mut ticker = tokio::time::interval(EXCHANGE_METADATA_REFRESH_FREQUENCY);
    while !stop_bot.load(Ordering::SeqCst) {
        ticker.tick().await;
        for user_cfg in &ctx.config.users {
            let user = UserId(user_cfg.user_id.clone());
            let Some(gateway) = ctx.gateway_for(&user) else {
                continue;
            };
            for base_symbol in &user_cfg.strategies_symbols {
                let symbol = format!("{base_symbol}{}", user_cfg.core.quote_asset);
                if let Err(e) = gateway.fetch_exchange_info(&symbol).await {
                    warn!(symbol, error = %e, "metadata refresh failed");
                }
            }
        }
    }
}
