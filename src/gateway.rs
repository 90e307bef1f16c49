// =============================================================================
// Exchange Gateway — collaborator interface (§6)
// =============================================================================
//
// The concrete REST/WebSocket client, proxy rotation, and HTTP session
// keep-alive are out of scope for this crate (§1). Every component that
// would otherwise need exchange access takes an `Arc<dyn ExchangeGateway>`
// instead of threading ad-hoc callbacks (§9). Concrete
// implementations (a real venue client, or the in-memory fake used by this
// crate's own tests) live outside this module.
// =============================================================================

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{OrderSide, Side};

/// One exchange-reported open position (§6 `fetch_positions`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub symbol: String,
    pub position_side: Side,
    /// Always reported as a non-negative magnitude; the sign of the raw
    /// exchange field (`positionAmt`) is folded into `position_side`.
    pub position_amt: f64,
    pub entry_price: f64,
    pub notional: f64,
    pub leverage: f64,
    pub isolated_margin: f64,
}

/// Symbol precision/tick metadata (§6 `fetch_exchange_info`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub qty_precision: i32,
    pub price_precision: i32,
}

/// Receipt returned by a successful order placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderReceipt {
    pub order_id: String,
    pub status: String,
    pub avg_price: Option<f64>,
    pub executed_qty: Option<f64>,
}

/// Conditional order type for risk orders (§4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskOrderType {
    TakeProfitMarket,
    /// A reduce-only LIMIT order at the target price.
    ReduceOnlyLimit,
    StopMarket,
}

/// `CROSSED` or `ISOLATED` margin mode, mirroring [`crate::config::MarginType`]
/// at the gateway boundary so the trait does not depend on the config module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarginMode {
    Crossed,
    Isolated,
}

/// Realized PnL for one (symbol, side) window, as reported by the exchange.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RealizedPnl {
    pub pnl_usdt: f64,
    pub commission: f64,
}

/// Abstract exchange operations the control plane consumes (§6). All
/// operations are idempotent-safe to retry from the caller's perspective:
/// the gateway itself does not retry, leaving retry/backoff policy to
/// callers (PriceFeed retries reads; everything else aborts-and-reschedules
/// per §7).
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    async fn fetch_positions(&self) -> anyhow::Result<Vec<ExchangePosition>>;

    async fn fetch_exchange_info(
        &self,
        symbol: &str,
    ) -> anyhow::Result<SymbolInfo>;

    async fn make_order(
        &self,
        symbol: &str,
        side: OrderSide,
        position_side: Side,
        qty: f64,
    ) -> anyhow::Result<OrderReceipt>;

    async fn place_risk_order(
        &self,
        symbol: &str,
        side: OrderSide,
        position_side: Side,
        qty: f64,
        target_price: f64,
        suffix: &str,
        order_type: RiskOrderType,
    ) -> anyhow::Result<OrderReceipt>;

    /// Cancels every open order on (symbol, position_side) whose type is one
    /// of the risk-order types (§4.8). Returns `true` iff every targeted
    /// order was confirmed removed (CANCELED, or already-gone).
    async fn cancel_orders_by_symbol_side(
        &self,
        symbol: &str,
        position_side: Side,
    ) -> anyhow::Result<bool>;

    async fn set_margin_type(&self, symbol: &str, mode: MarginMode) -> anyhow::Result<()>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> anyhow::Result<()>;

    async fn get_realized_pnl(
        &self,
        symbol: &str,
        direction: Side,
        start_ms: i64,
        end_ms: i64,
    ) -> anyhow::Result<RealizedPnl>;

    /// Synchronous-from-the-caller's-view REST fallback consumed by
    /// [`crate::price_feed::PriceFeed`] when the streaming cache is cold
    /// (§4.3).
    async fn fetch_last_price(&self, symbol: &str) -> anyhow::Result<f64>;
}

/// One trade tick delivered by the streaming price source (§6 "Streaming").
#[derive(Debug, Clone, Copy)]
pub struct TradeTick {
    pub price: f64,
}

/// Abstract streaming price source (T3, §5). A real implementation wraps a
/// per-symbol aggregate-trade WebSocket subscription; tests drive a
/// deterministic fake.
#[async_trait]
pub trait PriceStream: Send {
    /// Returns the next trade tick, or `None` when the stream has ended.
    async fn next_trade(&mut self) -> Option<TradeTick>;
}
