// =============================================================================
// Risk Order Placer — TP/SL placement and cancellation (§4.8)
// =============================================================================

use futures_util::future::join_all;
use tracing::{info, warn};

use crate::config::{SymbolRisk, TpOrderType};
use crate::gateway::{ExchangeGateway, RiskOrderType};
use crate::types::{round_to_precision, OrderSide, Side};

/// One TP/SL suffix to place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskSuffix {
    Tp,
    Sl,
}

/// Places the requested `suffixes` for (symbol, side) in parallel. A suffix
/// whose configured percentage is absent is a no-op success (§4.8).
pub async fn place_all(
    gateway: &dyn ExchangeGateway,
    symbol: &str,
    side: Side,
    avg_price: f64,
    price_precision: i32,
    qty: f64,
    risk: &SymbolRisk,
    suffixes: &[RiskSuffix],
) -> bool {
    let futures = suffixes.iter().map(|&suffix| {
        place_one(gateway, symbol, side, avg_price, price_precision, qty, risk, suffix)
    });
    join_all(futures).await.into_iter().all(|ok| ok)
}

async fn place_one(
    gateway: &dyn ExchangeGateway,
    symbol: &str,
    side: Side,
    avg_price: f64,
    price_precision: i32,
    qty: f64,
    risk: &SymbolRisk,
    suffix: RiskSuffix,
) -> bool {
    let pct = match suffix {
        RiskSuffix::Tp => risk.tp,
        RiskSuffix::Sl => risk.sl,
    };
    let Some(pct) = pct else {
        return true;
    };

    let sign = side.sign();
    let shift = match suffix {
        RiskSuffix::Tp => pct,
        RiskSuffix::Sl => -pct.abs(),
    };
    let target = round_to_precision(avg_price * (1.0 + sign * shift / 100.0), price_precision);

    let exchange_side = match side {
        Side::Long => OrderSide::Sell,
        Side::Short => OrderSide::Buy,
    };

    let order_type = match suffix {
        RiskSuffix::Tp => match risk.tp_order_type {
            TpOrderType::Market => RiskOrderType::TakeProfitMarket,
            TpOrderType::Limit => RiskOrderType::ReduceOnlyLimit,
        },
        RiskSuffix::Sl => RiskOrderType::StopMarket,
    };

    let suffix_str = match suffix {
        RiskSuffix::Tp => "tp",
        RiskSuffix::Sl => "sl",
    };

    match gateway
        .place_risk_order(symbol, exchange_side, side, qty, target, suffix_str, order_type)
        .await
    {
        Ok(receipt) => {
            info!(symbol, %side, suffix = suffix_str, target, order_id = %receipt.order_id, "risk order placed");
            true
        }
        Err(err) => {
            warn!(symbol, %side, suffix = suffix_str, target, error = %err, "risk order placement failed");
            false
        }
    }
}

/// Cancels every open risk order for (symbol, side). Returns `true` iff the
/// gateway confirmed every targeted order removed (§4.8).
pub async fn cancel_all(gateway: &dyn ExchangeGateway, symbol: &str, side: Side) -> bool {
    match gateway.cancel_orders_by_symbol_side(symbol, side).await {
        Ok(ok) => ok,
        Err(err) => {
            warn!(symbol, %side, error = %err, "risk order cancellation failed");
            false
        }
    }
}
