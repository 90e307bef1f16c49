// =============================================================================
// Risk Monitor — fallback TP/SL and averaging-grid evaluation (§4.5)
// =============================================================================
//
// Evaluated once per (user, strategy, symbol, side) per main-loop tick,
// against one cached price read, checking several independent exit conditions
// in priority order against that single snapshot.
// =============================================================================

use tracing::info;

use crate::config::SymbolRisk;
use crate::grid_math::GridStep;
use crate::intent::{Intent, IntentStatus};
use crate::notifier::{NotifyEvent, Notifier};
use crate::position_store::{PositionKey, PositionState, PositionStore};
use crate::types::UserId;

/// Outcome of one RiskMonitor evaluation for a single (user, strategy,
/// symbol, side).
#[derive(Debug, Clone, PartialEq)]
pub enum RiskVerdict {
    /// No action: not in position, already latched, or price unavailable.
    NoAction,
    /// Fallback take-profit fired.
    FallbackTp,
    /// Fallback stop-loss fired.
    FallbackSl,
    /// The next averaging step fired.
    Avg { step_index: usize, volume_pct: f64 },
}

/// Evaluates RiskMonitor for one position and returns both the verdict and,
/// when applicable, the [`Intent`] to hand to OrderPipeline. Store mutation
/// (latching `is_tp` / `is_fallback_closed`, advancing the averaging
/// counter) is the caller's responsibility via the returned verdict, kept
/// out of this function so it stays non-suspending and side-effect-free
/// over anything but its explicit inputs (§5).
pub fn evaluate(
    key: &PositionKey,
    state: &PositionState,
    price: Option<f64>,
    risk: &SymbolRisk,
    grid: &[GridStep],
) -> RiskVerdict {
    if !state.in_position || state.is_tp || state.is_fallback_closed {
        return RiskVerdict::NoAction;
    }

    let Some(price) = price else {
        return RiskVerdict::NoAction;
    };
    let Some(avg_price) = state.avg_price else {
        return RiskVerdict::NoAction;
    };
    let Some(entry_price) = state.entry_price else {
        return RiskVerdict::NoAction;
    };

    let sign = key.side.sign();
    let n_pnl_avg = sign * (price - avg_price) / avg_price * 100.0;

    if let Some(fallback_tp) = risk.fallback_tp {
        if n_pnl_avg >= fallback_tp {
            return RiskVerdict::FallbackTp;
        }
    }

    if let Some(fallback_sl) = risk.fallback_sl {
        if n_pnl_avg <= -fallback_sl {
            return RiskVerdict::FallbackSl;
        }
    }

    let n_pnl_entry = sign * (price - entry_price) / entry_price * 100.0;
    let p = state.avg_progress_counter as usize;
    if p < grid.len() {
        let step = grid[p];
        if n_pnl_entry <= -step.indent_pct.abs() {
            return RiskVerdict::Avg {
                step_index: p + 1,
                volume_pct: step.volume_pct,
            };
        }
    }

    RiskVerdict::NoAction
}

/// Applies a [`RiskVerdict`] to the store, forwards the event to `notifier`,
/// and returns the intent to dispatch, if any. This is the only place
/// RiskMonitor mutates [`PositionStore`].
pub async fn apply_verdict(
    store: &PositionStore,
    key: &PositionKey,
    user: UserId,
    verdict: &RiskVerdict,
    notifier: &dyn Notifier,
) -> Option<Intent> {
    match verdict {
        RiskVerdict::NoAction => None,
        RiskVerdict::FallbackTp => {
            store.update(key, |s| s.is_tp = true);
            info!(symbol = %key.symbol, side = %key.side, "fallback TP latched");
            notifier
                .notify(NotifyEvent::FallbackTriggered {
                    user: user.0.clone(),
                    symbol: key.symbol.clone(),
                    kind: "tp",
                })
                .await;
            Some(Intent::new(
                user,
                key.strategy.clone(),
                key.symbol.clone(),
                key.side,
                IntentStatus::IsClosing,
            ))
        }
        RiskVerdict::FallbackSl => {
            store.update(key, |s| s.is_fallback_closed = true);
            info!(symbol = %key.symbol, side = %key.side, "fallback SL latched");
            notifier
                .notify(NotifyEvent::FallbackTriggered {
                    user: user.0.clone(),
                    symbol: key.symbol.clone(),
                    kind: "sl",
                })
                .await;
            Some(Intent::new(
                user,
                key.strategy.clone(),
                key.symbol.clone(),
                key.side,
                IntentStatus::IsClosing,
            ))
        }
        RiskVerdict::Avg { step_index, volume_pct } => {
            store.update(key, |s| {
                s.avg_progress_counter = (*step_index as u32).max(s.avg_progress_counter);
                s.process_volume = *volume_pct;
            });
            info!(symbol = %key.symbol, side = %key.side, step_index, "averaging step fired");
            notifier
                .notify(NotifyEvent::Averaged {
                    user: user.0.clone(),
                    symbol: key.symbol.clone(),
                    step_index: *step_index,
                })
                .await;
            Some(Intent::new(
                user,
                key.strategy.clone(),
                key.symbol.clone(),
                key.side,
                IntentStatus::IsAvg,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TpOrderType;
    use crate::types::Side;

    fn risk(fallback_tp: Option<f64>, fallback_sl: Option<f64>) -> SymbolRisk {
        SymbolRisk {
            margin_size: 26.0,
            leverage: 10.0,
            sl: Some(20.0),
            tp: Some(0.6),
            tp_order_type: TpOrderType::Market,
            fallback_tp,
            fallback_sl,
        }
    }

    fn in_position_state(avg_price: f64, entry_price: f64, progress: u32) -> PositionState {
        let mut s = PositionState::default_with_precision(3, 2);
        s.in_position = true;
        s.avg_price = Some(avg_price);
        s.entry_price = Some(entry_price);
        s.comul_qty = 1.0;
        s.avg_progress_counter = progress;
        s
    }

    fn key() -> PositionKey {
        PositionKey::new("u1", "grid_v1", "BTCUSDT", Side::Long)
    }

    #[test]
    fn no_action_when_not_in_position() {
        let state = PositionState::default_with_precision(3, 2);
        let verdict = evaluate(&key(), &state, Some(100.0), &risk(Some(1.0), None), &[]);
        assert_eq!(verdict, RiskVerdict::NoAction);
    }

    #[test]
    fn no_action_when_already_tp_latched() {
        let mut state = in_position_state(100.0, 100.0, 1);
        state.is_tp = true;
        let verdict = evaluate(&key(), &state, Some(101.0), &risk(Some(0.5), None), &[]);
        assert_eq!(verdict, RiskVerdict::NoAction);
    }

    #[test]
    fn fallback_tp_fires_when_threshold_reached() {
        let state = in_position_state(100.0, 100.0, 1);
        let verdict = evaluate(&key(), &state, Some(101.0), &risk(Some(0.5), None), &[]);
        assert_eq!(verdict, RiskVerdict::FallbackTp);
    }

    // I9: fallback-SL symmetry with fallback TP.
    #[test]
    fn fallback_sl_fires_symmetrically_to_fallback_tp() {
        let state = in_position_state(100.0, 100.0, 1);
        let verdict = evaluate(&key(), &state, Some(97.0), &risk(None, Some(2.0)), &[]);
        assert_eq!(verdict, RiskVerdict::FallbackSl);
    }

    #[test]
    fn fallback_sl_does_not_fire_when_already_latched() {
        let mut state = in_position_state(100.0, 100.0, 1);
        state.is_fallback_closed = true;
        let verdict = evaluate(&key(), &state, Some(97.0), &risk(None, Some(2.0)), &[]);
        assert_eq!(verdict, RiskVerdict::NoAction);
    }

    #[test]
    fn averaging_step_fires_on_drawdown_from_entry() {
        let state = in_position_state(100.0, 100.0, 1);
        let grid = [
            GridStep { indent_pct: 0.0, volume_pct: 10.0 },
            GridStep { indent_pct: -8.0, volume_pct: 11.0 },
        ];
        // 8% drawdown from entry on a LONG.
        let verdict = evaluate(&key(), &state, Some(92.0), &risk(None, None), &grid);
        assert_eq!(
            verdict,
            RiskVerdict::Avg {
                step_index: 2,
                volume_pct: 11.0
            }
        );
    }

    #[tokio::test]
    async fn apply_verdict_latches_is_fallback_closed_distinctly_from_is_tp() {
        let store = PositionStore::new();
        store.ensure(&key(), 3, 2);
        let notifier = crate::notifier::RecordingNotifier::new();
        let intent = apply_verdict(&store, &key(), "u1".into(), &RiskVerdict::FallbackSl, &notifier).await;
        assert!(intent.is_some());
        let state = store.get(&key()).unwrap();
        assert!(state.is_fallback_closed);
        assert!(!state.is_tp);
    }

    #[tokio::test]
    async fn apply_verdict_forwards_fallback_and_averaging_events_to_notifier() {
        let store = PositionStore::new();
        store.ensure(&key(), 3, 2);
        let notifier = crate::notifier::RecordingNotifier::new();

        apply_verdict(&store, &key(), "u1".into(), &RiskVerdict::FallbackTp, &notifier).await;
        apply_verdict(
            &store,
            &key(),
            "u1".into(),
            &RiskVerdict::Avg { step_index: 2, volume_pct: 11.0 },
            &notifier,
        )
        .await;

        let events = notifier.events();
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            crate::notifier::NotifyEvent::FallbackTriggered {
                user: "u1".into(),
                symbol: "BTCUSDT".into(),
                kind: "tp",
            }
        );
        assert_eq!(
            events[1],
            crate::notifier::NotifyEvent::Averaged {
                user: "u1".into(),
                symbol: "BTCUSDT".into(),
                step_index: 2,
            }
        );
    }
}
