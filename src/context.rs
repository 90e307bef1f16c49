// =============================================================================
// BotContext — the explicit, passable handle bundling every shared collaborator
// (A1)
// =============================================================================
//
// Replaces module-level mutable singletons: every task and component takes
// an `Arc<BotContext>` (or borrows from one) instead of reaching for global
// state, per the "ambient globals -> an explicit context object" design note.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use tracing::info;

use crate::config::RootConfig;
use crate::event_log::EventLog;
use crate::gateway::ExchangeGateway;
use crate::notifier::Notifier;
use crate::position_store::{PositionKey, PositionStore};
use crate::price_feed::PriceFeed;
use crate::signal_engine::SignalEngine;
use crate::types::{Side, UserId};

const EVENT_LOG_CAPACITY: usize = 4096;

/// Raised by [`BotContext::build`] for any condition that must halt startup
/// before a single cooperative task is spawned (§7 "Fatal").
#[derive(Debug)]
pub struct StartupError(pub anyhow::Error);

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "startup failed: {}", self.0)
    }
}

impl std::error::Error for StartupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

impl From<anyhow::Error> for StartupError {
    fn from(e: anyhow::Error) -> Self {
        StartupError(e)
    }
}

/// Every shared collaborator a cooperative task needs, bundled behind one
/// handle (§2 A1).
pub struct BotContext {
    pub config: RootConfig,
    pub store: PositionStore,
    pub price_feed: PriceFeed,
    pub signal_engine: SignalEngine,
    pub gateways: HashMap<UserId, Arc<dyn ExchangeGateway>>,
    pub notifier: Arc<dyn Notifier>,
    pub event_log: EventLog,
}

impl BotContext {
    /// Builds a context from a validated config, a gateway per user, and a
    /// notifier, seeding `PositionStore` for every configured (strategy,
    /// symbol, side) slot from exchange metadata. Any failure here is fatal
    /// startup (§7): the caller must exit before spawning T1/T2/T3.
    pub async fn build(
        config: RootConfig,
        gateways: HashMap<UserId, Arc<dyn ExchangeGateway>>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, StartupError> {
        config.validate().context("configuration failed validation")?;

        let store = PositionStore::new();
        let mut any_symbol_tracked = false;

        for user_cfg in &config.users {
            let user = UserId(user_cfg.user_id.clone());
            let Some(gateway) = gateways.get(&user) else {
                return Err(StartupError(anyhow::anyhow!(
                    "user '{}' has no configured gateway",
                    user_cfg.user_id
                )));
            };

            for base_symbol in &user_cfg.strategies_symbols {
                let symbol = format!("{base_symbol}{}", user_cfg.core.quote_asset);
                let info = match gateway.fetch_exchange_info(&symbol).await {
                    Ok(info) => info,
                    Err(err) => {
                        // Precision fetch failure: exclude the symbol, don't halt (§7).
                        tracing::warn!(symbol, error = %err, "excluding symbol: precision fetch failed at startup");
                        continue;
                    }
                };

                for strategy_key in &user_cfg.active_strategies {
                    for side in [Side::Long, Side::Short] {
                        if (side == Side::Long && !user_cfg.core.direction.allows_long())
                            || (side == Side::Short && !user_cfg.core.direction.allows_short())
                        {
                            continue;
                        }
                        let key = PositionKey::new(user.clone(), strategy_key.clone(), symbol.clone(), side);
                        store.ensure(&key, info.qty_precision, info.price_precision);
                        any_symbol_tracked = true;
                    }
                }
            }
        }

        if !any_symbol_tracked {
            return Err(StartupError(anyhow::anyhow!(
                "no symbols survived precision validation — nothing to trade"
            )));
        }

        info!(users = config.users.len(), "bot context built");

        Ok(Self {
            config,
            store,
            price_feed: PriceFeed::new(),
            signal_engine: SignalEngine::new(),
            gateways,
            notifier,
            event_log: EventLog::new(EVENT_LOG_CAPACITY),
        })
    }

    pub fn gateway_for(&self, user: &UserId) -> Option<&Arc<dyn ExchangeGateway>> {
        self.gateways.get(user)
    }
}
