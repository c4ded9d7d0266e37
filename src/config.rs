// config.rs — environment-loaded configuration, grouped the way the distilled
// source's `Settings` groups them (hyperliquid / sizing / leverage / copy rules
// / risk management), loaded through dotenvy the way main.rs already does.
use rust_decimal::Decimal;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct HyperliquidConfig {
    pub target_address: String,
    pub follower_address: String,
    pub follower_private_key: String,
    pub simulated_trading: bool,
    pub simulated_balance: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizingMode {
    Proportional,
    Fixed,
}

#[derive(Debug, Clone)]
pub struct SizingConfig {
    pub mode: SizingMode,
    pub fixed_size_usd: Decimal,
    pub max_position_size_usd: Decimal,
    pub max_total_exposure_usd: Decimal,
}

/// Two leverage formulas exist in the source this engine was modeled on: one
/// that matches the target's leverage exactly, and a legacy one that scales it
/// by a configured ratio. Only `MatchTarget` is ever selected by the Sizer;
/// `AdjustmentRatio` is retained here for an operator to opt into later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeverageMode {
    MatchTarget,
    AdjustmentRatio,
}

#[derive(Debug, Clone)]
pub struct LeverageConfig {
    pub mode: LeverageMode,
    pub legacy_adjustment_ratio: Decimal,
    pub min_leverage: u32,
    pub max_leverage: u32,
}

#[derive(Debug, Clone)]
pub struct CopyRulesConfig {
    pub copy_existing_positions: bool,
    pub copy_existing_orders: bool,
    pub auto_adjust_size: bool,
    pub use_limit_orders: bool,
    pub trigger_is_market: bool,
    pub max_open_trades: Option<u32>,
    pub max_open_orders: Option<u32>,
    pub max_account_equity: Option<Decimal>,
    pub min_entry_quality_pct: Decimal,
    pub max_slippage_pct: Decimal,
    pub min_position_notional_usd: Decimal,
    pub blocked_assets: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RiskManagementConfig {
    pub max_concurrent_positions: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub hyperliquid: HyperliquidConfig,
    pub sizing: SizingConfig,
    pub leverage: LeverageConfig,
    pub copy_rules: CopyRulesConfig,
    pub risk: RiskManagementConfig,
    pub redis_url: String,
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

fn env_decimal(key: &str, default: Decimal) -> Decimal {
    std::env::var(key)
        .ok()
        .and_then(|v| Decimal::from_str(v.trim()).ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

/// Parses an optional numeric field the way the distilled config treats an
/// empty/"none" sentinel string as `None` rather than a parse failure.
fn env_optional_u32(key: &str) -> Option<u32> {
    match std::env::var(key) {
        Ok(v) if v.trim().is_empty() || v.trim().eq_ignore_ascii_case("none") => None,
        Ok(v) => v.trim().parse::<u32>().ok(),
        Err(_) => None,
    }
}

fn env_optional_decimal(key: &str) -> Option<Decimal> {
    match std::env::var(key) {
        Ok(v) if v.trim().is_empty() || v.trim().eq_ignore_ascii_case("none") => None,
        Ok(v) => Decimal::from_str(v.trim()).ok(),
        Err(_) => None,
    }
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .map(|v| v.split(',').map(|s| s.trim().to_uppercase()).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default()
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let target_address = std::env::var("TARGET_ADDRESS")
            .map_err(|_| ConfigError::Missing("TARGET_ADDRESS"))?;
        let follower_address = std::env::var("FOLLOWER_ADDRESS")
            .map_err(|_| ConfigError::Missing("FOLLOWER_ADDRESS"))?;
        let simulated_trading = env_bool("SIMULATED_TRADING", true);
        let follower_private_key = if simulated_trading {
            env_str("FOLLOWER_PRIVATE_KEY", "")
        } else {
            std::env::var("FOLLOWER_PRIVATE_KEY")
                .map_err(|_| ConfigError::Missing("FOLLOWER_PRIVATE_KEY"))?
        };

        let mode = match env_str("SIZING_MODE", "proportional").to_lowercase().as_str() {
            "fixed" => SizingMode::Fixed,
            _ => SizingMode::Proportional,
        };

        let leverage_mode = match env_str("LEVERAGE_MODE", "match_target").to_lowercase().as_str() {
            "adjustment_ratio" => LeverageMode::AdjustmentRatio,
            _ => LeverageMode::MatchTarget,
        };

        Ok(Config {
            hyperliquid: HyperliquidConfig {
                target_address,
                follower_address,
                follower_private_key,
                simulated_trading,
                simulated_balance: env_decimal("SIMULATED_BALANCE", Decimal::from(1_000)),
            },
            sizing: SizingConfig {
                mode,
                fixed_size_usd: env_decimal("FIXED_SIZE_USD", Decimal::from(100)),
                max_position_size_usd: env_decimal("MAX_POSITION_SIZE_USD", Decimal::from(10_000)),
                max_total_exposure_usd: env_decimal("MAX_TOTAL_EXPOSURE_USD", Decimal::from(50_000)),
            },
            leverage: LeverageConfig {
                mode: leverage_mode,
                legacy_adjustment_ratio: env_decimal("LEVERAGE_ADJUSTMENT_RATIO", Decimal::new(5, 1)),
                min_leverage: env_u32("MIN_LEVERAGE", 1),
                max_leverage: env_u32("MAX_LEVERAGE", 10),
            },
            copy_rules: CopyRulesConfig {
                copy_existing_positions: env_bool("COPY_EXISTING_POSITIONS", true),
                copy_existing_orders: env_bool("COPY_EXISTING_ORDERS", true),
                auto_adjust_size: env_bool("AUTO_ADJUST_SIZE", true),
                use_limit_orders: env_bool("USE_LIMIT_ORDERS", false),
                trigger_is_market: env_bool("TRIGGER_IS_MARKET", false),
                max_open_trades: env_optional_u32("MAX_OPEN_TRADES"),
                max_open_orders: env_optional_u32("MAX_OPEN_ORDERS"),
                max_account_equity: env_optional_decimal("MAX_ACCOUNT_EQUITY"),
                min_entry_quality_pct: env_decimal("MIN_ENTRY_QUALITY_PCT", Decimal::new(5, 0)),
                max_slippage_pct: env_decimal("MAX_SLIPPAGE_PCT", Decimal::new(1, 0)),
                min_position_notional_usd: env_decimal("MIN_POSITION_NOTIONAL_USD", Decimal::from(10)),
                blocked_assets: env_list("BLOCKED_ASSETS"),
            },
            risk: RiskManagementConfig {
                max_concurrent_positions: env_optional_u32("MAX_CONCURRENT_POSITIONS"),
            },
            redis_url: env_str("REDIS_URL", "redis://127.0.0.1:6379"),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),
}
