// sizer.rs — turns a `CopyEvent` into an `IntendedAction` (or a `SkipReason`).
// Pure function: no I/O, no mutable state, nothing here ever touches the
// network or the account cache. Grounded on the distilled engine's
// `PositionSizer.calculate_size` / `calculate_leverage` / `should_copy_position`.
use rust_decimal::Decimal;

use crate::config::{Config, LeverageMode, SizingMode};
use crate::model::{AssetMeta, CopyEvent, FillDirection, IntendedAction, IntendedActionKind, Position, Side, SizerOutcome, SkipReason, TpSl};

/// Everything the Sizer needs about the follower account and the target's
/// prior state to turn one event into one action. Borrowed, not owned — the
/// caller assembles this fresh from its own caches for every event.
pub struct SizingContext<'a> {
    pub config: &'a Config,
    pub asset_meta: &'a AssetMeta,
    pub target_balance: Decimal,
    pub follower_balance: Decimal,
    pub follower_equity: Decimal,
    /// wallet_ratio = follower_balance / target_balance, captured once per
    /// snapshot refresh and reused for every event between refreshes so a
    /// burst of target activity sizes consistently against the same ratio.
    pub ratio: Decimal,
    pub mid_price: Decimal,
    pub follower_position: Option<&'a Position>,
    /// Target's position size *before* a close/reduce event, used to derive
    /// `closeRatio` for trigger orders (the event itself only carries the
    /// trigger order's own size, not the target's outstanding position).
    pub target_position_size: Option<Decimal>,
    pub follower_total_exposure_usd: Decimal,
    pub follower_open_trades: u32,
    pub follower_open_orders: u32,
    pub paused: bool,
    /// `Fill` carries no leverage field; supplied separately from the last
    /// known target position leverage when sizing an opening fill.
    pub target_leverage: Option<u32>,
    /// Resolved by the caller from its target-order-id -> follower-order-id
    /// map; `None` means the target order was never mirrored (e.g. it was
    /// placed before this engine started, or on a blocked asset).
    pub mirrored_order_id: Option<u64>,
}

fn skip(reason: impl Into<String>) -> SizerOutcome {
    SizerOutcome::Skip(SkipReason(reason.into()))
}

fn clamp_leverage(config: &Config, target_leverage: u32, asset_max: u32) -> u32 {
    let ceiling = asset_max.min(config.leverage.max_leverage);
    match config.leverage.mode {
        LeverageMode::MatchTarget => target_leverage.clamp(config.leverage.min_leverage, ceiling),
        LeverageMode::AdjustmentRatio => {
            let scaled = Decimal::from(target_leverage) * config.leverage.legacy_adjustment_ratio;
            let rounded: u32 = scaled.round().try_into().unwrap_or(config.leverage.min_leverage);
            rounded.clamp(config.leverage.min_leverage, ceiling)
        }
    }
}

/// Entry-quality gate: reject an open whose current market price has drifted
/// too far from where the target actually entered.
fn entry_quality_ok(config: &Config, target_entry_price: Decimal, current_price: Decimal) -> bool {
    if target_entry_price.is_zero() {
        return true;
    }
    let deviation_pct = ((current_price - target_entry_price) / target_entry_price).abs() * Decimal::from(100);
    deviation_pct <= config.copy_rules.min_entry_quality_pct
}

/// With `auto_adjust_size` off, the follower takes the target's raw size
/// unscaled (per the distilled engine's bypass of its wallet-ratio math);
/// the position-size cap still applies as a hard safety ceiling either way.
fn open_size_usd(config: &Config, ctx: &SizingContext, target_delta: Decimal, entry_price: Decimal) -> Decimal {
    let notional = if !config.copy_rules.auto_adjust_size {
        target_delta * entry_price
    } else {
        match config.sizing.mode {
            SizingMode::Fixed => config.sizing.fixed_size_usd,
            SizingMode::Proportional => target_delta * entry_price * ctx.ratio,
        }
    };
    notional.min(config.sizing.max_position_size_usd)
}

/// Caps applied after the primary sizing decision — any one breach is a Skip.
fn check_caps(config: &Config, ctx: &SizingContext, added_notional_usd: Decimal) -> Option<SizerOutcome> {
    if ctx.paused {
        return Some(skip("paused: account equity cap reached"));
    }
    if let Some(max_equity) = config.copy_rules.max_account_equity {
        if ctx.follower_equity >= max_equity {
            return Some(skip("paused: account equity cap reached"));
        }
    }
    if let Some(max_trades) = config.copy_rules.max_open_trades {
        if ctx.follower_open_trades >= max_trades {
            return Some(skip("max open trades reached"));
        }
    }
    if let Some(max_concurrent) = config.risk.max_concurrent_positions {
        if ctx.follower_open_trades >= max_concurrent {
            return Some(skip("max concurrent positions reached"));
        }
    }
    if let Some(max_orders) = config.copy_rules.max_open_orders {
        if ctx.follower_open_orders >= max_orders {
            return Some(skip("max open orders reached"));
        }
    }
    if ctx.follower_total_exposure_usd + added_notional_usd > config.sizing.max_total_exposure_usd {
        return Some(skip("max total exposure exceeded"));
    }
    None
}

/// Maps one canonical event to a sizing decision. Opens/increases scale the
/// target's delta by the wallet ratio; closes/reductions NEVER scale the
/// target's own close size — they derive a `closeRatio` from the target's
/// before/after sizes and apply it to the follower's *own* current position,
/// so a follower that only partially mirrored the original open never
/// over-closes relative to what it actually holds.
pub fn size(event: &CopyEvent, ctx: &SizingContext) -> SizerOutcome {
    match event {
        CopyEvent::PositionOpened { symbol, side, size, entry_price, leverage } => {
            size_open(&ctx.config, ctx, symbol, *side, *size, *entry_price, *leverage)
        }
        CopyEvent::PositionIncreased { symbol, side, delta, entry_price, leverage, .. } => {
            size_open(&ctx.config, ctx, symbol, *side, *delta, *entry_price, *leverage)
        }
        CopyEvent::PositionReduced { symbol, side, delta, prior_size, price, .. } => {
            size_close(ctx, symbol, *side, *delta, *prior_size, *price, false)
        }
        CopyEvent::PositionClosed { symbol, side, prior_size, price } => {
            size_close(ctx, symbol, *side, *prior_size, *prior_size, *price, true)
        }
        CopyEvent::OrderFilled { fill } => {
            if fill.direction.is_open() {
                size_open_fill(ctx, fill)
            } else {
                size_close_fill(ctx, fill)
            }
        }
        CopyEvent::OrderPlaced { order } => size_order_placed(ctx, order),
        CopyEvent::OrderCanceled { .. } => match ctx.mirrored_order_id {
            Some(order_id) => SizerOutcome::Act(IntendedAction {
                symbol: event.symbol().to_string(),
                kind: IntendedActionKind::Cancel { order_id },
                side: Side::Buy,
                size: Decimal::ZERO,
                limit_price: None,
                leverage: None,
                reduce_only: false,
            }),
            None => skip("no mirrored order to cancel"),
        },
    }
}

fn size_open(
    config: &Config,
    ctx: &SizingContext,
    symbol: &str,
    side: Side,
    target_delta: Decimal,
    entry_price: Decimal,
    target_leverage: u32,
) -> SizerOutcome {
    if !entry_quality_ok(config, entry_price, ctx.mid_price) {
        return skip("entry price deviates too far from target's entry");
    }
    let notional = open_size_usd(config, ctx, target_delta, entry_price);
    if notional < config.copy_rules.min_position_notional_usd {
        return skip("below minimum position notional");
    }
    if let Some(blocked) = check_caps(config, ctx, notional) {
        return blocked;
    }
    let size = notional / entry_price.max(Decimal::new(1, 8));
    let leverage = clamp_leverage(config, target_leverage, ctx.asset_meta.max_leverage);
    let kind = if config.copy_rules.use_limit_orders { IntendedActionKind::LimitPlace } else { IntendedActionKind::MarketOpen };
    SizerOutcome::Act(IntendedAction {
        symbol: symbol.to_string(),
        kind,
        side,
        size,
        limit_price: if config.copy_rules.use_limit_orders { Some(entry_price) } else { None },
        leverage: Some(leverage),
        reduce_only: false,
    })
}

fn size_close(
    ctx: &SizingContext,
    symbol: &str,
    side: Side,
    target_delta: Decimal,
    target_prior_size: Decimal,
    price: Decimal,
    full_close: bool,
) -> SizerOutcome {
    let follower_position = match ctx.follower_position {
        Some(p) => p,
        None => return skip("no follower position to close"),
    };
    let close_ratio = if full_close || target_prior_size.is_zero() {
        Decimal::ONE
    } else {
        (target_delta / target_prior_size).min(Decimal::ONE)
    };
    let size = follower_position.size() * close_ratio;
    if size.is_zero() {
        return skip("computed close size is zero");
    }
    let kind = if ctx.config.copy_rules.use_limit_orders { IntendedActionKind::LimitPlace } else { IntendedActionKind::MarketClose };
    SizerOutcome::Act(IntendedAction {
        symbol: symbol.to_string(),
        kind,
        side: side.opposite(),
        size,
        limit_price: if ctx.config.copy_rules.use_limit_orders { Some(price) } else { None },
        leverage: None,
        reduce_only: true,
    })
}

fn size_open_fill(ctx: &SizingContext, fill: &crate::model::Fill) -> SizerOutcome {
    let side = if matches!(fill.direction, FillDirection::OpenLong) { Side::Buy } else { Side::Sell };
    let leverage = ctx.target_leverage.unwrap_or(ctx.config.leverage.min_leverage);
    size_open(ctx.config, ctx, &fill.symbol, side, fill.signed_size.abs(), fill.price, leverage)
}

fn size_close_fill(ctx: &SizingContext, fill: &crate::model::Fill) -> SizerOutcome {
    let side = if matches!(fill.direction, FillDirection::CloseLong) { Side::Buy } else { Side::Sell };
    let target_prior = ctx.target_position_size.unwrap_or(fill.start_position.abs());
    size_close(ctx, &fill.symbol, side, fill.signed_size.abs(), target_prior, fill.price, false)
}

/// A resting order on the target's book: plain limit orders size like an
/// open; trigger (TP/SL) orders derive their close ratio from the target's
/// order size against its *current* position, never its own size in isolation.
fn size_order_placed(ctx: &SizingContext, order: &crate::model::Order) -> SizerOutcome {
    match order.kind {
        crate::model::OrderKind::Limit => {
            let entry_price = order.limit_price.unwrap_or(ctx.mid_price);
            let leverage = ctx.target_leverage.unwrap_or(ctx.config.leverage.min_leverage);
            size_open(ctx.config, ctx, &order.symbol, order.side, order.size, entry_price, leverage)
        }
        crate::model::OrderKind::Trigger(tpsl) => size_trigger(ctx, order, tpsl),
    }
}

fn size_trigger(ctx: &SizingContext, order: &crate::model::Order, tpsl: TpSl) -> SizerOutcome {
    let follower_position = match ctx.follower_position {
        Some(p) => p,
        None => return skip("no follower position to attach trigger to"),
    };
    let target_position_size = match ctx.target_position_size {
        Some(s) if !s.is_zero() => s,
        _ => return skip("target has no open position to size trigger against"),
    };
    let close_ratio = (order.size / target_position_size).min(Decimal::ONE);
    let size = follower_position.size() * close_ratio;
    if size.is_zero() {
        return skip("computed trigger size is zero");
    }
    let trigger_price = order.trigger_price.unwrap_or(ctx.mid_price);
    let limit_price = if ctx.config.copy_rules.trigger_is_market {
        let slippage = ctx.config.copy_rules.max_slippage_pct / Decimal::from(100);
        match order.side.opposite() {
            Side::Buy => trigger_price * (Decimal::ONE + slippage),
            Side::Sell => trigger_price * (Decimal::ONE - slippage),
        }
    } else {
        order.limit_price.unwrap_or(trigger_price)
    };
    SizerOutcome::Act(IntendedAction {
        symbol: order.symbol.clone(),
        kind: IntendedActionKind::TriggerPlace { tpsl, trigger_price },
        side: order.side,
        size,
        limit_price: Some(limit_price),
        leverage: None,
        reduce_only: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CopyRulesConfig, HyperliquidConfig, LeverageConfig, RiskManagementConfig, SizingConfig};
    use rust_decimal_macros::dec;

    fn base_config() -> Config {
        Config {
            hyperliquid: HyperliquidConfig {
                target_address: "0xabc".into(),
                follower_address: "0xdef".into(),
                follower_private_key: String::new(),
                simulated_trading: true,
                simulated_balance: dec!(1000),
            },
            sizing: SizingConfig {
                mode: SizingMode::Proportional,
                fixed_size_usd: dec!(100),
                max_position_size_usd: dec!(10000),
                max_total_exposure_usd: dec!(50000),
            },
            leverage: LeverageConfig {
                mode: LeverageMode::MatchTarget,
                legacy_adjustment_ratio: dec!(0.5),
                min_leverage: 1,
                max_leverage: 20,
            },
            copy_rules: CopyRulesConfig {
                copy_existing_positions: true,
                copy_existing_orders: true,
                auto_adjust_size: true,
                use_limit_orders: false,
                trigger_is_market: false,
                max_open_trades: None,
                max_open_orders: None,
                max_account_equity: None,
                min_entry_quality_pct: dec!(5),
                max_slippage_pct: dec!(5),
                min_position_notional_usd: dec!(10),
                blocked_assets: vec![],
            },
            risk: RiskManagementConfig { max_concurrent_positions: None },
            redis_url: "redis://localhost".into(),
        }
    }

    fn asset_meta() -> AssetMeta {
        AssetMeta { symbol: "BTC".into(), index: 0, size_decimals: 4, max_leverage: 20 }
    }

    fn ctx<'a>(config: &'a Config, meta: &'a AssetMeta, follower_position: Option<&'a Position>) -> SizingContext<'a> {
        SizingContext {
            config,
            asset_meta: meta,
            target_balance: dec!(10000),
            follower_balance: dec!(1000),
            follower_equity: dec!(1000),
            ratio: dec!(0.1),
            mid_price: dec!(60000),
            follower_position,
            target_position_size: None,
            follower_total_exposure_usd: Decimal::ZERO,
            follower_open_trades: 0,
            follower_open_orders: 0,
            paused: false,
            target_leverage: Some(10),
            mirrored_order_id: None,
        }
    }

    #[test]
    fn s1_open_long_scales_by_wallet_ratio() {
        let config = base_config();
        let meta = asset_meta();
        let c = ctx(&config, &meta, None);
        let event = CopyEvent::PositionOpened { symbol: "BTC".into(), side: Side::Buy, size: dec!(1.0), entry_price: dec!(60000), leverage: 10 };
        match size(&event, &c) {
            SizerOutcome::Act(action) => {
                assert_eq!(action.side, Side::Buy);
                assert_eq!(action.size, dec!(0.1));
                assert_eq!(action.leverage, Some(10));
                assert!(matches!(action.kind, IntendedActionKind::MarketOpen));
            }
            SizerOutcome::Skip(r) => panic!("expected Act, got skip: {r}"),
        }
    }

    #[test]
    fn s2_partial_close_scales_followers_own_position_not_targets() {
        let config = base_config();
        let meta = asset_meta();
        let follower_pos = Position { symbol: "BTC".into(), signed_size: dec!(0.1), entry_price: dec!(60000), leverage: 10 };
        let c = ctx(&config, &meta, Some(&follower_pos));
        // Target had 1.0, reduced by 0.4 -> closeRatio = 0.4
        let event = CopyEvent::PositionReduced { symbol: "BTC".into(), side: Side::Buy, delta: dec!(0.4), prior_size: dec!(1.0), new_size: dec!(0.6), price: dec!(61000) };
        match size(&event, &c) {
            SizerOutcome::Act(action) => {
                assert_eq!(action.size, dec!(0.04));
                assert!(action.reduce_only);
                assert_eq!(action.side, Side::Sell);
            }
            SizerOutcome::Skip(r) => panic!("expected Act, got skip: {r}"),
        }
    }

    #[test]
    fn s3_trigger_order_sizes_off_followers_current_position() {
        let config = base_config();
        let meta = asset_meta();
        let follower_pos = Position { symbol: "BTC".into(), signed_size: dec!(0.1), entry_price: dec!(60000), leverage: 10 };
        let mut c = ctx(&config, &meta, Some(&follower_pos));
        c.target_position_size = Some(dec!(1.0));
        let order = crate::model::Order {
            order_id: 42,
            symbol: "BTC".into(),
            side: Side::Sell,
            kind: crate::model::OrderKind::Trigger(TpSl::TakeProfit),
            size: dec!(0.5),
            limit_price: Some(dec!(65000)),
            trigger_price: Some(dec!(64000)),
            trigger_condition: Some(crate::model::TriggerCondition::Ge),
            reduce_only: true,
        };
        let event = CopyEvent::OrderPlaced { order };
        match size(&event, &c) {
            SizerOutcome::Act(action) => {
                assert_eq!(action.size, dec!(0.05));
                assert!(matches!(action.kind, IntendedActionKind::TriggerPlace { tpsl: TpSl::TakeProfit, .. }));
            }
            SizerOutcome::Skip(r) => panic!("expected Act, got skip: {r}"),
        }
    }

    #[test]
    fn s6_equity_cap_pauses_new_opens() {
        let mut config = base_config();
        config.copy_rules.max_account_equity = Some(dec!(900));
        let meta = asset_meta();
        let mut c = ctx(&config, &meta, None);
        c.follower_equity = dec!(950);
        let event = CopyEvent::PositionOpened { symbol: "BTC".into(), side: Side::Buy, size: dec!(1.0), entry_price: dec!(60000), leverage: 10 };
        match size(&event, &c) {
            SizerOutcome::Skip(reason) => assert!(reason.0.contains("paused")),
            SizerOutcome::Act(_) => panic!("expected Skip due to equity cap"),
        }
    }

    #[test]
    fn leverage_clamped_to_asset_max() {
        let config = base_config();
        let mut meta = asset_meta();
        meta.max_leverage = 5;
        let c = ctx(&config, &meta, None);
        let event = CopyEvent::PositionOpened { symbol: "BTC".into(), side: Side::Buy, size: dec!(1.0), entry_price: dec!(60000), leverage: 15 };
        match size(&event, &c) {
            SizerOutcome::Act(action) => assert_eq!(action.leverage, Some(5)),
            SizerOutcome::Skip(r) => panic!("expected Act, got skip: {r}"),
        }
    }

    #[test]
    fn below_minimum_notional_is_skipped() {
        let config = base_config();
        let meta = asset_meta();
        let mut c = ctx(&config, &meta, None);
        c.ratio = dec!(0.0001);
        let event = CopyEvent::PositionOpened { symbol: "BTC".into(), side: Side::Buy, size: dec!(0.01), entry_price: dec!(60000), leverage: 10 };
        match size(&event, &c) {
            SizerOutcome::Skip(reason) => assert!(reason.0.contains("minimum")),
            SizerOutcome::Act(a) => panic!("expected Skip, got Act with size {}", a.size),
        }
    }

    #[test]
    fn close_without_follower_position_is_skipped() {
        let config = base_config();
        let meta = asset_meta();
        let c = ctx(&config, &meta, None);
        let event = CopyEvent::PositionClosed { symbol: "BTC".into(), side: Side::Buy, prior_size: dec!(1.0), price: dec!(60000) };
        match size(&event, &c) {
            SizerOutcome::Skip(reason) => assert!(reason.0.contains("no follower position")),
            SizerOutcome::Act(_) => panic!("expected Skip"),
        }
    }

    #[test]
    fn auto_adjust_size_off_passes_target_size_through_unscaled() {
        let mut config = base_config();
        config.copy_rules.auto_adjust_size = false;
        let meta = asset_meta();
        let c = ctx(&config, &meta, None);
        // ratio is 0.1, but with auto-adjust off it must not be applied.
        let event = CopyEvent::PositionOpened { symbol: "BTC".into(), side: Side::Buy, size: dec!(1.0), entry_price: dec!(60000), leverage: 10 };
        match size(&event, &c) {
            SizerOutcome::Act(action) => assert_eq!(action.size, dec!(1.0)),
            SizerOutcome::Skip(r) => panic!("expected Act, got skip: {r}"),
        }
    }

    #[test]
    fn max_concurrent_positions_reached_skips_new_open() {
        let mut config = base_config();
        config.risk.max_concurrent_positions = Some(2);
        let meta = asset_meta();
        let mut c = ctx(&config, &meta, None);
        c.follower_open_trades = 2;
        let event = CopyEvent::PositionOpened { symbol: "BTC".into(), side: Side::Buy, size: dec!(1.0), entry_price: dec!(60000), leverage: 10 };
        match size(&event, &c) {
            SizerOutcome::Skip(reason) => assert!(reason.0.contains("concurrent")),
            SizerOutcome::Act(_) => panic!("expected Skip due to max_concurrent_positions"),
        }
    }

    #[test]
    fn cancel_without_mirrored_order_is_skipped() {
        let config = base_config();
        let meta = asset_meta();
        let c = ctx(&config, &meta, None);
        let event = CopyEvent::OrderCanceled { order_id: 7, symbol: "BTC".into() };
        match size(&event, &c) {
            SizerOutcome::Skip(_) => {}
            SizerOutcome::Act(_) => panic!("expected Skip"),
        }
    }
}
