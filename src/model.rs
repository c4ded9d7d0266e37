// model.rs — shared data model for the copy-trading engine.
//
// Every size, price, balance, and ratio is a `Decimal`. Binary floats only
// appear at the display/logging boundary; nothing here round-trips through
// `f64` on its way to a signed action.
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn is_buy(self) -> bool {
        matches!(self, Side::Buy)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerCondition {
    Ge,
    Le,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TpSl {
    TakeProfit,
    StopLoss,
}

impl TpSl {
    /// (side, triggerCondition) -> TP or SL, per the truth table in the Sizer's trigger rule.
    pub fn from_side_and_condition(side: Side, condition: TriggerCondition) -> TpSl {
        match (side, condition) {
            (Side::Sell, TriggerCondition::Ge) => TpSl::TakeProfit,
            (Side::Buy, TriggerCondition::Ge) => TpSl::StopLoss,
            (Side::Sell, TriggerCondition::Le) => TpSl::StopLoss,
            (Side::Buy, TriggerCondition::Le) => TpSl::TakeProfit,
        }
    }

    pub fn wire_tag(self) -> &'static str {
        match self {
            TpSl::TakeProfit => "tp",
            TpSl::StopLoss => "sl",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetMeta {
    pub symbol: String,
    pub index: u32,
    pub size_decimals: u32,
    pub max_leverage: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    /// Signed size: positive is long, negative is short. Never zero while present.
    pub signed_size: Decimal,
    pub entry_price: Decimal,
    pub leverage: u32,
}

impl Position {
    pub fn side(&self) -> Side {
        if self.signed_size.is_sign_positive() {
            Side::Buy
        } else {
            Side::Sell
        }
    }

    pub fn size(&self) -> Decimal {
        self.signed_size.abs()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Limit,
    Trigger(TpSl),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: u64,
    pub symbol: String,
    pub side: Side,
    pub kind: OrderKind,
    pub size: Decimal,
    pub limit_price: Option<Decimal>,
    pub trigger_price: Option<Decimal>,
    pub trigger_condition: Option<TriggerCondition>,
    pub reduce_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FillDirection {
    OpenLong,
    OpenShort,
    CloseLong,
    CloseShort,
}

impl FillDirection {
    pub fn is_open(self) -> bool {
        matches!(self, FillDirection::OpenLong | FillDirection::OpenShort)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: u64,
    pub symbol: String,
    pub signed_size: Decimal,
    pub price: Decimal,
    pub direction: FillDirection,
    pub crossed: bool,
    pub start_position: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub balance: Decimal,
    pub equity: Decimal,
    pub positions: HashMap<String, Position>,
    pub orders: HashMap<u64, Order>,
    pub ts_ms: u64,
}

impl AccountSnapshot {
    pub fn empty(ts_ms: u64) -> Self {
        Self {
            balance: Decimal::ZERO,
            equity: Decimal::ZERO,
            positions: HashMap::new(),
            orders: HashMap::new(),
            ts_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SizingRatio {
    pub ratio: Decimal,
    pub captured_at_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IntendedActionKind {
    MarketOpen,
    MarketClose,
    LimitPlace,
    TriggerPlace { tpsl: TpSl, trigger_price: Decimal },
    Cancel { order_id: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntendedAction {
    pub symbol: String,
    pub kind: IntendedActionKind,
    pub side: Side,
    pub size: Decimal,
    pub limit_price: Option<Decimal>,
    pub leverage: Option<u32>,
    pub reduce_only: bool,
}

/// Canonical events the Differ emits; everything downstream of the stream
/// boundary is strongly typed — no more duck-typed JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CopyEvent {
    PositionOpened { symbol: String, side: Side, size: Decimal, entry_price: Decimal, leverage: u32 },
    PositionIncreased { symbol: String, side: Side, delta: Decimal, new_size: Decimal, entry_price: Decimal, leverage: u32 },
    PositionReduced { symbol: String, side: Side, delta: Decimal, prior_size: Decimal, new_size: Decimal, price: Decimal },
    PositionClosed { symbol: String, side: Side, prior_size: Decimal, price: Decimal },
    OrderPlaced { order: Order },
    OrderFilled { fill: Fill },
    OrderCanceled { order_id: u64, symbol: String },
}

impl CopyEvent {
    pub fn symbol(&self) -> &str {
        match self {
            CopyEvent::PositionOpened { symbol, .. }
            | CopyEvent::PositionIncreased { symbol, .. }
            | CopyEvent::PositionReduced { symbol, .. }
            | CopyEvent::PositionClosed { symbol, .. }
            | CopyEvent::OrderCanceled { symbol, .. } => symbol,
            CopyEvent::OrderPlaced { order } => &order.symbol,
            CopyEvent::OrderFilled { fill } => &fill.symbol,
        }
    }
}

/// Reason a candidate action was skipped instead of dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipReason(pub String);

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SizerOutcome {
    Act(IntendedAction),
    Skip(SkipReason),
}
