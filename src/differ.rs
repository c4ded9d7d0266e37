// differ.rs — converts raw stream frames (and full-snapshot refreshes) into the
// canonical `CopyEvent` stream the Sizer consumes. Owns the target account's
// last-known snapshot exclusively; nothing downstream sees raw wire JSON.
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use rust_decimal::Decimal;

use crate::model::{AccountSnapshot, CopyEvent, Fill, FillDirection, Order, OrderKind, Position, Side, TpSl, TriggerCondition};

/// Wire shape for a position record as it appears in `clearinghouseState` and
/// in `userEvents` position frames — same field names in both places.
#[derive(Debug, Clone, Deserialize)]
pub struct RawPosition {
    pub coin: String,
    pub szi: String,
    #[serde(rename = "entryPx")]
    pub entry_px: String,
    pub leverage: RawLeverage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawLeverage {
    pub value: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawOrder {
    pub oid: u64,
    pub coin: String,
    pub side: String,
    pub sz: String,
    #[serde(rename = "limitPx")]
    pub limit_px: Option<String>,
    #[serde(rename = "triggerPx")]
    pub trigger_px: Option<String>,
    /// Hyperliquid triggers fire on ">= price" or "<= price"; "ge"/"le" here.
    /// TP vs SL is never read off the wire directly — it's derived from this
    /// plus side, per the (side, condition) truth table in `TpSl::from_side_and_condition`.
    #[serde(rename = "triggerCondition")]
    pub trigger_condition: Option<String>,
    #[serde(rename = "reduceOnly")]
    pub reduce_only: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawFill {
    pub oid: u64,
    pub coin: String,
    pub sz: String,
    pub px: String,
    pub side: String,
    /// "Open Long", "Open Short", "Close Long", "Close Short".
    pub dir: String,
    #[serde(rename = "startPosition")]
    pub start_position: String,
    pub crossed: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawFrame {
    #[serde(default)]
    pub fills: Vec<RawFill>,
    #[serde(default)]
    pub positions: Vec<RawPosition>,
    #[serde(default)]
    pub orders: Vec<RawOrder>,
}

fn parse_decimal(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap_or(Decimal::ZERO)
}

fn fill_direction(dir: &str) -> Option<FillDirection> {
    match dir {
        "Open Long" => Some(FillDirection::OpenLong),
        "Open Short" => Some(FillDirection::OpenShort),
        "Close Long" => Some(FillDirection::CloseLong),
        "Close Short" => Some(FillDirection::CloseShort),
        _ => None,
    }
}

fn trigger_condition_of(raw: &RawOrder) -> Option<TriggerCondition> {
    match raw.trigger_condition.as_deref() {
        Some("ge") => Some(TriggerCondition::Ge),
        Some("le") => Some(TriggerCondition::Le),
        _ => None,
    }
}

/// An order is a trigger iff it carries a `triggerCondition`; TP vs SL is then
/// derived from `(side, condition)`, never trusted off a separate wire tag.
fn order_from_raw(raw: &RawOrder) -> Order {
    let side = if raw.side == "B" { Side::Buy } else { Side::Sell };
    let trigger_condition = trigger_condition_of(raw);
    let kind = match trigger_condition {
        Some(condition) => OrderKind::Trigger(TpSl::from_side_and_condition(side, condition)),
        None => OrderKind::Limit,
    };
    Order {
        order_id: raw.oid,
        symbol: raw.coin.clone(),
        side,
        kind,
        size: parse_decimal(&raw.sz),
        limit_price: raw.limit_px.as_deref().map(parse_decimal),
        trigger_price: raw.trigger_px.as_deref().map(parse_decimal),
        trigger_condition,
        reduce_only: raw.reduce_only,
    }
}

/// A partial fill for one `orderId`, accumulating until its 500ms window
/// closes or it is superseded by the order's final state.
#[derive(Debug, Clone)]
struct PendingFill {
    symbol: String,
    direction: FillDirection,
    total_size: Decimal,
    notional: Decimal,
    start_position: Decimal,
    crossed: bool,
    first_seen_ms: u64,
}

impl PendingFill {
    fn avg_price(&self) -> Decimal {
        if self.total_size.is_zero() {
            Decimal::ZERO
        } else {
            self.notional / self.total_size
        }
    }

    fn into_fill(self, order_id: u64) -> Fill {
        let price = self.avg_price();
        Fill {
            order_id,
            symbol: self.symbol,
            signed_size: if matches!(self.direction, FillDirection::OpenShort | FillDirection::CloseShort) {
                -self.total_size
            } else {
                self.total_size
            },
            price,
            direction: self.direction,
            crossed: self.crossed,
            start_position: self.start_position,
        }
    }
}

const FILL_AGGREGATION_WINDOW_MS: u64 = 500;

pub struct Differ {
    snapshot: AccountSnapshot,
    blocklist: HashSet<String>,
    pending_fills: HashMap<u64, PendingFill>,
}

impl Differ {
    pub fn new(initial_snapshot: AccountSnapshot, blocklist: &[String]) -> Self {
        Self {
            snapshot: initial_snapshot,
            blocklist: blocklist.iter().map(|s| s.to_uppercase()).collect(),
            pending_fills: HashMap::new(),
        }
    }

    pub fn snapshot(&self) -> &AccountSnapshot {
        &self.snapshot
    }

    fn is_blocked(&self, symbol: &str) -> bool {
        self.blocklist.contains(symbol)
    }

    /// Merges one stream frame into the held snapshot, returning the
    /// canonical events it produced, blocklisted symbols already dropped.
    pub fn ingest_frame(&mut self, frame: RawFrame, now_ms: u64) -> Vec<CopyEvent> {
        let mut events = Vec::new();

        // ── Fills first (authoritative for "what just happened") ──────────
        let mut grouped: HashMap<u64, Vec<&RawFill>> = HashMap::new();
        for f in &frame.fills {
            grouped.entry(f.oid).or_default().push(f);
        }
        for (oid, fills) in &grouped {
            let direction = fills.iter().find_map(|f| fill_direction(&f.dir)).unwrap_or(FillDirection::OpenLong);
            let symbol = fills[0].coin.clone();
            let start_position = parse_decimal(&fills[0].start_position);
            let crossed = fills.iter().any(|f| f.crossed);
            let entry = self.pending_fills.entry(*oid).or_insert_with(|| PendingFill {
                symbol: symbol.clone(),
                direction,
                total_size: Decimal::ZERO,
                notional: Decimal::ZERO,
                start_position,
                crossed: false,
                first_seen_ms: now_ms,
            });
            for f in fills {
                let sz = parse_decimal(&f.sz);
                let px = parse_decimal(&f.px);
                entry.total_size += sz;
                entry.notional += sz * px;
            }
            entry.crossed |= crossed;
        }

        let mut flushed_ids = HashSet::new();
        let due: Vec<u64> = self
            .pending_fills
            .iter()
            .filter(|(_, p)| now_ms.saturating_sub(p.first_seen_ms) >= FILL_AGGREGATION_WINDOW_MS)
            .map(|(oid, _)| *oid)
            .collect();
        for oid in due {
            if let Some(pending) = self.pending_fills.remove(&oid) {
                flushed_ids.insert(oid);
                if !self.is_blocked(&pending.symbol) {
                    events.push(CopyEvent::OrderFilled { fill: pending.into_fill(oid) });
                }
            }
        }
        // An order id with activity this round (flushed or still pending) must
        // never also surface as an OrderCanceled below.
        let fill_activity: HashSet<u64> = flushed_ids.iter().copied().chain(self.pending_fills.keys().copied()).collect();

        // ── Positions ───────────────────────────────────────────────────────
        for raw in &frame.positions {
            let blocked = self.is_blocked(&raw.coin.to_uppercase());
            for ev in self.diff_one_position(raw) {
                if !blocked {
                    events.push(ev);
                }
            }
        }

        // ── Orders: placements before cancellations ─────────────────────────
        let incoming_ids: HashSet<u64> = frame.orders.iter().map(|o| o.oid).collect();
        for raw in &frame.orders {
            if !self.snapshot.orders.contains_key(&raw.oid) {
                let order = order_from_raw(raw);
                self.snapshot.orders.insert(raw.oid, order.clone());
                if !self.is_blocked(&raw.coin.to_uppercase()) {
                    events.push(CopyEvent::OrderPlaced { order });
                }
            } else {
                // still resting; refresh in case size/limit changed
                self.snapshot.orders.insert(raw.oid, order_from_raw(raw));
            }
        }
        let disappeared: Vec<(u64, String)> = self
            .snapshot
            .orders
            .iter()
            .filter(|(oid, _)| !incoming_ids.contains(oid))
            .map(|(oid, o)| (*oid, o.symbol.clone()))
            .collect();
        for (oid, symbol) in disappeared {
            self.snapshot.orders.remove(&oid);
            if fill_activity.contains(&oid) {
                continue;
            }
            if !self.is_blocked(&symbol.to_uppercase()) {
                events.push(CopyEvent::OrderCanceled { order_id: oid, symbol });
            }
        }

        events
    }

    /// Sweeps pending fill aggregates whose 500ms window has closed without a
    /// fresh frame arriving to trigger the check. Called on a periodic tick.
    pub fn flush_due_fills(&mut self, now_ms: u64) -> Vec<CopyEvent> {
        let due: Vec<u64> = self
            .pending_fills
            .iter()
            .filter(|(_, p)| now_ms.saturating_sub(p.first_seen_ms) >= FILL_AGGREGATION_WINDOW_MS)
            .map(|(oid, _)| *oid)
            .collect();
        let mut events = Vec::new();
        for oid in due {
            if let Some(pending) = self.pending_fills.remove(&oid) {
                if !self.is_blocked(&pending.symbol) {
                    events.push(CopyEvent::OrderFilled { fill: pending.into_fill(oid) });
                }
            }
        }
        events
    }

    /// Diffs one incoming position record against the held snapshot. Returns
    /// zero, one, or two events — a sign flip (long<->short) always yields
    /// exactly two: `PositionClosed` for the prior side followed by
    /// `PositionOpened` for the new one, per the "flip is modeled as Closed
    /// then Opened" rule.
    fn diff_one_position(&mut self, raw: &RawPosition) -> Vec<CopyEvent> {
        let symbol = raw.coin.clone();
        let szi = parse_decimal(&raw.szi);
        let entry_price = parse_decimal(&raw.entry_px);
        let leverage = raw.leverage.value;
        let prior = self.snapshot.positions.get(&symbol).cloned();
        let new_side = if szi.is_sign_positive() { Side::Buy } else { Side::Sell };

        let mut events = Vec::new();
        match prior {
            None if !szi.is_zero() => {
                events.push(CopyEvent::PositionOpened { symbol: symbol.clone(), side: new_side, size: szi.abs(), entry_price, leverage });
            }
            None => {}
            Some(p) if szi.is_zero() => {
                events.push(CopyEvent::PositionClosed { symbol: symbol.clone(), side: p.side(), prior_size: p.size(), price: entry_price });
            }
            Some(p) if p.side() != new_side => {
                events.push(CopyEvent::PositionClosed { symbol: symbol.clone(), side: p.side(), prior_size: p.size(), price: entry_price });
                events.push(CopyEvent::PositionOpened { symbol: symbol.clone(), side: new_side, size: szi.abs(), entry_price, leverage });
            }
            Some(p) => {
                let prior_abs = p.size();
                if szi.abs() > prior_abs {
                    events.push(CopyEvent::PositionIncreased {
                        symbol: symbol.clone(),
                        side: p.side(),
                        delta: szi.abs() - prior_abs,
                        new_size: szi.abs(),
                        entry_price,
                        leverage,
                    });
                } else if szi.abs() < prior_abs {
                    events.push(CopyEvent::PositionReduced {
                        symbol: symbol.clone(),
                        side: p.side(),
                        delta: prior_abs - szi.abs(),
                        prior_size: prior_abs,
                        new_size: szi.abs(),
                        price: entry_price,
                    });
                }
            }
        };

        if szi.is_zero() {
            self.snapshot.positions.remove(&symbol);
        } else {
            self.snapshot.positions.insert(symbol.clone(), Position { symbol, signed_size: szi, entry_price, leverage });
        }
        events
    }

    /// Diffs a freshly fetched snapshot against the held one and adopts it.
    /// Used both for the startup bootstrap pass (diffed against an empty
    /// snapshot, surfacing every existing position/order) and for the
    /// post-reconnect resync (diffed against whatever was last known, so an
    /// unchanged account produces zero events — the idempotence the stall/
    /// reconnect path relies on to avoid duplicate opens).
    pub fn diff_snapshot(&mut self, new_snapshot: AccountSnapshot) -> Vec<CopyEvent> {
        let mut events = Vec::new();

        for (symbol, pos) in &new_snapshot.positions {
            let prior = self.snapshot.positions.get(symbol).cloned();
            let mut evs = Vec::new();
            match prior {
                None => evs.push(CopyEvent::PositionOpened {
                    symbol: symbol.clone(),
                    side: pos.side(),
                    size: pos.size(),
                    entry_price: pos.entry_price,
                    leverage: pos.leverage,
                }),
                Some(p) if p.side() != pos.side() => {
                    // Sign flip: Closed for the prior side, then Opened for the new one.
                    evs.push(CopyEvent::PositionClosed {
                        symbol: symbol.clone(),
                        side: p.side(),
                        prior_size: p.size(),
                        price: pos.entry_price,
                    });
                    evs.push(CopyEvent::PositionOpened {
                        symbol: symbol.clone(),
                        side: pos.side(),
                        size: pos.size(),
                        entry_price: pos.entry_price,
                        leverage: pos.leverage,
                    });
                }
                Some(p) if pos.size() > p.size() => evs.push(CopyEvent::PositionIncreased {
                    symbol: symbol.clone(),
                    side: p.side(),
                    delta: pos.size() - p.size(),
                    new_size: pos.size(),
                    entry_price: pos.entry_price,
                    leverage: pos.leverage,
                }),
                Some(p) if pos.size() < p.size() => evs.push(CopyEvent::PositionReduced {
                    symbol: symbol.clone(),
                    side: p.side(),
                    delta: p.size() - pos.size(),
                    prior_size: p.size(),
                    new_size: pos.size(),
                    price: pos.entry_price,
                }),
                Some(_) => {}
            };
            if !self.is_blocked(&symbol.to_uppercase()) {
                events.extend(evs);
            }
        }
        for (symbol, prior) in &self.snapshot.positions {
            if !new_snapshot.positions.contains_key(symbol) {
                if !self.is_blocked(&symbol.to_uppercase()) {
                    events.push(CopyEvent::PositionClosed {
                        symbol: symbol.clone(),
                        side: prior.side(),
                        prior_size: prior.size(),
                        price: prior.entry_price,
                    });
                }
            }
        }

        for (oid, order) in &new_snapshot.orders {
            if !self.snapshot.orders.contains_key(oid) {
                if !self.is_blocked(&order.symbol.to_uppercase()) {
                    events.push(CopyEvent::OrderPlaced { order: order.clone() });
                }
            }
        }
        for (oid, order) in &self.snapshot.orders {
            if !new_snapshot.orders.contains_key(oid) {
                if !self.is_blocked(&order.symbol.to_uppercase()) {
                    events.push(CopyEvent::OrderCanceled { order_id: *oid, symbol: order.symbol.clone() });
                }
            }
        }

        self.snapshot = new_snapshot;
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn empty_snapshot() -> AccountSnapshot {
        AccountSnapshot::empty(0)
    }

    #[test]
    fn new_position_emits_opened() {
        let mut differ = Differ::new(empty_snapshot(), &[]);
        let frame = RawFrame {
            positions: vec![RawPosition {
                coin: "BTC".into(),
                szi: "0.5".into(),
                entry_px: "60000".into(),
                leverage: RawLeverage { value: 10 },
            }],
            ..Default::default()
        };
        let events = differ.ingest_frame(frame, 1_000);
        assert_eq!(events.len(), 1);
        match &events[0] {
            CopyEvent::PositionOpened { symbol, side, size, leverage, .. } => {
                assert_eq!(symbol, "BTC");
                assert_eq!(*side, Side::Buy);
                assert_eq!(*size, dec!(0.5));
                assert_eq!(*leverage, 10);
            }
            other => panic!("expected PositionOpened, got {other:?}"),
        }
    }

    #[test]
    fn sign_flip_emits_closed_then_opened() {
        let mut differ = Differ::new(empty_snapshot(), &[]);
        differ.ingest_frame(
            RawFrame {
                positions: vec![RawPosition { coin: "BTC".into(), szi: "0.5".into(), entry_px: "60000".into(), leverage: RawLeverage { value: 10 } }],
                ..Default::default()
            },
            0,
        );
        // Target flips long -> short in one update.
        let events = differ.ingest_frame(
            RawFrame {
                positions: vec![RawPosition { coin: "BTC".into(), szi: "-0.2".into(), entry_px: "61000".into(), leverage: RawLeverage { value: 10 } }],
                ..Default::default()
            },
            1_000,
        );
        assert_eq!(events.len(), 2);
        match &events[0] {
            CopyEvent::PositionClosed { side, prior_size, .. } => {
                assert_eq!(*side, Side::Buy);
                assert_eq!(*prior_size, dec!(0.5));
            }
            other => panic!("expected PositionClosed first, got {other:?}"),
        }
        match &events[1] {
            CopyEvent::PositionOpened { side, size, .. } => {
                assert_eq!(*side, Side::Sell);
                assert_eq!(*size, dec!(0.2));
            }
            other => panic!("expected PositionOpened second, got {other:?}"),
        }
    }

    #[test]
    fn order_kind_derives_tp_from_side_and_condition_not_wire_tag() {
        let mut differ = Differ::new(empty_snapshot(), &[]);
        // SELL with condition >= is a take-profit per the truth table, even
        // though nothing on the wire names it "tp" directly.
        let events = differ.ingest_frame(
            RawFrame {
                orders: vec![RawOrder {
                    oid: 11,
                    coin: "ETH".into(),
                    side: "S".into(),
                    sz: "1.0".into(),
                    limit_px: Some("4100".into()),
                    trigger_px: Some("4000".into()),
                    trigger_condition: Some("ge".into()),
                    reduce_only: true,
                }],
                ..Default::default()
            },
            0,
        );
        match &events[0] {
            CopyEvent::OrderPlaced { order } => {
                assert!(matches!(order.kind, OrderKind::Trigger(TpSl::TakeProfit)));
            }
            other => panic!("expected OrderPlaced, got {other:?}"),
        }
    }

    #[test]
    fn reducing_a_position_emits_reduced_with_delta() {
        let mut differ = Differ::new(empty_snapshot(), &[]);
        differ.ingest_frame(
            RawFrame {
                positions: vec![RawPosition { coin: "BTC".into(), szi: "0.5".into(), entry_px: "60000".into(), leverage: RawLeverage { value: 10 } }],
                ..Default::default()
            },
            0,
        );
        let events = differ.ingest_frame(
            RawFrame {
                positions: vec![RawPosition { coin: "BTC".into(), szi: "0.3".into(), entry_px: "60000".into(), leverage: RawLeverage { value: 10 } }],
                ..Default::default()
            },
            1_000,
        );
        match &events[0] {
            CopyEvent::PositionReduced { delta, prior_size, new_size, .. } => {
                assert_eq!(*delta, dec!(0.2));
                assert_eq!(*prior_size, dec!(0.5));
                assert_eq!(*new_size, dec!(0.3));
            }
            other => panic!("expected PositionReduced, got {other:?}"),
        }
    }

    #[test]
    fn blocked_symbol_produces_no_events() {
        let mut differ = Differ::new(empty_snapshot(), &["DOGE".to_string()]);
        let frame = RawFrame {
            positions: vec![RawPosition { coin: "DOGE".into(), szi: "-1000".into(), entry_px: "0.1".into(), leverage: RawLeverage { value: 5 } }],
            ..Default::default()
        };
        let events = differ.ingest_frame(frame, 0);
        assert!(events.is_empty());
    }

    #[test]
    fn reapplying_identical_snapshot_emits_nothing() {
        let mut differ = Differ::new(empty_snapshot(), &[]);
        let mut snap = empty_snapshot();
        snap.positions.insert("ETH".into(), Position { symbol: "ETH".into(), signed_size: dec!(2.0), entry_price: dec!(4000), leverage: 5 });
        let first = differ.diff_snapshot(snap.clone());
        assert_eq!(first.len(), 1);
        let second = differ.diff_snapshot(snap);
        assert!(second.is_empty());
    }

    #[test]
    fn partial_fills_same_order_aggregate_within_frame() {
        let mut differ = Differ::new(empty_snapshot(), &[]);
        let frame = RawFrame {
            fills: vec![
                RawFill { oid: 1, coin: "BTC".into(), sz: "0.1".into(), px: "60000".into(), side: "B".into(), dir: "Open Long".into(), start_position: "0".into(), crossed: true },
                RawFill { oid: 1, coin: "BTC".into(), sz: "0.1".into(), px: "60100".into(), side: "B".into(), dir: "Open Long".into(), start_position: "0".into(), crossed: true },
            ],
            ..Default::default()
        };
        differ.ingest_frame(frame, 0);
        let flushed = differ.flush_due_fills(1_000);
        assert_eq!(flushed.len(), 1);
        match &flushed[0] {
            CopyEvent::OrderFilled { fill } => {
                assert_eq!(fill.signed_size, dec!(0.2));
                assert_eq!(fill.price, dec!(60050));
            }
            other => panic!("expected OrderFilled, got {other:?}"),
        }
    }

    #[test]
    fn order_fully_filled_does_not_also_emit_canceled() {
        let mut differ = Differ::new(empty_snapshot(), &[]);
        differ.ingest_frame(
            RawFrame {
                orders: vec![RawOrder {
                    oid: 7, coin: "ETH".into(), side: "S".into(), sz: "1.0".into(),
                    limit_px: Some("4000".into()), trigger_px: None, trigger_condition: None, reduce_only: false,
                }],
                ..Default::default()
            },
            0,
        );
        // Order disappears because it filled; a fill for the same oid arrives in the same frame.
        let events = differ.ingest_frame(
            RawFrame {
                fills: vec![RawFill { oid: 7, coin: "ETH".into(), sz: "1.0".into(), px: "4000".into(), side: "S".into(), dir: "Close Long".into(), start_position: "1.0".into(), crossed: true }],
                orders: vec![],
                ..Default::default()
            },
            100,
        );
        assert!(!events.iter().any(|e| matches!(e, CopyEvent::OrderCanceled { .. })));
    }

    #[test]
    fn order_disappearing_without_fill_emits_canceled() {
        let mut differ = Differ::new(empty_snapshot(), &[]);
        differ.ingest_frame(
            RawFrame {
                orders: vec![RawOrder {
                    oid: 9, coin: "BTC".into(), side: "B".into(), sz: "0.1".into(),
                    limit_px: Some("59000".into()), trigger_px: None, trigger_condition: None, reduce_only: false,
                }],
                ..Default::default()
            },
            0,
        );
        let events = differ.ingest_frame(RawFrame::default(), 100);
        assert!(matches!(events[0], CopyEvent::OrderCanceled { order_id: 9, .. }));
    }
}
