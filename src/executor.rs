// executor.rs — Mirror Executor: takes `IntendedAction`s from the Sizer and
// dispatches them against the follower's own exchange account, one serial
// queue per symbol so same-symbol actions never race each other while
// different symbols execute concurrently. Ported from the teacher's
// `MmExecutionEngine` — same cancel_all/reconcile_after_reconnect shape and
// the same `InternalInventory` dark-fill-detection pattern, stripped of
// everything OFI/grid/regime-specific that had no counterpart here.
use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::{mpsc, Mutex, Notify};

use crate::errors::GatewayError;
use crate::exchange::{ExchangeGateway, SubmitOutcome};
use crate::model::{AccountSnapshot, IntendedAction, IntendedActionKind, Position};
use crate::notify::{Notification, NotificationKind, NotificationSink};

/// The follower's own view of what it holds, updated as fills/placements are
/// interpreted and reconciled against REST state after a stream reconnect.
#[derive(Debug, Clone, Default)]
pub struct FollowerInventory {
    pub positions: HashMap<String, Decimal>,
}

impl FollowerInventory {
    pub fn apply_fill(&mut self, symbol: &str, is_buy: bool, size: Decimal) {
        let pos = self.positions.entry(symbol.to_string()).or_insert(Decimal::ZERO);
        if is_buy {
            *pos += size;
        } else {
            *pos -= size;
        }
    }

    /// Diffs internal state against a live snapshot, returns (symbol, internal, live, delta)
    /// for every symbol whose live size disagrees with what this cache expected.
    pub fn reconcile(&mut self, live: &HashMap<String, Position>) -> Vec<(String, Decimal, Decimal, Decimal)> {
        let mut diffs = Vec::new();
        for (symbol, pos) in live {
            let internal = self.positions.get(symbol).copied().unwrap_or(Decimal::ZERO);
            let delta = pos.signed_size - internal;
            if !delta.is_zero() {
                log::warn!("reconcile: {symbol} internal={internal} live={} delta={delta} (dark fill)", pos.signed_size);
                diffs.push((symbol.clone(), internal, pos.signed_size, delta));
                self.positions.insert(symbol.clone(), pos.signed_size);
            }
        }
        for (symbol, internal) in self.positions.clone() {
            if !live.contains_key(&symbol) && !internal.is_zero() {
                diffs.push((symbol.clone(), internal, Decimal::ZERO, -internal));
                self.positions.insert(symbol, Decimal::ZERO);
            }
        }
        diffs
    }
}

/// One unit of dispatch work: the action the Sizer produced, plus the
/// target's order id it was derived from (if any), so a successful placement
/// can register the target-order-id -> follower-order-id mapping the Sizer
/// needs to translate a later `OrderCanceled` for the same target order.
pub struct DispatchItem {
    pub target_order_id: Option<u64>,
    pub action: IntendedAction,
}

/// A follower balance move of at least this fraction between fills is what
/// `ratio_refresh` treats as "material" and worth recomputing the wallet
/// ratio over, rather than every fill's tiny fee-driven wobble.
const MATERIAL_BALANCE_CHANGE_PCT: Decimal = dec!(0.01);

struct Shared<G: ExchangeGateway> {
    gateway: Mutex<G>,
    follower_address: String,
    inventory: Mutex<FollowerInventory>,
    order_map: Mutex<HashMap<u64, u64>>,
    notifier: Arc<dyn NotificationSink>,
    last_balance: Mutex<Option<Decimal>>,
    /// Notified whenever a fill moves the follower's balance materially, so
    /// the ratio refresher can recompute sooner than its regular poll.
    ratio_refresh: Arc<Notify>,
}

pub struct MirrorExecutor<G: ExchangeGateway> {
    shared: Arc<Shared<G>>,
    queues: Mutex<HashMap<String, mpsc::UnboundedSender<DispatchItem>>>,
}

fn now_ms() -> u64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

impl<G: ExchangeGateway + 'static> MirrorExecutor<G> {
    pub fn new(gateway: G, follower_address: String, notifier: Arc<dyn NotificationSink>) -> Self {
        Self {
            shared: Arc::new(Shared {
                gateway: Mutex::new(gateway),
                follower_address,
                inventory: Mutex::new(FollowerInventory::default()),
                order_map: Mutex::new(HashMap::new()),
                notifier,
                last_balance: Mutex::new(None),
                ratio_refresh: Arc::new(Notify::new()),
            }),
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Looks up the follower's own order id for a target order id previously
    /// mirrored, so the Sizer can translate an `OrderCanceled` event.
    pub async fn follower_order_id_for(&self, target_order_id: u64) -> Option<u64> {
        self.shared.order_map.lock().await.get(&target_order_id).copied()
    }

    /// Resolves when a fill has moved the follower's balance materially.
    /// The ratio refresher `select!`s on this alongside its regular interval
    /// so a big fill doesn't wait out the full poll period before the
    /// wallet ratio catches up.
    pub fn ratio_refresh_signal(&self) -> Arc<Notify> {
        self.shared.ratio_refresh.clone()
    }

    /// Enqueues one action onto its symbol's serial queue, spawning the
    /// worker on first use. Returns immediately; dispatch happens in order
    /// on a background task.
    pub async fn dispatch(&self, item: DispatchItem) {
        let symbol = item.action.symbol.clone();
        let mut queues = self.queues.lock().await;
        let sender = queues.entry(symbol.clone()).or_insert_with(|| {
            let (tx, mut rx) = mpsc::unbounded_channel::<DispatchItem>();
            let shared = self.shared.clone();
            tokio::spawn(async move {
                while let Some(item) = rx.recv().await {
                    Self::execute_one(&shared, item).await;
                }
            });
            tx
        });
        if sender.send(item).is_err() {
            log::error!("dispatch queue for {symbol} is closed; action dropped");
        }
    }

    async fn execute_one(shared: &Arc<Shared<G>>, item: DispatchItem) {
        let action = item.action;
        let result = Self::submit(shared, &action).await;
        match result {
            Ok(outcome) => {
                Self::apply_outcome(shared, &action, item.target_order_id, &outcome).await;
                shared
                    .notifier
                    .notify(Notification {
                        kind: NotificationKind::PositionMirrored,
                        symbol: Some(action.symbol.clone()),
                        reason: None,
                        context: serde_json::json!({ "action": action, "outcome": format!("{outcome:?}") }),
                        ts_ms: now_ms(),
                    })
                    .await;
            }
            Err(e) => {
                log::error!("action dispatch failed for {}: {e}", action.symbol);
                shared
                    .notifier
                    .notify(Notification {
                        kind: NotificationKind::ActionSkipped,
                        symbol: Some(action.symbol.clone()),
                        reason: Some(e.to_string()),
                        context: serde_json::json!({ "action": action }),
                        ts_ms: now_ms(),
                    })
                    .await;
            }
        }
    }

    async fn submit(shared: &Arc<Shared<G>>, action: &IntendedAction) -> Result<SubmitOutcome, GatewayError> {
        let mut gateway = shared.gateway.lock().await;
        if let Some(leverage) = action.leverage {
            if leverage > 1 {
                gateway.set_leverage(&action.symbol, leverage, true).await?;
            }
        }
        match &action.kind {
            IntendedActionKind::MarketOpen | IntendedActionKind::MarketClose => {
                gateway.place_market(&action.symbol, action.side, action.size, action.reduce_only).await
            }
            IntendedActionKind::LimitPlace => {
                let limit_price = action.limit_price.ok_or_else(|| GatewayError::Invariant("limit order missing price".into()))?;
                gateway.place_limit(&action.symbol, action.side, action.size, limit_price, action.reduce_only, false).await
            }
            IntendedActionKind::TriggerPlace { tpsl, trigger_price } => {
                gateway.place_trigger(&action.symbol, action.side, action.size, *trigger_price, *tpsl, false).await
            }
            IntendedActionKind::Cancel { order_id } => {
                gateway.cancel(&action.symbol, *order_id).await?;
                Ok(SubmitOutcome::Resting { order_id: *order_id })
            }
        }
    }

    async fn apply_outcome(shared: &Arc<Shared<G>>, action: &IntendedAction, target_order_id: Option<u64>, outcome: &SubmitOutcome) {
        match outcome {
            SubmitOutcome::Resting { order_id } => {
                if let Some(target_oid) = target_order_id {
                    shared.order_map.lock().await.insert(target_oid, *order_id);
                }
            }
            SubmitOutcome::Filled { total_size, .. } => {
                // Optimistic local update so a same-symbol action queued right
                // behind this one sees the new size without waiting on a
                // round trip, then a real refresh from the Gateway below
                // corrects it against whatever the exchange actually booked.
                {
                    let mut inventory = shared.inventory.lock().await;
                    inventory.apply_fill(&action.symbol, action.side.is_buy(), *total_size);
                }
                Self::refresh_follower_position(shared, &action.symbol).await;
            }
        }
        if matches!(action.kind, IntendedActionKind::Cancel { .. }) {
            if let Some(target_oid) = target_order_id {
                shared.order_map.lock().await.remove(&target_oid);
            }
        }
    }

    /// Refreshes the cached follower position for `symbol` from the Gateway
    /// after a fill, and signals the ratio refresher if the follower's
    /// account balance moved by more than `MATERIAL_BALANCE_CHANGE_PCT`.
    async fn refresh_follower_position(shared: &Arc<Shared<G>>, symbol: &str) {
        let snapshot = {
            let mut gateway = shared.gateway.lock().await;
            gateway.snapshot(&shared.follower_address).await
        };
        let snapshot = match snapshot {
            Ok(s) => s,
            Err(e) => {
                log::error!("apply_outcome: failed to refresh follower position for {symbol}: {e}");
                return;
            }
        };

        {
            let mut inventory = shared.inventory.lock().await;
            match snapshot.positions.get(symbol) {
                Some(pos) => {
                    inventory.positions.insert(symbol.to_string(), pos.signed_size);
                }
                None => {
                    inventory.positions.insert(symbol.to_string(), Decimal::ZERO);
                }
            }
        }

        let mut last_balance = shared.last_balance.lock().await;
        let material = match *last_balance {
            None => true,
            Some(prev) if prev.is_zero() => !snapshot.balance.is_zero(),
            Some(prev) => ((snapshot.balance - prev) / prev).abs() >= MATERIAL_BALANCE_CHANGE_PCT,
        };
        *last_balance = Some(snapshot.balance);
        drop(last_balance);

        if material {
            shared.ratio_refresh.notify_one();
        }
    }

    /// Cancels everything resting on the follower's own account. The first
    /// step of reconnect reconciliation and of a manual `CancelAllAndFlatten`.
    pub async fn cancel_all(&self) -> u64 {
        let mut gateway = self.shared.gateway.lock().await;
        match gateway.cancel_all(None).await {
            Ok(n) => {
                log::warn!("cancel_all: {n} orders cancelled");
                n
            }
            Err(e) => {
                log::error!("cancel_all failed: {e}");
                0
            }
        }
    }

    /// Called after the stream reconnects: drops unknown resting orders,
    /// fetches the live follower snapshot, and diffs it against the cached
    /// inventory to surface any fill that happened while disconnected.
    pub async fn reconcile_after_reconnect(&self) -> AccountSnapshot {
        log::warn!("stream reconnect detected, reconciling follower state");
        self.cancel_all().await;

        let snapshot = {
            let mut gateway = self.shared.gateway.lock().await;
            gateway.snapshot(&self.shared.follower_address).await
        };

        match snapshot {
            Ok(snap) => {
                let diffs = {
                    let mut inventory = self.shared.inventory.lock().await;
                    inventory.reconcile(&snap.positions)
                };
                if diffs.is_empty() {
                    log::info!("reconcile: follower inventory matches live state");
                } else {
                    log::warn!("reconcile: {} drift(s) detected and corrected", diffs.len());
                    for (symbol, internal, live, delta) in &diffs {
                        self.shared
                            .notifier
                            .notify(Notification {
                                kind: NotificationKind::ReconcileDriftDetected,
                                symbol: Some(symbol.clone()),
                                reason: None,
                                context: serde_json::json!({ "internal": internal, "live": live, "delta": delta }),
                                ts_ms: now_ms(),
                            })
                            .await;
                    }
                }
                snap
            }
            Err(e) => {
                log::error!("reconcile: failed to fetch follower snapshot: {e}");
                AccountSnapshot::empty(now_ms())
            }
        }
    }

    pub async fn equity(&self) -> Option<Decimal> {
        let mut gateway = self.shared.gateway.lock().await;
        gateway.snapshot(&self.shared.follower_address).await.ok().map(|s| s.equity)
    }

    /// Read-only passthroughs so the supervisor loop can build sizing context
    /// without holding a second handle to the gateway.
    pub async fn mid_price(&self, symbol: &str) -> Result<Decimal, GatewayError> {
        let mut gateway = self.shared.gateway.lock().await;
        gateway.mid_price(symbol).await
    }

    pub async fn snapshot(&self, address: &str) -> Result<AccountSnapshot, GatewayError> {
        let mut gateway = self.shared.gateway.lock().await;
        gateway.snapshot(address).await
    }

    /// `CancelAllAndFlatten`: cancel every resting order, then market-close
    /// every open follower position.
    pub async fn flatten_all(&self) {
        self.cancel_all().await;
        let snapshot = {
            let mut gateway = self.shared.gateway.lock().await;
            gateway.snapshot(&self.shared.follower_address).await
        };
        let positions = match snapshot {
            Ok(s) => s.positions,
            Err(e) => {
                log::error!("flatten_all: failed to fetch follower snapshot: {e}");
                return;
            }
        };
        for (symbol, position) in positions {
            if position.size().is_zero() {
                continue;
            }
            let mut gateway = self.shared.gateway.lock().await;
            let close_side = position.side().opposite();
            if let Err(e) = gateway.place_market(&symbol, close_side, position.size(), true).await {
                log::error!("flatten_all: failed to close {symbol}: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::SimExchange;
    use crate::model::{IntendedActionKind, Side};
    use crate::notify::NullNotifier;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn market_open_updates_follower_inventory() {
        let executor = MirrorExecutor::new(SimExchange::new(dec!(1000)), "0xfollower".to_string(), Arc::new(NullNotifier));
        executor
            .dispatch(DispatchItem {
                target_order_id: None,
                action: IntendedAction {
                    symbol: "BTC".into(),
                    kind: IntendedActionKind::MarketOpen,
                    side: Side::Buy,
                    size: dec!(0.05),
                    limit_price: None,
                    leverage: Some(5),
                    reduce_only: false,
                },
            })
            .await;
        // allow the background worker to run
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let inv = executor.shared.inventory.lock().await;
        assert_eq!(inv.positions.get("BTC").copied().unwrap_or_default(), dec!(0.05));
    }

    #[tokio::test]
    async fn resting_limit_registers_order_map_entry() {
        let executor = MirrorExecutor::new(SimExchange::new(dec!(1000)), "0xfollower".to_string(), Arc::new(NullNotifier));
        executor
            .dispatch(DispatchItem {
                target_order_id: Some(999),
                action: IntendedAction {
                    symbol: "ETH".into(),
                    kind: IntendedActionKind::LimitPlace,
                    side: Side::Sell,
                    size: dec!(1.0),
                    limit_price: Some(dec!(4000)),
                    leverage: None,
                    reduce_only: false,
                },
            })
            .await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(executor.follower_order_id_for(999).await.is_some());
    }

    #[tokio::test]
    async fn fill_refreshes_inventory_from_gateway_and_signals_ratio_refresh() {
        let executor = MirrorExecutor::new(SimExchange::new(dec!(1000)), "0xfollower".to_string(), Arc::new(NullNotifier));
        let signal = executor.ratio_refresh_signal();
        executor
            .dispatch(DispatchItem {
                target_order_id: None,
                action: IntendedAction {
                    symbol: "BTC".into(),
                    kind: IntendedActionKind::MarketOpen,
                    side: Side::Buy,
                    size: dec!(0.05),
                    limit_price: None,
                    leverage: Some(5),
                    reduce_only: false,
                },
            })
            .await;
        // The first fill always counts as a material balance change.
        tokio::time::timeout(std::time::Duration::from_millis(500), signal.notified())
            .await
            .expect("ratio refresh signal should fire after a fill");
        let inv = executor.shared.inventory.lock().await;
        // Refreshed straight from the Gateway snapshot, not just the optimistic delta.
        assert_eq!(inv.positions.get("BTC").copied().unwrap_or_default(), dec!(0.05));
    }

    #[test]
    fn reconcile_detects_drift_and_adopts_live_state() {
        let mut inventory = FollowerInventory::default();
        inventory.positions.insert("BTC".into(), dec!(0.01));
        let mut live = HashMap::new();
        live.insert("BTC".to_string(), Position { symbol: "BTC".into(), signed_size: dec!(0.03), entry_price: dec!(60000), leverage: 5 });
        let diffs = inventory.reconcile(&live);
        assert_eq!(diffs.len(), 1);
        assert_eq!(inventory.positions["BTC"], dec!(0.03));
    }
}
