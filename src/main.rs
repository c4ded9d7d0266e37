// copy-trader-rs: mirrors one Hyperliquid account's positions, resting
// orders, and trigger orders onto a follower account, sized by wallet ratio.
//
// Supervisor shape (config -> build components -> bootstrap -> run loop ->
// graceful shutdown) follows the teacher's own main.rs; the quoting loop it
// used to drive a market maker is replaced with a stream-driven dispatch loop.
mod config;
mod differ;
mod errors;
mod exchange;
mod executor;
mod model;
mod notify;
mod risk;
mod signing;
mod sizer;
mod stream;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, RwLock};

use config::Config;
use differ::Differ;
use exchange::{ExchangeGateway, LiveExchange, SimExchange};
use executor::{DispatchItem, MirrorExecutor};
use model::{AccountSnapshot, AssetMeta, CopyEvent, SizerOutcome};
use notify::{Notification, NotificationKind, NotificationSink, NullNotifier, RedisNotifier};
use risk::RiskManager;
use sizer::SizingContext;
use stream::{StreamMessage, StreamSubscriber};

/// Operator commands, read one-per-line from stdin. A deployment that wires
/// this up to a real control plane would replace `spawn_command_reader` with
/// whatever transport it uses — the `Command` enum and handling are unchanged.
#[derive(Debug, Clone, Copy)]
enum Command {
    Pause,
    Resume,
    Stop,
    CancelAllAndFlatten,
}

fn now_ms() -> u64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Wallet-ratio and target-balance snapshot, refreshed periodically and
/// shared read-mostly between the dispatch loop and the refresher task.
struct RatioState {
    ratio: Decimal,
    target_balance: Decimal,
}

fn build_gateway(config: &Config) -> Box<dyn ExchangeGateway> {
    if config.hyperliquid.simulated_trading {
        Box::new(SimExchange::new(config.hyperliquid.simulated_balance))
    } else {
        Box::new(LiveExchange::new(config.hyperliquid.follower_private_key.clone()))
    }
}

fn spawn_command_reader(tx: mpsc::Sender<Command>) {
    tokio::spawn(async move {
        let stdin = tokio::io::stdin();
        let mut lines = BufReader::new(stdin).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let cmd = match line.trim().to_lowercase().as_str() {
                        "pause" => Some(Command::Pause),
                        "resume" => Some(Command::Resume),
                        "stop" => Some(Command::Stop),
                        "cancel_all_and_flatten" | "flatten" => Some(Command::CancelAllAndFlatten),
                        "" => None,
                        other => {
                            log::warn!("unrecognized command: {other}");
                            None
                        }
                    };
                    if let Some(cmd) = cmd {
                        if tx.send(cmd).await.is_err() {
                            return;
                        }
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    log::warn!("command reader error: {e}");
                    return;
                }
            }
        }
    });
}

fn spawn_ratio_refresher(
    executor: Arc<MirrorExecutor<Box<dyn ExchangeGateway>>>,
    risk: Arc<RiskManager>,
    target_address: String,
    follower_address: String,
    state: Arc<RwLock<RatioState>>,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(10));
        let ratio_refresh_signal = executor.ratio_refresh_signal();
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = ratio_refresh_signal.notified() => {
                    log::info!("ratio refresh triggered early by a material follower balance change");
                }
            }
            let target = executor.snapshot(&target_address).await;
            let follower = executor.snapshot(&follower_address).await;
            match (target, follower) {
                (Ok(target), Ok(follower)) => {
                    let ratio = if target.balance.is_zero() { Decimal::ONE } else { follower.balance / target.balance };
                    risk.observe_equity(follower.equity);
                    let mut guard = state.write().await;
                    guard.ratio = ratio;
                    guard.target_balance = target.balance;
                }
                (Err(e), _) | (_, Err(e)) => log::warn!("ratio refresh failed: {e}"),
            }
        }
    });
}

fn spawn_reporter(executor: Arc<MirrorExecutor<Box<dyn ExchangeGateway>>>, notifier: Arc<dyn NotificationSink>, risk: Arc<RiskManager>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            interval.tick().await;
            let equity = executor.equity().await;
            log::info!("status: equity={equity:?} paused={}", risk.is_paused());
            notifier
                .notify(Notification {
                    kind: NotificationKind::Paused,
                    symbol: None,
                    reason: None,
                    context: serde_json::json!({ "equity": equity, "paused": risk.is_paused() }),
                    ts_ms: now_ms(),
                })
                .await;
        }
    });
}

/// Builds the sizing context for one event and hands the outcome to the
/// executor, logging (and notifying) a skip instead of dispatching.
async fn handle_event(
    event: CopyEvent,
    config: &Config,
    asset_meta: &HashMap<String, AssetMeta>,
    ratio_state: &RwLock<RatioState>,
    executor: &MirrorExecutor<Box<dyn ExchangeGateway>>,
    risk: &RiskManager,
    notifier: &dyn NotificationSink,
    target_leverage: Option<u32>,
    target_position_size: Option<Decimal>,
) {
    let symbol = event.symbol().to_string();
    let meta = match asset_meta.get(&symbol) {
        Some(m) => m,
        None => {
            log::warn!("no asset metadata for {symbol}, skipping event");
            return;
        }
    };

    let mid_price = executor.mid_price(&symbol).await.unwrap_or_default();
    let follower_snapshot = executor
        .snapshot(&config.hyperliquid.follower_address)
        .await
        .unwrap_or_else(|_| AccountSnapshot::empty(now_ms()));
    let follower_position = follower_snapshot.positions.get(&symbol);
    let follower_total_exposure_usd = follower_snapshot
        .positions
        .values()
        .map(|p| p.size() * p.entry_price)
        .fold(Decimal::ZERO, |acc, n| acc + n);

    let mirrored_order_id = match &event {
        CopyEvent::OrderCanceled { order_id, .. } => executor.follower_order_id_for(*order_id).await,
        _ => None,
    };
    let target_order_id = match &event {
        CopyEvent::OrderPlaced { order } => Some(order.order_id),
        CopyEvent::OrderCanceled { order_id, .. } => Some(*order_id),
        _ => None,
    };

    let ratio_guard = ratio_state.read().await;
    let ctx = SizingContext {
        config,
        asset_meta: meta,
        target_balance: ratio_guard.target_balance,
        follower_balance: follower_snapshot.balance,
        follower_equity: follower_snapshot.equity,
        ratio: ratio_guard.ratio,
        mid_price,
        follower_position,
        target_position_size,
        follower_total_exposure_usd,
        follower_open_trades: follower_snapshot.positions.len() as u32,
        follower_open_orders: follower_snapshot.orders.len() as u32,
        paused: risk.is_paused(),
        target_leverage,
        mirrored_order_id,
    };

    match sizer::size(&event, &ctx) {
        SizerOutcome::Act(action) => {
            executor.dispatch(DispatchItem { target_order_id, action }).await;
        }
        SizerOutcome::Skip(reason) => {
            log::info!("skipped {symbol}: {reason}");
            notifier
                .notify(Notification {
                    kind: NotificationKind::ActionSkipped,
                    symbol: Some(symbol),
                    reason: Some(reason.0),
                    context: serde_json::json!({}),
                    ts_ms: now_ms(),
                })
                .await;
        }
    }
}

async fn process_events(
    events: Vec<CopyEvent>,
    differ: &Differ,
    config: &Config,
    asset_meta: &HashMap<String, AssetMeta>,
    ratio_state: &RwLock<RatioState>,
    executor: &MirrorExecutor<Box<dyn ExchangeGateway>>,
    risk: &RiskManager,
    notifier: &dyn NotificationSink,
) {
    for event in events {
        let symbol = event.symbol().to_string();
        let (target_leverage, target_position_size) = differ
            .snapshot()
            .positions
            .get(&symbol)
            .map(|p| (Some(p.leverage), Some(p.size())))
            .unwrap_or((None, None));
        handle_event(event, config, asset_meta, ratio_state, executor, risk, notifier, target_leverage, target_position_size).await;
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    env_logger::init();
    log::info!("copy-trader-rs starting");

    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            log::error!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    let notifier: Arc<dyn NotificationSink> = match RedisNotifier::new(&config.redis_url) {
        Some(n) => Arc::new(n),
        None => {
            log::warn!("redis unavailable at {}, notifications disabled", config.redis_url);
            Arc::new(NullNotifier)
        }
    };

    let risk = Arc::new(RiskManager::new(config.copy_rules.max_account_equity));

    let mut gateway = build_gateway(&config);

    let asset_meta: HashMap<String, AssetMeta> = match gateway.meta().await {
        Ok(metas) => metas.into_iter().map(|m| (m.symbol.clone(), m)).collect(),
        Err(e) => {
            log::error!("failed to fetch asset metadata: {e}");
            std::process::exit(1);
        }
    };

    let target_snapshot = match gateway.snapshot(&config.hyperliquid.target_address).await {
        Ok(s) => s,
        Err(e) => {
            log::error!("failed to fetch target account snapshot: {e}");
            std::process::exit(1);
        }
    };
    let follower_snapshot = match gateway.snapshot(&config.hyperliquid.follower_address).await {
        Ok(s) => s,
        Err(e) => {
            log::error!("failed to fetch follower account snapshot: {e}");
            std::process::exit(1);
        }
    };

    let initial_ratio = if target_snapshot.balance.is_zero() {
        Decimal::ONE
    } else {
        follower_snapshot.balance / target_snapshot.balance
    };
    let ratio_state = Arc::new(RwLock::new(RatioState {
        ratio: initial_ratio,
        target_balance: target_snapshot.balance,
    }));
    risk.observe_equity(follower_snapshot.equity);

    let executor = Arc::new(MirrorExecutor::new(gateway, config.hyperliquid.follower_address.clone(), notifier.clone()));

    let mut differ = Differ::new(AccountSnapshot::empty(now_ms()), &config.copy_rules.blocked_assets);
    let mut bootstrap_events = differ.diff_snapshot(target_snapshot);
    if !config.copy_rules.copy_existing_positions {
        bootstrap_events.retain(|e| !matches!(e, CopyEvent::PositionOpened { .. }));
    }
    if !config.copy_rules.copy_existing_orders {
        bootstrap_events.retain(|e| !matches!(e, CopyEvent::OrderPlaced { .. }));
    }
    log::info!("bootstrap: {} event(s) from initial target snapshot", bootstrap_events.len());
    process_events(bootstrap_events, &differ, &config, &asset_meta, &ratio_state, &executor, &risk, notifier.as_ref()).await;

    let (stream_tx, mut stream_rx) = mpsc::channel::<StreamMessage>(1024);
    let subscriber = Arc::new(StreamSubscriber::new(config.hyperliquid.target_address.clone()));
    subscriber.clone().spawn(stream_tx);

    let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(16);
    spawn_command_reader(cmd_tx);

    spawn_ratio_refresher(
        executor.clone(),
        risk.clone(),
        config.hyperliquid.target_address.clone(),
        config.hyperliquid.follower_address.clone(),
        ratio_state.clone(),
    );
    spawn_reporter(executor.clone(), notifier.clone(), risk.clone());

    let mut flush_interval = tokio::time::interval(Duration::from_millis(250));
    let mut stall_check_interval = tokio::time::interval(Duration::from_secs(5));
    let mut exit_code = 0i32;

    log::info!("entering dispatch loop");
    'outer: loop {
        tokio::select! {
            maybe_msg = stream_rx.recv() => {
                match maybe_msg {
                    Some(StreamMessage::Frame(frame)) => {
                        let events = differ.ingest_frame(frame, now_ms());
                        process_events(events, &differ, &config, &asset_meta, &ratio_state, &executor, &risk, notifier.as_ref()).await;
                    }
                    Some(StreamMessage::Reconnected) => {
                        notifier.notify(Notification {
                            kind: NotificationKind::StreamReconnected,
                            symbol: None,
                            reason: None,
                            context: serde_json::json!({}),
                            ts_ms: now_ms(),
                        }).await;
                        let follower_snapshot_after_reconnect = executor.reconcile_after_reconnect().await;
                        let _ = follower_snapshot_after_reconnect;
                        if let Ok(fresh_target) = executor.snapshot(&config.hyperliquid.target_address).await {
                            let events = differ.diff_snapshot(fresh_target);
                            process_events(events, &differ, &config, &asset_meta, &ratio_state, &executor, &risk, notifier.as_ref()).await;
                        }
                    }
                    Some(StreamMessage::FatalFailure) => {
                        log::error!("stream subscriber gave up after repeated failures");
                        exit_code = 2;
                        break 'outer;
                    }
                    None => {
                        log::error!("stream channel closed unexpectedly");
                        exit_code = 2;
                        break 'outer;
                    }
                }
            }
            _ = flush_interval.tick() => {
                let events = differ.flush_due_fills(now_ms());
                if !events.is_empty() {
                    process_events(events, &differ, &config, &asset_meta, &ratio_state, &executor, &risk, notifier.as_ref()).await;
                }
            }
            _ = stall_check_interval.tick() => {
                if subscriber.stall_panic_flag().load(std::sync::atomic::Ordering::SeqCst) {
                    log::warn!("stream stall flag set, forcing reconnect");
                    subscriber.request_reconnect();
                    subscriber.clear_stall();
                }
            }
            maybe_cmd = cmd_rx.recv() => {
                match maybe_cmd {
                    Some(Command::Pause) => {
                        risk.pause();
                        notifier.notify(Notification { kind: NotificationKind::Paused, symbol: None, reason: None, context: serde_json::json!({}), ts_ms: now_ms() }).await;
                    }
                    Some(Command::Resume) => {
                        risk.resume();
                        notifier.notify(Notification { kind: NotificationKind::Resumed, symbol: None, reason: None, context: serde_json::json!({}), ts_ms: now_ms() }).await;
                    }
                    Some(Command::CancelAllAndFlatten) => {
                        executor.flatten_all().await;
                    }
                    Some(Command::Stop) | None => {
                        log::info!("stop requested");
                        break 'outer;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("ctrl-c received");
                break 'outer;
            }
        }
    }

    log::info!("draining in-flight dispatch for up to 5s before exit");
    tokio::time::sleep(Duration::from_secs(5)).await;
    std::process::exit(exit_code);
}
