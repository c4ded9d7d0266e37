// stream.rs — StreamSubscriber: WebSocket connection to the target account's
// `userEvents` channel, with exponential-backoff reconnect and stall
// detection. Ported from the teacher's `l2Book`/`trades` ingestor — same
// reconnect loop shape and stall-panic flag, redirected to a single private
// channel for one address instead of a universe of public market-data feeds.
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use futures_util::{StreamExt, SinkExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use log::{error, info, warn};
use tokio::sync::{mpsc, Notify};
use url::Url;

use crate::differ::RawFrame;

const WS_URL: &str = "wss://api.hyperliquid.xyz/ws";

/// If no WS message is received for this many seconds, declare a stall.
const STALL_TIMEOUT_SECS: u64 = 30;
const MAX_BACKOFF_SECS: u64 = 60;

pub type StallPanicFlag = Arc<AtomicBool>;

pub fn new_stall_panic_flag() -> StallPanicFlag {
    Arc::new(AtomicBool::new(false))
}

fn now_ms() -> u64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// One message handed to the Differ: either a live delta frame, or a signal
/// that the connection just (re)established and the account must be resnapshot
/// before any further frame is trusted.
pub enum StreamMessage {
    Frame(RawFrame),
    Reconnected,
    /// Sent once the reconnect loop has failed to establish a connection
    /// `MAX_CONSECUTIVE_FAILURES` times in a row; the run loop exits after
    /// sending this, leaving the supervisor to decide how to shut down.
    FatalFailure,
}

const MAX_CONSECUTIVE_FAILURES: u32 = 10;

pub struct StreamSubscriber {
    target_address: String,
    stall_panic: StallPanicFlag,
    last_message_ms: Arc<AtomicU64>,
    /// Notified by the supervisor when it has observed `stall_panic` set, to
    /// force the read loop to drop the socket and reconnect immediately
    /// rather than wait on the next `Ping`/`Close`/error from a half-dead peer.
    force_reconnect: Arc<Notify>,
}

impl StreamSubscriber {
    pub fn new(target_address: String) -> Self {
        Self {
            target_address,
            stall_panic: new_stall_panic_flag(),
            last_message_ms: Arc::new(AtomicU64::new(now_ms())),
            force_reconnect: Arc::new(Notify::new()),
        }
    }

    pub fn stall_panic_flag(&self) -> StallPanicFlag {
        self.stall_panic.clone()
    }

    /// Forces the read loop to tear down its socket and reconnect. Call this
    /// once `stall_panic_flag()` reads true.
    pub fn request_reconnect(&self) {
        self.force_reconnect.notify_one();
    }

    /// Clears the stall latch after a reconnect has been requested for it.
    pub fn clear_stall(&self) {
        self.stall_panic.store(false, Ordering::SeqCst);
    }

    fn touch(&self) {
        self.last_message_ms.store(now_ms(), Ordering::Relaxed);
    }

    fn is_stalled(&self) -> bool {
        now_ms().saturating_sub(self.last_message_ms.load(Ordering::Relaxed)) > STALL_TIMEOUT_SECS * 1_000
    }

    /// Spawns the stall watcher and the reconnecting WS read loop. Frames and
    /// reconnect signals are pushed onto `tx` for the Differ task to consume;
    /// the subscriber never interprets message contents beyond parsing JSON.
    pub fn spawn(self: Arc<Self>, tx: mpsc::Sender<StreamMessage>) {
        let watcher = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
                let stalled = watcher.is_stalled();
                if stalled && !watcher.stall_panic.load(Ordering::SeqCst) {
                    error!("network stall detected: no WS message for >{STALL_TIMEOUT_SECS}s, flagging for resync");
                    watcher.stall_panic.store(true, Ordering::SeqCst);
                }
            }
        });

        tokio::spawn(async move {
            self.run(tx).await;
        });
    }

    async fn run(self: Arc<Self>, tx: mpsc::Sender<StreamMessage>) {
        let mut retry_delay_secs: u64 = 1;
        let mut consecutive_failures: u32 = 0;

        loop {
            info!("connecting to {WS_URL}");
            match connect_async(match Url::parse(WS_URL) {
                Ok(u) => u,
                Err(e) => {
                    error!("invalid WS url: {e}");
                    return;
                }
            })
            .await
            {
                Ok((ws_stream, _)) => {
                    info!("WS connected, subscribing to userEvents for {}", self.target_address);
                    retry_delay_secs = 1;
                    consecutive_failures = 0;
                    self.stall_panic.store(false, Ordering::SeqCst);
                    self.touch();

                    let (mut write, mut read) = ws_stream.split();
                    let sub = serde_json::json!({
                        "method": "subscribe",
                        "subscription": { "type": "userEvents", "user": self.target_address }
                    });
                    if let Err(e) = write.send(Message::Text(sub.to_string())).await {
                        error!("failed to subscribe to userEvents: {e}");
                    }

                    if tx.send(StreamMessage::Reconnected).await.is_err() {
                        return;
                    }

                    loop {
                        let msg = tokio::select! {
                            msg = read.next() => msg,
                            _ = self.force_reconnect.notified() => {
                                warn!("forced reconnect requested (stalled socket), dropping connection");
                                break;
                            }
                        };
                        let Some(msg) = msg else { break };
                        match msg {
                            Ok(Message::Text(text)) => {
                                self.touch();
                                if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&text) {
                                    let channel = parsed["channel"].as_str().unwrap_or("");
                                    match channel {
                                        "userEvents" => {
                                            if let Some(data) = parsed.get("data") {
                                                if let Ok(frame) = serde_json::from_value::<RawFrame>(data.clone()) {
                                                    if tx.send(StreamMessage::Frame(frame)).await.is_err() {
                                                        return;
                                                    }
                                                }
                                            }
                                        }
                                        "pong" | "ping" => {}
                                        _ => {}
                                    }
                                }
                            }
                            Ok(Message::Ping(data)) => {
                                let _ = write.send(Message::Pong(data)).await;
                                self.touch();
                            }
                            Ok(Message::Close(_)) => {
                                warn!("WS connection closed by server, reconnecting...");
                                break;
                            }
                            Err(e) => {
                                error!("WS error: {e}, reconnecting...");
                                break;
                            }
                            _ => {}
                        }
                    }
                }
                Err(e) => {
                    consecutive_failures += 1;
                    error!(
                        "failed to connect to WS: {e}, retrying in {retry_delay_secs}s... ({consecutive_failures}/{MAX_CONSECUTIVE_FAILURES} consecutive failures)"
                    );
                    if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                        error!("giving up after {MAX_CONSECUTIVE_FAILURES} consecutive connection failures");
                        let _ = tx.send(StreamMessage::FatalFailure).await;
                        return;
                    }
                }
            }

            tokio::time::sleep(tokio::time::Duration::from_secs(retry_delay_secs)).await;
            retry_delay_secs = (retry_delay_secs * 2).min(MAX_BACKOFF_SECS);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_stall_resets_the_panic_flag() {
        let sub = StreamSubscriber::new("0xtarget".to_string());
        sub.stall_panic.store(true, Ordering::SeqCst);
        assert!(sub.stall_panic_flag().load(Ordering::SeqCst));
        sub.clear_stall();
        assert!(!sub.stall_panic_flag().load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn request_reconnect_wakes_a_waiter_on_force_reconnect() {
        let sub = Arc::new(StreamSubscriber::new("0xtarget".to_string()));
        let waiter = sub.clone();
        let handle = tokio::spawn(async move {
            waiter.force_reconnect.notified().await;
        });
        tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
        sub.request_reconnect();
        tokio::time::timeout(tokio::time::Duration::from_millis(500), handle)
            .await
            .expect("waiter should be woken by request_reconnect")
            .unwrap();
    }
}
