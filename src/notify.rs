// notify.rs — outbound notifications over Redis pub/sub, ported from the
// teacher's status publisher (`MmStatusPublisher`): same "serialize a small
// struct, publish it on a fixed channel" idiom, generalized to a trait so the
// executor doesn't depend on Redis directly.
use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

const CHANNEL_NOTIFICATIONS: &str = "copytrader:notifications";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationKind {
    PositionMirrored,
    OrderMirrored,
    ActionSkipped,
    Paused,
    Resumed,
    StreamReconnected,
    ReconcileDriftDetected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub symbol: Option<String>,
    pub reason: Option<String>,
    pub context: serde_json::Value,
    pub ts_ms: u64,
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, note: Notification);
}

pub struct RedisNotifier {
    client: redis::Client,
}

impl RedisNotifier {
    pub fn new(redis_url: &str) -> Option<Self> {
        redis::Client::open(redis_url).ok().map(|client| Self { client })
    }
}

#[async_trait]
impl NotificationSink for RedisNotifier {
    async fn notify(&self, note: Notification) {
        let payload = match serde_json::to_string(&note) {
            Ok(p) => p,
            Err(e) => {
                log::warn!("failed to serialize notification: {e}");
                return;
            }
        };
        match self.client.get_async_connection().await {
            Ok(mut con) => {
                let result: redis::RedisResult<()> = con.publish(CHANNEL_NOTIFICATIONS, &payload).await;
                if let Err(e) = result {
                    log::warn!("failed to publish notification: {e}");
                }
            }
            Err(e) => log::warn!("redis connection failed while notifying: {e}"),
        }
    }
}

/// No-op sink for simulated runs and tests.
pub struct NullNotifier;

#[async_trait]
impl NotificationSink for NullNotifier {
    async fn notify(&self, _note: Notification) {}
}
