// exchange.rs — ExchangeGateway: signs, submits, and interprets every
// exchange-mutating action, and serves the read-only meta/mid/snapshot/orders
// queries the rest of the engine needs.
use async_trait::async_trait;
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::time::Instant;

use crate::errors::GatewayError;
use crate::model::{AccountSnapshot, AssetMeta, Order, OrderKind, Position, Side, TpSl, TriggerCondition};
use crate::signing::{sign_cancel_action, sign_order_action, sign_update_leverage_action, OrderAction, OrderRequest, OrderTif};

const CACHE_DURATION: std::time::Duration = std::time::Duration::from_secs(2);
const DEFAULT_SLIPPAGE_PCT: Decimal = dec!(0.03);
const TRIGGER_SLIPPAGE_PCT: Decimal = dec!(0.05);
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);
const MAX_NETWORK_RETRIES: u32 = 3;

/// Retries transient network/rate-limit failures up to `MAX_NETWORK_RETRIES`
/// times with jittered exponential backoff; exchange rejections and
/// invariant errors are returned immediately since retrying them can't help.
async fn with_retry<F, Fut, T>(mut attempt: F) -> Result<T, GatewayError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, GatewayError>>,
{
    let mut last_err = None;
    for n in 0..=MAX_NETWORK_RETRIES {
        match attempt().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && n < MAX_NETWORK_RETRIES => {
                let base_ms = 200u64 * 2u64.pow(n);
                let jitter_ms: u64 = rand::Rng::gen_range(&mut rand::thread_rng(), 0..base_ms.max(1));
                log::warn!("gateway call failed ({e}), retrying in {}ms (attempt {}/{MAX_NETWORK_RETRIES})", base_ms + jitter_ms, n + 1);
                tokio::time::sleep(std::time::Duration::from_millis(base_ms + jitter_ms)).await;
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or(GatewayError::Network("retry loop exhausted".into())))
}

/// What the exchange told us about a submitted order.
#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    Resting { order_id: u64 },
    Filled { order_id: u64, total_size: Decimal, avg_price: Decimal },
}

#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    async fn meta(&mut self) -> Result<Vec<AssetMeta>, GatewayError>;
    async fn mid_price(&mut self, symbol: &str) -> Result<Decimal, GatewayError>;
    async fn snapshot(&mut self, address: &str) -> Result<AccountSnapshot, GatewayError>;
    async fn open_orders(&mut self, address: &str) -> Result<Vec<Order>, GatewayError>;

    async fn set_leverage(&mut self, symbol: &str, leverage: u32, is_cross: bool) -> Result<(), GatewayError>;

    async fn place_market(
        &mut self,
        symbol: &str,
        side: Side,
        size: Decimal,
        reduce_only: bool,
    ) -> Result<SubmitOutcome, GatewayError>;

    async fn place_limit(
        &mut self,
        symbol: &str,
        side: Side,
        size: Decimal,
        limit_price: Decimal,
        reduce_only: bool,
        ioc: bool,
    ) -> Result<SubmitOutcome, GatewayError>;

    async fn place_trigger(
        &mut self,
        symbol: &str,
        side: Side,
        size: Decimal,
        trigger_price: Decimal,
        tpsl: TpSl,
        is_market: bool,
    ) -> Result<SubmitOutcome, GatewayError>;

    async fn cancel(&mut self, symbol: &str, order_id: u64) -> Result<(), GatewayError>;
    async fn cancel_all(&mut self, symbol: Option<&str>) -> Result<u64, GatewayError>;
}

/// Forwards to the boxed trait object so the supervisor can hold a single
/// `MirrorExecutor<Box<dyn ExchangeGateway>>` regardless of which concrete
/// gateway it was built with.
#[async_trait]
impl ExchangeGateway for Box<dyn ExchangeGateway> {
    async fn meta(&mut self) -> Result<Vec<AssetMeta>, GatewayError> {
        (**self).meta().await
    }

    async fn mid_price(&mut self, symbol: &str) -> Result<Decimal, GatewayError> {
        (**self).mid_price(symbol).await
    }

    async fn snapshot(&mut self, address: &str) -> Result<AccountSnapshot, GatewayError> {
        (**self).snapshot(address).await
    }

    async fn open_orders(&mut self, address: &str) -> Result<Vec<Order>, GatewayError> {
        (**self).open_orders(address).await
    }

    async fn set_leverage(&mut self, symbol: &str, leverage: u32, is_cross: bool) -> Result<(), GatewayError> {
        (**self).set_leverage(symbol, leverage, is_cross).await
    }

    async fn place_market(&mut self, symbol: &str, side: Side, size: Decimal, reduce_only: bool) -> Result<SubmitOutcome, GatewayError> {
        (**self).place_market(symbol, side, size, reduce_only).await
    }

    async fn place_limit(
        &mut self,
        symbol: &str,
        side: Side,
        size: Decimal,
        limit_price: Decimal,
        reduce_only: bool,
        ioc: bool,
    ) -> Result<SubmitOutcome, GatewayError> {
        (**self).place_limit(symbol, side, size, limit_price, reduce_only, ioc).await
    }

    async fn place_trigger(
        &mut self,
        symbol: &str,
        side: Side,
        size: Decimal,
        trigger_price: Decimal,
        tpsl: TpSl,
        is_market: bool,
    ) -> Result<SubmitOutcome, GatewayError> {
        (**self).place_trigger(symbol, side, size, trigger_price, tpsl, is_market).await
    }

    async fn cancel(&mut self, symbol: &str, order_id: u64) -> Result<(), GatewayError> {
        (**self).cancel(symbol, order_id).await
    }

    async fn cancel_all(&mut self, symbol: Option<&str>) -> Result<u64, GatewayError> {
        (**self).cancel_all(symbol).await
    }
}

// ─── Formatting helpers (ported to operate on Decimal) ─────────────────────

/// Rounds to 5 significant figures, the way prices are formatted for the wire.
pub fn round_to_5_sig_figs(val: Decimal) -> Decimal {
    if val.is_zero() {
        return Decimal::ZERO;
    }
    let val_f = val.to_f64().unwrap_or(0.0);
    let digits = 5 - 1 - (val_f.abs().log10().floor() as i32);
    let digits = digits.clamp(0, 10) as u32;
    val.round_dp(digits)
}

/// Rounds a size to `decimals` places then strips trailing zeros, matching
/// the wire SDK's `float_to_wire`.
pub fn decimal_to_wire(val: Decimal, decimals: u32) -> String {
    let rounded = val.round_dp(decimals).normalize();
    rounded.to_string()
}

fn slippage_price(mid: Decimal, side: Side, pct: Decimal) -> Decimal {
    let factor = if side.is_buy() { Decimal::ONE + pct } else { Decimal::ONE - pct };
    round_to_5_sig_figs(mid * factor)
}

// ─── Live exchange ──────────────────────────────────────────────────────────

pub struct LiveExchange {
    base_url: String,
    private_key: String,
    client: reqwest::Client,
    symbol_to_asset: HashMap<String, u32>,
    asset_meta: HashMap<u32, AssetMeta>,
    cached_snapshot: HashMap<String, (AccountSnapshot, Instant)>,
    cached_mids: Option<(HashMap<String, Decimal>, Instant)>,
    cached_open_orders: HashMap<String, (Vec<Order>, Instant)>,
}

impl LiveExchange {
    pub fn new(private_key: String) -> Self {
        Self {
            base_url: "https://api.hyperliquid.xyz".to_string(),
            private_key,
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            symbol_to_asset: HashMap::new(),
            asset_meta: HashMap::new(),
            cached_snapshot: HashMap::new(),
            cached_mids: None,
            cached_open_orders: HashMap::new(),
        }
    }

    fn asset_index(&self, symbol: &str) -> Result<u32, GatewayError> {
        self.symbol_to_asset
            .get(symbol)
            .copied()
            .ok_or_else(|| GatewayError::Invariant(format!("unknown asset: {symbol}")))
    }

    fn size_decimals(&self, asset_idx: u32) -> u32 {
        self.asset_meta.get(&asset_idx).map(|m| m.size_decimals).unwrap_or(4)
    }

    /// Info-endpoint POST, retried up to `MAX_NETWORK_RETRIES` times on
    /// transient network/rate-limit failures per the Gateway's error policy.
    async fn post_info(&self, payload: serde_json::Value) -> Result<serde_json::Value, GatewayError> {
        with_retry(|| self.post_info_once(payload.clone())).await
    }

    async fn post_info_once(&self, payload: serde_json::Value) -> Result<serde_json::Value, GatewayError> {
        let resp = self
            .client
            .post(format!("{}/info", self.base_url))
            .json(&payload)
            .send()
            .await
            .map_err(|e| GatewayError::Network(e.to_string()))?;

        if resp.status().as_u16() == 429 {
            return Err(GatewayError::RateLimited);
        }

        let data: serde_json::Value = resp.json().await.map_err(|e| GatewayError::Network(e.to_string()))?;
        if let Some(err) = data["error"].as_str() {
            if err.contains("rate limited") {
                return Err(GatewayError::RateLimited);
            }
        }
        Ok(data)
    }

    /// Exchange-endpoint POST (signed, mutating). Retried only for transient
    /// network/rate-limit failures; an `err` response from the exchange is an
    /// `ExchangeRejection` and is never retried — resubmitting a rejected
    /// order (e.g. bad nonce, insufficient margin) risks a double-submit.
    async fn post_exchange(
        &self,
        action: serde_json::Value,
        nonce: u64,
        signature: crate::signing::Signature,
    ) -> Result<serde_json::Value, GatewayError> {
        with_retry(|| self.post_exchange_once(action.clone(), nonce, signature.clone())).await
    }

    async fn post_exchange_once(
        &self,
        action: serde_json::Value,
        nonce: u64,
        signature: crate::signing::Signature,
    ) -> Result<serde_json::Value, GatewayError> {
        let payload = serde_json::json!({
            "action": action,
            "nonce": nonce,
            "signature": signature,
            "vaultAddress": serde_json::Value::Null,
        });

        let resp = self
            .client
            .post(format!("{}/exchange", self.base_url))
            .json(&payload)
            .send()
            .await
            .map_err(|e| GatewayError::Network(e.to_string()))?;

        if resp.status().as_u16() == 429 {
            return Err(GatewayError::RateLimited);
        }

        let text = resp.text().await.map_err(|e| GatewayError::Network(e.to_string()))?;
        let data: serde_json::Value = serde_json::from_str(&text).map_err(|e| GatewayError::Network(e.to_string()))?;

        if data["status"].as_str() == Some("err") {
            let msg = data["response"].as_str().unwrap_or("unknown exchange error").to_string();
            if msg.contains("rate limited") {
                return Err(GatewayError::RateLimited);
            }
            return Err(GatewayError::Rejected(msg));
        }
        Ok(data)
    }

    fn interpret_order_response(data: &serde_json::Value) -> Result<SubmitOutcome, GatewayError> {
        let status = data["response"]["data"]["statuses"]
            .as_array()
            .and_then(|arr| arr.first())
            .ok_or_else(|| GatewayError::Rejected("no status in exchange response".to_string()))?;

        if let Some(err) = status["error"].as_str() {
            return Err(GatewayError::Rejected(err.to_string()));
        }
        if let Some(resting) = status.get("resting") {
            let order_id = resting["oid"].as_u64().unwrap_or(0);
            return Ok(SubmitOutcome::Resting { order_id });
        }
        if let Some(filled) = status.get("filled") {
            let order_id = filled["oid"].as_u64().unwrap_or(0);
            let total_size = filled["totalSz"]
                .as_str()
                .and_then(|s| Decimal::from_str(s).ok())
                .unwrap_or(Decimal::ZERO);
            let avg_price = filled["avgPx"]
                .as_str()
                .and_then(|s| Decimal::from_str(s).ok())
                .unwrap_or(Decimal::ZERO);
            return Ok(SubmitOutcome::Filled { order_id, total_size, avg_price });
        }
        Err(GatewayError::Rejected(format!("unrecognized status shape: {status}")))
    }

    async fn submit_order(&self, order: OrderRequest, grouping: &'static str) -> Result<SubmitOutcome, GatewayError> {
        let nonce = chrono::Utc::now().timestamp_millis() as u64;
        let action = OrderAction { orders: vec![order], grouping };
        let (sig, action_json) = sign_order_action(&self.private_key, &action, nonce)?;
        let result = self.post_exchange(action_json, nonce, sig).await?;
        Self::interpret_order_response(&result)
    }
}

#[async_trait]
impl ExchangeGateway for LiveExchange {
    async fn meta(&mut self) -> Result<Vec<AssetMeta>, GatewayError> {
        let data = self.post_info(serde_json::json!({ "type": "meta" })).await?;
        let mut metas = Vec::new();
        if let Some(universe) = data["universe"].as_array() {
            for (i, asset) in universe.iter().enumerate() {
                let symbol = asset["name"].as_str().unwrap_or("").to_string();
                if symbol.is_empty() {
                    continue;
                }
                let index = i as u32;
                let size_decimals = asset["szDecimals"].as_u64().unwrap_or(4) as u32;
                let max_leverage = asset["maxLeverage"].as_u64().unwrap_or(20) as u32;
                self.symbol_to_asset.insert(symbol.clone(), index);
                let meta = AssetMeta { symbol: symbol.clone(), index, size_decimals, max_leverage };
                self.asset_meta.insert(index, meta.clone());
                metas.push(meta);
            }
        }
        Ok(metas)
    }

    async fn mid_price(&mut self, symbol: &str) -> Result<Decimal, GatewayError> {
        if let Some((mids, ts)) = &self.cached_mids {
            if ts.elapsed() < CACHE_DURATION {
                if let Some(px) = mids.get(symbol) {
                    return Ok(*px);
                }
            }
        }
        let data = self.post_info(serde_json::json!({ "type": "allMids" })).await?;
        let mut mids = HashMap::new();
        if let Some(obj) = data.as_object() {
            for (coin, px_val) in obj {
                if let Some(px_str) = px_val.as_str() {
                    if let Ok(px) = Decimal::from_str(px_str) {
                        mids.insert(coin.clone(), px);
                    }
                }
            }
        }
        let px = mids
            .get(symbol)
            .copied()
            .ok_or_else(|| GatewayError::Invariant(format!("no mid price for {symbol}")))?;
        self.cached_mids = Some((mids, Instant::now()));
        Ok(px)
    }

    async fn snapshot(&mut self, address: &str) -> Result<AccountSnapshot, GatewayError> {
        if let Some((snap, ts)) = self.cached_snapshot.get(address) {
            if ts.elapsed() < CACHE_DURATION {
                return Ok(snap.clone());
            }
        }

        let data = self
            .post_info(serde_json::json!({ "type": "clearinghouseState", "user": address }))
            .await?;

        let balance = data["withdrawable"]
            .as_str()
            .and_then(|s| Decimal::from_str(s).ok())
            .unwrap_or(Decimal::ZERO);
        let equity = data["marginSummary"]["accountValue"]
            .as_str()
            .and_then(|s| Decimal::from_str(s).ok())
            .unwrap_or(balance);

        let mut positions = HashMap::new();
        if let Some(list) = data["assetPositions"].as_array() {
            for p in list {
                let pos_data = &p["position"];
                let symbol = pos_data["coin"].as_str().unwrap_or("").to_string();
                let signed_size = pos_data["szi"]
                    .as_str()
                    .and_then(|s| Decimal::from_str(s).ok())
                    .unwrap_or(Decimal::ZERO);
                if signed_size.is_zero() || symbol.is_empty() {
                    continue;
                }
                let entry_price = pos_data["entryPx"]
                    .as_str()
                    .and_then(|s| Decimal::from_str(s).ok())
                    .unwrap_or(Decimal::ZERO);
                let leverage = pos_data["leverage"]["value"].as_u64().unwrap_or(1) as u32;
                positions.insert(symbol.clone(), Position { symbol, signed_size, entry_price, leverage });
            }
        }

        let orders = self.open_orders(address).await.unwrap_or_default();
        let orders_map = orders.into_iter().map(|o| (o.order_id, o)).collect();

        let snapshot = AccountSnapshot {
            balance,
            equity,
            positions,
            orders: orders_map,
            ts_ms: chrono::Utc::now().timestamp_millis() as u64,
        };
        self.cached_snapshot.insert(address.to_string(), (snapshot.clone(), Instant::now()));
        Ok(snapshot)
    }

    async fn open_orders(&mut self, address: &str) -> Result<Vec<Order>, GatewayError> {
        if let Some((orders, ts)) = self.cached_open_orders.get(address) {
            if ts.elapsed() < CACHE_DURATION {
                return Ok(orders.clone());
            }
        }

        let data = self
            .post_info(serde_json::json!({ "type": "openOrders", "user": address }))
            .await?;

        let mut orders = Vec::new();
        if let Some(arr) = data.as_array() {
            for o in arr {
                let symbol = o["coin"].as_str().unwrap_or("").to_string();
                let order_id = o["oid"].as_u64().unwrap_or(0);
                let is_buy = o["side"].as_str() == Some("B");
                let size = o["sz"].as_str().and_then(|s| Decimal::from_str(s).ok()).unwrap_or(Decimal::ZERO);
                let limit_price = o["limitPx"].as_str().and_then(|s| Decimal::from_str(s).ok());
                if symbol.is_empty() {
                    continue;
                }
                orders.push(Order {
                    order_id,
                    symbol,
                    side: if is_buy { Side::Buy } else { Side::Sell },
                    kind: OrderKind::Limit,
                    size,
                    limit_price,
                    trigger_price: None,
                    trigger_condition: None,
                    reduce_only: o["reduceOnly"].as_bool().unwrap_or(false),
                });
            }
        }
        self.cached_open_orders.insert(address.to_string(), (orders.clone(), Instant::now()));
        Ok(orders)
    }

    async fn set_leverage(&mut self, symbol: &str, leverage: u32, is_cross: bool) -> Result<(), GatewayError> {
        let asset_idx = self.asset_index(symbol)?;
        let max_lev = self.asset_meta.get(&asset_idx).map(|m| m.max_leverage).unwrap_or(leverage);
        let clamped = leverage.min(max_lev).max(1);
        let nonce = chrono::Utc::now().timestamp_millis() as u64;
        let (sig, action_json) = sign_update_leverage_action(&self.private_key, asset_idx, is_cross, clamped, nonce)?;
        self.post_exchange(action_json, nonce, sig).await?;
        Ok(())
    }

    async fn place_market(
        &mut self,
        symbol: &str,
        side: Side,
        size: Decimal,
        reduce_only: bool,
    ) -> Result<SubmitOutcome, GatewayError> {
        let asset_idx = self.asset_index(symbol)?;
        let mid = self.mid_price(symbol).await?;
        let price = slippage_price(mid, side, DEFAULT_SLIPPAGE_PCT);
        let decimals = self.size_decimals(asset_idx);

        let order = OrderRequest {
            asset: asset_idx,
            is_buy: side.is_buy(),
            limit_px: decimal_to_wire(price, 6),
            sz: decimal_to_wire(size, decimals),
            reduce_only,
            tif: OrderTif::Limit { tif: "Ioc" },
        };
        self.submit_order(order, "na").await
    }

    async fn place_limit(
        &mut self,
        symbol: &str,
        side: Side,
        size: Decimal,
        limit_price: Decimal,
        reduce_only: bool,
        ioc: bool,
    ) -> Result<SubmitOutcome, GatewayError> {
        let asset_idx = self.asset_index(symbol)?;
        let decimals = self.size_decimals(asset_idx);
        let order = OrderRequest {
            asset: asset_idx,
            is_buy: side.is_buy(),
            limit_px: decimal_to_wire(round_to_5_sig_figs(limit_price), 6),
            sz: decimal_to_wire(size, decimals),
            reduce_only,
            tif: OrderTif::Limit { tif: if ioc { "Ioc" } else { "Gtc" } },
        };
        self.submit_order(order, "na").await
    }

    async fn place_trigger(
        &mut self,
        symbol: &str,
        side: Side,
        size: Decimal,
        trigger_price: Decimal,
        tpsl: TpSl,
        is_market: bool,
    ) -> Result<SubmitOutcome, GatewayError> {
        let asset_idx = self.asset_index(symbol)?;
        let decimals = self.size_decimals(asset_idx);
        let limit_price = slippage_price(trigger_price, side, TRIGGER_SLIPPAGE_PCT);

        let order = OrderRequest {
            asset: asset_idx,
            is_buy: side.is_buy(),
            limit_px: decimal_to_wire(limit_price, 6),
            sz: decimal_to_wire(size, decimals),
            reduce_only: true,
            tif: OrderTif::Trigger {
                is_market,
                trigger_px: decimal_to_wire(round_to_5_sig_figs(trigger_price), 6),
                tpsl: tpsl.wire_tag(),
            },
        };
        self.submit_order(order, "normalTpsl").await
    }

    async fn cancel(&mut self, symbol: &str, order_id: u64) -> Result<(), GatewayError> {
        let asset_idx = self.asset_index(symbol)?;
        let nonce = chrono::Utc::now().timestamp_millis() as u64;
        let (sig, action_json) = sign_cancel_action(&self.private_key, asset_idx, order_id, nonce)?;
        self.post_exchange(action_json, nonce, sig).await?;
        Ok(())
    }

    async fn cancel_all(&mut self, symbol: Option<&str>) -> Result<u64, GatewayError> {
        let orders = self.open_orders("").await.unwrap_or_default();
        let mut cancelled = 0u64;
        for order in orders {
            if let Some(sym) = symbol {
                if order.symbol != sym {
                    continue;
                }
            }
            if self.cancel(&order.symbol, order.order_id).await.is_ok() {
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }
}

// ─── Sim exchange (test double) ─────────────────────────────────────────────

pub struct SimExchange {
    pub balance: Decimal,
    pub positions: HashMap<String, Position>,
    pub orders: HashMap<u64, Order>,
    pub next_order_id: u64,
    pub metas: Vec<AssetMeta>,
}

impl SimExchange {
    pub fn new(balance: Decimal) -> Self {
        Self {
            balance,
            positions: HashMap::new(),
            orders: HashMap::new(),
            next_order_id: 1,
            metas: vec![
                AssetMeta { symbol: "BTC".to_string(), index: 0, size_decimals: 5, max_leverage: 50 },
                AssetMeta { symbol: "ETH".to_string(), index: 1, size_decimals: 4, max_leverage: 50 },
            ],
        }
    }
}

#[async_trait]
impl ExchangeGateway for SimExchange {
    async fn meta(&mut self) -> Result<Vec<AssetMeta>, GatewayError> {
        Ok(self.metas.clone())
    }

    async fn mid_price(&mut self, _symbol: &str) -> Result<Decimal, GatewayError> {
        Ok(Decimal::from(100))
    }

    async fn snapshot(&mut self, _address: &str) -> Result<AccountSnapshot, GatewayError> {
        Ok(AccountSnapshot {
            balance: self.balance,
            equity: self.balance,
            positions: self.positions.clone(),
            orders: self.orders.clone(),
            ts_ms: 0,
        })
    }

    async fn open_orders(&mut self, _address: &str) -> Result<Vec<Order>, GatewayError> {
        Ok(self.orders.values().cloned().collect())
    }

    async fn set_leverage(&mut self, _symbol: &str, _leverage: u32, _is_cross: bool) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn place_market(
        &mut self,
        symbol: &str,
        side: Side,
        size: Decimal,
        _reduce_only: bool,
    ) -> Result<SubmitOutcome, GatewayError> {
        let entry = self.positions.entry(symbol.to_string()).or_insert(Position {
            symbol: symbol.to_string(),
            signed_size: Decimal::ZERO,
            entry_price: Decimal::from(100),
            leverage: 1,
        });
        let delta = if side.is_buy() { size } else { -size };
        entry.signed_size += delta;
        let order_id = self.next_order_id;
        self.next_order_id += 1;
        Ok(SubmitOutcome::Filled { order_id, total_size: size, avg_price: Decimal::from(100) })
    }

    async fn place_limit(
        &mut self,
        symbol: &str,
        side: Side,
        size: Decimal,
        limit_price: Decimal,
        reduce_only: bool,
        _ioc: bool,
    ) -> Result<SubmitOutcome, GatewayError> {
        let order_id = self.next_order_id;
        self.next_order_id += 1;
        self.orders.insert(
            order_id,
            Order {
                order_id,
                symbol: symbol.to_string(),
                side,
                kind: OrderKind::Limit,
                size,
                limit_price: Some(limit_price),
                trigger_price: None,
                trigger_condition: None,
                reduce_only,
            },
        );
        Ok(SubmitOutcome::Resting { order_id })
    }

    async fn place_trigger(
        &mut self,
        symbol: &str,
        side: Side,
        size: Decimal,
        trigger_price: Decimal,
        tpsl: TpSl,
        _is_market: bool,
    ) -> Result<SubmitOutcome, GatewayError> {
        let order_id = self.next_order_id;
        self.next_order_id += 1;
        let condition = match tpsl {
            TpSl::TakeProfit if side.is_buy() => TriggerCondition::Le,
            TpSl::TakeProfit => TriggerCondition::Ge,
            TpSl::StopLoss if side.is_buy() => TriggerCondition::Ge,
            TpSl::StopLoss => TriggerCondition::Le,
        };
        self.orders.insert(
            order_id,
            Order {
                order_id,
                symbol: symbol.to_string(),
                side,
                kind: OrderKind::Trigger(tpsl),
                size,
                limit_price: None,
                trigger_price: Some(trigger_price),
                trigger_condition: Some(condition),
                reduce_only: true,
            },
        );
        Ok(SubmitOutcome::Resting { order_id })
    }

    async fn cancel(&mut self, _symbol: &str, order_id: u64) -> Result<(), GatewayError> {
        self.orders.remove(&order_id);
        Ok(())
    }

    async fn cancel_all(&mut self, symbol: Option<&str>) -> Result<u64, GatewayError> {
        let before = self.orders.len();
        match symbol {
            Some(sym) => self.orders.retain(|_, o| o.symbol != sym),
            None => self.orders.clear(),
        }
        Ok((before - self.orders.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn rounds_to_five_sig_figs() {
        assert_eq!(round_to_5_sig_figs(dec!(123456.789)), dec!(123460));
        assert_eq!(round_to_5_sig_figs(dec!(0.000123456)), dec!(0.00012346));
    }

    #[test]
    fn wire_strips_trailing_zeros() {
        assert_eq!(decimal_to_wire(dec!(1.50000000), 8), "1.5");
        assert_eq!(decimal_to_wire(dec!(100.00000000), 8), "100");
    }

    #[tokio::test]
    async fn sim_open_and_close_roundtrip() {
        let mut sim = SimExchange::new(dec!(1000));
        sim.place_market("BTC", Side::Buy, dec!(0.01), false).await.unwrap();
        assert_eq!(sim.positions["BTC"].signed_size, dec!(0.01));
        sim.place_market("BTC", Side::Sell, dec!(0.01), true).await.unwrap();
        assert_eq!(sim.positions["BTC"].signed_size, dec!(0.00));
    }
}
