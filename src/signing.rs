// signing.rs — EIP-712 Agent signing and action-hash computation for every
// exchange-mutating action this engine submits (order, cancel, updateLeverage).
//
// The signature verification path is unforgiving: the server re-msgpacks the
// JSON request body to recompute the hash, so the JSON's key insertion order
// must match the msgpack's field order exactly, and both must match what this
// module hashes and signs.
use ethers_core::types::{Address, H256, U256};
use ethers_core::utils::keccak256;
use ethers_signers::{LocalWallet, Signer};
use rmp_serde::Serializer;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::errors::GatewayError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signature {
    pub r: String,
    pub s: String,
    pub v: u8,
}

#[derive(Serialize)]
struct Agent {
    source: String,
    #[serde(rename = "connectionId")]
    connection_id: H256,
}

// ─── Order action (JSON wire types — camelCase, full field names) ─────────

#[derive(Clone)]
pub enum OrderTif {
    Limit { tif: &'static str },
    Trigger { is_market: bool, trigger_px: String, tpsl: &'static str },
}

#[derive(Clone)]
pub struct OrderRequest {
    pub asset: u32,
    pub is_buy: bool,
    pub limit_px: String,
    pub sz: String,
    pub reduce_only: bool,
    pub tif: OrderTif,
}

pub struct OrderAction {
    pub orders: Vec<OrderRequest>,
    pub grouping: &'static str,
}

// ─── MsgPack order wire types (abbreviated single-letter keys) ────────────

#[derive(Serialize)]
struct LimitMsgPack {
    tif: String,
}

#[derive(Serialize)]
struct TriggerMsgPack {
    #[serde(rename = "isMarket")]
    is_market: bool,
    #[serde(rename = "triggerPx")]
    trigger_px: String,
    tpsl: String,
}

#[derive(Serialize)]
enum OrderTypeMsgPack {
    #[serde(rename = "limit")]
    Limit(LimitMsgPack),
    #[serde(rename = "trigger")]
    Trigger(TriggerMsgPack),
}

#[derive(Serialize)]
struct OrderWireMsgPack {
    a: u32,
    b: bool,
    p: String,
    s: String,
    r: bool,
    t: OrderTypeMsgPack,
}

#[derive(Serialize)]
struct OrderActionMsgPack {
    r#type: String,
    orders: Vec<OrderWireMsgPack>,
    grouping: String,
}

#[derive(Serialize)]
struct CancelWireMsgPack {
    a: u32,
    o: u64,
}

#[derive(Serialize)]
struct CancelActionMsgPack {
    r#type: String,
    cancels: Vec<CancelWireMsgPack>,
}

#[derive(Serialize)]
struct UpdateLeverageMsgPack {
    r#type: String,
    asset: u32,
    #[serde(rename = "isCross")]
    is_cross: bool,
    leverage: u32,
}

fn order_to_msgpack(o: &OrderRequest) -> OrderWireMsgPack {
    let t = match &o.tif {
        OrderTif::Limit { tif } => OrderTypeMsgPack::Limit(LimitMsgPack { tif: tif.to_string() }),
        OrderTif::Trigger { is_market, trigger_px, tpsl } => OrderTypeMsgPack::Trigger(TriggerMsgPack {
            is_market: *is_market,
            trigger_px: trigger_px.clone(),
            tpsl: tpsl.to_string(),
        }),
    };
    OrderWireMsgPack {
        a: o.asset,
        b: o.is_buy,
        p: o.limit_px.clone(),
        s: o.sz.clone(),
        r: o.reduce_only,
        t,
    }
}

fn order_to_json(o: &OrderRequest) -> serde_json::Value {
    let mut order_map = serde_json::Map::new();
    order_map.insert("a".to_string(), serde_json::Value::from(o.asset));
    order_map.insert("b".to_string(), serde_json::Value::from(o.is_buy));
    order_map.insert("p".to_string(), serde_json::Value::from(o.limit_px.clone()));
    order_map.insert("s".to_string(), serde_json::Value::from(o.sz.clone()));
    order_map.insert("r".to_string(), serde_json::Value::from(o.reduce_only));

    let t_val = match &o.tif {
        OrderTif::Limit { tif } => {
            let mut tif_map = serde_json::Map::new();
            tif_map.insert("tif".to_string(), serde_json::Value::from(*tif));
            let mut limit_map = serde_json::Map::new();
            limit_map.insert("limit".to_string(), serde_json::Value::Object(tif_map));
            serde_json::Value::Object(limit_map)
        }
        OrderTif::Trigger { is_market, trigger_px, tpsl } => {
            let mut trig_map = serde_json::Map::new();
            trig_map.insert("isMarket".to_string(), serde_json::Value::from(*is_market));
            trig_map.insert("triggerPx".to_string(), serde_json::Value::from(trigger_px.clone()));
            trig_map.insert("tpsl".to_string(), serde_json::Value::from(*tpsl));
            let mut trigger_wrap = serde_json::Map::new();
            trigger_wrap.insert("trigger".to_string(), serde_json::Value::Object(trig_map));
            serde_json::Value::Object(trigger_wrap)
        }
    };
    order_map.insert("t".to_string(), t_val);
    serde_json::Value::Object(order_map)
}

/// keccak256(msgpack(action) || nonce_be8 || vault_flag[|| 20-byte vault addr])
fn action_hash(msgpack_bytes: &[u8], nonce: u64, vault_address: Option<&str>) -> [u8; 32] {
    let mut buf = msgpack_bytes.to_vec();
    buf.extend_from_slice(&nonce.to_be_bytes());
    match vault_address {
        None => buf.push(0x00),
        Some(addr) => {
            buf.push(0x01);
            let addr_clean = addr.strip_prefix("0x").unwrap_or(addr);
            if let Ok(bytes) = hex::decode(addr_clean) {
                buf.extend_from_slice(&bytes);
            }
        }
    }
    keccak256(&buf)
}

fn sign_digest(wallet: &LocalWallet, action_hash: [u8; 32]) -> Result<Signature, GatewayError> {
    let action_hash_h256 = H256::from(action_hash);

    let domain_separator = ethers_core::types::transaction::eip712::EIP712Domain {
        name: Some("Exchange".to_string()),
        version: Some("1".to_string()),
        chain_id: Some(U256::from(1337)),
        verifying_contract: Some(Address::zero()),
        salt: None,
    };
    let domain_hash = domain_separator.separator();

    let agent_type_hash = keccak256("Agent(string source,bytes32 connectionId)".as_bytes());
    let source_hash = keccak256("a".as_bytes());

    let mut encoded = Vec::new();
    encoded.extend_from_slice(&agent_type_hash);
    encoded.extend_from_slice(&source_hash);
    encoded.extend_from_slice(action_hash_h256.as_bytes());
    let struct_hash = keccak256(&encoded);

    let mut final_payload = Vec::new();
    final_payload.extend_from_slice(&[0x19, 0x01]);
    final_payload.extend_from_slice(&domain_hash);
    final_payload.extend_from_slice(&struct_hash);
    let final_digest = H256::from(keccak256(&final_payload));

    let sig = wallet
        .sign_hash(final_digest)
        .map_err(|e| GatewayError::Auth(e.to_string()))?;

    Ok(Signature {
        r: format!("0x{:0>64x}", sig.r),
        s: format!("0x{:0>64x}", sig.s),
        v: sig.v as u8,
    })
}

fn wallet_from_key(private_key: &str) -> Result<LocalWallet, GatewayError> {
    LocalWallet::from_str(private_key).map_err(|e| GatewayError::Auth(e.to_string()))
}

pub fn sign_order_action(
    private_key: &str,
    action: &OrderAction,
    nonce: u64,
) -> Result<(Signature, serde_json::Value), GatewayError> {
    let wallet = wallet_from_key(private_key)?;

    let msgpack_action = OrderActionMsgPack {
        r#type: "order".to_string(),
        orders: action.orders.iter().map(order_to_msgpack).collect(),
        grouping: action.grouping.to_string(),
    };
    let mut buf = Vec::new();
    let mut serializer = Serializer::new(&mut buf).with_struct_map();
    msgpack_action
        .serialize(&mut serializer)
        .map_err(|e| GatewayError::Invariant(format!("msgpack encode failed: {e}")))?;

    let hash = action_hash(&buf, nonce, None);
    let signature = sign_digest(&wallet, hash)?;

    let mut action_map = serde_json::Map::new();
    action_map.insert("type".to_string(), serde_json::Value::from("order"));
    action_map.insert(
        "orders".to_string(),
        serde_json::Value::Array(action.orders.iter().map(order_to_json).collect()),
    );
    action_map.insert("grouping".to_string(), serde_json::Value::from(action.grouping));

    Ok((signature, serde_json::Value::Object(action_map)))
}

pub fn sign_cancel_action(
    private_key: &str,
    asset: u32,
    oid: u64,
    nonce: u64,
) -> Result<(Signature, serde_json::Value), GatewayError> {
    let wallet = wallet_from_key(private_key)?;

    let msgpack_action = CancelActionMsgPack {
        r#type: "cancel".to_string(),
        cancels: vec![CancelWireMsgPack { a: asset, o: oid }],
    };
    let mut buf = Vec::new();
    let mut serializer = Serializer::new(&mut buf).with_struct_map();
    msgpack_action
        .serialize(&mut serializer)
        .map_err(|e| GatewayError::Invariant(format!("msgpack encode failed: {e}")))?;

    let hash = action_hash(&buf, nonce, None);
    let signature = sign_digest(&wallet, hash)?;

    let mut cancel_obj = serde_json::Map::new();
    cancel_obj.insert("a".to_string(), serde_json::Value::from(asset));
    cancel_obj.insert("o".to_string(), serde_json::Value::from(oid));

    let mut action_map = serde_json::Map::new();
    action_map.insert("type".to_string(), serde_json::Value::from("cancel"));
    action_map.insert(
        "cancels".to_string(),
        serde_json::Value::Array(vec![serde_json::Value::Object(cancel_obj)]),
    );

    Ok((signature, serde_json::Value::Object(action_map)))
}

pub fn sign_update_leverage_action(
    private_key: &str,
    asset: u32,
    is_cross: bool,
    leverage: u32,
    nonce: u64,
) -> Result<(Signature, serde_json::Value), GatewayError> {
    let wallet = wallet_from_key(private_key)?;

    let msgpack_action = UpdateLeverageMsgPack {
        r#type: "updateLeverage".to_string(),
        asset,
        is_cross,
        leverage,
    };
    let mut buf = Vec::new();
    let mut serializer = Serializer::new(&mut buf).with_struct_map();
    msgpack_action
        .serialize(&mut serializer)
        .map_err(|e| GatewayError::Invariant(format!("msgpack encode failed: {e}")))?;

    let hash = action_hash(&buf, nonce, None);
    let signature = sign_digest(&wallet, hash)?;

    let mut action_map = serde_json::Map::new();
    action_map.insert("type".to_string(), serde_json::Value::from("updateLeverage"));
    action_map.insert("asset".to_string(), serde_json::Value::from(asset));
    action_map.insert("isCross".to_string(), serde_json::Value::from(is_cross));
    action_map.insert("leverage".to_string(), serde_json::Value::from(leverage));

    Ok((signature, serde_json::Value::Object(action_map)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_json_key_order_matches_wire_spec() {
        let order = OrderRequest {
            asset: 0,
            is_buy: true,
            limit_px: "100.0".to_string(),
            sz: "0.01".to_string(),
            reduce_only: false,
            tif: OrderTif::Limit { tif: "Gtc" },
        };
        let json = order_to_json(&order);
        let keys: Vec<&String> = json.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["a", "b", "p", "s", "r", "t"]);
    }

    #[test]
    fn trigger_order_json_carries_tpsl_and_is_market() {
        let order = OrderRequest {
            asset: 1,
            is_buy: false,
            limit_px: "3800".to_string(),
            sz: "0.01".to_string(),
            reduce_only: true,
            tif: OrderTif::Trigger { is_market: false, trigger_px: "4000".to_string(), tpsl: "tp" },
        };
        let json = order_to_json(&order);
        let t = &json["t"]["trigger"];
        assert_eq!(t["tpsl"], "tp");
        assert_eq!(t["isMarket"], false);
        assert_eq!(t["triggerPx"], "4000");
    }

    #[test]
    fn action_hash_is_deterministic_for_identical_inputs() {
        let a = action_hash(b"abc", 42, None);
        let b = action_hash(b"abc", 42, None);
        assert_eq!(a, b);
    }

    #[test]
    fn action_hash_changes_with_vault_address() {
        let a = action_hash(b"abc", 42, None);
        let b = action_hash(b"abc", 42, Some("0x0000000000000000000000000000000000000001"));
        assert_ne!(a, b);
    }
}
