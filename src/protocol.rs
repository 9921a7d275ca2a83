//! Wire encoding and request dispatch.
//!
//! Each request is one JSON object; `action` selects what to do with it and
//! `type: "pubsub"` routes the request to the bus instead of the store.
//! Error text and response shapes are kept literal and stable so that
//! existing clients don't need to special-case this crate's responses.

use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::bus::{Bus, SubscriberId};
use crate::store::Store;

/// A single request frame, loosely typed: extra fields are simply ignored
/// by not looking at fields a given `action` doesn't use, and
/// `#[serde(default)]` lets every field be absent.
#[derive(Debug, Deserialize)]
pub(crate) struct Request {
    #[serde(default)]
    pub(crate) r#type: Option<String>,
    pub(crate) action: String,
    #[serde(default)]
    pub(crate) key: Option<String>,
    #[serde(default)]
    pub(crate) value: Option<String>,
    #[serde(default)]
    pub(crate) ttl: Option<Value>,
    #[serde(default)]
    pub(crate) channel: Option<String>,
    #[serde(default)]
    pub(crate) message: Option<Value>,
}

/// Validation/parse failures that surface as `{"error": ...}` with a
/// specific, stable message.
#[derive(Debug, Error)]
pub(crate) enum ProtocolError {
    #[error("Invalid JSON")]
    InvalidJson,
    #[error("frame too large")]
    FrameTooLarge,
    #[error("Invalid action")]
    InvalidAction,
    #[error("TTL not provided")]
    TtlNotProvided,
    #[error("TTL must be an integer")]
    TtlNotInteger,
    #[error("missing required field: {0}")]
    MissingField(&'static str),
}

/// What `dispatch` needs from the connection handling it: which subscriber
/// identity to register/remove pub/sub registrations under, and where to
/// push messages delivered to channels it is subscribed to.
pub(crate) struct DispatchContext<'a> {
    pub(crate) store: &'a Store,
    pub(crate) bus: &'a Bus,
    pub(crate) subscriber_id: SubscriberId,
    pub(crate) subscriber_tx: tokio::sync::mpsc::UnboundedSender<crate::bus::BusMessage>,
}

/// The response to send back to the client, plus whether this request was a
/// data-plane mutation that should trigger an immediate snapshot save.
/// `set` and `delete` always count once they reach the store; `set_with_ttl`
/// only counts once its TTL has parsed successfully.
pub(crate) struct Dispatched {
    pub(crate) response: Value,
    pub(crate) mutated: bool,
}

/// Decodes and routes one request: `type == "pubsub"` goes to the bus,
/// anything else goes to the store. The `db_updates` auto-publish is *not*
/// performed here — it happens via the store's observer sink (see
/// `server.rs`), so the dispatcher itself never needs to know about it.
pub(crate) fn dispatch(raw: &[u8], ctx: &DispatchContext<'_>) -> Dispatched {
    let request: Request = match serde_json::from_slice(raw) {
        Ok(request) => request,
        Err(_) => {
            return Dispatched {
                response: error_response(&ProtocolError::InvalidJson),
                mutated: false,
            }
        }
    };

    let is_pubsub = request.r#type.as_deref() == Some("pubsub");
    let response = if is_pubsub {
        dispatch_pubsub(&request, ctx)
    } else {
        dispatch_data(&request, ctx.store)
    };

    let mutated = !is_pubsub
        && response.is_ok()
        && matches!(request.action.as_str(), "set" | "set_with_ttl" | "delete");

    match response {
        Ok(value) => Dispatched { response: value, mutated },
        Err(err) => Dispatched {
            response: error_response(&err),
            mutated: false,
        },
    }
}

fn error_response(err: &ProtocolError) -> Value {
    json!({ "error": err.to_string() })
}

fn dispatch_data(request: &Request, store: &Store) -> Result<Value, ProtocolError> {
    match request.action.as_str() {
        "get" => {
            let key = require_key(request)?;
            let (value, ttl_remaining) = store.get(key);
            Ok(json!({ "result": value, "ttl_remaining": ttl_remaining }))
        }
        "set" => {
            let key = require_key(request)?.to_string();
            let value = request.value.clone().unwrap_or_default();
            store.set(key, value, None);
            Ok(json!({ "result": "OK" }))
        }
        "set_with_ttl" => {
            let key = require_key(request)?.to_string();
            let value = request.value.clone().unwrap_or_default();
            let ttl = parse_ttl(request)?;
            store.set(key, value, Some(tokio::time::Duration::from_secs(ttl)));
            Ok(json!({ "result": "OK", "ttl_set": ttl }))
        }
        "delete" => {
            let key = require_key(request)?;
            let existed = store.delete(key);
            Ok(json!({ "result": if existed { "OK" } else { "Key not found" } }))
        }
        "keys" => Ok(json!({ "result": store.keys() })),
        _ => Err(ProtocolError::InvalidAction),
    }
}

fn dispatch_pubsub(request: &Request, ctx: &DispatchContext<'_>) -> Result<Value, ProtocolError> {
    match request.action.as_str() {
        "subscribe" => {
            let channel = require_channel(request)?;
            ctx.bus
                .subscribe(channel, ctx.subscriber_id, ctx.subscriber_tx.clone());
            Ok(json!({ "result": "OK", "action": "subscribe", "channel": channel }))
        }
        "unsubscribe" => {
            let channel = require_channel(request)?;
            let changed = ctx.bus.unsubscribe(channel, ctx.subscriber_id);
            Ok(json!({
                "result": if changed { "OK" } else { "ERROR" },
                "action": "unsubscribe",
                "channel": channel,
            }))
        }
        "publish" => {
            let channel = require_channel(request)?;
            let message = request.message.clone().ok_or(ProtocolError::MissingField("message"))?;
            let delivered = ctx.bus.publish(channel, message);
            Ok(json!({
                "result": if delivered { "OK" } else { "ERROR" },
                "action": "publish",
                "channel": channel,
            }))
        }
        "broadcast" => {
            let message = request.message.clone().ok_or(ProtocolError::MissingField("message"))?;
            ctx.bus.broadcast(message);
            Ok(json!({ "result": "OK", "action": "broadcast" }))
        }
        "list_channels" => Ok(json!({
            "result": "OK",
            "action": "list_channels",
            "channels": ctx.bus.list_channels(),
        })),
        "list_subscribers" => {
            let channel = require_channel(request)?;
            let count = ctx.bus.list_subscribers(channel);
            Ok(json!({
                "result": "OK",
                "action": "list_subscribers",
                "channel": channel,
                "count": count,
            }))
        }
        _ => Err(ProtocolError::InvalidAction),
    }
}

fn require_key(request: &Request) -> Result<&str, ProtocolError> {
    request.key.as_deref().ok_or(ProtocolError::MissingField("key"))
}

fn require_channel(request: &Request) -> Result<&str, ProtocolError> {
    request.channel.as_deref().ok_or(ProtocolError::MissingField("channel"))
}

fn parse_ttl(request: &Request) -> Result<u64, ProtocolError> {
    match &request.ttl {
        None => Err(ProtocolError::TtlNotProvided),
        Some(Value::Null) => Err(ProtocolError::TtlNotProvided),
        Some(Value::Number(n)) => n.as_u64().filter(|v| *v > 0).ok_or(ProtocolError::TtlNotInteger),
        Some(_) => Err(ProtocolError::TtlNotInteger),
    }
}

/// The `{operation, key, timestamp}` envelope published on `db_updates`
/// after every successful mutation.
pub(crate) fn db_update_message(operation: &str, key: &str) -> Value {
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64();
    json!({ "operation": operation, "key": key, "timestamp": timestamp })
}
