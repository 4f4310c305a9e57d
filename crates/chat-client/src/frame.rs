//! Engine.IO v4 / Socket.IO v5 text frame codec.
//!
//! Only the subset a websocket-only client needs: open, ping/pong, close,
//! namespace connect/disconnect, events and connect errors. Binary
//! attachments and acknowledgements are not used by the chat protocol.

use chat_core::{ChatError, ChatErrorCategory, OutboundEvent};
use serde::Deserialize;
use serde_json::{Value, json};

/// Reply to an Engine.IO ping.
pub const PONG: &str = "3";

/// Handshake parameters from the Engine.IO open packet.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenPacket {
    pub sid: String,
    /// Milliseconds between server pings.
    pub ping_interval: u64,
    /// Milliseconds the server waits for a pong.
    pub ping_timeout: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Open(OpenPacket),
    Close,
    Ping,
    Pong,
    Noop,
    /// Namespace connect acknowledged.
    Connected { namespace: String },
    Disconnected { namespace: String },
    Event {
        namespace: String,
        name: String,
        payload: Value,
    },
    ConnectError { namespace: String, message: String },
}

fn protocol_error(message: impl Into<String>) -> ChatError {
    ChatError::new(ChatErrorCategory::Protocol, "socket_frame_error", message)
}

/// Decode one websocket text frame.
pub fn decode(text: &str) -> Result<Frame, ChatError> {
    let mut chars = text.chars();
    let Some(kind) = chars.next() else {
        return Err(protocol_error("empty frame"));
    };
    let rest = chars.as_str();

    match kind {
        '0' => serde_json::from_str(rest)
            .map(Frame::Open)
            .map_err(|err| protocol_error(format!("invalid open packet: {err}"))),
        '1' => Ok(Frame::Close),
        '2' => Ok(Frame::Ping),
        '3' => Ok(Frame::Pong),
        '6' => Ok(Frame::Noop),
        '4' => decode_socket_packet(rest),
        other => Err(protocol_error(format!("unsupported packet type '{other}'"))),
    }
}

fn decode_socket_packet(packet: &str) -> Result<Frame, ChatError> {
    let mut chars = packet.chars();
    let Some(kind) = chars.next() else {
        return Err(protocol_error("empty socket.io packet"));
    };
    let (namespace, body) = split_namespace(chars.as_str());

    match kind {
        '0' => Ok(Frame::Connected { namespace }),
        '1' => Ok(Frame::Disconnected { namespace }),
        '2' => {
            let body = body.trim_start_matches(|c: char| c.is_ascii_digit());
            let args: Vec<Value> = serde_json::from_str(body)
                .map_err(|err| protocol_error(format!("invalid event body: {err}")))?;
            let mut args = args.into_iter();
            let Some(Value::String(name)) = args.next() else {
                return Err(protocol_error("event without a name"));
            };
            Ok(Frame::Event {
                namespace,
                name,
                payload: args.next().unwrap_or(Value::Null),
            })
        }
        '4' => {
            let message = serde_json::from_str::<Value>(body)
                .ok()
                .and_then(|value| match value {
                    Value::String(message) => Some(message),
                    Value::Object(map) => map
                        .get("message")
                        .and_then(Value::as_str)
                        .map(str::to_owned),
                    _ => None,
                })
                .unwrap_or_else(|| body.to_owned());
            Ok(Frame::ConnectError { namespace, message })
        }
        other => Err(protocol_error(format!(
            "unsupported socket.io packet type '{other}'"
        ))),
    }
}

/// Split an optional `/namespace,` prefix off a socket.io packet body.
fn split_namespace(body: &str) -> (String, &str) {
    if body.starts_with('/')
        && let Some((namespace, rest)) = body.split_once(',')
    {
        return (namespace.to_owned(), rest);
    }
    ("/".to_owned(), body)
}

fn namespace_prefix(namespace: &str) -> String {
    if namespace == "/" || namespace.is_empty() {
        String::new()
    } else {
        format!("{namespace},")
    }
}

/// Socket.IO `CONNECT` for `namespace` carrying the auth payload.
pub fn encode_connect(namespace: &str, auth: &Value) -> String {
    format!("40{}{auth}", namespace_prefix(namespace))
}

/// Socket.IO `EVENT` frame for an outbound chat event.
pub fn encode_event(namespace: &str, event: &OutboundEvent) -> String {
    let args = json!([event.name(), event.payload()]);
    format!("42{}{args}", namespace_prefix(namespace))
}
