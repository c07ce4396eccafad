// WebSocket wire framing: JSON envelopes `{type, timestamp, data?, error?,
// request_id?}` plus the client-side subscribe/ping/pong messages and the
// upgrade version gate.

use crate::error::{Error, Result};
use crate::types::Event;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Maximum inbound message size (512 KiB).
pub const MAX_MESSAGE_BYTES: usize = 512 * 1024;

/// Close reason sent when the client version is too old.
pub const CLOSE_VERSION_INCOMPATIBLE: &str = "version_incompatible";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl WsEnvelope {
    pub fn event(event: &Event) -> Self {
        WsEnvelope {
            kind: event.event_type.wire_name().to_string(),
            timestamp: event.timestamp,
            data: Some(serde_json::json!({
                "topic": event.topic,
                "sequence": event.sequence,
                "repository": event.repository,
                "payload": event.payload,
            })),
            error: None,
            request_id: event.request_id.clone(),
        }
    }

    pub fn system(message: impl Into<String>) -> Self {
        WsEnvelope {
            kind: "system.message".into(),
            timestamp: Utc::now(),
            data: Some(serde_json::json!({"message": message.into()})),
            error: None,
            request_id: None,
        }
    }

    pub fn error(message: impl Into<String>, request_id: Option<String>) -> Self {
        WsEnvelope {
            kind: "error".into(),
            timestamp: Utc::now(),
            data: None,
            error: Some(message.into()),
            request_id,
        }
    }

    pub fn ping() -> Self {
        WsEnvelope { kind: "ping".into(), timestamp: Utc::now(), data: None, error: None, request_id: None }
    }

    pub fn pong() -> Self {
        WsEnvelope { kind: "pong".into(), timestamp: Utc::now(), data: None, error: None, request_id: None }
    }
}

/// Subscription request: repositories and event types to receive, plus
/// per-topic cursors for replay after a reconnect.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscribeRequest {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub repositories: Vec<String>,
    #[serde(default)]
    pub event_types: Vec<String>,
    /// topic → last sequence the client acknowledged.
    #[serde(default)]
    pub last_sequences: HashMap<String, u64>,
}

/// Parsed inbound client message.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Subscribe(SubscribeRequest),
    Ping { request_id: Option<String> },
    Pong,
}

/// Parse one inbound frame. Oversized or malformed frames return an error
/// the caller reports back on the socket.
pub fn parse_client_message(text: &str) -> Result<ClientMessage> {
    if text.len() > MAX_MESSAGE_BYTES {
        return Err(Error::validation(format!(
            "message exceeds {} bytes",
            MAX_MESSAGE_BYTES
        )));
    }
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| Error::validation(format!("malformed frame: {}", e)))?;
    match value["type"].as_str() {
        Some("subscribe") => {
            let request: SubscribeRequest = serde_json::from_value(value)
                .map_err(|e| Error::validation(format!("malformed subscribe: {}", e)))?;
            Ok(ClientMessage::Subscribe(request))
        }
        Some("ping") => Ok(ClientMessage::Ping {
            request_id: value["request_id"].as_str().map(String::from),
        }),
        Some("pong") => Ok(ClientMessage::Pong),
        Some(other) => Err(Error::validation(format!("unknown message type '{}'", other))),
        None => Err(Error::validation("missing message type")),
    }
}

/// Validate the client-version header at upgrade time. Missing or
/// incompatible versions are rejected with a structured close reason.
pub fn check_client_version(header: Option<&str>, minimum: u32) -> Result<u32> {
    let raw = header.ok_or_else(|| Error::validation(CLOSE_VERSION_INCOMPATIBLE))?;
    // Accept either "3" or a dotted "3.1.4" — the major version decides
    let major = raw
        .split('.')
        .next()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .ok_or_else(|| Error::validation(CLOSE_VERSION_INCOMPATIBLE))?;
    if major < minimum {
        return Err(Error::validation(CLOSE_VERSION_INCOMPATIBLE));
    }
    Ok(major)
}

// ── Tests ──────────────────────────────────────────────────────────────────
