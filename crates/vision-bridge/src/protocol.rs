//! Wire protocol types and the tolerant JSON codec.
//!
//! Every frame is one JSON object tagged by `type` and carrying `timestamp`
//! (millisecond epoch) and `id` (UUID). Inbound frames from legacy clients
//! may omit the base fields, nest handshake details under `payload`, or use
//! `session_id` instead of `sessionId`; `decode` normalizes all of that
//! before typing so the rest of the crate only ever sees one shape.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::util::{new_id, now_ms};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("frame has no message type")]
    MissingType,
    #[error("unknown message type `{0}`")]
    UnknownType(String),
    #[error("invalid {kind} message: {reason}")]
    Invalid { kind: &'static str, reason: String },
}

// ── Message shapes ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(flatten)]
    pub body: WireBody,
    pub timestamp: u64,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireBody {
    ClientHandshake(Handshake),
    ConnectionAccepted { payload: AcceptedPayload },
    ConnectionRejected { reason: String },
    #[serde(rename = "AIConversation")]
    AiConversation(Conversation),
    AskResponse { payload: AskPayload },
    TriggerSend { payload: TriggerPayload },
    Ping,
    Pong,
    Echo { payload: EchoPayload },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub client_type: String,
    pub version: String,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedPayload {
    pub connection_id: String,
    pub server_info: ServerInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
    pub platform: String,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub payload: ConversationPayload,
    // Streaming extension fields, message-level by contract with the clients.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_streaming: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_final: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationPayload {
    pub session_id: String,
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// Accepted inbound for tolerance; nothing host-side consumes it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AskPayload {
    pub session_id: String,
    pub ask_response: AskResponseKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AskResponseKind {
    YesButtonClicked,
    NoButtonClicked,
    MessageResponse,
    ObjectResponse,
}

impl AskResponseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::YesButtonClicked => "yesButtonClicked",
            Self::NoButtonClicked => "noButtonClicked",
            Self::MessageResponse => "messageResponse",
            Self::ObjectResponse => "objectResponse",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerPayload {
    pub session_id: String,
    pub action: TriggerAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerAction {
    Send,
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EchoPayload {
    pub message: String,
}

// ── Construction and classification ──────────────────────────────────────────

impl WireMessage {
    /// Wrap a body with a fresh timestamp and id.
    pub fn new(body: WireBody) -> Self {
        Self {
            body,
            timestamp: now_ms(),
            id: new_id(),
        }
    }

    pub fn pong() -> Self {
        Self::new(WireBody::Pong)
    }

    pub fn ping() -> Self {
        Self::new(WireBody::Ping)
    }

    pub fn echo(message: impl Into<String>) -> Self {
        Self::new(WireBody::Echo {
            payload: EchoPayload {
                message: message.into(),
            },
        })
    }

    pub fn connection_rejected(reason: impl Into<String>) -> Self {
        Self::new(WireBody::ConnectionRejected {
            reason: reason.into(),
        })
    }

    pub fn connection_accepted(connection_id: impl Into<String>, server_info: ServerInfo) -> Self {
        Self::new(WireBody::ConnectionAccepted {
            payload: AcceptedPayload {
                connection_id: connection_id.into(),
                server_info,
            },
        })
    }

    pub fn kind(&self) -> &'static str {
        self.body.kind()
    }
}

impl WireBody {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ClientHandshake(_) => "ClientHandshake",
            Self::ConnectionAccepted { .. } => "ConnectionAccepted",
            Self::ConnectionRejected { .. } => "ConnectionRejected",
            Self::AiConversation(_) => "AIConversation",
            Self::AskResponse { .. } => "AskResponse",
            Self::TriggerSend { .. } => "TriggerSend",
            Self::Ping => "Ping",
            Self::Pong => "Pong",
            Self::Echo { .. } => "Echo",
        }
    }

    /// Heartbeat and echo traffic, kept out of telemetry.
    pub fn is_system(&self) -> bool {
        matches!(self, Self::Ping | Self::Pong | Self::Echo { .. })
    }

    /// The three handshake variants.
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            Self::ClientHandshake(_) | Self::ConnectionAccepted { .. } | Self::ConnectionRejected { .. }
        )
    }

    /// Messages dispatched to the AI bridge.
    pub fn is_ai(&self) -> bool {
        matches!(
            self,
            Self::AiConversation(_) | Self::AskResponse { .. } | Self::TriggerSend { .. }
        )
    }
}

// ── Codec ────────────────────────────────────────────────────────────────────

fn known_kind(kind: &str) -> Option<&'static str> {
    match kind {
        "ClientHandshake" => Some("ClientHandshake"),
        "ConnectionAccepted" => Some("ConnectionAccepted"),
        "ConnectionRejected" => Some("ConnectionRejected"),
        "AIConversation" => Some("AIConversation"),
        "AskResponse" => Some("AskResponse"),
        "TriggerSend" => Some("TriggerSend"),
        "Ping" => Some("Ping"),
        "Pong" => Some("Pong"),
        "Echo" => Some("Echo"),
        _ => None,
    }
}

/// Serialize a message to one text frame.
pub fn encode(message: &WireMessage) -> Result<String, CodecError> {
    Ok(serde_json::to_string(message)?)
}

/// Parse, normalize and validate one inbound frame.
pub fn decode(text: &str) -> Result<WireMessage, CodecError> {
    let mut value: Value = serde_json::from_str(text)?;
    let obj = value.as_object_mut().ok_or(CodecError::NotAnObject)?;
    let kind = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or(CodecError::MissingType)
        .map(str::to_string)?;
    let kind = known_kind(&kind).ok_or(CodecError::UnknownType(kind))?;

    backfill_base_fields(obj);
    match kind {
        "ClientHandshake" => normalize_handshake(obj),
        "AIConversation" => normalize_conversation(obj),
        _ => {}
    }

    serde_json::from_value(value).map_err(|e| CodecError::Invalid {
        kind,
        reason: e.to_string(),
    })
}

/// Legacy clients omit `timestamp` and `id`; fill them in rather than reject.
fn backfill_base_fields(obj: &mut Map<String, Value>) {
    let missing = |v: Option<&Value>| v.is_none() || v == Some(&Value::Null);
    if missing(obj.get("timestamp")) {
        obj.insert("timestamp".to_string(), json!(now_ms()));
    }
    if missing(obj.get("id")) {
        obj.insert("id".to_string(), json!(new_id()));
    }
}

/// Handshakes arrive either with top-level details or nested under `payload`.
/// Hoist the nested form and apply defaults so both shapes type identically.
fn normalize_handshake(obj: &mut Map<String, Value>) {
    let nested = obj.remove("payload");
    if let Some(Value::Object(payload)) = nested {
        for key in ["clientType", "version", "capabilities"] {
            if !obj.contains_key(key) {
                if let Some(v) = payload.get(key) {
                    obj.insert(key.to_string(), v.clone());
                }
            }
        }
    }
    obj.entry("clientType").or_insert_with(|| json!("visionOS"));
    obj.entry("version").or_insert_with(|| json!("1.0.0"));
    obj.entry("capabilities").or_insert_with(|| json!([]));
}

/// Accommodate snake_case clients: `payload.session_id` → `payload.sessionId`.
fn normalize_conversation(obj: &mut Map<String, Value>) {
    if let Some(Value::Object(payload)) = obj.get_mut("payload") {
        if !payload.contains_key("sessionId") {
            if let Some(v) = payload.remove("session_id") {
                payload.insert("sessionId".to_string(), v);
            }
        }
    }
}
