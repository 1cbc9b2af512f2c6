//! Wire protocol — line-delimited JSON frames exchanged with peers.
//!
//! Every frame is a JSON object with a required `type` field. Unknown
//! types deserialize to [`ClientFrame::Unknown`] and are dropped by the
//! caller; unknown fields are ignored everywhere.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Frames a peer may send to the server.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    #[serde(rename = "auth")]
    Auth(AuthPayload),
    #[serde(rename = "state")]
    State(StatePayload),
    #[serde(rename = "change")]
    Change(ChangePayload),
    #[serde(rename = "event")]
    Event(EventPayload),
    #[serde(rename = "keepalive")]
    Keepalive(KeepalivePayload),
    #[serde(rename = "command_response")]
    CommandResponse(CommandResponsePayload),
    #[serde(other)]
    Unknown,
}

/// Frames the server may send to a peer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "auth_response")]
    AuthResponse(AuthResponsePayload),
    #[serde(rename = "keepalive")]
    Keepalive(KeepalivePayload),
    #[serde(rename = "command")]
    Command(CommandPayload),
    #[serde(rename = "config_update")]
    ConfigUpdate(ConfigUpdatePayload),
}

/// Peer authenticates with the server. Must be the first frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthPayload {
    pub identifier: String,
    pub token: String,
    pub version: String,
    pub protocol_version: u32,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponsePayload {
    /// "success" or "error".
    pub status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    pub server_time: String,
}

/// Full state snapshot. Top-level keys are component identifiers
/// ("battery:0", "vehicle", "engine-ecu"); values hold the component's
/// fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StatePayload {
    pub data: Map<String, Value>,
    pub timestamp: String,
}

/// Field-level deltas, same nesting as [`StatePayload`]. Only changed
/// fields need to be present per component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangePayload {
    pub changes: Map<String, Value>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EventPayload {
    pub event: String,
    pub data: Option<Map<String, Value>>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepalivePayload {
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandPayload {
    pub request_id: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub params: Map<String, Value>,
    pub timestamp: String,
}

/// Peer's reply to a command. `status` is "success", "error" or
/// "running"; kept as a plain string so unrecognized values round-trip.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandResponsePayload {
    pub request_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigUpdatePayload {
    pub config: Map<String, Value>,
    pub timestamp: String,
}

/// Current time as a UTC RFC-3339 string, the format used in every
/// frame timestamp.
pub fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl ServerFrame {
    pub fn keepalive() -> Self {
        ServerFrame::Keepalive(KeepalivePayload {
            timestamp: timestamp(),
        })
    }

    pub fn auth_success() -> Self {
        ServerFrame::AuthResponse(AuthResponsePayload {
            status: "success".to_string(),
            error: String::new(),
            server_time: timestamp(),
        })
    }

    pub fn auth_error(reason: impl Into<String>) -> Self {
        ServerFrame::AuthResponse(AuthResponsePayload {
            status: "error".to_string(),
            error: reason.into(),
            server_time: timestamp(),
        })
    }
}
