//! Proxy control messages
//!
//! The wire format the proxy itself uses to signal authentication failures,
//! protocol errors, and upstream state to downstream clients. Relayed daemon
//! traffic never passes through these types; it is forwarded verbatim.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

/// Control message types emitted by the proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyMessageType {
    /// Client authentication succeeded; the session is registered
    ProxyAuthSuccess,
    /// Client authentication was rejected
    ProxyAuthFailed,
    /// Client frame was not valid JSON
    ProxyMessageInvalid,
    /// Client frame was JSON but not a daemon API request
    RequestInvalid,
    /// Upstream link is connected and relaying
    UpstreamReady,
    /// Upstream link was lost
    UpstreamDisconnected,
    /// Upstream reconnect has been scheduled
    UpstreamReconnecting,
    /// A client request could not be relayed or timed out
    UpstreamRequestFailed,
}

/// Authentication rejection codes sent to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyAuthError {
    /// No token was attached to the connection
    MissingToken,
    /// Token was present but malformed or did not match the secret
    InvalidToken,
}

/// Control message envelope.
///
/// Serialized as `{"type": ..., "timestamp": <unix-seconds>, "data": ...}`;
/// `data` is omitted when absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyMessage {
    #[serde(rename = "type")]
    pub message_type: ProxyMessageType,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ProxyMessage {
    /// Create a control message with the current timestamp
    pub fn new(message_type: ProxyMessageType, data: Option<Value>) -> Self {
        Self {
            message_type,
            timestamp: Utc::now().timestamp(),
            data,
        }
    }

    /// Acknowledges a successful authentication with the assigned session id
    pub fn auth_success(session_id: Uuid) -> Self {
        Self::new(
            ProxyMessageType::ProxyAuthSuccess,
            Some(json!({ "sessionId": session_id })),
        )
    }

    /// Authentication rejection notification
    pub fn auth_failed(code: ProxyAuthError) -> Self {
        Self::new(
            ProxyMessageType::ProxyAuthFailed,
            Some(json!({ "code": code })),
        )
    }

    /// Notification for a client frame that was not valid JSON
    pub fn message_invalid(message: &str, error: &str) -> Self {
        Self::new(
            ProxyMessageType::ProxyMessageInvalid,
            Some(json!({ "message": message, "error": error })),
        )
    }

    /// Notification for a JSON frame that is not a daemon API request.
    /// The payload is the offending text.
    pub fn request_invalid(message: &str) -> Self {
        Self::new(
            ProxyMessageType::RequestInvalid,
            Some(Value::String(message.to_string())),
        )
    }

    /// Upstream link is connected and accepting requests
    pub fn upstream_ready() -> Self {
        Self::new(ProxyMessageType::UpstreamReady, None)
    }

    /// Upstream link was lost
    pub fn upstream_disconnected() -> Self {
        Self::new(ProxyMessageType::UpstreamDisconnected, None)
    }

    /// Upstream reconnect scheduled after `delay` seconds
    pub fn upstream_reconnecting(attempt: u32, delay: f64) -> Self {
        Self::new(
            ProxyMessageType::UpstreamReconnecting,
            Some(json!({ "attempt": attempt, "delay": delay })),
        )
    }

    /// A client request could not be relayed, or its response never arrived
    pub fn request_failed(msg_id: &str) -> Self {
        Self::new(
            ProxyMessageType::UpstreamRequestFailed,
            Some(json!({ "msgId": msg_id })),
        )
    }

    /// Serialize to a JSON string.
    ///
    /// The envelope contains only types that serialize infallibly.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}
