use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub type UserId = i64;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Specialist,
}

/// Control verbs understood by the relay. Anything else decodes to `Unknown`
/// so a new client verb never kills the connection.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
    End,
    Ping,
    Pong,
    Error,
    #[serde(other)]
    Unknown,
}

/// Machine-readable codes carried in relay-synthesized `error` frames.
pub mod error_code {
    pub const USER_UNAVAILABLE: &str = "user_unavailable";
    pub const INVALID_MESSAGE: &str = "invalid_message";
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    #[serde(default)]
    pub session_id: String,
    // Overwritten by the relay with the identity bound to the connection
    #[serde(default)]
    pub from: UserId,
    // Absent on keepalive frames; routed kinds without it are rejected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub appointment_id: Option<i64>,
    // The SDP blob, ICE candidate or error body. Never inspected by the relay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl SignalMessage {
    pub fn new(kind: SignalKind, session_id: impl Into<String>, from: UserId, to: UserId) -> Self {
        Self {
            kind,
            session_id: session_id.into(),
            from,
            to: Some(to),
            appointment_id: None,
            data: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Builds a relay-originated `error` addressed to `to`.
    pub fn error(session_id: impl Into<String>, from: UserId, to: UserId, code: &str, message: &str) -> Self {
        Self::new(SignalKind::Error, session_id, from, to)
            .with_data(json!({ "code": code, "message": message }))
    }

    pub fn decode(frame: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(frame)
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Pins `from` to the authenticated identity and `timestamp` to now,
    /// discarding whatever the client claimed.
    pub fn stamped(mut self, sender: UserId) -> Self {
        self.from = sender;
        self.timestamp = Utc::now();
        self
    }
}
