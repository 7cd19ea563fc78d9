use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    serde_json::Value,
};

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
}

// ── Message type ─────────────────────────────────────────────────────────────

/// Discriminator carried in the `type` field.
///
/// Strings outside the known set decode into [`MessageType::Other`] and are
/// written back verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    Notification,
    RoadmapReady,
    QuizReady,
    ChatMessage,
    LatencyReport,
    #[default]
    Unknown,
    Other(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Notification => "notification",
            Self::RoadmapReady => "roadmap_ready",
            Self::QuizReady => "quiz_ready",
            Self::ChatMessage => "chat_message",
            Self::LatencyReport => "latency_report",
            Self::Unknown => "unknown",
            Self::Other(s) => s,
        }
    }
}

impl From<String> for MessageType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "notification" => Self::Notification,
            "roadmap_ready" => Self::RoadmapReady,
            "quiz_ready" => Self::QuizReady,
            "chat_message" => Self::ChatMessage,
            "latency_report" => Self::LatencyReport,
            "unknown" | "" => Self::Unknown,
            _ => Self::Other(s),
        }
    }
}

impl From<&str> for MessageType {
    fn from(s: &str) -> Self {
        Self::from(s.to_string())
    }
}

impl From<MessageType> for String {
    fn from(t: MessageType) -> Self {
        match t {
            MessageType::Other(s) => s,
            known => known.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Envelope ─────────────────────────────────────────────────────────────────

/// A routed message.
///
/// Wire shape: `{"type", "payload", "receiverID", "senderId"?, "timestamp"?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type", default)]
    pub kind: MessageType,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "receiverID", default)]
    pub receiver_id: String,
    /// Empty for system-originated messages.
    #[serde(rename = "senderId", default, skip_serializing_if = "String::is_empty")]
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Payload of a `latency_report` message.
#[derive(Debug, Clone, Copy, Deserialize)]
struct LatencyPayload {
    #[serde(rename = "latencyMs")]
    latency_ms: f64,
}

impl Envelope {
    pub fn new(kind: impl Into<MessageType>, receiver_id: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            receiver_id: receiver_id.into(),
            sender_id: String::new(),
            timestamp: None,
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(ProtocolError::Decode)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    /// Overwrite sender and timestamp on an envelope received from a client.
    pub fn stamp(&mut self, sender_id: &str, now: DateTime<Utc>) {
        self.sender_id = sender_id.to_string();
        self.timestamp = Some(now);
    }

    pub fn has_receiver(&self) -> bool {
        !self.receiver_id.is_empty()
    }

    /// Client-measured latency carried by a `latency_report`, if well formed.
    pub fn latency_ms(&self) -> Option<f64> {
        if self.kind != MessageType::LatencyReport {
            return None;
        }
        serde_json::from_value::<LatencyPayload>(self.payload.clone())
            .ok()
            .map(|p| p.latency_ms)
            .filter(|ms| ms.is_finite() && *ms >= 0.0)
    }
}
