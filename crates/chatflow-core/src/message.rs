use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    Text,
    Join,
    Leave,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "TEXT",
            MessageType::Join => "JOIN",
            MessageType::Leave => "LEAVE",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TEXT" => Ok(MessageType::Text),
            "JOIN" => Ok(MessageType::Join),
            "LEAVE" => Ok(MessageType::Leave),
            other => anyhow::bail!("unknown message type: {other}"),
        }
    }
}

/// One synthetic chat message as it goes over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub user_id: u32,
    pub username: String,
    pub message: String,
    #[serde(with = "millis_rfc3339")]
    pub timestamp: DateTime<Utc>,
    pub message_type: MessageType,
}

impl ChatMessage {
    pub fn new(user_id: u32, message: String, message_type: MessageType) -> Self {
        Self {
            user_id,
            username: format!("user{user_id}"),
            message,
            timestamp: Utc::now().trunc_subsecs(3),
            message_type,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn echo_key(&self) -> EchoKey {
        EchoKey {
            user_id: self.user_id,
            message: self.message.clone(),
        }
    }
}

/// Fields the server echoes back that identify which request a response answers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EchoKey {
    pub user_id: u32,
    pub message: String,
}

/// Final classification of one delivery attempt, as written to the metrics CSV.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    Error,
    Timeout,
    ConnectionClosed,
    Unknown,
}

impl ResponseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseStatus::Success => "success",
            ResponseStatus::Error => "error",
            ResponseStatus::Timeout => "timeout",
            ResponseStatus::ConnectionClosed => "connection_closed",
            ResponseStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server reply: an echo of the accepted message, or an error payload listing
/// validation violations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub status: Option<String>,
    pub user_id: Option<u32>,
    pub username: Option<String>,
    pub message: Option<String>,
    pub message_type: Option<String>,
    pub server_timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl ChatResponse {
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn status(&self) -> ResponseStatus {
        match self.status.as_deref() {
            Some(s) if s.eq_ignore_ascii_case("success") => ResponseStatus::Success,
            Some(s) if s.eq_ignore_ascii_case("error") => ResponseStatus::Error,
            _ => ResponseStatus::Unknown,
        }
    }

    pub fn echo_key(&self) -> Option<EchoKey> {
        match (self.user_id, &self.message) {
            (Some(user_id), Some(message)) => Some(EchoKey {
                user_id,
                message: message.clone(),
            }),
            _ => None,
        }
    }
}

/// ISO-8601 UTC with exactly three fractional digits, e.g. `2024-05-01T12:00:00.123Z`.
mod millis_rfc3339 {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}
