use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A pending side effect waiting to be relayed to an external sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: String,
    pub channel: String,
    pub payload: Vec<u8>,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}

impl OutboxRecord {
    pub fn new(channel: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            channel: channel.into(),
            payload: payload.into(),
            attempts: 0,
            created_at: Utc::now(),
        }
    }

    /// Record whose payload is `value` rendered as JSON.
    pub fn json<T: Serialize>(channel: impl Into<String>, value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(channel, serde_json::to_vec(value)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Done,
    /// Permanently failed; never handed out again.
    Dead,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Done => "done",
            Self::Dead => "dead",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "done" => Some(Self::Done),
            "dead" => Some(Self::Dead),
            _ => None,
        }
    }
}

/// A record that exhausted its retries or was rejected outright.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub record: OutboxRecord,
    pub last_error: Option<String>,
}
