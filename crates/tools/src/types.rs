//! Request and response envelopes for a single tool call.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Raw tool arguments, keyed by argument name.
pub type Arguments = Map<String, Value>;

/// One inbound tool call. Not retained after dispatch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    /// Caller-supplied id; a random one is assigned when absent or empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default, alias = "args")]
    pub arguments: Arguments,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Arguments>,
    /// Per-call deadline; overrides the dispatcher default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl ToolRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.arguments.insert(key.into(), value);
        self
    }

    pub fn with_arguments(mut self, arguments: Arguments) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn with_metadata(mut self, metadata: Arguments) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// Uniform result of a tool call: always exactly one of success or error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ToolResponse {
    Success {
        data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        warnings: Option<Vec<String>>,
    },
    Error {
        #[serde(rename = "error")]
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },
}

impl ToolResponse {
    pub fn success(data: Value) -> Self {
        Self::Success {
            data,
            warnings: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            details: None,
        }
    }

    pub fn with_warnings(self, warnings: Vec<String>) -> Self {
        match self {
            Self::Success { data, .. } => Self::Success {
                data,
                warnings: Some(warnings),
            },
            other => other,
        }
    }

    pub fn with_details(self, details: Value) -> Self {
        match self {
            Self::Error { message, .. } => Self::Error {
                message,
                details: Some(details),
            },
            other => other,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    pub fn data(&self) -> Option<&Value> {
        match self {
            Self::Success { data, .. } => Some(data),
            Self::Error { .. } => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Error { message, .. } => Some(message),
            Self::Success { .. } => None,
        }
    }
}
