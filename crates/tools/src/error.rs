use serde_json::Value;
use thiserror::Error;

/// Faults raised by a tool handler.
///
/// The dispatcher renders every variant into a `ToolResponse::Error`, so a
/// handler may either return an error response or fail with one of these.
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("{message}")]
    Failed {
        message: String,
        details: Option<Value>,
    },

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ToolError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            details: None,
        }
    }

    pub fn failed_with_details(message: impl Into<String>, details: Value) -> Self {
        Self::Failed {
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn details(&self) -> Option<&Value> {
        match self {
            Self::Failed { details, .. } => details.as_ref(),
            _ => None,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Tool already registered: {0}")]
    DuplicateName(String),
}
