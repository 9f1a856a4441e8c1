//! Abstract interfaces for runtime dependencies.

use crate::container::ContainerError;
use crate::strategy::StrategyError;
use async_trait::async_trait;
use thiserror::Error;
use toolhost_infra::OutboxRecord;
use toolhost_tools::RegistryError;

/// Runtime errors.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Runtime not started")]
    NotStarted,

    #[error("Container error: {0}")]
    Container(#[from] ContainerError),

    #[error("Strategy error: {0}")]
    Strategy(#[from] StrategyError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Publish-side failure. Always retryable through the outbox.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("Delivery failed: {0}")]
    Delivery(String),

    /// The sink could not confirm receipt; treated as a failure so the
    /// record is retried.
    #[error("Delivery unconfirmed: {0}")]
    Unconfirmed(String),
}

/// Durable queue of pending side effects.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Persist a new pending record.
    async fn append(&self, record: OutboxRecord) -> Result<(), RuntimeError>;

    /// Up to `limit` pending records that are due, oldest first.
    async fn next_batch(&self, limit: usize) -> Result<Vec<OutboxRecord>, RuntimeError>;

    /// Remove a record from the pending set for good.
    async fn mark_done(&self, id: &str) -> Result<(), RuntimeError>;

    /// Count a failed attempt; the store decides when the record is due again.
    async fn mark_failed(&self, id: &str, error: &str) -> Result<(), RuntimeError>;

    /// Record a permanent validation failure. Stores that can park records
    /// should do so; the fallback counts it as an ordinary failure.
    async fn mark_rejected(&self, id: &str, error: &str) -> Result<(), RuntimeError> {
        self.mark_failed(id, error).await
    }
}

/// External sink the relay delivers to. Delivery is at-least-once.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), PublishError>;
}
