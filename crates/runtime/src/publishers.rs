//! Publishers that deliver outbox records inside the process.

use crate::interfaces::{PublishError, Publisher};
use crate::strategy::StrategyDispatcher;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Routes each record to the strategy owning its channel. The payload must
/// be JSON; an empty payload is delivered as `null`.
pub struct StrategyPublisher {
    dispatcher: Arc<StrategyDispatcher>,
}

impl StrategyPublisher {
    pub fn new(dispatcher: Arc<StrategyDispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl Publisher for StrategyPublisher {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), PublishError> {
        let message = if payload.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(payload)
                .map_err(|e| PublishError::Delivery(format!("Invalid JSON payload: {}", e)))?
        };

        self.dispatcher
            .dispatch(channel, message)
            .await
            .map_err(|e| PublishError::Delivery(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::strategy::{Strategy, StrategyDeps, StrategyError, StrategyRegistry};
    use parking_lot::Mutex;

    struct Capture {
        seen: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl Strategy for Capture {
        fn name(&self) -> &str {
            "capture"
        }

        fn topic(&self) -> &str {
            "audit"
        }

        async fn handle(&self, message: Value, _deps: &StrategyDeps) -> Result<(), StrategyError> {
            self.seen.lock().push(message);
            Ok(())
        }
    }

    fn publisher() -> (StrategyPublisher, Arc<Capture>) {
        let capture = Arc::new(Capture {
            seen: Mutex::new(Vec::new()),
        });
        let mut registry = StrategyRegistry::new();
        registry.register(capture.clone()).unwrap();
        let dispatcher = StrategyDispatcher::new(Arc::new(registry), StrategyDeps::new());
        (StrategyPublisher::new(Arc::new(dispatcher)), capture)
    }

    #[tokio::test]
    async fn test_payload_is_dispatched_as_json() {
        let (publisher, capture) = publisher();
        publisher.publish("audit", br#"{"n":1}"#).await.unwrap();
        publisher.publish("audit", b"").await.unwrap();

        let seen = capture.seen.lock().clone();
        assert_eq!(seen, vec![serde_json::json!({"n": 1}), Value::Null]);
    }

    #[tokio::test]
    async fn test_unknown_channel_and_bad_payload_fail_delivery() {
        let (publisher, _) = publisher();
        let err = publisher.publish("nowhere", b"{}").await.unwrap_err();
        assert_eq!(err, PublishError::Delivery("no strategy for topic: nowhere".into()));

        let err = publisher.publish("audit", b"not json").await.unwrap_err();
        assert!(matches!(err, PublishError::Delivery(msg) if msg.starts_with("Invalid JSON payload")));
    }
}
