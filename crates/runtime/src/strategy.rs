//! Topic-keyed, fire-and-forget message routing.

use crate::interfaces::OutboxStore;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use toolhost_tools::{Clock, ObservabilityBus, ObservabilityEvent, SystemClock};
use tracing::{error, info, info_span, Instrument};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StrategyError {
    #[error("no strategy for topic: {0}")]
    NoStrategy(String),

    #[error("strategy already registered for topic: {0}")]
    DuplicateTopic(String),

    #[error("{0}")]
    Handler(String),
}

impl StrategyError {
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(message.into())
    }
}

/// Shared collaborators handed to every strategy.
#[non_exhaustive]
#[derive(Clone)]
pub struct StrategyDeps {
    pub outbox: Option<Arc<dyn OutboxStore>>,
    pub clock: Arc<dyn Clock>,
}

impl StrategyDeps {
    pub fn new() -> Self {
        Self {
            outbox: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_outbox(mut self, outbox: Arc<dyn OutboxStore>) -> Self {
        self.outbox = Some(outbox);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

impl Default for StrategyDeps {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StrategyDeps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrategyDeps")
            .field("outbox", &self.outbox.is_some())
            .finish_non_exhaustive()
    }
}

/// A message handler bound to exactly one topic.
#[async_trait]
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;
    fn topic(&self) -> &str;
    async fn handle(&self, message: Value, deps: &StrategyDeps) -> Result<(), StrategyError>;
}

#[derive(Default)]
pub struct StrategyRegistry {
    by_topic: BTreeMap<String, Arc<dyn Strategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, strategy: Arc<dyn Strategy>) -> Result<&mut Self, StrategyError> {
        let topic = strategy.topic().to_string();
        if self.by_topic.contains_key(&topic) {
            return Err(StrategyError::DuplicateTopic(topic));
        }
        self.by_topic.insert(topic, strategy);
        Ok(self)
    }

    pub fn get(&self, topic: &str) -> Option<Arc<dyn Strategy>> {
        self.by_topic.get(topic).cloned()
    }

    pub fn topics(&self) -> Vec<String> {
        self.by_topic.keys().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.by_topic.len()
    }
}

/// Routes a message to the strategy owning its topic.
///
/// With a bus attached, each dispatch emits `strategy.start` followed by
/// `strategy.success` or `strategy.error`.
pub struct StrategyDispatcher {
    registry: Arc<StrategyRegistry>,
    deps: StrategyDeps,
    bus: Option<ObservabilityBus>,
}

impl StrategyDispatcher {
    pub fn new(registry: Arc<StrategyRegistry>, deps: StrategyDeps) -> Self {
        Self {
            registry,
            deps,
            bus: None,
        }
    }

    pub fn with_bus(mut self, bus: ObservabilityBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    pub fn handles(&self, topic: &str) -> bool {
        self.registry.get(topic).is_some()
    }

    pub async fn dispatch(&self, topic: &str, message: Value) -> Result<(), StrategyError> {
        let strategy = self
            .registry
            .get(topic)
            .ok_or_else(|| StrategyError::NoStrategy(topic.to_string()))?;

        let name = strategy.name().to_string();
        let message_id = uuid::Uuid::new_v4().to_string();
        info!(topic, strategy = %name, message_id = %message_id, "Dispatching message");

        self.emit(ObservabilityEvent::StrategyStart {
            strategy: name.clone(),
            topic: topic.to_string(),
            message_id: message_id.clone(),
        });

        let started = Instant::now();
        let span = info_span!("strategy.handle", topic, strategy = %name);
        let result = strategy.handle(message, &self.deps).instrument(span).await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match &result {
            Ok(()) => self.emit(ObservabilityEvent::StrategySuccess {
                strategy: name,
                topic: topic.to_string(),
                message_id,
                duration_ms,
            }),
            Err(e) => {
                error!(topic, strategy = %name, duration_ms, error = %e, "Strategy failed");
                self.emit(ObservabilityEvent::StrategyError {
                    strategy: name,
                    topic: topic.to_string(),
                    message_id,
                    duration_ms,
                    error: e.to_string(),
                });
            }
        }

        result
    }

    fn emit(&self, event: ObservabilityEvent) {
        if let Some(bus) = &self.bus {
            bus.emit(event);
        }
    }
}
