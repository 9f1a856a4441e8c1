//! Typed observability events and the bus that fans them out to sinks.
//!
//! Events are ephemeral: the bus hands each one to every subscribed sink and
//! keeps nothing. Tool start events only ever carry argument key names,
//! never argument values.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// How a failed call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// The handler returned an error response or an `Err`.
    Handler,
    /// The handler task panicked or was cancelled.
    Panic,
    /// The call exceeded its deadline.
    Timeout,
    /// The caller dropped the call before it finished.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ObservabilityEvent {
    #[serde(rename = "tool.start")]
    Start {
        tool: String,
        request_id: String,
        arg_keys: Vec<String>,
    },
    #[serde(rename = "tool.success")]
    Success {
        tool: String,
        request_id: String,
        duration_ms: u64,
    },
    #[serde(rename = "tool.error")]
    Error {
        tool: String,
        request_id: String,
        duration_ms: u64,
        error: String,
        kind: ErrorKind,
    },
    #[serde(rename = "tool.notfound")]
    NotFound { tool: String, request_id: String },
    #[serde(rename = "strategy.start")]
    StrategyStart {
        strategy: String,
        topic: String,
        message_id: String,
    },
    #[serde(rename = "strategy.success")]
    StrategySuccess {
        strategy: String,
        topic: String,
        message_id: String,
        duration_ms: u64,
    },
    #[serde(rename = "strategy.error")]
    StrategyError {
        strategy: String,
        topic: String,
        message_id: String,
        duration_ms: u64,
        error: String,
    },
}

impl ObservabilityEvent {
    /// Wire name of the event, e.g. `tool.start`.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Start { .. } => "tool.start",
            Self::Success { .. } => "tool.success",
            Self::Error { .. } => "tool.error",
            Self::NotFound { .. } => "tool.notfound",
            Self::StrategyStart { .. } => "strategy.start",
            Self::StrategySuccess { .. } => "strategy.success",
            Self::StrategyError { .. } => "strategy.error",
        }
    }

    /// Request id for tool events, message id for strategy events.
    pub fn correlation_id(&self) -> &str {
        match self {
            Self::Start { request_id, .. }
            | Self::Success { request_id, .. }
            | Self::Error { request_id, .. }
            | Self::NotFound { request_id, .. } => request_id,
            Self::StrategyStart { message_id, .. }
            | Self::StrategySuccess { message_id, .. }
            | Self::StrategyError { message_id, .. } => message_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success { .. }
                | Self::Error { .. }
                | Self::StrategySuccess { .. }
                | Self::StrategyError { .. }
        )
    }
}

/// Subscriber on the bus. Implementations must return quickly: buffer or
/// hand off anything slow.
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: &ObservabilityEvent);
}

/// Fan-out of events to a fixed set of sinks.
///
/// Sinks are attached while wiring the runtime; clones share them.
#[derive(Clone, Default)]
pub struct ObservabilityBus {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl ObservabilityBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn subscribe(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    pub fn emit(&self, event: ObservabilityEvent) {
        for sink in &self.sinks {
            sink.on_event(&event);
        }
    }
}

/// Captures every event in memory, in emission order.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<ObservabilityEvent>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<ObservabilityEvent> {
        self.events.lock().clone()
    }

    pub fn for_id(&self, correlation_id: &str) -> Vec<ObservabilityEvent> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.correlation_id() == correlation_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for MemorySink {
    fn on_event(&self, event: &ObservabilityEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Republishes events on a tokio broadcast channel for async consumers.
///
/// Sending never blocks; lagging receivers lose the oldest events.
pub struct BroadcastSink {
    tx: broadcast::Sender<ObservabilityEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Arc::new(Self { tx })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ObservabilityEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn on_event(&self, event: &ObservabilityEvent) {
        // No receivers is not an error.
        let _ = self.tx.send(event.clone());
    }
}

/// Writes events to the `tracing` pipeline.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn on_event(&self, event: &ObservabilityEvent) {
        match event {
            ObservabilityEvent::Start {
                tool,
                request_id,
                arg_keys,
            } => debug!(tool = %tool, request_id = %request_id, ?arg_keys, "tool.start"),
            ObservabilityEvent::Success {
                tool,
                request_id,
                duration_ms,
            } => info!(tool = %tool, request_id = %request_id, duration_ms, "tool.success"),
            ObservabilityEvent::Error {
                tool,
                request_id,
                duration_ms,
                error,
                kind,
            } => warn!(
                tool = %tool,
                request_id = %request_id,
                duration_ms,
                ?kind,
                error = %error,
                "tool.error"
            ),
            ObservabilityEvent::NotFound { tool, request_id } => {
                warn!(tool = %tool, request_id = %request_id, "tool.notfound")
            }
            ObservabilityEvent::StrategyStart {
                strategy,
                topic,
                message_id,
            } => debug!(
                strategy = %strategy,
                topic = %topic,
                message_id = %message_id,
                "strategy.start"
            ),
            ObservabilityEvent::StrategySuccess {
                strategy,
                topic,
                message_id,
                duration_ms,
            } => info!(
                strategy = %strategy,
                topic = %topic,
                message_id = %message_id,
                duration_ms,
                "strategy.success"
            ),
            ObservabilityEvent::StrategyError {
                strategy,
                topic,
                message_id,
                duration_ms,
                error,
            } => warn!(
                strategy = %strategy,
                topic = %topic,
                message_id = %message_id,
                duration_ms,
                error = %error,
                "strategy.error"
            ),
        }
    }
}
