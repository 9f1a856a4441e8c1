use crate::error::ToolError;
use crate::execution_context::ToolContext;
use crate::observability::{ErrorKind, ObservabilityBus, ObservabilityEvent};
use crate::registry::{ToolDefinition, ToolRegistry};
use crate::traits::{Clock, SystemClock};
use crate::types::{Arguments, ToolRequest, ToolResponse};
use serde_json::Value;
use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::{AbortHandle, JoinError};
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info_span, warn, Instrument};

/// Runtime core: resolves a request to a registered tool and runs it under
/// uniform guardrails.
///
/// `handle` never fails. Every call to a known tool emits exactly one
/// `tool.start` followed by exactly one `tool.success` or `tool.error`, even
/// when the caller drops the `handle` future part way through.
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    bus: ObservabilityBus,
    workspace_root: PathBuf,
    clock: Arc<dyn Clock>,
    default_timeout: Option<Duration>,
    emit_not_found: bool,
}

/// A failed call, normalized before it becomes a response.
struct Failure {
    kind: ErrorKind,
    message: String,
    details: Option<Value>,
}

impl Failure {
    fn handler(message: String, details: Option<Value>) -> Self {
        Self {
            kind: ErrorKind::Handler,
            message,
            details,
        }
    }

    fn from_tool_error(err: ToolError) -> Self {
        let details = err.details().cloned();
        Self::handler(err.to_string(), details)
    }

    fn from_join_error(err: JoinError) -> Self {
        let message = if err.is_panic() {
            format!("Tool panicked: {}", panic_message(err.into_panic()))
        } else {
            "Tool execution cancelled".to_string()
        };
        Self {
            kind: ErrorKind::Panic,
            message,
            details: None,
        }
    }

    fn timeout(limit: Duration) -> Self {
        Self {
            kind: ErrorKind::Timeout,
            message: format!("Tool timed out after {}ms", limit.as_millis()),
            details: None,
        }
    }

    fn into_response(self) -> ToolResponse {
        ToolResponse::Error {
            message: self.message,
            details: self.details,
        }
    }
}

/// Live call between its start event and its terminal event.
///
/// Dropped unfinished means the caller abandoned the call: the handler task
/// is aborted and a `cancelled` error event closes the call.
struct CallGuard<'a> {
    bus: &'a ObservabilityBus,
    tool: String,
    request_id: String,
    started: Instant,
    task: Option<AbortHandle>,
    finished: bool,
}

impl CallGuard<'_> {
    fn finish(&mut self) -> u64 {
        self.finished = true;
        elapsed_ms(self.started)
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
        let duration_ms = elapsed_ms(self.started);
        warn!(
            tool = %self.tool,
            request_id = %self.request_id,
            duration_ms,
            "Tool call dropped by caller"
        );
        self.bus.emit(ObservabilityEvent::Error {
            tool: self.tool.clone(),
            request_id: self.request_id.clone(),
            duration_ms,
            error: "Tool call cancelled by caller".to_string(),
            kind: ErrorKind::Cancelled,
        });
    }
}

impl ToolDispatcher {
    pub fn new(
        registry: Arc<ToolRegistry>,
        bus: ObservabilityBus,
        workspace_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            registry,
            bus,
            workspace_root: workspace_root.into(),
            clock: Arc::new(SystemClock),
            default_timeout: None,
            emit_not_found: false,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Deadline applied when a request carries none.
    pub fn with_default_timeout(mut self, limit: Option<Duration>) -> Self {
        self.default_timeout = limit;
        self
    }

    /// Emit `tool.notfound` for rejected names.
    pub fn with_not_found_events(mut self, enabled: bool) -> Self {
        self.emit_not_found = enabled;
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub async fn handle(&self, request: ToolRequest) -> ToolResponse {
        let ToolRequest {
            id,
            name,
            arguments,
            metadata,
            timeout_ms,
        } = request;

        let request_id = match id {
            Some(id) if !id.is_empty() => id,
            _ => uuid::Uuid::new_v4().to_string(),
        };

        // 1. Lookup tool
        let Some(tool) = self.registry.get(&name) else {
            warn!(tool = %name, request_id = %request_id, "Unknown tool requested");
            if self.emit_not_found {
                self.bus.emit(ObservabilityEvent::NotFound {
                    tool: name.clone(),
                    request_id,
                });
            }
            return ToolResponse::error(format!("Unknown tool: {}", name));
        };

        // 2. Start event: argument names only
        let mut guard = CallGuard {
            bus: &self.bus,
            tool: tool.name.clone(),
            request_id: request_id.clone(),
            started: Instant::now(),
            task: None,
            finished: false,
        };
        self.bus.emit(ObservabilityEvent::Start {
            tool: tool.name.clone(),
            request_id: request_id.clone(),
            arg_keys: arguments.keys().cloned().collect(),
        });

        // 3. Execute
        let span = info_span!("tool.call", tool = %tool.name, request_id = %request_id);
        let ctx = ToolContext::new(
            self.workspace_root.clone(),
            request_id.clone(),
            tool.name.clone(),
        )
        .with_clock(Arc::clone(&self.clock))
        .with_metadata(metadata)
        .with_logger(span.clone());
        let limit = timeout_ms.map(Duration::from_millis).or(self.default_timeout);
        let outcome = self
            .execute_with_protection(&mut guard, Arc::clone(&tool), ctx, arguments, limit)
            .instrument(span)
            .await;
        let duration_ms = guard.finish();

        // 4. Terminal event
        match outcome {
            Ok(response) => {
                debug!(
                    tool = %tool.name,
                    request_id = %request_id,
                    duration_ms,
                    "Tool succeeded"
                );
                self.bus.emit(ObservabilityEvent::Success {
                    tool: tool.name.clone(),
                    request_id,
                    duration_ms,
                });
                response
            }
            Err(failure) => {
                error!(
                    tool = %tool.name,
                    request_id = %request_id,
                    duration_ms,
                    kind = ?failure.kind,
                    error = %failure.message,
                    "Tool failed"
                );
                self.bus.emit(ObservabilityEvent::Error {
                    tool: tool.name.clone(),
                    request_id,
                    duration_ms,
                    error: failure.message.clone(),
                    kind: failure.kind,
                });
                failure.into_response()
            }
        }
    }

    async fn execute_with_protection(
        &self,
        guard: &mut CallGuard<'_>,
        tool: Arc<ToolDefinition>,
        ctx: ToolContext,
        args: Arguments,
        limit: Option<Duration>,
    ) -> Result<ToolResponse, Failure> {
        let span = ctx.logger.clone();
        let handler = Arc::clone(&tool.handler);

        // Spawn task to isolate panics
        let mut handle =
            tokio::spawn(async move { handler.call(ctx, args).await }.instrument(span));
        guard.task = Some(handle.abort_handle());

        let joined = match limit {
            Some(limit) => match timeout(limit, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    handle.abort();
                    return Err(Failure::timeout(limit));
                }
            },
            None => handle.await,
        };

        match joined {
            Ok(Ok(ToolResponse::Error { message, details })) => {
                Err(Failure::handler(message, details))
            }
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => Err(Failure::from_tool_error(err)),
            Err(join_err) => Err(Failure::from_join_error(join_err)),
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::MemorySink;
    use crate::traits::handler_fn;
    use serde_json::json;

    fn dispatcher_with(tool: ToolDefinition) -> (ToolDispatcher, Arc<MemorySink>) {
        let mut registry = ToolRegistry::new();
        registry.register(tool).unwrap();
        let sink = MemorySink::new();
        let bus = ObservabilityBus::new().with_sink(sink.clone());
        (ToolDispatcher::new(Arc::new(registry), bus, "/tmp"), sink)
    }

    #[tokio::test]
    async fn test_assigns_request_id_when_missing() {
        let (dispatcher, sink) = dispatcher_with(crate::tools::PingTool::definition());

        let response = dispatcher.handle(ToolRequest::new("ping").with_id("")).await;
        assert!(response.is_success());

        let events = sink.events();
        assert_eq!(events.len(), 2);
        let id = events[0].correlation_id().to_string();
        assert!(uuid::Uuid::parse_str(&id).is_ok());
        assert_eq!(events[1].correlation_id(), id);
    }

    #[tokio::test]
    async fn test_context_carries_workspace_and_metadata() {
        let tool = ToolDefinition::new(
            "ctx",
            "returns context fields",
            handler_fn(|ctx: ToolContext, _args| async move {
                Ok::<_, ToolError>(ToolResponse::success(json!({
                    "root": ctx.workspace_root().display().to_string(),
                    "request_id": ctx.request_id,
                    "tool": ctx.tool,
                    "meta": ctx.metadata,
                })))
            }),
        );
        let (dispatcher, _) = dispatcher_with(tool);
        let mut meta = Arguments::new();
        meta.insert("caller".into(), json!("cli"));

        let response = dispatcher
            .handle(ToolRequest::new("ctx").with_id("r9").with_metadata(meta))
            .await;

        assert_eq!(
            response.data(),
            Some(&json!({
                "root": "/tmp",
                "request_id": "r9",
                "tool": "ctx",
                "meta": {"caller": "cli"}
            }))
        );
    }

    #[test]
    fn test_panic_message_variants() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new(String::from("owned"))), "owned");
        assert_eq!(panic_message(Box::new(7_u8)), "unknown panic");
    }
}
