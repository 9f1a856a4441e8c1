use crate::error::ToolError;
use crate::execution_context::ToolContext;
use crate::types::{Arguments, ToolResponse};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;

/// Handler behind a registered tool.
///
/// A handler signals failure either by returning `ToolResponse::Error` or by
/// returning `Err`; callers of the dispatcher see the same response shape for
/// both. Handlers may run concurrently with each other and must guard any
/// shared state themselves.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, ctx: ToolContext, args: Arguments) -> Result<ToolResponse, ToolError>;
}

/// Adapter turning an async closure into a [`ToolHandler`].
pub struct FnHandler<F> {
    f: F,
}

/// Wrap `f` so it can be registered as a tool handler.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(ToolContext, Arguments) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ToolResponse, ToolError>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(ToolContext, Arguments) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ToolResponse, ToolError>> + Send + 'static,
{
    async fn call(&self, ctx: ToolContext, args: Arguments) -> Result<ToolResponse, ToolError> {
        (self.f)(ctx, args).await
    }
}

/// Time source handed to handlers.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
