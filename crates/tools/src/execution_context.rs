use crate::traits::{Clock, SystemClock};
use crate::types::Arguments;
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::Span;

/// Per-call context passed to a handler.
///
/// Fields are only ever added, so the struct is non-exhaustive: build it
/// with [`ToolContext::new`] and the `with_*` methods.
#[derive(Clone)]
#[non_exhaustive]
pub struct ToolContext {
    pub workspace_root: PathBuf,
    pub request_id: String,
    pub tool: String,
    pub metadata: Option<Arguments>,
    /// Span the call runs under; events logged inside it carry the tool
    /// name and request id.
    pub logger: Span,
    pub clock: Arc<dyn Clock>,
}

impl ToolContext {
    pub fn new(
        workspace_root: impl Into<PathBuf>,
        request_id: impl Into<String>,
        tool: impl Into<String>,
    ) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            request_id: request_id.into(),
            tool: tool.into(),
            metadata: None,
            logger: Span::none(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_logger(mut self, logger: Span) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_metadata(mut self, metadata: Option<Arguments>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

impl fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolContext")
            .field("workspace_root", &self.workspace_root)
            .field("request_id", &self.request_id)
            .field("tool", &self.tool)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}
