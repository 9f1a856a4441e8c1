//! Tool-call data model, registry, observability bus and dispatcher.

pub mod dispatcher;
pub mod error;
pub mod execution_context;
pub mod observability;
pub mod registry;
pub mod tools;
pub mod traits;
pub mod types;

pub use dispatcher::ToolDispatcher;
pub use error::{RegistryError, ToolError};
pub use execution_context::ToolContext;
pub use observability::{
    BroadcastSink, ErrorKind, EventSink, MemorySink, ObservabilityBus, ObservabilityEvent,
    TracingSink,
};
pub use registry::{ToolDefinition, ToolRegistry};
pub use traits::{handler_fn, Clock, FnHandler, SystemClock, ToolHandler};
pub use types::{Arguments, ToolRequest, ToolResponse};
