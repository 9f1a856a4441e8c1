use async_trait::async_trait;
use serde_json::json;
use crate::error::ToolError;
use crate::execution_context::ToolContext;
use crate::registry::ToolDefinition;
use crate::traits::ToolHandler;
use crate::types::{Arguments, ToolResponse};

/// Health check: echoes `payload`, or `"pong"` when none is given.
pub struct PingTool;

impl PingTool {
    pub const NAME: &'static str = "ping";

    pub fn definition() -> ToolDefinition {
        ToolDefinition::new(Self::NAME, "Health check tool; echoes payload.", PingTool).with_schema(
            json!({
                "type": "object",
                "properties": {
                    "payload": {"type": "string"}
                }
            }),
        )
    }
}

#[async_trait]
impl ToolHandler for PingTool {
    async fn call(&self, _ctx: ToolContext, args: Arguments) -> Result<ToolResponse, ToolError> {
        let payload = args
            .get("payload")
            .and_then(|value| value.as_str())
            .unwrap_or("pong");
        Ok(ToolResponse::success(json!({ "payload": payload })))
    }
}
