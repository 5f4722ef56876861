//! Echo tool: returns what it was asked to say.
//!
//! Mostly useful for wiring checks and happy-path tests — a plan step that
//! targets `echo` with a `goal` parameter gets that goal reflected back as
//! `{ "echo": <goal> }`.

use std::error::Error;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::agentloop::tool::{ToolAdapter, ToolInput, ToolResult};

pub struct EchoTool;

impl EchoTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for EchoTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolAdapter for EchoTool {
    fn id(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echoes the 'goal' parameter back as output"
    }

    async fn execute(&self, input: ToolInput) -> Result<ToolResult, Box<dyn Error + Send + Sync>> {
        let goal = input
            .params
            .get("goal")
            .cloned()
            .unwrap_or(Value::String(String::new()));
        let mut output = Map::new();
        output.insert("echo".to_string(), goal);
        Ok(ToolResult::success(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentloop::context::{AgentContext, TaskNode};
    use serde_json::json;

    fn input(params: Value) -> ToolInput {
        let ctx = AgentContext::new("a", TaskNode::with_id("t-root", "root"), Map::new());
        ToolInput {
            task_id: "t-root".to_string(),
            trace_id: "trace".to_string(),
            params: params.as_object().cloned().unwrap_or_default(),
            context_snapshot: ctx.snapshot(),
        }
    }

    #[tokio::test]
    async fn test_echoes_goal() {
        let result = EchoTool::new()
            .execute(input(json!({ "goal": "Echo hi" })))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.output["echo"], json!("Echo hi"));
    }

    #[tokio::test]
    async fn test_missing_goal_echoes_empty_string() {
        let result = EchoTool::new().execute(input(json!({}))).await.unwrap();
        assert!(result.success);
        assert_eq!(result.output["echo"], json!(""));
    }
}
