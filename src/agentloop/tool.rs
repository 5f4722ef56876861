//! Tool abstraction layer.
//!
//! A [`ToolAdapter`] is the contract between the runtime and anything that
//! can do work on behalf of a plan step: file I/O, shell, HTTP, math, or a
//! remote service. Adapters report ordinary failure by returning
//! `success = false` with an error string. `Err` is reserved for
//! programmer-level misuse, and the executor converts even that into a failed
//! result rather than letting it escape the run.
//!
//! The [`ToolRegistry`] is a plain name-indexed lookup shared behind an
//! `Arc`; registration happens at wiring time, before a run starts.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::agentloop::context::AgentContextSnapshot;

/// Errors for tool lookup and invocation plumbing.
#[derive(Debug, Clone)]
pub enum ToolError {
    /// Requested tool is not registered.
    NotFound(String),
    /// Tool execution completed with an application-level failure.
    ExecutionFailed(String),
    /// The provided parameters failed validation or deserialization.
    InvalidParameters(String),
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolError::NotFound(name) => write!(f, "Tool not found: {}", name),
            ToolError::ExecutionFailed(msg) => write!(f, "Tool execution failed: {}", msg),
            ToolError::InvalidParameters(msg) => write!(f, "Invalid parameters: {}", msg),
        }
    }
}

impl Error for ToolError {}

/// Everything an adapter receives for one invocation.
///
/// `params` is the step's parameter map merged with the routing keys the
/// executor adds (`planId`, `stepId`). The snapshot is read-only context;
/// adapters must not assume it reflects anything past the moment of dispatch.
#[derive(Debug, Clone)]
pub struct ToolInput {
    pub task_id: String,
    pub trace_id: String,
    pub params: Map<String, Value>,
    pub context_snapshot: AgentContextSnapshot,
}

/// Structured result of one tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub success: bool,
    pub output: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

impl ToolResult {
    /// Convenience constructor for successful execution.
    pub fn success(output: Map<String, Value>) -> Self {
        Self {
            success: true,
            output,
            error: None,
            latency_ms: None,
        }
    }

    /// Convenience constructor for failed execution.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: Map::new(),
            error: Some(error.into()),
            latency_ms: None,
        }
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }
}

/// Contract every tool implementation satisfies.
///
/// Implementations must be cheap to share (`Arc<dyn ToolAdapter>`) and safe
/// to call from any task. Ordinary failure is a `ToolResult` with
/// `success = false`, never an `Err`.
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    /// Stable identifier plans reference in their tool sequences.
    fn id(&self) -> &str;

    /// Human-readable description surfaced to planners and debuggers.
    fn description(&self) -> &str;

    /// Execute one invocation.
    async fn execute(&self, input: ToolInput) -> Result<ToolResult, Box<dyn Error + Send + Sync>>;
}

/// Descriptor returned by [`ToolRegistry::list`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInfo {
    pub id: String,
    pub description: String,
}

/// Name-indexed lookup of tool adapters.
#[derive(Default)]
pub struct ToolRegistry {
    adapters: HashMap<String, Arc<dyn ToolAdapter>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an adapter under its own id.
    pub fn register(&mut self, adapter: Arc<dyn ToolAdapter>) {
        self.adapters.insert(adapter.id().to_string(), adapter);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ToolAdapter>> {
        self.adapters.get(id).cloned()
    }

    /// Descriptors for every registered adapter (map iteration order).
    pub fn list(&self) -> Vec<ToolInfo> {
        self.adapters
            .values()
            .map(|a| ToolInfo {
                id: a.id().to_string(),
                description: a.description().to_string(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentloop::context::{AgentContext, TaskNode};
    use serde_json::json;

    struct UpperTool;

    #[async_trait]
    impl ToolAdapter for UpperTool {
        fn id(&self) -> &str {
            "upper"
        }

        fn description(&self) -> &str {
            "Uppercases the text parameter"
        }

        async fn execute(
            &self,
            input: ToolInput,
        ) -> Result<ToolResult, Box<dyn Error + Send + Sync>> {
            match input.params.get("text").and_then(|v| v.as_str()) {
                Some(text) => {
                    let mut output = Map::new();
                    output.insert("text".to_string(), json!(text.to_uppercase()));
                    Ok(ToolResult::success(output))
                }
                None => Ok(ToolResult::failure("missing 'text' parameter")),
            }
        }
    }

    fn input(params: Map<String, Value>) -> ToolInput {
        let ctx = AgentContext::new("a", TaskNode::with_id("t-root", "root"), Map::new());
        ToolInput {
            task_id: "t-root".to_string(),
            trace_id: "trace-1".to_string(),
            params,
            context_snapshot: ctx.snapshot(),
        }
    }

    #[tokio::test]
    async fn test_registry_register_get_list() {
        let mut registry = ToolRegistry::new();
        assert!(registry.is_empty());

        registry.register(Arc::new(UpperTool));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("upper").is_some());
        assert!(registry.get("ghost").is_none());

        let listed = registry.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "upper");
    }

    #[tokio::test]
    async fn test_adapter_reports_ordinary_failure_in_result() {
        let tool = UpperTool;
        let result = tool.execute(input(Map::new())).await.unwrap();
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("text"));
    }

    #[tokio::test]
    async fn test_adapter_success_path() {
        let tool = UpperTool;
        let result = tool
            .execute(input(json!({ "text": "hi" }).as_object().cloned().unwrap()))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.output["text"], json!("HI"));
    }

    #[test]
    fn test_tool_error_display() {
        assert_eq!(
            ToolError::NotFound("ghost".to_string()).to_string(),
            "Tool not found: ghost"
        );
        assert_eq!(
            ToolError::InvalidParameters("expected object".to_string()).to_string(),
            "Invalid parameters: expected object"
        );
    }

    #[test]
    fn test_tool_result_constructors() {
        let ok = ToolResult::success(Map::new()).with_latency(12);
        assert!(ok.success);
        assert_eq!(ok.latency_ms, Some(12));

        let failed = ToolResult::failure("boom");
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("boom"));
        assert!(failed.output.is_empty());
    }
}
