//! Step executor.
//!
//! The executor mediates between plan steps and tools. Per execution it
//! selects the tool (preferred id first, then the step's priority order),
//! emits the `tool.request` / `tool.result` event pair every observer relies
//! on for traceability, times the adapter call, and converts any adapter
//! error into an ordinary failed [`ToolResult`] so tool trouble flows through
//! the observe/reflect path instead of aborting the run.

use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::agentloop::bus::{payload, BusEvent, BusEventType, EventBus};
use crate::agentloop::context::AgentContextSnapshot;
use crate::agentloop::plan::{MasterPlan, PlanItem};
use crate::agentloop::tool::{ToolInput, ToolRegistry, ToolResult};

/// Failures of the dispatch plumbing itself. Tool-level failures (an invoked
/// adapter returning `success = false`) are not executor errors.
#[derive(Debug, Clone)]
pub enum ExecutorError {
    /// The step has no usable tool: no preferred id and an empty sequence.
    NoToolCandidate { step_id: String },
    /// The plan references a tool id the registry does not know.
    ToolNotRegistered { tool_id: String },
}

impl ExecutorError {
    /// Stable machine-readable kind string.
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutorError::NoToolCandidate { .. } => "no-tool-candidate",
            ExecutorError::ToolNotRegistered { .. } => "tool-not-registered",
        }
    }
}

impl fmt::Display for ExecutorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutorError::NoToolCandidate { step_id } => {
                write!(f, "no-tool-candidate: step '{}' has no usable tool", step_id)
            }
            ExecutorError::ToolNotRegistered { tool_id } => {
                write!(f, "tool-not-registered: '{}'", tool_id)
            }
        }
    }
}

impl Error for ExecutorError {}

/// Outcome of dispatching one plan step.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub plan_id: String,
    pub step_index: usize,
    pub step: PlanItem,
    pub tool_id: String,
    pub result: ToolResult,
}

/// Optional collaborator notified after each execution, e.g. a store that
/// folds results back into durable context. Errors from the recorder are
/// logged and swallowed; they never affect the run.
#[async_trait]
pub trait ContextRecorder: Send + Sync {
    async fn record_execution_result(
        &self,
        result: &ExecutionResult,
        snapshot: AgentContextSnapshot,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;
}

/// One execution request.
pub struct ExecuteRequest<'a> {
    pub plan: &'a MasterPlan,
    pub step_index: usize,
    pub step: &'a PlanItem,
    pub snapshot: AgentContextSnapshot,
    /// Overrides the step's priority order (used by fallback directives).
    pub preferred_tool_id: Option<String>,
}

/// Dispatches plan steps to registered tools, emitting the request/result
/// event pair on the shared bus.
pub struct Executor {
    registry: Arc<ToolRegistry>,
    bus: EventBus,
    recorder: Option<Arc<dyn ContextRecorder>>,
}

impl Executor {
    pub fn new(registry: Arc<ToolRegistry>, bus: EventBus) -> Self {
        Self {
            registry,
            bus,
            recorder: None,
        }
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn ContextRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Execute one step.
    ///
    /// A fresh trace id correlates the emitted `tool.request` with its
    /// `tool.result`. The adapter call is wall-clock timed; the measured
    /// latency lands in the result even when the adapter reported its own.
    pub async fn execute(&self, request: ExecuteRequest<'_>) -> Result<ExecutionResult, ExecutorError> {
        let ExecuteRequest {
            plan,
            step_index,
            step,
            snapshot,
            preferred_tool_id,
        } = request;

        let tool_id = preferred_tool_id
            .or_else(|| step.tool_sequence.first().map(|t| t.tool_id.clone()))
            .ok_or_else(|| ExecutorError::NoToolCandidate {
                step_id: step.id.clone(),
            })?;

        let adapter = self
            .registry
            .get(&tool_id)
            .ok_or_else(|| ExecutorError::ToolNotRegistered {
                tool_id: tool_id.clone(),
            })?;

        let trace_id = Uuid::new_v4().to_string();
        let related_task_id = step.attribution_task_id().to_string();

        self.bus.emit(
            BusEvent::new(
                BusEventType::ToolRequest,
                trace_id.clone(),
                payload(json!({
                    "toolId": tool_id,
                    "planId": plan.plan_id,
                    "stepId": step.id,
                    "stepIndex": step_index,
                    "step": step,
                })),
            )
            .with_related_task(related_task_id.clone()),
        );

        let input = ToolInput {
            task_id: related_task_id.clone(),
            trace_id: trace_id.clone(),
            params: build_params(step, &tool_id, &plan.plan_id),
            context_snapshot: snapshot.clone(),
        };

        let started = Instant::now();
        let mut result = match adapter.execute(input).await {
            Ok(result) => result,
            Err(err) => ToolResult::failure(err.to_string()),
        };
        result.latency_ms = Some(started.elapsed().as_millis() as u64);

        self.bus.emit(
            BusEvent::new(
                BusEventType::ToolResult,
                trace_id,
                payload(json!({
                    "toolId": tool_id,
                    "planId": plan.plan_id,
                    "stepId": step.id,
                    "stepIndex": step_index,
                    "step": step,
                    "result": result,
                })),
            )
            .with_related_task(related_task_id),
        );

        let execution = ExecutionResult {
            plan_id: plan.plan_id.clone(),
            step_index,
            step: step.clone(),
            tool_id,
            result,
        };

        if let Some(recorder) = &self.recorder {
            if let Err(err) = recorder.record_execution_result(&execution, snapshot).await {
                log::warn!("context recorder failed (ignored): {}", err);
            }
        }

        Ok(execution)
    }
}

/// Parameters for the chosen tool: the matching sequence entry's parameters
/// merged with the routing keys `planId` and `stepId`.
fn build_params(step: &PlanItem, tool_id: &str, plan_id: &str) -> Map<String, Value> {
    let mut params = step
        .tool_sequence
        .iter()
        .find(|t| t.tool_id == tool_id)
        .and_then(|t| t.parameters.clone())
        .unwrap_or_default();
    params.insert("planId".to_string(), Value::String(plan_id.to_string()));
    params.insert("stepId".to_string(), Value::String(step.id.to_string()));
    params
}
