//! Master-plan data model.
//!
//! A [`MasterPlan`] is the ordered list of steps an agent intends to execute,
//! together with a pointer to the current step and an append-only history of
//! everything that happened to the plan since it was created. Planners create
//! plans, reflectors revise them; the runtime only ever stores the latest
//! revision and appends history entries through [`MasterPlan::record`] so the
//! version sequence stays monotonic no matter who produced the revision.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::agentloop::now_ms;

/// Lifecycle of one plan step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Ready,
    InProgress,
    Blocked,
    Succeeded,
    Failed,
    Skipped,
}

/// Lifecycle of the plan as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Draft,
    Ready,
    InProgress,
    Blocked,
    Completed,
    Failed,
    Aborted,
}

/// How a step's retry budget is spent over time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    None,
    Immediate,
    Linear,
    Exponential,
}

/// Per-step retry policy. All fields optional; an absent policy means the
/// reflector decides without a budget hint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<RetryStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
}

/// One candidate tool invocation inside a step's priority-ordered sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolStep {
    pub tool_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Map<String, Value>>,
}

impl ToolStep {
    pub fn new(tool_id: impl Into<String>) -> Self {
        Self {
            tool_id: tool_id.into(),
            description: None,
            parameters: None,
        }
    }

    pub fn with_parameters(mut self, parameters: Map<String, Value>) -> Self {
        self.parameters = Some(parameters);
        self
    }
}

/// One step of a master plan.
///
/// `tool_sequence` is never empty and is ordered by priority: the executor
/// uses the first entry unless a fallback asks for a specific tool.
/// `success_criteria` is free-form text the reflector judges against.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanItem {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_task_id: Option<String>,
    pub tool_sequence: Vec<ToolStep>,
    pub success_criteria: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl PlanItem {
    /// Build a pending step with one tool candidate and one success criterion.
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        tool: ToolStep,
        criterion: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: None,
            status: StepStatus::Pending,
            related_task_id: None,
            tool_sequence: vec![tool],
            success_criteria: vec![criterion.into()],
            retry: None,
            metadata: None,
        }
    }

    pub fn with_related_task(mut self, task_id: impl Into<String>) -> Self {
        self.related_task_id = Some(task_id.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_fallback_tool(mut self, tool: ToolStep) -> Self {
        self.tool_sequence.push(tool);
        self
    }

    /// Task id observers should attribute this step's work to.
    pub fn attribution_task_id(&self) -> &str {
        self.related_task_id.as_deref().unwrap_or(&self.id)
    }
}

/// What happened to a plan, as recorded in its history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanEvent {
    Created,
    PointerAdvanced,
    StepUpdated,
    Replanned,
    StatusChanged,
}

/// One append-only history record. Versions count up from 1 with no gaps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanHistoryEntry {
    pub version: u64,
    pub timestamp: u64,
    pub event: PlanEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Map<String, Value>>,
}

/// The full ordered plan for one agent run.
///
/// `plan_id` is stable across replans within a run; a reflector that replaces
/// every step still keeps the id so observers can follow the thread. The
/// pointer invariant (`current_index` addresses an existing step whenever
/// `steps` is non-empty) is maintained by the mutation helpers below.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterPlan {
    pub plan_id: String,
    pub steps: Vec<PlanItem>,
    pub current_index: usize,
    pub status: PlanStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_message: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
    pub history: Vec<PlanHistoryEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl MasterPlan {
    /// Create a ready plan over the given steps, with a fresh id and a
    /// version-1 `created` history entry.
    pub fn new(steps: Vec<PlanItem>) -> Self {
        let now = now_ms();
        let mut plan = Self {
            plan_id: Uuid::new_v4().to_string(),
            steps,
            current_index: 0,
            status: PlanStatus::Ready,
            reasoning: None,
            user_message: None,
            created_at: now,
            updated_at: now,
            history: Vec::new(),
            metadata: None,
        };
        plan.record(PlanEvent::Created, Some("plan created".to_string()), None);
        plan
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    /// The step the pointer currently addresses, if any.
    pub fn current_step(&self) -> Option<&PlanItem> {
        self.steps.get(self.current_index)
    }

    /// Append the next history entry. Versions are assigned here, not by the
    /// caller, so the sequence stays gap-free; timestamps never run backwards
    /// even if the wall clock does.
    pub fn record(
        &mut self,
        event: PlanEvent,
        summary: Option<String>,
        payload: Option<Map<String, Value>>,
    ) {
        let version = self.history.len() as u64 + 1;
        let floor = self.history.last().map(|h| h.timestamp).unwrap_or(0);
        let timestamp = now_ms().max(floor);
        self.history.push(PlanHistoryEntry {
            version,
            timestamp,
            event,
            summary,
            payload,
        });
        self.updated_at = self.updated_at.max(timestamp);
    }

    /// Move the pointer one step forward, clamped to the last step, and
    /// record the move. Returns the new index.
    pub fn advance_pointer(&mut self) -> usize {
        if self.current_index + 1 < self.steps.len() {
            self.current_index += 1;
            self.record(
                PlanEvent::PointerAdvanced,
                Some(format!("pointer -> {}", self.current_index)),
                None,
            );
        }
        self.current_index
    }

    /// Update the plan status and record the change.
    pub fn set_status(&mut self, status: PlanStatus) {
        if self.status != status {
            self.status = status;
            self.record(
                PlanEvent::StatusChanged,
                Some(format!("status -> {:?}", status)),
                None,
            );
        }
    }

    /// True when the pointer addresses an existing step.
    pub fn pointer_valid(&self) -> bool {
        self.current_index < self.steps.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn one_step_plan() -> MasterPlan {
        MasterPlan::new(vec![PlanItem::new(
            "s-1",
            "Echo",
            ToolStep::new("echo"),
            "output echoed",
        )])
    }

    #[test]
    fn test_new_plan_starts_with_created_history() {
        let plan = one_step_plan();
        assert_eq!(plan.history.len(), 1);
        assert_eq!(plan.history[0].version, 1);
        assert_eq!(plan.history[0].event, PlanEvent::Created);
        assert!(plan.pointer_valid());
    }

    #[test]
    fn test_record_assigns_contiguous_versions_and_monotonic_timestamps() {
        let mut plan = one_step_plan();
        plan.record(PlanEvent::StepUpdated, None, None);
        plan.record(PlanEvent::Replanned, Some("new steps".into()), None);

        for (i, entry) in plan.history.iter().enumerate() {
            assert_eq!(entry.version, i as u64 + 1);
        }
        for pair in plan.history.windows(2) {
            assert!(pair[1].timestamp >= pair[0].timestamp);
        }
        assert!(plan.updated_at >= plan.created_at);
    }

    #[test]
    fn test_advance_pointer_clamps_at_last_step() {
        let mut plan = MasterPlan::new(vec![
            PlanItem::new("s-1", "First", ToolStep::new("echo"), "done"),
            PlanItem::new("s-2", "Second", ToolStep::new("echo"), "done"),
        ]);

        assert_eq!(plan.advance_pointer(), 1);
        assert_eq!(plan.advance_pointer(), 1);
        assert_eq!(plan.current_step().unwrap().id, "s-2");
    }

    #[test]
    fn test_set_status_records_only_on_change() {
        let mut plan = one_step_plan();
        let before = plan.history.len();
        plan.set_status(PlanStatus::Ready);
        assert_eq!(plan.history.len(), before);
        plan.set_status(PlanStatus::InProgress);
        assert_eq!(plan.history.len(), before + 1);
    }

    #[test]
    fn test_plan_json_round_trip() {
        let plan = one_step_plan().with_reasoning("only one thing to do");
        let encoded = serde_json::to_value(&plan).unwrap();
        assert_eq!(encoded["currentIndex"], json!(0));
        assert_eq!(encoded["steps"][0]["toolSequence"][0]["toolId"], json!("echo"));

        let decoded: MasterPlan = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded.plan_id, plan.plan_id);
        assert_eq!(decoded.history.len(), plan.history.len());
    }
}
