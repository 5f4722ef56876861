//! Planner and reflector contracts.
//!
//! The runtime treats planning and reflection as opaque async functions
//! behind these two traits. Concrete implementations typically call out to an
//! LLM and sanitise its JSON; none of that leaks in here — the machine only
//! depends on the structural contract: a planner returns an authoritative
//! [`MasterPlan`](crate::agentloop::plan::MasterPlan), a reflector returns a
//! revised plan plus a [`Directive`] selecting the next transition.

use std::error::Error;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::agentloop::context::{AgentContextSnapshot, Observation, TaskNode};
use crate::agentloop::plan::{MasterPlan, PlanHistoryEntry, PlanItem};

pub type CollabResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

/// Key inside [`ReflectionOutcome::metadata`] carrying task-tree updates.
pub const TASK_UPDATES_KEY: &str = "taskUpdates";

/// What the reflector wants the machine to do next.
///
/// `Unknown` absorbs unrecognised values when an outcome is deserialised from
/// an external reflector; the machine treats it as a default-safe re-plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Directive {
    Advance,
    Retry,
    Fallback,
    AwaitUser,
    Abort,
    Complete,
    Replan,
    #[serde(other)]
    Unknown,
}

/// Result of one planner invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannerOutcome {
    /// The authoritative plan; overwrites any prior plan in the context.
    pub plan: MasterPlan,
    pub issued_at: u64,
    /// Extra history entry to append on top of the plan's own history.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_entry: Option<PlanHistoryEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

/// Everything a reflector receives for one reflection.
#[derive(Debug, Clone)]
pub struct ReflectionInput {
    pub plan: MasterPlan,
    pub current_step: PlanItem,
    pub observation: Option<Observation>,
    pub snapshot: AgentContextSnapshot,
    /// 1-based attempt number for the current step.
    pub attempt: u32,
}

/// Result of one reflector invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReflectionOutcome {
    pub directive: Directive,
    /// The revised plan; overwrites the stored plan.
    pub plan: MasterPlan,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_entry: Option<PlanHistoryEntry>,
    /// Free-form note; surfaces in working memory as `reflectMessage` (and as
    /// `abortReason` when the directive is `abort`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Open metadata. The `taskUpdates` key, when it holds a list of task
    /// nodes, is applied to the task tree by the machine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl ReflectionOutcome {
    pub fn new(directive: Directive, plan: MasterPlan) -> Self {
        Self {
            directive,
            plan,
            history_entry: None,
            message: None,
            metadata: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Attach task-tree updates under the `taskUpdates` metadata key.
    pub fn with_task_updates(mut self, updates: Vec<TaskNode>) -> Self {
        let encoded = serde_json::to_value(&updates).unwrap_or(Value::Array(Vec::new()));
        self.metadata
            .get_or_insert_with(Map::new)
            .insert(TASK_UPDATES_KEY.to_string(), encoded);
        self
    }

    /// Task updates parsed from metadata. Entries that do not decode as task
    /// nodes are dropped.
    pub fn task_updates(&self) -> Vec<TaskNode> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get(TASK_UPDATES_KEY))
            .and_then(|v| serde_json::from_value::<Vec<TaskNode>>(v.clone()).ok())
            .unwrap_or_default()
    }
}

/// Produces the master plan for a run.
///
/// The machine supplies a snapshot; the planner may call out to external
/// services. The returned plan is authoritative and replaces whatever plan
/// the context held before.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, snapshot: AgentContextSnapshot) -> CollabResult<PlannerOutcome>;
}

/// Judges one execution and selects the next transition.
///
/// Must return a structurally valid plan along with the directive; a
/// reflector that wants to update task statuses does so through
/// `metadata.taskUpdates`, not by editing the plan's steps in place.
#[async_trait]
pub trait Reflector: Send + Sync {
    async fn reflect(&self, input: ReflectionInput) -> CollabResult<ReflectionOutcome>;
}
