//! Agent context store.
//!
//! The [`AgentContext`] is the single authoritative mutable store for one
//! agent run: task tree, observations, working memory, metadata, the
//! iteration counter, and the current [`MasterPlan`]. It is exclusively owned
//! by the state machine for the duration of a run; everyone else reads
//! through [`AgentContext::snapshot`], which hands out fully-owned copies
//! that never alias the live store.
//!
//! The context deliberately does not validate the shape of what it is given
//! beyond keeping the root task resolvable — planners and reflectors are
//! responsible for producing structurally sound updates.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::agentloop::now_ms;
use crate::agentloop::plan::MasterPlan;

/// Lifecycle of a task-tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
}

/// A node in the task tree.
///
/// `children` is `None` when the caller did not supply a list; the context
/// preserves the stored list in that case (and normalises to an empty list on
/// first insert). `created_at`/`updated_at` of zero mean "let the store stamp
/// it".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskNode {
    pub task_id: String,
    pub description: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub updated_at: u64,
}

impl TaskNode {
    /// Build a pending task with a fresh id.
    pub fn new(description: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), description)
    }

    /// Build a pending task with a caller-chosen id.
    pub fn with_id(task_id: impl Into<String>, description: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            task_id: task_id.into(),
            description: description.into(),
            status: TaskStatus::Pending,
            parent_id: None,
            children: None,
            metadata: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Child ids, empty when none were recorded.
    pub fn child_ids(&self) -> &[String] {
        self.children.as_deref().unwrap_or(&[])
    }
}

/// Where a piece of evidence came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationSource {
    Tool,
    User,
    System,
}

/// Evidence from one execution. Append-only; observations never expire
/// during a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    pub source: ObservationSource,
    pub related_task_id: String,
    pub timestamp: u64,
    pub payload: Map<String, Value>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Immutable view of an [`AgentContext`] at a point in time.
///
/// Snapshots are copies all the way down; mutating the live context after a
/// snapshot was taken never changes the snapshot, and a snapshot survives a
/// JSON encode/decode round trip structurally intact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentContextSnapshot {
    pub agent_id: String,
    pub root_task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_task_id: Option<String>,
    pub tasks: HashMap<String, TaskNode>,
    pub observations: Vec<Observation>,
    pub working_memory: Map<String, Value>,
    pub metadata: Map<String, Value>,
    pub iteration: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_plan: Option<MasterPlan>,
}

impl AgentContextSnapshot {
    /// Convenience accessor for a working-memory string value.
    pub fn memory_str(&self, key: &str) -> Option<&str> {
        self.working_memory.get(key).and_then(|v| v.as_str())
    }
}

/// Selective update applied through [`AgentContext::patch`].
///
/// `working_memory` and `metadata` are shallow-merged into the current maps;
/// `tasks` and `observations` fully replace them. `iteration` is either set
/// explicitly or incremented by one iff `active_task_id` was part of the
/// update.
#[derive(Debug, Clone, Default)]
pub struct ContextPatch {
    pub tasks: Option<HashMap<String, TaskNode>>,
    pub observations: Option<Vec<Observation>>,
    pub working_memory: Option<Map<String, Value>>,
    pub metadata: Option<Map<String, Value>>,
    pub active_task_id: Option<String>,
    pub iteration: Option<u64>,
}

/// The mutable store for one agent run.
pub struct AgentContext {
    agent_id: String,
    root_task_id: String,
    active_task_id: Option<String>,
    tasks: HashMap<String, TaskNode>,
    observations: Vec<Observation>,
    working_memory: Map<String, Value>,
    metadata: Map<String, Value>,
    iteration: u64,
    master_plan: Option<MasterPlan>,
}

impl AgentContext {
    /// Create a context rooted at the given task.
    pub fn new(agent_id: impl Into<String>, root_task: TaskNode, metadata: Map<String, Value>) -> Self {
        let root_task_id = root_task.task_id.clone();
        let mut context = Self {
            agent_id: agent_id.into(),
            root_task_id,
            active_task_id: None,
            tasks: HashMap::new(),
            observations: Vec::new(),
            working_memory: Map::new(),
            metadata,
            iteration: 0,
            master_plan: None,
        };
        context.upsert_task(root_task);
        context
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn root_task_id(&self) -> &str {
        &self.root_task_id
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// Deep copy of the current state. Never shares mutable data with the
    /// live store.
    pub fn snapshot(&self) -> AgentContextSnapshot {
        AgentContextSnapshot {
            agent_id: self.agent_id.clone(),
            root_task_id: self.root_task_id.clone(),
            active_task_id: self.active_task_id.clone(),
            tasks: self.tasks.clone(),
            observations: self.observations.clone(),
            working_memory: self.working_memory.clone(),
            metadata: self.metadata.clone(),
            iteration: self.iteration,
            master_plan: self.master_plan.clone(),
        }
    }

    /// Move the active-task pointer and bump the iteration counter by one.
    pub fn set_active_task(&mut self, task_id: Option<String>) {
        self.active_task_id = task_id;
        self.iteration += 1;
    }

    /// Insert or update a task node.
    ///
    /// On first insert a zero `created_at` is stamped with the current time
    /// and an omitted `children` list becomes empty. On update the stored
    /// `created_at` survives, `updated_at` is refreshed, and the stored
    /// `children` list is preserved when the incoming node omitted one.
    pub fn upsert_task(&mut self, mut node: TaskNode) {
        let now = now_ms();
        match self.tasks.get(&node.task_id) {
            Some(existing) => {
                node.created_at = existing.created_at;
                if node.children.is_none() {
                    node.children = existing.children.clone();
                }
            }
            None => {
                if node.created_at == 0 {
                    node.created_at = now;
                }
                if node.children.is_none() {
                    node.children = Some(Vec::new());
                }
            }
        }
        node.updated_at = now.max(node.created_at);
        self.tasks.insert(node.task_id.clone(), node);
    }

    /// Record `child_id` under `parent_id`. Idempotent; linking to an
    /// unknown parent is a silent no-op.
    pub fn link_child(&mut self, parent_id: &str, child_id: &str) {
        if let Some(parent) = self.tasks.get_mut(parent_id) {
            let children = parent.children.get_or_insert_with(Vec::new);
            if !children.iter().any(|c| c == child_id) {
                children.push(child_id.to_string());
                parent.updated_at = now_ms().max(parent.updated_at);
            }
        }
    }

    pub fn task(&self, task_id: &str) -> Option<&TaskNode> {
        self.tasks.get(task_id)
    }

    /// Append one observation.
    pub fn add_observation(&mut self, observation: Observation) {
        self.observations.push(observation);
    }

    /// Shallow-merge entries into working memory; keys not mentioned survive.
    pub fn merge_working_memory(&mut self, entries: Map<String, Value>) {
        for (key, value) in entries {
            self.working_memory.insert(key, value);
        }
    }

    pub fn set_master_plan(&mut self, plan: Option<MasterPlan>) {
        self.master_plan = plan;
    }

    pub fn master_plan(&self) -> Option<&MasterPlan> {
        self.master_plan.as_ref()
    }

    /// Apply a selective update. See [`ContextPatch`] for the merge/replace
    /// semantics of each field. The root task always stays resolvable: a
    /// replacement task map that dropped it gets the previous root node
    /// re-inserted.
    pub fn patch(&mut self, update: ContextPatch) {
        let active_in_update = update.active_task_id.is_some();

        if let Some(tasks) = update.tasks {
            let previous_root = self.tasks.remove(&self.root_task_id);
            self.tasks = tasks;
            if !self.tasks.contains_key(&self.root_task_id) {
                if let Some(root) = previous_root {
                    self.tasks.insert(self.root_task_id.clone(), root);
                }
            }
        }
        if let Some(observations) = update.observations {
            self.observations = observations;
        }
        if let Some(memory) = update.working_memory {
            self.merge_working_memory(memory);
        }
        if let Some(metadata) = update.metadata {
            for (key, value) in metadata {
                self.metadata.insert(key, value);
            }
        }
        if let Some(task_id) = update.active_task_id {
            self.active_task_id = Some(task_id);
        }
        match update.iteration {
            Some(iteration) => self.iteration = iteration,
            None if active_in_update => self.iteration += 1,
            None => {}
        }
    }
}
