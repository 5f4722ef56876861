//! Run orchestration around the state machine.
//!
//! The [`AgentRuntime`] owns everything that outlives a single run: the event
//! bus, the snapshot feed, the tool registry, and the planner/reflector
//! collaborators. Each call to [`AgentRuntime::run`] builds a fresh
//! [`AgentContext`] and machine, wires in an observer that broadcasts every
//! state change (a snapshot on the snapshot feed plus an `agent.transition`
//! or `agent.finished` event on the bus), and drives the machine to its
//! terminal state.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::agentloop::bus::{payload, BusEvent, BusEventType, EventBus};
use crate::agentloop::context::{AgentContext, AgentContextSnapshot, TaskNode};
use crate::agentloop::executor::Executor;
use crate::agentloop::machine::{
    AgentMachine, AgentRunResult, AgentState, GuardConfig, StopToken, TransitionObserver,
};
use crate::agentloop::planner::{Planner, Reflector};
use crate::agentloop::tool::ToolRegistry;

const SNAPSHOT_CHANNEL_CAPACITY: usize = 2048;

/// Broadcast feed of context snapshots with replayable history.
///
/// Same shape as the [`EventBus`]: bounded per-subscriber buffers, unbounded
/// history, and an [`attach`](SnapshotFeed::attach) that cuts history and
/// live delivery without gaps or duplicates.
#[derive(Clone)]
pub struct SnapshotFeed {
    tx: broadcast::Sender<AgentContextSnapshot>,
    history: Arc<Mutex<Vec<AgentContextSnapshot>>>,
}

impl SnapshotFeed {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(SNAPSHOT_CHANNEL_CAPACITY);
        Self {
            tx,
            history: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn publish(&self, snapshot: AgentContextSnapshot) {
        let mut history = lock(&self.history);
        history.push(snapshot.clone());
        let _ = self.tx.send(snapshot);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentContextSnapshot> {
        self.tx.subscribe()
    }

    pub fn attach(
        &self,
    ) -> (
        Vec<AgentContextSnapshot>,
        broadcast::Receiver<AgentContextSnapshot>,
    ) {
        let history = lock(&self.history);
        (history.clone(), self.tx.subscribe())
    }

    pub fn history(&self) -> Vec<AgentContextSnapshot> {
        lock(&self.history).clone()
    }
}

impl Default for SnapshotFeed {
    fn default() -> Self {
        Self::new()
    }
}

fn lock(
    history: &Mutex<Vec<AgentContextSnapshot>>,
) -> std::sync::MutexGuard<'_, Vec<AgentContextSnapshot>> {
    history.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Observer that implements the transition-broadcast contract.
struct RuntimeObserver {
    bus: EventBus,
    snapshots: SnapshotFeed,
}

#[async_trait]
impl TransitionObserver for RuntimeObserver {
    async fn on_transition(&self, state: AgentState, snapshot: &AgentContextSnapshot) {
        self.snapshots.publish(snapshot.clone());

        let event_type = if state == AgentState::Finish {
            BusEventType::AgentFinished
        } else {
            BusEventType::AgentTransition
        };
        let trace_id = snapshot
            .active_task_id
            .clone()
            .unwrap_or_else(|| snapshot.root_task_id.clone());

        self.bus.emit(BusEvent::new(
            event_type,
            trace_id.clone(),
            payload(json!({
                "agentId": snapshot.agent_id,
                "state": state,
                "iteration": snapshot.iteration,
                "activeTaskId": snapshot.active_task_id,
            })),
        ));

        if state == AgentState::Error {
            let message = snapshot
                .memory_str("lastError")
                .unwrap_or("unknown failure")
                .to_string();
            self.bus.emit(BusEvent::new(
                BusEventType::AgentLog,
                trace_id,
                payload(json!({
                    "agentId": snapshot.agent_id,
                    "message": message,
                })),
            ));
        }
    }
}

/// Long-lived wiring for agent runs.
pub struct AgentRuntime {
    bus: EventBus,
    snapshots: SnapshotFeed,
    registry: Arc<ToolRegistry>,
    planner: Arc<dyn Planner>,
    reflector: Arc<dyn Reflector>,
    guards: GuardConfig,
}

impl AgentRuntime {
    pub fn new(
        planner: Arc<dyn Planner>,
        reflector: Arc<dyn Reflector>,
        registry: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            bus: EventBus::new(),
            snapshots: SnapshotFeed::new(),
            registry,
            planner,
            reflector,
            guards: GuardConfig::default(),
        }
    }

    pub fn with_guards(mut self, guards: GuardConfig) -> Self {
        self.guards = guards;
        self
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn snapshots(&self) -> &SnapshotFeed {
        &self.snapshots
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Run one agent end-to-end with an internally-created stop token.
    pub async fn run(&self, root_task: TaskNode, metadata: Map<String, Value>) -> AgentRunResult {
        self.run_with_stop(root_task, metadata, StopToken::new()).await
    }

    /// Run one agent end-to-end; the supplied token lets callers stop the
    /// machine at its next transition.
    pub async fn run_with_stop(
        &self,
        root_task: TaskNode,
        metadata: Map<String, Value>,
        stop: StopToken,
    ) -> AgentRunResult {
        let agent_id = Uuid::new_v4().to_string();
        let context = AgentContext::new(agent_id, root_task, metadata);
        let executor = Executor::new(self.registry.clone(), self.bus.clone());
        let observer = Arc::new(RuntimeObserver {
            bus: self.bus.clone(),
            snapshots: self.snapshots.clone(),
        });

        AgentMachine::new(
            context,
            self.planner.clone(),
            executor,
            self.reflector.clone(),
        )
        .with_guards(self.guards.clone())
        .with_observer(observer)
        .with_stop_token(stop)
        .run()
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(iteration: u64) -> AgentContextSnapshot {
        let ctx = AgentContext::new("agent-1", TaskNode::with_id("t-root", "root"), Map::new());
        let mut snap = ctx.snapshot();
        snap.iteration = iteration;
        snap
    }

    #[tokio::test]
    async fn test_snapshot_feed_attach_covers_all_snapshots() {
        let feed = SnapshotFeed::new();
        feed.publish(snapshot(0));
        feed.publish(snapshot(1));

        let (replay, mut rx) = feed.attach();
        feed.publish(snapshot(2));

        assert_eq!(replay.len(), 2);
        assert_eq!(replay[1].iteration, 1);
        assert_eq!(rx.recv().await.unwrap().iteration, 2);
    }

    #[tokio::test]
    async fn test_observer_publishes_snapshot_and_transition_event() {
        let bus = EventBus::new();
        let snapshots = SnapshotFeed::new();
        let observer = RuntimeObserver {
            bus: bus.clone(),
            snapshots: snapshots.clone(),
        };

        observer.on_transition(AgentState::Plan, &snapshot(0)).await;

        assert_eq!(snapshots.history().len(), 1);
        let events = bus.history();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, BusEventType::AgentTransition);
        assert_eq!(events[0].payload["state"], json!("plan"));
        assert_eq!(events[0].trace_id, "t-root");
    }

    #[tokio::test]
    async fn test_observer_emits_finished_and_error_log() {
        let bus = EventBus::new();
        let observer = RuntimeObserver {
            bus: bus.clone(),
            snapshots: SnapshotFeed::new(),
        };

        let mut failed = snapshot(1);
        failed
            .working_memory
            .insert("lastError".to_string(), json!("planner-failed: boom"));
        observer.on_transition(AgentState::Error, &failed).await;
        observer.on_transition(AgentState::Finish, &snapshot(1)).await;

        let events = bus.history();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].event_type, BusEventType::AgentTransition);
        assert_eq!(events[1].event_type, BusEventType::AgentLog);
        assert_eq!(events[1].payload["message"], json!("planner-failed: boom"));
        assert_eq!(events[2].event_type, BusEventType::AgentFinished);
    }
}
