//! Internal event bus.
//!
//! Single-writer, multi-reader broadcast of [`BusEvent`] values with a
//! replayable in-memory history. Every component that wants visibility into a
//! run (the executor, the runtime wrapper around the state machine, the debug
//! bridge) shares one [`EventBus`] handle; emitters never block on slow
//! consumers, and a consumer that attaches late can be brought up to date via
//! [`EventBus::attach`].

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::agentloop::now_ms;

/// Discriminator for events flowing over the bus.
///
/// Serialized as the dotted names used on the wire (`tool.request`,
/// `agent.transition`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusEventType {
    #[serde(rename = "tool.request")]
    ToolRequest,
    #[serde(rename = "tool.result")]
    ToolResult,
    #[serde(rename = "user.input")]
    UserInput,
    #[serde(rename = "system.alert")]
    SystemAlert,
    #[serde(rename = "agent.transition")]
    AgentTransition,
    #[serde(rename = "agent.log")]
    AgentLog,
    #[serde(rename = "agent.finished")]
    AgentFinished,
}

/// One broadcast event.
///
/// `trace_id` correlates related events: a `tool.result` always carries the
/// `trace_id` of the `tool.request` that triggered it, and agent transition
/// events carry the active (or root) task id so observers can group a plan's
/// execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusEvent {
    pub event_id: String,
    #[serde(rename = "type")]
    pub event_type: BusEventType,
    pub timestamp: u64,
    pub trace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_task_id: Option<String>,
    pub payload: Map<String, Value>,
}

impl BusEvent {
    /// Create an event with a fresh id and the current wall-clock timestamp.
    pub fn new(
        event_type: BusEventType,
        trace_id: impl Into<String>,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            event_type,
            timestamp: now_ms(),
            trace_id: trace_id.into(),
            related_task_id: None,
            payload,
        }
    }

    /// Attach the task id this event relates to (builder pattern).
    pub fn with_related_task(mut self, task_id: impl Into<String>) -> Self {
        self.related_task_id = Some(task_id.into());
        self
    }
}

/// Broadcast bus with bounded per-subscriber buffers and unbounded history.
///
/// Built on [`tokio::sync::broadcast`]: each subscriber owns an individual
/// buffer of up to `CHANNEL_CAPACITY` events. A subscriber that falls behind
/// observes a `Lagged` gap on its receiver and skips ahead; the emitter and
/// the other subscribers are never blocked. Delivery to any one subscriber is
/// always in emission order.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
    history: Arc<Mutex<Vec<BusEvent>>>,
}

const CHANNEL_CAPACITY: usize = 2048;

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            history: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Publish an event to every currently-attached subscriber and record it
    /// in the history. Never blocks; an event emitted with no subscribers is
    /// still recorded.
    pub fn emit(&self, event: BusEvent) {
        // The history lock is held across the send so that attach() observes
        // a consistent cut: an event lands either in the cloned history or on
        // the new receiver, never both, never neither.
        let mut history = lock_history(&self.history);
        history.push(event.clone());
        let _ = self.tx.send(event);
    }

    /// Open a live feed. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }

    /// Atomically snapshot the history and open a live feed starting at the
    /// cut point. The returned history plus the receiver together cover every
    /// event exactly once.
    pub fn attach(&self) -> (Vec<BusEvent>, broadcast::Receiver<BusEvent>) {
        let history = lock_history(&self.history);
        (history.clone(), self.tx.subscribe())
    }

    /// Copy of all events emitted so far, in emission order.
    pub fn history(&self) -> Vec<BusEvent> {
        lock_history(&self.history).clone()
    }

    /// Live feed restricted to a single event type.
    pub fn subscribe_type(&self, event_type: BusEventType) -> TypedEvents {
        TypedEvents {
            rx: self.tx.subscribe(),
            event_type,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_history(history: &Mutex<Vec<BusEvent>>) -> std::sync::MutexGuard<'_, Vec<BusEvent>> {
    history.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A bus feed filtered down to one [`BusEventType`].
pub struct TypedEvents {
    rx: broadcast::Receiver<BusEvent>,
    event_type: BusEventType,
}

impl TypedEvents {
    /// Next matching event, skipping events of other types and any lag gaps.
    /// Returns `None` once the bus is dropped.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.event_type == self.event_type => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Coerce a `json!({...})` literal into the map shape used by event payloads.
///
/// Non-object values produce an empty map; callers only ever pass object
/// literals.
pub(crate) fn payload(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
