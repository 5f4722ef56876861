//! Debug bridge: the HTTP surface remote observers connect to.
//!
//! Three endpoints, CORS-open:
//!
//! - `GET /health` — liveness probe, `{"status":"ok"}`.
//! - `GET /events` — server-sent events. A fresh client first receives every
//!   buffered snapshot (`event: snapshot`), then every buffered bus event
//!   (`event: bus-event`), then live delivery from both feeds in emission
//!   order. The stream stays open until the client disconnects; dropping the
//!   connection drops the broadcast receivers and unsubscribes.
//! - `POST /run` — submits a root task and runs one agent end-to-end,
//!   responding with the final run result. Runs are serialised process-wide:
//!   a second request waits for the first run to finish.
//!
//! History buffers grow for the lifetime of the process; recycle the process
//! to bound memory on long sessions.

use std::convert::Infallible;
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::Stream;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tower_http::cors::{Any, CorsLayer};

use crate::agentloop::bus::{payload, BusEvent, BusEventType};
use crate::agentloop::context::{TaskNode, TaskStatus};
use crate::agentloop::runtime::AgentRuntime;

/// Default listening port.
pub const DEFAULT_PORT: u16 = 3030;

/// SSE event name carrying an [`AgentContextSnapshot`](crate::agentloop::context::AgentContextSnapshot).
const SSE_SNAPSHOT: &str = "snapshot";
/// SSE event name carrying a [`BusEvent`].
const SSE_BUS_EVENT: &str = "bus-event";

#[derive(Clone)]
struct BridgeState {
    runtime: Arc<AgentRuntime>,
    run_slot: Arc<tokio::sync::Mutex<()>>,
}

/// Body of `POST /run`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunRequest {
    root_task: RootTaskSpec,
    #[serde(default)]
    metadata: Option<Map<String, Value>>,
}

/// Caller-supplied root task. An omitted `taskId` gets a generated one.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RootTaskSpec {
    #[serde(default)]
    task_id: Option<String>,
    description: String,
    status: TaskStatus,
    #[serde(default)]
    parent_id: Option<String>,
    #[serde(default)]
    children: Option<Vec<String>>,
    #[serde(default)]
    metadata: Option<Map<String, Value>>,
}

impl RootTaskSpec {
    fn into_task_node(self) -> TaskNode {
        let mut node = match self.task_id {
            Some(task_id) => TaskNode::with_id(task_id, self.description),
            None => TaskNode::new(self.description),
        }
        .with_status(self.status);
        node.parent_id = self.parent_id;
        node.children = self.children;
        node.metadata = self.metadata;
        node
    }
}

/// The HTTP server that fans a runtime's state out to remote debuggers.
pub struct BridgeServer {
    runtime: Arc<AgentRuntime>,
    port: u16,
    run_slot: Arc<tokio::sync::Mutex<()>>,
}

impl BridgeServer {
    pub fn new(runtime: Arc<AgentRuntime>) -> Self {
        Self {
            runtime,
            port: DEFAULT_PORT,
            run_slot: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// The axum router, usable standalone (e.g. under a test harness).
    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            .route("/health", get(health))
            .route("/events", get(events))
            .route("/run", post(run))
            .layer(cors)
            .with_state(BridgeState {
                runtime: self.runtime.clone(),
                run_slot: self.run_slot.clone(),
            })
    }

    /// Serve on localhost at the configured port until ctrl-c.
    pub async fn serve(self) -> Result<(), Box<dyn Error + Send + Sync>> {
        let port = self.port;
        self.serve_at(SocketAddr::from(([127, 0, 0, 1], port))).await
    }

    /// Serve at an explicit address until ctrl-c.
    pub async fn serve_at(self, addr: SocketAddr) -> Result<(), Box<dyn Error + Send + Sync>> {
        let app = self.router();
        let listener = tokio::net::TcpListener::bind(addr).await?;
        log::info!("bridge listening on {}", listener.local_addr()?);
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                if tokio::signal::ctrl_c().await.is_err() {
                    futures_util::future::pending::<()>().await;
                }
            })
            .await?;
        Ok(())
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn events(
    State(state): State<BridgeState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    // Attach to both feeds before building the stream so history plus live
    // delivery covers everything exactly once. Snapshots replay first.
    let (snapshot_history, snapshot_rx) = state.runtime.snapshots().attach();
    let (event_history, event_rx) = state.runtime.bus().attach();

    let replay_snapshots = tokio_stream::iter(snapshot_history)
        .map(|s| Ok::<_, Infallible>(sse_message(SSE_SNAPSHOT, &s)));
    let replay_events = tokio_stream::iter(event_history)
        .map(|e| Ok::<_, Infallible>(sse_message(SSE_BUS_EVENT, &e)));

    let live_snapshots = BroadcastStream::new(snapshot_rx).filter_map(|msg| match msg {
        Ok(snapshot) => Some(Ok::<_, Infallible>(sse_message(SSE_SNAPSHOT, &snapshot))),
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            Some(Ok(sse_message(SSE_BUS_EVENT, &lag_event(skipped))))
        }
    });
    let live_events = BroadcastStream::new(event_rx).filter_map(|msg| match msg {
        Ok(event) => Some(Ok::<_, Infallible>(sse_message(SSE_BUS_EVENT, &event))),
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            Some(Ok(sse_message(SSE_BUS_EVENT, &lag_event(skipped))))
        }
    });

    let stream = replay_snapshots
        .chain(replay_events)
        .chain(live_snapshots.merge(live_events));

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

async fn run(State(state): State<BridgeState>, Json(request): Json<RunRequest>) -> Response {
    // At most one run in progress across the whole process; later requests
    // wait here for the prior run to finish.
    let _slot = state.run_slot.lock().await;

    if request.root_task.description.trim().is_empty() {
        log::error!("run rejected: empty root task description");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "rootTask.description must not be empty" })),
        )
            .into_response();
    }

    let root = request.root_task.into_task_node();
    let metadata = request.metadata.unwrap_or_default();

    // Surface the submission itself to observers before the run starts.
    state.runtime.bus().emit(
        BusEvent::new(
            BusEventType::UserInput,
            root.task_id.clone(),
            payload(json!({
                "taskId": root.task_id,
                "description": root.description,
            })),
        )
        .with_related_task(root.task_id.clone()),
    );

    let result = state.runtime.run(root, metadata).await;
    (StatusCode::OK, Json(result)).into_response()
}

fn sse_message(name: &str, body: &impl serde::Serialize) -> Event {
    Event::default()
        .event(name)
        .data(serde_json::to_string(body).unwrap_or_default())
}

/// Observable marker for the drop-on-lag policy of slow subscribers.
fn lag_event(skipped: u64) -> BusEvent {
    BusEvent::new(
        BusEventType::AgentLog,
        "bridge",
        payload(json!({
            "reason": "subscriber-lagging",
            "skipped": skipped,
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentloop::plan::{MasterPlan, PlanItem, ToolStep};
    use crate::agentloop::planner::{
        CollabResult, Directive, Planner, PlannerOutcome, ReflectionInput, ReflectionOutcome,
        Reflector,
    };
    use crate::agentloop::context::AgentContextSnapshot;
    use crate::agentloop::now_ms;
    use crate::agentloop::tool::ToolRegistry;
    use crate::agentloop::tools::EchoTool;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use tower::util::ServiceExt;

    struct OneStepPlanner;

    #[async_trait]
    impl Planner for OneStepPlanner {
        async fn plan(&self, _snapshot: AgentContextSnapshot) -> CollabResult<PlannerOutcome> {
            let step = PlanItem::new(
                "s-1",
                "Echo",
                ToolStep::new("echo").with_parameters(
                    json!({ "goal": "hello" }).as_object().cloned().unwrap(),
                ),
                "echoed",
            );
            Ok(PlannerOutcome {
                plan: MasterPlan::new(vec![step]),
                issued_at: now_ms(),
                history_entry: None,
                metadata: None,
            })
        }
    }

    struct CompleteReflector;

    #[async_trait]
    impl Reflector for CompleteReflector {
        async fn reflect(&self, input: ReflectionInput) -> CollabResult<ReflectionOutcome> {
            Ok(ReflectionOutcome::new(Directive::Complete, input.plan))
        }
    }

    fn server() -> BridgeServer {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool::new()));
        let runtime = AgentRuntime::new(
            Arc::new(OneStepPlanner),
            Arc::new(CompleteReflector),
            Arc::new(registry),
        );
        BridgeServer::new(Arc::new(runtime))
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let response = server()
            .router()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body, json!({ "status": "ok" }));
    }

    #[tokio::test]
    async fn test_run_rejects_empty_description() {
        let body = json!({
            "rootTask": { "description": "   ", "status": "pending" }
        });
        let response = server()
            .router()
            .oneshot(
                Request::post("/run")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let decoded: Value = serde_json::from_slice(&bytes).unwrap();
        assert!(decoded["error"].as_str().unwrap().contains("description"));
    }

    #[test]
    fn test_root_task_spec_defaults() {
        let spec: RootTaskSpec = serde_json::from_value(json!({
            "description": "Echo hi",
            "status": "pending"
        }))
        .unwrap();
        let node = spec.into_task_node();
        assert!(!node.task_id.is_empty());
        assert_eq!(node.status, TaskStatus::Pending);
        assert!(node.children.is_none());
    }
}
