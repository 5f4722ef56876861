//! HTTP-level tests for the debug bridge: health, run submission and
//! serialisation, CORS, and the SSE replay-then-live contract.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures_util::StreamExt;
use serde_json::{json, Value};
use tower::util::ServiceExt;

use agentloop::bridge::BridgeServer;
use agentloop::context::AgentContextSnapshot;
use agentloop::machine::AgentRunResult;
use agentloop::plan::{MasterPlan, PlanItem, ToolStep};
use agentloop::planner::{
    CollabResult, Directive, Planner, PlannerOutcome, ReflectionInput, ReflectionOutcome, Reflector,
};
use agentloop::runtime::AgentRuntime;
use agentloop::tool::ToolRegistry;
use agentloop::tools::EchoTool;

struct OneStepPlanner;

#[async_trait]
impl Planner for OneStepPlanner {
    async fn plan(&self, snapshot: AgentContextSnapshot) -> CollabResult<PlannerOutcome> {
        let goal = snapshot
            .tasks
            .get(&snapshot.root_task_id)
            .map(|t| t.description.clone())
            .unwrap_or_default();
        let step = PlanItem::new(
            "s-1",
            "Echo the goal",
            ToolStep::new("echo").with_parameters(
                json!({ "goal": goal }).as_object().cloned().unwrap(),
            ),
            "goal echoed",
        )
        .with_related_task(snapshot.root_task_id.clone());
        Ok(PlannerOutcome {
            plan: MasterPlan::new(vec![step]),
            issued_at: agentloop::agentloop::now_ms(),
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

fn runtime() -> Arc<AgentRuntime> {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(EchoTool::new()));
    Arc::new(AgentRuntime::new(
        Arc::new(OneStepPlanner),
        Arc::new(CompleteReflector),
        Arc::new(registry),
    ))
}

fn run_body(description: &str) -> Body {
    Body::from(
        json!({
            "rootTask": {
                "taskId": "t-root",
                "description": description,
                "status": "pending"
            }
        })
        .to_string(),
    )
}

async fn post_run(server: &BridgeServer, description: &str) -> (StatusCode, Value) {
    let response = server
        .router()
        .oneshot(
            Request::post("/run")
                .header("content-type", "application/json")
                .body(run_body(description))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

/// One parsed SSE message.
#[derive(Debug)]
struct SseMessage {
    event: String,
    data: Value,
}

/// Read SSE messages off a body stream until `count` have arrived.
async fn read_messages(
    stream: &mut (impl futures_util::Stream<Item = Result<axum::body::Bytes, axum::Error>> + Unpin),
    buffer: &mut String,
    count: usize,
) -> Vec<SseMessage> {
    let mut messages = Vec::new();
    loop {
        while let Some(boundary) = buffer.find("\n\n") {
            let raw: String = buffer.drain(..boundary + 2).collect();
            let mut event = String::new();
            let mut data = String::new();
            for line in raw.lines() {
                if let Some(rest) = line.strip_prefix("event: ") {
                    event = rest.to_string();
                } else if let Some(rest) = line.strip_prefix("data: ") {
                    data = rest.to_string();
                }
            }
            if event.is_empty() && data.is_empty() {
                continue; // keep-alive comment
            }
            messages.push(SseMessage {
                event,
                data: serde_json::from_str(&data).unwrap_or(Value::Null),
            });
            if messages.len() == count {
                return messages;
            }
        }

        let chunk = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("timed out waiting for SSE data")
            .expect("SSE stream ended early")
            .expect("SSE stream errored");
        buffer.push_str(std::str::from_utf8(&chunk).unwrap());
    }
}

#[tokio::test]
async fn test_health_is_ok() {
    let server = BridgeServer::new(runtime());
    let response = server
        .router()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_cors_preflight_allows_any_origin() {
    let server = BridgeServer::new(runtime());
    let response = server
        .router()
        .oneshot(
            Request::options("/run")
                .header("origin", "http://debugger.example")
                .header("access-control-request-method", "POST")
                .header("access-control-request-headers", "content-type")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-origin")
            .unwrap(),
        "*"
    );
}

#[tokio::test]
async fn test_run_returns_final_result() {
    let server = BridgeServer::new(runtime());
    let (status, body) = post_run(&server, "Echo hi").await;

    assert_eq!(status, StatusCode::OK);
    let result: AgentRunResult = serde_json::from_value(body).unwrap();
    assert_eq!(serde_json::to_value(result.state).unwrap(), "finish");
    assert_eq!(result.iterations, 1);
    assert_eq!(result.final_snapshot.root_task_id, "t-root");
    let observation = result.last_observation.unwrap();
    assert!(observation.success);
    assert_eq!(observation.payload["echo"], json!("Echo hi"));
}

#[tokio::test]
async fn test_concurrent_runs_are_serialised() {
    let rt = runtime();
    let server = BridgeServer::new(rt.clone());

    let (a, b) = tokio::join!(post_run(&server, "first"), post_run(&server, "second"));
    assert_eq!(a.0, StatusCode::OK);
    assert_eq!(b.0, StatusCode::OK);

    // Group machine events by agent id: with serialised runs, one agent's
    // whole event range precedes the other's.
    let events = rt.bus().history();
    let mut ranges: Vec<(String, usize, usize)> = Vec::new();
    for (index, event) in events.iter().enumerate() {
        if let Some(agent_id) = event.payload.get("agentId").and_then(|v| v.as_str()) {
            match ranges.iter_mut().find(|(id, _, _)| id == agent_id) {
                Some((_, _, last)) => *last = index,
                None => ranges.push((agent_id.to_string(), index, index)),
            }
        }
    }
    assert_eq!(ranges.len(), 2);
    let (first, second) = (&ranges[0], &ranges[1]);
    assert!(
        first.2 < second.1,
        "run event ranges overlap: {:?} vs {:?}",
        first,
        second
    );
}

#[tokio::test]
async fn test_events_replays_history_then_streams_live() {
    let rt = runtime();
    let server = BridgeServer::new(rt.clone());

    // One completed run before the client connects.
    let (status, _) = post_run(&server, "Echo hi").await;
    assert_eq!(status, StatusCode::OK);

    let snapshot_count = rt.snapshots().history().len();
    let event_count = rt.bus().history().len();
    assert_eq!(snapshot_count, 5); // plan, act, observe, reflect, finish
    assert_eq!(event_count, 8); // user.input + transitions + tool pair + finished

    let response = server
        .router()
        .oneshot(Request::get("/events").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );

    let mut stream = response.into_body().into_data_stream();
    let mut buffer = String::new();

    // Replay: every buffered snapshot strictly before every buffered event.
    let replay = read_messages(&mut stream, &mut buffer, snapshot_count + event_count).await;
    let names: Vec<&str> = replay.iter().map(|m| m.event.as_str()).collect();
    for (index, name) in names.iter().enumerate() {
        if index < snapshot_count {
            assert_eq!(*name, "snapshot", "message {} out of order", index);
        } else {
            assert_eq!(*name, "bus-event", "message {} out of order", index);
        }
    }
    assert_eq!(replay[snapshot_count].data["type"], json!("user.input"));
    assert_eq!(
        replay.last().unwrap().data["type"],
        json!("agent.finished")
    );

    // A second run streams in live on the already-open connection.
    let (status, _) = post_run(&server, "Echo again").await;
    assert_eq!(status, StatusCode::OK);

    let live = read_messages(&mut stream, &mut buffer, snapshot_count + event_count).await;
    assert_eq!(
        live.iter().filter(|m| m.event == "snapshot").count(),
        snapshot_count
    );
    assert_eq!(
        live.iter().filter(|m| m.event == "bus-event").count(),
        event_count
    );

    // No duplicates across replay and live delivery.
    let mut event_ids = HashSet::new();
    for message in replay.iter().chain(live.iter()) {
        if message.event == "bus-event" {
            let id = message.data["eventId"].as_str().unwrap().to_string();
            assert!(event_ids.insert(id), "duplicate bus event delivered");
        }
    }
    assert_eq!(event_ids.len(), event_count * 2);
}
