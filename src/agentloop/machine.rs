//! The Plan / Act / Observe / Reflect state machine.
//!
//! One [`AgentMachine`] drives one agent run from the initial `plan` state to
//! the terminal `finish` state. The machine is deliberately an explicit loop
//! whose body matches on the current state — each state handler does its
//! work against the [`AgentContext`] and returns the next state. The planner,
//! executor, and reflector are plain async calls; there is no actor framework
//! and no hidden queue.
//!
//! # States
//!
//! | state   | does                                                        |
//! |---------|-------------------------------------------------------------|
//! | plan    | run guards, invoke the planner, store the plan, focus a step |
//! | act     | dispatch the focused step through the executor               |
//! | observe | fold the execution result into an observation                |
//! | reflect | invoke the reflector, apply its directive                    |
//! | error   | count the failure, decide between re-plan/reflect/finish     |
//! | finish  | terminal                                                     |
//!
//! Collaborator failures and guard violations are never fatal by themselves:
//! they consume one failure slot and route through `error`. Only an `abort`
//! directive or an exhausted failure budget ends a run early; either way the
//! machine always reaches `finish`.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::agentloop::bus::payload;
use crate::agentloop::context::{
    AgentContext, AgentContextSnapshot, Observation, ObservationSource,
};
use crate::agentloop::executor::{ExecuteRequest, ExecutionResult, Executor};
use crate::agentloop::now_ms;
use crate::agentloop::plan::PlanItem;
use crate::agentloop::planner::{Directive, Planner, ReflectionInput, Reflector};

/// States of the machine. `Finish` is terminal; everything else loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Plan,
    Act,
    Observe,
    Reflect,
    Error,
    Finish,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AgentState::Plan => "plan",
            AgentState::Act => "act",
            AgentState::Observe => "observe",
            AgentState::Reflect => "reflect",
            AgentState::Error => "error",
            AgentState::Finish => "finish",
        };
        write!(f, "{}", name)
    }
}

/// Bounded-resource checks applied on entry to `plan`.
///
/// `max_failures` bounds the whole run's failure budget; the default of 3
/// guarantees that a run whose guards keep tripping still terminates. Pass
/// `None` explicitly to let the reflector fight on forever.
#[derive(Debug, Clone)]
pub struct GuardConfig {
    pub max_duration_ms: Option<u64>,
    pub max_iterations: Option<u64>,
    pub max_failures: Option<u32>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            max_duration_ms: None,
            max_iterations: None,
            max_failures: Some(3),
        }
    }
}

impl GuardConfig {
    pub fn with_max_duration_ms(mut self, limit: u64) -> Self {
        self.max_duration_ms = Some(limit);
        self
    }

    pub fn with_max_iterations(mut self, limit: u64) -> Self {
        self.max_iterations = Some(limit);
        self
    }

    pub fn with_max_failures(mut self, limit: Option<u32>) -> Self {
        self.max_failures = limit;
        self
    }
}

/// A guard violation. Routed through the same failure path as a planner
/// error.
#[derive(Debug, Clone)]
pub enum GuardError {
    DurationExceeded { elapsed_ms: u64, limit_ms: u64 },
    IterationsExceeded { iterations: u64, limit: u64 },
}

impl GuardError {
    pub fn kind(&self) -> &'static str {
        match self {
            GuardError::DurationExceeded { .. } => "guard-duration-exceeded",
            GuardError::IterationsExceeded { .. } => "guard-iterations-exceeded",
        }
    }
}

impl fmt::Display for GuardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuardError::DurationExceeded { elapsed_ms, limit_ms } => write!(
                f,
                "guard-duration-exceeded: {}ms elapsed, limit {}ms",
                elapsed_ms, limit_ms
            ),
            GuardError::IterationsExceeded { iterations, limit } => write!(
                f,
                "guard-iterations-exceeded: {} iterations, limit {}",
                iterations, limit
            ),
        }
    }
}

impl std::error::Error for GuardError {}

/// Cooperative stop signal.
///
/// Honoured at the next state transition; an in-flight tool call is allowed
/// to complete first.
#[derive(Clone, Default)]
pub struct StopToken {
    stopped: Arc<AtomicBool>,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Receives every state change of the machine, paired with a fresh snapshot.
///
/// The default implementation is a no-op, so observers only override what
/// they care about. The runtime's observer turns these callbacks into
/// `agent.transition` / `agent.finished` bus events and snapshot-stream
/// publications.
#[async_trait]
pub trait TransitionObserver: Send + Sync {
    /// Called after the named state's work completed (or, for `finish`, when
    /// the machine enters its terminal state).
    async fn on_transition(&self, _state: AgentState, _snapshot: &AgentContextSnapshot) {}
}

/// Outcome of a completed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRunResult {
    pub state: AgentState,
    pub iterations: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_observation: Option<Observation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_result: Option<ExecutionResult>,
    pub final_snapshot: AgentContextSnapshot,
}

/// Loop-local bookkeeping. Lives exactly as long as one run.
struct LoopState {
    last_snapshot: AgentContextSnapshot,
    current_step: Option<PlanItem>,
    current_step_index: Option<usize>,
    execution_result: Option<ExecutionResult>,
    observation: Option<Observation>,
    /// Tool override for the next act, set by a fallback directive.
    preferred_tool_id: Option<String>,
    /// Error message carried from the failing state into `error`.
    pending_error: Option<String>,
    attempt: u32,
    iterations: u64,
    failures: u32,
    started: Instant,
}

/// Drives one agent run.
pub struct AgentMachine {
    context: AgentContext,
    planner: Arc<dyn Planner>,
    executor: Executor,
    reflector: Arc<dyn Reflector>,
    guards: GuardConfig,
    observer: Option<Arc<dyn TransitionObserver>>,
    stop: StopToken,
}

impl AgentMachine {
    pub fn new(
        context: AgentContext,
        planner: Arc<dyn Planner>,
        executor: Executor,
        reflector: Arc<dyn Reflector>,
    ) -> Self {
        Self {
            context,
            planner,
            executor,
            reflector,
            guards: GuardConfig::default(),
            observer: None,
            stop: StopToken::new(),
        }
    }

    pub fn with_guards(mut self, guards: GuardConfig) -> Self {
        self.guards = guards;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn TransitionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_stop_token(mut self, stop: StopToken) -> Self {
        self.stop = stop;
        self
    }

    /// Handle callers can use to request a stop from outside the run.
    pub fn stop_token(&self) -> StopToken {
        self.stop.clone()
    }

    /// Run to the terminal state. Never returns early: every failure path
    /// converges on `finish`.
    pub async fn run(mut self) -> AgentRunResult {
        let mut loop_state = LoopState {
            last_snapshot: self.context.snapshot(),
            current_step: None,
            current_step_index: None,
            execution_result: None,
            observation: None,
            preferred_tool_id: None,
            pending_error: None,
            attempt: 0,
            iterations: 0,
            failures: 0,
            started: Instant::now(),
        };

        let mut state = AgentState::Plan;
        loop {
            if self.stop.is_stopped() {
                state = AgentState::Finish;
            }
            if state == AgentState::Finish {
                loop_state.last_snapshot = self.context.snapshot();
                self.notify(AgentState::Finish, &loop_state.last_snapshot).await;
                break;
            }

            let next = match state {
                AgentState::Plan => self.run_plan(&mut loop_state).await,
                AgentState::Act => self.run_act(&mut loop_state).await,
                AgentState::Observe => self.run_observe(&mut loop_state),
                AgentState::Reflect => self.run_reflect(&mut loop_state).await,
                AgentState::Error => self.run_error(&mut loop_state),
                AgentState::Finish => AgentState::Finish,
            };

            loop_state.last_snapshot = self.context.snapshot();
            self.notify(state, &loop_state.last_snapshot).await;
            state = next;
        }

        let final_snapshot = loop_state.last_snapshot;
        AgentRunResult {
            state: AgentState::Finish,
            iterations: loop_state.iterations,
            last_observation: final_snapshot.observations.last().cloned(),
            execution_result: loop_state.execution_result,
            final_snapshot,
        }
    }

    async fn notify(&self, state: AgentState, snapshot: &AgentContextSnapshot) {
        if let Some(observer) = &self.observer {
            observer.on_transition(state, snapshot).await;
        }
    }

    fn check_guards(&self, loop_state: &LoopState) -> Result<(), GuardError> {
        if let Some(limit_ms) = self.guards.max_duration_ms {
            let elapsed_ms = loop_state.started.elapsed().as_millis() as u64;
            if elapsed_ms > limit_ms {
                return Err(GuardError::DurationExceeded { elapsed_ms, limit_ms });
            }
        }
        if let Some(limit) = self.guards.max_iterations {
            if loop_state.iterations >= limit {
                return Err(GuardError::IterationsExceeded {
                    iterations: loop_state.iterations,
                    limit,
                });
            }
        }
        Ok(())
    }

    async fn run_plan(&mut self, loop_state: &mut LoopState) -> AgentState {
        if let Err(guard) = self.check_guards(loop_state) {
            log::debug!("agent '{}': {}", self.context.agent_id(), guard);
            loop_state.pending_error = Some(guard.to_string());
            return AgentState::Error;
        }

        match self.planner.plan(loop_state.last_snapshot.clone()).await {
            Ok(outcome) => {
                let mut plan = outcome.plan;
                if let Some(entry) = outcome.history_entry {
                    plan.record(entry.event, entry.summary, entry.payload);
                }

                let step = plan.current_step().cloned();
                let index = if step.is_some() { Some(plan.current_index) } else { None };
                self.context.set_master_plan(Some(plan));
                if let Some(step) = &step {
                    self.context
                        .set_active_task(Some(step.attribution_task_id().to_string()));
                }

                loop_state.current_step = step;
                loop_state.current_step_index = index;
                loop_state.execution_result = None;
                loop_state.observation = None;
                loop_state.preferred_tool_id = None;
                loop_state.attempt = 0;
                AgentState::Act
            }
            Err(err) => {
                loop_state.pending_error = Some(format!("planner-failed: {}", err));
                AgentState::Error
            }
        }
    }

    async fn run_act(&mut self, loop_state: &mut LoopState) -> AgentState {
        let (step, step_index) = match (&loop_state.current_step, loop_state.current_step_index) {
            (Some(step), Some(index)) => (step.clone(), index),
            _ => {
                loop_state.pending_error = Some("no current step to act on".to_string());
                return AgentState::Error;
            }
        };
        let plan = match self.context.master_plan() {
            Some(plan) => plan.clone(),
            None => {
                loop_state.pending_error = Some("no master plan in context".to_string());
                return AgentState::Error;
            }
        };

        let preferred_tool_id = loop_state.preferred_tool_id.take();
        let request = ExecuteRequest {
            plan: &plan,
            step_index,
            step: &step,
            snapshot: loop_state.last_snapshot.clone(),
            preferred_tool_id,
        };

        match self.executor.execute(request).await {
            Ok(execution) => {
                loop_state.execution_result = Some(execution);
                AgentState::Observe
            }
            Err(err) => {
                loop_state.pending_error = Some(err.to_string());
                AgentState::Error
            }
        }
    }

    fn run_observe(&mut self, loop_state: &mut LoopState) -> AgentState {
        match &loop_state.execution_result {
            Some(execution) => {
                let observation = Observation {
                    source: ObservationSource::Tool,
                    related_task_id: execution.step.attribution_task_id().to_string(),
                    timestamp: now_ms(),
                    payload: execution.result.output.clone(),
                    success: execution.result.success,
                    latency_ms: execution.result.latency_ms,
                    error: execution.result.error.clone(),
                };
                self.context.add_observation(observation.clone());
                loop_state.observation = Some(observation);
            }
            None => {
                loop_state.observation = None;
            }
        }
        AgentState::Reflect
    }

    async fn run_reflect(&mut self, loop_state: &mut LoopState) -> AgentState {
        // Nothing to anchor a reflection to: recover through planning.
        let step = match &loop_state.current_step {
            Some(step) => step.clone(),
            None => return AgentState::Plan,
        };
        let plan = match self.context.master_plan() {
            Some(plan) => plan.clone(),
            None => return AgentState::Plan,
        };

        let input = ReflectionInput {
            plan,
            current_step: step.clone(),
            observation: loop_state.observation.clone(),
            snapshot: loop_state.last_snapshot.clone(),
            attempt: loop_state.attempt + 1,
        };

        let outcome = match self.reflector.reflect(input).await {
            Ok(outcome) => outcome,
            Err(err) => {
                loop_state.pending_error = Some(format!("reflector-failed: {}", err));
                return AgentState::Error;
            }
        };

        let mut plan = outcome.plan.clone();
        if let Some(entry) = &outcome.history_entry {
            plan.record(entry.event, entry.summary.clone(), entry.payload.clone());
        }
        self.context.set_master_plan(Some(plan.clone()));

        for node in outcome.task_updates() {
            self.context.upsert_task(node);
        }
        if let Some(message) = &outcome.message {
            self.context
                .merge_working_memory(payload(json!({ "reflectMessage": message })));
        }

        let new_step = plan.current_step().cloned();
        let new_index = if new_step.is_some() { Some(plan.current_index) } else { None };
        if let Some(new_step) = &new_step {
            if new_step.id != step.id {
                self.context
                    .set_active_task(Some(new_step.attribution_task_id().to_string()));
            }
        }

        loop_state.iterations += 1;
        match outcome.directive {
            Directive::Retry | Directive::Fallback => loop_state.attempt += 1,
            _ => loop_state.attempt = 0,
        }
        if outcome.directive == Directive::Fallback {
            loop_state.preferred_tool_id = next_fallback_tool(
                new_step.as_ref().unwrap_or(&step),
                loop_state
                    .execution_result
                    .as_ref()
                    .map(|e| e.tool_id.as_str()),
            );
        }

        loop_state.current_step = new_step;
        loop_state.current_step_index = new_index;

        match outcome.directive {
            Directive::Complete => AgentState::Finish,
            Directive::Abort => {
                if let Some(message) = &outcome.message {
                    self.context
                        .merge_working_memory(payload(json!({ "abortReason": message })));
                }
                AgentState::Finish
            }
            Directive::Advance | Directive::Retry | Directive::Fallback => AgentState::Act,
            Directive::Replan | Directive::AwaitUser | Directive::Unknown => AgentState::Plan,
        }
    }

    fn run_error(&mut self, loop_state: &mut LoopState) -> AgentState {
        loop_state.failures += 1;
        let message = loop_state
            .pending_error
            .take()
            .unwrap_or_else(|| "unknown failure".to_string());
        log::warn!(
            "agent '{}' failure #{}: {}",
            self.context.agent_id(),
            loop_state.failures,
            message
        );
        self.context
            .merge_working_memory(payload(json!({ "lastError": message })));

        let under_budget = self
            .guards
            .max_failures
            .map_or(true, |max| loop_state.failures < max);
        if under_budget {
            if loop_state.current_step.is_none() {
                AgentState::Plan
            } else {
                // Give the reflector a chance to recover the step.
                AgentState::Reflect
            }
        } else {
            AgentState::Finish
        }
    }
}

/// The tool after `last_tool_id` in the step's priority order, if any. With
/// no position to advance from the executor's default (first entry) applies.
fn next_fallback_tool(step: &PlanItem, last_tool_id: Option<&str>) -> Option<String> {
    let last = last_tool_id?;
    let position = step.tool_sequence.iter().position(|t| t.tool_id == last)?;
    step.tool_sequence
        .get(position + 1)
        .map(|t| t.tool_id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentloop::plan::ToolStep;

    #[test]
    fn test_guard_config_default_bounds_failures() {
        let guards = GuardConfig::default();
        assert_eq!(guards.max_failures, Some(3));
        assert!(guards.max_duration_ms.is_none());
        assert!(guards.max_iterations.is_none());
    }

    #[test]
    fn test_guard_error_kinds() {
        let duration = GuardError::DurationExceeded { elapsed_ms: 10, limit_ms: 5 };
        assert_eq!(duration.kind(), "guard-duration-exceeded");
        assert!(duration.to_string().contains("10ms"));

        let iterations = GuardError::IterationsExceeded { iterations: 4, limit: 3 };
        assert_eq!(iterations.kind(), "guard-iterations-exceeded");
    }

    #[test]
    fn test_stop_token_is_sticky() {
        let token = StopToken::new();
        let clone = token.clone();
        assert!(!token.is_stopped());
        clone.stop();
        assert!(token.is_stopped());
    }

    #[test]
    fn test_next_fallback_tool_walks_priority_order() {
        let step = PlanItem::new("s-1", "Fetch", ToolStep::new("primary"), "fetched")
            .with_fallback_tool(ToolStep::new("secondary"))
            .with_fallback_tool(ToolStep::new("tertiary"));

        assert_eq!(
            next_fallback_tool(&step, Some("primary")).as_deref(),
            Some("secondary")
        );
        assert_eq!(
            next_fallback_tool(&step, Some("secondary")).as_deref(),
            Some("tertiary")
        );
        assert_eq!(next_fallback_tool(&step, Some("tertiary")), None);
        assert_eq!(next_fallback_tool(&step, None), None);
    }

    #[test]
    fn test_agent_state_wire_names() {
        assert_eq!(serde_json::to_value(AgentState::Plan).unwrap(), "plan");
        assert_eq!(serde_json::to_value(AgentState::Finish).unwrap(), "finish");
        assert_eq!(AgentState::Reflect.to_string(), "reflect");
    }
}
