// src/lib.rs

// Import the top-level `agentloop` module.
pub mod agentloop;

// Surface the submodules at the crate root so callers write
// `agentloop::machine::...` instead of navigating the whole hierarchy.
pub use agentloop::{bridge, bus, context, executor, machine, plan, planner, runtime, tool, tools};

// Re-exporting key items for easier external access.
pub use agentloop::bridge::BridgeServer;
pub use agentloop::bus::{BusEvent, BusEventType, EventBus};
pub use agentloop::context::{AgentContext, AgentContextSnapshot, Observation, TaskNode, TaskStatus};
pub use agentloop::machine::{AgentMachine, AgentRunResult, AgentState, GuardConfig, StopToken};
pub use agentloop::plan::{MasterPlan, PlanItem, ToolStep};
pub use agentloop::planner::{Directive, Planner, Reflector};
pub use agentloop::runtime::AgentRuntime;
pub use agentloop::tool::{ToolAdapter, ToolRegistry, ToolResult};
