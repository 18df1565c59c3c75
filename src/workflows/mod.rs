// Workflow Automation Engine
//
// Event-driven automation for CRM records. Workflows pair a trigger with
// conditions and an ordered action list; runs share a budget so chained
// triggers stay bounded.

pub mod actions;
pub mod engine;
pub mod executor;
pub mod triggers;

pub use actions::{ActionKind, ActionResult, FieldUpdate, WorkflowAction};
pub use engine::{
    AutomationRun, AutomationRunResult, ExecutionContext, FailurePolicy, RunBudget, RunStatus,
    Workflow, WorkflowEngine,
};
pub use executor::ActionExecutor;
pub use triggers::{EventSource, RecordEvent, TriggerType};
