// Traction Automation Engine
//
// Automation and transition engine for a CRM backend: condition
// evaluation, trigger-driven workflows, owner assignment, outreach
// cadences, a deferred-job scheduler, blueprint stage graphs and
// multi-step approvals. `AutomationService` wires the engines together
// and runs the background job sweep; every external collaborator (record
// store, message dispatch, webhooks, user directory) sits behind a trait
// with in-memory implementations for tests and embedded use.

pub mod approvals;
pub mod assignment;
pub mod blueprints;
pub mod cadence;
pub mod conditions;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod records;
pub mod scheduler;
pub mod service;
pub mod workflows;

pub use approvals::{
    Approval, ApprovalActionKind, ApprovalActionRequest, ApprovalEngine, ApprovalOutcome,
    ApprovalStatus, ApprovalStepSpec, ApproverRef,
};
pub use assignment::{
    AssignmentDecision, AssignmentEngine, AssignmentRule, AssignmentStrategy, RotationStore,
};
pub use blueprints::{
    Blueprint, BlueprintEngine, BlueprintTransition, TransitionOutcome, TransitionValidation,
};
pub use cadence::{Cadence, CadenceEngine, CadenceEnrollment, CadenceStep, EnrollmentStatus};
pub use conditions::{Condition, ConditionGroup, ConditionNode, ConditionOperator};
pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use records::{FieldPatch, Record, RecordStore};
pub use scheduler::{JobPayload, JobStatus, JobStore, Scheduler, SchedulerJob};
pub use service::{AutomationService, AutomationServiceBuilder, SweepSummary};
pub use workflows::{
    ActionKind, ActionResult, FailurePolicy, RecordEvent, TriggerType, Workflow, WorkflowAction,
    WorkflowEngine,
};
