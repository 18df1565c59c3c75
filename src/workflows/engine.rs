//! Workflow registry and run loop.
//!
//! Runs execute actions in order against a live record. Mutating actions
//! re-enter trigger matching, so a run can spawn nested runs; all of them
//! draw on one shared action budget so a self-triggering workflow ends with
//! a capped run instead of an unbounded chain.

use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::conditions::{evaluate, resolve_path, ConditionGroup};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::records::{Record, RecordStore};
use crate::scheduler::{JobPayload, Scheduler};
use crate::workflows::actions::{ActionKind, ActionResult, WorkflowAction};
use crate::workflows::executor::ActionExecutor;
use crate::workflows::triggers::{EventSource, RecordEvent, TriggerType};

/// What a run does when an action fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop the run at the failing action.
    #[default]
    Halt,
    /// Record the failure and keep going.
    Continue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    /// Module the workflow listens on, e.g. "leads".
    pub module: String,
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub conditions: Option<ConditionGroup>,
    pub actions: Vec<WorkflowAction>,
    pub is_enabled: bool,
    #[serde(default)]
    pub on_failure: FailurePolicy,
    /// Overrides the global per-run action cap when set. Only applies to
    /// runs this workflow starts, never to runs it is pulled into.
    #[serde(default)]
    pub action_budget: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    pub fn new(name: &str, module: &str, trigger_type: TriggerType) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: None,
            module: module.to_string(),
            trigger_type,
            conditions: None,
            actions: Vec::new(),
            is_enabled: true,
            on_failure: FailurePolicy::default(),
            action_budget: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_conditions(mut self, conditions: ConditionGroup) -> Self {
        self.conditions = Some(conditions);
        self
    }

    pub fn with_actions(mut self, actions: Vec<WorkflowAction>) -> Self {
        self.actions = actions;
        self
    }

    pub fn with_failure_policy(mut self, on_failure: FailurePolicy) -> Self {
        self.on_failure = on_failure;
        self
    }

    pub fn with_action_budget(mut self, budget: u32) -> Self {
        self.action_budget = Some(budget);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.is_enabled = false;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    /// The shared action budget ran out mid-run.
    Capped,
}

/// One workflow run (or an ad-hoc action-list run for blueprints and
/// delayed resumes, where `workflow_id` is `None`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationRun {
    pub id: Uuid,
    pub workflow_id: Option<Uuid>,
    pub trigger_type: TriggerType,
    pub record_id: Uuid,
    pub status: RunStatus,
    pub actions_executed: u32,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl AutomationRun {
    fn start(workflow_id: Option<Uuid>, trigger_type: TriggerType, record_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id,
            trigger_type,
            record_id,
            status: RunStatus::Running,
            actions_executed: 0,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationRunResult {
    pub run: AutomationRun,
    pub action_results: Vec<ActionResult>,
}

/// Shared countdown of actions a root run (and everything it triggers) may
/// execute. Cloned into nested contexts so the whole chain drains one pool.
#[derive(Clone)]
pub struct RunBudget(Arc<AtomicI64>);

impl RunBudget {
    pub fn new(limit: u32) -> Self {
        Self(Arc::new(AtomicI64::new(limit as i64)))
    }

    /// Takes one slot. Returns false once the pool is drained.
    pub fn try_consume(&self) -> bool {
        self.0.fetch_sub(1, Ordering::SeqCst) > 0
    }

    pub fn remaining(&self) -> i64 {
        self.0.load(Ordering::SeqCst).max(0)
    }
}

/// Per-run execution context threaded through the executor and into nested
/// runs.
#[derive(Clone)]
pub struct ExecutionContext {
    pub run_id: Uuid,
    pub workflow_id: Option<Uuid>,
    pub depth: u32,
    pub budget: RunBudget,
    pub correlation_id: Option<Uuid>,
}

impl ExecutionContext {
    pub fn root(limit: u32) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            workflow_id: None,
            depth: 0,
            budget: RunBudget::new(limit),
            correlation_id: None,
        }
    }

    pub fn child(&self, workflow_id: Option<Uuid>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            workflow_id,
            depth: self.depth + 1,
            budget: self.budget.clone(),
            correlation_id: self.correlation_id,
        }
    }
}

/// The workflow engine: registry plus run loop.
pub struct WorkflowEngine {
    config: EngineConfig,
    workflows: Arc<RwLock<Vec<Workflow>>>,
    executor: Arc<ActionExecutor>,
    records: Arc<dyn RecordStore>,
    scheduler: Arc<Scheduler>,
    runs: Arc<RwLock<Vec<AutomationRun>>>,
}

impl WorkflowEngine {
    pub fn new(
        config: EngineConfig,
        executor: Arc<ActionExecutor>,
        records: Arc<dyn RecordStore>,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        Self {
            config,
            workflows: Arc::new(RwLock::new(Vec::new())),
            executor,
            records,
            scheduler,
            runs: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ===== Registry =====

    pub async fn register_workflow(&self, workflow: Workflow) {
        info!(workflow_id = %workflow.id, name = %workflow.name, "registering workflow");
        self.workflows.write().await.push(workflow);
    }

    pub async fn update_workflow(&self, workflow: Workflow) -> EngineResult<()> {
        let mut workflows = self.workflows.write().await;
        match workflows.iter_mut().find(|w| w.id == workflow.id) {
            Some(existing) => {
                *existing = Workflow {
                    updated_at: Utc::now(),
                    ..workflow
                };
                Ok(())
            }
            None => Err(EngineError::invalid(format!(
                "workflow {} not found",
                workflow.id
            ))),
        }
    }

    pub async fn remove_workflow(&self, workflow_id: Uuid) -> bool {
        let mut workflows = self.workflows.write().await;
        let before = workflows.len();
        workflows.retain(|w| w.id != workflow_id);
        workflows.len() != before
    }

    pub async fn get_workflow(&self, workflow_id: Uuid) -> Option<Workflow> {
        self.workflows
            .read()
            .await
            .iter()
            .find(|w| w.id == workflow_id)
            .cloned()
    }

    pub async fn workflows(&self) -> Vec<Workflow> {
        self.workflows.read().await.clone()
    }

    pub async fn runs(&self) -> Vec<AutomationRun> {
        self.runs.read().await.clone()
    }

    // ===== Execution =====

    /// Runs every enabled workflow matching the event. Each match gets its
    /// own root budget; nested runs it spawns share that budget.
    pub async fn execute_matching_workflows(
        &self,
        event: &RecordEvent,
    ) -> EngineResult<Vec<AutomationRunResult>> {
        self.execute_matching_inner(event, 0, None).await
    }

    fn execute_matching_inner<'a>(
        &'a self,
        event: &'a RecordEvent,
        depth: u32,
        shared_budget: Option<RunBudget>,
    ) -> BoxFuture<'a, EngineResult<Vec<AutomationRunResult>>> {
        async move {
            let candidates: Vec<Workflow> = {
                let workflows = self.workflows.read().await;
                workflows
                    .iter()
                    .filter(|w| w.is_enabled && w.module == event.record.module)
                    .filter(|w| self.trigger_matches(w, event))
                    .cloned()
                    .collect()
            };

            let mut results = Vec::new();
            for workflow in candidates {
                let snapshot = event.record.snapshot();
                if let Some(conditions) = &workflow.conditions {
                    if !evaluate(conditions, &snapshot) {
                        debug!(workflow = %workflow.name, "conditions not met, skipping");
                        continue;
                    }
                }

                let ctx = match &shared_budget {
                    Some(budget) => ExecutionContext {
                        run_id: Uuid::new_v4(),
                        workflow_id: Some(workflow.id),
                        depth,
                        budget: budget.clone(),
                        correlation_id: event.correlation_id,
                    },
                    None => {
                        let limit = workflow
                            .action_budget
                            .unwrap_or(self.config.max_actions_per_run);
                        let mut ctx = ExecutionContext::root(limit);
                        ctx.workflow_id = Some(workflow.id);
                        ctx.correlation_id = event.correlation_id;
                        ctx
                    }
                };

                // Refetch so later matches in the same pass see writes made
                // by earlier ones.
                let record = self.records.get(event.record.id).await?;
                let result = self
                    .execute_action_list(
                        Some(workflow.id),
                        event.trigger_type,
                        &workflow.actions,
                        record,
                        ctx,
                        workflow.on_failure,
                    )
                    .await?;
                results.push(result);
            }
            Ok(results)
        }
        .boxed()
    }

    fn trigger_matches(&self, workflow: &Workflow, event: &RecordEvent) -> bool {
        if workflow.trigger_type == event.trigger_type {
            return true;
        }
        // Field-changed workflows listen on plain updates but only fire
        // when a condition-referenced field actually changed.
        if workflow.trigger_type == TriggerType::OnUpdateFieldChanged
            && event.trigger_type == TriggerType::OnUpdate
        {
            let Some(conditions) = &workflow.conditions else {
                return false;
            };
            let Some(previous) = &event.previous else {
                return false;
            };
            let snapshot = event.record.snapshot();
            return conditions
                .referenced_fields()
                .iter()
                .any(|field| resolve_path(previous, field) != resolve_path(&snapshot, field));
        }
        false
    }

    /// Manual single-workflow execution. Conditions still gate the run.
    pub async fn execute_workflow(
        &self,
        workflow_id: Uuid,
        record_id: Uuid,
    ) -> EngineResult<AutomationRunResult> {
        let workflow = self
            .get_workflow(workflow_id)
            .await
            .ok_or_else(|| EngineError::invalid(format!("workflow {} not found", workflow_id)))?;
        let record = self.records.get(record_id).await?;

        if let Some(conditions) = &workflow.conditions {
            if !evaluate(conditions, &record.snapshot()) {
                let mut run = AutomationRun::start(Some(workflow.id), TriggerType::Manual, record_id);
                run.status = RunStatus::Completed;
                run.finished_at = Some(Utc::now());
                self.push_run(run.clone()).await;
                return Ok(AutomationRunResult {
                    run,
                    action_results: Vec::new(),
                });
            }
        }

        let limit = workflow
            .action_budget
            .unwrap_or(self.config.max_actions_per_run);
        let mut ctx = ExecutionContext::root(limit);
        ctx.workflow_id = Some(workflow.id);

        self.execute_action_list(
            Some(workflow.id),
            TriggerType::Manual,
            &workflow.actions,
            record,
            ctx,
            workflow.on_failure,
        )
        .await
    }

    /// Resumes a run that was suspended by `delay_wait`. The resumed run
    /// gets a fresh budget at the global cap.
    pub async fn resume_delayed(
        &self,
        workflow_id: Option<Uuid>,
        record_id: Uuid,
        remaining: &[WorkflowAction],
        on_failure: FailurePolicy,
        depth: u32,
    ) -> EngineResult<AutomationRunResult> {
        let record = self.records.get(record_id).await?;
        let mut ctx = ExecutionContext::root(self.config.max_actions_per_run);
        ctx.workflow_id = workflow_id;
        ctx.depth = depth;
        self.execute_action_list(
            workflow_id,
            TriggerType::Scheduled,
            remaining,
            record,
            ctx,
            on_failure,
        )
        .await
    }

    /// Core run loop. Also used by blueprint post-actions and cadence
    /// steps, which pass `workflow_id = None`.
    pub(crate) fn execute_action_list<'a>(
        &'a self,
        workflow_id: Option<Uuid>,
        trigger_type: TriggerType,
        actions: &'a [WorkflowAction],
        record: Record,
        ctx: ExecutionContext,
        on_failure: FailurePolicy,
    ) -> BoxFuture<'a, EngineResult<AutomationRunResult>> {
        async move {
            let mut run = AutomationRun::start(workflow_id, trigger_type, record.id);
            run.id = ctx.run_id;
            let mut action_results = Vec::new();
            let mut current = record;

            for (index, action) in actions.iter().enumerate() {
                // Per-action gate comes before the budget: a skipped action
                // never consumes a slot.
                if let Some(condition) = &action.condition {
                    if !evaluate(condition, &current.snapshot()) {
                        debug!(action = %action.name, "action condition not met, skipping");
                        action_results.push(ActionResult::skipped());
                        continue;
                    }
                }

                if !ctx.budget.try_consume() {
                    warn!(
                        run_id = %run.id,
                        action = %action.name,
                        "action budget exhausted, capping run"
                    );
                    run.status = RunStatus::Capped;
                    break;
                }

                if let ActionKind::DelayWait { minutes } = &action.kind {
                    let remaining: Vec<WorkflowAction> = actions[index + 1..].to_vec();
                    if !remaining.is_empty() {
                        self.scheduler
                            .schedule(
                                JobPayload::WorkflowDelay {
                                    workflow_id,
                                    record_id: current.id,
                                    remaining_actions: remaining,
                                    on_failure,
                                    depth: ctx.depth,
                                },
                                Utc::now() + Duration::minutes(*minutes),
                            )
                            .await?;
                    }
                    run.actions_executed += 1;
                    action_results.push(ActionResult::success(Some(serde_json::json!({
                        "delayed_minutes": minutes
                    }))));
                    run.status = RunStatus::Completed;
                    break;
                }

                let result = self.executor.execute(action, &current, &ctx).await;
                run.actions_executed += 1;
                let succeeded = result.success;
                if let Some(error) = &result.error {
                    run.error = Some(error.clone());
                }
                action_results.push(result);

                if !succeeded {
                    match on_failure {
                        FailurePolicy::Halt => {
                            run.status = RunStatus::Failed;
                            break;
                        }
                        FailurePolicy::Continue => continue,
                    }
                }

                if action.mutates_record() {
                    let previous = current.snapshot();
                    let refreshed = self.records.get(current.id).await?;
                    // A mutating action that ended up writing nothing (a
                    // no-candidate assignment, an identical value) must not
                    // fire update triggers: the event would describe zero
                    // store mutations.
                    if refreshed.snapshot() == previous {
                        current = refreshed;
                        continue;
                    }
                    let event = RecordEvent::record_updated(
                        refreshed.clone(),
                        previous,
                        EventSource::System,
                    );
                    let nested = self
                        .execute_matching_inner(&event, ctx.depth + 1, Some(ctx.budget.clone()))
                        .await?;
                    let capped = nested.iter().any(|r| r.run.status == RunStatus::Capped);
                    // Nested runs may have written the record again.
                    current = self.records.get(current.id).await?;
                    if capped {
                        run.status = RunStatus::Capped;
                        break;
                    }
                }
            }

            if run.status == RunStatus::Running {
                run.status = RunStatus::Completed;
            }
            run.finished_at = Some(Utc::now());
            info!(
                run_id = %run.id,
                status = ?run.status,
                actions = run.actions_executed,
                "run finished"
            );
            self.push_run(run.clone()).await;

            Ok(AutomationRunResult {
                run,
                action_results,
            })
        }
        .boxed()
    }

    async fn push_run(&self, run: AutomationRun) {
        let mut runs = self.runs.write().await;
        runs.push(run);
        // Keep the in-memory run log bounded.
        let retention = self.config.run_log_retention;
        if runs.len() > retention {
            let excess = runs.len() - retention;
            runs.drain(0..excess);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_drains_once() {
        let budget = RunBudget::new(2);
        assert!(budget.try_consume());
        assert!(budget.try_consume());
        assert!(!budget.try_consume());
        assert!(!budget.try_consume());
        assert_eq!(budget.remaining(), 0);
    }

    #[test]
    fn test_child_context_shares_budget() {
        let root = ExecutionContext::root(1);
        let child = root.child(Some(Uuid::new_v4()));
        assert_eq!(child.depth, 1);
        assert!(child.budget.try_consume());
        assert!(!root.budget.try_consume());
    }

    #[test]
    fn test_failure_policy_default() {
        assert_eq!(FailurePolicy::default(), FailurePolicy::Halt);
    }
}
