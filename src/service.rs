//! `AutomationService`: wiring facade and background sweep.
//!
//! The facade owns every engine and mediates the flows that cross them:
//! the job sweep feeds cadence steps and delayed runs into the executor,
//! and a fully approved approval is finalized through the blueprint
//! engine. Engines never hold each other in a cycle.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};
use uuid::Uuid;

use crate::approvals::{
    Approval, ApprovalActionRequest, ApprovalEngine, ApprovalOutcome,
};
use crate::assignment::{
    AssignmentDecision, AssignmentEngine, AssignmentRule, InMemoryRotationStore, RotationStore,
};
use crate::blueprints::{BlueprintEngine, TransitionOutcome, TransitionValidation};
use crate::cadence::{CadenceEngine, CadenceEnrollment};
use crate::conditions::{evaluate, ConditionGroup};
use crate::config::EngineConfig;
use crate::dispatch::{
    memory::{InMemoryDirectory, InMemoryDispatcher, InMemorySink},
    AuditSink, CollaborationSink, HttpWebhookPoster, MessageDispatcher, TracingAuditSink,
    UserDirectory, WebhookPoster,
};
use crate::error::{EngineError, EngineResult};
use crate::records::{InMemoryRecordStore, Record, RecordStore};
use crate::scheduler::{InMemoryJobStore, JobPayload, JobStore, Scheduler, SchedulerJob};
use crate::workflows::actions::{ActionResult, WorkflowAction};
use crate::workflows::engine::{
    AutomationRunResult, ExecutionContext, WorkflowEngine,
};
use crate::workflows::executor::ActionExecutor;
use crate::workflows::triggers::RecordEvent;

/// One pass over the due jobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct SweepSummary {
    pub claimed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

pub struct AutomationServiceBuilder {
    config: EngineConfig,
    records: Option<Arc<dyn RecordStore>>,
    job_store: Option<Arc<dyn JobStore>>,
    rotation: Option<Arc<dyn RotationStore>>,
    dispatcher: Option<Arc<dyn MessageDispatcher>>,
    webhooks: Option<Arc<dyn WebhookPoster>>,
    sink: Option<Arc<dyn CollaborationSink>>,
    directory: Option<Arc<dyn UserDirectory>>,
    audit: Option<Arc<dyn AuditSink>>,
}

impl AutomationServiceBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            records: None,
            job_store: None,
            rotation: None,
            dispatcher: None,
            webhooks: None,
            sink: None,
            directory: None,
            audit: None,
        }
    }

    pub fn records(mut self, records: Arc<dyn RecordStore>) -> Self {
        self.records = Some(records);
        self
    }

    pub fn job_store(mut self, job_store: Arc<dyn JobStore>) -> Self {
        self.job_store = Some(job_store);
        self
    }

    pub fn rotation(mut self, rotation: Arc<dyn RotationStore>) -> Self {
        self.rotation = Some(rotation);
        self
    }

    pub fn dispatcher(mut self, dispatcher: Arc<dyn MessageDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn webhooks(mut self, webhooks: Arc<dyn WebhookPoster>) -> Self {
        self.webhooks = Some(webhooks);
        self
    }

    pub fn collaboration_sink(mut self, sink: Arc<dyn CollaborationSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn directory(mut self, directory: Arc<dyn UserDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn build(self) -> EngineResult<AutomationService> {
        let config = self.config;
        let records = self
            .records
            .unwrap_or_else(|| Arc::new(InMemoryRecordStore::new()));
        let job_store = self
            .job_store
            .unwrap_or_else(|| Arc::new(InMemoryJobStore::new()));
        let rotation = self
            .rotation
            .unwrap_or_else(|| Arc::new(InMemoryRotationStore::new()));
        let dispatcher = self
            .dispatcher
            .unwrap_or_else(|| Arc::new(InMemoryDispatcher::new()));
        let webhooks = match self.webhooks {
            Some(webhooks) => webhooks,
            None => Arc::new(HttpWebhookPoster::new(std::time::Duration::from_secs(
                config.dispatch_timeout_secs,
            ))?),
        };
        let sink = self.sink.unwrap_or_else(|| Arc::new(InMemorySink::new()));
        let directory = self
            .directory
            .unwrap_or_else(|| Arc::new(InMemoryDirectory::new()));
        let audit = self.audit.unwrap_or_else(|| Arc::new(TracingAuditSink));

        let scheduler = Arc::new(Scheduler::new(job_store, config.clone()));
        let assignment = Arc::new(AssignmentEngine::new(rotation, records.clone()));
        let cadence = Arc::new(CadenceEngine::new(records.clone(), scheduler.clone()));
        let executor = Arc::new(ActionExecutor::new(
            config.clone(),
            records.clone(),
            assignment.clone(),
            cadence.clone(),
            dispatcher,
            webhooks,
            sink,
            audit,
        ));
        let workflows = Arc::new(WorkflowEngine::new(
            config.clone(),
            executor.clone(),
            records.clone(),
            scheduler.clone(),
        ));
        let approvals = Arc::new(ApprovalEngine::new(
            directory,
            assignment.clone(),
            records.clone(),
        ));
        let blueprints = Arc::new(BlueprintEngine::new(
            records.clone(),
            workflows.clone(),
            approvals.clone(),
        ));

        Ok(AutomationService {
            config,
            records,
            scheduler,
            assignment,
            cadence,
            executor,
            workflows,
            approvals,
            blueprints,
            sweeper: Mutex::new(None),
        })
    }
}

pub struct AutomationService {
    config: EngineConfig,
    records: Arc<dyn RecordStore>,
    scheduler: Arc<Scheduler>,
    assignment: Arc<AssignmentEngine>,
    cadence: Arc<CadenceEngine>,
    executor: Arc<ActionExecutor>,
    workflows: Arc<WorkflowEngine>,
    approvals: Arc<ApprovalEngine>,
    blueprints: Arc<BlueprintEngine>,
    sweeper: Mutex<Option<JobScheduler>>,
}

impl AutomationService {
    pub fn builder(config: EngineConfig) -> AutomationServiceBuilder {
        AutomationServiceBuilder::new(config)
    }

    // ===== Engine access =====

    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.records
    }

    pub fn workflows(&self) -> &Arc<WorkflowEngine> {
        &self.workflows
    }

    pub fn cadences(&self) -> &Arc<CadenceEngine> {
        &self.cadence
    }

    pub fn blueprints(&self) -> &Arc<BlueprintEngine> {
        &self.blueprints
    }

    pub fn approvals(&self) -> &Arc<ApprovalEngine> {
        &self.approvals
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    // ===== Conditions and workflows =====

    pub fn evaluate_conditions(&self, conditions: &ConditionGroup, record: &Record) -> bool {
        evaluate(conditions, &record.snapshot())
    }

    pub async fn execute_workflow(
        &self,
        workflow_id: Uuid,
        record_id: Uuid,
    ) -> EngineResult<AutomationRunResult> {
        self.workflows.execute_workflow(workflow_id, record_id).await
    }

    pub async fn execute_matching_workflows(
        &self,
        event: &RecordEvent,
    ) -> EngineResult<Vec<AutomationRunResult>> {
        self.workflows.execute_matching_workflows(event).await
    }

    /// Runs one action ad hoc against a record, outside any workflow.
    pub async fn execute_action(
        &self,
        action: &WorkflowAction,
        record_id: Uuid,
    ) -> EngineResult<ActionResult> {
        let record = self.records.get(record_id).await?;
        let ctx = ExecutionContext::root(self.config.max_actions_per_run);
        Ok(self.executor.execute(action, &record, &ctx).await)
    }

    pub async fn resolve_assignment(
        &self,
        rule: &AssignmentRule,
        record_id: Uuid,
    ) -> EngineResult<AssignmentDecision> {
        let record = self.records.get(record_id).await?;
        Ok(self.assignment.resolve(rule, &record).await)
    }

    // ===== Cadences =====

    pub async fn enroll_in_cadence(
        &self,
        cadence_id: Uuid,
        record_id: Uuid,
    ) -> EngineResult<CadenceEnrollment> {
        self.cadence.enroll(cadence_id, record_id).await
    }

    pub async fn unenroll_from_cadence(
        &self,
        enrollment_id: Uuid,
    ) -> EngineResult<CadenceEnrollment> {
        self.cadence.stop(enrollment_id).await
    }

    pub async fn pause_enrollment(&self, enrollment_id: Uuid) -> EngineResult<CadenceEnrollment> {
        self.cadence.pause(enrollment_id).await
    }

    pub async fn resume_enrollment(&self, enrollment_id: Uuid) -> EngineResult<CadenceEnrollment> {
        self.cadence.resume(enrollment_id).await
    }

    // ===== Jobs =====

    pub async fn schedule_job(
        &self,
        payload: JobPayload,
        run_at: DateTime<Utc>,
    ) -> EngineResult<Uuid> {
        self.scheduler.schedule(payload, run_at).await
    }

    pub async fn cancel_job(&self, job_id: Uuid) -> EngineResult<bool> {
        self.scheduler.cancel(job_id).await
    }

    /// Claims and runs everything due. Each job succeeds (completed),
    /// fails (retried with backoff until attempts run out), or is a stale
    /// no-op (completed silently).
    pub async fn process_scheduled_jobs(&self) -> EngineResult<SweepSummary> {
        let jobs = self.scheduler.claim_due(Utc::now()).await?;
        let mut summary = SweepSummary {
            claimed: jobs.len(),
            ..SweepSummary::default()
        };

        for job in jobs {
            match self.run_job(&job).await {
                Ok(()) => {
                    self.scheduler.complete(&job).await?;
                    summary.succeeded += 1;
                }
                Err(e) => {
                    self.scheduler.fail(&job, &e).await?;
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }

    async fn run_job(&self, job: &SchedulerJob) -> EngineResult<()> {
        match &job.payload {
            JobPayload::WorkflowDelay {
                workflow_id,
                record_id,
                remaining_actions,
                on_failure,
                depth,
            } => {
                // Run-level failures were already subject to the failure
                // policy; the job itself is done either way.
                self.workflows
                    .resume_delayed(*workflow_id, *record_id, remaining_actions, *on_failure, *depth)
                    .await?;
                Ok(())
            }
            JobPayload::WorkflowRetry { record_id, action } => {
                let record = self.records.get(*record_id).await?;
                let ctx = ExecutionContext::root(self.config.max_actions_per_run);
                let result = self.executor.execute(action, &record, &ctx).await;
                if result.success {
                    Ok(())
                } else {
                    Err(EngineError::ActionFailed(
                        result.error.unwrap_or_else(|| "action failed".to_string()),
                    ))
                }
            }
            JobPayload::WorkflowScheduled {
                workflow_id,
                record_id,
            } => {
                self.workflows
                    .execute_workflow(*workflow_id, *record_id)
                    .await?;
                Ok(())
            }
            JobPayload::CadenceStep {
                enrollment_id,
                step_index,
            } => {
                let Some((action, record_id)) = self
                    .cadence
                    .begin_due_step(*enrollment_id, *step_index)
                    .await?
                else {
                    // Stale job: nothing to do.
                    return Ok(());
                };
                let record = self.records.get(record_id).await?;
                let ctx = ExecutionContext::root(self.config.max_actions_per_run);
                let result = self.executor.execute(&action, &record, &ctx).await;
                self.cadence
                    .complete_step(*enrollment_id, *step_index, result.success)
                    .await?;
                if result.success {
                    Ok(())
                } else {
                    Err(EngineError::ActionFailed(
                        result.error.unwrap_or_else(|| "cadence step failed".to_string()),
                    ))
                }
            }
        }
    }

    // ===== Blueprints and approvals =====

    pub async fn validate_transition(
        &self,
        blueprint_id: Uuid,
        transition_id: Uuid,
        record_id: Uuid,
    ) -> EngineResult<TransitionValidation> {
        self.blueprints
            .validate_transition(blueprint_id, transition_id, record_id)
            .await
    }

    pub async fn execute_transition(
        &self,
        blueprint_id: Uuid,
        transition_id: Uuid,
        record_id: Uuid,
        requested_by: Uuid,
    ) -> EngineResult<TransitionOutcome> {
        self.blueprints
            .execute_transition(blueprint_id, transition_id, record_id, requested_by)
            .await
    }

    /// Finalizes the transition behind a fully approved approval. Also the
    /// retry path when the automatic finalization on final approve hit a
    /// stage conflict.
    pub async fn execute_approved_transition(
        &self,
        approval_id: Uuid,
    ) -> EngineResult<AutomationRunResult> {
        let approval = self
            .approvals
            .get(approval_id)
            .await
            .ok_or_else(|| EngineError::invalid(format!("approval {} not found", approval_id)))?;
        self.blueprints.execute_approved_transition(&approval).await
    }

    /// Applies an approval action; a final approval immediately finalizes
    /// the gated transition.
    pub async fn execute_approval_action(
        &self,
        approval_id: Uuid,
        request: &ApprovalActionRequest,
    ) -> EngineResult<(Approval, ApprovalOutcome, Option<AutomationRunResult>)> {
        let (approval, outcome) = self.approvals.execute_action(approval_id, request).await?;
        if outcome == ApprovalOutcome::FinalApproved {
            let result = self.blueprints.execute_approved_transition(&approval).await?;
            return Ok((approval, outcome, Some(result)));
        }
        Ok((approval, outcome, None))
    }

    pub async fn resubmit_approval(
        &self,
        approval_id: Uuid,
        actor: Uuid,
    ) -> EngineResult<Approval> {
        self.approvals.resubmit(approval_id, actor).await
    }

    pub async fn expire_approval(&self, approval_id: Uuid) -> EngineResult<Approval> {
        self.approvals.expire(approval_id).await
    }

    // ===== Background sweep =====

    /// Starts the periodic job sweep on a cron tick.
    pub async fn start(self: &Arc<Self>) -> EngineResult<()> {
        let mut guard = self.sweeper.lock().await;
        if guard.is_some() {
            return Err(EngineError::Scheduler("sweep already running".to_string()));
        }

        let interval = self.config.sweep_interval_secs.clamp(1, 59);
        let cron = format!("*/{} * * * * *", interval);
        let sched = JobScheduler::new()
            .await
            .map_err(|e| EngineError::Scheduler(e.to_string()))?;

        let service = Arc::clone(self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let service = Arc::clone(&service);
            Box::pin(async move {
                match service.process_scheduled_jobs().await {
                    Ok(summary) if summary.claimed > 0 => {
                        info!(
                            claimed = summary.claimed,
                            succeeded = summary.succeeded,
                            failed = summary.failed,
                            "job sweep finished"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "job sweep failed"),
                }
            })
        })
        .map_err(|e| EngineError::Scheduler(e.to_string()))?;

        sched
            .add(job)
            .await
            .map_err(|e| EngineError::Scheduler(e.to_string()))?;
        sched
            .start()
            .await
            .map_err(|e| EngineError::Scheduler(e.to_string()))?;

        info!(interval_secs = interval, "automation sweep started");
        *guard = Some(sched);
        Ok(())
    }

    /// Stops the background sweep. In-flight jobs finish; pending jobs
    /// stay queued for the next start.
    pub async fn shutdown(&self) -> EngineResult<()> {
        let mut guard = self.sweeper.lock().await;
        if let Some(mut sched) = guard.take() {
            sched
                .shutdown()
                .await
                .map_err(|e| EngineError::Scheduler(e.to_string()))?;
            info!("automation sweep stopped");
        }
        Ok(())
    }
}
