//! Deferred job store and scheduler.
//!
//! Jobs carry their full payload, so the sweep can execute them without
//! reloading workflow state that may have been deleted in the meantime.
//! Claiming is a compare-and-set from `Pending` to `Running`: two sweeps
//! racing on the same due job means exactly one wins.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::workflows::actions::WorkflowAction;
use crate::workflows::engine::FailurePolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    WorkflowDelay,
    WorkflowRetry,
    WorkflowScheduled,
    CadenceStep,
}

/// Job payloads. Each variant is self-contained: everything the sweep
/// needs to resume the work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum JobPayload {
    /// Resume a run suspended by a `delay_wait` action.
    WorkflowDelay {
        workflow_id: Option<Uuid>,
        record_id: Uuid,
        remaining_actions: Vec<WorkflowAction>,
        on_failure: FailurePolicy,
        depth: u32,
    },
    /// Re-run a single failed action.
    WorkflowRetry {
        record_id: Uuid,
        action: WorkflowAction,
    },
    /// Fire a scheduled-trigger workflow against a record.
    WorkflowScheduled {
        workflow_id: Uuid,
        record_id: Uuid,
    },
    /// Execute one due cadence step for an enrollment.
    CadenceStep {
        enrollment_id: Uuid,
        step_index: usize,
    },
}

impl JobPayload {
    pub fn job_type(&self) -> JobType {
        match self {
            JobPayload::WorkflowDelay { .. } => JobType::WorkflowDelay,
            JobPayload::WorkflowRetry { .. } => JobType::WorkflowRetry,
            JobPayload::WorkflowScheduled { .. } => JobType::WorkflowScheduled,
            JobPayload::CadenceStep { .. } => JobType::CadenceStep,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerJob {
    pub id: Uuid,
    pub job_type: JobType,
    pub payload: JobPayload,
    pub run_at: DateTime<Utc>,
    pub status: JobStatus,
    pub attempt: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SchedulerJob {
    pub fn new(payload: JobPayload, run_at: DateTime<Utc>, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_type: payload.job_type(),
            payload,
            run_at,
            status: JobStatus::Pending,
            attempt: 0,
            max_attempts,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Persistence seam for jobs.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn enqueue(&self, job: SchedulerJob) -> EngineResult<()>;

    /// Pending jobs with `run_at <= now`, ordered by `run_at`.
    async fn due(&self, now: DateTime<Utc>) -> EngineResult<Vec<SchedulerJob>>;

    /// Compare-and-set claim: `Pending` -> `Running`. Returns `None` when
    /// the job is gone or another worker already claimed it.
    async fn claim(&self, id: Uuid) -> EngineResult<Option<SchedulerJob>>;

    async fn mark_completed(&self, id: Uuid) -> EngineResult<()>;

    async fn mark_failed(&self, id: Uuid, error: &str) -> EngineResult<()>;

    /// Puts a running job back to `Pending` at a later time with a bumped
    /// attempt counter.
    async fn reschedule(&self, id: Uuid, run_at: DateTime<Utc>, attempt: u32, error: &str)
        -> EngineResult<()>;

    /// Cancels a pending job. Running jobs are left alone; returns whether
    /// the cancel landed.
    async fn cancel(&self, id: Uuid) -> EngineResult<bool>;

    async fn get(&self, id: Uuid) -> EngineResult<Option<SchedulerJob>>;
}

#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<Uuid, SchedulerJob>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: SchedulerJob) -> EngineResult<()> {
        self.jobs.write().await.insert(job.id, job);
        Ok(())
    }

    async fn due(&self, now: DateTime<Utc>) -> EngineResult<Vec<SchedulerJob>> {
        let jobs = self.jobs.read().await;
        let mut due: Vec<SchedulerJob> = jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending && j.run_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|j| j.run_at);
        Ok(due)
    }

    async fn claim(&self, id: Uuid) -> EngineResult<Option<SchedulerJob>> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Pending => {
                job.status = JobStatus::Running;
                job.attempt += 1;
                job.updated_at = Utc::now();
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn mark_completed(&self, id: Uuid) -> EngineResult<()> {
        let mut jobs = self.jobs.write().await;
        if let Some(job) = jobs.get_mut(&id) {
            job.status = JobStatus::Completed;
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> EngineResult<()> {
        let mut jobs = self.jobs.write().await;
        if let Some(job) = jobs.get_mut(&id) {
            job.status = JobStatus::Failed;
            job.last_error = Some(error.to_string());
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn reschedule(
        &self,
        id: Uuid,
        run_at: DateTime<Utc>,
        attempt: u32,
        error: &str,
    ) -> EngineResult<()> {
        let mut jobs = self.jobs.write().await;
        if let Some(job) = jobs.get_mut(&id) {
            job.status = JobStatus::Pending;
            job.run_at = run_at;
            job.attempt = attempt;
            job.last_error = Some(error.to_string());
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn cancel(&self, id: Uuid) -> EngineResult<bool> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Pending => {
                job.status = JobStatus::Cancelled;
                job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, id: Uuid) -> EngineResult<Option<SchedulerJob>> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }
}

/// Thin policy layer over the job store: enqueue defaults, retry backoff.
pub struct Scheduler {
    store: Arc<dyn JobStore>,
    config: EngineConfig,
}

impl Scheduler {
    pub fn new(store: Arc<dyn JobStore>, config: EngineConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Enqueues a job to run at `run_at`, returning its id.
    pub async fn schedule(&self, payload: JobPayload, run_at: DateTime<Utc>) -> EngineResult<Uuid> {
        let job = SchedulerJob::new(payload, run_at, self.config.default_max_attempts);
        let id = job.id;
        info!(job_id = %id, job_type = ?job.job_type, run_at = %run_at, "scheduling job");
        self.store.enqueue(job).await?;
        Ok(id)
    }

    pub async fn schedule_in(&self, payload: JobPayload, delay: Duration) -> EngineResult<Uuid> {
        self.schedule(payload, Utc::now() + delay).await
    }

    /// Claims every job due at `now`. Jobs another worker grabbed between
    /// the due scan and the claim are skipped silently.
    pub async fn claim_due(&self, now: DateTime<Utc>) -> EngineResult<Vec<SchedulerJob>> {
        let mut claimed = Vec::new();
        for job in self.store.due(now).await? {
            if let Some(job) = self.store.claim(job.id).await? {
                claimed.push(job);
            }
        }
        Ok(claimed)
    }

    pub async fn complete(&self, job: &SchedulerJob) -> EngineResult<()> {
        self.store.mark_completed(job.id).await
    }

    /// Fails a claimed job: reschedules with exponential backoff while
    /// attempts remain, marks failed once they are spent.
    pub async fn fail(&self, job: &SchedulerJob, error: &EngineError) -> EngineResult<()> {
        let message = error.to_string();
        if job.attempt < job.max_attempts {
            let backoff_secs =
                self.config.retry_base_secs * 2u64.pow(job.attempt.saturating_sub(1));
            let run_at = Utc::now() + Duration::seconds(backoff_secs as i64);
            warn!(
                job_id = %job.id,
                attempt = job.attempt,
                backoff_secs,
                error = %message,
                "job failed, rescheduling"
            );
            self.store
                .reschedule(job.id, run_at, job.attempt, &message)
                .await
        } else {
            warn!(job_id = %job.id, attempt = job.attempt, error = %message, "job failed permanently");
            self.store.mark_failed(job.id, &message).await
        }
    }

    pub async fn cancel(&self, id: Uuid) -> EngineResult<bool> {
        self.store.cancel(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> JobPayload {
        JobPayload::WorkflowScheduled {
            workflow_id: Uuid::new_v4(),
            record_id: Uuid::new_v4(),
        }
    }

    fn scheduler() -> Scheduler {
        Scheduler::new(Arc::new(InMemoryJobStore::new()), EngineConfig::default())
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let scheduler = scheduler();
        let id = scheduler.schedule(payload(), Utc::now()).await.unwrap();

        let first = scheduler.store().claim(id).await.unwrap();
        assert!(first.is_some());
        assert_eq!(first.unwrap().attempt, 1);

        // Second claim loses the race.
        assert!(scheduler.store().claim(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_due_ignores_future_jobs() {
        let scheduler = scheduler();
        scheduler.schedule(payload(), Utc::now()).await.unwrap();
        scheduler
            .schedule(payload(), Utc::now() + Duration::hours(1))
            .await
            .unwrap();

        let due = scheduler.claim_due(Utc::now()).await.unwrap();
        assert_eq!(due.len(), 1);
    }

    #[tokio::test]
    async fn test_fail_reschedules_with_backoff_then_gives_up() {
        let store = Arc::new(InMemoryJobStore::new());
        let config = EngineConfig {
            default_max_attempts: 2,
            retry_base_secs: 30,
            ..EngineConfig::default()
        };
        let scheduler = Scheduler::new(store.clone(), config);

        let id = scheduler.schedule(payload(), Utc::now()).await.unwrap();
        let job = store.claim(id).await.unwrap().unwrap();
        let before = Utc::now();
        scheduler
            .fail(&job, &EngineError::ActionFailed("boom".into()))
            .await
            .unwrap();

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.run_at >= before + Duration::seconds(30));

        // Second attempt exhausts max_attempts.
        let mut jobs = store.jobs.write().await;
        jobs.get_mut(&id).unwrap().run_at = Utc::now();
        drop(jobs);
        let job = store.claim(id).await.unwrap().unwrap();
        assert_eq!(job.attempt, 2);
        scheduler
            .fail(&job, &EngineError::ActionFailed("boom".into()))
            .await
            .unwrap();
        assert_eq!(store.get(id).await.unwrap().unwrap().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_cancel_only_pending() {
        let scheduler = scheduler();
        let id = scheduler
            .schedule(payload(), Utc::now() + Duration::hours(1))
            .await
            .unwrap();
        assert!(scheduler.cancel(id).await.unwrap());
        // Already cancelled.
        assert!(!scheduler.cancel(id).await.unwrap());
    }
}
