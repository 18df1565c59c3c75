//! Cadence (sequence) engine: multi-step outreach programs a record is
//! enrolled into, with one scheduled job per pending step.
//!
//! Step jobs are never trusted blindly: a due job names the enrollment and
//! the step index it was scheduled for, and `begin_due_step` discards it
//! silently when the enrollment moved on, paused or stopped in the
//! meantime. Pausing therefore does not need to cancel the pending job.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::conditions::{evaluate, ConditionGroup};
use crate::error::{EngineError, EngineResult};
use crate::records::RecordStore;
use crate::scheduler::{JobPayload, Scheduler};
use crate::workflows::actions::WorkflowAction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CadenceStepKind {
    Task,
    Email,
    Call,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CadenceStep {
    pub id: Uuid,
    pub kind: CadenceStepKind,
    /// Delay from the previous step (or from enrollment, for step 0).
    pub delay_hours: i64,
    pub action: WorkflowAction,
}

impl CadenceStep {
    pub fn new(kind: CadenceStepKind, delay_hours: i64, action: WorkflowAction) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            delay_hours,
            action,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cadence {
    pub id: Uuid,
    pub name: String,
    pub steps: Vec<CadenceStep>,
    /// Checked before every step; a match stops the enrollment.
    #[serde(default)]
    pub stop_conditions: Option<ConditionGroup>,
}

impl Cadence {
    pub fn new(name: &str, steps: Vec<CadenceStep>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            steps,
            stop_conditions: None,
        }
    }

    pub fn with_stop_conditions(mut self, conditions: ConditionGroup) -> Self {
        self.stop_conditions = Some(conditions);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Active,
    Paused,
    Completed,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CadenceEnrollment {
    pub id: Uuid,
    pub cadence_id: Uuid,
    pub record_id: Uuid,
    pub current_step: usize,
    pub status: EnrollmentStatus,
    pub next_step_due_at: Option<DateTime<Utc>>,
    pub next_step_job_id: Option<Uuid>,
    pub enrolled_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub struct CadenceEngine {
    cadences: RwLock<HashMap<Uuid, Cadence>>,
    enrollments: RwLock<HashMap<Uuid, CadenceEnrollment>>,
    records: Arc<dyn RecordStore>,
    scheduler: Arc<Scheduler>,
}

impl CadenceEngine {
    pub fn new(records: Arc<dyn RecordStore>, scheduler: Arc<Scheduler>) -> Self {
        Self {
            cadences: RwLock::new(HashMap::new()),
            enrollments: RwLock::new(HashMap::new()),
            records,
            scheduler,
        }
    }

    pub async fn register_cadence(&self, cadence: Cadence) {
        info!(cadence_id = %cadence.id, name = %cadence.name, "registering cadence");
        self.cadences.write().await.insert(cadence.id, cadence);
    }

    pub async fn get_cadence(&self, cadence_id: Uuid) -> Option<Cadence> {
        self.cadences.read().await.get(&cadence_id).cloned()
    }

    pub async fn get_enrollment(&self, enrollment_id: Uuid) -> Option<CadenceEnrollment> {
        self.enrollments.read().await.get(&enrollment_id).cloned()
    }

    pub async fn enrollments_for_record(&self, record_id: Uuid) -> Vec<CadenceEnrollment> {
        self.enrollments
            .read()
            .await
            .values()
            .filter(|e| e.record_id == record_id)
            .cloned()
            .collect()
    }

    /// Enrolls a record. Rejects a second live enrollment in the same
    /// cadence; an empty cadence completes immediately.
    pub async fn enroll(&self, cadence_id: Uuid, record_id: Uuid) -> EngineResult<CadenceEnrollment> {
        let cadence = self
            .get_cadence(cadence_id)
            .await
            .ok_or_else(|| EngineError::invalid(format!("cadence {} not found", cadence_id)))?;

        {
            let enrollments = self.enrollments.read().await;
            let live = enrollments.values().any(|e| {
                e.cadence_id == cadence_id
                    && e.record_id == record_id
                    && matches!(e.status, EnrollmentStatus::Active | EnrollmentStatus::Paused)
            });
            if live {
                return Err(EngineError::Conflict(format!(
                    "record {} already enrolled in cadence {}",
                    record_id, cadence_id
                )));
            }
        }

        let now = Utc::now();
        let mut enrollment = CadenceEnrollment {
            id: Uuid::new_v4(),
            cadence_id,
            record_id,
            current_step: 0,
            status: EnrollmentStatus::Active,
            next_step_due_at: None,
            next_step_job_id: None,
            enrolled_at: now,
            updated_at: now,
        };

        match cadence.steps.first() {
            None => {
                enrollment.status = EnrollmentStatus::Completed;
            }
            Some(step) => {
                let due_at = now + Duration::hours(step.delay_hours);
                let job_id = self
                    .scheduler
                    .schedule(
                        JobPayload::CadenceStep {
                            enrollment_id: enrollment.id,
                            step_index: 0,
                        },
                        due_at,
                    )
                    .await?;
                enrollment.next_step_due_at = Some(due_at);
                enrollment.next_step_job_id = Some(job_id);
            }
        }

        info!(
            enrollment_id = %enrollment.id,
            cadence = %cadence.name,
            record_id = %record_id,
            "record enrolled"
        );
        self.enrollments
            .write()
            .await
            .insert(enrollment.id, enrollment.clone());
        Ok(enrollment)
    }

    /// Active -> Paused. The pending step job stays in the queue; the
    /// stale-step check discards it when it fires.
    pub async fn pause(&self, enrollment_id: Uuid) -> EngineResult<CadenceEnrollment> {
        let mut enrollments = self.enrollments.write().await;
        let enrollment = enrollments
            .get_mut(&enrollment_id)
            .ok_or_else(|| EngineError::invalid(format!("enrollment {} not found", enrollment_id)))?;
        if enrollment.status != EnrollmentStatus::Active {
            return Err(EngineError::invalid(format!(
                "cannot pause enrollment in {:?} state",
                enrollment.status
            )));
        }
        enrollment.status = EnrollmentStatus::Paused;
        enrollment.updated_at = Utc::now();
        Ok(enrollment.clone())
    }

    /// Paused -> Active. Schedules a fresh step job; the pre-pause job, if
    /// still queued, is stale and will be discarded.
    pub async fn resume(&self, enrollment_id: Uuid) -> EngineResult<CadenceEnrollment> {
        let (current_step, due_at) = {
            let enrollments = self.enrollments.read().await;
            let enrollment = enrollments.get(&enrollment_id).ok_or_else(|| {
                EngineError::invalid(format!("enrollment {} not found", enrollment_id))
            })?;
            if enrollment.status != EnrollmentStatus::Paused {
                return Err(EngineError::invalid(format!(
                    "cannot resume enrollment in {:?} state",
                    enrollment.status
                )));
            }
            // An overdue step runs now; a future one keeps its slot.
            let due_at = enrollment
                .next_step_due_at
                .map(|due| due.max(Utc::now()))
                .unwrap_or_else(Utc::now);
            (enrollment.current_step, due_at)
        };

        // The old job (if any) becomes stale rather than being cancelled,
        // so this never races the sweep.
        let job_id = self
            .scheduler
            .schedule(
                JobPayload::CadenceStep {
                    enrollment_id,
                    step_index: current_step,
                },
                due_at,
            )
            .await?;

        let mut enrollments = self.enrollments.write().await;
        let enrollment = enrollments
            .get_mut(&enrollment_id)
            .ok_or_else(|| EngineError::invalid(format!("enrollment {} not found", enrollment_id)))?;
        enrollment.status = EnrollmentStatus::Active;
        enrollment.next_step_due_at = Some(due_at);
        enrollment.next_step_job_id = Some(job_id);
        enrollment.updated_at = Utc::now();
        Ok(enrollment.clone())
    }

    /// Active|Paused -> Stopped. Attempts a cooperative cancel of the
    /// pending job; a job already claimed is discarded as stale instead.
    pub async fn stop(&self, enrollment_id: Uuid) -> EngineResult<CadenceEnrollment> {
        let enrollment = {
            let mut enrollments = self.enrollments.write().await;
            let enrollment = enrollments.get_mut(&enrollment_id).ok_or_else(|| {
                EngineError::invalid(format!("enrollment {} not found", enrollment_id))
            })?;
            if !matches!(
                enrollment.status,
                EnrollmentStatus::Active | EnrollmentStatus::Paused
            ) {
                return Err(EngineError::invalid(format!(
                    "cannot stop enrollment in {:?} state",
                    enrollment.status
                )));
            }
            enrollment.status = EnrollmentStatus::Stopped;
            enrollment.next_step_due_at = None;
            enrollment.updated_at = Utc::now();
            enrollment.clone()
        };

        if let Some(job_id) = enrollment.next_step_job_id {
            let _ = self.scheduler.cancel(job_id).await?;
        }
        Ok(enrollment)
    }

    /// Stops every live enrollment for a record, optionally restricted to
    /// one cadence. Returns how many were stopped.
    pub async fn stop_for_record(
        &self,
        record_id: Uuid,
        cadence_id: Option<Uuid>,
    ) -> EngineResult<u32> {
        let targets: Vec<Uuid> = self
            .enrollments_for_record(record_id)
            .await
            .into_iter()
            .filter(|e| {
                matches!(e.status, EnrollmentStatus::Active | EnrollmentStatus::Paused)
                    && cadence_id.map(|c| e.cadence_id == c).unwrap_or(true)
            })
            .map(|e| e.id)
            .collect();

        let mut stopped = 0;
        for id in targets {
            if self.stop(id).await.is_ok() {
                stopped += 1;
            }
        }
        Ok(stopped)
    }

    /// Called by the sweep for a due step job. Returns the step's action
    /// and record when the step is still live, `None` when the job is
    /// stale (enrollment gone, not active, or pointing at another step) or
    /// the stop conditions fired.
    pub async fn begin_due_step(
        &self,
        enrollment_id: Uuid,
        step_index: usize,
    ) -> EngineResult<Option<(WorkflowAction, Uuid)>> {
        let (cadence_id, record_id) = {
            let enrollments = self.enrollments.read().await;
            let Some(enrollment) = enrollments.get(&enrollment_id) else {
                debug!(enrollment_id = %enrollment_id, "step job for unknown enrollment, discarding");
                return Ok(None);
            };
            if enrollment.status != EnrollmentStatus::Active
                || enrollment.current_step != step_index
            {
                debug!(
                    enrollment_id = %enrollment_id,
                    step_index,
                    status = ?enrollment.status,
                    current_step = enrollment.current_step,
                    "stale step job, discarding"
                );
                return Ok(None);
            }
            (enrollment.cadence_id, enrollment.record_id)
        };

        let cadence = self
            .get_cadence(cadence_id)
            .await
            .ok_or_else(|| EngineError::invalid(format!("cadence {} not found", cadence_id)))?;

        // Stop conditions run against the live record right before the
        // step.
        if let Some(conditions) = &cadence.stop_conditions {
            let record = match self.records.get(record_id).await {
                Ok(record) => record,
                Err(EngineError::RecordNotFound(_)) => {
                    self.mark_stopped(enrollment_id).await;
                    return Ok(None);
                }
                Err(e) => return Err(e),
            };
            if evaluate(conditions, &record.snapshot()) {
                info!(enrollment_id = %enrollment_id, "stop conditions met, stopping enrollment");
                self.mark_stopped(enrollment_id).await;
                return Ok(None);
            }
        }

        match cadence.steps.get(step_index) {
            Some(step) => Ok(Some((step.action.clone(), record_id))),
            None => {
                self.mark_completed(enrollment_id).await;
                Ok(None)
            }
        }
    }

    /// Advances an enrollment after its step executed. A failed step does
    /// not advance; the job retry re-runs the same step.
    pub async fn complete_step(
        &self,
        enrollment_id: Uuid,
        step_index: usize,
        success: bool,
    ) -> EngineResult<()> {
        if !success {
            return Ok(());
        }

        let (cadence_id, next_step) = {
            let mut enrollments = self.enrollments.write().await;
            let Some(enrollment) = enrollments.get_mut(&enrollment_id) else {
                return Ok(());
            };
            if enrollment.status != EnrollmentStatus::Active
                || enrollment.current_step != step_index
            {
                return Ok(());
            }
            enrollment.current_step += 1;
            enrollment.updated_at = Utc::now();
            (enrollment.cadence_id, enrollment.current_step)
        };

        let cadence = self
            .get_cadence(cadence_id)
            .await
            .ok_or_else(|| EngineError::invalid(format!("cadence {} not found", cadence_id)))?;

        match cadence.steps.get(next_step) {
            None => {
                self.mark_completed(enrollment_id).await;
            }
            Some(step) => {
                let due_at = Utc::now() + Duration::hours(step.delay_hours);
                let job_id = self
                    .scheduler
                    .schedule(
                        JobPayload::CadenceStep {
                            enrollment_id,
                            step_index: next_step,
                        },
                        due_at,
                    )
                    .await?;
                let mut enrollments = self.enrollments.write().await;
                if let Some(enrollment) = enrollments.get_mut(&enrollment_id) {
                    enrollment.next_step_due_at = Some(due_at);
                    enrollment.next_step_job_id = Some(job_id);
                    enrollment.updated_at = Utc::now();
                }
            }
        }
        Ok(())
    }

    async fn mark_completed(&self, enrollment_id: Uuid) {
        let mut enrollments = self.enrollments.write().await;
        if let Some(enrollment) = enrollments.get_mut(&enrollment_id) {
            enrollment.status = EnrollmentStatus::Completed;
            enrollment.next_step_due_at = None;
            enrollment.next_step_job_id = None;
            enrollment.updated_at = Utc::now();
        }
    }

    async fn mark_stopped(&self, enrollment_id: Uuid) {
        let mut enrollments = self.enrollments.write().await;
        if let Some(enrollment) = enrollments.get_mut(&enrollment_id) {
            enrollment.status = EnrollmentStatus::Stopped;
            enrollment.next_step_due_at = None;
            enrollment.next_step_job_id = None;
            enrollment.updated_at = Utc::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::records::{InMemoryRecordStore, Record};
    use crate::scheduler::InMemoryJobStore;
    use serde_json::json;

    fn engine() -> (CadenceEngine, Arc<InMemoryRecordStore>) {
        let records = Arc::new(InMemoryRecordStore::new());
        let scheduler = Arc::new(Scheduler::new(
            Arc::new(InMemoryJobStore::new()),
            EngineConfig::default(),
        ));
        (CadenceEngine::new(records.clone(), scheduler), records)
    }

    fn two_step_cadence() -> Cadence {
        Cadence::new(
            "lead follow-up",
            vec![
                CadenceStep::new(
                    CadenceStepKind::Email,
                    0,
                    WorkflowAction::send_email("{{email}}", "Hello", "Hi"),
                ),
                CadenceStep::new(
                    CadenceStepKind::Task,
                    24,
                    WorkflowAction::create_task("Call back", Some(4)),
                ),
            ],
        )
    }

    #[tokio::test]
    async fn test_enroll_rejects_duplicate_live_enrollment() {
        let (engine, records) = engine();
        let record = Record::new("leads", json!({}));
        let record_id = record.id;
        records.insert(record).await.unwrap();

        let cadence = two_step_cadence();
        let cadence_id = cadence.id;
        engine.register_cadence(cadence).await;

        engine.enroll(cadence_id, record_id).await.unwrap();
        let err = engine.enroll(cadence_id, record_id).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_empty_cadence_completes_immediately() {
        let (engine, _) = engine();
        let cadence = Cadence::new("empty", vec![]);
        let cadence_id = cadence.id;
        engine.register_cadence(cadence).await;

        let enrollment = engine.enroll(cadence_id, Uuid::new_v4()).await.unwrap();
        assert_eq!(enrollment.status, EnrollmentStatus::Completed);
        assert!(enrollment.next_step_job_id.is_none());
    }

    #[tokio::test]
    async fn test_paused_enrollment_discards_due_step() {
        let (engine, records) = engine();
        let record = Record::new("leads", json!({}));
        let record_id = record.id;
        records.insert(record).await.unwrap();

        let cadence = two_step_cadence();
        let cadence_id = cadence.id;
        engine.register_cadence(cadence).await;

        let enrollment = engine.enroll(cadence_id, record_id).await.unwrap();
        engine.pause(enrollment.id).await.unwrap();

        // The step 0 job is still queued, but beginning it is a no-op.
        let step = engine.begin_due_step(enrollment.id, 0).await.unwrap();
        assert!(step.is_none());
        let reloaded = engine.get_enrollment(enrollment.id).await.unwrap();
        assert_eq!(reloaded.status, EnrollmentStatus::Paused);
        assert_eq!(reloaded.current_step, 0);
    }

    #[tokio::test]
    async fn test_stale_step_index_discarded() {
        let (engine, records) = engine();
        let record = Record::new("leads", json!({}));
        let record_id = record.id;
        records.insert(record).await.unwrap();

        let cadence = two_step_cadence();
        let cadence_id = cadence.id;
        engine.register_cadence(cadence).await;

        let enrollment = engine.enroll(cadence_id, record_id).await.unwrap();
        engine.complete_step(enrollment.id, 0, true).await.unwrap();

        // A leftover job for step 0 no longer matches current_step.
        assert!(engine.begin_due_step(enrollment.id, 0).await.unwrap().is_none());
        // The live pointer works.
        assert!(engine.begin_due_step(enrollment.id, 1).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_completing_last_step_completes_enrollment() {
        let (engine, records) = engine();
        let record = Record::new("leads", json!({}));
        let record_id = record.id;
        records.insert(record).await.unwrap();

        let cadence = two_step_cadence();
        let cadence_id = cadence.id;
        engine.register_cadence(cadence).await;

        let enrollment = engine.enroll(cadence_id, record_id).await.unwrap();
        engine.complete_step(enrollment.id, 0, true).await.unwrap();
        engine.complete_step(enrollment.id, 1, true).await.unwrap();

        let reloaded = engine.get_enrollment(enrollment.id).await.unwrap();
        assert_eq!(reloaded.status, EnrollmentStatus::Completed);
    }

    #[tokio::test]
    async fn test_failed_step_does_not_advance() {
        let (engine, records) = engine();
        let record = Record::new("leads", json!({}));
        let record_id = record.id;
        records.insert(record).await.unwrap();

        let cadence = two_step_cadence();
        let cadence_id = cadence.id;
        engine.register_cadence(cadence).await;

        let enrollment = engine.enroll(cadence_id, record_id).await.unwrap();
        engine.complete_step(enrollment.id, 0, false).await.unwrap();

        let reloaded = engine.get_enrollment(enrollment.id).await.unwrap();
        assert_eq!(reloaded.current_step, 0);
    }

    #[tokio::test]
    async fn test_stop_conditions_stop_enrollment() {
        let (engine, records) = engine();
        let record = Record::new("leads", json!({"status": "customer"}));
        let record_id = record.id;
        records.insert(record).await.unwrap();

        let cadence = two_step_cadence().with_stop_conditions(ConditionGroup::single(
            crate::conditions::Condition::eq("status", json!("customer")),
        ));
        let cadence_id = cadence.id;
        engine.register_cadence(cadence).await;

        let enrollment = engine.enroll(cadence_id, record_id).await.unwrap();
        let step = engine.begin_due_step(enrollment.id, 0).await.unwrap();
        assert!(step.is_none());

        let reloaded = engine.get_enrollment(enrollment.id).await.unwrap();
        assert_eq!(reloaded.status, EnrollmentStatus::Stopped);
    }
}
