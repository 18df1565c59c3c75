//! Approval engine for gated blueprint transitions.
//!
//! Status moves are one-way: a terminal approval (approved, rejected,
//! cancelled, expired) never changes again. The single exception is
//! `changes_requested`, which the original requester can resubmit back to
//! pending on the same step.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::assignment::{AssignmentEngine, AssignmentRule};
use crate::dispatch::UserDirectory;
use crate::error::{EngineError, EngineResult};
use crate::records::{Record, RecordStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    ChangesRequested,
    Cancelled,
    Expired,
}

impl ApprovalStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ApprovalStatus::Approved
                | ApprovalStatus::Rejected
                | ApprovalStatus::Cancelled
                | ApprovalStatus::Expired
        )
    }
}

/// Who may decide a step. Role and rule references resolve to concrete
/// users when the step becomes current, against the record as it is then.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "approver", rename_all = "snake_case")]
pub enum ApproverRef {
    Users { users: Vec<Uuid> },
    Role { role: String },
    Rule { rule: Box<AssignmentRule> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalStepSpec {
    pub name: String,
    pub approvers: ApproverRef,
}

impl ApprovalStepSpec {
    pub fn users(name: &str, users: Vec<Uuid>) -> Self {
        Self {
            name: name.to_string(),
            approvers: ApproverRef::Users { users },
        }
    }

    pub fn role(name: &str, role: &str) -> Self {
        Self {
            name: name.to_string(),
            approvers: ApproverRef::Role {
                role: role.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalStep {
    pub spec: ApprovalStepSpec,
    /// Concrete approvers, filled in when the step becomes current.
    pub resolved_approvers: Vec<Uuid>,
    pub decided_by: Option<Uuid>,
    pub decided_at: Option<DateTime<Utc>>,
    pub comment: Option<String>,
}

impl ApprovalStep {
    fn pending(spec: ApprovalStepSpec) -> Self {
        Self {
            spec,
            resolved_approvers: Vec::new(),
            decided_by: None,
            decided_at: None,
            comment: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub id: Uuid,
    pub blueprint_id: Uuid,
    pub transition_id: Uuid,
    pub record_id: Uuid,
    /// Stage the record moves to once fully approved.
    pub target_stage: String,
    pub current_step: usize,
    pub steps: Vec<ApprovalStep>,
    pub status: ApprovalStatus,
    pub requested_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalActionKind {
    Approve,
    Reject,
    RequestChanges,
    Cancel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalActionRequest {
    pub action: ApprovalActionKind,
    pub actor: Uuid,
    #[serde(default)]
    pub comment: Option<String>,
}

/// What an action did to the approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalOutcome {
    /// Step approved, a later step is now current.
    Advanced,
    /// Final step approved; the transition may be finalized.
    FinalApproved,
    Rejected,
    ChangesRequested,
    Cancelled,
}

pub struct ApprovalEngine {
    approvals: RwLock<HashMap<Uuid, Approval>>,
    directory: Arc<dyn UserDirectory>,
    assignment: Arc<AssignmentEngine>,
    records: Arc<dyn RecordStore>,
}

impl ApprovalEngine {
    pub fn new(
        directory: Arc<dyn UserDirectory>,
        assignment: Arc<AssignmentEngine>,
        records: Arc<dyn RecordStore>,
    ) -> Self {
        Self {
            approvals: RwLock::new(HashMap::new()),
            directory,
            assignment,
            records,
        }
    }

    /// Opens an approval with the first step resolved. A step that
    /// resolves to nobody is a configuration error.
    pub async fn create(
        &self,
        blueprint_id: Uuid,
        transition_id: Uuid,
        record_id: Uuid,
        target_stage: &str,
        step_specs: &[ApprovalStepSpec],
        requested_by: Uuid,
    ) -> EngineResult<Approval> {
        if step_specs.is_empty() {
            return Err(EngineError::invalid("approval requires at least one step"));
        }

        let record = self.records.get(record_id).await?;
        let mut steps: Vec<ApprovalStep> = step_specs
            .iter()
            .cloned()
            .map(ApprovalStep::pending)
            .collect();
        let resolved = self.resolve_approvers(&step_specs[0].approvers, &record).await?;
        if resolved.is_empty() {
            return Err(EngineError::invalid(format!(
                "approval step '{}' resolves to no approvers",
                step_specs[0].name
            )));
        }
        steps[0].resolved_approvers = resolved;

        let now = Utc::now();
        let approval = Approval {
            id: Uuid::new_v4(),
            blueprint_id,
            transition_id,
            record_id,
            target_stage: target_stage.to_string(),
            current_step: 0,
            steps,
            status: ApprovalStatus::Pending,
            requested_by,
            created_at: now,
            updated_at: now,
        };

        info!(approval_id = %approval.id, record_id = %record_id, "approval opened");
        self.approvals
            .write()
            .await
            .insert(approval.id, approval.clone());
        Ok(approval)
    }

    async fn resolve_approvers(
        &self,
        approvers: &ApproverRef,
        record: &Record,
    ) -> EngineResult<Vec<Uuid>> {
        match approvers {
            ApproverRef::Users { users } => Ok(users.clone()),
            ApproverRef::Role { role } => self.directory.users_in_role(role).await,
            ApproverRef::Rule { rule } => {
                let decision = self.assignment.resolve(rule, record).await;
                Ok(decision.owner_id.into_iter().collect())
            }
        }
    }

    pub async fn get(&self, approval_id: Uuid) -> Option<Approval> {
        self.approvals.read().await.get(&approval_id).cloned()
    }

    pub async fn for_record(&self, record_id: Uuid) -> Vec<Approval> {
        self.approvals
            .read()
            .await
            .values()
            .filter(|a| a.record_id == record_id)
            .cloned()
            .collect()
    }

    /// Whether `user` may decide the current step.
    pub async fn is_user_approver(&self, approval_id: Uuid, user: Uuid) -> bool {
        match self.get(approval_id).await {
            Some(approval) => approval
                .steps
                .get(approval.current_step)
                .map(|s| s.resolved_approvers.contains(&user))
                .unwrap_or(false),
            None => false,
        }
    }

    /// Applies an approver action. Only pending approvals accept actions,
    /// and only from an approver of the current step.
    pub async fn execute_action(
        &self,
        approval_id: Uuid,
        request: &ApprovalActionRequest,
    ) -> EngineResult<(Approval, ApprovalOutcome)> {
        let mut approvals = self.approvals.write().await;
        let approval = approvals
            .get_mut(&approval_id)
            .ok_or_else(|| EngineError::invalid(format!("approval {} not found", approval_id)))?;

        if approval.status != ApprovalStatus::Pending {
            return Err(EngineError::invalid(format!(
                "approval is {:?}, no further actions accepted",
                approval.status
            )));
        }
        let step_index = approval.current_step;
        let authorized = approval
            .steps
            .get(step_index)
            .map(|s| s.resolved_approvers.contains(&request.actor))
            .unwrap_or(false);
        if !authorized {
            return Err(EngineError::invalid(
                "actor is not an approver of the current step",
            ));
        }

        let now = Utc::now();
        if let Some(step) = approval.steps.get_mut(step_index) {
            step.decided_by = Some(request.actor);
            step.decided_at = Some(now);
            step.comment = request.comment.clone();
        }
        approval.updated_at = now;

        let outcome = match request.action {
            ApprovalActionKind::Approve => {
                if step_index + 1 >= approval.steps.len() {
                    approval.status = ApprovalStatus::Approved;
                    ApprovalOutcome::FinalApproved
                } else {
                    let next_index = step_index + 1;
                    let record = self.records.get(approval.record_id).await?;
                    let approvers = approval.steps[next_index].spec.approvers.clone();
                    let resolved = self.resolve_approvers(&approvers, &record).await?;
                    if resolved.is_empty() {
                        return Err(EngineError::invalid(format!(
                            "approval step '{}' resolves to no approvers",
                            approval.steps[next_index].spec.name
                        )));
                    }
                    approval.current_step = next_index;
                    approval.steps[next_index].resolved_approvers = resolved;
                    ApprovalOutcome::Advanced
                }
            }
            ApprovalActionKind::Reject => {
                approval.status = ApprovalStatus::Rejected;
                ApprovalOutcome::Rejected
            }
            ApprovalActionKind::RequestChanges => {
                approval.status = ApprovalStatus::ChangesRequested;
                ApprovalOutcome::ChangesRequested
            }
            ApprovalActionKind::Cancel => {
                approval.status = ApprovalStatus::Cancelled;
                ApprovalOutcome::Cancelled
            }
        };

        info!(
            approval_id = %approval_id,
            action = ?request.action,
            status = ?approval.status,
            "approval action applied"
        );
        Ok((approval.clone(), outcome))
    }

    /// Requester resubmits after changes were requested. The approval
    /// returns to pending on the same step, with approvers re-resolved
    /// against the current record.
    pub async fn resubmit(&self, approval_id: Uuid, actor: Uuid) -> EngineResult<Approval> {
        let mut approvals = self.approvals.write().await;
        let approval = approvals
            .get_mut(&approval_id)
            .ok_or_else(|| EngineError::invalid(format!("approval {} not found", approval_id)))?;

        if approval.status != ApprovalStatus::ChangesRequested {
            return Err(EngineError::invalid(format!(
                "only changes_requested approvals can be resubmitted, this one is {:?}",
                approval.status
            )));
        }
        if approval.requested_by != actor {
            return Err(EngineError::invalid(
                "only the original requester can resubmit",
            ));
        }

        let step_index = approval.current_step;
        let record = self.records.get(approval.record_id).await?;
        let approvers = approval.steps[step_index].spec.approvers.clone();
        let resolved = self.resolve_approvers(&approvers, &record).await?;
        if resolved.is_empty() {
            return Err(EngineError::invalid(format!(
                "approval step '{}' resolves to no approvers",
                approval.steps[step_index].spec.name
            )));
        }

        approval.status = ApprovalStatus::Pending;
        approval.steps[step_index].resolved_approvers = resolved;
        approval.steps[step_index].decided_by = None;
        approval.steps[step_index].decided_at = None;
        approval.updated_at = Utc::now();
        Ok(approval.clone())
    }

    /// Times out a pending approval. No timer is wired by default; callers
    /// decide when an approval has waited too long.
    pub async fn expire(&self, approval_id: Uuid) -> EngineResult<Approval> {
        let mut approvals = self.approvals.write().await;
        let approval = approvals
            .get_mut(&approval_id)
            .ok_or_else(|| EngineError::invalid(format!("approval {} not found", approval_id)))?;
        if approval.status != ApprovalStatus::Pending {
            return Err(EngineError::invalid(format!(
                "only pending approvals can expire, this one is {:?}",
                approval.status
            )));
        }
        approval.status = ApprovalStatus::Expired;
        approval.updated_at = Utc::now();
        Ok(approval.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assignment::InMemoryRotationStore;
    use crate::dispatch::memory::InMemoryDirectory;
    use crate::records::{InMemoryRecordStore, Record};
    use serde_json::json;

    struct Fixture {
        engine: ApprovalEngine,
        records: Arc<InMemoryRecordStore>,
        directory: Arc<InMemoryDirectory>,
    }

    fn fixture() -> Fixture {
        let records = Arc::new(InMemoryRecordStore::new());
        let directory = Arc::new(InMemoryDirectory::new());
        let assignment = Arc::new(AssignmentEngine::new(
            Arc::new(InMemoryRotationStore::new()),
            records.clone(),
        ));
        Fixture {
            engine: ApprovalEngine::new(directory.clone(), assignment, records.clone()),
            records,
            directory,
        }
    }

    async fn seeded_record(records: &InMemoryRecordStore) -> Uuid {
        let record = Record::new("deals", json!({"amount": 50000}));
        let id = record.id;
        records.insert(record).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_two_step_approval_advances_then_finalizes() {
        let f = fixture();
        let record_id = seeded_record(&f.records).await;
        let (manager, director, requester) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        let approval = f
            .engine
            .create(
                Uuid::new_v4(),
                Uuid::new_v4(),
                record_id,
                "closed_won",
                &[
                    ApprovalStepSpec::users("manager", vec![manager]),
                    ApprovalStepSpec::users("director", vec![director]),
                ],
                requester,
            )
            .await
            .unwrap();

        let (approval, outcome) = f
            .engine
            .execute_action(
                approval.id,
                &ApprovalActionRequest {
                    action: ApprovalActionKind::Approve,
                    actor: manager,
                    comment: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome, ApprovalOutcome::Advanced);
        assert_eq!(approval.current_step, 1);

        let (approval, outcome) = f
            .engine
            .execute_action(
                approval.id,
                &ApprovalActionRequest {
                    action: ApprovalActionKind::Approve,
                    actor: director,
                    comment: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome, ApprovalOutcome::FinalApproved);
        assert_eq!(approval.status, ApprovalStatus::Approved);
    }

    #[tokio::test]
    async fn test_non_approver_rejected() {
        let f = fixture();
        let record_id = seeded_record(&f.records).await;
        let manager = Uuid::new_v4();

        let approval = f
            .engine
            .create(
                Uuid::new_v4(),
                Uuid::new_v4(),
                record_id,
                "closed_won",
                &[ApprovalStepSpec::users("manager", vec![manager])],
                Uuid::new_v4(),
            )
            .await
            .unwrap();

        let err = f
            .engine
            .execute_action(
                approval.id,
                &ApprovalActionRequest {
                    action: ApprovalActionKind::Approve,
                    actor: Uuid::new_v4(),
                    comment: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_terminal_status_is_monotonic() {
        let f = fixture();
        let record_id = seeded_record(&f.records).await;
        let manager = Uuid::new_v4();

        let approval = f
            .engine
            .create(
                Uuid::new_v4(),
                Uuid::new_v4(),
                record_id,
                "closed_won",
                &[ApprovalStepSpec::users("manager", vec![manager])],
                Uuid::new_v4(),
            )
            .await
            .unwrap();

        f.engine
            .execute_action(
                approval.id,
                &ApprovalActionRequest {
                    action: ApprovalActionKind::Reject,
                    actor: manager,
                    comment: Some("too risky".to_string()),
                },
            )
            .await
            .unwrap();

        let err = f
            .engine
            .execute_action(
                approval.id,
                &ApprovalActionRequest {
                    action: ApprovalActionKind::Approve,
                    actor: manager,
                    comment: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_changes_requested_resubmit_cycle() {
        let f = fixture();
        let record_id = seeded_record(&f.records).await;
        let (manager, requester) = (Uuid::new_v4(), Uuid::new_v4());

        let approval = f
            .engine
            .create(
                Uuid::new_v4(),
                Uuid::new_v4(),
                record_id,
                "closed_won",
                &[ApprovalStepSpec::users("manager", vec![manager])],
                requester,
            )
            .await
            .unwrap();

        f.engine
            .execute_action(
                approval.id,
                &ApprovalActionRequest {
                    action: ApprovalActionKind::RequestChanges,
                    actor: manager,
                    comment: Some("fix the close date".to_string()),
                },
            )
            .await
            .unwrap();

        // Only the requester can resubmit.
        let err = f.engine.resubmit(approval.id, manager).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidRequest(_)));

        let approval = f.engine.resubmit(approval.id, requester).await.unwrap();
        assert_eq!(approval.status, ApprovalStatus::Pending);
        assert_eq!(approval.current_step, 0);
    }

    #[tokio::test]
    async fn test_role_approvers_resolved_at_step_entry() {
        let f = fixture();
        let record_id = seeded_record(&f.records).await;
        let manager = Uuid::new_v4();
        f.directory.set_role("sales_manager", vec![manager]).await;

        let approval = f
            .engine
            .create(
                Uuid::new_v4(),
                Uuid::new_v4(),
                record_id,
                "closed_won",
                &[ApprovalStepSpec::role("manager", "sales_manager")],
                Uuid::new_v4(),
            )
            .await
            .unwrap();

        assert!(f.engine.is_user_approver(approval.id, manager).await);
    }

    #[tokio::test]
    async fn test_empty_resolution_is_invalid() {
        let f = fixture();
        let record_id = seeded_record(&f.records).await;

        let err = f
            .engine
            .create(
                Uuid::new_v4(),
                Uuid::new_v4(),
                record_id,
                "closed_won",
                &[ApprovalStepSpec::role("manager", "nobody_has_this_role")],
                Uuid::new_v4(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_expire_pending_only() {
        let f = fixture();
        let record_id = seeded_record(&f.records).await;
        let manager = Uuid::new_v4();

        let approval = f
            .engine
            .create(
                Uuid::new_v4(),
                Uuid::new_v4(),
                record_id,
                "closed_won",
                &[ApprovalStepSpec::users("manager", vec![manager])],
                Uuid::new_v4(),
            )
            .await
            .unwrap();

        let expired = f.engine.expire(approval.id).await.unwrap();
        assert_eq!(expired.status, ApprovalStatus::Expired);
        assert!(f.engine.expire(approval.id).await.is_err());
    }
}
