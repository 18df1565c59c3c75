//! Blueprint engine: per-module stage graphs with guarded transitions.
//!
//! A transition only applies when the record still sits on the edge's
//! source stage at write time; the stage patch carries an
//! expected-previous guard, so a concurrent move surfaces as a conflict
//! instead of a silent double transition.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::approvals::{Approval, ApprovalEngine, ApprovalStatus, ApprovalStepSpec};
use crate::conditions::{evaluate, resolve_path, value_is_empty, ConditionGroup};
use crate::error::{EngineError, EngineResult};
use crate::records::{FieldPatch, Record, RecordStore};
use crate::workflows::actions::WorkflowAction;
use crate::workflows::engine::{
    AutomationRunResult, ExecutionContext, FailurePolicy, WorkflowEngine,
};
use crate::workflows::triggers::TriggerType;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlueprintTransition {
    pub id: Uuid,
    pub name: String,
    pub from_stage: String,
    pub to_stage: String,
    #[serde(default)]
    pub conditions: Option<ConditionGroup>,
    /// Fields that must be non-empty before the transition may run.
    #[serde(default)]
    pub required_fields: Vec<String>,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default)]
    pub approval_steps: Vec<ApprovalStepSpec>,
    /// Actions executed after the stage moves.
    #[serde(default)]
    pub post_actions: Vec<WorkflowAction>,
}

impl BlueprintTransition {
    pub fn new(name: &str, from_stage: &str, to_stage: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            from_stage: from_stage.to_string(),
            to_stage: to_stage.to_string(),
            conditions: None,
            required_fields: Vec::new(),
            requires_approval: false,
            approval_steps: Vec::new(),
            post_actions: Vec::new(),
        }
    }

    pub fn with_conditions(mut self, conditions: ConditionGroup) -> Self {
        self.conditions = Some(conditions);
        self
    }

    pub fn with_required_fields(mut self, fields: Vec<&str>) -> Self {
        self.required_fields = fields.into_iter().map(String::from).collect();
        self
    }

    pub fn with_approval(mut self, steps: Vec<ApprovalStepSpec>) -> Self {
        self.requires_approval = true;
        self.approval_steps = steps;
        self
    }

    pub fn with_post_actions(mut self, actions: Vec<WorkflowAction>) -> Self {
        self.post_actions = actions;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Blueprint {
    pub id: Uuid,
    pub name: String,
    pub module: String,
    pub stages: Vec<String>,
    pub transitions: Vec<BlueprintTransition>,
}

impl Blueprint {
    pub fn new(name: &str, module: &str, stages: Vec<&str>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            module: module.to_string(),
            stages: stages.into_iter().map(String::from).collect(),
            transitions: Vec::new(),
        }
    }

    pub fn with_transitions(mut self, transitions: Vec<BlueprintTransition>) -> Self {
        self.transitions = transitions;
        self
    }

    pub fn transition(&self, transition_id: Uuid) -> Option<&BlueprintTransition> {
        self.transitions.iter().find(|t| t.id == transition_id)
    }

    /// Transitions available from the record's current stage.
    pub fn transitions_from(&self, stage: &str) -> Vec<&BlueprintTransition> {
        self.transitions
            .iter()
            .filter(|t| t.from_stage == stage)
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionValidation {
    pub allowed: bool,
    pub missing_fields: Vec<String>,
    pub reason: Option<String>,
}

impl TransitionValidation {
    fn ok() -> Self {
        Self {
            allowed: true,
            missing_fields: Vec::new(),
            reason: None,
        }
    }

    fn blocked(reason: &str) -> Self {
        Self {
            allowed: false,
            missing_fields: Vec::new(),
            reason: Some(reason.to_string()),
        }
    }

    fn missing(fields: Vec<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(format!("required fields missing: {}", fields.join(", "))),
            missing_fields: fields,
        }
    }
}

/// What executing a transition did.
#[derive(Debug)]
pub enum TransitionOutcome {
    /// Stage moved; post-actions ran.
    Applied(AutomationRunResult),
    /// Approval opened; the stage is untouched until it fully approves.
    PendingApproval(Approval),
    Rejected(TransitionValidation),
}

pub struct BlueprintEngine {
    blueprints: RwLock<HashMap<Uuid, Blueprint>>,
    records: Arc<dyn RecordStore>,
    workflow_engine: Arc<WorkflowEngine>,
    approvals: Arc<ApprovalEngine>,
}

impl BlueprintEngine {
    pub fn new(
        records: Arc<dyn RecordStore>,
        workflow_engine: Arc<WorkflowEngine>,
        approvals: Arc<ApprovalEngine>,
    ) -> Self {
        Self {
            blueprints: RwLock::new(HashMap::new()),
            records,
            workflow_engine,
            approvals,
        }
    }

    pub async fn register_blueprint(&self, blueprint: Blueprint) {
        info!(blueprint_id = %blueprint.id, name = %blueprint.name, "registering blueprint");
        self.blueprints
            .write()
            .await
            .insert(blueprint.id, blueprint);
    }

    pub async fn get_blueprint(&self, blueprint_id: Uuid) -> Option<Blueprint> {
        self.blueprints.read().await.get(&blueprint_id).cloned()
    }

    /// Checks whether a transition may run for a record, without running
    /// it. Check order: edge, conditions, required fields; all missing
    /// fields are reported together.
    pub async fn validate_transition(
        &self,
        blueprint_id: Uuid,
        transition_id: Uuid,
        record_id: Uuid,
    ) -> EngineResult<TransitionValidation> {
        let (_, transition) = self.lookup(blueprint_id, transition_id).await?;
        let record = self.records.get(record_id).await?;
        Ok(validate(&transition, &record))
    }

    /// Runs a transition end to end: validation, then either an approval
    /// or the guarded stage move plus post-actions.
    pub async fn execute_transition(
        &self,
        blueprint_id: Uuid,
        transition_id: Uuid,
        record_id: Uuid,
        requested_by: Uuid,
    ) -> EngineResult<TransitionOutcome> {
        let (blueprint, transition) = self.lookup(blueprint_id, transition_id).await?;
        let record = self.records.get(record_id).await?;

        let validation = validate(&transition, &record);
        if !validation.allowed {
            return Ok(TransitionOutcome::Rejected(validation));
        }

        if transition.requires_approval {
            let approval = self
                .approvals
                .create(
                    blueprint.id,
                    transition.id,
                    record_id,
                    &transition.to_stage,
                    &transition.approval_steps,
                    requested_by,
                )
                .await?;
            return Ok(TransitionOutcome::PendingApproval(approval));
        }

        let result = self.apply(&transition, record_id).await?;
        Ok(TransitionOutcome::Applied(result))
    }

    /// Finalizes a transition whose approval fully approved. The stage
    /// guard still applies: if the record left the source stage while the
    /// approval was open, this fails with a conflict.
    pub async fn execute_approved_transition(
        &self,
        approval: &Approval,
    ) -> EngineResult<AutomationRunResult> {
        if approval.status != ApprovalStatus::Approved {
            return Err(EngineError::invalid(format!(
                "approval is {:?}, transition cannot be finalized",
                approval.status
            )));
        }
        let (_, transition) = self
            .lookup(approval.blueprint_id, approval.transition_id)
            .await?;
        self.apply(&transition, approval.record_id).await
    }

    async fn lookup(
        &self,
        blueprint_id: Uuid,
        transition_id: Uuid,
    ) -> EngineResult<(Blueprint, BlueprintTransition)> {
        let blueprint = self
            .get_blueprint(blueprint_id)
            .await
            .ok_or_else(|| EngineError::invalid(format!("blueprint {} not found", blueprint_id)))?;
        let transition = blueprint
            .transition(transition_id)
            .ok_or_else(|| {
                EngineError::invalid(format!("transition {} not found", transition_id))
            })?
            .clone();
        Ok((blueprint, transition))
    }

    async fn apply(
        &self,
        transition: &BlueprintTransition,
        record_id: Uuid,
    ) -> EngineResult<AutomationRunResult> {
        self.records
            .patch(
                record_id,
                &[FieldPatch::guarded(
                    "stage",
                    json!(transition.to_stage),
                    json!(transition.from_stage),
                )],
            )
            .await?;
        info!(
            transition = %transition.name,
            record_id = %record_id,
            to_stage = %transition.to_stage,
            "transition applied"
        );

        let record = self.records.get(record_id).await?;
        let ctx = ExecutionContext::root(self.workflow_engine.config().max_actions_per_run);
        self.workflow_engine
            .execute_action_list(
                None,
                TriggerType::Manual,
                &transition.post_actions,
                record,
                ctx,
                FailurePolicy::Halt,
            )
            .await
    }
}

/// Transition check against a record, in order: edge, conditions,
/// required fields.
pub fn validate(transition: &BlueprintTransition, record: &Record) -> TransitionValidation {
    let current_stage = record.stage.as_deref().unwrap_or("");
    if current_stage != transition.from_stage {
        return TransitionValidation::blocked(&format!(
            "record is in stage '{}', transition starts from '{}'",
            current_stage, transition.from_stage
        ));
    }

    let snapshot = record.snapshot();
    if let Some(conditions) = &transition.conditions {
        if !evaluate(conditions, &snapshot) {
            return TransitionValidation::blocked("transition conditions not met");
        }
    }

    let missing: Vec<String> = transition
        .required_fields
        .iter()
        .filter(|field| value_is_empty(resolve_path(&snapshot, field)))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return TransitionValidation::missing(missing);
    }

    TransitionValidation::ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::Condition;
    use crate::records::Record;

    fn record_in(stage: &str, fields: serde_json::Value) -> Record {
        Record::new("deals", fields).with_stage(stage)
    }

    #[test]
    fn test_validate_wrong_stage() {
        let transition = BlueprintTransition::new("Close", "negotiation", "closed_won");
        let record = record_in("qualified", json!({}));

        let validation = validate(&transition, &record);
        assert!(!validation.allowed);
        assert!(validation.reason.unwrap().contains("qualified"));
    }

    #[test]
    fn test_validate_collects_all_missing_fields() {
        let transition = BlueprintTransition::new("Close", "negotiation", "closed_won")
            .with_required_fields(vec!["close_date", "amount"]);
        let record = record_in("negotiation", json!({ "amount": null }));

        let validation = validate(&transition, &record);
        assert!(!validation.allowed);
        assert_eq!(validation.missing_fields, vec!["close_date", "amount"]);
    }

    #[test]
    fn test_validate_conditions_before_fields() {
        let transition = BlueprintTransition::new("Close", "negotiation", "closed_won")
            .with_conditions(ConditionGroup::single(Condition::gt("amount", 1000.0)))
            .with_required_fields(vec!["close_date"]);
        let record = record_in("negotiation", json!({ "amount": 10 }));

        let validation = validate(&transition, &record);
        assert!(!validation.allowed);
        // Condition failure reported, field check not reached.
        assert!(validation.missing_fields.is_empty());
    }

    #[test]
    fn test_validate_passes() {
        let transition = BlueprintTransition::new("Close", "negotiation", "closed_won")
            .with_required_fields(vec!["close_date"]);
        let record = record_in("negotiation", json!({ "close_date": "2026-09-01" }));

        assert!(validate(&transition, &record).allowed);
    }

    #[test]
    fn test_transitions_from() {
        let blueprint = Blueprint::new("Deal flow", "deals", vec!["new", "qualified", "closed_won"])
            .with_transitions(vec![
                BlueprintTransition::new("Qualify", "new", "qualified"),
                BlueprintTransition::new("Close", "qualified", "closed_won"),
            ]);

        let from_new = blueprint.transitions_from("new");
        assert_eq!(from_new.len(), 1);
        assert_eq!(from_new[0].name, "Qualify");
    }
}
