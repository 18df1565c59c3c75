//! Workflow actions: the closed set of side effects a workflow, cadence
//! step or blueprint transition can execute.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::assignment::AssignmentRule;
use crate::conditions::ConditionGroup;

/// One field write inside an `update_fields` action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldUpdate {
    pub path: String,
    pub value: Value,
}

/// Per-kind configuration payloads. Kept as a tagged variant so adding an
/// action kind is an exhaustive-match change, not a runtime surprise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionKind {
    UpdateFields {
        updates: Vec<FieldUpdate>,
    },
    AssignOwner {
        rule: AssignmentRule,
    },
    CreateTask {
        title: String,
        #[serde(default)]
        due_in_hours: Option<i64>,
        #[serde(default)]
        assignee: Option<Uuid>,
    },
    CreateActivity {
        kind: String,
        summary: String,
    },
    AddNote {
        body: String,
    },
    Notify {
        /// Defaults to the record owner when unset.
        #[serde(default)]
        user_id: Option<Uuid>,
        title: String,
        message: String,
        #[serde(default = "default_notify_level")]
        level: String,
    },
    MoveStage {
        stage: String,
    },
    StartCadence {
        cadence_id: Uuid,
    },
    StopCadence {
        /// `None` stops every cadence the record is enrolled in.
        #[serde(default)]
        cadence_id: Option<Uuid>,
    },
    CreateEnrollmentDraft {
        program: String,
        #[serde(default)]
        fields: Value,
    },
    SendEmail {
        to: String,
        subject: String,
        body: String,
    },
    SendSms {
        to: String,
        message: String,
    },
    /// Ends the current run and schedules the remaining actions as a
    /// `workflow_delay` job. Never blocks the caller.
    DelayWait {
        minutes: i64,
    },
    PostWebhook {
        url: String,
        #[serde(default)]
        payload: Value,
    },
}

fn default_notify_level() -> String {
    "info".to_string()
}

/// An action inside a workflow, with an optional condition gate evaluated
/// against the record right before execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowAction {
    pub id: Uuid,
    pub name: String,
    #[serde(flatten)]
    pub kind: ActionKind,
    #[serde(default)]
    pub condition: Option<ConditionGroup>,
}

impl WorkflowAction {
    pub fn new(name: &str, kind: ActionKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            kind,
            condition: None,
        }
    }

    pub fn with_condition(mut self, condition: ConditionGroup) -> Self {
        self.condition = Some(condition);
        self
    }

    // ===== Builders =====

    pub fn update_fields(updates: Vec<FieldUpdate>) -> Self {
        Self::new("Update Fields", ActionKind::UpdateFields { updates })
    }

    pub fn set_field(path: &str, value: Value) -> Self {
        Self::new(
            &format!("Set {}", path),
            ActionKind::UpdateFields {
                updates: vec![FieldUpdate {
                    path: path.to_string(),
                    value,
                }],
            },
        )
    }

    pub fn assign_owner(rule: AssignmentRule) -> Self {
        Self::new("Assign Owner", ActionKind::AssignOwner { rule })
    }

    pub fn create_task(title: &str, due_in_hours: Option<i64>) -> Self {
        Self::new(
            "Create Task",
            ActionKind::CreateTask {
                title: title.to_string(),
                due_in_hours,
                assignee: None,
            },
        )
    }

    pub fn create_activity(kind: &str, summary: &str) -> Self {
        Self::new(
            "Create Activity",
            ActionKind::CreateActivity {
                kind: kind.to_string(),
                summary: summary.to_string(),
            },
        )
    }

    pub fn add_note(body: &str) -> Self {
        Self::new("Add Note", ActionKind::AddNote { body: body.to_string() })
    }

    pub fn notify(user_id: Option<Uuid>, title: &str, message: &str) -> Self {
        Self::new(
            "Notify",
            ActionKind::Notify {
                user_id,
                title: title.to_string(),
                message: message.to_string(),
                level: default_notify_level(),
            },
        )
    }

    pub fn move_stage(stage: &str) -> Self {
        Self::new(
            &format!("Move to {}", stage),
            ActionKind::MoveStage {
                stage: stage.to_string(),
            },
        )
    }

    pub fn start_cadence(cadence_id: Uuid) -> Self {
        Self::new("Start Cadence", ActionKind::StartCadence { cadence_id })
    }

    pub fn stop_cadence(cadence_id: Option<Uuid>) -> Self {
        Self::new("Stop Cadence", ActionKind::StopCadence { cadence_id })
    }

    pub fn send_email(to: &str, subject: &str, body: &str) -> Self {
        Self::new(
            "Send Email",
            ActionKind::SendEmail {
                to: to.to_string(),
                subject: subject.to_string(),
                body: body.to_string(),
            },
        )
    }

    pub fn send_sms(to: &str, message: &str) -> Self {
        Self::new(
            "Send SMS",
            ActionKind::SendSms {
                to: to.to_string(),
                message: message.to_string(),
            },
        )
    }

    pub fn delay_wait(minutes: i64) -> Self {
        Self::new(
            &format!("Wait {} minutes", minutes),
            ActionKind::DelayWait { minutes },
        )
    }

    pub fn post_webhook(url: &str, payload: Value) -> Self {
        Self::new(
            "Post Webhook",
            ActionKind::PostWebhook {
                url: url.to_string(),
                payload,
            },
        )
    }

    /// Whether this action writes back to the record, which re-enters
    /// trigger matching after it runs.
    pub fn mutates_record(&self) -> bool {
        matches!(
            self.kind,
            ActionKind::UpdateFields { .. } | ActionKind::MoveStage { .. } | ActionKind::AssignOwner { .. }
        )
    }
}

/// Result of executing a single action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub duration_ms: i64,
}

impl ActionResult {
    pub fn success(output: Option<Value>) -> Self {
        Self {
            success: true,
            output,
            error: None,
            duration_ms: 0,
        }
    }

    pub fn failure(error: &str) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.to_string()),
            duration_ms: 0,
        }
    }

    pub fn skipped() -> Self {
        Self::success(Some(serde_json::json!({ "skipped": true })))
    }

    pub fn with_duration(mut self, duration_ms: i64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::Condition;
    use serde_json::json;

    #[test]
    fn test_action_builder() {
        let action = WorkflowAction::move_stage("qualified")
            .with_condition(ConditionGroup::single(Condition::eq("status", json!("hot_lead"))));

        assert!(matches!(action.kind, ActionKind::MoveStage { .. }));
        assert!(action.condition.is_some());
        assert!(action.mutates_record());
    }

    #[test]
    fn test_tagged_serde_shape() {
        let action = WorkflowAction::send_email("{{email}}", "Welcome", "Hi there");
        let value = serde_json::to_value(&action).unwrap();
        assert_eq!(value["type"], json!("send_email"));
        assert_eq!(value["to"], json!("{{email}}"));

        let parsed: WorkflowAction = serde_json::from_value(value).unwrap();
        assert!(matches!(parsed.kind, ActionKind::SendEmail { .. }));
    }

    #[test]
    fn test_action_result() {
        let ok = ActionResult::success(Some(json!({"task_id": "t1"}))).with_duration(12);
        assert!(ok.success);
        assert_eq!(ok.duration_ms, 12);

        let failed = ActionResult::failure("dispatch timed out");
        assert!(!failed.success);
        assert!(failed.error.is_some());
    }
}
