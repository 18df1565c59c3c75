//! Action executor.
//!
//! `execute` is infallible at the type level: every action produces an
//! `ActionResult`, and store conflicts, dispatch timeouts and collaborator
//! errors are folded into a failed result for the run loop's failure
//! policy to act on.

use chrono::{Duration, Utc};
use regex::Regex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};
use tracing::{error, info, warn};

use crate::assignment::AssignmentEngine;
use crate::cadence::CadenceEngine;
use crate::config::EngineConfig;
use crate::dispatch::{
    ActivitySpec, AuditEvent, AuditSink, CollaborationSink, EnrollmentDraftSpec, MessageChannel,
    MessageDispatcher, MessageRequest, NoteSpec, NotificationSpec, TaskSpec, WebhookPoster,
};
use crate::error::{EngineError, EngineResult};
use crate::records::{FieldPatch, Record, RecordStore};
use crate::workflows::actions::{ActionKind, ActionResult, WorkflowAction};
use crate::workflows::engine::ExecutionContext;

pub struct ActionExecutor {
    config: EngineConfig,
    records: Arc<dyn RecordStore>,
    assignment: Arc<AssignmentEngine>,
    cadence: Arc<CadenceEngine>,
    dispatcher: Arc<dyn MessageDispatcher>,
    webhooks: Arc<dyn WebhookPoster>,
    sink: Arc<dyn CollaborationSink>,
    audit: Arc<dyn AuditSink>,
}

impl ActionExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        records: Arc<dyn RecordStore>,
        assignment: Arc<AssignmentEngine>,
        cadence: Arc<CadenceEngine>,
        dispatcher: Arc<dyn MessageDispatcher>,
        webhooks: Arc<dyn WebhookPoster>,
        sink: Arc<dyn CollaborationSink>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            config,
            records,
            assignment,
            cadence,
            dispatcher,
            webhooks,
            sink,
            audit,
        }
    }

    /// Executes one action against a record. Never returns `Err`; failures
    /// land in the result.
    pub async fn execute(
        &self,
        action: &WorkflowAction,
        record: &Record,
        ctx: &ExecutionContext,
    ) -> ActionResult {
        let started = Instant::now();
        info!(
            run_id = %ctx.run_id,
            action = %action.name,
            record_id = %record.id,
            "executing action"
        );

        let result = match self.execute_kind(action, record).await {
            Ok(result) => result,
            Err(e) => {
                error!(action = %action.name, error = %e, "action failed");
                ActionResult::failure(&e.to_string())
            }
        };

        result.with_duration(started.elapsed().as_millis() as i64)
    }

    async fn execute_kind(
        &self,
        action: &WorkflowAction,
        record: &Record,
    ) -> EngineResult<ActionResult> {
        let snapshot = record.snapshot();

        match &action.kind {
            ActionKind::UpdateFields { updates } => {
                let patches: Vec<FieldPatch> = updates
                    .iter()
                    .map(|u| {
                        let current = record.field(&u.path).unwrap_or(Value::Null);
                        FieldPatch::guarded(&u.path, u.value.clone(), current)
                    })
                    .collect();
                self.records.patch(record.id, &patches).await?;
                Ok(ActionResult::success(Some(json!({
                    "updated": patches.len()
                }))))
            }

            ActionKind::AssignOwner { rule } => {
                let decision = self.assignment.resolve(rule, record).await;
                match decision.owner_id {
                    Some(owner_id) => {
                        let current = record
                            .owner_id
                            .map(|o| json!(o.to_string()))
                            .unwrap_or(Value::Null);
                        self.records
                            .patch(
                                record.id,
                                &[FieldPatch::guarded(
                                    "owner_id",
                                    json!(owner_id.to_string()),
                                    current,
                                )],
                            )
                            .await?;
                        self.audit
                            .record(AuditEvent::new(
                                "owner_assigned",
                                &record.module,
                                record.id,
                                json!({ "owner_id": owner_id, "reason": decision.reason }),
                            ))
                            .await;
                        Ok(ActionResult::success(Some(json!({
                            "owner_id": owner_id,
                            "reason": decision.reason
                        }))))
                    }
                    // No candidate resolved: a no-op, not a failure.
                    None => {
                        warn!(rule = %rule.name, reason = %decision.reason, "assignment produced no owner");
                        Ok(ActionResult::success(Some(json!({
                            "owner_id": null,
                            "reason": decision.reason
                        }))))
                    }
                }
            }

            ActionKind::CreateTask {
                title,
                due_in_hours,
                assignee,
            } => {
                let task = TaskSpec {
                    record_id: record.id,
                    title: render_template(title, &snapshot),
                    due_at: due_in_hours.map(|h| Utc::now() + Duration::hours(h)),
                    assignee: assignee.or(record.owner_id),
                };
                let task_id = self.sink.create_task(&task).await?;
                Ok(ActionResult::success(Some(json!({ "task_id": task_id }))))
            }

            ActionKind::CreateActivity { kind, summary } => {
                let activity = ActivitySpec {
                    record_id: record.id,
                    kind: kind.clone(),
                    summary: render_template(summary, &snapshot),
                };
                let activity_id = self.sink.create_activity(&activity).await?;
                Ok(ActionResult::success(Some(json!({
                    "activity_id": activity_id
                }))))
            }

            ActionKind::AddNote { body } => {
                let note = NoteSpec {
                    record_id: record.id,
                    body: render_template(body, &snapshot),
                };
                let note_id = self.sink.add_note(&note).await?;
                Ok(ActionResult::success(Some(json!({ "note_id": note_id }))))
            }

            ActionKind::Notify {
                user_id,
                title,
                message,
                level,
            } => {
                let target = user_id.or(record.owner_id);
                if target.is_none() {
                    return Ok(ActionResult::failure("no notification recipient"));
                }
                let notification = NotificationSpec {
                    user_id: target,
                    title: render_template(title, &snapshot),
                    message: render_template(message, &snapshot),
                    level: level.clone(),
                };
                let id = self.sink.notify(&notification).await?;
                Ok(ActionResult::success(Some(json!({ "notification_id": id }))))
            }

            ActionKind::MoveStage { stage } => {
                let current = record
                    .stage
                    .as_ref()
                    .map(|s| json!(s))
                    .unwrap_or(Value::Null);
                self.records
                    .patch(
                        record.id,
                        &[FieldPatch::guarded("stage", json!(stage), current)],
                    )
                    .await?;
                self.audit
                    .record(AuditEvent::new(
                        "stage_moved",
                        &record.module,
                        record.id,
                        json!({ "from": record.stage, "to": stage }),
                    ))
                    .await;
                Ok(ActionResult::success(Some(json!({ "stage": stage }))))
            }

            ActionKind::StartCadence { cadence_id } => {
                match self.cadence.enroll(*cadence_id, record.id).await {
                    Ok(enrollment) => Ok(ActionResult::success(Some(json!({
                        "enrollment_id": enrollment.id
                    })))),
                    // Already actively enrolled: a no-op, not a failure.
                    Err(EngineError::Conflict(_)) => Ok(ActionResult::skipped()),
                    Err(e) => Err(e),
                }
            }

            ActionKind::StopCadence { cadence_id } => {
                let stopped = self
                    .cadence
                    .stop_for_record(record.id, *cadence_id)
                    .await?;
                Ok(ActionResult::success(Some(json!({ "stopped": stopped }))))
            }

            ActionKind::CreateEnrollmentDraft { program, fields } => {
                let draft = EnrollmentDraftSpec {
                    record_id: record.id,
                    program: program.clone(),
                    fields: fields.clone(),
                };
                let draft_id = self.sink.create_enrollment_draft(&draft).await?;
                Ok(ActionResult::success(Some(json!({ "draft_id": draft_id }))))
            }

            ActionKind::SendEmail { to, subject, body } => {
                let request = MessageRequest {
                    to: render_template(to, &snapshot),
                    subject: Some(render_template(subject, &snapshot)),
                    body: render_template(body, &snapshot),
                    metadata: json!({ "record_id": record.id }),
                };
                self.dispatch(MessageChannel::Email, &request).await
            }

            ActionKind::SendSms { to, message } => {
                let request = MessageRequest {
                    to: render_template(to, &snapshot),
                    subject: None,
                    body: render_template(message, &snapshot),
                    metadata: json!({ "record_id": record.id }),
                };
                self.dispatch(MessageChannel::Sms, &request).await
            }

            // Suspension is handled by the run loop; reaching the executor
            // means there was nothing to suspend.
            ActionKind::DelayWait { minutes } => Ok(ActionResult::success(Some(json!({
                "delayed_minutes": minutes
            })))),

            ActionKind::PostWebhook { url, payload } => {
                let url = render_template(url, &snapshot);
                let payload = render_payload(payload, &snapshot);
                let status = self.webhooks.post(&url, &payload).await?;
                if status >= 400 {
                    return Ok(ActionResult::failure(&format!(
                        "webhook returned status {}",
                        status
                    )));
                }
                Ok(ActionResult::success(Some(json!({ "status": status }))))
            }
        }
    }

    async fn dispatch(
        &self,
        channel: MessageChannel,
        request: &MessageRequest,
    ) -> EngineResult<ActionResult> {
        let timeout = StdDuration::from_secs(self.config.dispatch_timeout_secs);
        match tokio::time::timeout(timeout, self.dispatcher.dispatch_message(channel, request))
            .await
        {
            Ok(Ok(outcome)) if outcome.delivered => Ok(ActionResult::success(Some(json!({
                "provider_ref": outcome.provider_ref
            })))),
            Ok(Ok(outcome)) => Ok(ActionResult::failure(
                outcome.error.as_deref().unwrap_or("message not delivered"),
            )),
            Ok(Err(e)) => Ok(ActionResult::failure(&e.to_string())),
            Err(_) => Ok(ActionResult::failure("dispatch timed out")),
        }
    }
}

/// Substitutes `{{path}}` placeholders with values from the record
/// snapshot. Unresolved placeholders render as an empty string.
pub fn render_template(template: &str, snapshot: &Value) -> String {
    let Ok(pattern) = Regex::new(r"\{\{\s*([\w.]+)\s*\}\}") else {
        return template.to_string();
    };
    pattern
        .replace_all(template, |caps: &regex::Captures<'_>| {
            match crate::conditions::resolve_path(snapshot, &caps[1]) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            }
        })
        .into_owned()
}

/// Renders every string leaf of a JSON payload through the template
/// engine.
fn render_payload(payload: &Value, snapshot: &Value) -> Value {
    match payload {
        Value::String(s) => Value::String(render_template(s, snapshot)),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| render_payload(v, snapshot)).collect())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_payload(v, snapshot)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_template() {
        let snapshot = json!({
            "name": "Ada",
            "score": 72,
            "client": { "tier": "gold" }
        });

        assert_eq!(render_template("Hi {{name}}", &snapshot), "Hi Ada");
        assert_eq!(render_template("Tier: {{client.tier}}", &snapshot), "Tier: gold");
        assert_eq!(render_template("Score {{score}}", &snapshot), "Score 72");
        assert_eq!(render_template("{{ name }} spaced", &snapshot), "Ada spaced");
        assert_eq!(render_template("{{missing}}!", &snapshot), "!");
    }

    #[test]
    fn test_render_payload_walks_structure() {
        let snapshot = json!({ "email": "a@example.com" });
        let payload = json!({
            "contact": "{{email}}",
            "nested": { "items": ["{{email}}", 3] }
        });

        let rendered = render_payload(&payload, &snapshot);
        assert_eq!(rendered["contact"], json!("a@example.com"));
        assert_eq!(rendered["nested"]["items"][0], json!("a@example.com"));
        assert_eq!(rendered["nested"]["items"][1], json!(3));
    }
}
