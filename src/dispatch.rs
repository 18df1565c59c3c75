//! Narrow interfaces to the external collaborators the engine drives:
//! message dispatch, webhook delivery, task/activity/note creation, role
//! directory lookups and audit logging. Everything is trait-shaped so the
//! engine can be wired against real services or the in-memory
//! implementations used in tests and embedded setups.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

/// Outbound message channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageChannel {
    Email,
    Sms,
    InApp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRequest {
    pub to: String,
    pub subject: Option<String>,
    pub body: String,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchOutcome {
    pub delivered: bool,
    pub provider_ref: Option<String>,
    pub error: Option<String>,
}

impl DispatchOutcome {
    pub fn delivered(provider_ref: Option<String>) -> Self {
        Self {
            delivered: true,
            provider_ref,
            error: None,
        }
    }

    pub fn failed(error: &str) -> Self {
        Self {
            delivered: false,
            provider_ref: None,
            error: Some(error.to_string()),
        }
    }
}

/// Notification/email/SMS dispatch subsystem.
#[async_trait]
pub trait MessageDispatcher: Send + Sync {
    async fn dispatch_message(
        &self,
        channel: MessageChannel,
        request: &MessageRequest,
    ) -> EngineResult<DispatchOutcome>;
}

/// Webhook delivery.
#[async_trait]
pub trait WebhookPoster: Send + Sync {
    /// Posts the payload, returning the HTTP status code.
    async fn post(&self, url: &str, payload: &Value) -> EngineResult<u16>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub record_id: Uuid,
    pub title: String,
    pub due_at: Option<DateTime<Utc>>,
    pub assignee: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivitySpec {
    pub record_id: Uuid,
    pub kind: String,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoteSpec {
    pub record_id: Uuid,
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationSpec {
    pub user_id: Option<Uuid>,
    pub title: String,
    pub message: String,
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollmentDraftSpec {
    pub record_id: Uuid,
    pub program: String,
    #[serde(default)]
    pub fields: Value,
}

/// Creation of task/activity/note/notification/enrollment-draft documents
/// in the external store.
#[async_trait]
pub trait CollaborationSink: Send + Sync {
    async fn create_task(&self, task: &TaskSpec) -> EngineResult<Uuid>;
    async fn create_activity(&self, activity: &ActivitySpec) -> EngineResult<Uuid>;
    async fn add_note(&self, note: &NoteSpec) -> EngineResult<Uuid>;
    async fn notify(&self, notification: &NotificationSpec) -> EngineResult<Uuid>;
    async fn create_enrollment_draft(&self, draft: &EnrollmentDraftSpec) -> EngineResult<Uuid>;
}

/// Role membership lookup, used for approver resolution.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn users_in_role(&self, role: &str) -> EngineResult<Vec<Uuid>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub action: String,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub details: Value,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(action: &str, entity_type: &str, entity_id: Uuid, details: Value) -> Self {
        Self {
            action: action.to_string(),
            entity_type: entity_type.to_string(),
            entity_id,
            details,
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent);
}

/// Audit sink that forwards to structured logging.
#[derive(Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: AuditEvent) {
        info!(
            action = %event.action,
            entity_type = %event.entity_type,
            entity_id = %event.entity_id,
            "audit: {}",
            event.details
        );
    }
}

/// Webhook poster backed by `reqwest` with a short timeout. Timeouts and
/// connection failures surface as dispatch errors, which the executor
/// records as action failures.
pub struct HttpWebhookPoster {
    client: reqwest::Client,
}

impl HttpWebhookPoster {
    pub fn new(timeout: Duration) -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::dispatch("webhook", e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookPoster for HttpWebhookPoster {
    async fn post(&self, url: &str, payload: &Value) -> EngineResult<u16> {
        let response = self
            .client
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|e| EngineError::dispatch("webhook", e.to_string()))?;
        Ok(response.status().as_u16())
    }
}

/// In-memory collaborator implementations. Used as wiring defaults and by
/// tests that assert on captured side effects.
pub mod memory {
    use super::*;

    /// Records every dispatched message; can be flipped to fail for
    /// failure-path tests.
    #[derive(Default)]
    pub struct InMemoryDispatcher {
        pub sent: RwLock<Vec<(MessageChannel, MessageRequest)>>,
        pub fail: RwLock<bool>,
    }

    impl InMemoryDispatcher {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn set_failing(&self, fail: bool) {
            *self.fail.write().await = fail;
        }

        pub async fn sent_count(&self) -> usize {
            self.sent.read().await.len()
        }
    }

    #[async_trait]
    impl MessageDispatcher for InMemoryDispatcher {
        async fn dispatch_message(
            &self,
            channel: MessageChannel,
            request: &MessageRequest,
        ) -> EngineResult<DispatchOutcome> {
            if *self.fail.read().await {
                return Ok(DispatchOutcome::failed("dispatcher unavailable"));
            }
            self.sent.write().await.push((channel, request.clone()));
            Ok(DispatchOutcome::delivered(Some(Uuid::new_v4().to_string())))
        }
    }

    #[derive(Default)]
    pub struct InMemorySink {
        pub tasks: RwLock<Vec<TaskSpec>>,
        pub activities: RwLock<Vec<ActivitySpec>>,
        pub notes: RwLock<Vec<NoteSpec>>,
        pub notifications: RwLock<Vec<NotificationSpec>>,
        pub drafts: RwLock<Vec<EnrollmentDraftSpec>>,
    }

    impl InMemorySink {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn task_count(&self) -> usize {
            self.tasks.read().await.len()
        }
    }

    #[async_trait]
    impl CollaborationSink for InMemorySink {
        async fn create_task(&self, task: &TaskSpec) -> EngineResult<Uuid> {
            self.tasks.write().await.push(task.clone());
            Ok(Uuid::new_v4())
        }

        async fn create_activity(&self, activity: &ActivitySpec) -> EngineResult<Uuid> {
            self.activities.write().await.push(activity.clone());
            Ok(Uuid::new_v4())
        }

        async fn add_note(&self, note: &NoteSpec) -> EngineResult<Uuid> {
            self.notes.write().await.push(note.clone());
            Ok(Uuid::new_v4())
        }

        async fn notify(&self, notification: &NotificationSpec) -> EngineResult<Uuid> {
            self.notifications.write().await.push(notification.clone());
            Ok(Uuid::new_v4())
        }

        async fn create_enrollment_draft(&self, draft: &EnrollmentDraftSpec) -> EngineResult<Uuid> {
            self.drafts.write().await.push(draft.clone());
            Ok(Uuid::new_v4())
        }
    }

    /// Fixed role membership table.
    #[derive(Default)]
    pub struct InMemoryDirectory {
        roles: RwLock<HashMap<String, Vec<Uuid>>>,
    }

    impl InMemoryDirectory {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn set_role(&self, role: &str, users: Vec<Uuid>) {
            self.roles.write().await.insert(role.to_string(), users);
        }
    }

    #[async_trait]
    impl UserDirectory for InMemoryDirectory {
        async fn users_in_role(&self, role: &str) -> EngineResult<Vec<Uuid>> {
            Ok(self
                .roles
                .read()
                .await
                .get(role)
                .cloned()
                .unwrap_or_default())
        }
    }

    /// Webhook poster that records payloads instead of sending them.
    #[derive(Default)]
    pub struct InMemoryWebhookPoster {
        pub posts: RwLock<Vec<(String, Value)>>,
        pub status: RwLock<u16>,
    }

    impl InMemoryWebhookPoster {
        pub fn new() -> Self {
            Self {
                posts: RwLock::new(Vec::new()),
                status: RwLock::new(200),
            }
        }

        pub async fn set_status(&self, status: u16) {
            *self.status.write().await = status;
        }
    }

    #[async_trait]
    impl WebhookPoster for InMemoryWebhookPoster {
        async fn post(&self, url: &str, payload: &Value) -> EngineResult<u16> {
            self.posts.write().await.push((url.to_string(), payload.clone()));
            Ok(*self.status.read().await)
        }
    }
}

impl Default for MessageRequest {
    fn default() -> Self {
        Self {
            to: String::new(),
            subject: None,
            body: String::new(),
            metadata: json!({}),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::*;
    use super::*;

    #[tokio::test]
    async fn test_in_memory_dispatcher_records_and_fails() {
        let dispatcher = InMemoryDispatcher::new();
        let request = MessageRequest {
            to: "a@example.com".to_string(),
            subject: Some("hi".to_string()),
            body: "hello".to_string(),
            metadata: json!({}),
        };

        let outcome = dispatcher
            .dispatch_message(MessageChannel::Email, &request)
            .await
            .unwrap();
        assert!(outcome.delivered);
        assert_eq!(dispatcher.sent_count().await, 1);

        dispatcher.set_failing(true).await;
        let outcome = dispatcher
            .dispatch_message(MessageChannel::Sms, &request)
            .await
            .unwrap();
        assert!(!outcome.delivered);
    }

    #[tokio::test]
    async fn test_directory_lookup() {
        let directory = InMemoryDirectory::new();
        let user = Uuid::new_v4();
        directory.set_role("sales_manager", vec![user]).await;

        assert_eq!(directory.users_in_role("sales_manager").await.unwrap(), vec![user]);
        assert!(directory.users_in_role("unknown").await.unwrap().is_empty());
    }
}
