//! Record model and the record-store seam.
//!
//! The record/document store is an external collaborator; the engine only
//! reads records and patches individual field paths. `InMemoryRecordStore`
//! is the reference implementation used in tests and embedded deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::conditions::resolve_path;
use crate::error::{EngineError, EngineResult};

/// A single CRM record: a typed bag of fields plus the builtin
/// owner/stage slots the engine manipulates directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub id: Uuid,
    /// Entity type, e.g. "leads" or "deals".
    pub module: String,
    pub owner_id: Option<Uuid>,
    pub stage: Option<String>,
    /// Arbitrary field map (JSON object).
    pub fields: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Record {
    pub fn new(module: &str, fields: Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            module: module.to_string(),
            owner_id: None,
            stage: None,
            fields,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_stage(mut self, stage: &str) -> Self {
        self.stage = Some(stage.to_string());
        self
    }

    pub fn with_owner(mut self, owner_id: Uuid) -> Self {
        self.owner_id = Some(owner_id);
        self
    }

    /// JSON view of the record used for condition evaluation and templating:
    /// the field map with the builtin slots merged in.
    pub fn snapshot(&self) -> Value {
        let mut view = match &self.fields {
            Value::Object(map) => Value::Object(map.clone()),
            _ => json!({}),
        };
        if let Value::Object(map) = &mut view {
            map.insert("id".to_string(), json!(self.id.to_string()));
            map.insert("module".to_string(), json!(self.module));
            map.insert(
                "owner_id".to_string(),
                self.owner_id.map(|o| json!(o.to_string())).unwrap_or(Value::Null),
            );
            map.insert(
                "stage".to_string(),
                self.stage.as_ref().map(|s| json!(s)).unwrap_or(Value::Null),
            );
        }
        view
    }

    /// Resolves a dot-path against the snapshot view.
    pub fn field(&self, path: &str) -> Option<Value> {
        resolve_path(&self.snapshot(), path).cloned()
    }

    /// A record counts as open unless it is flagged closed or sits in a
    /// terminal stage. Feeds least-loaded assignment.
    pub fn is_open(&self) -> bool {
        if self.fields.get("closed").and_then(Value::as_bool) == Some(true) {
            return false;
        }
        match &self.stage {
            Some(stage) => !stage.starts_with("closed"),
            None => true,
        }
    }
}

/// One field write with an optional expected-previous guard.
///
/// `update_fields` and `move_stage` both go through this path so concurrent
/// writers cannot silently clobber each other.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldPatch {
    pub path: String,
    pub value: Value,
    /// When set, the patch only applies if the current value matches.
    #[serde(default)]
    pub expected_previous: Option<Value>,
}

impl FieldPatch {
    pub fn set(path: &str, value: Value) -> Self {
        Self {
            path: path.to_string(),
            value,
            expected_previous: None,
        }
    }

    pub fn guarded(path: &str, value: Value, expected_previous: Value) -> Self {
        Self {
            path: path.to_string(),
            value,
            expected_previous: Some(expected_previous),
        }
    }
}

/// Narrow interface to the external record store.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, id: Uuid) -> EngineResult<Record>;

    async fn insert(&self, record: Record) -> EngineResult<()>;

    /// Applies all patches atomically; fails with `Conflict` if any
    /// expected-previous guard does not hold.
    async fn patch(&self, id: Uuid, patches: &[FieldPatch]) -> EngineResult<Record>;

    /// Number of open records in `module` owned by `owner_id`.
    async fn count_open(&self, module: &str, owner_id: Uuid) -> EngineResult<i64>;
}

/// In-memory record store. Patches run under a single write guard; a
/// SQL-backed implementation must use conditional updates instead.
#[derive(Default)]
pub struct InMemoryRecordStore {
    records: RwLock<HashMap<Uuid, Record>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn get(&self, id: Uuid) -> EngineResult<Record> {
        self.records
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(EngineError::RecordNotFound(id))
    }

    async fn insert(&self, record: Record) -> EngineResult<()> {
        self.records.write().await.insert(record.id, record);
        Ok(())
    }

    async fn patch(&self, id: Uuid, patches: &[FieldPatch]) -> EngineResult<Record> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&id)
            .ok_or(EngineError::RecordNotFound(id))?;

        // Validate every guard before writing anything.
        for patch in patches {
            if let Some(expected) = &patch.expected_previous {
                let current = current_value(record, &patch.path);
                if current.as_ref() != Some(expected) && !(current.is_none() && expected.is_null())
                {
                    return Err(EngineError::Conflict(format!(
                        "field '{}' changed since read (expected {}, found {})",
                        patch.path,
                        expected,
                        current.unwrap_or(Value::Null)
                    )));
                }
            }
        }

        for patch in patches {
            apply_value(record, &patch.path, patch.value.clone());
        }
        record.updated_at = Utc::now();

        Ok(record.clone())
    }

    async fn count_open(&self, module: &str, owner_id: Uuid) -> EngineResult<i64> {
        let records = self.records.read().await;
        let count = records
            .values()
            .filter(|r| r.module == module && r.owner_id == Some(owner_id) && r.is_open())
            .count();
        Ok(count as i64)
    }
}

fn current_value(record: &Record, path: &str) -> Option<Value> {
    match path {
        "owner_id" => Some(
            record
                .owner_id
                .map(|o| json!(o.to_string()))
                .unwrap_or(Value::Null),
        ),
        "stage" => Some(
            record
                .stage
                .as_ref()
                .map(|s| json!(s))
                .unwrap_or(Value::Null),
        ),
        _ => resolve_path(&record.fields, path).cloned(),
    }
}

fn apply_value(record: &mut Record, path: &str, value: Value) {
    match path {
        "owner_id" => {
            record.owner_id = value.as_str().and_then(|s| s.parse().ok());
        }
        "stage" => {
            record.stage = value.as_str().map(|s| s.to_string());
        }
        _ => set_path(&mut record.fields, path, value),
    }
}

/// Sets a dot-path inside a JSON object, creating intermediate objects.
fn set_path(target: &mut Value, path: &str, value: Value) {
    if !target.is_object() {
        *target = json!({});
    }
    let mut current = target;
    let parts: Vec<&str> = path.split('.').collect();
    for (i, part) in parts.iter().enumerate() {
        let map = current.as_object_mut().expect("object ensured above");
        if i == parts.len() - 1 {
            map.insert(part.to_string(), value);
            return;
        }
        let entry = map
            .entry(part.to_string())
            .or_insert_with(|| json!({}));
        if !entry.is_object() {
            *entry = json!({});
        }
        current = entry;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_patch_with_guard() {
        let store = InMemoryRecordStore::new();
        let record = Record::new("leads", json!({"status": "cold"}));
        let id = record.id;
        store.insert(record).await.unwrap();

        let updated = store
            .patch(
                id,
                &[FieldPatch::guarded("status", json!("hot"), json!("cold"))],
            )
            .await
            .unwrap();
        assert_eq!(updated.fields["status"], json!("hot"));

        // Stale guard now fails.
        let err = store
            .patch(
                id,
                &[FieldPatch::guarded("status", json!("warm"), json!("cold"))],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_patch_builtin_paths() {
        let store = InMemoryRecordStore::new();
        let record = Record::new("deals", json!({})).with_stage("qualified");
        let id = record.id;
        store.insert(record).await.unwrap();

        let owner = Uuid::new_v4();
        let updated = store
            .patch(
                id,
                &[
                    FieldPatch::set("owner_id", json!(owner.to_string())),
                    FieldPatch::guarded("stage", json!("closed_won"), json!("qualified")),
                ],
            )
            .await
            .unwrap();

        assert_eq!(updated.owner_id, Some(owner));
        assert_eq!(updated.stage.as_deref(), Some("closed_won"));
    }

    #[tokio::test]
    async fn test_count_open() {
        let store = InMemoryRecordStore::new();
        let owner = Uuid::new_v4();

        store
            .insert(Record::new("leads", json!({})).with_owner(owner))
            .await
            .unwrap();
        store
            .insert(
                Record::new("leads", json!({}))
                    .with_owner(owner)
                    .with_stage("closed_lost"),
            )
            .await
            .unwrap();

        assert_eq!(store.count_open("leads", owner).await.unwrap(), 1);
        assert_eq!(store.count_open("deals", owner).await.unwrap(), 0);
    }

    #[test]
    fn test_nested_set_path() {
        let mut record = Record::new("leads", json!({}));
        set_path(&mut record.fields, "address.city", json!("Oslo"));
        assert_eq!(record.fields["address"]["city"], json!("Oslo"));
    }

    #[test]
    fn test_snapshot_includes_builtins() {
        let record = Record::new("leads", json!({"status": "hot"})).with_stage("new");
        let snapshot = record.snapshot();
        assert_eq!(snapshot["status"], json!("hot"));
        assert_eq!(snapshot["stage"], json!("new"));
        assert_eq!(snapshot["module"], json!("leads"));
    }
}
