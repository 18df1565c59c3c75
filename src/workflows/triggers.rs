//! Trigger types and the record-mutation events that feed the workflow
//! engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::records::Record;

/// Event classes a workflow can be wired to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    OnCreate,
    OnUpdate,
    /// Fires only when a field referenced by the workflow's conditions
    /// actually changed between the previous and new state.
    OnUpdateFieldChanged,
    Scheduled,
    Manual,
}

/// Where an event originated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventSource {
    System,
    User(Uuid),
    Api,
    Scheduler,
    Integration(String),
}

/// A record mutation event. Carries the new record and, for updates, a
/// snapshot of the previous state for changed-field checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordEvent {
    pub event_id: Uuid,
    pub trigger_type: TriggerType,
    pub record: Record,
    pub previous: Option<Value>,
    pub source: EventSource,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Option<Uuid>,
}

impl RecordEvent {
    pub fn new(trigger_type: TriggerType, record: Record, source: EventSource) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            trigger_type,
            record,
            previous: None,
            source,
            timestamp: Utc::now(),
            correlation_id: None,
        }
    }

    pub fn record_created(record: Record, source: EventSource) -> Self {
        Self::new(TriggerType::OnCreate, record, source)
    }

    pub fn record_updated(record: Record, previous: Value, source: EventSource) -> Self {
        let mut event = Self::new(TriggerType::OnUpdate, record, source);
        event.previous = Some(previous);
        event
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_update_event_carries_previous_state() {
        let record = Record::new("leads", json!({"status": "hot_lead"}));
        let previous = json!({"status": "cold"});

        let event = RecordEvent::record_updated(record, previous.clone(), EventSource::System);
        assert_eq!(event.trigger_type, TriggerType::OnUpdate);
        assert_eq!(event.previous, Some(previous));
    }

    #[test]
    fn test_trigger_type_serde() {
        let value = serde_json::to_value(TriggerType::OnUpdateFieldChanged).unwrap();
        assert_eq!(value, json!("on_update_field_changed"));
    }
}
