//! Owner assignment engine.
//!
//! Resolution never errors: a rule that cannot produce an owner (empty
//! candidate list, store failure during load lookup, no matching territory
//! and no default) degrades to a no-owner decision with a reason, and the
//! caller decides what a no-op assignment means.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use crate::conditions::{evaluate, ConditionGroup};
use crate::records::{Record, RecordStore};

/// A territory row: the first territory whose conditions match wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Territory {
    pub owner_id: Uuid,
    pub conditions: ConditionGroup,
}

/// How a rule picks an owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum AssignmentStrategy {
    /// Rotates through candidates; the cursor advances atomically with the
    /// pick so concurrent assigns never hand out the same slot.
    RoundRobin { candidates: Vec<Uuid> },
    /// Candidate with the fewest open records in the rule's module.
    /// Ties break toward the earlier candidate in the list.
    LeastLoaded { candidates: Vec<Uuid> },
    /// First matching territory wins; falls back to `default_owner`.
    Territory {
        territories: Vec<Territory>,
        #[serde(default)]
        default_owner: Option<Uuid>,
    },
    Fixed { owner_id: Uuid },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentRule {
    pub id: Uuid,
    pub name: String,
    #[serde(flatten)]
    pub strategy: AssignmentStrategy,
}

impl AssignmentRule {
    pub fn new(name: &str, strategy: AssignmentStrategy) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            strategy,
        }
    }

    pub fn round_robin(name: &str, candidates: Vec<Uuid>) -> Self {
        Self::new(name, AssignmentStrategy::RoundRobin { candidates })
    }

    pub fn least_loaded(name: &str, candidates: Vec<Uuid>) -> Self {
        Self::new(name, AssignmentStrategy::LeastLoaded { candidates })
    }

    pub fn fixed(name: &str, owner_id: Uuid) -> Self {
        Self::new(name, AssignmentStrategy::Fixed { owner_id })
    }
}

/// Outcome of resolving a rule against a record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentDecision {
    pub owner_id: Option<Uuid>,
    pub reason: String,
}

impl AssignmentDecision {
    fn assigned(owner_id: Uuid, reason: impl Into<String>) -> Self {
        Self {
            owner_id: Some(owner_id),
            reason: reason.into(),
        }
    }

    fn unassigned(reason: impl Into<String>) -> Self {
        Self {
            owner_id: None,
            reason: reason.into(),
        }
    }
}

/// Persistent round-robin cursor per rule. `assign_next` must advance the
/// cursor in the same atomic step that picks the slot.
#[async_trait]
pub trait RotationStore: Send + Sync {
    /// Picks the next slot for `rule_id` over `candidate_count` candidates
    /// and advances the cursor, atomically. `candidate_count` must be
    /// non-zero; the engine rejects empty candidate lists before calling.
    async fn assign_next(&self, rule_id: Uuid, candidate_count: usize) -> usize;

    async fn cursor(&self, rule_id: Uuid) -> u64;
}

#[derive(Default)]
pub struct InMemoryRotationStore {
    cursors: RwLock<HashMap<Uuid, u64>>,
}

impl InMemoryRotationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RotationStore for InMemoryRotationStore {
    async fn assign_next(&self, rule_id: Uuid, candidate_count: usize) -> usize {
        let mut cursors = self.cursors.write().await;
        let cursor = cursors.entry(rule_id).or_insert(0);
        let slot = (*cursor % candidate_count as u64) as usize;
        *cursor += 1;
        slot
    }

    async fn cursor(&self, rule_id: Uuid) -> u64 {
        self.cursors.read().await.get(&rule_id).copied().unwrap_or(0)
    }
}

pub struct AssignmentEngine {
    rotation: Arc<dyn RotationStore>,
    records: Arc<dyn RecordStore>,
}

impl AssignmentEngine {
    pub fn new(rotation: Arc<dyn RotationStore>, records: Arc<dyn RecordStore>) -> Self {
        Self { rotation, records }
    }

    /// Resolves `rule` to an owner for `record`.
    pub async fn resolve(&self, rule: &AssignmentRule, record: &Record) -> AssignmentDecision {
        match &rule.strategy {
            AssignmentStrategy::Fixed { owner_id } => {
                AssignmentDecision::assigned(*owner_id, "fixed owner")
            }
            AssignmentStrategy::RoundRobin { candidates } => {
                if candidates.is_empty() {
                    warn!(rule = %rule.name, "round-robin rule has no candidates");
                    return AssignmentDecision::unassigned("no candidates configured");
                }
                let slot = self.rotation.assign_next(rule.id, candidates.len()).await;
                AssignmentDecision::assigned(
                    candidates[slot],
                    format!("round-robin slot {}", slot),
                )
            }
            AssignmentStrategy::LeastLoaded { candidates } => {
                self.resolve_least_loaded(rule, candidates, record).await
            }
            AssignmentStrategy::Territory {
                territories,
                default_owner,
            } => {
                let snapshot = record.snapshot();
                for territory in territories {
                    if evaluate(&territory.conditions, &snapshot) {
                        return AssignmentDecision::assigned(
                            territory.owner_id,
                            "territory match",
                        );
                    }
                }
                match default_owner {
                    Some(owner_id) => {
                        AssignmentDecision::assigned(*owner_id, "territory default owner")
                    }
                    None => AssignmentDecision::unassigned("no territory matched"),
                }
            }
        }
    }

    async fn resolve_least_loaded(
        &self,
        rule: &AssignmentRule,
        candidates: &[Uuid],
        record: &Record,
    ) -> AssignmentDecision {
        if candidates.is_empty() {
            warn!(rule = %rule.name, "least-loaded rule has no candidates");
            return AssignmentDecision::unassigned("no candidates configured");
        }

        let mut best: Option<(Uuid, i64)> = None;
        for candidate in candidates {
            let load = match self.records.count_open(&record.module, *candidate).await {
                Ok(load) => load,
                Err(e) => {
                    warn!(rule = %rule.name, candidate = %candidate, error = %e, "load lookup failed");
                    return AssignmentDecision::unassigned("load lookup failed");
                }
            };
            // Strict < keeps ties on the earlier candidate.
            if best.map(|(_, b)| load < b).unwrap_or(true) {
                best = Some((*candidate, load));
            }
        }

        match best {
            Some((owner_id, load)) => {
                AssignmentDecision::assigned(owner_id, format!("least loaded ({} open)", load))
            }
            None => AssignmentDecision::unassigned("no candidates configured"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::Condition;
    use crate::records::InMemoryRecordStore;
    use serde_json::json;

    fn engine_with_store(store: Arc<InMemoryRecordStore>) -> AssignmentEngine {
        AssignmentEngine::new(Arc::new(InMemoryRotationStore::new()), store)
    }

    #[tokio::test]
    async fn test_round_robin_rotates_and_persists_cursor() {
        let rotation = Arc::new(InMemoryRotationStore::new());
        let engine = AssignmentEngine::new(rotation.clone(), Arc::new(InMemoryRecordStore::new()));
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let rule = AssignmentRule::round_robin("sdr rotation", vec![a, b, c]);
        let record = Record::new("leads", json!({}));

        let mut picks = Vec::new();
        for _ in 0..4 {
            picks.push(engine.resolve(&rule, &record).await.owner_id.unwrap());
        }
        assert_eq!(picks, vec![a, b, c, a]);
        // The cursor advanced once per pick.
        assert_eq!(rotation.cursor(rule.id).await, 4);
    }

    #[tokio::test]
    async fn test_round_robin_empty_candidates_degrades() {
        let engine = engine_with_store(Arc::new(InMemoryRecordStore::new()));
        let rule = AssignmentRule::round_robin("empty", vec![]);
        let record = Record::new("leads", json!({}));

        let decision = engine.resolve(&rule, &record).await;
        assert!(decision.owner_id.is_none());
    }

    #[tokio::test]
    async fn test_least_loaded_prefers_lighter_owner() {
        let store = Arc::new(InMemoryRecordStore::new());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        for _ in 0..3 {
            store
                .insert(Record::new("leads", json!({})).with_owner(a))
                .await
                .unwrap();
        }
        store
            .insert(Record::new("leads", json!({})).with_owner(b))
            .await
            .unwrap();

        let engine = engine_with_store(store);
        let rule = AssignmentRule::least_loaded("by load", vec![a, b]);
        let record = Record::new("leads", json!({}));

        let decision = engine.resolve(&rule, &record).await;
        assert_eq!(decision.owner_id, Some(b));
    }

    #[tokio::test]
    async fn test_least_loaded_tie_breaks_on_order() {
        let engine = engine_with_store(Arc::new(InMemoryRecordStore::new()));
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let rule = AssignmentRule::least_loaded("tie", vec![a, b]);
        let record = Record::new("leads", json!({}));

        let decision = engine.resolve(&rule, &record).await;
        assert_eq!(decision.owner_id, Some(a));
    }

    #[tokio::test]
    async fn test_territory_first_match_then_default() {
        let engine = engine_with_store(Arc::new(InMemoryRecordStore::new()));
        let (north, south, fallback) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let rule = AssignmentRule::new(
            "regions",
            AssignmentStrategy::Territory {
                territories: vec![
                    Territory {
                        owner_id: north,
                        conditions: ConditionGroup::single(Condition::eq("region", json!("north"))),
                    },
                    Territory {
                        owner_id: south,
                        conditions: ConditionGroup::single(Condition::eq("region", json!("south"))),
                    },
                ],
                default_owner: Some(fallback),
            },
        );

        let record = Record::new("leads", json!({"region": "south"}));
        assert_eq!(engine.resolve(&rule, &record).await.owner_id, Some(south));

        let record = Record::new("leads", json!({"region": "west"}));
        assert_eq!(engine.resolve(&rule, &record).await.owner_id, Some(fallback));
    }

    #[test]
    fn test_strategy_serde_shape() {
        let rule = AssignmentRule::fixed("owner", Uuid::new_v4());
        let value = serde_json::to_value(&rule).unwrap();
        assert_eq!(value["strategy"], json!("fixed"));
    }
}
