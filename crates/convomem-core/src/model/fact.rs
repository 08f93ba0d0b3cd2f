//! Fact - a key/value nugget extracted from conversation, held in T2.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, Result};

/// Category of an extracted entity or fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Person,
    Place,
    Technology,
    Decision,
    Preference,
    Constraint,
    Goal,
    Other,
}

/// A key/value fact promoted into T2 from extracted entities.
///
/// `access_count` starts at 1 (the creating access counts) and is
/// monotonically non-decreasing; `last_accessed` only moves forward.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fact {
    pub id: String,
    pub user_id: String,
    pub conversation_id: String,
    pub key: String,
    pub value: String,
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub importance: f32,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl Fact {
    /// Build a new fact from an extracted entity. `importance` must be in
    /// `[0, 1]`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: impl Into<String>,
        conversation_id: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
        entity_type: EntityType,
        importance: f32,
        embedding: Option<Vec<f32>>,
    ) -> Result<Self> {
        if !(0.0..=1.0).contains(&importance) {
            return Err(EngineError::Input(format!(
                "fact importance {importance} outside [0,1]"
            )));
        }
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            conversation_id: conversation_id.into(),
            key: key.into(),
            value: value.into(),
            entity_type,
            importance,
            created_at: now,
            last_accessed: now,
            access_count: 1,
            embedding,
        })
    }

    /// Record a read access: bumps `access_count` and refreshes
    /// `last_accessed`. Monotonic - never decreases the counter or moves
    /// the timestamp backward.
    pub fn record_access(&mut self) {
        self.access_count = self.access_count.saturating_add(1);
        self.last_accessed = Utc::now();
    }

    /// Eviction predicate from the fact-store contract: a fact is prunable
    /// once it has been accessed fewer than `min_access` times *and* has
    /// gone untouched for longer than `ttl`.
    pub fn is_prunable(&self, min_access: u32, ttl: chrono::Duration, now: DateTime<Utc>) -> bool {
        self.access_count < min_access && (now - self.last_accessed) > ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_importance() {
        assert!(Fact::new("u", "c", "k", "v", EntityType::Other, 1.5, None).is_err());
        assert!(Fact::new("u", "c", "k", "v", EntityType::Other, -0.1, None).is_err());
    }

    #[test]
    fn record_access_is_monotonic() {
        let mut fact = Fact::new("u", "c", "k", "v", EntityType::Other, 0.5, None).unwrap();
        assert_eq!(fact.access_count, 1);
        let first_access = fact.last_accessed;
        fact.record_access();
        assert_eq!(fact.access_count, 2);
        assert!(fact.last_accessed >= first_access);
    }

    #[test]
    fn prune_predicate_requires_both_conditions() {
        let mut fact = Fact::new("u", "c", "k", "v", EntityType::Other, 0.2, None).unwrap();
        fact.last_accessed = Utc::now() - chrono::Duration::days(10);
        // Low access count + stale -> prunable
        assert!(fact.is_prunable(3, chrono::Duration::days(1), Utc::now()));
        // High access count -> never prunable regardless of age
        fact.access_count = 10;
        assert!(!fact.is_prunable(3, chrono::Duration::days(1), Utc::now()));
    }
}
