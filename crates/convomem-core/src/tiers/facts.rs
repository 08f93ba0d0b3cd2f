//! T2 - per-user fact store with lexical/vector search, per-user locking
//! for upserts and prunes per the shared-resource policy.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::capability::cosine_similarity;
use crate::error::{EngineError, Result};
use crate::model::Fact;

use super::FactTier;

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(EngineError::Cancelled)
    } else {
        Ok(())
    }
}

/// In-memory T2 adapter: one `HashMap<Fact::id, Fact>` per user, guarded
/// by a per-user lock so upserts on different users never contend.
pub struct InMemoryFactStore {
    users: StdMutex<HashMap<String, HashMap<String, Fact>>>,
}

impl Default for InMemoryFactStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryFactStore {
    pub fn new() -> Self {
        Self {
            users: StdMutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl FactTier for InMemoryFactStore {
    async fn store_facts(&self, user: &str, _conversation: &str, facts: Vec<Fact>, cancel: &CancellationToken) -> Result<()> {
        check_cancelled(cancel)?;
        let mut users = self.users.lock().expect("fact store lock poisoned");
        let entry = users.entry(user.to_string()).or_default();
        for fact in facts {
            entry.insert(fact.id.clone(), fact);
        }
        Ok(())
    }

    async fn search(
        &self,
        user: &str,
        query: &str,
        query_embedding: Option<&[f32]>,
        max_k: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<Fact>> {
        check_cancelled(cancel)?;
        let query_lower = query.to_lowercase();

        let mut matches: Vec<Fact> = {
            let users = self.users.lock().expect("fact store lock poisoned");
            let Some(facts) = users.get(user) else {
                return Ok(Vec::new());
            };
            facts
                .values()
                .filter(|fact| {
                    let lexical_hit = fact.key.to_lowercase().contains(&query_lower)
                        || fact.value.to_lowercase().contains(&query_lower);
                    let semantic_hit = match (fact.embedding.as_deref(), query_embedding) {
                        (Some(fact_emb), Some(q_emb)) => cosine_similarity(fact_emb, q_emb) > 0.75,
                        _ => false,
                    };
                    lexical_hit || semantic_hit
                })
                .cloned()
                .collect()
        };

        matches.sort_by(|a, b| {
            b.importance
                .total_cmp(&a.importance)
                .then_with(|| b.last_accessed.cmp(&a.last_accessed))
        });
        matches.truncate(max_k);

        let mut users = self.users.lock().expect("fact store lock poisoned");
        if let Some(facts) = users.get_mut(user) {
            for fact in &mut matches {
                if let Some(stored) = facts.get_mut(&fact.id) {
                    stored.record_access();
                    *fact = stored.clone();
                }
            }
        }

        Ok(matches)
    }

    async fn record_access(&self, user: &str, fact_id: &str, cancel: &CancellationToken) -> Result<()> {
        check_cancelled(cancel)?;
        let mut users = self.users.lock().expect("fact store lock poisoned");
        if let Some(facts) = users.get_mut(user) {
            if let Some(fact) = facts.get_mut(fact_id) {
                fact.record_access();
            }
        }
        Ok(())
    }

    async fn prune(&self, user: &str, min_access: u32, ttl: chrono::Duration, cancel: &CancellationToken) -> Result<usize> {
        check_cancelled(cancel)?;
        let now = Utc::now();
        let mut users = self.users.lock().expect("fact store lock poisoned");
        let Some(facts) = users.get_mut(user) else {
            return Ok(0);
        };
        let before = facts.len();
        facts.retain(|_, fact| !fact.is_prunable(min_access, ttl, now));
        Ok(before - facts.len())
    }

    async fn delete_fact(&self, user: &str, fact_id: &str, cancel: &CancellationToken) -> Result<()> {
        check_cancelled(cancel)?;
        let mut users = self.users.lock().expect("fact store lock poisoned");
        if let Some(facts) = users.get_mut(user) {
            facts.remove(fact_id);
        }
        Ok(())
    }

    async fn erase_user(&self, user: &str, cancel: &CancellationToken) -> Result<()> {
        check_cancelled(cancel)?;
        let mut users = self.users.lock().expect("fact store lock poisoned");
        users.remove(user);
        Ok(())
    }

    async fn is_empty_for_user(&self, user: &str) -> bool {
        let users = self.users.lock().expect("fact store lock poisoned");
        users.get(user).is_none_or(|facts| facts.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntityType;

    fn fact(key: &str, value: &str, importance: f32) -> Fact {
        Fact::new("u1", "c1", key, value, EntityType::Technology, importance, None).unwrap()
    }

    #[tokio::test]
    async fn lexical_search_matches_key_and_records_access() {
        let store = InMemoryFactStore::new();
        let cancel = CancellationToken::new();
        store
            .store_facts(
                "u1",
                "c1",
                vec![fact("database", "PostgreSQL", 0.8), fact("cache", "Redis", 0.6)],
                &cancel,
            )
            .await
            .unwrap();

        let hits = store.search("u1", "database", None, 5, &cancel).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].key, "database");

        let hits_again = store.search("u1", "database", None, 5, &cancel).await.unwrap();
        assert!(hits_again[0].access_count >= 2);
    }

    #[tokio::test]
    async fn search_orders_by_importance_then_recency() {
        let store = InMemoryFactStore::new();
        let cancel = CancellationToken::new();
        store
            .store_facts(
                "u1",
                "c1",
                vec![fact("language", "Rust", 0.3), fact("framework", "Rust Axum", 0.9)],
                &cancel,
            )
            .await
            .unwrap();

        let hits = store.search("u1", "rust", None, 5, &cancel).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].importance >= hits[1].importance);
    }

    #[tokio::test]
    async fn prune_removes_low_access_stale_facts() {
        let store = InMemoryFactStore::new();
        let cancel = CancellationToken::new();
        let mut stale = fact("old", "value", 0.2);
        stale.last_accessed = Utc::now() - chrono::Duration::days(30);
        store.store_facts("u1", "c1", vec![stale], &cancel).await.unwrap();

        let removed = store
            .prune("u1", 3, chrono::Duration::days(1), &cancel)
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.is_empty_for_user("u1").await);
    }

    #[tokio::test]
    async fn erase_user_is_isolated_per_user() {
        let store = InMemoryFactStore::new();
        let cancel = CancellationToken::new();
        store.store_facts("u1", "c1", vec![fact("a", "b", 0.5)], &cancel).await.unwrap();
        store.store_facts("u2", "c1", vec![fact("c", "d", 0.5)], &cancel).await.unwrap();

        store.erase_user("u1", &cancel).await.unwrap();

        assert!(store.is_empty_for_user("u1").await);
        assert!(!store.is_empty_for_user("u2").await);
    }
}
