//! TP - per-user learned patterns. Per-user locking for the pattern list,
//! with a pattern-local lock for `RecordUsage` so concurrent matches on
//! different patterns never contend and `RecordUsage` itself stays atomic
//! under concurrent callers.
//!
//! The match path never holds the user lock across an embedding call:
//! callers precompute `query_embedding` before invoking [`PatternTier`],
//! so this adapter only ever does cheap, synchronous work under its locks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result};
use crate::model::{Pattern, PatternState, TriggerKind};

use super::PatternTier;

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(EngineError::Cancelled)
    } else {
        Ok(())
    }
}

type PatternHandle = Arc<StdMutex<Pattern>>;

/// In-memory TP adapter, keyed per user by normalized pattern name so
/// `upsert` is idempotent on `(user, name)` per the tier contract.
pub struct InMemoryPatternStore {
    users: StdMutex<HashMap<String, HashMap<String, PatternHandle>>>,
}

impl Default for InMemoryPatternStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryPatternStore {
    pub fn new() -> Self {
        Self {
            users: StdMutex::new(HashMap::new()),
        }
    }

    fn snapshot(&self, user: &str) -> Vec<PatternHandle> {
        let users = self.users.lock().expect("pattern store lock poisoned");
        users
            .get(user)
            .map(|patterns| patterns.values().cloned().collect())
            .unwrap_or_default()
    }
}

fn compile_regexes(pattern: &Pattern) -> Vec<(usize, regex::Regex)> {
    pattern
        .triggers
        .iter()
        .enumerate()
        .filter(|(_, t)| t.kind == TriggerKind::Regex)
        .filter_map(|(idx, t)| regex::Regex::new(&t.pattern).ok().map(|re| (idx, re)))
        .collect()
}

#[async_trait]
impl PatternTier for InMemoryPatternStore {
    async fn match_query(
        &self,
        user: &str,
        query: &str,
        query_embedding: Option<&[f32]>,
        cancel: &CancellationToken,
    ) -> Result<Option<Pattern>> {
        check_cancelled(cancel)?;

        let candidates = self.snapshot(user);
        let query_lower = query.to_lowercase();

        let mut best: Option<(f32, PatternHandle)> = None;
        for handle in candidates {
            let scored = {
                let pattern = handle.lock().expect("pattern lock poisoned");
                if !pattern.state.is_matchable() {
                    None
                } else {
                    let regexes = compile_regexes(&pattern);
                    let regex_refs: Vec<(usize, &regex::Regex)> = regexes.iter().map(|(i, re)| (*i, re)).collect();
                    let score = pattern.score(query, &query_lower, &regex_refs, query_embedding);
                    Some((score, pattern.confidence_threshold))
                }
            };
            let Some((score, threshold)) = scored else {
                continue;
            };
            if score < threshold {
                continue;
            }
            if best.as_ref().is_none_or(|(best_score, _)| score > *best_score) {
                best = Some((score, handle));
            }
        }

        match best {
            Some((_, handle)) => {
                let mut pattern = handle.lock().expect("pattern lock poisoned");
                pattern.record_usage();
                Ok(Some(pattern.clone()))
            }
            None => Ok(None),
        }
    }

    async fn upsert(&self, pattern: Pattern, cancel: &CancellationToken) -> Result<()> {
        check_cancelled(cancel)?;
        let mut users = self.users.lock().expect("pattern store lock poisoned");
        let entry = users.entry(pattern.user_id.clone()).or_default();
        let key = pattern.normalized_name();
        match entry.get(&key) {
            Some(existing) => {
                let mut existing = existing.lock().expect("pattern lock poisoned");
                existing.triggers = pattern.triggers;
                existing.description = pattern.description;
                existing.instruction_template = pattern.instruction_template;
                existing.updated_at = pattern.updated_at;
            }
            None => {
                entry.insert(key, Arc::new(StdMutex::new(pattern)));
            }
        }
        Ok(())
    }

    async fn consolidate(&self, user: &str, cancel: &CancellationToken) -> Result<usize> {
        check_cancelled(cancel)?;
        const JACCARD_MERGE_THRESHOLD: f64 = 0.70;

        let handles = self.snapshot(user);
        let mut merges = 0usize;

        for i in 0..handles.len() {
            for j in (i + 1)..handles.len() {
                let (should_merge, loser_idx, winner_idx) = {
                    let a = handles[i].lock().expect("pattern lock poisoned");
                    let b = handles[j].lock().expect("pattern lock poisoned");
                    if !a.state.is_matchable() || !b.state.is_matchable() {
                        (false, i, j)
                    } else {
                        let same_name = a.normalized_name() == b.normalized_name();
                        let set_a = a.trigger_pattern_set();
                        let set_b = b.trigger_pattern_set();
                        let intersection = set_a.intersection(&set_b).count();
                        let union = set_a.union(&set_b).count().max(1);
                        let jaccard = intersection as f64 / union as f64;
                        let duplicate = same_name || jaccard >= JACCARD_MERGE_THRESHOLD;
                        if duplicate {
                            if a.usage_count >= b.usage_count {
                                (true, j, i)
                            } else {
                                (true, i, j)
                            }
                        } else {
                            (false, i, j)
                        }
                    }
                };

                if should_merge {
                    let loser_usage = {
                        let loser = handles[loser_idx].lock().expect("pattern lock poisoned");
                        loser.usage_count
                    };
                    {
                        let mut winner = handles[winner_idx].lock().expect("pattern lock poisoned");
                        winner.usage_count = winner.usage_count.saturating_add(loser_usage);
                    }
                    {
                        let mut loser = handles[loser_idx].lock().expect("pattern lock poisoned");
                        loser.state = PatternState::Merged;
                    }
                    merges += 1;
                }
            }
        }

        Ok(merges)
    }

    async fn erase_user(&self, user: &str, cancel: &CancellationToken) -> Result<()> {
        check_cancelled(cancel)?;
        let mut users = self.users.lock().expect("pattern store lock poisoned");
        users.remove(user);
        Ok(())
    }

    async fn is_empty_for_user(&self, user: &str) -> bool {
        let users = self.users.lock().expect("pattern store lock poisoned");
        users.get(user).is_none_or(|patterns| patterns.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Trigger;

    fn retry_pattern() -> Pattern {
        Pattern::new(
            "u1",
            "retry-handling",
            "user asks about retries",
            vec![Trigger::keyword("retry")],
            "Explain the retry/backoff policy.",
            0.80,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn match_returns_highest_scoring_pattern_above_threshold() {
        let store = InMemoryPatternStore::new();
        let cancel = CancellationToken::new();
        store.upsert(retry_pattern(), &cancel).await.unwrap();

        let matched = store
            .match_query("u1", "how do we handle retries?", None, &cancel)
            .await
            .unwrap();
        assert!(matched.is_some());
        assert_eq!(matched.unwrap().usage_count, 1);
    }

    #[tokio::test]
    async fn match_returns_none_below_threshold() {
        let store = InMemoryPatternStore::new();
        let cancel = CancellationToken::new();
        store.upsert(retry_pattern(), &cancel).await.unwrap();

        let matched = store.match_query("u1", "what's for lunch?", None, &cancel).await.unwrap();
        assert!(matched.is_none());
    }

    #[tokio::test]
    async fn reinforcement_reaches_threshold_after_eleven_matches() {
        let store = InMemoryPatternStore::new();
        let cancel = CancellationToken::new();
        store.upsert(retry_pattern(), &cancel).await.unwrap();

        let mut last = None;
        for _ in 0..11 {
            last = store.match_query("u1", "tell me about retry", None, &cancel).await.unwrap();
        }
        let pattern = last.unwrap();
        assert_eq!(pattern.usage_count, 11);
        assert!((pattern.confidence_threshold - 0.75).abs() < 1e-6);
    }

    #[tokio::test]
    async fn upsert_is_idempotent_by_user_and_name() {
        let store = InMemoryPatternStore::new();
        let cancel = CancellationToken::new();
        store.upsert(retry_pattern(), &cancel).await.unwrap();
        store.upsert(retry_pattern(), &cancel).await.unwrap();

        let _ = store
            .match_query("u1", "how do we handle retries?", None, &cancel)
            .await
            .unwrap();
        assert!(!store.is_empty_for_user("u1").await);
    }

    #[tokio::test]
    async fn consolidate_merges_jaccard_similar_triggers() {
        let store = InMemoryPatternStore::new();
        let cancel = CancellationToken::new();

        let mut a = Pattern::new(
            "u1",
            "retries-a",
            "describes retry handling",
            vec![Trigger::keyword("retry"), Trigger::keyword("backoff")],
            "Explain retries.",
            0.80,
        )
        .unwrap();
        a.record_usage();

        let b = Pattern::new(
            "u1",
            "retries-b",
            "also describes retry handling",
            vec![Trigger::keyword("retry"), Trigger::keyword("backoff")],
            "Explain retries differently.",
            0.80,
        )
        .unwrap();

        store.upsert(a, &cancel).await.unwrap();
        store.upsert(b, &cancel).await.unwrap();

        let merges = store.consolidate("u1", &cancel).await.unwrap();
        assert_eq!(merges, 1);
    }

    #[tokio::test]
    async fn erase_user_removes_all_patterns() {
        let store = InMemoryPatternStore::new();
        let cancel = CancellationToken::new();
        store.upsert(retry_pattern(), &cancel).await.unwrap();
        store.erase_user("u1", &cancel).await.unwrap();
        assert!(store.is_empty_for_user("u1").await);
    }
}
