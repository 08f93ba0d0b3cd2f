//! Orchestrator - the single entry point that coordinates tier fan-out
//! for `store`, `retrieve`, and `erase_user`, plus a detached-task
//! supervisor for the background consolidation path.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capability::Capability;
use crate::classifier;
use crate::config::EngineConfig;
use crate::consolidation::{self, consolidate_patterns};
use crate::error::{EngineError, Result};
use crate::model::{ConversationState, Message, MemoryContext, Tier};
use crate::scorer::{self, ScoringContext};
use crate::tiers::{ArchiveTier, FactTier, PatternTier, ShortTermTier};

/// Tracks detached background tasks so shutdown can drain or abandon
/// them, rather than leaking unmanaged `tokio::spawn` calls.
#[derive(Default)]
pub struct TaskSupervisor {
    tasks: AsyncMutex<JoinSet<()>>,
}

impl TaskSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a detached future, tracked for later draining.
    pub async fn spawn(&self, future: impl std::future::Future<Output = ()> + Send + 'static) {
        let mut tasks = self.tasks.lock().await;
        tasks.spawn(future);
    }

    /// Either await all tracked tasks to completion (`drain = true`) or
    /// abort them immediately.
    pub async fn shutdown(&self, drain: bool) {
        let mut tasks = self.tasks.lock().await;
        if drain {
            while tasks.join_next().await.is_some() {}
        } else {
            tasks.abort_all();
        }
    }
}

/// The engine's single entry point, holding all four tier adapters and
/// the capability provider behind `Arc` so it can be cheaply cloned and
/// shared across request handlers. Stateless beyond those handles - all
/// per-user state lives inside the tiers.
pub struct Orchestrator {
    t3: Arc<dyn ShortTermTier>,
    t2: Arc<dyn FactTier>,
    t1: Arc<dyn ArchiveTier>,
    tp: Arc<dyn PatternTier>,
    capability: Arc<dyn Capability>,
    supervisor: Arc<TaskSupervisor>,
    config: EngineConfig,
}

impl Orchestrator {
    pub fn new(
        t3: Arc<dyn ShortTermTier>,
        t2: Arc<dyn FactTier>,
        t1: Arc<dyn ArchiveTier>,
        tp: Arc<dyn PatternTier>,
        capability: Arc<dyn Capability>,
    ) -> Self {
        Self::with_config(t3, t2, t1, tp, capability, EngineConfig::default())
    }

    pub fn with_config(
        t3: Arc<dyn ShortTermTier>,
        t2: Arc<dyn FactTier>,
        t1: Arc<dyn ArchiveTier>,
        tp: Arc<dyn PatternTier>,
        capability: Arc<dyn Capability>,
        config: EngineConfig,
    ) -> Self {
        Self {
            t3,
            t2,
            t1,
            tp,
            capability,
            supervisor: Arc::new(TaskSupervisor::new()),
            config,
        }
    }

    /// Score, persist to T1 and T3 (both mandatory), and enqueue a
    /// detached background task for entity extraction and pattern
    /// detection. Never awaits the background task.
    pub async fn store(&self, user: &str, conversation: &str, message: Message, cancel: &CancellationToken) -> Result<Message> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let partition_len = self.t3.partition_len(user, conversation).await;
        let scoring_ctx = ScoringContext {
            first_message: partition_len == 0,
            early_conversation: partition_len <= 2,
            ..ScoringContext::default()
        };
        let breakdown = scorer::score(&message, &scoring_ctx, chrono::Utc::now());
        let message = message
            .with_importance(breakdown.scalar)
            .with_derived_metadata(
                breakdown.is_question,
                breakdown.contains_decision,
                breakdown.contains_code,
                breakdown.tags,
            );

        let archive_message = message.clone();
        let short_term_message = message.clone();
        let (archive_result, short_term_result) = tokio::join!(
            self.t1.archive(archive_message, cancel),
            self.t3.add(user, conversation, short_term_message, cancel),
        );
        archive_result?;
        short_term_result?;

        let facts = self.t2.clone();
        let patterns = self.tp.clone();
        let capability = self.capability.clone();
        let background_message = message.clone();
        let deadline = self.config.background_deadline;
        let background_cancel = CancellationToken::new();

        self.supervisor
            .spawn(async move {
                let outcome = tokio::time::timeout(
                    deadline,
                    consolidation::consolidate_message(facts, patterns, capability, background_message, background_cancel),
                )
                .await;
                match outcome {
                    Ok(run) => {
                        info!(
                            facts_stored = run.facts_stored,
                            pattern_detected = run.pattern_detected,
                            "background consolidation finished"
                        );
                    }
                    Err(_) => {
                        warn!(deadline_secs = deadline.as_secs(), "background consolidation timed out");
                    }
                }
            })
            .await;

        Ok(message)
    }

    /// Classify the query (consulting the capability's advisory
    /// classification when confidence is low), fan out bounded concurrent
    /// reads across the planned tiers, and assemble a `MemoryContext`.
    /// Never fails on partial tier failure - degraded tiers are annotated
    /// instead.
    pub async fn retrieve(&self, user: &str, conversation: &str, query: &str, turn_count: u32, cancel: &CancellationToken) -> Result<MemoryContext> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let started = Instant::now();

        let state = ConversationState::new(user, conversation, turn_count);
        let mut plan = classifier::plan(query, &state);

        if plan.confidence < classifier::LOW_CONFIDENCE_THRESHOLD {
            match self.capability.classify_query(query, cancel).await {
                Ok(label) => {
                    if let Some(tiers) = classifier::tiers_for_capability_label(&label) {
                        debug!(label = %label, "capability classify_query narrowed a low-confidence plan");
                        plan.tiers_to_use = tiers;
                    }
                }
                Err(error) => {
                    warn!(%error, "capability classify_query failed during low-confidence fallback");
                }
            }
        }

        let query_embedding = if plan.tiers_to_use.contains(&Tier::T2) || plan.tiers_to_use.contains(&Tier::Tp) {
            match self.capability.embed(query, cancel).await {
                Ok(embedding) => Some(embedding),
                Err(error) => {
                    warn!(%error, "capability embed failed during retrieval");
                    None
                }
            }
        } else {
            None
        };

        let mut degraded_tiers = BTreeSet::new();

        let working_memory = if plan.tiers_to_use.contains(&Tier::T3) {
            match self.t3.get_recent(user, conversation, self.config.read_caps.t3, cancel).await {
                Ok(messages) => messages,
                Err(_) => {
                    degraded_tiers.insert(Tier::T3);
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let facts = if plan.tiers_to_use.contains(&Tier::T2) {
            match self
                .t2
                .search(user, query, query_embedding.as_deref(), self.config.read_caps.t2, cancel)
                .await
            {
                Ok(facts) => facts,
                Err(_) => {
                    degraded_tiers.insert(Tier::T2);
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let archive_hits = if plan.tiers_to_use.contains(&Tier::T1) {
            match self.t1.search(user, query, self.config.read_caps.t1, cancel).await {
                Ok(hits) => hits,
                Err(_) => {
                    degraded_tiers.insert(Tier::T1);
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let matched_pattern = if plan.tiers_to_use.contains(&Tier::Tp) {
            match self.tp.match_query(user, query, query_embedding.as_deref(), cancel).await {
                Ok(pattern) => pattern,
                Err(_) => {
                    degraded_tiers.insert(Tier::Tp);
                    None
                }
            }
        } else {
            None
        };

        let total_chars = working_memory.iter().map(|m| m.content.len()).sum::<usize>()
            + facts.iter().map(|f| f.key.len() + f.value.len()).sum::<usize>()
            + archive_hits.iter().map(|m| m.content.len()).sum::<usize>();

        Ok(MemoryContext {
            working_memory,
            facts,
            archive_hits,
            matched_pattern,
            plan,
            estimated_tokens: MemoryContext::estimate_tokens(total_chars),
            retrieval_latency_ms: started.elapsed().as_millis() as u64,
            degraded_tiers,
        })
    }

    /// Erase a user from all four tiers in parallel. All four must
    /// succeed; on partial failure, the set of failed tiers is reported
    /// and the call is safe to retry.
    pub async fn erase_user(&self, user: &str, cancel: &CancellationToken) -> std::result::Result<(), BTreeSet<Tier>> {
        if cancel.is_cancelled() {
            return Err(BTreeSet::from([Tier::T3, Tier::T2, Tier::T1, Tier::Tp]));
        }

        let (t3_result, t2_result, t1_result, tp_result) = tokio::join!(
            self.t3.erase_user(user, cancel),
            self.t2.erase_user(user, cancel),
            self.t1.erase_user(user, cancel),
            self.tp.erase_user(user, cancel),
        );

        let mut failed = BTreeSet::new();
        if t3_result.is_err() {
            failed.insert(Tier::T3);
        }
        if t2_result.is_err() {
            failed.insert(Tier::T2);
        }
        if t1_result.is_err() {
            failed.insert(Tier::T1);
        }
        if tp_result.is_err() {
            failed.insert(Tier::Tp);
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(failed)
        }
    }

    /// Merge near-duplicate patterns for a user. Queued work, never
    /// invoked re-entrantly from the match path.
    pub async fn consolidate_patterns(&self, user: &str, cancel: &CancellationToken) -> Result<usize> {
        consolidate_patterns(self.tp.clone(), user, cancel).await
    }

    /// Evict facts that have been accessed fewer than `fact_min_access`
    /// times and are older than `fact_ttl`. Queued maintenance work, run
    /// on the same cadence as pattern consolidation rather than inline
    /// on the read/write path.
    pub async fn prune_facts(&self, user: &str, cancel: &CancellationToken) -> Result<usize> {
        self.t2
            .prune(user, self.config.fact_min_access, self.config.fact_ttl, cancel)
            .await
    }

    /// Drain or abort outstanding background tasks.
    pub async fn shutdown(&self, drain: bool) {
        self.supervisor.shutdown(drain).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::MockCapability;
    use crate::model::Role;
    use crate::tiers::{InMemoryArchive, InMemoryFactStore, InMemoryPatternStore, InMemoryShortTermWindow};

    fn build_orchestrator() -> Orchestrator {
        Orchestrator::new(
            Arc::new(InMemoryShortTermWindow::new(10, chrono::Duration::hours(24))),
            Arc::new(InMemoryFactStore::new()),
            Arc::new(InMemoryArchive::new()),
            Arc::new(InMemoryPatternStore::new()),
            Arc::new(MockCapability::new()),
        )
    }

    #[tokio::test]
    async fn store_then_retrieve_sees_the_new_message() {
        let orchestrator = build_orchestrator();
        let cancel = CancellationToken::new();
        let message = Message::new("u1", "c1", Role::User, "we decided to use PostgreSQL").unwrap();

        orchestrator.store("u1", "c1", message, &cancel).await.unwrap();
        let context = orchestrator.retrieve("u1", "c1", "continue", 1, &cancel).await.unwrap();

        assert_eq!(context.working_memory.len(), 1);
        assert!(context.retrieval_latency_ms < 5000);
    }

    #[tokio::test]
    async fn erase_user_empties_all_tiers() {
        let orchestrator = build_orchestrator();
        let cancel = CancellationToken::new();
        let message = Message::new("u1", "c1", Role::User, "hello there").unwrap();
        orchestrator.store("u1", "c1", message, &cancel).await.unwrap();

        let result = orchestrator.erase_user("u1", &cancel).await;
        assert!(result.is_ok());

        let context = orchestrator
            .retrieve("u1", "c1", "what about everything?", 1, &cancel)
            .await
            .unwrap();
        assert!(context.working_memory.is_empty());
    }

    #[tokio::test]
    async fn prune_facts_is_wired_to_the_fact_tier() {
        let orchestrator = build_orchestrator();
        let cancel = CancellationToken::new();
        let pruned = orchestrator.prune_facts("u1", &cancel).await.unwrap();
        assert_eq!(pruned, 0);
    }

    #[tokio::test]
    async fn retrieve_on_empty_store_returns_empty_context_without_error() {
        let orchestrator = build_orchestrator();
        let cancel = CancellationToken::new();
        let context = orchestrator
            .retrieve("u1", "c1", "how do we handle retries?", 1, &cancel)
            .await
            .unwrap();
        assert!(context.working_memory.is_empty());
        assert!(context.matched_pattern.is_none());
    }
}
