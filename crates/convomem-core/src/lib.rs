//! `convomem-core` is a hierarchical conversational memory engine for
//! LLM applications: a short-term window, a fact store, a durable
//! archive, and a learned-pattern store, fanned out by a single
//! orchestrator behind a classifier and a salience scorer.
//!
//! Start with [`prelude`] for the common imports, construct the four
//! tier adapters you need (in-memory ones are provided for every tier;
//! [`tiers::SqliteArchive`] backs T1 durably behind the `sqlite-archive`
//! feature), wrap a [`capability::Capability`] implementation, and build an
//! [`orchestrator::Orchestrator`].

pub mod capability;
pub mod classifier;
pub mod config;
pub mod consolidation;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod scorer;
pub mod tiers;

/// Common imports for constructing and driving the engine.
pub mod prelude {
    pub use crate::capability::{Capability, CachingCapability, MockCapability, Sentiment};
    pub use crate::config::{EngineConfig, TierReadCaps};
    pub use crate::error::{EngineError, Result};
    pub use crate::model::{
        ConversationState, EntityType, ExtractedEntity, Fact, MemoryContext, Message,
        MessageMetadata, Pattern, PatternState, QueryPlan, QueryType, Role, Tier, Trigger,
        TriggerKind,
    };
    pub use crate::orchestrator::{Orchestrator, TaskSupervisor};
    pub use crate::tiers::{
        ArchiveTier, FactTier, InMemoryArchive, InMemoryFactStore, InMemoryPatternStore,
        InMemoryShortTermWindow, PatternTier, ShortTermTier,
    };
    #[cfg(feature = "sqlite-archive")]
    pub use crate::tiers::SqliteArchive;
}

#[cfg(test)]
mod tests {
    use super::prelude::*;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn engine_builds_and_stores_a_message_end_to_end() {
        let orchestrator = Orchestrator::new(
            Arc::new(InMemoryShortTermWindow::new(10, chrono::Duration::hours(24))),
            Arc::new(InMemoryFactStore::new()),
            Arc::new(InMemoryArchive::new()),
            Arc::new(InMemoryPatternStore::new()),
            Arc::new(MockCapability::new()),
        );
        let cancel = CancellationToken::new();
        let message = Message::new("u1", "c1", Role::User, "we decided to use Rust for the backend").unwrap();

        let stored = orchestrator.store("u1", "c1", message, &cancel).await.unwrap();
        assert!(stored.metadata.importance > 0.0);

        let context = orchestrator.retrieve("u1", "c1", "what did we decide?", 1, &cancel).await.unwrap();
        assert_eq!(context.working_memory.len(), 1);
        let rendered = context.render();
        assert!(rendered.contains("=== Recent Conversation ==="));
    }
}
