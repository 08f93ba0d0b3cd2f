//! Tier adapters - one trait per tier, each with at least one concrete
//! backend, so the orchestrator can be built against in-memory adapters
//! in tests and durable ones in production without changing a line of
//! orchestration logic.

mod archive;
mod facts;
mod patterns;
mod short_term;

pub use archive::InMemoryArchive;
#[cfg(feature = "sqlite-archive")]
pub use archive::SqliteArchive;
pub use facts::InMemoryFactStore;
pub use patterns::InMemoryPatternStore;
pub use short_term::InMemoryShortTermWindow;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::model::{Fact, Message, Pattern};

/// T3 - bounded per-(user, conversation) recency window.
#[async_trait]
pub trait ShortTermTier: Send + Sync {
    async fn add(&self, user: &str, conversation: &str, message: Message, cancel: &CancellationToken) -> Result<()>;
    async fn get_recent(
        &self,
        user: &str,
        conversation: &str,
        count: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<Message>>;
    async fn clear(&self, user: &str, conversation: &str, cancel: &CancellationToken) -> Result<()>;
    async fn remove(&self, user: &str, conversation: &str, message_id: &str, cancel: &CancellationToken) -> Result<()>;
    async fn erase_user(&self, user: &str, cancel: &CancellationToken) -> Result<()>;
    /// Current partition size, for tests and introspection.
    async fn partition_len(&self, user: &str, conversation: &str) -> usize;
}

/// T2 - per-user extracted facts with lexical/vector search.
#[async_trait]
pub trait FactTier: Send + Sync {
    async fn store_facts(&self, user: &str, conversation: &str, facts: Vec<Fact>, cancel: &CancellationToken) -> Result<()>;
    async fn search(
        &self,
        user: &str,
        query: &str,
        query_embedding: Option<&[f32]>,
        max_k: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<Fact>>;
    async fn record_access(&self, user: &str, fact_id: &str, cancel: &CancellationToken) -> Result<()>;
    async fn prune(&self, user: &str, min_access: u32, ttl: chrono::Duration, cancel: &CancellationToken) -> Result<usize>;
    async fn delete_fact(&self, user: &str, fact_id: &str, cancel: &CancellationToken) -> Result<()>;
    async fn erase_user(&self, user: &str, cancel: &CancellationToken) -> Result<()>;
    async fn is_empty_for_user(&self, user: &str) -> bool;
}

/// T1 - durable per-user archive of every message.
#[async_trait]
pub trait ArchiveTier: Send + Sync {
    async fn archive(&self, message: Message, cancel: &CancellationToken) -> Result<()>;
    async fn search(&self, user: &str, query: &str, max_k: usize, cancel: &CancellationToken) -> Result<Vec<Message>>;
    async fn get(&self, message_id: &str, cancel: &CancellationToken) -> Result<Option<Message>>;
    async fn delete(&self, user: &str, message_id: &str, cancel: &CancellationToken) -> Result<()>;
    async fn erase_user(&self, user: &str, cancel: &CancellationToken) -> Result<()>;
    async fn is_empty_for_user(&self, user: &str) -> bool;
}

/// TP - per-user learned patterns with a keyword/regex/semantic match path.
#[async_trait]
pub trait PatternTier: Send + Sync {
    async fn match_query(
        &self,
        user: &str,
        query: &str,
        query_embedding: Option<&[f32]>,
        cancel: &CancellationToken,
    ) -> Result<Option<Pattern>>;
    async fn upsert(&self, pattern: Pattern, cancel: &CancellationToken) -> Result<()>;
    async fn consolidate(&self, user: &str, cancel: &CancellationToken) -> Result<usize>;
    async fn erase_user(&self, user: &str, cancel: &CancellationToken) -> Result<()>;
    async fn is_empty_for_user(&self, user: &str) -> bool;
}
