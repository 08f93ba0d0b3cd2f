//! Core data model - conversational messages, extracted facts, learned
//! patterns, and the structures that tie a retrieval together.
//!
//! Entities are immutable after construction except where a mutation path
//! is explicitly called out (`Message::with_importance`,
//! `Message::with_derived_metadata`, `Fact::record_access`,
//! `Pattern::record_usage`).

mod context;
mod fact;
mod message;
mod pattern;

pub use context::{
    ConversationState, MemoryContext, QueryPlan, QueryType, Tier, TIER_TOKEN_BUDGET_T1,
    TIER_TOKEN_BUDGET_T2, TIER_TOKEN_BUDGET_T3, TIER_TOKEN_BUDGET_TP,
};
pub use fact::{EntityType, Fact};
pub use message::{ExtractedEntity, Message, MessageMetadata, Role};
pub use pattern::{Pattern, PatternState, Trigger, TriggerKind};
