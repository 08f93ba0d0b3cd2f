//! Conversation state, query plans, and the assembled retrieval result.

use std::collections::BTreeSet;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::fact::Fact;
use super::message::Message;
use super::pattern::Pattern;

/// Which tier a plan consults, or a retrieval degraded into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Tier {
    T3,
    T2,
    T1,
    Tp,
}

/// Derived, never-authoritative view of a conversation's recency.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationState {
    pub user_id: String,
    pub conversation_id: String,
    pub turn_count: u32,
    pub last_activity: DateTime<Utc>,
}

impl ConversationState {
    pub fn new(user_id: impl Into<String>, conversation_id: impl Into<String>, turn_count: u32) -> Self {
        Self {
            user_id: user_id.into(),
            conversation_id: conversation_id.into(),
            turn_count,
            last_activity: Utc::now(),
        }
    }
}

/// Classification of a query, and which tiers should be consulted for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueryType {
    Continuation,
    FactRetrieval,
    DeepRecall,
    Complex,
    ProceduralTrigger,
}

/// The classifier's output: what kind of query this is, which tiers to
/// read, and a rough token budget for the assembled context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryPlan {
    #[serde(rename = "type")]
    pub query_type: QueryType,
    pub tiers_to_use: BTreeSet<Tier>,
    pub estimated_tokens: u32,
    /// `1.0` for the lexical fast path (unambiguous cues); the
    /// normalized signal probability for the weighted-signal stage.
    pub confidence: f32,
}

/// Per-tier token budgets used to build a `QueryPlan`'s estimate.
pub const TIER_TOKEN_BUDGET_T3: u32 = 500;
pub const TIER_TOKEN_BUDGET_T2: u32 = 400;
pub const TIER_TOKEN_BUDGET_T1: u32 = 300;
pub const TIER_TOKEN_BUDGET_TP: u32 = 100;

/// The assembled result of a retrieval: bounded, degradable, and rendered
/// into a deterministic prompt block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryContext {
    /// Short-term messages, ascending timestamp order.
    pub working_memory: Vec<Message>,
    pub facts: Vec<Fact>,
    /// Archive hits, ascending timestamp order.
    pub archive_hits: Vec<Message>,
    pub matched_pattern: Option<Pattern>,
    pub plan: QueryPlan,
    pub estimated_tokens: u32,
    pub retrieval_latency_ms: u64,
    /// Tiers that were requested by the plan but failed or degraded
    /// (e.g. a capability error forced lexical-only fact search).
    pub degraded_tiers: BTreeSet<Tier>,
}

impl MemoryContext {
    /// Render the deterministic prompt layout external callers depend on.
    /// Order and headings are part of the contract - never reorder.
    pub fn render(&self) -> String {
        let mut out = String::new();

        if let Some(pattern) = &self.matched_pattern {
            let _ = writeln!(out, "[SYSTEM INSTRUCTION]: {}", pattern.instruction_template);
            out.push('\n');
        }

        out.push_str("=== Recent Conversation ===\n");
        let mut working = self.working_memory.clone();
        working.sort_by_key(|m| m.timestamp);
        for msg in &working {
            let _ = writeln!(out, "[{:?}] {}", msg.role, msg.content);
        }
        out.push('\n');

        out.push_str("=== Relevant Facts ===\n");
        let mut facts = self.facts.clone();
        facts.sort_by(|a, b| b.importance.total_cmp(&a.importance));
        for fact in facts.into_iter().take(10) {
            let _ = writeln!(out, "{}: {}", fact.key, fact.value);
        }
        out.push('\n');

        out.push_str("=== Previous Relevant Exchanges ===\n");
        let mut archive = self.archive_hits.clone();
        archive.sort_by_key(|m| m.timestamp);
        for msg in &archive {
            let _ = writeln!(out, "[{:?}] {}", msg.role, msg.content);
        }

        out
    }

    /// Token estimate from total UTF-8 character count, rounded up.
    pub fn estimate_tokens(total_chars: usize) -> u32 {
        total_chars.div_ceil(4) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Role;

    fn msg(content: &str, ts_offset_secs: i64) -> Message {
        let mut m = Message::new("u", "c", Role::User, content).unwrap();
        m.timestamp = Utc::now() + chrono::Duration::seconds(ts_offset_secs);
        m
    }

    #[test]
    fn render_is_deterministic_and_ordered() {
        let ctx = MemoryContext {
            working_memory: vec![msg("second", 5), msg("first", 1)],
            facts: vec![],
            archive_hits: vec![msg("old-2", 20), msg("old-1", 10)],
            matched_pattern: None,
            plan: QueryPlan {
                query_type: QueryType::Complex,
                tiers_to_use: BTreeSet::new(),
                estimated_tokens: 0,
                confidence: 1.0,
            },
            estimated_tokens: 0,
            retrieval_latency_ms: 0,
            degraded_tiers: BTreeSet::new(),
        };

        let rendered_a = ctx.render();
        let rendered_b = ctx.render();
        assert_eq!(rendered_a, rendered_b);

        let first_idx = rendered_a.find("first").unwrap();
        let second_idx = rendered_a.find("second").unwrap();
        assert!(first_idx < second_idx, "working memory must be ascending by time");

        let old1_idx = rendered_a.find("old-1").unwrap();
        let old2_idx = rendered_a.find("old-2").unwrap();
        assert!(old1_idx < old2_idx, "archive hits must be ascending by time");
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(MemoryContext::estimate_tokens(0), 0);
        assert_eq!(MemoryContext::estimate_tokens(1), 1);
        assert_eq!(MemoryContext::estimate_tokens(4), 1);
        assert_eq!(MemoryContext::estimate_tokens(5), 2);
    }
}
