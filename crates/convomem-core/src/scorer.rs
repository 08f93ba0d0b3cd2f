//! Salience scorer - a pure function from message content and metadata to
//! an importance scalar in `[0, 1]`. No I/O, no state: small,
//! independently testable channel functions combined by one top-level
//! entry point. The same pass also derives the boolean/tag metadata the
//! scoring channels themselves depend on (`is_question`, `contains_decision`,
//! `contains_code`, `first_message`/`early_conversation` tags), so callers
//! get both the scalar and the tags from a single call.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::model::Message;

/// Diagnostic breakdown alongside the authoritative scalar. The numeric
/// fields are never used to recompute the scalar - the geometric-mean
/// combination in [`score`] is the single source of truth. `is_question`,
/// `contains_decision`, `contains_code`, and `tags` are the metadata a
/// caller is expected to write back onto the scored message.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreBreakdown {
    pub scalar: f32,
    pub base: f32,
    pub emotional_weight: f32,
    pub novelty_boost: f32,
    pub recency_factor: f32,
    pub is_question: bool,
    pub contains_decision: bool,
    pub contains_code: bool,
    pub tags: BTreeSet<String>,
}

const NEGATIVE_WORDS: &[&str] = &[
    "hate", "angry", "frustrated", "broken", "terrible", "worried", "afraid", "upset",
];
const POSITIVE_WORDS: &[&str] = &["love", "great", "happy", "excellent", "thrilled", "glad"];
const CODE_VOCAB: &[&str] = &["function", "class", "struct", "import", "return", "async", "fn ", "impl "];
const DOMAIN_VOCAB: &[&str] = &[
    "database", "latency", "throughput", "api", "schema", "index", "cache", "queue", "cluster",
    "kernel", "protocol", "algorithm",
];
const FINAL_DECISION_CUES: &[&str] = &["we decided", "final decision", "going with", "we will use"];
const FORWARD_COMMITMENT_CUES: &[&str] = &["we'll go with", "let's use", "plan to use"];
const HEDGE_CUES: &[&str] = &["maybe we should", "might want to", "could consider"];

fn decision_language(lower: &str) -> f32 {
    if FINAL_DECISION_CUES.iter().any(|c| lower.contains(c)) {
        0.50
    } else if FORWARD_COMMITMENT_CUES.iter().any(|c| lower.contains(c)) {
        0.25
    } else if HEDGE_CUES.iter().any(|c| lower.contains(c)) {
        0.15
    } else {
        0.0
    }
}

fn explicit_importance_markers(lower: &str) -> f32 {
    if ["critical", "must", "required"].iter().any(|w| lower.contains(w)) {
        0.60
    } else if ["important", "remember", "key"].iter().any(|w| lower.contains(w)) {
        0.40
    } else if lower.contains("don't forget") || lower.contains("take note") {
        0.35
    } else {
        0.0
    }
}

fn question_shape(content: &str, lower: &str) -> f32 {
    const MODALS: &[&str] = &["should", "would", "could", "might"];
    let trimmed = content.trim_end();
    if trimmed.ends_with('?') {
        if MODALS.iter().any(|m| lower.contains(m)) {
            0.40
        } else {
            0.20
        }
    } else if content.contains('?') {
        0.05
    } else {
        0.0
    }
}

fn code_content(content: &str, lower: &str) -> f32 {
    if content.contains("```") {
        0.60
    } else if content.matches('`').count() >= 2 {
        0.45
    } else if CODE_VOCAB.iter().any(|w| lower.contains(w)) {
        0.30
    } else {
        0.0
    }
}

fn novelty(num_novel_entities: usize, first_message: bool, num_uncommon_capitalized: usize) -> f32 {
    let entity_part = (0.15 * num_novel_entities as f32).min(0.50);
    let first_part = if first_message { 0.30 } else { 0.0 };
    let capitalized_part = (0.05 * num_uncommon_capitalized as f32).min(0.20);
    entity_part + first_part + capitalized_part
}

fn sentiment(lower: &str) -> f32 {
    let mut value = 0.0_f32;
    if NEGATIVE_WORDS.iter().any(|w| lower.contains(w)) {
        value += 0.35;
    }
    if POSITIVE_WORDS.iter().any(|w| lower.contains(w)) {
        value += 0.25;
    }
    let exclamations = lower.matches('!').count();
    value += (0.05 * exclamations as f32).min(0.15);
    value
}

fn technical_depth(content: &str, lower: &str) -> f32 {
    let domain_count = DOMAIN_VOCAB.iter().filter(|w| lower.contains(**w)).count();
    let mut value = (domain_count as f32 * 0.15).min(0.40);
    if content.len() > 200 {
        value += 0.15;
    }
    let acronym_count = content
        .split_whitespace()
        .filter(|w| w.len() >= 2 && w.chars().all(|c| c.is_ascii_uppercase()))
        .count();
    value += (acronym_count as f32 * 0.10).min(0.20);
    value
}

fn conversation_context(lower: &str, early_conversation: bool) -> f32 {
    let mut value = if early_conversation { 0.15 } else { 0.0 };
    if lower.contains("as we discussed") || lower.contains("previously") {
        value += 0.25;
    }
    if lower.contains("we'll need") || lower.contains("later we") || lower.contains("in the future") {
        value += 0.20;
    }
    value
}

fn recency_factor(timestamp: DateTime<Utc>, now: DateTime<Utc>) -> f32 {
    let age_hours = (now - timestamp).num_seconds() as f32 / 3600.0;
    if age_hours < 1.0 {
        1.0
    } else {
        (-age_hours / 24.0).exp()
    }
}

/// Extra context the scorer needs beyond the message itself: whether this
/// is the conversation's first message, how many entities extracted from
/// it are novel, and how many capitalized words are uncommon (neither
/// sentence-initial nor in a small stoplist). Callers that don't track
/// these can pass zeros/`false` for a conservative score.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScoringContext {
    pub first_message: bool,
    pub early_conversation: bool,
    pub num_novel_entities: usize,
    pub num_uncommon_capitalized_words: usize,
}

/// Score a message's content/metadata into an importance scalar, per the
/// eight-channel geometric-mean combination. Pure: depends only on its
/// arguments, never on wall-clock state beyond the `now` passed in.
pub fn score(message: &Message, ctx: &ScoringContext, now: DateTime<Utc>) -> ScoreBreakdown {
    let content = message.content.as_str();
    let lower = content.to_lowercase();

    let decision = decision_language(&lower);
    let question = question_shape(content, &lower);
    let code = code_content(content, &lower);

    let channels = [
        decision,
        explicit_importance_markers(&lower),
        question,
        code,
        novelty(
            ctx.num_novel_entities,
            ctx.first_message,
            ctx.num_uncommon_capitalized_words,
        ),
        sentiment(&lower),
        technical_depth(content, &lower),
        conversation_context(&lower, ctx.early_conversation),
    ];

    let non_zero: Vec<f32> = channels.iter().copied().filter(|v| *v >= 0.01).collect();
    let base = if non_zero.is_empty() {
        0.30
    } else {
        let log_sum: f32 = non_zero.iter().map(|v| v.ln()).sum();
        let geometric_mean = (log_sum / non_zero.len() as f32).exp();
        (0.90 * geometric_mean).min(1.0)
    };

    let emotional_weight = sentiment(&lower);
    let novelty_boost = novelty(
        ctx.num_novel_entities,
        ctx.first_message,
        ctx.num_uncommon_capitalized_words,
    );
    let recency = recency_factor(message.timestamp, now);

    let mut tags = BTreeSet::new();
    if ctx.first_message {
        tags.insert("first_message".to_string());
    }
    if ctx.early_conversation {
        tags.insert("early_conversation".to_string());
    }

    ScoreBreakdown {
        scalar: base.clamp(0.0, 1.0),
        base,
        emotional_weight,
        novelty_boost,
        recency_factor: recency,
        is_question: question >= 0.01,
        contains_decision: decision >= 0.01,
        contains_code: code >= 0.01,
        tags,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Role;

    fn msg(content: &str) -> Message {
        Message::new("u", "c", Role::User, content).unwrap()
    }

    #[test]
    fn plain_message_returns_floor_score() {
        let m = msg("just a regular note about the weather");
        let breakdown = score(&m, &ScoringContext::default(), Utc::now());
        assert_eq!(breakdown.scalar, 0.30);
    }

    #[test]
    fn decision_language_raises_score_above_floor() {
        let m = msg("we decided to use PostgreSQL for the primary datastore");
        let breakdown = score(&m, &ScoringContext::default(), Utc::now());
        assert!(breakdown.scalar > 0.30, "scalar was {}", breakdown.scalar);
    }

    #[test]
    fn scalar_never_exceeds_one() {
        let m = msg("CRITICAL must required we decided final decision!!! ```fn main() {}``` IMPORTANT AI API");
        let ctx = ScoringContext {
            first_message: true,
            early_conversation: true,
            num_novel_entities: 10,
            num_uncommon_capitalized_words: 10,
        };
        let breakdown = score(&m, &ctx, Utc::now());
        assert!(breakdown.scalar <= 1.0);
    }

    #[test]
    fn recency_factor_is_at_least_one_when_fresh() {
        let m = msg("hello");
        let breakdown = score(&m, &ScoringContext::default(), m.timestamp);
        assert!(breakdown.recency_factor >= 1.0);
    }

    #[test]
    fn recency_factor_decays_with_age() {
        let mut m = msg("hello");
        m.timestamp = Utc::now() - chrono::Duration::hours(48);
        let breakdown = score(&m, &ScoringContext::default(), Utc::now());
        assert!(breakdown.recency_factor < 1.0);
    }

    #[test]
    fn code_fence_dominates_code_channel() {
        let fenced = msg("```rust\nfn main() {}\n```");
        let inline = msg("use the `foo` helper");
        let fenced_score = score(&fenced, &ScoringContext::default(), Utc::now());
        let inline_score = score(&inline, &ScoringContext::default(), Utc::now());
        assert!(fenced_score.scalar >= inline_score.scalar);
    }

    #[test]
    fn derives_booleans_and_tags_alongside_the_scalar() {
        let m = msg("we decided to use PostgreSQL, right?");
        let ctx = ScoringContext {
            first_message: true,
            early_conversation: true,
            ..Default::default()
        };
        let breakdown = score(&m, &ctx, Utc::now());
        assert!(breakdown.contains_decision);
        assert!(breakdown.is_question);
        assert!(!breakdown.contains_code);
        assert!(breakdown.tags.contains("first_message"));
        assert!(breakdown.tags.contains("early_conversation"));
    }

    #[test]
    fn plain_message_has_no_tags_when_context_is_default() {
        let m = msg("just a regular note about the weather");
        let breakdown = score(&m, &ScoringContext::default(), Utc::now());
        assert!(breakdown.tags.is_empty());
        assert!(!breakdown.contains_decision);
        assert!(!breakdown.is_question);
    }
}
