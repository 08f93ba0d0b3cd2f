//! Query classifier - a pure function from a raw query string and the
//! caller's conversation state to a [`QueryPlan`]. Two-stage: a fast
//! lexical path for unambiguous cues, then a weighted-signal fallback
//! over phrase tables with confidence-tiered tier selection.

use std::collections::BTreeSet;

use crate::model::{
    ConversationState, QueryPlan, QueryType, Tier, TIER_TOKEN_BUDGET_T1, TIER_TOKEN_BUDGET_T2,
    TIER_TOKEN_BUDGET_T3, TIER_TOKEN_BUDGET_TP,
};

const CONTINUATION_CUES: &[&str] = &["and then", "also,", "what about", "and also", "continuing"];
const DEEP_RECALL_CUES: &[&str] = &["quote", "exactly", "verbatim"];
const PROCEDURAL_CUES: &[&str] = &["write code", "generate", "build"];
const FACT_RETRIEVAL_CUES: &[&str] = &["what was", "tell me about"];

const RETRIEVAL_PHRASES: &[(&str, f32)] = &[
    ("what did", 0.6),
    ("remind me", 0.6),
    ("do you remember", 0.7),
    ("find", 0.3),
];
const DECISION_PHRASES: &[(&str, f32)] = &[
    ("should we", 0.6),
    ("which one", 0.5),
    ("recommend", 0.5),
    ("decide", 0.5),
];
const PATTERN_PHRASES: &[(&str, f32)] = &[
    ("every time", 0.6),
    ("whenever", 0.6),
    ("always", 0.4),
    ("from now on", 0.7),
];
const NARRATIVE_PHRASES: &[(&str, f32)] = &[
    ("tell me a story", 0.7),
    ("walk me through", 0.5),
    ("explain", 0.4),
    ("how does", 0.4),
];

const NEGATIONS: &[&str] = &["not", "never", "don't", "isn't"];
const EMPHATIC_ADVERBS: &[&str] = &["really", "definitely", "absolutely", "literally"];

/// Below this confidence the signal-based stage already falls back to all
/// four tiers; it's also the point at which `plan` consults the
/// capability's advisory `classify_query` to try to narrow back down.
pub const LOW_CONFIDENCE_THRESHOLD: f32 = 0.60;
const HIGH_CONFIDENCE_THRESHOLD: f32 = 0.80;

fn lexical_fast_path(query: &str) -> Option<(QueryType, BTreeSet<Tier>)> {
    let lower = query.to_lowercase();
    let trimmed = lower.trim_start();

    if CONTINUATION_CUES.iter().any(|cue| trimmed.starts_with(cue)) {
        return Some((QueryType::Continuation, BTreeSet::from([Tier::T3])));
    }
    if DEEP_RECALL_CUES.iter().any(|cue| lower.contains(cue)) {
        return Some((
            QueryType::DeepRecall,
            BTreeSet::from([Tier::T3, Tier::T2, Tier::T1]),
        ));
    }
    if PROCEDURAL_CUES.iter().any(|cue| lower.contains(cue)) {
        return Some((
            QueryType::ProceduralTrigger,
            BTreeSet::from([Tier::T3, Tier::Tp]),
        ));
    }
    if FACT_RETRIEVAL_CUES.iter().any(|cue| lower.contains(cue)) {
        return Some((QueryType::FactRetrieval, BTreeSet::from([Tier::T3, Tier::T2])));
    }
    None
}

/// Raw, un-normalized signal totals for the four categories the
/// weighted-signal stage scores a query against.
#[derive(Debug, Clone, Copy, Default)]
struct SignalTotals {
    retrieval: f32,
    decision: f32,
    pattern: f32,
    narrative: f32,
}

fn phrase_weight_sum(lower: &str, table: &[(&str, f32)]) -> f32 {
    table
        .iter()
        .filter(|(phrase, _)| lower.contains(phrase))
        .map(|(_, weight)| weight)
        .sum()
}

fn intensity_multiplier(query: &str, lower: &str) -> f32 {
    let mut multiplier = 1.0_f32;
    let uppercase_words = query
        .split_whitespace()
        .filter(|w| w.len() > 2 && w.chars().all(|c| !c.is_alphabetic() || c.is_ascii_uppercase()))
        .count();
    if uppercase_words > 0 {
        multiplier += 0.10;
    }
    multiplier += (0.05 * lower.matches('!').count() as f32).min(0.20);
    if EMPHATIC_ADVERBS.iter().any(|w| lower.contains(w)) {
        multiplier += 0.10;
    }
    multiplier
}

fn negation_discount(lower: &str) -> f32 {
    if NEGATIONS.iter().any(|n| lower.contains(n)) {
        0.7
    } else {
        1.0
    }
}

fn signal_based_stage(query: &str, state: &ConversationState) -> (QueryType, f32, BTreeSet<Tier>) {
    let lower = query.to_lowercase();
    let intensity = intensity_multiplier(query, &lower);
    let negation = negation_discount(&lower);
    let early_turn_bonus = if state.turn_count <= 2 { 0.15 } else { 0.0 };
    let length_heuristic = (query.len() as f32 / 400.0).min(0.20);

    let totals = SignalTotals {
        retrieval: phrase_weight_sum(&lower, RETRIEVAL_PHRASES) * intensity * negation + length_heuristic,
        decision: phrase_weight_sum(&lower, DECISION_PHRASES) * intensity * negation,
        pattern: phrase_weight_sum(&lower, PATTERN_PHRASES) * intensity * negation,
        narrative: phrase_weight_sum(&lower, NARRATIVE_PHRASES) * intensity * negation + early_turn_bonus,
    };

    let sum = totals.retrieval + totals.decision + totals.pattern + totals.narrative;
    let (retrieval_p, decision_p, pattern_p, narrative_p) = if sum < 0.01 {
        (0.25, 0.25, 0.25, 0.25)
    } else {
        (
            totals.retrieval / sum,
            totals.decision / sum,
            totals.pattern / sum,
            totals.narrative / sum,
        )
    };

    let candidates = [
        (QueryType::FactRetrieval, retrieval_p, BTreeSet::from([Tier::T3, Tier::T2])),
        (QueryType::DeepRecall, decision_p, BTreeSet::from([Tier::T3, Tier::T2, Tier::T1])),
        (QueryType::ProceduralTrigger, pattern_p, BTreeSet::from([Tier::T3, Tier::Tp])),
        (QueryType::Complex, narrative_p, BTreeSet::from([Tier::T3, Tier::T2, Tier::T1])),
    ];

    candidates
        .into_iter()
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .expect("candidates is non-empty")
}

/// Classify a query into a [`QueryPlan`]: which tiers to consult and a
/// rough token budget, given the caller's conversation state.
pub fn plan(query: &str, state: &ConversationState) -> QueryPlan {
    if let Some((query_type, tiers)) = lexical_fast_path(query) {
        let estimated_tokens = estimate_tokens(&tiers, 1.0);
        return QueryPlan {
            query_type,
            tiers_to_use: tiers,
            estimated_tokens,
            confidence: 1.0,
        };
    }

    let (query_type, confidence, narrow_tiers) = signal_based_stage(query, state);

    let (tiers_to_use, discount) = if confidence >= HIGH_CONFIDENCE_THRESHOLD {
        (narrow_tiers, 1.0)
    } else if confidence >= LOW_CONFIDENCE_THRESHOLD {
        let mut tiers = narrow_tiers;
        tiers.insert(Tier::T1);
        (tiers, 0.85)
    } else {
        (BTreeSet::from([Tier::T3, Tier::T2, Tier::T1, Tier::Tp]), 0.65)
    };

    let estimated_tokens = estimate_tokens(&tiers_to_use, discount);
    QueryPlan {
        query_type,
        tiers_to_use,
        estimated_tokens,
        confidence,
    }
}

/// Map the capability's advisory `classify_query` label onto a tier set,
/// used to try to narrow a low-confidence plan that would otherwise read
/// all four tiers. Unknown labels leave the plan untouched.
pub fn tiers_for_capability_label(label: &str) -> Option<BTreeSet<Tier>> {
    match label {
        "fact_retrieval" => Some(BTreeSet::from([Tier::T3, Tier::T2])),
        "procedural" => Some(BTreeSet::from([Tier::T3, Tier::Tp])),
        "complex" => Some(BTreeSet::from([Tier::T3, Tier::T2, Tier::T1])),
        _ => None,
    }
}

fn estimate_tokens(tiers: &BTreeSet<Tier>, discount: f32) -> u32 {
    let raw: u32 = tiers
        .iter()
        .map(|t| match t {
            Tier::T3 => TIER_TOKEN_BUDGET_T3,
            Tier::T2 => TIER_TOKEN_BUDGET_T2,
            Tier::T1 => TIER_TOKEN_BUDGET_T1,
            Tier::Tp => TIER_TOKEN_BUDGET_TP,
        })
        .sum();
    ((raw as f32) * discount) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(turn_count: u32) -> ConversationState {
        ConversationState::new("u", "c", turn_count)
    }

    #[test]
    fn continuation_cue_uses_only_t3() {
        let plan = plan("and then what happened next?", &state(5));
        assert_eq!(plan.query_type, QueryType::Continuation);
        assert_eq!(plan.tiers_to_use, BTreeSet::from([Tier::T3]));
    }

    #[test]
    fn deep_recall_cue_uses_three_tiers() {
        let plan = plan("can you quote exactly what I said?", &state(5));
        assert_eq!(plan.query_type, QueryType::DeepRecall);
        assert_eq!(plan.tiers_to_use, BTreeSet::from([Tier::T3, Tier::T2, Tier::T1]));
    }

    #[test]
    fn procedural_cue_uses_t3_and_tp() {
        let plan = plan("please write code to parse this", &state(5));
        assert_eq!(plan.query_type, QueryType::ProceduralTrigger);
        assert_eq!(plan.tiers_to_use, BTreeSet::from([Tier::T3, Tier::Tp]));
    }

    #[test]
    fn fact_retrieval_cue_uses_t3_and_t2() {
        let plan = plan("tell me about the database choice", &state(5));
        assert_eq!(plan.query_type, QueryType::FactRetrieval);
        assert_eq!(plan.tiers_to_use, BTreeSet::from([Tier::T3, Tier::T2]));
    }

    #[test]
    fn low_confidence_falls_back_to_all_tiers() {
        let plan = plan("hmm", &state(5));
        assert_eq!(
            plan.tiers_to_use,
            BTreeSet::from([Tier::T3, Tier::T2, Tier::T1, Tier::Tp])
        );
        assert!(plan.confidence < LOW_CONFIDENCE_THRESHOLD);
    }

    #[test]
    fn fast_path_reports_full_confidence() {
        let plan = plan("and then what happened next?", &state(5));
        assert_eq!(plan.confidence, 1.0);
    }

    #[test]
    fn token_estimate_sums_tier_budgets() {
        let plan = plan("and then, go on", &state(5));
        assert_eq!(plan.estimated_tokens, TIER_TOKEN_BUDGET_T3);
    }

    #[test]
    fn capability_label_maps_to_a_narrow_tier_set() {
        assert_eq!(
            tiers_for_capability_label("fact_retrieval"),
            Some(BTreeSet::from([Tier::T3, Tier::T2]))
        );
        assert_eq!(
            tiers_for_capability_label("procedural"),
            Some(BTreeSet::from([Tier::T3, Tier::Tp]))
        );
        assert_eq!(tiers_for_capability_label("unknown"), None);
    }
}
