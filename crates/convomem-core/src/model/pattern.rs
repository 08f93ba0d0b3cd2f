//! Pattern - a learned (triggers → instruction) rule held in TP.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, Result};

/// How a trigger is matched against an incoming query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Keyword,
    Regex,
    Semantic,
}

/// A single condition that can fire a pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    pub kind: TriggerKind,
    pub pattern: String,
    /// Cached at detection time for `Semantic` triggers; unused otherwise.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl Trigger {
    pub fn keyword(pattern: impl Into<String>) -> Self {
        Self {
            kind: TriggerKind::Keyword,
            pattern: pattern.into(),
            embedding: None,
        }
    }

    pub fn regex(pattern: impl Into<String>) -> Self {
        Self {
            kind: TriggerKind::Regex,
            pattern: pattern.into(),
            embedding: None,
        }
    }

    pub fn semantic(pattern: impl Into<String>, embedding: Vec<f32>) -> Self {
        Self {
            kind: TriggerKind::Semantic,
            pattern: pattern.into(),
            embedding: Some(embedding),
        }
    }
}

/// Lifecycle state of a pattern: a state gates whether the pattern
/// participates in the match path at all, not just how it is ranked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternState {
    /// Just upserted by the detection path, never matched yet.
    Candidate,
    /// Has been matched and used at least once.
    Active,
    /// Has accumulated enough usage to be considered well-established.
    Reinforced,
    /// Merged into another pattern during consolidation; kept for
    /// provenance but excluded from matching.
    Merged,
    /// Soft-deleted (user erase or operator request); excluded from
    /// matching.
    Archived,
}

impl PatternState {
    /// Whether a pattern in this state is eligible to participate in the
    /// match path. Mirrors `MemoryState::allows_retrieval` in spirit:
    /// terminal states (`Merged`, `Archived`) are permanently excluded.
    pub fn is_matchable(&self) -> bool {
        !matches!(self, PatternState::Merged | PatternState::Archived)
    }
}

/// A learned behavioral pattern: a set of triggers mapped to an
/// instruction template to inject into the prompt when matched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pattern {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub description: String,
    pub triggers: Vec<Trigger>,
    pub instruction_template: String,
    pub confidence_threshold: f32,
    pub usage_count: u32,
    pub last_used: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub state: PatternState,
}

impl Pattern {
    /// Construct a new pattern in the `Candidate` state. Rejects empty
    /// `name`/`description`/`instruction_template` and an empty trigger
    /// list, and clamps `confidence_threshold` into `[0.6, 1.0]`.
    pub fn new(
        user_id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        triggers: Vec<Trigger>,
        instruction_template: impl Into<String>,
        confidence_threshold: f32,
    ) -> Result<Self> {
        let name = name.into();
        let description = description.into();
        let instruction_template = instruction_template.into();

        if name.trim().is_empty() {
            return Err(EngineError::Input("pattern name must not be empty".into()));
        }
        if description.trim().is_empty() {
            return Err(EngineError::Input(
                "pattern description must not be empty".into(),
            ));
        }
        if instruction_template.trim().is_empty() {
            return Err(EngineError::Input(
                "pattern instruction_template must not be empty".into(),
            ));
        }
        if triggers.is_empty() {
            return Err(EngineError::Input(
                "pattern must have at least one trigger".into(),
            ));
        }

        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            name,
            description,
            triggers,
            instruction_template,
            confidence_threshold: confidence_threshold.clamp(0.6, 1.0),
            usage_count: 0,
            last_used: None,
            created_at: now,
            updated_at: now,
            state: PatternState::Candidate,
        })
    }

    /// Score this pattern against a query using the trigger evaluation
    /// rules from the match-path contract: keyword/regex are binary,
    /// semantic uses cosine similarity against a precomputed query
    /// embedding. Returns the maximum score across all triggers.
    pub fn score(
        &self,
        query: &str,
        query_lower: &str,
        compiled_regexes: &[(usize, &regex::Regex)],
        query_embedding: Option<&[f32]>,
    ) -> f32 {
        let mut best = 0.0_f32;
        for (idx, trigger) in self.triggers.iter().enumerate() {
            let score = match trigger.kind {
                TriggerKind::Keyword => {
                    if query_lower.contains(&trigger.pattern.to_lowercase()) {
                        1.0
                    } else {
                        0.0
                    }
                }
                TriggerKind::Regex => compiled_regexes
                    .iter()
                    .find(|(i, _)| *i == idx)
                    .map(|(_, re)| if re.is_match(query) { 1.0 } else { 0.0 })
                    .unwrap_or(0.0),
                TriggerKind::Semantic => match (trigger.embedding.as_deref(), query_embedding) {
                    (Some(trig_emb), Some(q_emb)) => crate::capability::cosine_similarity(trig_emb, q_emb),
                    _ => 0.0,
                },
            };
            if score > best {
                best = score;
            }
        }
        best
    }

    /// Apply a successful match: bump usage, refresh `last_used`, advance
    /// the lifecycle state, and apply the slow reinforcement rule (usage
    /// past 10 with a threshold above 0.7 nudges the threshold down by
    /// 0.05, floored at 0.6).
    pub fn record_usage(&mut self) {
        self.usage_count = self.usage_count.saturating_add(1);
        self.last_used = Some(Utc::now());
        self.updated_at = Utc::now();

        if self.state == PatternState::Candidate {
            self.state = PatternState::Active;
        }
        if self.usage_count > 10 {
            self.state = PatternState::Reinforced;
            if self.confidence_threshold > 0.7 {
                self.confidence_threshold = (self.confidence_threshold - 0.05).max(0.6);
            }
        }
    }

    /// Normalized name used for consolidation's duplicate-name comparison.
    pub fn normalized_name(&self) -> String {
        self.name.trim().to_lowercase()
    }

    /// Trigger pattern strings, used for consolidation's Jaccard
    /// similarity comparison between two patterns' trigger sets.
    pub fn trigger_pattern_set(&self) -> std::collections::BTreeSet<String> {
        self.triggers
            .iter()
            .map(|t| t.pattern.to_lowercase())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Pattern {
        Pattern::new(
            "u1",
            "retry-handling",
            "user asks how retries are handled",
            vec![Trigger::keyword("retry")],
            "Explain the retry/backoff policy.",
            0.80,
        )
        .unwrap()
    }

    #[test]
    fn rejects_empty_fields() {
        assert!(Pattern::new("u", "", "d", vec![Trigger::keyword("x")], "t", 0.8).is_err());
        assert!(Pattern::new("u", "n", "", vec![Trigger::keyword("x")], "t", 0.8).is_err());
        assert!(Pattern::new("u", "n", "d", vec![Trigger::keyword("x")], "", 0.8).is_err());
        assert!(Pattern::new("u", "n", "d", vec![], "t", 0.8).is_err());
    }

    #[test]
    fn clamps_confidence_threshold() {
        let p = Pattern::new("u", "n", "d", vec![Trigger::keyword("x")], "t", 0.1).unwrap();
        assert_eq!(p.confidence_threshold, 0.6);
        let p = Pattern::new("u", "n", "d", vec![Trigger::keyword("x")], "t", 1.5).unwrap();
        assert_eq!(p.confidence_threshold, 1.0);
    }

    #[test]
    fn reinforcement_lowers_threshold_after_eleven_uses() {
        let mut p = sample();
        for _ in 0..11 {
            p.record_usage();
        }
        assert_eq!(p.usage_count, 11);
        assert!((p.confidence_threshold - 0.75).abs() < 1e-6);
        assert_eq!(p.state, PatternState::Reinforced);
    }

    #[test]
    fn first_usage_moves_candidate_to_active() {
        let mut p = sample();
        assert_eq!(p.state, PatternState::Candidate);
        p.record_usage();
        assert_eq!(p.state, PatternState::Active);
    }

    #[test]
    fn archived_and_merged_are_not_matchable() {
        assert!(PatternState::Candidate.is_matchable());
        assert!(PatternState::Active.is_matchable());
        assert!(!PatternState::Merged.is_matchable());
        assert!(!PatternState::Archived.is_matchable());
    }
}
