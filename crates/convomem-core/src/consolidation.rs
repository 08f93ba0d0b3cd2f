//! Background consolidation: entity extraction into T2, pattern detection
//! into TP, and periodic pattern merging. Dispatched from
//! `Orchestrator::store`'s detached task; never allowed to affect the
//! foreground path - failures here are swallowed into `ConsolidationRun`'s
//! flags and logged, not propagated.
//!
//! The accumulate-then-report shape uses a small `ConsolidationRun`
//! struct to collect what happened so callers can log one summary
//! instead of many scattered lines.

use std::sync::Arc;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::capability::Capability;
use crate::model::{Fact, Message, Pattern, Trigger};
use crate::tiers::{FactTier, PatternTier};

const GENERIC_PROCEDURAL_CUES: &[&str] = &["every time", "whenever", "always", "from now on"];

/// Tallies what a single background consolidation pass did, for a single
/// summary log line rather than one line per sub-step.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsolidationRun {
    pub facts_stored: u32,
    pub pattern_detected: bool,
    pub extraction_failed: bool,
    pub detection_failed: bool,
}

#[derive(Debug, Deserialize)]
struct PatternProposal {
    name: String,
    description: String,
    triggers: Vec<ProposedTrigger>,
    instruction_template: String,
}

#[derive(Debug, Deserialize)]
struct ProposedTrigger {
    kind: String,
    pattern: String,
}

fn validate_proposal(raw: &str) -> Option<PatternProposal> {
    let proposal: PatternProposal = serde_json::from_str(raw).ok()?;
    if proposal.name.trim().is_empty()
        || proposal.description.trim().is_empty()
        || proposal.instruction_template.trim().is_empty()
        || proposal.triggers.is_empty()
    {
        return None;
    }
    Some(proposal)
}

/// Run the full background consolidation pass for one freshly-stored
/// message: extract entities into T2 facts, and if the message looks like
/// a behavioral instruction, detect and upsert a pattern into TP.
///
/// Every fallible step is caught and folded into the returned
/// [`ConsolidationRun`] rather than propagated - a detection failure must
/// never affect the foreground store call that already returned.
pub async fn consolidate_message(
    facts: Arc<dyn FactTier>,
    patterns: Arc<dyn PatternTier>,
    capability: Arc<dyn Capability>,
    message: Message,
    cancel: CancellationToken,
) -> ConsolidationRun {
    let mut run = ConsolidationRun::default();

    match extract_and_store_facts(&facts, &capability, &message, &cancel).await {
        Ok(count) => run.facts_stored = count,
        Err(error) => {
            warn!(error = %error, "entity extraction failed during consolidation");
            run.extraction_failed = true;
        }
    }

    if GENERIC_PROCEDURAL_CUES.iter().any(|cue| message.content.to_lowercase().contains(cue)) {
        match detect_and_store_pattern(&patterns, &capability, &message, &cancel).await {
            Ok(detected) => run.pattern_detected = detected,
            Err(error) => {
                warn!(error = %error, "pattern detection failed during consolidation");
                run.detection_failed = true;
            }
        }
    }

    debug!(
        facts_stored = run.facts_stored,
        pattern_detected = run.pattern_detected,
        "consolidation pass complete"
    );
    run
}

async fn extract_and_store_facts(
    facts: &Arc<dyn FactTier>,
    capability: &Arc<dyn Capability>,
    message: &Message,
    cancel: &CancellationToken,
) -> crate::error::Result<u32> {
    let entities = capability.extract_entities(&message.content, cancel).await?;
    if entities.is_empty() {
        return Ok(0);
    }

    let mut built = Vec::with_capacity(entities.len());
    for entity in entities {
        let fact = Fact::new(
            &message.user_id,
            &message.conversation_id,
            &entity.key,
            &entity.value,
            entity.entity_type,
            entity.importance,
            entity.embedding,
        )?;
        built.push(fact);
    }
    let count = built.len() as u32;
    facts
        .store_facts(&message.user_id, &message.conversation_id, built, cancel)
        .await?;
    Ok(count)
}

async fn detect_and_store_pattern(
    patterns: &Arc<dyn PatternTier>,
    capability: &Arc<dyn Capability>,
    message: &Message,
    cancel: &CancellationToken,
) -> crate::error::Result<bool> {
    let prompt = format!(
        "Propose a reusable behavioral pattern as JSON {{name, description, triggers, instruction_template}} \
         for this instruction: {}",
        message.content
    );
    let raw = capability.complete(&prompt, 512, cancel).await?;

    let Some(proposal) = validate_proposal(&raw) else {
        debug!("pattern proposal failed schema validation, treating as no result");
        return Ok(false);
    };

    let mut triggers = Vec::with_capacity(proposal.triggers.len());
    for proposed in proposal.triggers {
        let trigger = match proposed.kind.as_str() {
            "keyword" => Trigger::keyword(proposed.pattern),
            "regex" => Trigger::regex(proposed.pattern),
            "semantic" => {
                let embedding = capability.embed(&proposed.pattern, cancel).await?;
                Trigger::semantic(proposed.pattern, embedding)
            }
            _ => continue,
        };
        triggers.push(trigger);
    }
    if triggers.is_empty() {
        return Ok(false);
    }

    let pattern: Pattern = Pattern::new(
        &message.user_id,
        proposal.name,
        proposal.description,
        triggers,
        proposal.instruction_template,
        0.80,
    )?;
    patterns.upsert(pattern, cancel).await?;
    Ok(true)
}

/// Thin wrapper over `TP.consolidate`, exposed here so the orchestrator's
/// periodic sweep has a single entry point for both detection and merge
/// work without reaching into the tier module directly.
pub async fn consolidate_patterns(patterns: Arc<dyn PatternTier>, user: &str, cancel: &CancellationToken) -> crate::error::Result<usize> {
    patterns.consolidate(user, cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::MockCapability;
    use crate::model::Role;
    use crate::tiers::{InMemoryFactStore, InMemoryPatternStore};

    fn message(content: &str) -> Message {
        Message::new("u1", "c1", Role::User, content).unwrap()
    }

    #[tokio::test]
    async fn consolidation_extracts_facts_from_declarative_content() {
        let facts: Arc<dyn FactTier> = Arc::new(InMemoryFactStore::new());
        let patterns: Arc<dyn PatternTier> = Arc::new(InMemoryPatternStore::new());
        let capability: Arc<dyn Capability> = Arc::new(MockCapability::new());
        let cancel = CancellationToken::new();

        let run = consolidate_message(
            facts.clone(),
            patterns,
            capability,
            message("the database is PostgreSQL"),
            cancel,
        )
        .await;

        assert!(run.facts_stored >= 1);
        assert!(!facts.is_empty_for_user("u1").await);
    }

    #[tokio::test]
    async fn consolidation_never_panics_on_unparseable_proposal() {
        let facts: Arc<dyn FactTier> = Arc::new(InMemoryFactStore::new());
        let patterns: Arc<dyn PatternTier> = Arc::new(InMemoryPatternStore::new());
        let capability: Arc<dyn Capability> = Arc::new(MockCapability::new());
        let cancel = CancellationToken::new();

        let run = consolidate_message(
            facts,
            patterns.clone(),
            capability,
            message("from now on always format responses as bullet points"),
            cancel,
        )
        .await;

        assert!(!run.detection_failed);
        assert!(patterns.is_empty_for_user("u1").await);
    }

    #[test]
    fn schema_validation_rejects_missing_fields() {
        assert!(validate_proposal(r#"{"name":"x"}"#).is_none());
        assert!(validate_proposal("not json").is_none());
    }

    #[test]
    fn schema_validation_accepts_well_formed_proposal() {
        let raw = r#"{"name":"n","description":"d","triggers":[{"kind":"keyword","pattern":"p"}],"instruction_template":"t"}"#;
        assert!(validate_proposal(raw).is_some());
    }
}
