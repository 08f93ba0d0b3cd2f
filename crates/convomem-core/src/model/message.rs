//! Message - the unit of conversational input.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use super::fact::EntityType;

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// An entity pulled out of a message's content during background
/// extraction. Promoted into a [`crate::model::Fact`] by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedEntity {
    pub key: String,
    pub value: String,
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub importance: f32,
    /// True the first time this (user, key, value) triple has been observed.
    pub is_novel: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

/// Metadata attached to a message. `importance`, `is_question`,
/// `contains_decision`, `contains_code`, and `tags` are set exactly once
/// by the orchestrator's scoring pass, before any tier write, via
/// [`Message::with_importance`] and [`Message::with_derived_metadata`].
/// `extracted_entities` stays at its default - nothing in this engine
/// currently writes it back onto the stored message.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    pub importance: f32,
    pub is_question: bool,
    pub contains_decision: bool,
    pub contains_code: bool,
    pub tags: BTreeSet<String>,
    pub extracted_entities: Vec<ExtractedEntity>,
}

/// A single conversational turn.
///
/// Immutable after construction except for the scoring-derived metadata
/// fields, which the orchestrator sets exactly once via
/// [`Message::with_importance`] and [`Message::with_derived_metadata`]
/// before any tier write. Both methods consume `self` and return a new
/// `Message` rather than mutating in place, so a `Message` handed to one
/// tier can be shared (by clone) with another without aliasing concerns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub user_id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: MessageMetadata,
}

impl Message {
    /// Construct a new message. Rejects empty `user_id`, `conversation_id`,
    /// or `content` at construction time rather than deferring the check
    /// to a later unwrap.
    pub fn new(
        user_id: impl Into<String>,
        conversation_id: impl Into<String>,
        role: Role,
        content: impl Into<String>,
    ) -> Result<Self> {
        let user_id = user_id.into();
        let conversation_id = conversation_id.into();
        let content = content.into();

        if user_id.trim().is_empty() {
            return Err(EngineError::Input("user_id must not be empty".into()));
        }
        if conversation_id.trim().is_empty() {
            return Err(EngineError::Input(
                "conversation_id must not be empty".into(),
            ));
        }
        if content.trim().is_empty() {
            return Err(EngineError::Input("content must not be empty".into()));
        }

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            user_id,
            conversation_id,
            role,
            content,
            timestamp: Utc::now(),
            metadata: MessageMetadata::default(),
        })
    }

    /// Copy-update the importance score. Consumes `self` so callers cannot
    /// accidentally hold a stale reference after the score is finalized.
    pub fn with_importance(mut self, importance: f32) -> Self {
        self.metadata.importance = importance.clamp(0.0, 1.0);
        self
    }

    /// Copy-update the scorer-derived booleans and tags (e.g. `first_message`,
    /// `early_conversation`). Consumes `self` for the same reason as
    /// [`Message::with_importance`].
    pub fn with_derived_metadata(
        mut self,
        is_question: bool,
        contains_decision: bool,
        contains_code: bool,
        tags: BTreeSet<String>,
    ) -> Self {
        self.metadata.is_question = is_question;
        self.metadata.contains_decision = contains_decision;
        self.metadata.contains_code = contains_code;
        self.metadata.tags = tags;
        self
    }
}
