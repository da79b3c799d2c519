// Automation Trigger Resolver
//
// Decides whether an inbound event starts a new execution and which
// definition applies. Never consulted while the conversation has a pending
// execution; the dispatcher checks that first.

use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::definition::{AutomationDefinition, KeywordMatchMode, TriggerKind};
use crate::events::{ReplyData, ReplyKind};
use crate::storage::{Storage, StorageResult};

/// The message-shaped half of a trigger decision.
#[derive(Debug, Clone, Default)]
pub struct TriggerInput {
    pub text: String,
    pub reply: Option<ReplyData>,
}

impl TriggerInput {
    pub fn text(text: &str) -> Self {
        Self {
            text: text.to_string(),
            reply: None,
        }
    }

    pub fn interactive(text: &str, reply: ReplyData) -> Self {
        Self {
            text: text.to_string(),
            reply: Some(reply),
        }
    }
}

pub struct TriggerResolver {
    storage: Arc<dyn Storage>,
}

impl TriggerResolver {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Definition to run when a conversation is first created, if any.
    pub async fn resolve_new_conversation(
        &self,
        channel_id: Uuid,
    ) -> StorageResult<Option<AutomationDefinition>> {
        let definitions = self.storage.list_enabled_automations(channel_id).await?;
        Ok(pick_latest(definitions.into_iter().filter(|d| {
            d.trigger_kind == TriggerKind::NewConversation
        })))
    }

    /// Definition matching an inbound message or interactive reply, if any.
    pub async fn resolve_message(
        &self,
        channel_id: Uuid,
        input: &TriggerInput,
    ) -> StorageResult<Option<AutomationDefinition>> {
        let definitions = self.storage.list_enabled_automations(channel_id).await?;
        let matched = pick_latest(
            definitions
                .into_iter()
                .filter(|d| matches_message(d, input)),
        );
        if matched.is_none() {
            debug!(channel_id = %channel_id, "no automation matched; plain inbox message");
        }
        Ok(matched)
    }
}

/// When several definitions match, the most recently created one wins. The
/// deterministic tie-break keeps a double-configured keyword from firing two
/// executions.
fn pick_latest(
    candidates: impl Iterator<Item = AutomationDefinition>,
) -> Option<AutomationDefinition> {
    candidates.max_by_key(|d| d.created_at)
}

fn matches_message(definition: &AutomationDefinition, input: &TriggerInput) -> bool {
    match definition.trigger_kind {
        TriggerKind::NewConversation => false,
        TriggerKind::Keyword => keyword_matches(definition, &input.text),
        TriggerKind::ButtonId => reply_id_matches(definition, input, ReplyKind::Button),
        TriggerKind::ListId => reply_id_matches(definition, input, ReplyKind::List),
    }
}

fn keyword_matches(definition: &AutomationDefinition, text: &str) -> bool {
    let text = text.trim();
    if text.is_empty() {
        return false;
    }
    let lowered = text.to_lowercase();
    definition.trigger_config.keywords.iter().any(|keyword| {
        let keyword = keyword.trim();
        if keyword.is_empty() {
            return false;
        }
        match definition.trigger_config.match_mode {
            KeywordMatchMode::Exact => lowered == keyword.to_lowercase(),
            KeywordMatchMode::Contains => lowered.contains(&keyword.to_lowercase()),
        }
    })
}

fn reply_id_matches(
    definition: &AutomationDefinition,
    input: &TriggerInput,
    expected_kind: ReplyKind,
) -> bool {
    let Some(reply) = &input.reply else {
        return false;
    };
    if reply.kind != expected_kind {
        return false;
    }
    definition
        .trigger_config
        .reply_id
        .as_deref()
        .map(|id| id == reply.id)
        .unwrap_or(false)
}
