// Automation definitions and execution state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use super::steps::Step;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    NewConversation,
    Keyword,
    ButtonId,
    ListId,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewConversation => "new_conversation",
            Self::Keyword => "keyword",
            Self::ButtonId => "button_id",
            Self::ListId => "list_id",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new_conversation" => Some(Self::NewConversation),
            "keyword" => Some(Self::Keyword),
            "button_id" => Some(Self::ButtonId),
            "list_id" => Some(Self::ListId),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum KeywordMatchMode {
    Exact,
    #[default]
    Contains,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TriggerConfig {
    /// Keyword list for `keyword` triggers.
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub match_mode: KeywordMatchMode,
    /// Interactive reply id for `button_id` / `list_id` triggers.
    #[serde(default)]
    pub reply_id: Option<String>,
}

/// One immutable version of an automation.
///
/// Edits create a new (id, version) row; executions pin the version they
/// started with and keep running against it even after an edit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationDefinition {
    pub id: Uuid,
    pub version: i32,
    pub channel_id: Uuid,
    pub name: String,
    pub trigger_kind: TriggerKind,
    pub trigger_config: TriggerConfig,
    pub entry_step_id: String,
    pub steps: Vec<Step>,
    pub is_enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl AutomationDefinition {
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Waiting,
    Completed,
    Failed,
    Cancelled,
    Expired,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "waiting" => Some(Self::Waiting),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    /// Terminal executions are never mutated again; the conversation is free
    /// to host a new one.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Expired
        )
    }
}

/// One running instance of an automation bound to a conversation.
///
/// At most one non-terminal execution may own a conversation at any time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub automation_id: Uuid,
    pub automation_version: i32,
    pub conversation_id: Uuid,
    pub channel_id: Uuid,
    pub contact_id: Uuid,
    pub current_step_id: String,
    pub bindings: HashMap<String, String>,
    pub status: ExecutionStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_advanced_at: DateTime<Utc>,
    /// Set only while `waiting`.
    pub resume_deadline: Option<DateTime<Utc>>,
}

impl Execution {
    pub fn new(
        definition: &AutomationDefinition,
        conversation_id: Uuid,
        contact_id: Uuid,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            automation_id: definition.id,
            automation_version: definition.version,
            conversation_id,
            channel_id: definition.channel_id,
            contact_id,
            current_step_id: definition.entry_step_id.clone(),
            bindings: HashMap::new(),
            status: ExecutionStatus::Running,
            error: None,
            created_at: now,
            last_advanced_at: now,
            resume_deadline: None,
        }
    }
}
