// Persistence contract for the messaging platform.
//
// The trait mirrors the storage surface the ingestion pipeline and the
// automation engine actually consume; backends only have to honor the
// invariants (unique provider message ids, one non-terminal execution per
// conversation), not a specific schema.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use ondas_shared::{
    Campaign, Channel, Contact, Conversation, Message, MessageDirection, MessageStatus, Template,
    TemplateStatus, WebhookConfig,
};

use crate::automations::{AutomationDefinition, Execution};

mod postgres;

pub use postgres::PgStorage;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Self::NotFound("row".to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Self::Conflict(db.message().to_string())
            }
            _ => Self::Database(err.to_string()),
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Clone)]
pub struct NewContact {
    pub channel_id: Uuid,
    pub name: String,
    pub phone: String,
}

#[derive(Debug, Clone)]
pub struct NewConversation {
    pub channel_id: Uuid,
    pub contact_id: Uuid,
    pub contact_phone: String,
    pub contact_name: String,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: Uuid,
    pub whatsapp_message_id: Option<String>,
    pub direction: MessageDirection,
    pub content: String,
    pub message_type: String,
    pub metadata: Option<JsonValue>,
    pub media_id: Option<String>,
    pub media_url: Option<String>,
    pub media_mime_type: Option<String>,
    pub media_sha256: Option<String>,
    pub status: MessageStatus,
    pub campaign_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
}

impl NewMessage {
    /// An inbound message as recorded by the webhook pipeline.
    pub fn inbound(conversation_id: Uuid, whatsapp_message_id: &str, content: &str) -> Self {
        Self {
            conversation_id,
            whatsapp_message_id: Some(whatsapp_message_id.to_string()),
            direction: MessageDirection::Inbound,
            content: content.to_string(),
            message_type: "text".to_string(),
            metadata: None,
            media_id: None,
            media_url: None,
            media_mime_type: None,
            media_sha256: None,
            status: MessageStatus::Delivered,
            campaign_id: None,
            timestamp: Utc::now(),
        }
    }

    /// An outbound message dispatched through the gateway.
    pub fn outbound(conversation_id: Uuid, receipt_id: &str, content: &str) -> Self {
        Self {
            conversation_id,
            whatsapp_message_id: Some(receipt_id.to_string()),
            direction: MessageDirection::Outbound,
            content: content.to_string(),
            message_type: "text".to_string(),
            metadata: None,
            media_id: None,
            media_url: None,
            media_mime_type: None,
            media_sha256: None,
            status: MessageStatus::Sent,
            campaign_id: None,
            timestamp: Utc::now(),
        }
    }
}

/// Fields a status event is allowed to touch on a message row.
#[derive(Debug, Clone)]
pub struct MessageStatusPatch {
    pub status: MessageStatus,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub error_details: Option<JsonValue>,
}

/// Incremental change to a campaign's aggregate counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CampaignDelta {
    pub sent: i32,
    pub delivered: i32,
    pub read: i32,
    pub failed: i32,
}

impl CampaignDelta {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[async_trait]
pub trait Storage: Send + Sync {
    // Channels
    async fn get_channel_by_phone_number_id(
        &self,
        phone_number_id: &str,
    ) -> StorageResult<Option<Channel>>;

    // Contacts
    async fn get_contact_by_phone(
        &self,
        channel_id: Uuid,
        phone: &str,
    ) -> StorageResult<Option<Contact>>;
    async fn create_contact(&self, contact: NewContact) -> StorageResult<Contact>;

    // Conversations
    async fn get_conversation_by_phone(
        &self,
        channel_id: Uuid,
        phone: &str,
    ) -> StorageResult<Option<Conversation>>;
    async fn create_conversation(&self, conversation: NewConversation)
        -> StorageResult<Conversation>;
    /// Bump unread count and last-message preview on an inbound message.
    async fn record_inbound_activity(
        &self,
        conversation_id: Uuid,
        last_message_text: &str,
    ) -> StorageResult<()>;

    // Messages
    async fn create_message(&self, message: NewMessage) -> StorageResult<Message>;
    async fn get_message_by_whatsapp_id(
        &self,
        whatsapp_message_id: &str,
    ) -> StorageResult<Option<Message>>;
    async fn apply_message_status(
        &self,
        message_id: Uuid,
        patch: MessageStatusPatch,
    ) -> StorageResult<()>;

    // Campaigns
    async fn get_campaign(&self, id: Uuid) -> StorageResult<Option<Campaign>>;
    async fn apply_campaign_delta(&self, id: Uuid, delta: CampaignDelta) -> StorageResult<()>;

    // Templates
    async fn get_template_by_provider_id(
        &self,
        whatsapp_template_id: &str,
    ) -> StorageResult<Option<Template>>;
    async fn update_template_status(
        &self,
        id: Uuid,
        status: TemplateStatus,
        rejection_reason: Option<String>,
    ) -> StorageResult<()>;

    // Automation definitions
    /// Latest enabled version of every definition scoped to the channel.
    async fn list_enabled_automations(
        &self,
        channel_id: Uuid,
    ) -> StorageResult<Vec<AutomationDefinition>>;
    /// The exact version an in-flight execution was started against.
    async fn get_automation(
        &self,
        id: Uuid,
        version: i32,
    ) -> StorageResult<Option<AutomationDefinition>>;

    // Executions
    /// Fails with `Conflict` when the conversation already owns a
    /// non-terminal execution.
    async fn create_execution(&self, execution: &Execution) -> StorageResult<()>;
    async fn update_execution(&self, execution: &Execution) -> StorageResult<()>;
    async fn get_execution(&self, id: Uuid) -> StorageResult<Option<Execution>>;

    // Webhook configuration
    async fn get_active_webhook_config(&self) -> StorageResult<Option<WebhookConfig>>;
    async fn touch_webhook_config(&self, id: Uuid) -> StorageResult<()>;
}
