// Postgres-backed storage.
//
// Queries are runtime-bound (no compile-time checked macros) so the crate
// builds without a live database. Enum columns are stored as text and go
// through the shared parse/as_str helpers; step graphs, bindings and
// interactive metadata live in jsonb columns.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use ondas_shared::{
    Campaign, Channel, Contact, Conversation, Message, MessageDirection, MessageStatus, Template,
    TemplateStatus, WebhookConfig,
};

use crate::automations::{
    AutomationDefinition, Execution, ExecutionStatus, TriggerConfig, TriggerKind,
};

use super::{
    CampaignDelta, MessageStatusPatch, NewContact, NewConversation, NewMessage, Storage,
    StorageError, StorageResult,
};

pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn parse_column<T>(value: Option<T>, what: &str) -> StorageResult<T> {
    value.ok_or_else(|| StorageError::Database(format!("unparseable {} column", what)))
}

fn message_from_row(row: &PgRow) -> StorageResult<Message> {
    let direction: String = row.try_get("direction").map_err(StorageError::from)?;
    let status: String = row.try_get("status").map_err(StorageError::from)?;
    Ok(Message {
        id: row.try_get("id").map_err(StorageError::from)?,
        conversation_id: row.try_get("conversation_id").map_err(StorageError::from)?,
        whatsapp_message_id: row
            .try_get("whatsapp_message_id")
            .map_err(StorageError::from)?,
        direction: parse_column(MessageDirection::parse(&direction), "direction")?,
        content: row.try_get("content").map_err(StorageError::from)?,
        message_type: row.try_get("message_type").map_err(StorageError::from)?,
        metadata: row.try_get("metadata").map_err(StorageError::from)?,
        media_id: row.try_get("media_id").map_err(StorageError::from)?,
        media_url: row.try_get("media_url").map_err(StorageError::from)?,
        media_mime_type: row.try_get("media_mime_type").map_err(StorageError::from)?,
        media_sha256: row.try_get("media_sha256").map_err(StorageError::from)?,
        status: parse_column(MessageStatus::parse(&status), "status")?,
        campaign_id: row.try_get("campaign_id").map_err(StorageError::from)?,
        error_details: row.try_get("error_details").map_err(StorageError::from)?,
        delivered_at: row.try_get("delivered_at").map_err(StorageError::from)?,
        read_at: row.try_get("read_at").map_err(StorageError::from)?,
        timestamp: row.try_get("timestamp").map_err(StorageError::from)?,
        created_at: row.try_get("created_at").map_err(StorageError::from)?,
    })
}

fn definition_from_row(row: &PgRow) -> StorageResult<AutomationDefinition> {
    let trigger_kind: String = row.try_get("trigger_kind").map_err(StorageError::from)?;
    let trigger_config: JsonValue = row.try_get("trigger_config").map_err(StorageError::from)?;
    let steps: JsonValue = row.try_get("steps").map_err(StorageError::from)?;
    Ok(AutomationDefinition {
        id: row.try_get("id").map_err(StorageError::from)?,
        version: row.try_get("version").map_err(StorageError::from)?,
        channel_id: row.try_get("channel_id").map_err(StorageError::from)?,
        name: row.try_get("name").map_err(StorageError::from)?,
        trigger_kind: parse_column(TriggerKind::parse(&trigger_kind), "trigger_kind")?,
        trigger_config: serde_json::from_value::<TriggerConfig>(trigger_config)
            .map_err(|e| StorageError::Database(format!("corrupt trigger_config: {}", e)))?,
        entry_step_id: row.try_get("entry_step_id").map_err(StorageError::from)?,
        steps: serde_json::from_value(steps)
            .map_err(|e| StorageError::Database(format!("corrupt steps: {}", e)))?,
        is_enabled: row.try_get("is_enabled").map_err(StorageError::from)?,
        created_at: row.try_get("created_at").map_err(StorageError::from)?,
    })
}

fn execution_from_row(row: &PgRow) -> StorageResult<Execution> {
    let status: String = row.try_get("status").map_err(StorageError::from)?;
    let bindings: JsonValue = row.try_get("bindings").map_err(StorageError::from)?;
    Ok(Execution {
        id: row.try_get("id").map_err(StorageError::from)?,
        automation_id: row.try_get("automation_id").map_err(StorageError::from)?,
        automation_version: row
            .try_get("automation_version")
            .map_err(StorageError::from)?,
        conversation_id: row.try_get("conversation_id").map_err(StorageError::from)?,
        channel_id: row.try_get("channel_id").map_err(StorageError::from)?,
        contact_id: row.try_get("contact_id").map_err(StorageError::from)?,
        current_step_id: row.try_get("current_step_id").map_err(StorageError::from)?,
        bindings: serde_json::from_value(bindings)
            .map_err(|e| StorageError::Database(format!("corrupt bindings: {}", e)))?,
        status: parse_column(ExecutionStatus::parse(&status), "status")?,
        error: row.try_get("error").map_err(StorageError::from)?,
        created_at: row.try_get("created_at").map_err(StorageError::from)?,
        last_advanced_at: row.try_get("last_advanced_at").map_err(StorageError::from)?,
        resume_deadline: row.try_get("resume_deadline").map_err(StorageError::from)?,
    })
}

#[async_trait]
impl Storage for PgStorage {
    async fn get_channel_by_phone_number_id(
        &self,
        phone_number_id: &str,
    ) -> StorageResult<Option<Channel>> {
        let channel = sqlx::query_as::<_, Channel>(
            "SELECT * FROM channels WHERE phone_number_id = $1 AND is_active = true",
        )
        .bind(phone_number_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(channel)
    }

    async fn get_contact_by_phone(
        &self,
        channel_id: Uuid,
        phone: &str,
    ) -> StorageResult<Option<Contact>> {
        let contact = sqlx::query_as::<_, Contact>(
            "SELECT * FROM contacts WHERE channel_id = $1 AND phone = $2",
        )
        .bind(channel_id)
        .bind(phone)
        .fetch_optional(&self.pool)
        .await?;
        Ok(contact)
    }

    async fn create_contact(&self, contact: NewContact) -> StorageResult<Contact> {
        let created = sqlx::query_as::<_, Contact>(
            r#"
            INSERT INTO contacts (id, channel_id, name, phone, created_at)
            VALUES ($1, $2, $3, $4, NOW())
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(contact.channel_id)
        .bind(&contact.name)
        .bind(&contact.phone)
        .fetch_one(&self.pool)
        .await?;
        Ok(created)
    }

    async fn get_conversation_by_phone(
        &self,
        channel_id: Uuid,
        phone: &str,
    ) -> StorageResult<Option<Conversation>> {
        let conversation = sqlx::query_as::<_, Conversation>(
            "SELECT * FROM conversations WHERE channel_id = $1 AND contact_phone = $2",
        )
        .bind(channel_id)
        .bind(phone)
        .fetch_optional(&self.pool)
        .await?;
        Ok(conversation)
    }

    async fn create_conversation(
        &self,
        conversation: NewConversation,
    ) -> StorageResult<Conversation> {
        let created = sqlx::query_as::<_, Conversation>(
            r#"
            INSERT INTO conversations
                (id, channel_id, contact_id, contact_phone, contact_name, unread_count, created_at)
            VALUES ($1, $2, $3, $4, $5, 1, NOW())
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(conversation.channel_id)
        .bind(conversation.contact_id)
        .bind(&conversation.contact_phone)
        .bind(&conversation.contact_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(created)
    }

    async fn record_inbound_activity(
        &self,
        conversation_id: Uuid,
        last_message_text: &str,
    ) -> StorageResult<()> {
        sqlx::query(
            r#"
            UPDATE conversations
            SET unread_count = unread_count + 1,
                last_message_text = $2,
                last_message_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(conversation_id)
        .bind(last_message_text)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_message(&self, message: NewMessage) -> StorageResult<Message> {
        let row = sqlx::query(
            r#"
            INSERT INTO messages
                (id, conversation_id, whatsapp_message_id, direction, content, message_type,
                 metadata, media_id, media_url, media_mime_type, media_sha256,
                 status, campaign_id, timestamp, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, NOW())
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(message.conversation_id)
        .bind(&message.whatsapp_message_id)
        .bind(message.direction.as_str())
        .bind(&message.content)
        .bind(&message.message_type)
        .bind(&message.metadata)
        .bind(&message.media_id)
        .bind(&message.media_url)
        .bind(&message.media_mime_type)
        .bind(&message.media_sha256)
        .bind(message.status.as_str())
        .bind(message.campaign_id)
        .bind(message.timestamp)
        .fetch_one(&self.pool)
        .await?;
        message_from_row(&row)
    }

    async fn get_message_by_whatsapp_id(
        &self,
        whatsapp_message_id: &str,
    ) -> StorageResult<Option<Message>> {
        let row = sqlx::query("SELECT * FROM messages WHERE whatsapp_message_id = $1")
            .bind(whatsapp_message_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    async fn apply_message_status(
        &self,
        message_id: Uuid,
        patch: MessageStatusPatch,
    ) -> StorageResult<()> {
        sqlx::query(
            r#"
            UPDATE messages
            SET status = $2,
                delivered_at = COALESCE($3, delivered_at),
                read_at = COALESCE($4, read_at),
                error_details = COALESCE($5, error_details)
            WHERE id = $1
            "#,
        )
        .bind(message_id)
        .bind(patch.status.as_str())
        .bind(patch.delivered_at)
        .bind(patch.read_at)
        .bind(&patch.error_details)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_campaign(&self, id: Uuid) -> StorageResult<Option<Campaign>> {
        let campaign = sqlx::query_as::<_, Campaign>("SELECT * FROM campaigns WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(campaign)
    }

    async fn apply_campaign_delta(&self, id: Uuid, delta: CampaignDelta) -> StorageResult<()> {
        sqlx::query(
            r#"
            UPDATE campaigns
            SET sent_count = GREATEST(0, sent_count + $2),
                delivered_count = GREATEST(0, delivered_count + $3),
                read_count = GREATEST(0, read_count + $4),
                failed_count = GREATEST(0, failed_count + $5)
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(delta.sent)
        .bind(delta.delivered)
        .bind(delta.read)
        .bind(delta.failed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_template_by_provider_id(
        &self,
        whatsapp_template_id: &str,
    ) -> StorageResult<Option<Template>> {
        let row = sqlx::query("SELECT * FROM templates WHERE whatsapp_template_id = $1")
            .bind(whatsapp_template_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            let status: String = row.try_get("status").map_err(StorageError::from)?;
            Ok(Template {
                id: row.try_get("id").map_err(StorageError::from)?,
                channel_id: row.try_get("channel_id").map_err(StorageError::from)?,
                name: row.try_get("name").map_err(StorageError::from)?,
                whatsapp_template_id: row
                    .try_get("whatsapp_template_id")
                    .map_err(StorageError::from)?,
                status: parse_column(TemplateStatus::parse(&status), "status")?,
                rejection_reason: row.try_get("rejection_reason").map_err(StorageError::from)?,
                created_at: row.try_get("created_at").map_err(StorageError::from)?,
            })
        })
        .transpose()
    }

    async fn update_template_status(
        &self,
        id: Uuid,
        status: TemplateStatus,
        rejection_reason: Option<String>,
    ) -> StorageResult<()> {
        sqlx::query("UPDATE templates SET status = $2, rejection_reason = $3 WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .bind(rejection_reason)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_enabled_automations(
        &self,
        channel_id: Uuid,
    ) -> StorageResult<Vec<AutomationDefinition>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT ON (id) *
            FROM automation_definitions
            WHERE channel_id = $1 AND is_enabled = true
            ORDER BY id, version DESC
            "#,
        )
        .bind(channel_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(definition_from_row).collect()
    }

    async fn get_automation(
        &self,
        id: Uuid,
        version: i32,
    ) -> StorageResult<Option<AutomationDefinition>> {
        let row = sqlx::query("SELECT * FROM automation_definitions WHERE id = $1 AND version = $2")
            .bind(id)
            .bind(version)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(definition_from_row).transpose()
    }

    async fn create_execution(&self, execution: &Execution) -> StorageResult<()> {
        let bindings = serde_json::to_value(&execution.bindings)
            .map_err(|e| StorageError::Database(e.to_string()))?;
        // The partial unique index on conversation_id (non-terminal statuses)
        // turns a concurrent double-start into a Conflict here.
        sqlx::query(
            r#"
            INSERT INTO executions
                (id, automation_id, automation_version, conversation_id, channel_id, contact_id,
                 current_step_id, bindings, status, error, created_at, last_advanced_at, resume_deadline)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(execution.id)
        .bind(execution.automation_id)
        .bind(execution.automation_version)
        .bind(execution.conversation_id)
        .bind(execution.channel_id)
        .bind(execution.contact_id)
        .bind(&execution.current_step_id)
        .bind(bindings)
        .bind(execution.status.as_str())
        .bind(&execution.error)
        .bind(execution.created_at)
        .bind(execution.last_advanced_at)
        .bind(execution.resume_deadline)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_execution(&self, execution: &Execution) -> StorageResult<()> {
        let bindings = serde_json::to_value(&execution.bindings)
            .map_err(|e| StorageError::Database(e.to_string()))?;
        sqlx::query(
            r#"
            UPDATE executions
            SET current_step_id = $2, bindings = $3, status = $4, error = $5,
                last_advanced_at = $6, resume_deadline = $7
            WHERE id = $1
            "#,
        )
        .bind(execution.id)
        .bind(&execution.current_step_id)
        .bind(bindings)
        .bind(execution.status.as_str())
        .bind(&execution.error)
        .bind(execution.last_advanced_at)
        .bind(execution.resume_deadline)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> StorageResult<Option<Execution>> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(execution_from_row).transpose()
    }

    async fn get_active_webhook_config(&self) -> StorageResult<Option<WebhookConfig>> {
        let config = sqlx::query_as::<_, WebhookConfig>(
            "SELECT * FROM webhook_configs WHERE is_active = true ORDER BY created_at DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(config)
    }

    async fn touch_webhook_config(&self, id: Uuid) -> StorageResult<()> {
        sqlx::query("UPDATE webhook_configs SET last_ping_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
