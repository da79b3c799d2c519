// Shared test doubles: an in-memory Storage, a recording gateway and a
// recording notification sink, plus a fully wired platform for pipeline
// tests. Everything runs in-process; no database or network required.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use uuid::Uuid;

use ondas_shared::{
    Campaign, Channel, Contact, Conversation, Message, Template, TemplateStatus, WebhookConfig,
};

use crate::automations::{
    AutomationDefinition, Execution, ExecutionEngine, MemoryPendingStore, PendingExecutionStore,
};
use crate::config::AutomationConfig;
use crate::dispatch::Dispatcher;
use crate::notifications::{NotificationEvent, NotificationSink};
use crate::services::{GatewayError, MessagingGateway};
use crate::storage::{
    CampaignDelta, MessageStatusPatch, NewContact, NewConversation, NewMessage, Storage,
    StorageError, StorageResult,
};

// ============================================
// In-memory Storage
// ============================================

#[derive(Default)]
pub struct MemoryStorage {
    pub channels: RwLock<Vec<Channel>>,
    pub contacts: RwLock<Vec<Contact>>,
    pub conversations: RwLock<Vec<Conversation>>,
    pub messages: RwLock<Vec<Message>>,
    pub campaigns: RwLock<Vec<Campaign>>,
    pub templates: RwLock<Vec<Template>>,
    pub automations: RwLock<Vec<AutomationDefinition>>,
    pub executions: RwLock<Vec<Execution>>,
    pub webhook_configs: RwLock<Vec<WebhookConfig>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_channel(&self, channel: Channel) {
        self.channels.write().await.push(channel);
    }

    pub async fn add_campaign(&self, campaign: Campaign) {
        self.campaigns.write().await.push(campaign);
    }

    pub async fn add_template(&self, template: Template) {
        self.templates.write().await.push(template);
    }

    pub async fn add_automation(&self, definition: AutomationDefinition) {
        self.automations.write().await.push(definition);
    }

    pub async fn add_message(&self, message: Message) {
        self.messages.write().await.push(message);
    }

    pub async fn add_webhook_config(&self, config: WebhookConfig) {
        self.webhook_configs.write().await.push(config);
    }

    pub async fn executions_for(&self, conversation_id: Uuid) -> Vec<Execution> {
        self.executions
            .read()
            .await
            .iter()
            .filter(|e| e.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    pub async fn non_terminal_executions(&self, conversation_id: Uuid) -> usize {
        self.executions_for(conversation_id)
            .await
            .iter()
            .filter(|e| !e.status.is_terminal())
            .count()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get_channel_by_phone_number_id(
        &self,
        phone_number_id: &str,
    ) -> StorageResult<Option<Channel>> {
        Ok(self
            .channels
            .read()
            .await
            .iter()
            .find(|c| c.phone_number_id == phone_number_id && c.is_active)
            .cloned())
    }

    async fn get_contact_by_phone(
        &self,
        channel_id: Uuid,
        phone: &str,
    ) -> StorageResult<Option<Contact>> {
        Ok(self
            .contacts
            .read()
            .await
            .iter()
            .find(|c| c.channel_id == channel_id && c.phone == phone)
            .cloned())
    }

    async fn create_contact(&self, contact: NewContact) -> StorageResult<Contact> {
        let created = Contact {
            id: Uuid::new_v4(),
            channel_id: contact.channel_id,
            name: contact.name,
            phone: contact.phone,
            created_at: Utc::now(),
        };
        self.contacts.write().await.push(created.clone());
        Ok(created)
    }

    async fn get_conversation_by_phone(
        &self,
        channel_id: Uuid,
        phone: &str,
    ) -> StorageResult<Option<Conversation>> {
        Ok(self
            .conversations
            .read()
            .await
            .iter()
            .find(|c| c.channel_id == channel_id && c.contact_phone == phone)
            .cloned())
    }

    async fn create_conversation(
        &self,
        conversation: NewConversation,
    ) -> StorageResult<Conversation> {
        let created = Conversation {
            id: Uuid::new_v4(),
            channel_id: conversation.channel_id,
            contact_id: conversation.contact_id,
            contact_phone: conversation.contact_phone,
            contact_name: conversation.contact_name,
            unread_count: 1,
            last_message_text: None,
            last_message_at: None,
            created_at: Utc::now(),
        };
        self.conversations.write().await.push(created.clone());
        Ok(created)
    }

    async fn record_inbound_activity(
        &self,
        conversation_id: Uuid,
        last_message_text: &str,
    ) -> StorageResult<()> {
        let mut conversations = self.conversations.write().await;
        if let Some(conversation) = conversations.iter_mut().find(|c| c.id == conversation_id) {
            conversation.unread_count += 1;
            conversation.last_message_text = Some(last_message_text.to_string());
            conversation.last_message_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn create_message(&self, message: NewMessage) -> StorageResult<Message> {
        let created = Message {
            id: Uuid::new_v4(),
            conversation_id: message.conversation_id,
            whatsapp_message_id: message.whatsapp_message_id,
            direction: message.direction,
            content: message.content,
            message_type: message.message_type,
            metadata: message.metadata,
            media_id: message.media_id,
            media_url: message.media_url,
            media_mime_type: message.media_mime_type,
            media_sha256: message.media_sha256,
            status: message.status,
            campaign_id: message.campaign_id,
            error_details: None,
            delivered_at: None,
            read_at: None,
            timestamp: message.timestamp,
            created_at: Utc::now(),
        };
        self.messages.write().await.push(created.clone());
        Ok(created)
    }

    async fn get_message_by_whatsapp_id(
        &self,
        whatsapp_message_id: &str,
    ) -> StorageResult<Option<Message>> {
        Ok(self
            .messages
            .read()
            .await
            .iter()
            .find(|m| m.whatsapp_message_id.as_deref() == Some(whatsapp_message_id))
            .cloned())
    }

    async fn apply_message_status(
        &self,
        message_id: Uuid,
        patch: MessageStatusPatch,
    ) -> StorageResult<()> {
        let mut messages = self.messages.write().await;
        if let Some(message) = messages.iter_mut().find(|m| m.id == message_id) {
            message.status = patch.status;
            if patch.delivered_at.is_some() {
                message.delivered_at = patch.delivered_at;
            }
            if patch.read_at.is_some() {
                message.read_at = patch.read_at;
            }
            if patch.error_details.is_some() {
                message.error_details = patch.error_details;
            }
        }
        Ok(())
    }

    async fn get_campaign(&self, id: Uuid) -> StorageResult<Option<Campaign>> {
        Ok(self.campaigns.read().await.iter().find(|c| c.id == id).cloned())
    }

    async fn apply_campaign_delta(&self, id: Uuid, delta: CampaignDelta) -> StorageResult<()> {
        let mut campaigns = self.campaigns.write().await;
        if let Some(campaign) = campaigns.iter_mut().find(|c| c.id == id) {
            campaign.sent_count = (campaign.sent_count + delta.sent).max(0);
            campaign.delivered_count = (campaign.delivered_count + delta.delivered).max(0);
            campaign.read_count = (campaign.read_count + delta.read).max(0);
            campaign.failed_count = (campaign.failed_count + delta.failed).max(0);
        }
        Ok(())
    }

    async fn get_template_by_provider_id(
        &self,
        whatsapp_template_id: &str,
    ) -> StorageResult<Option<Template>> {
        Ok(self
            .templates
            .read()
            .await
            .iter()
            .find(|t| t.whatsapp_template_id.as_deref() == Some(whatsapp_template_id))
            .cloned())
    }

    async fn update_template_status(
        &self,
        id: Uuid,
        status: TemplateStatus,
        rejection_reason: Option<String>,
    ) -> StorageResult<()> {
        let mut templates = self.templates.write().await;
        if let Some(template) = templates.iter_mut().find(|t| t.id == id) {
            template.status = status;
            template.rejection_reason = rejection_reason;
        }
        Ok(())
    }

    async fn list_enabled_automations(
        &self,
        channel_id: Uuid,
    ) -> StorageResult<Vec<AutomationDefinition>> {
        let automations = self.automations.read().await;
        let mut latest: Vec<AutomationDefinition> = Vec::new();
        for definition in automations
            .iter()
            .filter(|d| d.channel_id == channel_id && d.is_enabled)
        {
            match latest.iter_mut().find(|d| d.id == definition.id) {
                Some(existing) if existing.version < definition.version => {
                    *existing = definition.clone();
                }
                Some(_) => {}
                None => latest.push(definition.clone()),
            }
        }
        Ok(latest)
    }

    async fn get_automation(
        &self,
        id: Uuid,
        version: i32,
    ) -> StorageResult<Option<AutomationDefinition>> {
        Ok(self
            .automations
            .read()
            .await
            .iter()
            .find(|d| d.id == id && d.version == version)
            .cloned())
    }

    async fn create_execution(&self, execution: &Execution) -> StorageResult<()> {
        // The write lock is held across the ownership check and the insert,
        // mirroring the partial unique index in Postgres.
        let mut executions = self.executions.write().await;
        let owned = executions
            .iter()
            .any(|e| e.conversation_id == execution.conversation_id && !e.status.is_terminal());
        if owned {
            return Err(StorageError::Conflict(
                "conversation already owns a non-terminal execution".to_string(),
            ));
        }
        executions.push(execution.clone());
        Ok(())
    }

    async fn update_execution(&self, execution: &Execution) -> StorageResult<()> {
        let mut executions = self.executions.write().await;
        if let Some(existing) = executions.iter_mut().find(|e| e.id == execution.id) {
            *existing = execution.clone();
        }
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> StorageResult<Option<Execution>> {
        Ok(self.executions.read().await.iter().find(|e| e.id == id).cloned())
    }

    async fn get_active_webhook_config(&self) -> StorageResult<Option<WebhookConfig>> {
        Ok(self
            .webhook_configs
            .read()
            .await
            .iter()
            .find(|c| c.is_active)
            .cloned())
    }

    async fn touch_webhook_config(&self, id: Uuid) -> StorageResult<()> {
        let mut configs = self.webhook_configs.write().await;
        if let Some(config) = configs.iter_mut().find(|c| c.id == id) {
            config.last_ping_at = Some(Utc::now());
        }
        Ok(())
    }
}

// ============================================
// Recording gateway
// ============================================

#[derive(Debug, Clone)]
pub struct SentMessage {
    pub to: String,
    pub content: String,
    pub template_name: Option<String>,
}

#[derive(Default)]
pub struct RecordingGateway {
    pub sent: Mutex<Vec<SentMessage>>,
    pub fail_sends: AtomicBool,
    counter: AtomicU64,
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_sends(&self) {
        self.fail_sends.store(true, Ordering::SeqCst);
    }

    pub fn sent_messages(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }

    fn next_receipt(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        format!("wamid.test.{}", n)
    }
}

#[async_trait]
impl MessagingGateway for RecordingGateway {
    async fn send_message(
        &self,
        _channel: &Channel,
        to: &str,
        content: &str,
    ) -> Result<String, GatewayError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(GatewayError::Api {
                status: 500,
                body: "simulated provider outage".to_string(),
            });
        }
        self.sent.lock().unwrap().push(SentMessage {
            to: to.to_string(),
            content: content.to_string(),
            template_name: None,
        });
        Ok(self.next_receipt())
    }

    async fn send_template(
        &self,
        _channel: &Channel,
        to: &str,
        template_name: &str,
        variables: &[String],
    ) -> Result<String, GatewayError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(GatewayError::Api {
                status: 500,
                body: "simulated provider outage".to_string(),
            });
        }
        self.sent.lock().unwrap().push(SentMessage {
            to: to.to_string(),
            content: variables.join(", "),
            template_name: Some(template_name.to_string()),
        });
        Ok(self.next_receipt())
    }

    async fn fetch_media_url(
        &self,
        _channel: &Channel,
        media_id: &str,
    ) -> Result<String, GatewayError> {
        Ok(format!("https://media.test/{}", media_id))
    }
}

// ============================================
// Recording notification sink
// ============================================

#[derive(Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<NotificationEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_types(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(|e| e.event_type()).collect()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn publish(&self, event: NotificationEvent) {
        self.events.lock().unwrap().push(event);
    }
}

// ============================================
// Wired-up platform
// ============================================

pub struct TestPlatform {
    pub storage: Arc<MemoryStorage>,
    pub pending: Arc<MemoryPendingStore>,
    pub gateway: Arc<RecordingGateway>,
    pub sink: Arc<RecordingSink>,
    pub engine: Arc<ExecutionEngine>,
    pub dispatcher: Arc<Dispatcher>,
    pub channel: Channel,
}

pub fn test_channel() -> Channel {
    Channel {
        id: Uuid::new_v4(),
        name: "Main Channel".to_string(),
        phone_number_id: "550123456789".to_string(),
        display_phone_number: Some("+1 555 055 5555".to_string()),
        access_token: "test-access-token".to_string(),
        is_active: true,
        created_at: Utc::now(),
    }
}

impl TestPlatform {
    pub async fn new() -> Self {
        Self::with_config(AutomationConfig {
            default_reply_timeout_minutes: 30,
            sweep_interval_minutes: 5,
        })
        .await
    }

    pub async fn with_config(config: AutomationConfig) -> Self {
        let storage = Arc::new(MemoryStorage::new());
        let pending = Arc::new(MemoryPendingStore::new());
        let gateway = Arc::new(RecordingGateway::new());
        let sink = Arc::new(RecordingSink::new());

        let channel = test_channel();
        storage.add_channel(channel.clone()).await;

        let storage_dyn: Arc<dyn Storage> = storage.clone();
        let pending_dyn: Arc<dyn PendingExecutionStore> = pending.clone();
        let gateway_dyn: Arc<dyn MessagingGateway> = gateway.clone();
        let sink_dyn: Arc<dyn NotificationSink> = sink.clone();

        let engine = Arc::new(ExecutionEngine::new(
            storage_dyn.clone(),
            gateway_dyn.clone(),
            pending_dyn.clone(),
            sink_dyn.clone(),
            config,
        ));

        let dispatcher = Arc::new(Dispatcher::new(
            storage_dyn,
            gateway_dyn,
            engine.clone(),
            pending_dyn,
            sink_dyn,
        ));

        Self {
            storage,
            pending,
            gateway,
            sink,
            engine,
            dispatcher,
            channel,
        }
    }

    /// Push a raw provider payload through parse -> normalize -> dispatch,
    /// exactly like the webhook handler does.
    pub async fn deliver(&self, payload: serde_json::Value) {
        let body = serde_json::to_vec(&payload).unwrap();
        let parsed = crate::events::parse_payload(&body).expect("fixture payload must parse");
        let events = crate::events::normalize(&parsed);
        self.dispatcher.dispatch(events).await;
    }

    /// Seed a contact + conversation so message events hit the existing-
    /// conversation path (keyword triggers, resumes).
    pub async fn seed_conversation(&self, phone: &str) -> Conversation {
        let contact = self
            .storage
            .create_contact(NewContact {
                channel_id: self.channel.id,
                name: format!("Contact {}", phone),
                phone: phone.to_string(),
            })
            .await
            .unwrap();
        self.storage
            .create_conversation(NewConversation {
                channel_id: self.channel.id,
                contact_id: contact.id,
                contact_phone: contact.phone.clone(),
                contact_name: contact.name.clone(),
            })
            .await
            .unwrap()
    }

    pub async fn message_count(&self) -> usize {
        self.storage.messages.read().await.len()
    }
}
