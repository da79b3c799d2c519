// Dispatcher
//
// Top-level coordinator for normalized webhook events. Inbound messages are
// recorded first (contact/conversation upsert, message row, broadcast), then
// handed to the automation layer: a pending execution always wins over new
// trigger resolution. Automation failures are logged and published, never
// propagated back to the webhook response path.

use std::sync::Arc;
use tracing::{debug, info, warn};

use ondas_shared::{Channel, Conversation, TemplateStatus};

use crate::automations::{
    ExecutionEngine, PendingExecutionStore, ResumeInput, ResumeOutcome, TriggerInput,
    TriggerResolver,
};
use crate::events::{
    CanonicalEvent, InboundMessageEvent, InteractiveReplyEvent, TemplateStatusEvent,
};
use crate::notifications::{NotificationEvent, NotificationSink};
use crate::services::MessagingGateway;
use crate::storage::{NewContact, NewConversation, NewMessage, Storage, StorageResult};

use super::reconciler::StatusReconciler;

/// Flattened view of the two inbound event variants; everything the
/// recording + automation path needs.
struct InboundContext {
    phone_number_id: String,
    from: String,
    profile_name: Option<String>,
    whatsapp_message_id: String,
    message_type: String,
    content: String,
    metadata: Option<serde_json::Value>,
    media: Option<crate::events::MediaRef>,
    timestamp: chrono::DateTime<chrono::Utc>,
    trigger: TriggerInput,
}

impl From<InboundMessageEvent> for InboundContext {
    fn from(event: InboundMessageEvent) -> Self {
        let trigger = TriggerInput::text(&event.content);
        Self {
            phone_number_id: event.phone_number_id,
            from: event.from,
            profile_name: event.profile_name,
            whatsapp_message_id: event.whatsapp_message_id,
            message_type: event.message_type,
            content: event.content,
            metadata: None,
            media: event.media,
            timestamp: event.timestamp,
            trigger,
        }
    }
}

impl From<InteractiveReplyEvent> for InboundContext {
    fn from(event: InteractiveReplyEvent) -> Self {
        let trigger = TriggerInput::interactive(&event.reply.title, event.reply.clone());
        Self {
            phone_number_id: event.phone_number_id,
            from: event.from,
            profile_name: event.profile_name,
            whatsapp_message_id: event.whatsapp_message_id,
            message_type: "interactive".to_string(),
            content: event.reply.title,
            metadata: Some(event.raw),
            media: None,
            timestamp: event.timestamp,
            trigger,
        }
    }
}

pub struct Dispatcher {
    storage: Arc<dyn Storage>,
    gateway: Arc<dyn MessagingGateway>,
    engine: Arc<ExecutionEngine>,
    resolver: TriggerResolver,
    reconciler: StatusReconciler,
    pending: Arc<dyn PendingExecutionStore>,
    notifier: Arc<dyn NotificationSink>,
}

impl Dispatcher {
    pub fn new(
        storage: Arc<dyn Storage>,
        gateway: Arc<dyn MessagingGateway>,
        engine: Arc<ExecutionEngine>,
        pending: Arc<dyn PendingExecutionStore>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        let resolver = TriggerResolver::new(storage.clone());
        let reconciler = StatusReconciler::new(storage.clone(), notifier.clone());
        Self {
            storage,
            gateway,
            engine,
            resolver,
            reconciler,
            pending,
            notifier,
        }
    }

    /// Process a normalized batch. Each event is handled to completion or
    /// logged-and-dropped; one bad event never blocks its batch siblings.
    pub async fn dispatch(&self, events: Vec<CanonicalEvent>) {
        for event in events {
            if let Err(e) = self.dispatch_one(event).await {
                warn!("webhook event handling failed: {}", e);
            }
        }
    }

    async fn dispatch_one(&self, event: CanonicalEvent) -> StorageResult<()> {
        match event {
            CanonicalEvent::StatusUpdate(update) => self.reconciler.apply(&update).await,
            CanonicalEvent::TemplateStatusUpdate(update) => self.apply_template_update(&update).await,
            CanonicalEvent::InboundMessage(message) => self.handle_inbound(message.into()).await,
            CanonicalEvent::InteractiveReply(reply) => self.handle_inbound(reply.into()).await,
        }
    }

    async fn handle_inbound(&self, mut inbound: InboundContext) -> StorageResult<()> {
        let Some(channel) = self
            .storage
            .get_channel_by_phone_number_id(&inbound.phone_number_id)
            .await?
        else {
            warn!(
                phone_number_id = %inbound.phone_number_id,
                "no channel for webhook phone_number_id; dropping message"
            );
            return Ok(());
        };

        // The provider redelivers on slow acks; a message id we have already
        // recorded must not create a second row or double-fire automations.
        if self
            .storage
            .get_message_by_whatsapp_id(&inbound.whatsapp_message_id)
            .await?
            .is_some()
        {
            debug!(
                whatsapp_message_id = %inbound.whatsapp_message_id,
                "duplicate webhook delivery; ignoring"
            );
            return Ok(());
        }

        let media_url = match &inbound.media {
            Some(media) => match self.gateway.fetch_media_url(&channel, &media.id).await {
                Ok(url) => Some(url),
                Err(e) => {
                    // Never block message creation on media resolution.
                    warn!(media_id = %media.id, "failed to fetch media url: {}", e);
                    None
                }
            },
            None => None,
        };

        let (conversation, is_new_conversation) =
            self.find_or_create_conversation(&channel, &inbound).await?;

        let message = {
            let mut row = NewMessage::inbound(
                conversation.id,
                &inbound.whatsapp_message_id,
                &inbound.content,
            );
            row.message_type = inbound.message_type.clone();
            row.metadata = inbound.metadata.take();
            row.timestamp = inbound.timestamp;
            if let Some(media) = &inbound.media {
                row.media_id = Some(media.id.clone());
                row.media_url = media_url;
                row.media_mime_type = media.mime_type.clone();
                row.media_sha256 = media.sha256.clone();
            }
            self.storage.create_message(row).await?
        };

        self.notifier
            .publish(NotificationEvent::NewMessage {
                conversation_id: conversation.id,
                message,
            })
            .await;

        self.run_automations(&channel, &conversation, is_new_conversation, inbound)
            .await;

        Ok(())
    }

    /// Pending execution first, trigger resolution second. Errors end here.
    async fn run_automations(
        &self,
        channel: &Channel,
        conversation: &Conversation,
        is_new_conversation: bool,
        inbound: InboundContext,
    ) {
        let outcome = self
            .try_automations(channel, conversation, is_new_conversation, inbound)
            .await;
        if let Err(e) = outcome {
            warn!(
                conversation_id = %conversation.id,
                "automation handling failed: {}",
                e
            );
            self.notifier
                .publish(NotificationEvent::AutomationError {
                    conversation_id: conversation.id,
                    message: e.to_string(),
                })
                .await;
        }
    }

    async fn try_automations(
        &self,
        channel: &Channel,
        conversation: &Conversation,
        is_new_conversation: bool,
        inbound: InboundContext,
    ) -> StorageResult<()> {
        if self.pending.has_pending(conversation.id).await? {
            let input = ResumeInput {
                text: inbound.trigger.text.clone(),
                reply: inbound.trigger.reply.clone(),
            };
            match self.engine.resume(channel, conversation, input).await? {
                ResumeOutcome::Resumed {
                    execution_id,
                    variable,
                    value,
                } => {
                    self.notifier
                        .publish(NotificationEvent::AutomationResumed {
                            conversation_id: conversation.id,
                            execution_id,
                            user_response: value,
                            saved_variable: variable,
                        })
                        .await;
                    return Ok(());
                }
                // Lost the race (or the execution was abandoned); fall
                // through to trigger resolution like any other message.
                ResumeOutcome::NoPending => {}
            }
        }

        let definition = if is_new_conversation {
            self.resolver.resolve_new_conversation(channel.id).await?
        } else {
            self.resolver
                .resolve_message(channel.id, &inbound.trigger)
                .await?
        };

        if let Some(definition) = definition {
            self.engine
                .start(definition, channel, conversation, conversation.contact_id)
                .await?;
        }

        Ok(())
    }

    async fn find_or_create_conversation(
        &self,
        channel: &Channel,
        inbound: &InboundContext,
    ) -> StorageResult<(Conversation, bool)> {
        if let Some(conversation) = self
            .storage
            .get_conversation_by_phone(channel.id, &inbound.from)
            .await?
        {
            self.storage
                .record_inbound_activity(conversation.id, &inbound.content)
                .await?;
            return Ok((conversation, false));
        }

        let contact = match self
            .storage
            .get_contact_by_phone(channel.id, &inbound.from)
            .await?
        {
            Some(contact) => contact,
            None => {
                let name = inbound
                    .profile_name
                    .clone()
                    .unwrap_or_else(|| inbound.from.clone());
                self.storage
                    .create_contact(NewContact {
                        channel_id: channel.id,
                        name,
                        phone: inbound.from.clone(),
                    })
                    .await?
            }
        };

        let conversation = self
            .storage
            .create_conversation(NewConversation {
                channel_id: channel.id,
                contact_id: contact.id,
                contact_phone: contact.phone.clone(),
                contact_name: contact.name.clone(),
            })
            .await?;

        info!(
            conversation_id = %conversation.id,
            contact = %contact.phone,
            "created conversation for new contact message"
        );

        Ok((conversation, true))
    }

    async fn apply_template_update(&self, update: &TemplateStatusEvent) -> StorageResult<()> {
        let status = match update.event.as_str() {
            "APPROVED" => TemplateStatus::Approved,
            "REJECTED" => TemplateStatus::Rejected,
            _ => TemplateStatus::Pending,
        };

        let Some(template) = self
            .storage
            .get_template_by_provider_id(&update.template_provider_id)
            .await?
        else {
            debug!(
                template_provider_id = %update.template_provider_id,
                "template status update for unknown template; ignoring"
            );
            return Ok(());
        };

        let rejection_reason = match status {
            TemplateStatus::Rejected => update.reason.clone(),
            _ => None,
        };

        self.storage
            .update_template_status(template.id, status, rejection_reason)
            .await?;

        info!(
            template = %template.name,
            status = status.as_str(),
            "template status updated from provider event"
        );
        Ok(())
    }
}
