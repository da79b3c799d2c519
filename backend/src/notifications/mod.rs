// Real-time notification sink.
//
// The dispatcher and engine publish conversation-scoped events through an
// injected trait object; the production sink fans them out over the
// WebSocket manager. Publishing is fire-and-forget: a UI layer that is not
// listening must never affect webhook processing.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use ondas_shared::{Message, MessageStatus};

use crate::websocket::{WsManager, WsMessage};

#[derive(Debug, Clone)]
pub enum NotificationEvent {
    NewMessage {
        conversation_id: Uuid,
        message: Message,
    },
    AutomationResumed {
        conversation_id: Uuid,
        execution_id: Uuid,
        user_response: String,
        saved_variable: String,
    },
    AutomationError {
        conversation_id: Uuid,
        message: String,
    },
    MessageStatusUpdate {
        conversation_id: Uuid,
        message_id: Uuid,
        whatsapp_message_id: String,
        status: MessageStatus,
        error_details: Option<JsonValue>,
    },
}

impl NotificationEvent {
    pub fn conversation_id(&self) -> Uuid {
        match self {
            Self::NewMessage { conversation_id, .. }
            | Self::AutomationResumed { conversation_id, .. }
            | Self::AutomationError { conversation_id, .. }
            | Self::MessageStatusUpdate { conversation_id, .. } => *conversation_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::NewMessage { .. } => "new-message",
            Self::AutomationResumed { .. } => "automation-resumed",
            Self::AutomationError { .. } => "automation-error",
            Self::MessageStatusUpdate { .. } => "message-status-update",
        }
    }

    fn payload(&self) -> JsonValue {
        match self {
            Self::NewMessage { conversation_id, message } => serde_json::json!({
                "conversation_id": conversation_id,
                "message": message,
            }),
            Self::AutomationResumed {
                conversation_id,
                execution_id,
                user_response,
                saved_variable,
            } => serde_json::json!({
                "conversation_id": conversation_id,
                "execution_id": execution_id,
                "user_response": user_response,
                "saved_variable": saved_variable,
            }),
            Self::AutomationError { conversation_id, message } => serde_json::json!({
                "conversation_id": conversation_id,
                "error": { "message": message },
            }),
            Self::MessageStatusUpdate {
                conversation_id,
                message_id,
                whatsapp_message_id,
                status,
                error_details,
            } => serde_json::json!({
                "conversation_id": conversation_id,
                "message_id": message_id,
                "whatsapp_message_id": whatsapp_message_id,
                "status": status,
                "error_details": error_details,
            }),
        }
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn publish(&self, event: NotificationEvent);
}

/// Production sink: WebSocket fan-out keyed by conversation.
pub struct WsSink {
    ws_manager: WsManager,
}

impl WsSink {
    pub fn new(ws_manager: WsManager) -> Self {
        Self { ws_manager }
    }
}

#[async_trait]
impl NotificationSink for WsSink {
    async fn publish(&self, event: NotificationEvent) {
        let message = WsMessage {
            event_type: event.event_type().to_string(),
            payload: event.payload(),
            timestamp: chrono::Utc::now(),
        };
        self.ws_manager
            .broadcast_to_conversation(event.conversation_id(), message)
            .await;
    }
}
