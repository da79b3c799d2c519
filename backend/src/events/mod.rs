// Canonical webhook events
//
// The provider's nested entry/changes payload is parsed once, at this
// boundary, into a closed set of tagged variants. Nothing downstream ever
// inspects raw payload shape again.

pub mod normalizer;
pub mod payload;

pub use normalizer::{normalize, parse_payload};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use ondas_shared::MessageStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CanonicalEvent {
    InboundMessage(InboundMessageEvent),
    InteractiveReply(InteractiveReplyEvent),
    StatusUpdate(StatusUpdateEvent),
    TemplateStatusUpdate(TemplateStatusEvent),
}

/// A plain inbound message (text, media, or an unsupported type degraded to
/// a placeholder body).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessageEvent {
    /// Routing key for the owning channel.
    pub phone_number_id: String,
    pub from: String,
    pub profile_name: Option<String>,
    pub whatsapp_message_id: String,
    pub message_type: String,
    pub content: String,
    pub media: Option<MediaRef>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaRef {
    pub id: String,
    pub mime_type: Option<String>,
    pub sha256: Option<String>,
}

/// A button or list reply to an interactive message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractiveReplyEvent {
    pub phone_number_id: String,
    pub from: String,
    pub profile_name: Option<String>,
    pub whatsapp_message_id: String,
    pub reply: ReplyData,
    /// Raw interactive payload, preserved on the message row.
    pub raw: JsonValue,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyData {
    pub kind: ReplyKind,
    pub id: String,
    pub title: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyKind {
    Button,
    List,
}

/// A delivery-status delta for a previously sent message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdateEvent {
    pub phone_number_id: String,
    pub whatsapp_message_id: String,
    pub status: MessageStatus,
    pub timestamp: DateTime<Utc>,
    pub recipient_id: Option<String>,
    /// Structured failure details, present on `failed` updates.
    pub error: Option<JsonValue>,
}

/// A template approval/rejection decision from the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateStatusEvent {
    pub template_provider_id: String,
    pub template_name: Option<String>,
    pub event: String,
    pub reason: Option<String>,
}
