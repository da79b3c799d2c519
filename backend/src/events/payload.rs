// Raw provider webhook payload shapes.
//
// Every field is optional: the provider's payloads vary by event kind and
// API version, and a missing field must degrade to a skipped event, never a
// parse failure for the whole batch.

use serde::Deserialize;
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    pub object: Option<String>,
    #[serde(default)]
    pub entry: Vec<Entry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Entry {
    pub id: Option<String>,
    #[serde(default)]
    pub changes: Vec<Change>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Change {
    pub field: Option<String>,
    pub value: Option<ChangeValue>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ChangeValue {
    pub messaging_product: Option<String>,
    pub metadata: Option<Metadata>,
    #[serde(default)]
    pub contacts: Vec<RawContact>,
    #[serde(default)]
    pub messages: Vec<RawMessage>,
    #[serde(default)]
    pub statuses: Vec<RawStatus>,

    // message_template_status_update fields
    pub message_template_id: Option<JsonValue>,
    pub message_template_name: Option<String>,
    pub event: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Metadata {
    pub display_phone_number: Option<String>,
    pub phone_number_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawContact {
    pub wa_id: Option<String>,
    pub profile: Option<RawProfile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawProfile {
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawMessage {
    pub from: Option<String>,
    pub id: Option<String>,
    /// Epoch seconds, as a string.
    pub timestamp: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub text: Option<RawText>,
    pub interactive: Option<RawInteractive>,
    pub image: Option<RawMedia>,
    pub document: Option<RawMedia>,
    pub audio: Option<RawMedia>,
    pub video: Option<RawMedia>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawText {
    pub body: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawInteractive {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub button_reply: Option<RawReply>,
    pub list_reply: Option<RawReply>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawReply {
    pub id: Option<String>,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawMedia {
    pub id: Option<String>,
    pub mime_type: Option<String>,
    pub sha256: Option<String>,
    pub caption: Option<String>,
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawStatus {
    /// Provider id of the message the status applies to.
    pub id: Option<String>,
    pub status: Option<String>,
    pub timestamp: Option<String>,
    pub recipient_id: Option<String>,
    #[serde(default)]
    pub errors: Vec<RawStatusError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawStatusError {
    pub code: Option<i64>,
    pub title: Option<String>,
    pub message: Option<String>,
    pub error_data: Option<JsonValue>,
}
