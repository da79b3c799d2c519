// Canonical Event Normalizer
//
// Walks the entry/changes batch and emits zero or more canonical events.
// Anything it cannot make sense of is dropped with a logged warning; a
// malformed payload must never take the pipeline down.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value as JsonValue;
use tracing::warn;

use ondas_shared::MessageStatus;

use super::payload::{ChangeValue, RawMessage, RawStatus, WebhookPayload};
use super::{
    CanonicalEvent, InboundMessageEvent, InteractiveReplyEvent, MediaRef, ReplyData, ReplyKind,
    StatusUpdateEvent, TemplateStatusEvent,
};

/// Parse a raw webhook body. `None` means the body was not a payload we
/// recognize; the caller logs and acknowledges anyway.
pub fn parse_payload(body: &[u8]) -> Option<WebhookPayload> {
    match serde_json::from_slice::<WebhookPayload>(body) {
        Ok(payload) => Some(payload),
        Err(e) => {
            warn!("dropping malformed webhook payload: {}", e);
            None
        }
    }
}

/// Flatten a parsed payload into canonical events.
pub fn normalize(payload: &WebhookPayload) -> Vec<CanonicalEvent> {
    let mut events = Vec::new();

    for entry in &payload.entry {
        for change in &entry.changes {
            let Some(value) = &change.value else {
                warn!("webhook change without a value block; skipping");
                continue;
            };
            match change.field.as_deref() {
                Some("messages") => normalize_message_change(value, &mut events),
                Some("message_template_status_update") => {
                    if let Some(event) = normalize_template_update(value) {
                        events.push(CanonicalEvent::TemplateStatusUpdate(event));
                    }
                }
                other => {
                    warn!(field = ?other, "unhandled webhook change field; skipping");
                }
            }
        }
    }

    events
}

fn normalize_message_change(value: &ChangeValue, events: &mut Vec<CanonicalEvent>) {
    let Some(phone_number_id) = value
        .metadata
        .as_ref()
        .and_then(|m| m.phone_number_id.clone())
    else {
        // The provider's own test pings arrive without metadata.
        warn!("messages change without metadata.phone_number_id; skipping");
        return;
    };

    for status in &value.statuses {
        if let Some(event) = normalize_status(&phone_number_id, status) {
            events.push(CanonicalEvent::StatusUpdate(event));
        }
    }

    for message in &value.messages {
        if let Some(event) = normalize_message(&phone_number_id, value, message) {
            events.push(event);
        }
    }
}

fn normalize_message(
    phone_number_id: &str,
    value: &ChangeValue,
    message: &RawMessage,
) -> Option<CanonicalEvent> {
    let (Some(from), Some(id)) = (message.from.clone(), message.id.clone()) else {
        warn!("inbound message without from/id; skipping");
        return None;
    };

    let profile_name = value
        .contacts
        .iter()
        .find(|c| c.wa_id.as_deref() == Some(from.as_str()))
        .and_then(|c| c.profile.as_ref())
        .and_then(|p| p.name.clone());

    let timestamp = parse_epoch(message.timestamp.as_deref());
    let kind = message.kind.clone().unwrap_or_else(|| "unknown".to_string());

    if kind == "interactive" {
        if let Some(interactive) = &message.interactive {
            let (reply_kind, raw_reply) = match interactive.kind.as_deref() {
                Some("button_reply") => (ReplyKind::Button, interactive.button_reply.as_ref()),
                Some("list_reply") => (ReplyKind::List, interactive.list_reply.as_ref()),
                other => {
                    warn!(kind = ?other, "unknown interactive reply kind; skipping");
                    (ReplyKind::Button, None)
                }
            };
            if let Some(reply) = raw_reply {
                if let (Some(reply_id), Some(title)) = (reply.id.clone(), reply.title.clone()) {
                    return Some(CanonicalEvent::InteractiveReply(InteractiveReplyEvent {
                        phone_number_id: phone_number_id.to_string(),
                        from,
                        profile_name,
                        whatsapp_message_id: id,
                        reply: ReplyData {
                            kind: reply_kind,
                            id: reply_id,
                            title,
                        },
                        raw: raw_interactive_json(interactive),
                        timestamp,
                    }));
                }
            }
        }
        warn!("interactive message without a usable reply; skipping");
        return None;
    }

    let (content, media) = message_content(&kind, message);

    Some(CanonicalEvent::InboundMessage(InboundMessageEvent {
        phone_number_id: phone_number_id.to_string(),
        from,
        profile_name,
        whatsapp_message_id: id,
        message_type: kind,
        content,
        media,
        timestamp,
    }))
}

fn message_content(kind: &str, message: &RawMessage) -> (String, Option<MediaRef>) {
    let media_ref = |raw: &super::payload::RawMedia| {
        raw.id.clone().map(|id| MediaRef {
            id,
            mime_type: raw.mime_type.clone(),
            sha256: raw.sha256.clone(),
        })
    };

    match kind {
        "text" => (
            message
                .text
                .as_ref()
                .and_then(|t| t.body.clone())
                .unwrap_or_default(),
            None,
        ),
        "image" => {
            let raw = message.image.as_ref();
            (
                raw.and_then(|m| m.caption.clone())
                    .unwrap_or_else(|| "[Image]".to_string()),
                raw.and_then(media_ref),
            )
        }
        "document" => {
            let raw = message.document.as_ref();
            let content = raw.and_then(|m| m.caption.clone()).unwrap_or_else(|| {
                let filename = raw
                    .and_then(|m| m.filename.clone())
                    .unwrap_or_else(|| "file".to_string());
                format!("[Document: {}]", filename)
            });
            (content, raw.and_then(media_ref))
        }
        "audio" => (
            "[Audio message]".to_string(),
            message.audio.as_ref().and_then(media_ref),
        ),
        "video" => {
            let raw = message.video.as_ref();
            (
                raw.and_then(|m| m.caption.clone())
                    .unwrap_or_else(|| "[Video]".to_string()),
                raw.and_then(media_ref),
            )
        }
        other => (format!("[{} message]", other), None),
    }
}

fn normalize_status(phone_number_id: &str, status: &RawStatus) -> Option<StatusUpdateEvent> {
    let (Some(id), Some(raw_status)) = (status.id.clone(), status.status.as_deref()) else {
        warn!("status update without id/status; skipping");
        return None;
    };

    let Some(mapped) = MessageStatus::parse(raw_status) else {
        warn!(status = raw_status, "unknown provider status; skipping");
        return None;
    };

    let timestamp = parse_epoch(status.timestamp.as_deref());
    let error = status.errors.first().map(|e| {
        serde_json::json!({
            "code": e.code,
            "title": e.title,
            "message": e.message,
            "error_data": e.error_data,
            "recipient_id": status.recipient_id,
        })
    });

    Some(StatusUpdateEvent {
        phone_number_id: phone_number_id.to_string(),
        whatsapp_message_id: id,
        status: mapped,
        timestamp,
        recipient_id: status.recipient_id.clone(),
        error,
    })
}

fn normalize_template_update(value: &ChangeValue) -> Option<TemplateStatusEvent> {
    let template_provider_id = match &value.message_template_id {
        Some(JsonValue::String(s)) => s.clone(),
        Some(JsonValue::Number(n)) => n.to_string(),
        _ => {
            warn!("template status update without message_template_id; skipping");
            return None;
        }
    };
    let Some(event) = value.event.clone() else {
        warn!("template status update without event; skipping");
        return None;
    };

    Some(TemplateStatusEvent {
        template_provider_id,
        template_name: value.message_template_name.clone(),
        event,
        reason: value.reason.clone(),
    })
}

/// Provider timestamps are epoch seconds in a string; anything unparseable
/// falls back to the receive time.
fn parse_epoch(raw: Option<&str>) -> DateTime<Utc> {
    raw.and_then(|s| s.parse::<i64>().ok())
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .unwrap_or_else(Utc::now)
}

fn raw_interactive_json(interactive: &super::payload::RawInteractive) -> JsonValue {
    let reply = |r: &super::payload::RawReply| {
        serde_json::json!({ "id": r.id, "title": r.title })
    };
    match interactive.kind.as_deref() {
        Some("button_reply") => serde_json::json!({
            "type": "button_reply",
            "button_reply": interactive.button_reply.as_ref().map(reply),
        }),
        Some("list_reply") => serde_json::json!({
            "type": "list_reply",
            "list_reply": interactive.list_reply.as_ref().map(reply),
        }),
        _ => JsonValue::Null,
    }
}
