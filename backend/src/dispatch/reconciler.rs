// Message Status Reconciler
//
// Applies provider delivery-status deltas to message rows and keeps campaign
// aggregate counters consistent with an O(1) incremental update per event.
// Duplicate and out-of-order deliveries are absorbed by the forward-only
// transition check; a duplicate is a no-op by construction.

use std::sync::Arc;
use tracing::{debug, info};

use ondas_shared::MessageStatus;

use crate::events::StatusUpdateEvent;
use crate::notifications::{NotificationEvent, NotificationSink};
use crate::storage::{CampaignDelta, MessageStatusPatch, Storage, StorageResult};

pub struct StatusReconciler {
    storage: Arc<dyn Storage>,
    notifier: Arc<dyn NotificationSink>,
}

impl StatusReconciler {
    pub fn new(storage: Arc<dyn Storage>, notifier: Arc<dyn NotificationSink>) -> Self {
        Self { storage, notifier }
    }

    pub async fn apply(&self, update: &StatusUpdateEvent) -> StorageResult<()> {
        let Some(message) = self
            .storage
            .get_message_by_whatsapp_id(&update.whatsapp_message_id)
            .await?
        else {
            // The provider may report status for a message this instance
            // never tracked, e.g. after a restart. Tolerated miss.
            debug!(
                whatsapp_message_id = %update.whatsapp_message_id,
                "status update for unknown message; ignoring"
            );
            return Ok(());
        };

        if !message.status.advances_to(update.status) {
            debug!(
                whatsapp_message_id = %update.whatsapp_message_id,
                current = message.status.as_str(),
                incoming = update.status.as_str(),
                "status update is stale or duplicate; no-op"
            );
            return Ok(());
        }

        let patch = MessageStatusPatch {
            status: update.status,
            delivered_at: (update.status == MessageStatus::Delivered).then_some(update.timestamp),
            read_at: (update.status == MessageStatus::Read).then_some(update.timestamp),
            error_details: update.error.clone(),
        };
        self.storage.apply_message_status(message.id, patch).await?;

        info!(
            whatsapp_message_id = %update.whatsapp_message_id,
            from = message.status.as_str(),
            to = update.status.as_str(),
            "message status advanced"
        );

        if let Some(campaign_id) = message.campaign_id {
            let delta = campaign_delta(message.status, update.status);
            if !delta.is_empty() {
                self.storage.apply_campaign_delta(campaign_id, delta).await?;
            }
        }

        self.notifier
            .publish(NotificationEvent::MessageStatusUpdate {
                conversation_id: message.conversation_id,
                message_id: message.id,
                whatsapp_message_id: update.whatsapp_message_id.clone(),
                status: update.status,
                error_details: update.error.clone(),
            })
            .await;

        Ok(())
    }
}

/// Counter delta for a status transition that passed the forward-only check.
///
/// The new status' counter is incremented; a `sent -> failed` transition
/// additionally takes the message back out of `sent_count`.
pub fn campaign_delta(previous: MessageStatus, new: MessageStatus) -> CampaignDelta {
    let mut delta = CampaignDelta::default();
    match new {
        MessageStatus::Sent => delta.sent += 1,
        MessageStatus::Delivered => delta.delivered += 1,
        MessageStatus::Read => delta.read += 1,
        MessageStatus::Failed => {
            delta.failed += 1;
            if previous == MessageStatus::Sent {
                delta.sent -= 1;
            }
        }
        MessageStatus::Pending => {}
    }
    delta
}
