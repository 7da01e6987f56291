//! Events the platform publishes to tenant webhook subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use courier_core::{AccountId, CampaignId, ContactId, ConversationId, MessageId, TenantId};
use courier_messaging::{DeliveryError, MessageContent, MessageStatus, MessageType};

pub const MESSAGE_RECEIVED: &str = "message.received";
pub const MESSAGE_STATUS_UPDATED: &str = "message.status_updated";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageReceived {
    pub tenant_id: TenantId,
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub contact_id: ContactId,
    pub account_id: AccountId,
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_name: Option<String>,
    pub provider_message_id: String,
    pub message_type: MessageType,
    pub content: MessageContent,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageStatusUpdated {
    pub tenant_id: TenantId,
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub provider_message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<CampaignId>,
    pub status: MessageStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<DeliveryError>,
}

/// A platform event; serializes as `{ "event": <name>, "data": { ... } }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum PlatformEvent {
    #[serde(rename = "message.received")]
    MessageReceived(MessageReceived),
    #[serde(rename = "message.status_updated")]
    MessageStatusUpdated(MessageStatusUpdated),
}

impl PlatformEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PlatformEvent::MessageReceived(_) => MESSAGE_RECEIVED,
            PlatformEvent::MessageStatusUpdated(_) => MESSAGE_STATUS_UPDATED,
        }
    }

    /// Stable identity of the occurrence, used to de-duplicate fan-out.
    pub fn subject(&self) -> String {
        match self {
            PlatformEvent::MessageReceived(e) => e.provider_message_id.clone(),
            PlatformEvent::MessageStatusUpdated(e) => {
                format!("{}:{}", e.provider_message_id, e.status)
            }
        }
    }
}
