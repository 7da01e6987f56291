use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use courier_core::{AccountId, ContactId, ConversationId, TenantId};

use crate::insight::{Insight, Sentiment};
use crate::message::Direction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    #[default]
    Active,
    Archived,
    Spam,
}

/// AI summary kept on the conversation (latest analysed message wins).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationInsight {
    pub sentiment: Sentiment,
    pub sentiment_score: f64,
    pub intent: String,
    pub language: String,
    pub summary: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Message exchange between one account and one contact.
///
/// At most one `Active` conversation exists per (tenant, contact, account).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub tenant_id: TenantId,
    pub contact_id: ContactId,
    pub account_id: AccountId,
    pub status: ConversationStatus,
    pub assigned_to: Option<String>,
    pub incoming_count: u64,
    pub outgoing_count: u64,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_message_preview: Option<String>,
    pub insight: Option<ConversationInsight>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn open(
        tenant_id: TenantId,
        contact_id: ContactId,
        account_id: AccountId,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ConversationId::new(),
            tenant_id,
            contact_id,
            account_id,
            status: ConversationStatus::Active,
            assigned_to: None,
            incoming_count: 0,
            outgoing_count: 0,
            last_message_at: None,
            last_message_preview: None,
            insight: None,
            created_at: at,
            updated_at: at,
        }
    }

    pub fn is_active_for(&self, contact_id: ContactId, account_id: AccountId) -> bool {
        self.status == ConversationStatus::Active
            && self.contact_id == contact_id
            && self.account_id == account_id
    }

    /// Count a new message and refresh the preview if it is the newest one.
    pub fn record_message(&mut self, direction: Direction, preview: String, at: DateTime<Utc>) {
        match direction {
            Direction::Inbound => self.incoming_count += 1,
            Direction::Outbound => self.outgoing_count += 1,
        }
        if self.last_message_at.is_none_or(|last| last <= at) {
            self.last_message_at = Some(at);
            self.last_message_preview = Some(preview);
        }
        if self.updated_at < at {
            self.updated_at = at;
        }
    }

    pub fn apply_insight(&mut self, insight: &Insight) {
        self.insight = Some(ConversationInsight {
            sentiment: insight.sentiment,
            sentiment_score: insight.sentiment_score,
            intent: insight.intent.clone(),
            language: insight.language.clone(),
            summary: insight.summary.clone(),
            updated_at: insight.analyzed_at,
        });
        if self.updated_at < insight.analyzed_at {
            self.updated_at = insight.analyzed_at;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn counters_follow_direction_and_preview_keeps_newest() {
        let now = Utc::now();
        let mut c = Conversation::open(TenantId::new(), ContactId::new(), AccountId::new(), now);
        c.record_message(Direction::Inbound, "second".into(), now + Duration::seconds(2));
        c.record_message(Direction::Outbound, "first".into(), now + Duration::seconds(1));

        assert_eq!(c.incoming_count, 1);
        assert_eq!(c.outgoing_count, 1);
        assert_eq!(c.last_message_preview.as_deref(), Some("second"));
        assert_eq!(c.last_message_at, Some(now + Duration::seconds(2)));
    }
}
