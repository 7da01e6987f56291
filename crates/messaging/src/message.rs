//! Message record and its delivery-status state machine.
//!
//! Status only moves forward along `pending → sent → delivered → read`, or to
//! `failed` from any non-terminal status. Every accepted change appends one entry
//! to the status history; the history is append-only and its timestamps never
//! decrease. All status changes go through [`Message::apply`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use courier_core::{AccountId, CampaignId, ContactId, ConversationId, MessageId, TenantId};

use crate::content::MessageContent;
use crate::insight::Insight;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    /// Position on the forward path. `Failed` sits outside it.
    fn rank(&self) -> u8 {
        match self {
            MessageStatus::Pending => 0,
            MessageStatus::Sent => 1,
            MessageStatus::Delivered => 2,
            MessageStatus::Read => 3,
            MessageStatus::Failed => u8::MAX,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Read | MessageStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
            MessageStatus::Failed => "failed",
        }
    }

    /// Map the provider's status vocabulary. Unknown values yield `None`.
    pub fn from_provider(value: &str) -> Option<Self> {
        match value {
            "sent" => Some(MessageStatus::Sent),
            "delivered" => Some(MessageStatus::Delivered),
            "read" => Some(MessageStatus::Read),
            "failed" => Some(MessageStatus::Failed),
            _ => None,
        }
    }
}

impl core::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error reported for a delivery attempt (by the provider or by us).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
}

impl DeliveryError {
    pub fn new(code: Option<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// One entry of the status log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub status: MessageStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<DeliveryError>,
}

/// A requested status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status: MessageStatus,
    pub at: DateTime<Utc>,
    pub error: Option<DeliveryError>,
    pub provider_message_id: Option<String>,
}

impl StatusUpdate {
    pub fn new(status: MessageStatus, at: DateTime<Utc>) -> Self {
        Self {
            status,
            at,
            error: None,
            provider_message_id: None,
        }
    }

    pub fn with_error(mut self, error: DeliveryError) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_provider_message_id(mut self, id: impl Into<String>) -> Self {
        self.provider_message_id = Some(id.into());
        self
    }
}

/// Outcome of [`Message::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    /// Status changed and one history entry was appended.
    Applied,
    /// The status was already recorded (a replayed event). Nothing changed.
    Duplicate,
    /// The update is older than the current status, or the message is terminal.
    Stale,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub tenant_id: TenantId,
    pub conversation_id: ConversationId,
    pub contact_id: ContactId,
    pub account_id: AccountId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<CampaignId>,
    pub direction: Direction,
    /// The contact's phone number (sender for inbound, recipient for outbound).
    pub counterpart: String,
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_message_id: Option<String>,
    pub status: MessageStatus,
    pub history: Vec<StatusEntry>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    /// Last error seen for this message.
    pub error: Option<DeliveryError>,
    pub insight: Option<Insight>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Bumped on every mutation; stores use it for compare-and-set.
    pub version: u64,
}

impl Message {
    /// New outbound message awaiting dispatch.
    #[allow(clippy::too_many_arguments)]
    pub fn outbound(
        id: MessageId,
        tenant_id: TenantId,
        conversation_id: ConversationId,
        contact_id: ContactId,
        account_id: AccountId,
        campaign_id: Option<CampaignId>,
        to: impl Into<String>,
        content: MessageContent,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            tenant_id,
            conversation_id,
            contact_id,
            account_id,
            campaign_id,
            direction: Direction::Outbound,
            counterpart: to.into(),
            content,
            provider_message_id: None,
            status: MessageStatus::Pending,
            history: vec![StatusEntry {
                status: MessageStatus::Pending,
                timestamp: at,
                error: None,
            }],
            sent_at: None,
            delivered_at: None,
            read_at: None,
            failed_at: None,
            error: None,
            insight: None,
            created_at: at,
            updated_at: at,
            version: 1,
        }
    }

    /// New inbound message. Inbound messages are delivered by definition.
    #[allow(clippy::too_many_arguments)]
    pub fn inbound(
        tenant_id: TenantId,
        conversation_id: ConversationId,
        contact_id: ContactId,
        account_id: AccountId,
        from: impl Into<String>,
        provider_message_id: impl Into<String>,
        content: MessageContent,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: MessageId::new(),
            tenant_id,
            conversation_id,
            contact_id,
            account_id,
            campaign_id: None,
            direction: Direction::Inbound,
            counterpart: from.into(),
            content,
            provider_message_id: Some(provider_message_id.into()),
            status: MessageStatus::Delivered,
            history: vec![StatusEntry {
                status: MessageStatus::Delivered,
                timestamp: at,
                error: None,
            }],
            sent_at: None,
            delivered_at: Some(at),
            read_at: None,
            failed_at: None,
            error: None,
            insight: None,
            created_at: at,
            updated_at: at,
            version: 1,
        }
    }

    fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.history.last().map(|e| e.timestamp)
    }

    /// The single transition function for delivery status.
    pub fn apply(&mut self, update: StatusUpdate) -> Transition {
        if self.status == update.status || self.history.iter().any(|e| e.status == update.status) {
            return Transition::Duplicate;
        }
        if self.status.is_terminal() {
            return Transition::Stale;
        }
        let forward =
            update.status == MessageStatus::Failed || update.status.rank() > self.status.rank();
        if !forward {
            return Transition::Stale;
        }

        // Event clocks may lag the log; only the log is kept ordered, the status
        // fields below carry the provider's own time.
        let timestamp = match self.last_timestamp() {
            Some(last) if last > update.at => last,
            _ => update.at,
        };

        self.status = update.status;
        self.history.push(StatusEntry {
            status: update.status,
            timestamp,
            error: update.error.clone(),
        });

        match update.status {
            MessageStatus::Pending => {}
            MessageStatus::Sent => {
                self.sent_at.get_or_insert(update.at);
            }
            MessageStatus::Delivered => {
                self.delivered_at.get_or_insert(update.at);
            }
            MessageStatus::Read => {
                self.read_at.get_or_insert(update.at);
            }
            MessageStatus::Failed => {
                self.failed_at.get_or_insert(update.at);
            }
        }
        if update.error.is_some() {
            self.error = update.error;
        }
        if self.provider_message_id.is_none() {
            self.provider_message_id = update.provider_message_id;
        }
        self.updated_at = timestamp;
        self.version += 1;
        Transition::Applied
    }

    /// Record a failed attempt that will be retried: a `pending` entry carrying the error.
    ///
    /// Returns `false` (and changes nothing) if the message already left `pending`.
    pub fn record_retry(&mut self, at: DateTime<Utc>, error: DeliveryError) -> bool {
        if self.status != MessageStatus::Pending {
            return false;
        }
        let timestamp = match self.last_timestamp() {
            Some(last) if last > at => last,
            _ => at,
        };
        self.history.push(StatusEntry {
            status: MessageStatus::Pending,
            timestamp,
            error: Some(error.clone()),
        });
        self.error = Some(error);
        self.updated_at = timestamp;
        self.version += 1;
        true
    }

    pub fn set_insight(&mut self, insight: Insight) {
        self.updated_at = insight.analyzed_at;
        self.insight = Some(insight);
        self.version += 1;
    }

    pub fn history_is_ordered(&self) -> bool {
        self.history.windows(2).all(|w| w[0].timestamp <= w[1].timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn outbound() -> Message {
        Message::outbound(
            MessageId::new(),
            TenantId::new(),
            ConversationId::new(),
            ContactId::new(),
            AccountId::new(),
            None,
            "+15551234567",
            MessageContent::text("hello"),
            t0(),
        )
    }

    #[test]
    fn forward_path_records_each_step() {
        let mut msg = outbound();
        let sent = StatusUpdate::new(MessageStatus::Sent, t0() + Duration::seconds(1))
            .with_provider_message_id("wamid.1");
        assert_eq!(msg.apply(sent), Transition::Applied);
        assert_eq!(
            msg.apply(StatusUpdate::new(MessageStatus::Delivered, t0() + Duration::seconds(2))),
            Transition::Applied
        );
        assert_eq!(
            msg.apply(StatusUpdate::new(MessageStatus::Read, t0() + Duration::seconds(3))),
            Transition::Applied
        );

        assert_eq!(msg.status, MessageStatus::Read);
        assert_eq!(msg.history.len(), 4);
        assert_eq!(msg.provider_message_id.as_deref(), Some("wamid.1"));
        assert!(msg.sent_at.is_some() && msg.delivered_at.is_some() && msg.read_at.is_some());
    }

    #[test]
    fn late_delivered_after_read_is_stale() {
        let mut msg = outbound();
        msg.apply(StatusUpdate::new(MessageStatus::Sent, t0()));
        msg.apply(StatusUpdate::new(MessageStatus::Read, t0() + Duration::seconds(5)));

        let before = msg.clone();
        assert_eq!(
            msg.apply(StatusUpdate::new(MessageStatus::Delivered, t0() + Duration::seconds(4))),
            Transition::Stale
        );
        assert_eq!(msg, before);
    }

    #[test]
    fn replayed_status_is_a_duplicate() {
        let mut msg = outbound();
        msg.apply(StatusUpdate::new(MessageStatus::Sent, t0()));
        msg.apply(StatusUpdate::new(MessageStatus::Delivered, t0()));
        assert_eq!(
            msg.apply(StatusUpdate::new(MessageStatus::Sent, t0())),
            Transition::Duplicate
        );
        assert_eq!(msg.history.len(), 3);
    }

    #[test]
    fn failed_is_reachable_from_any_non_terminal_status() {
        let mut msg = outbound();
        msg.apply(StatusUpdate::new(MessageStatus::Sent, t0()));
        let update = StatusUpdate::new(MessageStatus::Failed, t0())
            .with_error(DeliveryError::new(Some("131026".into()), "Message undeliverable"));
        assert_eq!(msg.apply(update), Transition::Applied);
        assert_eq!(msg.status, MessageStatus::Failed);
        assert_eq!(msg.error.as_ref().and_then(|e| e.code.as_deref()), Some("131026"));

        // Terminal: nothing moves it any more.
        assert_eq!(
            msg.apply(StatusUpdate::new(MessageStatus::Read, t0())),
            Transition::Stale
        );
    }

    #[test]
    fn history_timestamps_never_go_backwards() {
        let mut msg = outbound();
        msg.apply(StatusUpdate::new(MessageStatus::Sent, t0() + Duration::seconds(10)));
        msg.apply(StatusUpdate::new(MessageStatus::Delivered, t0() + Duration::seconds(2)));
        assert!(msg.history_is_ordered());
        assert_eq!(msg.history[2].timestamp, t0() + Duration::seconds(10));
    }

    #[test]
    fn status_times_keep_the_reported_event_time() {
        let mut msg = outbound();
        msg.apply(StatusUpdate::new(MessageStatus::Sent, t0() + Duration::seconds(10)));
        msg.apply(StatusUpdate::new(MessageStatus::Delivered, t0() + Duration::seconds(2)));
        msg.apply(StatusUpdate::new(MessageStatus::Read, t0() + Duration::seconds(4)));

        assert_eq!(msg.sent_at, Some(t0() + Duration::seconds(10)));
        assert_eq!(msg.delivered_at, Some(t0() + Duration::seconds(2)));
        assert_eq!(msg.read_at, Some(t0() + Duration::seconds(4)));
        assert!(msg.history_is_ordered());
    }

    #[test]
    fn retry_entry_only_while_pending() {
        let mut msg = outbound();
        assert!(msg.record_retry(t0(), DeliveryError::new(None, "timeout")));
        assert_eq!(msg.history.len(), 2);
        assert_eq!(msg.status, MessageStatus::Pending);

        msg.apply(StatusUpdate::new(MessageStatus::Sent, t0()));
        assert!(!msg.record_retry(t0(), DeliveryError::new(None, "timeout")));
        assert_eq!(msg.history.len(), 3);
    }

    #[test]
    fn inbound_starts_delivered() {
        let msg = Message::inbound(
            TenantId::new(),
            ConversationId::new(),
            ContactId::new(),
            AccountId::new(),
            "+15551234567",
            "wamid.in",
            MessageContent::text("hi"),
            t0(),
        );
        assert_eq!(msg.direction, Direction::Inbound);
        assert_eq!(msg.status, MessageStatus::Delivered);
        assert_eq!(msg.history.len(), 1);
    }

    fn any_status() -> impl Strategy<Value = MessageStatus> {
        prop_oneof![
            Just(MessageStatus::Pending),
            Just(MessageStatus::Sent),
            Just(MessageStatus::Delivered),
            Just(MessageStatus::Read),
            Just(MessageStatus::Failed),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: without failures, the final status is the causally latest one seen,
        /// whatever the arrival order.
        #[test]
        fn final_status_is_causally_latest(
            events in prop::collection::vec((0u8..4, -300i64..300), 0..20)
        ) {
            let mut msg = outbound();
            let forward = [
                MessageStatus::Pending,
                MessageStatus::Sent,
                MessageStatus::Delivered,
                MessageStatus::Read,
            ];
            let mut latest = MessageStatus::Pending;
            for (idx, offset) in &events {
                let status = forward[*idx as usize];
                if status.rank() > latest.rank() {
                    latest = status;
                }
                msg.apply(StatusUpdate::new(status, t0() + Duration::seconds(*offset)));
            }
            prop_assert_eq!(msg.status, latest);
            prop_assert!(msg.history_is_ordered());
        }

        /// Property: once terminal, no event changes the status or grows the log.
        #[test]
        fn terminal_status_never_regresses(
            events in prop::collection::vec((any_status(), -300i64..300), 0..30)
        ) {
            let mut msg = outbound();
            let mut terminal: Option<(MessageStatus, usize)> = None;
            for (status, offset) in events {
                let outcome = msg.apply(StatusUpdate::new(status, t0() + Duration::seconds(offset)));
                if let Some((s, len)) = terminal {
                    prop_assert_ne!(outcome, Transition::Applied);
                    prop_assert_eq!(msg.status, s);
                    prop_assert_eq!(msg.history.len(), len);
                } else if msg.status.is_terminal() {
                    terminal = Some((msg.status, msg.history.len()));
                }
            }
        }

        /// Property: the log grows by exactly one entry per applied transition.
        #[test]
        fn one_entry_per_applied_transition(
            events in prop::collection::vec((any_status(), -300i64..300), 0..30)
        ) {
            let mut msg = outbound();
            let mut applied = 0usize;
            for (status, offset) in events {
                if msg.apply(StatusUpdate::new(status, t0() + Duration::seconds(offset))) == Transition::Applied {
                    applied += 1;
                }
            }
            prop_assert_eq!(msg.history.len(), 1 + applied);
        }
    }
}
