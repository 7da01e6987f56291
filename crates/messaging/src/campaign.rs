//! Campaign definition, lifecycle, and progress counters.
//!
//! Lifecycle: `draft → scheduled|running`, `scheduled → running`, `running ⇄ paused`,
//! `running → completed`, and any non-terminal status `→ cancelled`. `completed`
//! requires `sent + failed == total_recipients`; `sent + failed` never exceeds it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use courier_core::{AccountId, CampaignId, ContactId, DomainError, DomainResult, TenantId};

use crate::contact::Contact;
use crate::content::MessageContent;
use crate::template::{render_text, CampaignTemplate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Running,
    Paused,
    Completed,
    Cancelled,
}

impl CampaignStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CampaignStatus::Completed | CampaignStatus::Cancelled)
    }

    pub fn can_transition_to(&self, to: CampaignStatus) -> bool {
        use CampaignStatus::*;
        matches!(
            (self, to),
            (Draft, Scheduled)
                | (Draft, Running)
                | (Scheduled, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Completed)
                | (Draft, Cancelled)
                | (Scheduled, Cancelled)
                | (Running, Cancelled)
                | (Paused, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Scheduled => "scheduled",
            CampaignStatus::Running => "running",
            CampaignStatus::Paused => "paused",
            CampaignStatus::Completed => "completed",
            CampaignStatus::Cancelled => "cancelled",
        }
    }
}

impl core::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who receives the campaign: explicit contacts plus any contact carrying one of the tags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudienceSelection {
    #[serde(default)]
    pub contact_ids: Vec<ContactId>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl AudienceSelection {
    pub fn matches(&self, contact: &Contact) -> bool {
        self.contact_ids.contains(&contact.id) || self.tags.iter().any(|t| contact.tags.contains(t))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignCounter {
    Sent,
    Delivered,
    Read,
    Failed,
}

impl CampaignCounter {
    /// Counters that account for a recipient's terminal dispatch outcome.
    pub fn is_dispatch_outcome(&self) -> bool {
        matches!(self, CampaignCounter::Sent | CampaignCounter::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignProgress {
    pub status: CampaignStatus,
    pub total_recipients: u64,
    pub sent: u64,
    pub delivered: u64,
    pub read: u64,
    pub failed: u64,
    /// Share of recipients with a dispatch outcome, 0..=100.
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub tenant_id: TenantId,
    pub account_id: AccountId,
    pub name: String,
    pub status: CampaignStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<CampaignTemplate>,
    /// Free-text body used when no template is set; supports `{{variable}}` placeholders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Campaign-level variable values.
    #[serde(default)]
    pub overrides: BTreeMap<String, String>,
    #[serde(default)]
    pub audience: AudienceSelection,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub total_recipients: u64,
    pub sent_count: u64,
    pub delivered_count: u64,
    pub read_count: u64,
    pub failed_count: u64,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    pub fn draft(
        tenant_id: TenantId,
        account_id: AccountId,
        name: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: CampaignId::new(),
            tenant_id,
            account_id,
            name: name.into(),
            status: CampaignStatus::Draft,
            template: None,
            text: None,
            overrides: BTreeMap::new(),
            audience: AudienceSelection::default(),
            scheduled_at: None,
            total_recipients: 0,
            sent_count: 0,
            delivered_count: 0,
            read_count: 0,
            failed_count: 0,
            last_error: None,
            started_at: None,
            completed_at: None,
            created_at: at,
            updated_at: at,
        }
    }

    pub fn with_template(mut self, template: CampaignTemplate) -> Self {
        self.template = Some(template);
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_audience(mut self, audience: AudienceSelection) -> Self {
        self.audience = audience;
        self
    }

    pub fn dispatched(&self) -> u64 {
        self.sent_count + self.failed_count
    }

    pub fn transition(&mut self, to: CampaignStatus, at: DateTime<Utc>) -> DomainResult<()> {
        if !self.status.can_transition_to(to) {
            return Err(DomainError::invalid_transition(self.status, to));
        }
        if to == CampaignStatus::Completed && self.dispatched() != self.total_recipients {
            return Err(DomainError::invariant(format!(
                "campaign cannot complete with {} of {} recipients dispatched",
                self.dispatched(),
                self.total_recipients
            )));
        }
        self.status = to;
        if to == CampaignStatus::Completed {
            self.completed_at = Some(at);
        }
        self.updated_at = at;
        Ok(())
    }

    pub fn schedule(&mut self, at: DateTime<Utc>, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(CampaignStatus::Scheduled, now)?;
        self.scheduled_at = Some(at);
        Ok(())
    }

    /// Enter `running` with a fixed recipient count. Idempotent while already running.
    pub fn start(&mut self, total_recipients: u64, at: DateTime<Utc>) -> DomainResult<()> {
        if self.status == CampaignStatus::Running {
            return Ok(());
        }
        self.transition(CampaignStatus::Running, at)?;
        self.total_recipients = total_recipients;
        self.started_at = Some(at);
        self.last_error = None;
        Ok(())
    }

    /// Launch failed: park the campaign as `paused` with the error for the tenant to see.
    pub fn fail_launch(&mut self, error: impl Into<String>, at: DateTime<Utc>) -> DomainResult<()> {
        if self.status.is_terminal() {
            return Err(DomainError::invalid_transition(self.status, CampaignStatus::Paused));
        }
        self.status = CampaignStatus::Paused;
        self.last_error = Some(error.into());
        self.updated_at = at;
        Ok(())
    }

    /// Count one outcome. Dispatch outcomes are refused once every recipient is accounted for.
    pub fn record(&mut self, counter: CampaignCounter, at: DateTime<Utc>) -> DomainResult<()> {
        if counter.is_dispatch_outcome() && self.dispatched() >= self.total_recipients {
            return Err(DomainError::invariant(format!(
                "campaign {} already accounts for all {} recipients",
                self.id, self.total_recipients
            )));
        }
        match counter {
            CampaignCounter::Sent => self.sent_count += 1,
            CampaignCounter::Delivered => self.delivered_count += 1,
            CampaignCounter::Read => self.read_count += 1,
            CampaignCounter::Failed => self.failed_count += 1,
        }
        self.updated_at = at;
        Ok(())
    }

    pub fn is_done(&self) -> bool {
        self.status == CampaignStatus::Running && self.dispatched() == self.total_recipients
    }

    /// `running → completed` when every recipient is accounted for. Returns whether it moved.
    pub fn complete_if_done(&mut self, at: DateTime<Utc>) -> bool {
        if !self.is_done() {
            return false;
        }
        self.transition(CampaignStatus::Completed, at).is_ok()
    }

    /// Content for one recipient, or `None` if the campaign has neither template nor text.
    pub fn content_for(&self, contact: &Contact) -> Option<MessageContent> {
        if let Some(template) = &self.template {
            return Some(MessageContent::Template(template.render(contact, &self.overrides)));
        }
        self.text
            .as_deref()
            .map(|text| MessageContent::text(render_text(text, contact, &self.overrides)))
    }

    pub fn progress(&self) -> CampaignProgress {
        let percentage = if self.total_recipients == 0 {
            0.0
        } else {
            (self.dispatched() as f64 / self.total_recipients as f64) * 100.0
        };
        CampaignProgress {
            status: self.status,
            total_recipients: self.total_recipients,
            sent: self.sent_count,
            delivered: self.delivered_count,
            read: self.read_count,
            failed: self.failed_count,
            percentage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn campaign() -> Campaign {
        Campaign::draft(TenantId::new(), AccountId::new(), "spring sale", Utc::now())
            .with_text("Hello {{first_name}}")
    }

    #[test]
    fn lifecycle_happy_path() {
        let mut c = campaign();
        c.start(2, Utc::now()).unwrap();
        assert_eq!(c.status, CampaignStatus::Running);

        c.record(CampaignCounter::Sent, Utc::now()).unwrap();
        assert!(!c.complete_if_done(Utc::now()));
        c.record(CampaignCounter::Failed, Utc::now()).unwrap();
        assert!(c.complete_if_done(Utc::now()));
        assert_eq!(c.status, CampaignStatus::Completed);
        assert!(c.completed_at.is_some());
    }

    #[test]
    fn completed_requires_all_recipients() {
        let mut c = campaign();
        c.start(3, Utc::now()).unwrap();
        c.record(CampaignCounter::Sent, Utc::now()).unwrap();
        assert!(matches!(
            c.transition(CampaignStatus::Completed, Utc::now()),
            Err(DomainError::InvariantViolation(_))
        ));
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let mut c = campaign();
        assert!(matches!(
            c.transition(CampaignStatus::Paused, Utc::now()),
            Err(DomainError::InvalidTransition { .. })
        ));
        c.start(1, Utc::now()).unwrap();
        c.transition(CampaignStatus::Cancelled, Utc::now()).unwrap();
        assert!(c.transition(CampaignStatus::Running, Utc::now()).is_err());
        assert!(c.fail_launch("boom", Utc::now()).is_err());
    }

    #[test]
    fn pause_resume_round_trip() {
        let mut c = campaign();
        c.start(10, Utc::now()).unwrap();
        c.transition(CampaignStatus::Paused, Utc::now()).unwrap();
        c.transition(CampaignStatus::Running, Utc::now()).unwrap();
        assert_eq!(c.status, CampaignStatus::Running);
    }

    #[test]
    fn failed_launch_parks_campaign_with_error() {
        let mut c = campaign();
        c.fail_launch("no recipients", Utc::now()).unwrap();
        assert_eq!(c.status, CampaignStatus::Paused);
        assert_eq!(c.last_error.as_deref(), Some("no recipients"));
    }

    #[test]
    fn content_prefers_template_over_text() {
        let contact = Contact::from_profile(TenantId::new(), "+1", Some("Lin"), Utc::now());
        let c = campaign();
        assert_eq!(c.content_for(&contact), Some(MessageContent::text("Hello Lin")));

        let c = c.with_template(CampaignTemplate {
            name: "welcome".into(),
            language: "en_US".into(),
            variables: vec![],
        });
        assert!(matches!(c.content_for(&contact), Some(MessageContent::Template(_))));
    }

    fn any_counter() -> impl Strategy<Value = CampaignCounter> {
        prop_oneof![
            Just(CampaignCounter::Sent),
            Just(CampaignCounter::Delivered),
            Just(CampaignCounter::Read),
            Just(CampaignCounter::Failed),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: `sent + failed` never exceeds the recipient count, and the campaign
        /// completes exactly when they are equal.
        #[test]
        fn counters_stay_bounded_and_completion_is_exact(
            total in 0u64..50,
            outcomes in prop::collection::vec(any_counter(), 0..120)
        ) {
            let mut c = campaign();
            c.start(total, Utc::now()).unwrap();

            for counter in outcomes {
                let _ = c.record(counter, Utc::now());
                prop_assert!(c.dispatched() <= c.total_recipients);

                c.complete_if_done(Utc::now());
                if c.status == CampaignStatus::Completed {
                    prop_assert_eq!(c.dispatched(), c.total_recipients);
                } else {
                    prop_assert!(c.dispatched() < c.total_recipients);
                }
            }
        }
    }
}
