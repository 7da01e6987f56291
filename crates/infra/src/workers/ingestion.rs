//! Inbound ingestion: one `inbound.process` job per webhook change.
//!
//! [`Ingestor`] only reads and writes the stores and reports what should happen
//! next as [`FollowUp`]s; [`IngestionWorker`] turns those into jobs (enrichment,
//! webhook fan-out, campaign outcomes). Absence (unknown account, unknown
//! provider message id, unsupported type) is an outcome, never an error.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use courier_core::{AccountId, CampaignId, ConversationId, MessageId, TenantId};
use courier_events::{
    ChangeValue, InboundMessage, MessageReceived, MessageStatusUpdated, PlatformEvent,
    StatusNotice,
};
use courier_messaging::{
    Account, CampaignCounter, Contact, Message, MessageStatus, StatusUpdate,
    Transition,
};

use super::campaign::RecordOutcome;
use super::enrichment::EnrichMessage;
use super::webhook::fan_out;
use super::WorkerError;
use crate::jobs::{Job, JobHandler, JobQueue, JobResult, RetryPolicy};
use crate::store::{Created, Stores};

/// Payload of an `inbound.process` job: one change of a provider webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInbound {
    pub account_id: AccountId,
    pub value: ChangeValue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Created { message_id: MessageId },
    /// Provider message id already ingested.
    Duplicate { message_id: MessageId },
    StatusApplied { message_id: MessageId, status: MessageStatus },
    /// Older than the message's current status; dropped.
    StatusStale { message_id: MessageId, status: MessageStatus },
    /// Status already in the history; follow-ups re-emitted.
    StatusReplayed { message_id: MessageId, status: MessageStatus },
    NotFound { provider_message_id: String },
    Unsupported { provider_message_id: String, kind: String },
    /// The account is not (or no longer) known for the tenant.
    TenantSkipped,
}

/// Work that should happen after an ingest step.
#[derive(Debug, Clone, PartialEq)]
pub enum FollowUp {
    Enrich { message_id: MessageId, conversation_id: ConversationId },
    Publish(PlatformEvent),
    CampaignOutcome {
        campaign_id: CampaignId,
        message_id: MessageId,
        counter: CampaignCounter,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestReport {
    pub outcomes: Vec<IngestOutcome>,
    pub follow_ups: Vec<FollowUp>,
}

impl IngestReport {
    fn outcome(&mut self, outcome: IngestOutcome) {
        self.outcomes.push(outcome);
    }

    fn follow(&mut self, follow_up: FollowUp) {
        self.follow_ups.push(follow_up);
    }
}

fn enrich_candidate(message: &Message) -> Option<FollowUp> {
    (message.insight.is_none() && message.content.plain_text().is_some()).then_some(FollowUp::Enrich {
        message_id: message.id,
        conversation_id: message.conversation_id,
    })
}

/// The store-facing half of ingestion.
#[derive(Clone)]
pub struct Ingestor {
    stores: Stores,
}

impl Ingestor {
    pub fn new(stores: Stores) -> Self {
        Self { stores }
    }

    pub async fn ingest(&self, tenant_id: TenantId, request: &ProcessInbound) -> Result<IngestReport, WorkerError> {
        let mut report = IngestReport::default();

        let Some(account) = self.stores.accounts.get(tenant_id, request.account_id).await? else {
            warn!(tenant_id = %tenant_id, account_id = %request.account_id, "inbound change for unknown account");
            report.outcome(IngestOutcome::TenantSkipped);
            return Ok(report);
        };
        let ai_enabled = self
            .stores
            .tenants
            .settings(tenant_id)
            .await?
            .is_some_and(|s| s.ai_enabled);

        for message in &request.value.messages {
            self.ingest_message(&account, &request.value, message, ai_enabled, &mut report)
                .await?;
        }
        for notice in &request.value.statuses {
            self.ingest_status(tenant_id, notice, &mut report).await?;
        }
        Ok(report)
    }

    async fn ingest_message(
        &self,
        account: &Account,
        value: &ChangeValue,
        inbound: &InboundMessage,
        ai_enabled: bool,
        report: &mut IngestReport,
    ) -> Result<(), WorkerError> {
        let tenant_id = account.tenant_id;
        let Some(content) = inbound.to_content() else {
            debug!(tenant_id = %tenant_id, kind = %inbound.kind, "unsupported inbound message type");
            report.outcome(IngestOutcome::Unsupported {
                provider_message_id: inbound.id.clone(),
                kind: inbound.kind.clone(),
            });
            return Ok(());
        };
        let at = inbound.received_at().unwrap_or_else(Utc::now);
        let contact_name = value.profile_name(&inbound.from).map(str::to_string);

        if let Some(existing) = self.stores.messages.find_by_provider_id(tenant_id, &inbound.id).await? {
            self.duplicate(existing, contact_name, ai_enabled, report);
            return Ok(());
        }

        let contact = self
            .stores
            .contacts
            .get_or_create(Contact::from_profile(
                tenant_id,
                inbound.from.clone(),
                contact_name.as_deref(),
                at,
            ))
            .await?
            .into_inner();
        let conversation = self
            .stores
            .conversations
            .get_or_open(tenant_id, contact.id, account.id, at)
            .await?;

        let message = Message::inbound(
            tenant_id,
            conversation.id,
            contact.id,
            account.id,
            inbound.from.clone(),
            inbound.id.clone(),
            content,
            at,
        );
        let message = match self.stores.messages.insert(message).await? {
            Created::New(message) => message,
            // Lost a race with a concurrent delivery of the same event
            Created::Existing(existing) => {
                self.duplicate(existing, contact_name, ai_enabled, report);
                return Ok(());
            }
        };

        info!(
            tenant_id = %tenant_id,
            message_id = %message.id,
            conversation_id = %conversation.id,
            message_type = %message.content.message_type(),
            "inbound message ingested"
        );
        report.outcome(IngestOutcome::Created { message_id: message.id });
        if ai_enabled {
            if let Some(enrich) = enrich_candidate(&message) {
                report.follow(enrich);
            }
        }
        report.follow(FollowUp::Publish(received_event(&message, contact_name)));
        Ok(())
    }

    /// A replayed message: nothing is written, follow-ups are re-emitted (they de-duplicate).
    fn duplicate(&self, existing: Message, contact_name: Option<String>, ai_enabled: bool, report: &mut IngestReport) {
        debug!(message_id = %existing.id, "inbound message already ingested");
        report.outcome(IngestOutcome::Duplicate { message_id: existing.id });
        if ai_enabled {
            if let Some(enrich) = enrich_candidate(&existing) {
                report.follow(enrich);
            }
        }
        report.follow(FollowUp::Publish(received_event(&existing, contact_name)));
    }

    async fn ingest_status(
        &self,
        tenant_id: TenantId,
        notice: &StatusNotice,
        report: &mut IngestReport,
    ) -> Result<(), WorkerError> {
        let Some(message) = self.stores.messages.find_by_provider_id(tenant_id, &notice.id).await? else {
            debug!(tenant_id = %tenant_id, provider_message_id = %notice.id, "status for unknown message");
            report.outcome(IngestOutcome::NotFound {
                provider_message_id: notice.id.clone(),
            });
            return Ok(());
        };
        let Some(status) = MessageStatus::from_provider(&notice.status) else {
            report.outcome(IngestOutcome::Unsupported {
                provider_message_id: notice.id.clone(),
                kind: notice.status.clone(),
            });
            return Ok(());
        };

        let at = notice.occurred_at().unwrap_or_else(Utc::now);
        let error = notice.error();
        let mut update = StatusUpdate::new(status, at);
        if let Some(error) = error.clone() {
            update = update.with_error(error);
        }
        let (transition, message) = self
            .stores
            .messages
            .apply_status(tenant_id, message.id, update)
            .await?;

        match transition {
            Transition::Applied => {
                debug!(message_id = %message.id, status = %status, "status applied");
                report.outcome(IngestOutcome::StatusApplied {
                    message_id: message.id,
                    status,
                });
            }
            Transition::Duplicate => report.outcome(IngestOutcome::StatusReplayed {
                message_id: message.id,
                status,
            }),
            Transition::Stale => {
                debug!(message_id = %message.id, status = %status, current = %message.status, "stale status dropped");
                report.outcome(IngestOutcome::StatusStale {
                    message_id: message.id,
                    status,
                });
                return Ok(());
            }
        }

        report.follow(FollowUp::Publish(status_event(&message, status, at, error)));
        let counter = match status {
            MessageStatus::Delivered => Some(CampaignCounter::Delivered),
            MessageStatus::Read => Some(CampaignCounter::Read),
            _ => None,
        };
        if let (Some(campaign_id), Some(counter)) = (message.campaign_id, counter) {
            report.follow(FollowUp::CampaignOutcome {
                campaign_id,
                message_id: message.id,
                counter,
            });
        }
        Ok(())
    }
}

fn received_event(message: &Message, contact_name: Option<String>) -> PlatformEvent {
    PlatformEvent::MessageReceived(MessageReceived {
        tenant_id: message.tenant_id,
        message_id: message.id,
        conversation_id: message.conversation_id,
        contact_id: message.contact_id,
        account_id: message.account_id,
        from: message.counterpart.clone(),
        contact_name,
        provider_message_id: message.provider_message_id.clone().unwrap_or_default(),
        message_type: message.content.message_type(),
        content: message.content.clone(),
        received_at: message.created_at,
    })
}

fn status_event(
    message: &Message,
    status: MessageStatus,
    at: DateTime<Utc>,
    error: Option<courier_messaging::DeliveryError>,
) -> PlatformEvent {
    PlatformEvent::MessageStatusUpdated(MessageStatusUpdated {
        tenant_id: message.tenant_id,
        message_id: message.id,
        conversation_id: message.conversation_id,
        provider_message_id: message.provider_message_id.clone().unwrap_or_default(),
        campaign_id: message.campaign_id,
        status,
        timestamp: at,
        error,
    })
}

/// Handles `inbound.process` jobs.
pub struct IngestionWorker {
    ingestor: Ingestor,
    stores: Stores,
    queue: Arc<dyn JobQueue>,
    webhook_retry: RetryPolicy,
}

impl IngestionWorker {
    pub fn new(stores: Stores, queue: Arc<dyn JobQueue>, webhook_retry: RetryPolicy) -> Self {
        Self {
            ingestor: Ingestor::new(stores.clone()),
            stores,
            queue,
            webhook_retry,
        }
    }

    /// Enqueue the jobs a report asks for. Every one is de-duplicated by key.
    pub async fn emit(&self, tenant_id: TenantId, follow_ups: Vec<FollowUp>) -> Result<(), WorkerError> {
        for follow_up in follow_ups {
            match follow_up {
                FollowUp::Enrich { message_id, .. } => {
                    let job = EnrichMessage { message_id }.into_job(tenant_id)?;
                    self.queue.enqueue(job).await?;
                }
                FollowUp::Publish(event) => {
                    fan_out(&self.stores, self.queue.as_ref(), tenant_id, &event, &self.webhook_retry).await?;
                }
                FollowUp::CampaignOutcome {
                    campaign_id,
                    message_id,
                    counter,
                } => {
                    let outcome = RecordOutcome {
                        campaign_id,
                        message_id,
                        counter,
                    };
                    self.queue.enqueue(outcome.into_job(tenant_id)?).await?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl JobHandler for IngestionWorker {
    async fn handle(&self, job: &Job) -> JobResult {
        let request: ProcessInbound = match job.payload() {
            Ok(request) => request,
            Err(err) => return JobResult::Abandon(format!("invalid inbound payload: {err}")),
        };

        let result = match self.ingestor.ingest(job.tenant_id, &request).await {
            Ok(report) => self.emit(job.tenant_id, report.follow_ups).await,
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => JobResult::Success,
            Err(err) => {
                warn!(tenant_id = %job.tenant_id, job_id = %job.id, error = %err, "inbound processing failed");
                JobResult::Failure(err.to_string())
            }
        }
    }
}
