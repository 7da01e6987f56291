//! Outbound delivery: one `message.send` job per message.
//!
//! Each attempt appends exactly one history entry: `sent` on success, a retry
//! (`pending` + error) while attempts remain, or `failed` when the error is
//! permanent or the last attempt is used up. Per-account throughput is the
//! queue's rate limit (jobs carry the account as rate key); the daily quota is
//! consumed atomically here.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use courier_core::{AccountId, CampaignId, ContactId, MessageId, TenantId};
use courier_messaging::{
    CampaignCounter, Contact, DeliveryError, Message, MessageContent, MessageStatus,
    QuotaDecision, StatusUpdate, Transition,
};

use super::campaign::CampaignOrchestrator;
use super::{WorkerError, keys};
use crate::jobs::{DEFAULT_PRIORITY, Job, JobHandler, JobKind, JobOptions, JobResult, RetryPolicy};
use crate::provider::{MessagingProvider, ProviderError, dispatch};
use crate::store::Stores;

fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

/// Payload of a `message.send` job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendMessage {
    pub message_id: MessageId,
    pub account_id: AccountId,
    /// Recipient phone number.
    pub to: String,
    /// Known recipient; resolved (or created) by phone number when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_id: Option<ContactId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<CampaignId>,
    pub content: MessageContent,
    #[serde(default = "default_priority")]
    pub priority: u8,
}

impl SendMessage {
    /// Keyed by message id and rate-limited per account. Campaign messages join the campaign group.
    pub fn into_job(self, tenant_id: TenantId, retry: RetryPolicy) -> Result<Job, WorkerError> {
        let mut options = JobOptions::default()
            .dedup(keys::message(self.message_id))
            .priority(self.priority)
            .retry(retry)
            .rate_key(self.account_id.to_string());
        if let Some(campaign_id) = self.campaign_id {
            options = options.group(keys::campaign_group(campaign_id));
        }
        Ok(Job::new(tenant_id, JobKind::SendMessage, serde_json::to_value(&self)?).with_options(options))
    }
}

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub provider_timeout: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            provider_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent { provider_message_id: String },
    /// The message already left `pending`; nothing was sent.
    AlreadyProcessed { status: MessageStatus },
    /// Daily quota exhausted until `until`.
    Deferred { until: DateTime<Utc> },
    /// Retryable failure with attempts left; a retry entry was recorded.
    Retrying { error: String },
    /// The message is now `failed`.
    Failed { error: String, retryable: bool },
}

/// Handles `message.send` jobs.
pub struct DeliveryWorker {
    stores: Stores,
    provider: Arc<dyn MessagingProvider>,
    campaigns: CampaignOrchestrator,
    config: DeliveryConfig,
}

impl DeliveryWorker {
    pub fn new(
        stores: Stores,
        provider: Arc<dyn MessagingProvider>,
        campaigns: CampaignOrchestrator,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            stores,
            provider,
            campaigns,
            config,
        }
    }

    /// The message record, created (with its conversation) on the first attempt.
    async fn ensure_message(&self, tenant_id: TenantId, send: &SendMessage) -> Result<Message, WorkerError> {
        if let Some(message) = self.stores.messages.get(tenant_id, send.message_id).await? {
            return Ok(message);
        }

        let now = Utc::now();
        let contact_id = match send.contact_id {
            Some(id) => id,
            None => {
                self.stores
                    .contacts
                    .get_or_create(Contact::new(tenant_id, send.to.clone(), now))
                    .await?
                    .into_inner()
                    .id
            }
        };
        let conversation = self
            .stores
            .conversations
            .get_or_open(tenant_id, contact_id, send.account_id, now)
            .await?;

        let message = Message::outbound(
            send.message_id,
            tenant_id,
            conversation.id,
            contact_id,
            send.account_id,
            send.campaign_id,
            send.to.clone(),
            send.content.clone(),
            now,
        );
        // Counted on the conversation by the same write
        Ok(self.stores.messages.insert(message).await?.into_inner())
    }

    /// Run one delivery attempt for the job.
    pub async fn deliver(&self, job: &Job) -> Result<DeliveryOutcome, WorkerError> {
        let send: SendMessage = job.payload()?;
        let tenant_id = job.tenant_id;

        let message = self.ensure_message(tenant_id, &send).await?;
        if message.status != MessageStatus::Pending {
            debug!(message_id = %message.id, status = %message.status, "message already processed");
            return Ok(DeliveryOutcome::AlreadyProcessed {
                status: message.status,
            });
        }

        let Some(account) = self.stores.accounts.get(tenant_id, send.account_id).await? else {
            let error = DeliveryError::new(
                Some("ACCOUNT_NOT_FOUND".to_string()),
                format!("account {} not found", send.account_id),
            );
            let text = error.message.clone();
            self.fail(tenant_id, &message, error).await?;
            return Ok(DeliveryOutcome::Failed {
                error: text,
                retryable: false,
            });
        };

        if let QuotaDecision::Exhausted { resets_at } = self
            .stores
            .accounts
            .try_consume_quota(tenant_id, account.id, Utc::now())
            .await?
        {
            info!(account_id = %account.id, resets_at = %resets_at, "daily quota exhausted");
            return Ok(DeliveryOutcome::Deferred { until: resets_at });
        }

        let sent = tokio::time::timeout(
            self.config.provider_timeout,
            dispatch(self.provider.as_ref(), &account, &send.to, &message.content),
        )
        .await
        .unwrap_or_else(|_| Err(ProviderError::timeout()));

        match sent {
            Ok(receipt) => {
                let update = StatusUpdate::new(MessageStatus::Sent, Utc::now())
                    .with_provider_message_id(receipt.provider_message_id.clone());
                let (transition, _) = self
                    .stores
                    .messages
                    .apply_status(tenant_id, message.id, update)
                    .await?;
                if transition == Transition::Applied {
                    if let Some(campaign_id) = message.campaign_id {
                        self.campaigns
                            .record_outcome(tenant_id, campaign_id, CampaignCounter::Sent)
                            .await?;
                    }
                }
                info!(
                    tenant_id = %tenant_id,
                    message_id = %message.id,
                    provider_message_id = %receipt.provider_message_id,
                    "message sent"
                );
                Ok(DeliveryOutcome::Sent {
                    provider_message_id: receipt.provider_message_id,
                })
            }
            Err(err) if err.retryable && !job.is_final_attempt() => {
                warn!(
                    tenant_id = %tenant_id,
                    message_id = %message.id,
                    attempt = job.attempt,
                    error = %err,
                    "send failed, will retry"
                );
                self.stores
                    .messages
                    .record_retry(tenant_id, message.id, Utc::now(), err.to_delivery_error())
                    .await?;
                Ok(DeliveryOutcome::Retrying {
                    error: err.to_string(),
                })
            }
            Err(err) => {
                warn!(
                    tenant_id = %tenant_id,
                    message_id = %message.id,
                    attempt = job.attempt,
                    error = %err,
                    "send failed"
                );
                self.fail(tenant_id, &message, err.to_delivery_error()).await?;
                Ok(DeliveryOutcome::Failed {
                    error: err.to_string(),
                    retryable: err.retryable,
                })
            }
        }
    }

    async fn fail(&self, tenant_id: TenantId, message: &Message, error: DeliveryError) -> Result<(), WorkerError> {
        let update = StatusUpdate::new(MessageStatus::Failed, Utc::now()).with_error(error);
        let (transition, _) = self
            .stores
            .messages
            .apply_status(tenant_id, message.id, update)
            .await?;
        if transition == Transition::Applied {
            if let Some(campaign_id) = message.campaign_id {
                self.campaigns
                    .record_outcome(tenant_id, campaign_id, CampaignCounter::Failed)
                    .await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl JobHandler for DeliveryWorker {
    async fn handle(&self, job: &Job) -> JobResult {
        match self.deliver(job).await {
            Ok(DeliveryOutcome::Sent { .. } | DeliveryOutcome::AlreadyProcessed { .. }) => JobResult::Success,
            Ok(DeliveryOutcome::Deferred { until }) => {
                JobResult::RetryAfter((until - Utc::now()).to_std().unwrap_or_default())
            }
            Ok(DeliveryOutcome::Retrying { error }) => JobResult::Failure(error),
            // Retryable errors on the last attempt stay failures so the broker records exhaustion
            Ok(DeliveryOutcome::Failed { error, retryable: true }) => JobResult::Failure(error),
            Ok(DeliveryOutcome::Failed { error, retryable: false }) => JobResult::Abandon(error),
            Err(WorkerError::Payload(err)) => JobResult::Abandon(format!("invalid message payload: {err}")),
            Err(err) => {
                warn!(tenant_id = %job.tenant_id, job_id = %job.id, error = %err, "delivery step failed");
                JobResult::Failure(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::InMemoryJobQueue;
    use crate::provider::SendReceipt;
    use crate::workers::CampaignConfig;
    use courier_messaging::{
        Account, Campaign, CampaignStatus, InteractiveContent, LocationContent, MediaContent,
        MediaRef, TemplateContent,
    };
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Provider answering from a script; succeeds once the script runs out.
    #[derive(Default)]
    struct Scripted {
        answers: Mutex<VecDeque<Result<SendReceipt, ProviderError>>>,
        calls: Mutex<u32>,
        stall: bool,
    }

    impl Scripted {
        fn answering(answers: Vec<Result<SendReceipt, ProviderError>>) -> Arc<Self> {
            Arc::new(Self {
                answers: Mutex::new(answers.into()),
                ..Default::default()
            })
        }

        async fn next(&self) -> Result<SendReceipt, ProviderError> {
            if self.stall {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            self.answers.lock().unwrap().pop_front().unwrap_or_else(|| {
                Ok(SendReceipt {
                    provider_message_id: format!("wamid.{calls}"),
                })
            })
        }
    }

    #[async_trait]
    impl MessagingProvider for Scripted {
        async fn send_text(&self, _: &Account, _: &str, _: &str, _: bool) -> Result<SendReceipt, ProviderError> {
            self.next().await
        }
        async fn send_media(&self, _: &Account, _: &str, _: &MediaContent) -> Result<SendReceipt, ProviderError> {
            self.next().await
        }
        async fn send_document(
            &self,
            _: &Account,
            _: &str,
            _: &MediaRef,
            _: Option<&str>,
            _: Option<&str>,
        ) -> Result<SendReceipt, ProviderError> {
            self.next().await
        }
        async fn send_template(&self, _: &Account, _: &str, _: &TemplateContent) -> Result<SendReceipt, ProviderError> {
            self.next().await
        }
        async fn send_location(&self, _: &Account, _: &str, _: &LocationContent) -> Result<SendReceipt, ProviderError> {
            self.next().await
        }
        async fn send_interactive(
            &self,
            _: &Account,
            _: &str,
            _: &InteractiveContent,
        ) -> Result<SendReceipt, ProviderError> {
            self.next().await
        }
    }

    struct Fixture {
        tenant: TenantId,
        stores: Stores,
        account: Account,
    }

    async fn fixture(daily_limit: u32) -> Fixture {
        let tenant = TenantId::new();
        let stores = Stores::in_memory();
        let account = Account::new(tenant, "PNID", "+15550000000", Utc::now()).with_daily_limit(daily_limit);
        stores.accounts.upsert(account.clone()).await.unwrap();
        Fixture {
            tenant,
            stores,
            account,
        }
    }

    fn worker(f: &Fixture, provider: Arc<dyn MessagingProvider>, timeout: Duration) -> DeliveryWorker {
        let campaigns = CampaignOrchestrator::new(f.stores.clone(), InMemoryJobQueue::arc(), CampaignConfig::default());
        DeliveryWorker::new(
            f.stores.clone(),
            provider,
            campaigns,
            DeliveryConfig {
                provider_timeout: timeout,
            },
        )
    }

    fn job(f: &Fixture, campaign_id: Option<CampaignId>, attempt: u32) -> Job {
        let send = SendMessage {
            message_id: MessageId::new(),
            account_id: f.account.id,
            to: "+15551234567".into(),
            contact_id: None,
            campaign_id,
            content: MessageContent::text("hello"),
            priority: DEFAULT_PRIORITY,
        };
        let mut job = send.into_job(f.tenant, RetryPolicy::default()).unwrap();
        job.attempt = attempt;
        job
    }

    fn message_id(job: &Job) -> MessageId {
        job.payload::<SendMessage>().unwrap().message_id
    }

    #[tokio::test]
    async fn success_records_sent_and_creates_conversation() {
        let f = fixture(10).await;
        let worker = worker(&f, Scripted::answering(vec![]), Duration::from_secs(1));
        let job = job(&f, None, 1);

        assert_eq!(worker.handle(&job).await, JobResult::Success);

        let message = f.stores.messages.get(f.tenant, message_id(&job)).await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Sent);
        assert_eq!(message.provider_message_id.as_deref(), Some("wamid.1"));
        assert_eq!(message.history.len(), 2);

        let conversation = f
            .stores
            .conversations
            .get(f.tenant, message.conversation_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conversation.outgoing_count, 1);
    }

    #[tokio::test]
    async fn redelivered_job_is_a_no_op() {
        let f = fixture(10).await;
        let provider = Scripted::answering(vec![]);
        let worker = worker(&f, provider.clone(), Duration::from_secs(1));
        let job = job(&f, None, 1);

        worker.handle(&job).await;
        assert_eq!(
            worker.deliver(&job).await.unwrap(),
            DeliveryOutcome::AlreadyProcessed {
                status: MessageStatus::Sent
            }
        );
        assert_eq!(*provider.calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn retryable_error_records_one_retry_entry() {
        let f = fixture(10).await;
        let provider = Scripted::answering(vec![Err(ProviderError::retryable(Some("131000".into()), "try later"))]);
        let worker = worker(&f, provider, Duration::from_secs(1));
        let job = job(&f, None, 1);

        assert!(matches!(worker.handle(&job).await, JobResult::Failure(_)));

        let message = f.stores.messages.get(f.tenant, message_id(&job)).await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Pending);
        assert_eq!(message.history.len(), 2);
        assert_eq!(
            message.error.as_ref().and_then(|e| e.code.as_deref()),
            Some("131000")
        );
    }

    #[tokio::test]
    async fn final_attempt_marks_failed_and_counts_campaign_failure() {
        let f = fixture(10).await;
        let mut campaign = Campaign::draft(f.tenant, f.account.id, "promo", Utc::now()).with_text("hi");
        campaign.start(1, Utc::now()).unwrap();
        f.stores.campaigns.upsert(campaign.clone()).await.unwrap();

        let provider = Scripted::answering(vec![Err(ProviderError::timeout())]);
        let worker = worker(&f, provider, Duration::from_secs(1));
        let job = job(&f, Some(campaign.id), 3);

        assert!(matches!(worker.handle(&job).await, JobResult::Failure(_)));

        let message = f.stores.messages.get(f.tenant, message_id(&job)).await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Failed);

        let campaign = f.stores.campaigns.get(f.tenant, campaign.id).await.unwrap().unwrap();
        assert_eq!(campaign.failed_count, 1);
        assert_eq!(campaign.status, CampaignStatus::Completed);
    }

    #[tokio::test]
    async fn permanent_error_abandons_immediately() {
        let f = fixture(10).await;
        let provider = Scripted::answering(vec![Err(ProviderError::permanent(Some("131026".into()), "undeliverable"))]);
        let worker = worker(&f, provider, Duration::from_secs(1));
        let job = job(&f, None, 1);

        assert!(matches!(worker.handle(&job).await, JobResult::Abandon(_)));
        let message = f.stores.messages.get(f.tenant, message_id(&job)).await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Failed);
    }

    #[tokio::test]
    async fn exhausted_quota_defers_without_sending() {
        let f = fixture(0).await;
        let provider = Scripted::answering(vec![]);
        let worker = worker(&f, provider.clone(), Duration::from_secs(1));
        let job = job(&f, None, 1);

        assert!(matches!(worker.handle(&job).await, JobResult::RetryAfter(_)));
        assert_eq!(*provider.calls.lock().unwrap(), 0);

        let message = f.stores.messages.get(f.tenant, message_id(&job)).await.unwrap().unwrap();
        assert_eq!(message.history.len(), 1);
    }

    #[tokio::test]
    async fn provider_timeout_is_retryable() {
        let f = fixture(10).await;
        let provider = Arc::new(Scripted {
            stall: true,
            ..Default::default()
        });
        let worker = worker(&f, provider, Duration::from_millis(20));
        let job = job(&f, None, 1);

        match worker.deliver(&job).await.unwrap() {
            DeliveryOutcome::Retrying { error } => assert!(error.contains("TIMEOUT")),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_account_fails_the_message() {
        let f = fixture(10).await;
        let worker = worker(&f, Scripted::answering(vec![]), Duration::from_secs(1));
        let mut job = job(&f, None, 1);
        let mut send: SendMessage = job.payload().unwrap();
        send.account_id = AccountId::new();
        job.payload = serde_json::to_value(&send).unwrap();

        assert!(matches!(worker.handle(&job).await, JobResult::Abandon(_)));
        let message = f.stores.messages.get(f.tenant, send.message_id).await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Failed);
    }
}
