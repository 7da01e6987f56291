//! Campaign orchestration: launch, batch fan-out, progress and lifecycle control.
//!
//! ```text
//! campaign.launch ──► campaign.batch × ⌈n / batch_size⌉ ──► message.send × n
//!                                                              │
//!                         sent / failed counters ◄─────────────┘
//! ```
//!
//! Every job a campaign owns (launch, batches, message sends) carries the group key
//! `campaign:<id>`, which is what pause / resume / cancel act on.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use courier_core::{CampaignId, ContactId, MessageId, TenantId};
use courier_messaging::{Campaign, CampaignCounter, CampaignProgress, CampaignStatus};

use super::delivery::SendMessage;
use super::{WorkerError, keys};
use crate::jobs::{
    DEFAULT_PRIORITY, Job, JobHandler, JobKind, JobOptions, JobQueue, JobResult, JobStats,
    RetryPolicy,
};
use crate::store::{CampaignChange, StoreError, Stores};

#[derive(Debug, Clone)]
pub struct CampaignConfig {
    pub batch_size: usize,
    /// Pause `enqueue_pause` after this many batch submissions.
    pub pause_every: u32,
    pub enqueue_pause: Duration,
    /// How long a batch claimed while its campaign is paused waits before re-checking.
    pub paused_batch_delay: Duration,
    pub message_retry: RetryPolicy,
    pub message_priority: u8,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            pause_every: 10,
            enqueue_pause: Duration::from_millis(100),
            paused_batch_delay: Duration::from_secs(30),
            message_retry: RetryPolicy::default(),
            message_priority: DEFAULT_PRIORITY,
        }
    }
}

/// Payload of a `campaign.launch` job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchCampaign {
    pub campaign_id: CampaignId,
    /// Explicit recipients; the campaign's audience selection when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipients: Option<Vec<ContactId>>,
}

/// Payload of a `campaign.batch` job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessBatch {
    pub campaign_id: CampaignId,
    /// 1-based.
    pub batch_number: u32,
    pub contact_ids: Vec<ContactId>,
}

/// Payload of a `campaign.outcome` job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordOutcome {
    pub campaign_id: CampaignId,
    pub message_id: MessageId,
    pub counter: CampaignCounter,
}

impl RecordOutcome {
    pub fn into_job(self, tenant_id: TenantId) -> Result<Job, WorkerError> {
        let options = JobOptions::default().dedup(keys::campaign_outcome(
            self.campaign_id,
            self.message_id,
            self.counter,
        ));
        Ok(Job::new(tenant_id, JobKind::RecordOutcome, serde_json::to_value(self)?).with_options(options))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    Started { recipients: usize, batches: usize },
    /// Already running (job retry): batches re-enqueued, existing ones de-duplicated.
    Reenqueued { batches: usize },
    /// Validation failed; the campaign was parked as paused with the error.
    Failed { error: String },
    Skipped { status: CampaignStatus },
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    Enqueued { messages: usize, unresolved: usize },
    /// Campaign is paused; the batch waits.
    Deferred,
    /// Campaign is neither running nor paused; nothing to do.
    Skipped,
}

/// Progress of a campaign plus the state of the jobs it still owns.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CampaignReport {
    pub campaign_id: CampaignId,
    pub progress: CampaignProgress,
    pub jobs: JobStats,
}

/// Stable message id of one campaign recipient, so replayed batches cannot double-send.
pub fn campaign_message_id(campaign_id: CampaignId, contact_id: ContactId) -> MessageId {
    MessageId::from_uuid(Uuid::new_v5(campaign_id.as_uuid(), contact_id.as_uuid().as_bytes()))
}

/// Drop repeated contacts, keeping each first occurrence in order.
///
/// A repeat maps to the same message id, so counting it would leave the campaign
/// waiting on an outcome that never arrives.
pub fn unique_recipients(ids: impl IntoIterator<Item = ContactId>) -> Vec<ContactId> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(*id)).collect()
}

#[derive(Clone)]
pub struct CampaignOrchestrator {
    stores: Stores,
    queue: Arc<dyn JobQueue>,
    config: CampaignConfig,
}

impl CampaignOrchestrator {
    pub fn new(stores: Stores, queue: Arc<dyn JobQueue>, config: CampaignConfig) -> Self {
        Self {
            stores,
            queue,
            config,
        }
    }

    fn launch_job(
        &self,
        tenant_id: TenantId,
        launch: &LaunchCampaign,
        dedup_key: String,
        delay: Option<Duration>,
    ) -> Result<Job, WorkerError> {
        let mut options = JobOptions::default()
            .dedup(dedup_key)
            .group(keys::campaign_group(launch.campaign_id));
        if let Some(delay) = delay {
            options = options.delay(delay);
        }
        Ok(Job::new(tenant_id, JobKind::LaunchCampaign, serde_json::to_value(launch)?).with_options(options))
    }

    /// `draft → scheduled`, with a launch job delayed until `at`.
    pub async fn schedule(
        &self,
        tenant_id: TenantId,
        campaign_id: CampaignId,
        at: chrono::DateTime<Utc>,
    ) -> Result<Campaign, WorkerError> {
        let now = Utc::now();
        let campaign = self
            .stores
            .campaigns
            .modify(tenant_id, campaign_id, CampaignChange::Schedule { at }, now)
            .await?;

        let delay = (at - now).to_std().unwrap_or_default();
        let launch = LaunchCampaign {
            campaign_id,
            recipients: None,
        };
        let job = self.launch_job(tenant_id, &launch, keys::campaign_launch(campaign_id), Some(delay))?;
        self.queue.enqueue(job).await?;
        info!(tenant_id = %tenant_id, campaign_id = %campaign_id, at = %at, "campaign scheduled");
        Ok(campaign)
    }

    /// Enqueue an immediate launch.
    pub async fn request_launch(
        &self,
        tenant_id: TenantId,
        campaign_id: CampaignId,
        recipients: Option<Vec<ContactId>>,
    ) -> Result<bool, WorkerError> {
        let launch = LaunchCampaign {
            campaign_id,
            recipients,
        };
        let job = self.launch_job(tenant_id, &launch, keys::campaign_launch(campaign_id), None)?;
        Ok(self.queue.enqueue(job).await?.created)
    }

    /// Mark the campaign running and split its recipients into batch jobs.
    pub async fn launch(
        &self,
        tenant_id: TenantId,
        launch: &LaunchCampaign,
    ) -> Result<LaunchOutcome, WorkerError> {
        let Some(campaign) = self.stores.campaigns.get(tenant_id, launch.campaign_id).await? else {
            warn!(tenant_id = %tenant_id, campaign_id = %launch.campaign_id, "launch of unknown campaign");
            return Ok(LaunchOutcome::Missing);
        };

        let running = campaign.status == CampaignStatus::Running;
        let launchable = matches!(campaign.status, CampaignStatus::Draft | CampaignStatus::Scheduled)
            || (campaign.status == CampaignStatus::Paused && campaign.started_at.is_none());
        if !running && !launchable {
            debug!(campaign_id = %campaign.id, status = %campaign.status, "launch skipped");
            return Ok(LaunchOutcome::Skipped {
                status: campaign.status,
            });
        }

        let recipients = match &launch.recipients {
            Some(ids) => unique_recipients(ids.iter().copied()),
            None => unique_recipients(self.stores.contacts.select(tenant_id, &campaign.audience).await?),
        };

        if running {
            let batches = self.enqueue_batches(&campaign, &recipients).await?;
            return Ok(LaunchOutcome::Reenqueued { batches });
        }

        let problem = if campaign.template.is_none() && campaign.text.is_none() {
            Some("campaign has neither a template nor a text body")
        } else if recipients.is_empty() {
            Some("campaign audience is empty")
        } else {
            None
        };
        if let Some(problem) = problem {
            self.fail_launch(tenant_id, campaign.id, problem).await?;
            return Ok(LaunchOutcome::Failed {
                error: problem.to_string(),
            });
        }

        let change = CampaignChange::Start {
            total_recipients: recipients.len() as u64,
        };
        let campaign = match self
            .stores
            .campaigns
            .modify(tenant_id, campaign.id, change, Utc::now())
            .await
        {
            Ok(campaign) => campaign,
            // Cancelled between the read and the write
            Err(StoreError::Domain(err)) => {
                warn!(campaign_id = %launch.campaign_id, error = %err, "campaign could not start");
                return Ok(LaunchOutcome::Skipped {
                    status: CampaignStatus::Cancelled,
                });
            }
            Err(err) => return Err(err.into()),
        };

        let batches = self.enqueue_batches(&campaign, &recipients).await?;
        info!(
            tenant_id = %tenant_id,
            campaign_id = %campaign.id,
            recipients = recipients.len(),
            batches,
            "campaign launched"
        );
        Ok(LaunchOutcome::Started {
            recipients: recipients.len(),
            batches,
        })
    }

    async fn fail_launch(
        &self,
        tenant_id: TenantId,
        campaign_id: CampaignId,
        error: &str,
    ) -> Result<(), WorkerError> {
        warn!(tenant_id = %tenant_id, campaign_id = %campaign_id, error, "campaign launch failed");
        let change = CampaignChange::FailLaunch {
            error: error.to_string(),
        };
        self.stores
            .campaigns
            .modify(tenant_id, campaign_id, change, Utc::now())
            .await?;
        Ok(())
    }

    async fn enqueue_batches(
        &self,
        campaign: &Campaign,
        recipients: &[ContactId],
    ) -> Result<usize, WorkerError> {
        let mut submitted = 0usize;
        for (index, chunk) in recipients.chunks(self.config.batch_size.max(1)).enumerate() {
            let batch_number = index as u32 + 1;
            let batch = ProcessBatch {
                campaign_id: campaign.id,
                batch_number,
                contact_ids: chunk.to_vec(),
            };
            let options = JobOptions::default()
                .dedup(keys::campaign_batch(campaign.id, batch_number))
                .group(keys::campaign_group(campaign.id));
            let job = Job::new(campaign.tenant_id, JobKind::ProcessBatch, serde_json::to_value(&batch)?)
                .with_options(options);
            self.queue.enqueue(job).await?;
            submitted += 1;

            if self.config.pause_every > 0 && batch_number % self.config.pause_every == 0 {
                tokio::time::sleep(self.config.enqueue_pause).await;
            }
        }
        Ok(submitted)
    }

    /// Turn one batch of recipients into message jobs.
    pub async fn process_batch(
        &self,
        tenant_id: TenantId,
        batch: &ProcessBatch,
    ) -> Result<BatchOutcome, WorkerError> {
        let Some(campaign) = self.stores.campaigns.get(tenant_id, batch.campaign_id).await? else {
            return Ok(BatchOutcome::Skipped);
        };
        match campaign.status {
            CampaignStatus::Running => {}
            CampaignStatus::Paused => return Ok(BatchOutcome::Deferred),
            status => {
                debug!(campaign_id = %campaign.id, batch = batch.batch_number, status = %status, "batch skipped");
                return Ok(BatchOutcome::Skipped);
            }
        }

        let contact_ids = unique_recipients(batch.contact_ids.iter().copied());
        let mut jobs = Vec::with_capacity(contact_ids.len());
        let mut unresolved = Vec::new();
        for contact_id in &contact_ids {
            let message_id = campaign_message_id(campaign.id, *contact_id);
            let contact = self
                .stores
                .contacts
                .get(tenant_id, *contact_id)
                .await?
                .filter(|c| c.can_receive_campaigns());
            let send = contact.and_then(|contact| {
                campaign.content_for(&contact).map(|content| SendMessage {
                    message_id,
                    account_id: campaign.account_id,
                    to: contact.phone_number.clone(),
                    contact_id: Some(contact.id),
                    campaign_id: Some(campaign.id),
                    content,
                    priority: self.config.message_priority,
                })
            });
            match send {
                Some(send) => jobs.push(send.into_job(tenant_id, self.config.message_retry.clone())?),
                None => unresolved.push(message_id),
            }
        }

        let messages = jobs.len();
        self.queue.enqueue_bulk(jobs).await?;

        // Unreachable recipients count as failed so the campaign can still complete
        let mut outcomes = Vec::with_capacity(unresolved.len());
        for message_id in &unresolved {
            let outcome = RecordOutcome {
                campaign_id: campaign.id,
                message_id: *message_id,
                counter: CampaignCounter::Failed,
            };
            outcomes.push(outcome.into_job(tenant_id)?);
        }
        self.queue.enqueue_bulk(outcomes).await?;

        debug!(
            campaign_id = %campaign.id,
            batch = batch.batch_number,
            messages,
            unresolved = unresolved.len(),
            "batch enqueued"
        );
        self.check_completion(tenant_id, campaign.id).await?;
        Ok(BatchOutcome::Enqueued {
            messages,
            unresolved: unresolved.len(),
        })
    }

    /// Count one outcome, then complete the campaign if that was the last one.
    pub async fn record_outcome(
        &self,
        tenant_id: TenantId,
        campaign_id: CampaignId,
        counter: CampaignCounter,
    ) -> Result<Option<Campaign>, WorkerError> {
        let updated = match self
            .stores
            .campaigns
            .increment(tenant_id, campaign_id, counter, Utc::now())
            .await
        {
            Ok(updated) => updated,
            Err(StoreError::NotFound { .. }) => {
                warn!(tenant_id = %tenant_id, campaign_id = %campaign_id, "outcome for unknown campaign");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        if updated.is_none() {
            warn!(campaign_id = %campaign_id, counter = ?counter, "outcome refused: every recipient already accounted for");
        }
        if counter.is_dispatch_outcome() {
            self.check_completion(tenant_id, campaign_id).await?;
        }
        Ok(updated)
    }

    /// `running → completed` once `sent + failed == total`. Returns whether it moved.
    pub async fn check_completion(
        &self,
        tenant_id: TenantId,
        campaign_id: CampaignId,
    ) -> Result<bool, WorkerError> {
        match self
            .stores
            .campaigns
            .complete_if_done(tenant_id, campaign_id, Utc::now())
            .await?
        {
            Some(campaign) => {
                info!(
                    tenant_id = %tenant_id,
                    campaign_id = %campaign_id,
                    sent = campaign.sent_count,
                    failed = campaign.failed_count,
                    "campaign completed"
                );
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Stop issuing work for the campaign. Jobs already running finish on their own.
    pub async fn pause(&self, tenant_id: TenantId, campaign_id: CampaignId) -> Result<usize, WorkerError> {
        self.stores
            .campaigns
            .modify(
                tenant_id,
                campaign_id,
                CampaignChange::Transition(CampaignStatus::Paused),
                Utc::now(),
            )
            .await?;
        let held = self
            .queue
            .pause_group(tenant_id, &keys::campaign_group(campaign_id))
            .await?;
        info!(tenant_id = %tenant_id, campaign_id = %campaign_id, held, "campaign paused");
        Ok(held)
    }

    pub async fn resume(&self, tenant_id: TenantId, campaign_id: CampaignId) -> Result<usize, WorkerError> {
        let campaign = self
            .stores
            .campaigns
            .get(tenant_id, campaign_id)
            .await?
            .ok_or_else(|| StoreError::not_found("campaign", campaign_id))?;

        if campaign.status == CampaignStatus::Paused && campaign.started_at.is_none() {
            // Parked by a failed launch: run the launch again
            let launch = LaunchCampaign {
                campaign_id,
                recipients: None,
            };
            let key = format!(
                "{}:{}",
                keys::campaign_launch(campaign_id),
                campaign.updated_at.timestamp_millis()
            );
            let job = self.launch_job(tenant_id, &launch, key, None)?;
            self.queue.enqueue(job).await?;
            info!(tenant_id = %tenant_id, campaign_id = %campaign_id, "campaign relaunch requested");
            return Ok(0);
        }

        self.stores
            .campaigns
            .modify(
                tenant_id,
                campaign_id,
                CampaignChange::Transition(CampaignStatus::Running),
                Utc::now(),
            )
            .await?;
        let released = self
            .queue
            .resume_group(tenant_id, &keys::campaign_group(campaign_id))
            .await?;
        info!(tenant_id = %tenant_id, campaign_id = %campaign_id, released, "campaign resumed");
        self.check_completion(tenant_id, campaign_id).await?;
        Ok(released)
    }

    pub async fn cancel(&self, tenant_id: TenantId, campaign_id: CampaignId) -> Result<usize, WorkerError> {
        self.stores
            .campaigns
            .modify(
                tenant_id,
                campaign_id,
                CampaignChange::Transition(CampaignStatus::Cancelled),
                Utc::now(),
            )
            .await?;
        let cancelled = self
            .queue
            .cancel_group(tenant_id, &keys::campaign_group(campaign_id))
            .await?;
        info!(tenant_id = %tenant_id, campaign_id = %campaign_id, cancelled, "campaign cancelled");
        Ok(cancelled)
    }

    pub async fn progress(
        &self,
        tenant_id: TenantId,
        campaign_id: CampaignId,
    ) -> Result<CampaignReport, WorkerError> {
        let campaign = self
            .stores
            .campaigns
            .get(tenant_id, campaign_id)
            .await?
            .ok_or_else(|| StoreError::not_found("campaign", campaign_id))?;
        let jobs = self
            .queue
            .group_stats(tenant_id, &keys::campaign_group(campaign_id))
            .await?;
        Ok(CampaignReport {
            campaign_id,
            progress: campaign.progress(),
            jobs,
        })
    }

    async fn handle_launch(&self, job: &Job) -> Result<JobResult, WorkerError> {
        let launch: LaunchCampaign = match job.payload() {
            Ok(launch) => launch,
            Err(err) => return Ok(JobResult::Abandon(format!("invalid launch payload: {err}"))),
        };
        match self.launch(job.tenant_id, &launch).await {
            Ok(_) => Ok(JobResult::Success),
            Err(err) if job.is_final_attempt() => {
                // Surface the failure on the campaign instead of the queue
                self.fail_launch(job.tenant_id, launch.campaign_id, &err.to_string())
                    .await?;
                Ok(JobResult::Success)
            }
            Err(err) => Err(err),
        }
    }

    async fn handle_batch(&self, job: &Job) -> Result<JobResult, WorkerError> {
        let batch: ProcessBatch = match job.payload() {
            Ok(batch) => batch,
            Err(err) => return Ok(JobResult::Abandon(format!("invalid batch payload: {err}"))),
        };
        Ok(match self.process_batch(job.tenant_id, &batch).await? {
            BatchOutcome::Deferred => JobResult::RetryAfter(self.config.paused_batch_delay),
            BatchOutcome::Enqueued { .. } | BatchOutcome::Skipped => JobResult::Success,
        })
    }

    async fn handle_outcome(&self, job: &Job) -> Result<JobResult, WorkerError> {
        let outcome: RecordOutcome = match job.payload() {
            Ok(outcome) => outcome,
            Err(err) => return Ok(JobResult::Abandon(format!("invalid outcome payload: {err}"))),
        };
        self.record_outcome(job.tenant_id, outcome.campaign_id, outcome.counter)
            .await?;
        Ok(JobResult::Success)
    }
}

#[async_trait]
impl JobHandler for CampaignOrchestrator {
    async fn handle(&self, job: &Job) -> JobResult {
        let result = match job.kind {
            JobKind::LaunchCampaign => self.handle_launch(job).await,
            JobKind::ProcessBatch => self.handle_batch(job).await,
            JobKind::RecordOutcome => self.handle_outcome(job).await,
            other => {
                return JobResult::Abandon(format!("{other} jobs are not campaign jobs"));
            }
        };
        result.unwrap_or_else(|err| {
            warn!(tenant_id = %job.tenant_id, job_id = %job.id, kind = %job.kind, error = %err, "campaign job failed");
            JobResult::Failure(err.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{InMemoryJobQueue, JobStatus, queues};
    use crate::store::InMemoryStore;
    use courier_messaging::{Account, AudienceSelection, ConsentStatus, Contact};

    fn test_tenant() -> TenantId {
        TenantId::new()
    }

    struct Fixture {
        tenant: TenantId,
        stores: Stores,
        queue: Arc<InMemoryJobQueue>,
        orchestrator: CampaignOrchestrator,
        campaign: Campaign,
        contacts: Vec<ContactId>,
    }

    async fn fixture(recipients: usize) -> Fixture {
        let tenant = test_tenant();
        let stores = Stores::from_backend(Arc::new(InMemoryStore::new()));
        let queue = InMemoryJobQueue::arc();
        let now = Utc::now();

        let account = Account::new(tenant, "PNID", "+15550000000", now);
        stores.accounts.upsert(account.clone()).await.unwrap();

        let mut contacts = Vec::new();
        for i in 0..recipients {
            let mut contact = Contact::new(tenant, format!("+1555{i:07}"), now);
            contact.tags.insert("vip".into());
            contacts.push(contact.id);
            stores.contacts.upsert(contact).await.unwrap();
        }

        let campaign = Campaign::draft(tenant, account.id, "spring", now)
            .with_text("Hi {{first_name}}")
            .with_audience(AudienceSelection {
                contact_ids: Vec::new(),
                tags: vec!["vip".into()],
            });
        stores.campaigns.upsert(campaign.clone()).await.unwrap();

        let config = CampaignConfig {
            enqueue_pause: Duration::ZERO,
            ..CampaignConfig::default()
        };
        let orchestrator = CampaignOrchestrator::new(stores.clone(), queue.clone(), config);
        Fixture {
            tenant,
            stores,
            queue,
            orchestrator,
            campaign,
            contacts,
        }
    }

    fn launch_of(campaign: &Campaign) -> LaunchCampaign {
        LaunchCampaign {
            campaign_id: campaign.id,
            recipients: None,
        }
    }

    #[tokio::test]
    async fn launch_splits_recipients_into_batches() {
        let f = fixture(250).await;

        let outcome = f.orchestrator.launch(f.tenant, &launch_of(&f.campaign)).await.unwrap();
        assert_eq!(
            outcome,
            LaunchOutcome::Started {
                recipients: 250,
                batches: 3
            }
        );

        let mut sizes: Vec<(u32, usize)> = f
            .queue
            .waiting(queues::CAMPAIGNS)
            .unwrap()
            .iter()
            .map(|job| {
                let batch: ProcessBatch = job.payload().unwrap();
                (batch.batch_number, batch.contact_ids.len())
            })
            .collect();
        sizes.sort();
        assert_eq!(sizes, vec![(1, 100), (2, 100), (3, 50)]);

        let campaign = f.stores.campaigns.get(f.tenant, f.campaign.id).await.unwrap().unwrap();
        assert_eq!(campaign.status, CampaignStatus::Running);
        assert_eq!(campaign.total_recipients, 250);
    }

    #[tokio::test]
    async fn relaunching_a_running_campaign_is_idempotent() {
        let f = fixture(150).await;
        f.orchestrator.launch(f.tenant, &launch_of(&f.campaign)).await.unwrap();

        let again = f.orchestrator.launch(f.tenant, &launch_of(&f.campaign)).await.unwrap();
        assert_eq!(again, LaunchOutcome::Reenqueued { batches: 2 });
        assert_eq!(f.queue.waiting(queues::CAMPAIGNS).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn empty_audience_parks_the_campaign() {
        let f = fixture(0).await;

        let outcome = f.orchestrator.launch(f.tenant, &launch_of(&f.campaign)).await.unwrap();
        assert!(matches!(outcome, LaunchOutcome::Failed { .. }));

        let campaign = f.stores.campaigns.get(f.tenant, f.campaign.id).await.unwrap().unwrap();
        assert_eq!(campaign.status, CampaignStatus::Paused);
        assert_eq!(campaign.last_error.as_deref(), Some("campaign audience is empty"));
        assert!(f.queue.waiting(queues::CAMPAIGNS).unwrap().is_empty());
    }

    #[tokio::test]
    async fn batch_enqueues_messages_in_the_campaign_group() {
        let f = fixture(3).await;
        f.orchestrator.launch(f.tenant, &launch_of(&f.campaign)).await.unwrap();

        let batch = ProcessBatch {
            campaign_id: f.campaign.id,
            batch_number: 1,
            contact_ids: f.contacts.clone(),
        };
        let outcome = f.orchestrator.process_batch(f.tenant, &batch).await.unwrap();
        assert_eq!(
            outcome,
            BatchOutcome::Enqueued {
                messages: 3,
                unresolved: 0
            }
        );

        let messages = f.queue.waiting(queues::MESSAGES).unwrap();
        assert_eq!(messages.len(), 3);
        let group = keys::campaign_group(f.campaign.id);
        assert!(messages.iter().all(|j| j.group.as_deref() == Some(group.as_str())));

        // Replaying the batch adds nothing
        f.orchestrator.process_batch(f.tenant, &batch).await.unwrap();
        assert_eq!(f.queue.waiting(queues::MESSAGES).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn unreachable_recipients_are_counted_as_failed() {
        let f = fixture(2).await;
        let mut opted_out = f.stores.contacts.get(f.tenant, f.contacts[1]).await.unwrap().unwrap();
        f.orchestrator.launch(f.tenant, &launch_of(&f.campaign)).await.unwrap();
        opted_out.consent = ConsentStatus::OptedOut;
        f.stores.contacts.upsert(opted_out).await.unwrap();

        let batch = ProcessBatch {
            campaign_id: f.campaign.id,
            batch_number: 1,
            contact_ids: vec![f.contacts[0], f.contacts[1], ContactId::new()],
        };
        let outcome = f.orchestrator.process_batch(f.tenant, &batch).await.unwrap();
        assert_eq!(
            outcome,
            BatchOutcome::Enqueued {
                messages: 1,
                unresolved: 2
            }
        );

        let outcomes: Vec<Job> = f
            .queue
            .waiting(queues::CAMPAIGNS)
            .unwrap()
            .into_iter()
            .filter(|j| j.kind == JobKind::RecordOutcome)
            .collect();
        assert_eq!(outcomes.len(), 2);
    }

    #[tokio::test]
    async fn paused_campaign_defers_batches_and_holds_queued_work() {
        let f = fixture(3).await;
        f.orchestrator.launch(f.tenant, &launch_of(&f.campaign)).await.unwrap();

        let held = f.orchestrator.pause(f.tenant, f.campaign.id).await.unwrap();
        assert_eq!(held, 1);

        let batch = ProcessBatch {
            campaign_id: f.campaign.id,
            batch_number: 1,
            contact_ids: f.contacts.clone(),
        };
        assert_eq!(
            f.orchestrator.process_batch(f.tenant, &batch).await.unwrap(),
            BatchOutcome::Deferred
        );
        assert!(f.queue.waiting(queues::MESSAGES).unwrap().is_empty());

        let released = f.orchestrator.resume(f.tenant, f.campaign.id).await.unwrap();
        assert_eq!(released, 1);
        let campaign = f.stores.campaigns.get(f.tenant, f.campaign.id).await.unwrap().unwrap();
        assert_eq!(campaign.status, CampaignStatus::Running);
    }

    #[tokio::test]
    async fn cancel_cancels_waiting_group_jobs() {
        let f = fixture(250).await;
        f.orchestrator.launch(f.tenant, &launch_of(&f.campaign)).await.unwrap();

        let cancelled = f.orchestrator.cancel(f.tenant, f.campaign.id).await.unwrap();
        assert_eq!(cancelled, 3);

        let jobs = f
            .queue
            .group_jobs(f.tenant, &keys::campaign_group(f.campaign.id))
            .unwrap();
        assert!(jobs.iter().all(|j| j.status == JobStatus::Cancelled));

        let report = f.orchestrator.progress(f.tenant, f.campaign.id).await.unwrap();
        assert_eq!(report.progress.status, CampaignStatus::Cancelled);
        assert_eq!(report.jobs.cancelled, 3);
    }

    #[tokio::test]
    async fn last_outcome_completes_the_campaign() {
        let f = fixture(2).await;
        f.orchestrator.launch(f.tenant, &launch_of(&f.campaign)).await.unwrap();

        f.orchestrator
            .record_outcome(f.tenant, f.campaign.id, CampaignCounter::Sent)
            .await
            .unwrap();
        let campaign = f.stores.campaigns.get(f.tenant, f.campaign.id).await.unwrap().unwrap();
        assert_eq!(campaign.status, CampaignStatus::Running);

        f.orchestrator
            .record_outcome(f.tenant, f.campaign.id, CampaignCounter::Failed)
            .await
            .unwrap();
        let campaign = f.stores.campaigns.get(f.tenant, f.campaign.id).await.unwrap().unwrap();
        assert_eq!(campaign.status, CampaignStatus::Completed);

        // A late duplicate is refused, never pushing past the total
        let refused = f
            .orchestrator
            .record_outcome(f.tenant, f.campaign.id, CampaignCounter::Sent)
            .await
            .unwrap();
        assert!(refused.is_none());
    }

    #[tokio::test]
    async fn repeated_recipients_are_counted_once() {
        let f = fixture(2).await;
        let launch = LaunchCampaign {
            campaign_id: f.campaign.id,
            recipients: Some(vec![f.contacts[0], f.contacts[1], f.contacts[0]]),
        };

        let outcome = f.orchestrator.launch(f.tenant, &launch).await.unwrap();
        assert_eq!(
            outcome,
            LaunchOutcome::Started {
                recipients: 2,
                batches: 1
            }
        );
        let campaign = f.stores.campaigns.get(f.tenant, f.campaign.id).await.unwrap().unwrap();
        assert_eq!(campaign.total_recipients, 2);

        let batches = f.queue.waiting(queues::CAMPAIGNS).unwrap();
        let batch: ProcessBatch = batches[0].payload().unwrap();
        assert_eq!(batch.contact_ids, vec![f.contacts[0], f.contacts[1]]);
    }

    #[test]
    fn unique_recipients_keeps_first_occurrence_order() {
        let (a, b, c) = (ContactId::new(), ContactId::new(), ContactId::new());
        assert_eq!(unique_recipients([b, a, b, c, a]), vec![b, a, c]);
    }

    #[test]
    fn message_ids_are_stable_per_recipient() {
        let campaign = CampaignId::new();
        let contact = ContactId::new();
        assert_eq!(
            campaign_message_id(campaign, contact),
            campaign_message_id(campaign, contact)
        );
        assert_ne!(
            campaign_message_id(campaign, contact),
            campaign_message_id(campaign, ContactId::new())
        );
    }
}
