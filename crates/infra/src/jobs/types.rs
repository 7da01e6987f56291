//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use courier_core::TenantId;

/// Queue names. One worker pool consumes each queue.
pub mod queues {
    pub const MESSAGES: &str = "messages";
    pub const INBOUND: &str = "inbound";
    pub const CAMPAIGNS: &str = "campaigns";
    pub const OUTGOING_WEBHOOKS: &str = "outgoing-webhooks";
}

/// Default priority (1 = most urgent).
pub const DEFAULT_PRIORITY: u8 = 5;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job kind for routing to the appropriate handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    #[serde(rename = "message.send")]
    SendMessage,
    #[serde(rename = "inbound.process")]
    ProcessInbound,
    #[serde(rename = "inbound.enrich")]
    EnrichMessage,
    #[serde(rename = "campaign.launch")]
    LaunchCampaign,
    #[serde(rename = "campaign.batch")]
    ProcessBatch,
    #[serde(rename = "campaign.outcome")]
    RecordOutcome,
    #[serde(rename = "webhook.send")]
    SendOutgoing,
}

impl JobKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            JobKind::SendMessage => "message.send",
            JobKind::ProcessInbound => "inbound.process",
            JobKind::EnrichMessage => "inbound.enrich",
            JobKind::LaunchCampaign => "campaign.launch",
            JobKind::ProcessBatch => "campaign.batch",
            JobKind::RecordOutcome => "campaign.outcome",
            JobKind::SendOutgoing => "webhook.send",
        }
    }

    /// Queue a job of this kind is placed on unless overridden.
    pub fn default_queue(&self) -> &'static str {
        match self {
            JobKind::SendMessage => queues::MESSAGES,
            JobKind::ProcessInbound | JobKind::EnrichMessage => queues::INBOUND,
            JobKind::LaunchCampaign | JobKind::ProcessBatch | JobKind::RecordOutcome => {
                queues::CAMPAIGNS
            }
            JobKind::SendOutgoing => queues::OUTGOING_WEBHOOKS,
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.type_name())
    }
}

/// Job execution status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting to be picked up
    Pending,
    /// Held back by a group pause; not claimable until resumed
    Paused,
    /// Currently being executed
    Running,
    /// Completed successfully
    Completed,
    /// Failed, will be retried
    Failed { error: String, attempt: u32 },
    /// Exhausted retries (or abandoned), moved to DLQ
    DeadLettered { error: String, attempts: u32 },
    /// Cancelled by user/system
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::DeadLettered { .. } | JobStatus::Cancelled
        )
    }

    /// Queued and not started: the statuses group operations act on.
    pub fn is_waiting(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Failed { .. })
    }

    pub fn is_retriable(&self) -> bool {
        matches!(self, JobStatus::Failed { .. })
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of attempts (1 = no retries)
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(300),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// A single attempt, never retried.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * (attempt as f64)).min(max_ms),
        };

        // Deterministic jitter derived from the attempt number
        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// Check if another attempt is allowed after `attempt` attempts.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Producer-side options for a job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOptions {
    /// Deterministic key; enqueueing a second job with the same key is a no-op.
    pub dedup_key: Option<String>,
    pub priority: u8,
    pub retry_policy: RetryPolicy,
    pub delay: Option<Duration>,
    /// Group the job belongs to (e.g. `campaign:<id>`), for pause/resume/cancel.
    pub group: Option<String>,
    /// Key the queue's rate limit is applied to (e.g. the sending account).
    pub rate_key: Option<String>,
    /// Queue override; defaults to the kind's queue.
    pub queue: Option<String>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            dedup_key: None,
            priority: DEFAULT_PRIORITY,
            retry_policy: RetryPolicy::default(),
            delay: None,
            group: None,
            rate_key: None,
            queue: None,
        }
    }
}

impl JobOptions {
    pub fn dedup(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority.max(1);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn rate_key(mut self, key: impl Into<String>) -> Self {
        self.rate_key = Some(key.into());
        self
    }
}

/// A background job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID
    pub id: JobId,
    /// Tenant scope
    pub tenant_id: TenantId,
    /// Queue the job waits on
    pub queue: String,
    /// Job kind for routing
    pub kind: JobKind,
    /// JSON payload
    pub payload: serde_json::Value,
    /// Current status
    pub status: JobStatus,
    /// Retry policy
    pub retry_policy: RetryPolicy,
    /// Attempts started so far
    pub attempt: u32,
    /// 1 = most urgent
    pub priority: u8,
    pub dedup_key: Option<String>,
    pub group: Option<String>,
    pub rate_key: Option<String>,
    /// When the job was created
    pub created_at: DateTime<Utc>,
    /// When the job was last updated
    pub updated_at: DateTime<Utc>,
    /// When the job should next be executed (for scheduled/delayed jobs)
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Execution history
    pub history: Vec<JobAttemptRecord>,
}

/// Record of a job execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobAttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(delay).unwrap_or_default()
}

impl Job {
    /// Create a new job on its kind's default queue.
    pub fn new(tenant_id: TenantId, kind: JobKind, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            tenant_id,
            queue: kind.default_queue().to_string(),
            kind,
            payload,
            status: JobStatus::Pending,
            retry_policy: RetryPolicy::default(),
            attempt: 0,
            priority: DEFAULT_PRIORITY,
            dedup_key: None,
            group: None,
            rate_key: None,
            created_at: now,
            updated_at: now,
            scheduled_at: None,
            history: Vec::new(),
        }
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.dedup_key = options.dedup_key;
        self.priority = options.priority.max(1);
        self.retry_policy = options.retry_policy;
        self.group = options.group;
        self.rate_key = options.rate_key;
        if let Some(queue) = options.queue {
            self.queue = queue;
        }
        if let Some(delay) = options.delay {
            self.scheduled_at = Some(after(self.created_at, delay));
        }
        self
    }

    /// Set a custom retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Schedule the job for later execution.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Decode the payload into a typed value.
    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    /// Check if the job is ready to execute at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        match self.scheduled_at {
            Some(at) => now >= at,
            None => true,
        }
    }

    /// Whether the attempt in progress is the last one the policy allows.
    pub fn is_final_attempt(&self) -> bool {
        !self.retry_policy.should_retry(self.attempt)
    }

    /// Mark job as running.
    pub fn mark_running(&mut self) {
        self.status = JobStatus::Running;
        self.attempt += 1;
        self.updated_at = Utc::now();
    }

    fn record_attempt(&mut self, started_at: DateTime<Utc>, error: Option<String>) -> DateTime<Utc> {
        let now = Utc::now();
        self.updated_at = now;
        self.history.push(JobAttemptRecord {
            attempt: self.attempt,
            started_at,
            finished_at: now,
            success: error.is_none(),
            error,
            duration_ms: (now - started_at).num_milliseconds().max(0) as u64,
        });
        now
    }

    /// Mark job as completed.
    pub fn mark_completed(&mut self, started_at: DateTime<Utc>) {
        self.record_attempt(started_at, None);
        self.status = JobStatus::Completed;
    }

    /// Mark job as failed: schedules a retry or dead-letters when attempts are exhausted.
    pub fn mark_failed(&mut self, error: String, started_at: DateTime<Utc>) {
        let now = self.record_attempt(started_at, Some(error.clone()));

        if self.retry_policy.should_retry(self.attempt) {
            let delay = self.retry_policy.delay_for_attempt(self.attempt);
            self.scheduled_at = Some(after(now, delay));
            self.status = JobStatus::Failed {
                error,
                attempt: self.attempt,
            };
        } else {
            self.status = JobStatus::DeadLettered {
                error,
                attempts: self.attempt,
            };
        }
    }

    /// Reschedule without consuming an attempt (the handler asked to wait).
    pub fn mark_deferred(&mut self, delay: Duration, reason: String, started_at: DateTime<Utc>) {
        let now = self.record_attempt(started_at, Some(reason));
        self.attempt = self.attempt.saturating_sub(1);
        self.scheduled_at = Some(after(now, delay));
        self.status = JobStatus::Pending;
    }

    /// Dead-letter immediately regardless of remaining attempts.
    pub fn mark_abandoned(&mut self, error: String, started_at: DateTime<Utc>) {
        self.record_attempt(started_at, Some(error.clone()));
        self.status = JobStatus::DeadLettered {
            error,
            attempts: self.attempt,
        };
    }

    /// Mark job as cancelled.
    pub fn mark_cancelled(&mut self) {
        self.status = JobStatus::Cancelled;
        self.updated_at = Utc::now();
    }

    pub fn mark_paused(&mut self) {
        self.status = JobStatus::Paused;
        self.updated_at = Utc::now();
    }

    pub fn mark_resumed(&mut self) {
        self.status = JobStatus::Pending;
        self.updated_at = Utc::now();
    }
}

/// Result of job execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    /// Job completed successfully
    Success,
    /// Job failed; retried per policy
    Failure(String),
    /// Job should be retried after a delay without consuming an attempt
    RetryAfter(Duration),
    /// Job can never succeed; dead-letter without further attempts
    Abandon(String),
}

/// Entry in the dead-letter queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub job: Job,
    pub dead_lettered_at: DateTime<Utc>,
    pub reason: String,
}

impl DeadLetterEntry {
    pub fn new(job: Job, reason: String) -> Self {
        Self {
            job,
            dead_lettered_at: Utc::now(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_job() -> Job {
        Job::new(TenantId::new(), JobKind::SendOutgoing, serde_json::json!({}))
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(100), Duration::from_secs(10));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = RetryPolicy::exponential(50, Duration::from_secs(5), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(60));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let policy = RetryPolicy {
            strategy: BackoffStrategy::Linear,
            base_delay: Duration::from_millis(100),
            ..Default::default()
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..Default::default()
        };

        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn options_are_applied() {
        let job = test_job().with_options(
            JobOptions::default()
                .dedup("webhook:a:b")
                .priority(0)
                .group("campaign:x")
                .rate_key("acct")
                .delay(Duration::from_secs(60)),
        );

        assert_eq!(job.queue, queues::OUTGOING_WEBHOOKS);
        assert_eq!(job.priority, 1);
        assert_eq!(job.dedup_key.as_deref(), Some("webhook:a:b"));
        assert!(!job.is_ready(Utc::now()));
    }

    #[test]
    fn failure_retries_then_dead_letters() {
        let mut job = test_job().with_retry_policy(RetryPolicy::fixed(2, Duration::ZERO));

        job.mark_running();
        assert!(!job.is_final_attempt());
        job.mark_failed("error 1".to_string(), Utc::now());
        assert!(matches!(job.status, JobStatus::Failed { attempt: 1, .. }));

        job.mark_running();
        assert!(job.is_final_attempt());
        job.mark_failed("error 2".to_string(), Utc::now());
        assert!(matches!(job.status, JobStatus::DeadLettered { attempts: 2, .. }));
        assert_eq!(job.history.len(), 2);
    }

    #[test]
    fn deferral_does_not_consume_an_attempt() {
        let mut job = test_job().with_retry_policy(RetryPolicy::fixed(1, Duration::ZERO));

        job.mark_running();
        job.mark_deferred(Duration::from_secs(30), "quota".into(), Utc::now());
        assert_eq!(job.attempt, 0);
        assert_eq!(job.status, JobStatus::Pending);
        assert!(!job.is_ready(Utc::now()));

        job.mark_running();
        assert!(job.is_final_attempt());
    }

    #[test]
    fn abandon_skips_remaining_attempts() {
        let mut job = test_job();
        job.mark_running();
        job.mark_abandoned("bad payload".into(), Utc::now());
        assert!(matches!(job.status, JobStatus::DeadLettered { attempts: 1, .. }));
    }

    #[test]
    fn kinds_route_to_their_queues() {
        assert_eq!(JobKind::ProcessBatch.default_queue(), queues::CAMPAIGNS);
        assert_eq!(JobKind::EnrichMessage.default_queue(), queues::INBOUND);
        assert_eq!(
            serde_json::to_value(JobKind::SendMessage).unwrap(),
            serde_json::json!("message.send")
        );
    }

    proptest::proptest! {
        #[test]
        fn backoff_never_exceeds_cap(attempt in 1u32..200, base_ms in 1u64..10_000, cap_ms in 1u64..600_000) {
            let policy = RetryPolicy::exponential(10, Duration::from_millis(base_ms), Duration::from_millis(cap_ms));
            let delay = policy.delay_for_attempt(attempt);
            proptest::prop_assert!(delay <= Duration::from_millis(base_ms.max(cap_ms)));
            proptest::prop_assert!(delay >= policy.delay_for_attempt(attempt.saturating_sub(1)));
        }
    }
}
