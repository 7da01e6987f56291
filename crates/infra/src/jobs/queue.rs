//! Broker abstraction: the operations workers and producers need from a durable job queue.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use courier_core::TenantId;

use super::types::{DeadLetterEntry, Job, JobId, JobStatus};

/// Result of an enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobHandle {
    pub id: JobId,
    /// `false` when the dedup key matched an existing job and nothing was added.
    pub created: bool,
}

/// Job broker abstraction.
///
/// Job state transitions are recorded here, never decided by the handlers themselves.
#[async_trait]
pub trait JobQueue: Send + Sync + 'static {
    /// Enqueue a job. A job whose dedup key is already known is a no-op that
    /// returns the existing job's handle.
    async fn enqueue(&self, job: Job) -> Result<JobHandle, QueueError>;

    /// Enqueue several jobs; each one is de-duplicated independently.
    async fn enqueue_bulk(&self, jobs: Vec<Job>) -> Result<Vec<JobHandle>, QueueError> {
        let mut handles = Vec::with_capacity(jobs.len());
        for job in jobs {
            handles.push(self.enqueue(job).await?);
        }
        Ok(handles)
    }

    /// Get a job by ID (live or dead-lettered).
    async fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<Job>, QueueError>;

    /// Claim the next ready job of `queue` and mark it running.
    ///
    /// Order: priority (1 first), then age. Jobs whose rate key is over the
    /// queue's rate limit are skipped.
    async fn claim_next(&self, queue: &str) -> Result<Option<Job>, QueueError>;

    /// Persist a job's new state.
    async fn update(&self, job: &Job) -> Result<(), QueueError>;

    /// Move a job to the dead-letter queue.
    async fn dead_letter(&self, job: Job, reason: String) -> Result<(), QueueError>;

    async fn list_dead_letters(
        &self,
        tenant_id: TenantId,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, QueueError>;

    /// Retry a dead-lettered job (move back to pending with fresh attempts).
    async fn retry_dead_letter(&self, tenant_id: TenantId, job_id: JobId) -> Result<Job, QueueError>;

    /// Hold every waiting job of the group; later enqueues into the group are held too.
    async fn pause_group(&self, tenant_id: TenantId, group: &str) -> Result<usize, QueueError>;

    /// Release a paused group.
    async fn resume_group(&self, tenant_id: TenantId, group: &str) -> Result<usize, QueueError>;

    /// Cancel every waiting job of the group; later enqueues into the group are cancelled.
    /// Running jobs are left alone.
    async fn cancel_group(&self, tenant_id: TenantId, group: &str) -> Result<usize, QueueError>;

    async fn group_stats(&self, tenant_id: TenantId, group: &str) -> Result<JobStats, QueueError>;

    async fn stats(&self, tenant_id: TenantId) -> Result<JobStats, QueueError>;

    /// Remove completed and cancelled jobs last touched before `older_than`, and
    /// dead letters filed before it. Their de-duplication keys are released.
    async fn purge_terminal(&self, older_than: DateTime<Utc>) -> Result<usize, QueueError>;
}

#[async_trait]
impl<Q> JobQueue for Arc<Q>
where
    Q: JobQueue + ?Sized,
{
    async fn enqueue(&self, job: Job) -> Result<JobHandle, QueueError> {
        (**self).enqueue(job).await
    }

    async fn enqueue_bulk(&self, jobs: Vec<Job>) -> Result<Vec<JobHandle>, QueueError> {
        (**self).enqueue_bulk(jobs).await
    }

    async fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<Job>, QueueError> {
        (**self).get(tenant_id, job_id).await
    }

    async fn claim_next(&self, queue: &str) -> Result<Option<Job>, QueueError> {
        (**self).claim_next(queue).await
    }

    async fn update(&self, job: &Job) -> Result<(), QueueError> {
        (**self).update(job).await
    }

    async fn dead_letter(&self, job: Job, reason: String) -> Result<(), QueueError> {
        (**self).dead_letter(job, reason).await
    }

    async fn list_dead_letters(
        &self,
        tenant_id: TenantId,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, QueueError> {
        (**self).list_dead_letters(tenant_id, limit).await
    }

    async fn retry_dead_letter(&self, tenant_id: TenantId, job_id: JobId) -> Result<Job, QueueError> {
        (**self).retry_dead_letter(tenant_id, job_id).await
    }

    async fn pause_group(&self, tenant_id: TenantId, group: &str) -> Result<usize, QueueError> {
        (**self).pause_group(tenant_id, group).await
    }

    async fn resume_group(&self, tenant_id: TenantId, group: &str) -> Result<usize, QueueError> {
        (**self).resume_group(tenant_id, group).await
    }

    async fn cancel_group(&self, tenant_id: TenantId, group: &str) -> Result<usize, QueueError> {
        (**self).cancel_group(tenant_id, group).await
    }

    async fn group_stats(&self, tenant_id: TenantId, group: &str) -> Result<JobStats, QueueError> {
        (**self).group_stats(tenant_id, group).await
    }

    async fn stats(&self, tenant_id: TenantId) -> Result<JobStats, QueueError> {
        (**self).stats(tenant_id).await
    }

    async fn purge_terminal(&self, older_than: DateTime<Utc>) -> Result<usize, QueueError> {
        (**self).purge_terminal(older_than).await
    }
}

/// Job broker error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("tenant isolation violation")]
    TenantIsolation,
    #[error("invalid job payload: {0}")]
    Payload(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Payload(err.to_string())
    }
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub paused: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    pub cancelled: usize,
}

impl JobStats {
    pub fn count(&mut self, status: &JobStatus) {
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Paused => self.paused += 1,
            JobStatus::Running => self.running += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed { .. } => self.failed += 1,
            JobStatus::DeadLettered { .. } => self.dead_lettered += 1,
            JobStatus::Cancelled => self.cancelled += 1,
        }
    }

    /// Jobs that have not reached a terminal state.
    pub fn outstanding(&self) -> usize {
        self.pending + self.paused + self.running + self.failed
    }
}
