//! In-memory broker for tests/dev.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use courier_core::TenantId;

use super::queue::{JobHandle, JobQueue, JobStats, QueueError};
use super::rate_limit::{FixedWindowLimiter, RateLimit};
use super::types::{DeadLetterEntry, Job, JobId, JobStatus};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum GroupMode {
    #[default]
    Active,
    Paused,
    Cancelled,
}

#[derive(Debug, Default)]
struct Group {
    jobs: HashSet<JobId>,
    mode: GroupMode,
}

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<JobId, Job>,
    dead_letters: HashMap<JobId, DeadLetterEntry>,
    dedup: HashMap<(TenantId, String), JobId>,
    groups: HashMap<(TenantId, String), Group>,
    limiters: HashMap<String, FixedWindowLimiter>,
}

impl State {
    fn group_mode(&self, job: &Job) -> GroupMode {
        job.group
            .as_ref()
            .and_then(|g| self.groups.get(&(job.tenant_id, g.clone())))
            .map(|g| g.mode)
            .unwrap_or_default()
    }

    /// Hold or cancel a waiting job whose group is paused or cancelled.
    fn apply_group_mode(&self, job: &mut Job) {
        if !job.status.is_waiting() {
            return;
        }
        match self.group_mode(job) {
            GroupMode::Active => {}
            GroupMode::Paused => job.mark_paused(),
            GroupMode::Cancelled => job.mark_cancelled(),
        }
    }

    fn lookup(&self, job_id: &JobId) -> Option<&Job> {
        self.jobs
            .get(job_id)
            .or_else(|| self.dead_letters.get(job_id).map(|e| &e.job))
    }
}

/// In-memory job broker with de-duplication, groups and per-queue rate limits.
#[derive(Debug, Default)]
pub struct InMemoryJobQueue {
    state: Mutex<State>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Limit how often jobs of `queue` sharing a rate key may be claimed.
    pub fn with_rate_limit(self, queue: impl Into<String>, limit: RateLimit) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state
                .limiters
                .insert(queue.into(), FixedWindowLimiter::new(limit));
        }
        self
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, QueueError> {
        self.state
            .lock()
            .map_err(|_| QueueError::Storage("job queue lock poisoned".to_string()))
    }

    /// Jobs of a group, in creation order (test/diagnostic helper).
    pub fn group_jobs(&self, tenant_id: TenantId, group: &str) -> Result<Vec<Job>, QueueError> {
        let state = self.state()?;
        let mut jobs: Vec<Job> = state
            .groups
            .get(&(tenant_id, group.to_string()))
            .map(|g| g.jobs.iter().filter_map(|id| state.lookup(id).cloned()).collect())
            .unwrap_or_default();
        jobs.sort_by_key(|j| (j.created_at, j.id));
        Ok(jobs)
    }

    /// Jobs waiting on a queue, in claim order (test/diagnostic helper).
    pub fn waiting(&self, queue: &str) -> Result<Vec<Job>, QueueError> {
        let state = self.state()?;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| j.queue == queue && j.status.is_waiting())
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.priority, j.created_at, j.id));
        Ok(jobs)
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, mut job: Job) -> Result<JobHandle, QueueError> {
        let mut state = self.state()?;

        if let Some(key) = &job.dedup_key {
            if let Some(existing) = state.dedup.get(&(job.tenant_id, key.clone())) {
                return Ok(JobHandle {
                    id: *existing,
                    created: false,
                });
            }
        }
        if state.lookup(&job.id).is_some() {
            return Ok(JobHandle {
                id: job.id,
                created: false,
            });
        }

        state.apply_group_mode(&mut job);
        let id = job.id;
        if let Some(key) = &job.dedup_key {
            state.dedup.insert((job.tenant_id, key.clone()), id);
        }
        if let Some(group) = &job.group {
            state
                .groups
                .entry((job.tenant_id, group.clone()))
                .or_default()
                .jobs
                .insert(id);
        }
        state.jobs.insert(id, job);
        Ok(JobHandle { id, created: true })
    }

    async fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<Job>, QueueError> {
        let state = self.state()?;
        match state.lookup(&job_id) {
            Some(job) if job.tenant_id == tenant_id => Ok(Some(job.clone())),
            Some(_) => Err(QueueError::TenantIsolation),
            None => Ok(None),
        }
    }

    async fn claim_next(&self, queue: &str) -> Result<Option<Job>, QueueError> {
        let mut state = self.state()?;
        let now = Utc::now();

        let mut candidates: Vec<_> = state
            .jobs
            .values()
            .filter(|j| j.queue == queue && j.status.is_waiting() && j.is_ready(now))
            .map(|j| (j.priority, j.created_at, j.id, j.rate_key.clone()))
            .collect();
        candidates.sort_by(|a, b| (a.0, a.1, a.2).cmp(&(b.0, b.1, b.2)));

        for (_, _, job_id, rate_key) in candidates {
            if let (Some(key), Some(limiter)) = (rate_key, state.limiters.get_mut(queue)) {
                if !limiter.try_acquire(&key, now) {
                    continue;
                }
            }
            if let Some(job) = state.jobs.get_mut(&job_id) {
                job.mark_running();
                return Ok(Some(job.clone()));
            }
        }

        Ok(None)
    }

    async fn update(&self, job: &Job) -> Result<(), QueueError> {
        let mut state = self.state()?;
        if !state.jobs.contains_key(&job.id) {
            return Err(QueueError::NotFound(job.id));
        }
        let mut job = job.clone();
        state.apply_group_mode(&mut job);
        state.jobs.insert(job.id, job);
        Ok(())
    }

    async fn dead_letter(&self, mut job: Job, reason: String) -> Result<(), QueueError> {
        let mut state = self.state()?;

        if !matches!(job.status, JobStatus::DeadLettered { .. }) {
            job.status = JobStatus::DeadLettered {
                error: reason.clone(),
                attempts: job.attempt,
            };
        }
        job.updated_at = Utc::now();

        state.jobs.remove(&job.id);
        state.dead_letters.insert(job.id, DeadLetterEntry::new(job, reason));
        Ok(())
    }

    async fn list_dead_letters(
        &self,
        tenant_id: TenantId,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, QueueError> {
        let state = self.state()?;
        let mut result: Vec<_> = state
            .dead_letters
            .values()
            .filter(|e| e.job.tenant_id == tenant_id)
            .cloned()
            .collect();

        result.sort_by_key(|e| e.dead_lettered_at);
        result.truncate(limit);
        Ok(result)
    }

    async fn retry_dead_letter(&self, tenant_id: TenantId, job_id: JobId) -> Result<Job, QueueError> {
        let mut state = self.state()?;

        match state.dead_letters.get(&job_id) {
            None => return Err(QueueError::NotFound(job_id)),
            Some(entry) if entry.job.tenant_id != tenant_id => {
                return Err(QueueError::TenantIsolation);
            }
            Some(_) => {}
        }
        let Some(entry) = state.dead_letters.remove(&job_id) else {
            return Err(QueueError::NotFound(job_id));
        };

        let mut job = entry.job;
        job.status = JobStatus::Pending;
        job.attempt = 0;
        job.scheduled_at = None;
        job.updated_at = Utc::now();
        job.history.clear();
        state.apply_group_mode(&mut job);

        state.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn pause_group(&self, tenant_id: TenantId, group: &str) -> Result<usize, QueueError> {
        let mut state = self.state()?;
        let State { jobs, groups, .. } = &mut *state;
        let entry = groups.entry((tenant_id, group.to_string())).or_default();
        if entry.mode == GroupMode::Cancelled {
            return Ok(0);
        }
        entry.mode = GroupMode::Paused;

        let mut count = 0;
        for id in &entry.jobs {
            if let Some(job) = jobs.get_mut(id).filter(|j| j.status.is_waiting()) {
                job.mark_paused();
                count += 1;
            }
        }
        Ok(count)
    }

    async fn resume_group(&self, tenant_id: TenantId, group: &str) -> Result<usize, QueueError> {
        let mut state = self.state()?;
        let State { jobs, groups, .. } = &mut *state;
        let Some(entry) = groups.get_mut(&(tenant_id, group.to_string())) else {
            return Ok(0);
        };
        if entry.mode == GroupMode::Cancelled {
            return Ok(0);
        }
        entry.mode = GroupMode::Active;

        let mut count = 0;
        for id in &entry.jobs {
            if let Some(job) = jobs.get_mut(id).filter(|j| j.status == JobStatus::Paused) {
                job.mark_resumed();
                count += 1;
            }
        }
        Ok(count)
    }

    async fn cancel_group(&self, tenant_id: TenantId, group: &str) -> Result<usize, QueueError> {
        let mut state = self.state()?;
        let State { jobs, groups, .. } = &mut *state;
        let entry = groups.entry((tenant_id, group.to_string())).or_default();
        entry.mode = GroupMode::Cancelled;

        let mut count = 0;
        for id in &entry.jobs {
            if let Some(job) = jobs
                .get_mut(id)
                .filter(|j| j.status.is_waiting() || j.status == JobStatus::Paused)
            {
                job.mark_cancelled();
                count += 1;
            }
        }
        Ok(count)
    }

    async fn group_stats(&self, tenant_id: TenantId, group: &str) -> Result<JobStats, QueueError> {
        let state = self.state()?;
        let mut stats = JobStats::default();
        if let Some(entry) = state.groups.get(&(tenant_id, group.to_string())) {
            for job in entry.jobs.iter().filter_map(|id| state.lookup(id)) {
                stats.count(&job.status);
            }
        }
        Ok(stats)
    }

    async fn stats(&self, tenant_id: TenantId) -> Result<JobStats, QueueError> {
        let state = self.state()?;
        let mut stats = JobStats::default();

        for job in state.jobs.values().filter(|j| j.tenant_id == tenant_id) {
            stats.count(&job.status);
        }
        for entry in state.dead_letters.values() {
            if entry.job.tenant_id == tenant_id {
                stats.count(&entry.job.status);
            }
        }

        Ok(stats)
    }

    async fn purge_terminal(&self, older_than: DateTime<Utc>) -> Result<usize, QueueError> {
        let mut state = self.state()?;
        let mut expired: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| {
                matches!(j.status, JobStatus::Completed | JobStatus::Cancelled)
                    && j.updated_at < older_than
            })
            .cloned()
            .collect();

        let expired_letters: Vec<JobId> = state
            .dead_letters
            .values()
            .filter(|e| e.dead_lettered_at < older_than)
            .map(|e| e.job.id)
            .collect();
        for id in &expired_letters {
            if let Some(entry) = state.dead_letters.remove(id) {
                expired.push(entry.job);
            }
        }

        for job in &expired {
            state.jobs.remove(&job.id);
            if let Some(key) = &job.dedup_key {
                let slot = (job.tenant_id, key.clone());
                // Only free the key while it still points at this job
                if state.dedup.get(&slot) == Some(&job.id) {
                    state.dedup.remove(&slot);
                }
            }
            if let Some(group) = &job.group {
                if let Some(entry) = state.groups.get_mut(&(job.tenant_id, group.clone())) {
                    entry.jobs.remove(&job.id);
                }
            }
        }
        for limiter in state.limiters.values_mut() {
            limiter.prune(Utc::now());
        }
        Ok(expired.len())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::jobs::types::{JobKind, JobOptions, queues};

    fn test_tenant() -> TenantId {
        TenantId::new()
    }

    fn job(tenant: TenantId, options: JobOptions) -> Job {
        Job::new(tenant, JobKind::SendMessage, serde_json::json!({})).with_options(options)
    }

    #[tokio::test]
    async fn enqueue_and_claim() {
        let queue = InMemoryJobQueue::new();
        let tenant = test_tenant();

        let handle = queue.enqueue(job(tenant, JobOptions::default())).await.unwrap();
        assert!(handle.created);

        let claimed = queue.claim_next(queues::MESSAGES).await.unwrap().unwrap();
        assert_eq!(claimed.id, handle.id);
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(claimed.attempt, 1);

        // No more jobs, and nothing on other queues
        assert!(queue.claim_next(queues::MESSAGES).await.unwrap().is_none());
        assert!(queue.claim_next(queues::INBOUND).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dedup_key_makes_enqueue_idempotent() {
        let queue = InMemoryJobQueue::new();
        let tenant = test_tenant();

        let first = queue
            .enqueue(job(tenant, JobOptions::default().dedup("msg:1")))
            .await
            .unwrap();
        let second = queue
            .enqueue(job(tenant, JobOptions::default().dedup("msg:1")))
            .await
            .unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.id, second.id);
        assert_eq!(queue.stats(tenant).await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn claims_by_priority_then_age_and_respects_delay() {
        let queue = InMemoryJobQueue::new();
        let tenant = test_tenant();

        let low = queue.enqueue(job(tenant, JobOptions::default())).await.unwrap();
        let urgent = queue
            .enqueue(job(tenant, JobOptions::default().priority(1)))
            .await
            .unwrap();
        queue
            .enqueue(job(tenant, JobOptions::default().priority(1).delay(Duration::from_secs(60))))
            .await
            .unwrap();

        assert_eq!(queue.claim_next(queues::MESSAGES).await.unwrap().unwrap().id, urgent.id);
        assert_eq!(queue.claim_next(queues::MESSAGES).await.unwrap().unwrap().id, low.id);
        assert!(queue.claim_next(queues::MESSAGES).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rate_limited_key_does_not_block_other_keys() {
        let queue = InMemoryJobQueue::new().with_rate_limit(queues::MESSAGES, RateLimit {
            max: 1,
            window: Duration::from_secs(3600),
        });
        let tenant = test_tenant();

        queue.enqueue(job(tenant, JobOptions::default().rate_key("a"))).await.unwrap();
        queue.enqueue(job(tenant, JobOptions::default().rate_key("a"))).await.unwrap();
        let other = queue
            .enqueue(job(tenant, JobOptions::default().rate_key("b")))
            .await
            .unwrap();

        assert!(queue.claim_next(queues::MESSAGES).await.unwrap().is_some());
        assert_eq!(queue.claim_next(queues::MESSAGES).await.unwrap().unwrap().id, other.id);
        assert!(queue.claim_next(queues::MESSAGES).await.unwrap().is_none());
        assert_eq!(queue.waiting(queues::MESSAGES).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn long_backlog_of_a_limited_key_does_not_hide_later_keys() {
        let queue = InMemoryJobQueue::new().with_rate_limit(queues::MESSAGES, RateLimit {
            max: 1,
            window: Duration::from_secs(3600),
        });
        let tenant = test_tenant();

        for _ in 0..60 {
            queue.enqueue(job(tenant, JobOptions::default().rate_key("a"))).await.unwrap();
        }
        // Strictly behind the backlog
        tokio::time::sleep(Duration::from_millis(5)).await;
        let other = queue
            .enqueue(job(tenant, JobOptions::default().rate_key("b")))
            .await
            .unwrap();

        let first = queue.claim_next(queues::MESSAGES).await.unwrap().unwrap();
        assert_eq!(first.rate_key.as_deref(), Some("a"));
        assert_eq!(queue.claim_next(queues::MESSAGES).await.unwrap().unwrap().id, other.id);
        assert!(queue.claim_next(queues::MESSAGES).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let queue = InMemoryJobQueue::new();
        let handle = queue.enqueue(job(test_tenant(), JobOptions::default())).await.unwrap();

        assert!(matches!(
            queue.get(test_tenant(), handle.id).await,
            Err(QueueError::TenantIsolation)
        ));
    }

    #[tokio::test]
    async fn dead_letter_flow() {
        let queue = InMemoryJobQueue::new();
        let tenant = test_tenant();
        let handle = queue.enqueue(job(tenant, JobOptions::default())).await.unwrap();

        let mut claimed = queue.claim_next(queues::MESSAGES).await.unwrap().unwrap();
        claimed.mark_abandoned("bad".to_string(), Utc::now());
        queue.dead_letter(claimed, "bad".to_string()).await.unwrap();

        let dls = queue.list_dead_letters(tenant, 10).await.unwrap();
        assert_eq!(dls.len(), 1);
        assert_eq!(queue.stats(tenant).await.unwrap().dead_lettered, 1);

        let retried = queue.retry_dead_letter(tenant, handle.id).await.unwrap();
        assert_eq!(retried.status, JobStatus::Pending);
        assert!(queue.list_dead_letters(tenant, 10).await.unwrap().is_empty());
        assert!(queue.claim_next(queues::MESSAGES).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn group_pause_resume_cancel() {
        let queue = InMemoryJobQueue::new();
        let tenant = test_tenant();
        let group = "campaign:1";

        for _ in 0..3 {
            queue.enqueue(job(tenant, JobOptions::default().group(group))).await.unwrap();
        }
        let running = queue.claim_next(queues::MESSAGES).await.unwrap().unwrap();

        assert_eq!(queue.pause_group(tenant, group).await.unwrap(), 2);
        assert!(queue.claim_next(queues::MESSAGES).await.unwrap().is_none());

        // Jobs added while paused are held as well
        queue.enqueue(job(tenant, JobOptions::default().group(group))).await.unwrap();
        assert_eq!(queue.group_stats(tenant, group).await.unwrap().paused, 3);

        assert_eq!(queue.resume_group(tenant, group).await.unwrap(), 3);
        assert!(queue.claim_next(queues::MESSAGES).await.unwrap().is_some());

        assert_eq!(queue.cancel_group(tenant, group).await.unwrap(), 2);
        let stats = queue.group_stats(tenant, group).await.unwrap();
        assert_eq!(stats.cancelled, 2);
        assert_eq!(stats.running, 2);

        let after = queue.get(tenant, running.id).await.unwrap().unwrap();
        assert_eq!(after.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn purge_removes_old_terminal_jobs_and_frees_dedup_keys() {
        let queue = InMemoryJobQueue::new();
        let tenant = test_tenant();
        queue
            .enqueue(job(tenant, JobOptions::default().dedup("k")))
            .await
            .unwrap();

        let mut claimed = queue.claim_next(queues::MESSAGES).await.unwrap().unwrap();
        claimed.mark_completed(Utc::now());
        queue.update(&claimed).await.unwrap();

        let purged = queue
            .purge_terminal(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);

        let again = queue
            .enqueue(job(tenant, JobOptions::default().dedup("k")))
            .await
            .unwrap();
        assert!(again.created);
    }

    #[tokio::test]
    async fn purge_drops_old_dead_letters_and_frees_their_dedup_keys() {
        let queue = InMemoryJobQueue::new();
        let tenant = test_tenant();
        queue
            .enqueue(job(tenant, JobOptions::default().dedup("k").group("campaign:1")))
            .await
            .unwrap();

        let claimed = queue.claim_next(queues::MESSAGES).await.unwrap().unwrap();
        queue.dead_letter(claimed, "provider down".into()).await.unwrap();
        assert_eq!(queue.list_dead_letters(tenant, 10).await.unwrap().len(), 1);

        // Too recent to go
        let purged = queue
            .purge_terminal(Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(purged, 0);
        assert_eq!(queue.list_dead_letters(tenant, 10).await.unwrap().len(), 1);

        let purged = queue
            .purge_terminal(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(queue.list_dead_letters(tenant, 10).await.unwrap().is_empty());
        assert!(queue.group_jobs(tenant, "campaign:1").unwrap().is_empty());

        let again = queue
            .enqueue(job(tenant, JobOptions::default().dedup("k")))
            .await
            .unwrap();
        assert!(again.created);
    }
}
