//! Redis-backed broker (durable, shared between processes).
//!
//! ## Keys
//!
//! - `courier:job:<id>`: job JSON (the source of truth for its state)
//! - `courier:dedup:<tenant>:<key>`: job id, claimed with `SET NX`
//! - `courier:queue:<queue>:ready`: ZSET of claimable ids, score = priority * 1e13 + created ms
//! - `courier:queue:<queue>:delayed`: ZSET of ids waiting for their scheduled time
//! - `courier:group:<tenant>:<group>` / `:mode`: SET of job ids and `active|paused|cancelled`
//! - `courier:tenant:<tenant>:jobs`: SET of all job ids of the tenant
//! - `courier:dlq:<tenant>` / `courier:dlq:entry:<id>`: dead letters
//! - `courier:terminal`: ZSET of completed/cancelled ids by last update (purging)
//! - `courier:rate:<queue>:<key>:<window>`: `INCR` + `PEXPIRE` fixed-window counter
//!
//! A claim is owned by whoever removes the id from the ready set (`ZREM` returns 1).

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use tracing::{instrument, warn};

use courier_core::TenantId;

use super::queue::{JobHandle, JobQueue, JobStats, QueueError};
use super::rate_limit::RateLimit;
use super::types::{DeadLetterEntry, Job, JobId, JobStatus};

const KEY_PREFIX: &str = "courier";

/// Ready ids fetched per round trip while a claim looks for a claimable job.
const CLAIM_PAGE: isize = 50;

const PRIORITY_WEIGHT: f64 = 1e13;

#[derive(Clone)]
pub struct RedisJobQueue {
    conn: MultiplexedConnection,
    rate_limits: HashMap<String, RateLimit>,
}

fn connection_error(err: redis::RedisError) -> QueueError {
    QueueError::Storage(format!("redis connection error: {err}"))
}

fn command_error(err: redis::RedisError) -> QueueError {
    QueueError::Storage(format!("redis command error: {err}"))
}

fn job_key(id: JobId) -> String {
    format!("{KEY_PREFIX}:job:{id}")
}

fn dedup_key(tenant_id: TenantId, key: &str) -> String {
    format!("{KEY_PREFIX}:dedup:{tenant_id}:{key}")
}

fn ready_key(queue: &str) -> String {
    format!("{KEY_PREFIX}:queue:{queue}:ready")
}

fn delayed_key(queue: &str) -> String {
    format!("{KEY_PREFIX}:queue:{queue}:delayed")
}

fn group_key(tenant_id: TenantId, group: &str) -> String {
    format!("{KEY_PREFIX}:group:{tenant_id}:{group}")
}

fn tenant_key(tenant_id: TenantId) -> String {
    format!("{KEY_PREFIX}:tenant:{tenant_id}:jobs")
}

fn dlq_key(tenant_id: TenantId) -> String {
    format!("{KEY_PREFIX}:dlq:{tenant_id}")
}

fn dlq_entry_key(id: JobId) -> String {
    format!("{KEY_PREFIX}:dlq:entry:{id}")
}

fn terminal_key() -> String {
    format!("{KEY_PREFIX}:terminal")
}

/// Statuses `purge_terminal` may remove once old enough.
fn is_purgeable(status: &JobStatus) -> bool {
    matches!(
        status,
        JobStatus::Completed | JobStatus::Cancelled | JobStatus::DeadLettered { .. }
    )
}

fn ready_score(job: &Job) -> f64 {
    job.priority as f64 * PRIORITY_WEIGHT + job.created_at.timestamp_millis() as f64
}

impl RedisJobQueue {
    /// Connect to Redis (e.g. "redis://localhost:6379").
    pub async fn connect(redis_url: impl AsRef<str>) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(connection_error)?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(connection_error)?;
        Ok(Self {
            conn,
            rate_limits: HashMap::new(),
        })
    }

    pub fn with_rate_limit(mut self, queue: impl Into<String>, limit: RateLimit) -> Self {
        self.rate_limits.insert(queue.into(), limit);
        self
    }

    async fn load(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(job_key(id))
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;
        raw.map(|s| serde_json::from_str(&s).map_err(QueueError::from))
            .transpose()
    }

    async fn load_ids(&self, key: &str) -> Result<Vec<Job>, QueueError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;
        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            let Ok(uuid) = id.parse() else {
                warn!(key, id = %id, "skipping malformed job id");
                continue;
            };
            if let Some(job) = self.load(JobId::from_uuid(uuid)).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn group_mode(&self, job: &Job) -> Result<Option<String>, QueueError> {
        match &job.group {
            Some(group) => self.mode_of(job.tenant_id, group).await,
            None => Ok(None),
        }
    }

    async fn mode_of(&self, tenant_id: TenantId, group: &str) -> Result<Option<String>, QueueError> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(format!("{}:mode", group_key(tenant_id, group)))
            .query_async(&mut conn)
            .await
            .map_err(command_error)
    }

    async fn set_group_mode(
        &self,
        tenant_id: TenantId,
        group: &str,
        mode: &str,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(format!("{}:mode", group_key(tenant_id, group)))
            .arg(mode)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(command_error)
    }

    /// Write the job and place its id in the set matching its status.
    async fn save(&self, job: &mut Job) -> Result<(), QueueError> {
        if job.status.is_waiting() {
            match self.group_mode(job).await?.as_deref() {
                Some("paused") => job.mark_paused(),
                Some("cancelled") => job.mark_cancelled(),
                _ => {}
            }
        }

        let json = serde_json::to_string(job)?;
        let id = job.id.to_string();
        let mut pipe = redis::pipe();
        pipe.cmd("SET").arg(job_key(job.id)).arg(json).ignore();
        pipe.cmd("ZREM").arg(ready_key(&job.queue)).arg(&id).ignore();
        pipe.cmd("ZREM").arg(delayed_key(&job.queue)).arg(&id).ignore();

        let now = Utc::now();
        if job.status.is_waiting() {
            match job.scheduled_at.filter(|at| *at > now) {
                Some(at) => {
                    pipe.cmd("ZADD")
                        .arg(delayed_key(&job.queue))
                        .arg(at.timestamp_millis())
                        .arg(&id)
                        .ignore();
                }
                None => {
                    pipe.cmd("ZADD")
                        .arg(ready_key(&job.queue))
                        .arg(ready_score(job))
                        .arg(&id)
                        .ignore();
                }
            }
        }
        if is_purgeable(&job.status) {
            pipe.cmd("ZADD")
                .arg(terminal_key())
                .arg(job.updated_at.timestamp_millis())
                .arg(&id)
                .ignore();
        }

        let mut conn = self.conn.clone();
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(command_error)
    }

    /// Move due delayed ids of `queue` into its ready set.
    async fn promote_due(&self, queue: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(delayed_key(queue))
            .arg("-inf")
            .arg(Utc::now().timestamp_millis())
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;

        for id in due {
            let removed: i64 = redis::cmd("ZREM")
                .arg(delayed_key(queue))
                .arg(&id)
                .query_async(&mut conn)
                .await
                .map_err(command_error)?;
            if removed == 0 {
                continue;
            }
            let Ok(uuid) = id.parse() else { continue };
            if let Some(job) = self.load(JobId::from_uuid(uuid)).await? {
                redis::cmd("ZADD")
                    .arg(ready_key(queue))
                    .arg(ready_score(&job))
                    .arg(&id)
                    .query_async::<_, ()>(&mut conn)
                    .await
                    .map_err(command_error)?;
            }
        }
        Ok(())
    }

    /// Counter key and window length of `key`'s current window, if `queue` is limited.
    fn rate_counter(&self, queue: &str, key: &str, now: DateTime<Utc>) -> Option<(String, i64, u32)> {
        let limit = self.rate_limits.get(queue)?;
        let window_ms = (limit.window.as_millis() as i64).max(1);
        let now_ms = now.timestamp_millis();
        let window = now_ms - now_ms.rem_euclid(window_ms);
        Some((format!("{KEY_PREFIX}:rate:{queue}:{key}:{window}"), window_ms, limit.max))
    }

    /// Take one slot of the rate window for `key`; over-limit attempts are handed back.
    async fn acquire_rate(&self, queue: &str, key: &str, now: DateTime<Utc>) -> Result<bool, QueueError> {
        let Some((counter, window_ms, max)) = self.rate_counter(queue, key, now) else {
            return Ok(true);
        };

        let mut conn = self.conn.clone();
        let used: u32 = redis::cmd("INCR")
            .arg(&counter)
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;
        if used == 1 {
            redis::cmd("PEXPIRE")
                .arg(&counter)
                .arg(window_ms)
                .query_async::<_, ()>(&mut conn)
                .await
                .map_err(command_error)?;
        }
        if used > max {
            self.release_rate(queue, key, now).await?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Hand back a slot taken by [`Self::acquire_rate`].
    async fn release_rate(&self, queue: &str, key: &str, now: DateTime<Utc>) -> Result<(), QueueError> {
        let Some((counter, _, _)) = self.rate_counter(queue, key, now) else {
            return Ok(());
        };
        let mut conn = self.conn.clone();
        redis::cmd("DECR")
            .arg(&counter)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(command_error)
    }

    async fn apply_to_group(
        &self,
        tenant_id: TenantId,
        group: &str,
        select: impl Fn(&JobStatus) -> bool + Send,
        change: impl Fn(&mut Job) + Send,
    ) -> Result<usize, QueueError> {
        let mut count = 0;
        for mut job in self.load_ids(&group_key(tenant_id, group)).await? {
            if select(&job.status) {
                change(&mut job);
                self.save(&mut job).await?;
                count += 1;
            }
        }
        Ok(count)
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    #[instrument(skip(self, job), fields(job_id = %job.id, queue = %job.queue), err)]
    async fn enqueue(&self, mut job: Job) -> Result<JobHandle, QueueError> {
        let mut conn = self.conn.clone();

        if let Some(key) = &job.dedup_key {
            let key = dedup_key(job.tenant_id, key);
            let claimed: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg(job.id.to_string())
                .arg("NX")
                .query_async(&mut conn)
                .await
                .map_err(command_error)?;
            if claimed.is_none() {
                let existing: Option<String> = redis::cmd("GET")
                    .arg(&key)
                    .query_async(&mut conn)
                    .await
                    .map_err(command_error)?;
                let id = existing
                    .and_then(|s| s.parse().ok())
                    .map(JobId::from_uuid)
                    .unwrap_or(job.id);
                return Ok(JobHandle { id, created: false });
            }
        }

        let id = job.id.to_string();
        let mut pipe = redis::pipe();
        pipe.cmd("SADD").arg(tenant_key(job.tenant_id)).arg(&id).ignore();
        if let Some(group) = &job.group {
            pipe.cmd("SADD").arg(group_key(job.tenant_id, group)).arg(&id).ignore();
        }
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(command_error)?;

        self.save(&mut job).await?;
        Ok(JobHandle {
            id: job.id,
            created: true,
        })
    }

    async fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<Job>, QueueError> {
        match self.load(job_id).await? {
            Some(job) if job.tenant_id == tenant_id => Ok(Some(job)),
            Some(_) => Err(QueueError::TenantIsolation),
            None => Ok(None),
        }
    }

    /// Walks the ready set page by page, so a backlog of one rate-limited key
    /// never hides claimable jobs of other keys further back.
    async fn claim_next(&self, queue: &str) -> Result<Option<Job>, QueueError> {
        self.promote_due(queue).await?;

        let mut conn = self.conn.clone();
        let now = Utc::now();
        // Keys found over their window during this claim
        let mut limited: HashSet<String> = HashSet::new();
        let mut offset: isize = 0;
        loop {
            let ids: Vec<String> = redis::cmd("ZRANGE")
                .arg(ready_key(queue))
                .arg(offset)
                .arg(offset + CLAIM_PAGE - 1)
                .query_async(&mut conn)
                .await
                .map_err(command_error)?;
            if ids.is_empty() {
                return Ok(None);
            }
            offset += ids.len() as isize;

            for id in ids {
                let Ok(uuid) = id.parse() else { continue };
                let Some(mut job) = self.load(JobId::from_uuid(uuid)).await? else {
                    continue;
                };
                if let Some(key) = &job.rate_key {
                    if limited.contains(key) {
                        continue;
                    }
                    if !self.acquire_rate(queue, key, now).await? {
                        limited.insert(key.clone());
                        continue;
                    }
                }
                let removed: i64 = redis::cmd("ZREM")
                    .arg(ready_key(queue))
                    .arg(&id)
                    .query_async(&mut conn)
                    .await
                    .map_err(command_error)?;
                if removed == 0 {
                    // Claimed by another worker
                    if let Some(key) = &job.rate_key {
                        self.release_rate(queue, key, now).await?;
                    }
                    continue;
                }
                job.mark_running();
                self.save(&mut job).await?;
                return Ok(Some(job));
            }
        }
    }

    async fn update(&self, job: &Job) -> Result<(), QueueError> {
        if self.load(job.id).await?.is_none() {
            return Err(QueueError::NotFound(job.id));
        }
        let mut job = job.clone();
        self.save(&mut job).await
    }

    async fn dead_letter(&self, mut job: Job, reason: String) -> Result<(), QueueError> {
        if !matches!(job.status, JobStatus::DeadLettered { .. }) {
            job.status = JobStatus::DeadLettered {
                error: reason.clone(),
                attempts: job.attempt,
            };
        }
        job.updated_at = Utc::now();
        self.save(&mut job).await?;

        let entry = DeadLetterEntry::new(job, reason);
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.cmd("SET")
            .arg(dlq_entry_key(entry.job.id))
            .arg(serde_json::to_string(&entry)?)
            .ignore();
        pipe.cmd("ZADD")
            .arg(dlq_key(entry.job.tenant_id))
            .arg(entry.dead_lettered_at.timestamp_millis())
            .arg(entry.job.id.to_string())
            .ignore();
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(command_error)
    }

    async fn list_dead_letters(
        &self,
        tenant_id: TenantId,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("ZRANGE")
            .arg(dlq_key(tenant_id))
            .arg(0)
            .arg(limit as isize - 1)
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;

        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            let raw: Option<String> = redis::cmd("GET")
                .arg(format!("{KEY_PREFIX}:dlq:entry:{id}"))
                .query_async(&mut conn)
                .await
                .map_err(command_error)?;
            if let Some(raw) = raw {
                entries.push(serde_json::from_str(&raw)?);
            }
        }
        Ok(entries)
    }

    async fn retry_dead_letter(&self, tenant_id: TenantId, job_id: JobId) -> Result<Job, QueueError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(dlq_entry_key(job_id))
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;
        let entry: DeadLetterEntry = match raw {
            Some(raw) => serde_json::from_str(&raw)?,
            None => return Err(QueueError::NotFound(job_id)),
        };
        if entry.job.tenant_id != tenant_id {
            return Err(QueueError::TenantIsolation);
        }

        let mut pipe = redis::pipe();
        pipe.cmd("DEL").arg(dlq_entry_key(job_id)).ignore();
        pipe.cmd("ZREM").arg(dlq_key(tenant_id)).arg(job_id.to_string()).ignore();
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(command_error)?;

        let mut job = entry.job;
        job.status = JobStatus::Pending;
        job.attempt = 0;
        job.scheduled_at = None;
        job.updated_at = Utc::now();
        job.history.clear();
        self.save(&mut job).await?;
        Ok(job)
    }

    async fn pause_group(&self, tenant_id: TenantId, group: &str) -> Result<usize, QueueError> {
        if self.mode_of(tenant_id, group).await?.as_deref() == Some("cancelled") {
            return Ok(0);
        }
        self.set_group_mode(tenant_id, group, "paused").await?;
        self.apply_to_group(tenant_id, group, JobStatus::is_waiting, Job::mark_paused)
            .await
    }

    async fn resume_group(&self, tenant_id: TenantId, group: &str) -> Result<usize, QueueError> {
        if self.mode_of(tenant_id, group).await?.as_deref() == Some("cancelled") {
            return Ok(0);
        }
        self.set_group_mode(tenant_id, group, "active").await?;
        self.apply_to_group(
            tenant_id,
            group,
            |s| *s == JobStatus::Paused,
            Job::mark_resumed,
        )
        .await
    }

    async fn cancel_group(&self, tenant_id: TenantId, group: &str) -> Result<usize, QueueError> {
        self.set_group_mode(tenant_id, group, "cancelled").await?;
        self.apply_to_group(
            tenant_id,
            group,
            |s| s.is_waiting() || *s == JobStatus::Paused,
            Job::mark_cancelled,
        )
        .await
    }

    async fn group_stats(&self, tenant_id: TenantId, group: &str) -> Result<JobStats, QueueError> {
        let mut stats = JobStats::default();
        for job in self.load_ids(&group_key(tenant_id, group)).await? {
            stats.count(&job.status);
        }
        Ok(stats)
    }

    async fn stats(&self, tenant_id: TenantId) -> Result<JobStats, QueueError> {
        let mut stats = JobStats::default();
        for job in self.load_ids(&tenant_key(tenant_id)).await? {
            stats.count(&job.status);
        }
        Ok(stats)
    }

    async fn purge_terminal(&self, older_than: DateTime<Utc>) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(terminal_key())
            .arg("-inf")
            .arg(format!("({}", older_than.timestamp_millis()))
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;

        let mut purged = 0;
        for id in ids {
            let Ok(uuid) = id.parse() else { continue };
            let job_id = JobId::from_uuid(uuid);
            let job = self.load(job_id).await?;

            let mut pipe = redis::pipe();
            pipe.cmd("ZREM").arg(terminal_key()).arg(&id).ignore();
            match &job {
                // Retried or re-enqueued since it was recorded as terminal
                Some(job) if !is_purgeable(&job.status) => {}
                Some(job) => {
                    pipe.cmd("DEL").arg(job_key(job_id)).ignore();
                    if matches!(job.status, JobStatus::DeadLettered { .. }) {
                        pipe.cmd("DEL").arg(dlq_entry_key(job_id)).ignore();
                        pipe.cmd("ZREM").arg(dlq_key(job.tenant_id)).arg(&id).ignore();
                    }
                    pipe.cmd("SREM").arg(tenant_key(job.tenant_id)).arg(&id).ignore();
                    if let Some(key) = &job.dedup_key {
                        pipe.cmd("DEL").arg(dedup_key(job.tenant_id, key)).ignore();
                    }
                    if let Some(group) = &job.group {
                        pipe.cmd("SREM").arg(group_key(job.tenant_id, group)).arg(&id).ignore();
                    }
                    purged += 1;
                }
                None => {}
            }
            pipe.query_async::<_, ()>(&mut conn)
                .await
                .map_err(command_error)?;
        }
        Ok(purged)
    }
}
