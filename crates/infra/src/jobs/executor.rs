//! Worker pools: pull jobs from one queue, route them to handlers, record outcomes.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::queue::{JobQueue, QueueError};
use super::types::{Job, JobKind, JobResult, JobStatus};

/// Handles one kind (or family) of job.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: &Job) -> JobResult;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    async fn handle(&self, job: &Job) -> JobResult {
        (self)(job.clone()).await
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Queue consumed by this pool
    pub queue: String,
    /// Number of concurrent workers
    pub concurrency: usize,
    /// How often an idle worker polls for new jobs
    pub poll_interval: Duration,
    /// Name for logging
    pub name: String,
}

impl WorkerPoolConfig {
    pub fn new(queue: impl Into<String>) -> Self {
        let queue = queue.into();
        Self {
            name: format!("{queue}-worker"),
            queue,
            concurrency: 4,
            poll_interval: Duration::from_millis(100),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Worker pool runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_deferred: u64,
    pub jobs_dead_lettered: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// Handle to control a running pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    name: String,
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl WorkerPoolHandle {
    /// Request graceful shutdown and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!(pool = %self.name, error = %e, "worker task ended abnormally");
            }
        }
    }

    /// Get current pool statistics.
    pub fn stats(&self) -> ExecutorStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

/// What happened to one executed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Retrying,
    Deferred,
    DeadLettered,
}

/// Routes claimed jobs to registered handlers.
///
/// Handler patterns: exact kind name, `prefix.*`, or `*`.
#[derive(Clone)]
pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl WorkerPool {
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        Self {
            queue,
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for a kind pattern.
    pub fn register_handler(&mut self, pattern: impl Into<String>, handler: impl JobHandler) {
        self.handlers.insert(pattern.into(), Arc::new(handler));
    }

    pub fn with_handler(mut self, pattern: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(pattern.into(), handler);
        self
    }

    fn get_handler(&self, kind: JobKind) -> Option<&Arc<dyn JobHandler>> {
        let type_name = kind.type_name();
        if let Some(h) = self.handlers.get(type_name) {
            return Some(h);
        }

        // Category match (e.g. "campaign.*" matches "campaign.batch")
        for (pattern, handler) in &self.handlers {
            if let Some(prefix) = pattern.strip_suffix(".*") {
                if type_name.starts_with(prefix) {
                    return Some(handler);
                }
            }
        }

        self.handlers.get("*")
    }

    /// Run the handler for an already-claimed job and record the outcome with the broker.
    pub async fn execute(&self, job: &mut Job) -> Result<Outcome, QueueError> {
        let started = Utc::now();

        let result = match self.get_handler(job.kind) {
            Some(handler) => handler.handle(job).await,
            None => {
                warn!(job_id = %job.id, kind = %job.kind, "no handler for job");
                JobResult::Failure(format!("no handler for job kind: {}", job.kind))
            }
        };

        match result {
            JobResult::Success => {
                job.mark_completed(started);
                self.queue.update(job).await?;
                debug!(job_id = %job.id, kind = %job.kind, "job completed");
                Ok(Outcome::Succeeded)
            }
            JobResult::Failure(error) => {
                job.mark_failed(error.clone(), started);
                self.queue.update(job).await?;

                if matches!(job.status, JobStatus::DeadLettered { .. }) {
                    warn!(job_id = %job.id, kind = %job.kind, error = %error, "job dead-lettered");
                    self.queue.dead_letter(job.clone(), error).await?;
                    return Ok(Outcome::DeadLettered);
                }
                debug!(job_id = %job.id, attempt = job.attempt, error = %error, "job will be retried");
                Ok(Outcome::Retrying)
            }
            JobResult::RetryAfter(delay) => {
                job.mark_deferred(delay, "deferred".to_string(), started);
                self.queue.update(job).await?;
                debug!(job_id = %job.id, delay_ms = delay.as_millis() as u64, "job deferred");
                Ok(Outcome::Deferred)
            }
            JobResult::Abandon(error) => {
                job.mark_abandoned(error.clone(), started);
                self.queue.update(job).await?;
                warn!(job_id = %job.id, kind = %job.kind, error = %error, "job abandoned");
                self.queue.dead_letter(job.clone(), error).await?;
                Ok(Outcome::DeadLettered)
            }
        }
    }

    /// Claim and execute one job of `queue`. Returns `None` when nothing was ready.
    pub async fn run_once(&self, queue: &str) -> Result<Option<(Job, Outcome)>, QueueError> {
        let Some(mut job) = self.queue.claim_next(queue).await? else {
            return Ok(None);
        };
        let outcome = self.execute(&mut job).await?;
        Ok(Some((job, outcome)))
    }

    /// Run jobs of `queue` until none is ready. Returns how many ran.
    pub async fn drain(&self, queue: &str) -> Result<usize, QueueError> {
        let mut count = 0;
        while self.run_once(queue).await?.is_some() {
            count += 1;
        }
        Ok(count)
    }

    /// Spawn `config.concurrency` workers on the current tokio runtime.
    pub fn spawn(self, config: WorkerPoolConfig) -> WorkerPoolHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(ExecutorStats::default()));
        let pool = Arc::new(self);

        let workers = (0..config.concurrency.max(1))
            .map(|index| {
                let pool = pool.clone();
                let config = config.clone();
                let stats = stats.clone();
                let shutdown_rx = shutdown_rx.clone();
                tokio::spawn(async move {
                    worker_loop(pool, config, index, shutdown_rx, stats).await;
                })
            })
            .collect();

        WorkerPoolHandle {
            name: config.name,
            shutdown: shutdown_tx,
            workers,
            stats,
        }
    }
}

fn with_stats(stats: &Mutex<ExecutorStats>, f: impl FnOnce(&mut ExecutorStats)) {
    if let Ok(mut s) = stats.lock() {
        f(&mut s);
    }
}

async fn worker_loop(
    pool: Arc<WorkerPool>,
    config: WorkerPoolConfig,
    index: usize,
    mut shutdown_rx: watch::Receiver<bool>,
    stats: Arc<Mutex<ExecutorStats>>,
) {
    info!(pool = %config.name, queue = %config.queue, worker = index, "worker started");
    let start_time = Instant::now();

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        with_stats(&stats, |s| s.uptime_secs = start_time.elapsed().as_secs());

        match pool.queue.claim_next(&config.queue).await {
            Ok(Some(mut job)) => {
                debug!(pool = %config.name, job_id = %job.id, kind = %job.kind, "claimed job");
                with_stats(&stats, |s| s.current_running += 1);

                let result = pool.execute(&mut job).await;

                with_stats(&stats, |s| {
                    s.current_running = s.current_running.saturating_sub(1);
                    s.jobs_processed += 1;
                    match &result {
                        Ok(Outcome::Succeeded) => s.jobs_succeeded += 1,
                        Ok(Outcome::Retrying) | Err(_) => s.jobs_failed += 1,
                        Ok(Outcome::Deferred) => s.jobs_deferred += 1,
                        Ok(Outcome::DeadLettered) => {
                            s.jobs_failed += 1;
                            s.jobs_dead_lettered += 1;
                        }
                    }
                });

                if let Err(e) = result {
                    error!(pool = %config.name, job_id = %job.id, error = %e, "failed to record job outcome");
                }
            }
            Ok(None) => {
                tokio::select! {
                    _ = shutdown_rx.changed() => {}
                    _ = tokio::time::sleep(config.poll_interval) => {}
                }
            }
            Err(e) => {
                error!(pool = %config.name, error = %e, "failed to claim job");
                tokio::select! {
                    _ = shutdown_rx.changed() => {}
                    _ = tokio::time::sleep(config.poll_interval) => {}
                }
            }
        }
    }

    info!(pool = %config.name, worker = index, "worker stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use courier_core::TenantId;

    use super::*;
    use crate::jobs::memory::InMemoryJobQueue;
    use crate::jobs::types::{JobOptions, RetryPolicy, queues};

    fn test_tenant() -> TenantId {
        TenantId::new()
    }

    fn queue() -> Arc<InMemoryJobQueue> {
        InMemoryJobQueue::arc()
    }

    #[tokio::test]
    async fn execute_successful_job() {
        let queue = queue();
        let mut pool = WorkerPool::new(queue.clone());
        pool.register_handler("webhook.send", |_job: Job| async { JobResult::Success });

        let tenant = test_tenant();
        let job = Job::new(tenant, JobKind::SendOutgoing, serde_json::json!({}));
        queue.enqueue(job.clone()).await.unwrap();

        let (done, outcome) = pool.run_once(queues::OUTGOING_WEBHOOKS).await.unwrap().unwrap();
        assert_eq!(outcome, Outcome::Succeeded);
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(queue.stats(tenant).await.unwrap().completed, 1);
    }

    #[tokio::test]
    async fn failing_job_retries_then_dead_letters() {
        let queue = queue();
        let mut pool = WorkerPool::new(queue.clone());
        pool.register_handler("webhook.send", |_job: Job| async {
            JobResult::Failure("connection refused".to_string())
        });

        let tenant = test_tenant();
        let job = Job::new(tenant, JobKind::SendOutgoing, serde_json::json!({}))
            .with_options(JobOptions::default().retry(RetryPolicy::fixed(2, Duration::ZERO)));
        queue.enqueue(job).await.unwrap();

        let (_, first) = pool.run_once(queues::OUTGOING_WEBHOOKS).await.unwrap().unwrap();
        assert_eq!(first, Outcome::Retrying);

        let (_, second) = pool.run_once(queues::OUTGOING_WEBHOOKS).await.unwrap().unwrap();
        assert_eq!(second, Outcome::DeadLettered);

        // Exhausted: never claimed again
        assert!(pool.run_once(queues::OUTGOING_WEBHOOKS).await.unwrap().is_none());
        assert_eq!(queue.list_dead_letters(tenant, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn category_and_wildcard_routing() {
        let queue = queue();
        let hits = Arc::new(AtomicUsize::new(0));
        let mut pool = WorkerPool::new(queue.clone());
        let counter = hits.clone();
        pool.register_handler("campaign.*", move |_job: Job| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                JobResult::Success
            }
        });
        pool.register_handler("*", |_job: Job| async { JobResult::Abandon("unrouted".into()) });

        let tenant = test_tenant();
        queue
            .enqueue(Job::new(tenant, JobKind::ProcessBatch, serde_json::json!({})))
            .await
            .unwrap();
        queue
            .enqueue(Job::new(tenant, JobKind::SendMessage, serde_json::json!({})))
            .await
            .unwrap();

        assert_eq!(pool.drain(queues::CAMPAIGNS).await.unwrap(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let (_, outcome) = pool.run_once(queues::MESSAGES).await.unwrap().unwrap();
        assert_eq!(outcome, Outcome::DeadLettered);
    }

    #[tokio::test]
    async fn spawned_pool_processes_and_shuts_down() {
        let queue = queue();
        let mut pool = WorkerPool::new(queue.clone());
        pool.register_handler("*", |_job: Job| async { JobResult::Success });

        let tenant = test_tenant();
        for _ in 0..5 {
            queue
                .enqueue(Job::new(tenant, JobKind::SendOutgoing, serde_json::json!({})))
                .await
                .unwrap();
        }

        let handle = pool.spawn(
            WorkerPoolConfig::new(queues::OUTGOING_WEBHOOKS)
                .with_concurrency(3)
                .with_poll_interval(Duration::from_millis(5)),
        );

        for _ in 0..200 {
            if queue.stats(tenant).await.unwrap().completed == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(queue.stats(tenant).await.unwrap().completed, 5);
        assert_eq!(handle.stats().jobs_succeeded, 5);
        handle.shutdown().await;
    }
}
