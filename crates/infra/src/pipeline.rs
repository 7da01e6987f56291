//! Wiring: stores, broker, collaborators and one worker pool per queue.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use courier_ai::{LexiconAnalyzer, MessageAnalyzer};
use courier_messaging::Account;

use crate::config::{BrokerBackend, ConfigError, CourierConfig, StoreBackend};
use crate::inbound::InboundGateway;
use crate::jobs::{
    InMemoryJobQueue, JobQueue, QueueError, RateLimit, WorkerPool, WorkerPoolConfig,
    WorkerPoolHandle, queues,
};
use crate::provider::{CloudApiProvider, MessagingProvider, ProviderError};
use crate::store::{PostgresStore, StoreError, Stores};
use crate::workers::webhook::default_retry_policy;
use crate::workers::{
    CampaignOrchestrator, DeliveryWorker, EnrichmentWorker, HttpTransport, IngestionWorker,
    TransportError, WebhookDispatcher, WebhookTransport,
};

const DB_POOL_SIZE: u32 = 10;
const PURGE_INTERVAL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("redis broker requested but the `redis` feature is not enabled")]
    RedisDisabled,
}

/// External systems the workers talk to.
#[derive(Clone)]
pub struct Collaborators {
    pub provider: Arc<dyn MessagingProvider>,
    pub analyzer: Arc<dyn MessageAnalyzer>,
    pub transport: Arc<dyn WebhookTransport>,
}

impl Collaborators {
    /// Cloud API provider, lexicon analyzer and reqwest transport.
    pub fn production(config: &CourierConfig) -> Result<Self, PipelineError> {
        Ok(Self {
            provider: Arc::new(CloudApiProvider::new(
                config.provider_timeout,
                config.provider_token.clone(),
            )?),
            analyzer: Arc::new(LexiconAnalyzer::new()),
            transport: Arc::new(HttpTransport::new(config.webhook_timeout)?),
        })
    }
}

pub struct Pipeline {
    stores: Stores,
    queue: Arc<dyn JobQueue>,
    campaigns: CampaignOrchestrator,
    inbound: InboundGateway,
    pools: Vec<(&'static str, usize, WorkerPool)>,
    account_daily_limit: u32,
    job_retention: Duration,
}

impl Pipeline {
    pub fn new(
        config: &CourierConfig,
        stores: Stores,
        queue: Arc<dyn JobQueue>,
        collaborators: Collaborators,
    ) -> Self {
        let campaigns = CampaignOrchestrator::new(stores.clone(), queue.clone(), config.campaign.clone());
        let inbound = InboundGateway::new(stores.clone(), queue.clone(), config.secrets.clone());

        let delivery = WorkerPool::new(queue.clone()).with_handler(
            "message.send",
            Arc::new(DeliveryWorker::new(
                stores.clone(),
                collaborators.provider,
                campaigns.clone(),
                config.delivery(),
            )),
        );
        let ingestion = WorkerPool::new(queue.clone())
            .with_handler(
                "inbound.process",
                Arc::new(IngestionWorker::new(stores.clone(), queue.clone(), default_retry_policy())),
            )
            .with_handler(
                "inbound.enrich",
                Arc::new(EnrichmentWorker::new(
                    stores.clone(),
                    collaborators.analyzer,
                    config.ai_timeout,
                )),
            );
        let orchestration = WorkerPool::new(queue.clone()).with_handler("campaign.*", Arc::new(campaigns.clone()));
        let dispatch = WorkerPool::new(queue.clone())
            .with_handler("webhook.send", Arc::new(WebhookDispatcher::new(collaborators.transport)));

        let concurrency = config.concurrency;
        Self {
            stores,
            queue,
            campaigns,
            inbound,
            pools: vec![
                (queues::MESSAGES, concurrency.delivery, delivery),
                (queues::INBOUND, concurrency.ingestion, ingestion),
                (queues::CAMPAIGNS, concurrency.campaign, orchestration),
                (queues::OUTGOING_WEBHOOKS, concurrency.webhook, dispatch),
            ],
            account_daily_limit: config.account_daily_limit,
            job_retention: config.job_retention,
        }
    }

    /// Connect the configured store and broker and build production collaborators.
    pub async fn connect(config: &CourierConfig) -> Result<Self, PipelineError> {
        let stores = match config.store {
            StoreBackend::Memory => Stores::in_memory(),
            StoreBackend::Postgres => {
                let url = config
                    .database_url
                    .as_deref()
                    .ok_or(ConfigError::Missing("DATABASE_URL"))?;
                let store = PostgresStore::connect(url, DB_POOL_SIZE).await?;
                store.migrate().await?;
                Stores::from_backend(Arc::new(store))
            }
        };

        let rate = RateLimit::per_second(config.account_rate_per_sec);
        let queue: Arc<dyn JobQueue> = match config.broker {
            BrokerBackend::Memory => Arc::new(InMemoryJobQueue::new().with_rate_limit(queues::MESSAGES, rate)),
            #[cfg(feature = "redis")]
            BrokerBackend::Redis => Arc::new(
                crate::jobs::RedisJobQueue::connect(&config.redis_url)
                    .await?
                    .with_rate_limit(queues::MESSAGES, rate),
            ),
            #[cfg(not(feature = "redis"))]
            BrokerBackend::Redis => return Err(PipelineError::RedisDisabled),
        };

        info!(store = ?config.store, broker = ?config.broker, "pipeline connected");
        Ok(Self::new(config, stores, queue, Collaborators::production(config)?))
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn queue(&self) -> Arc<dyn JobQueue> {
        self.queue.clone()
    }

    pub fn campaigns(&self) -> &CampaignOrchestrator {
        &self.campaigns
    }

    pub fn inbound(&self) -> &InboundGateway {
        &self.inbound
    }

    /// Store an account, applying the configured daily quota when it has none of its own.
    pub async fn register_account(&self, mut account: Account) -> Result<Account, StoreError> {
        if account.daily_limit == courier_messaging::account::DEFAULT_DAILY_LIMIT {
            account.daily_limit = self.account_daily_limit;
        }
        self.stores.accounts.upsert(account.clone()).await?;
        Ok(account)
    }

    /// Run ready jobs on every queue until none is left. Returns how many ran.
    ///
    /// Jobs scheduled in the future (backoff, deferrals) are not waited for.
    pub async fn drain(&self) -> Result<usize, QueueError> {
        let mut total = 0;
        loop {
            let mut ran = 0;
            for (queue, _, pool) in &self.pools {
                ran += pool.drain(queue).await?;
            }
            if ran == 0 {
                return Ok(total);
            }
            total += ran;
        }
    }

    /// Start every worker pool plus the retention sweep on the current runtime.
    pub fn spawn(&self) -> PipelineHandle {
        let pools = self
            .pools
            .iter()
            .map(|(queue, concurrency, pool)| {
                pool.clone()
                    .spawn(WorkerPoolConfig::new(*queue).with_concurrency(*concurrency))
            })
            .collect();

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let queue = self.queue.clone();
        let retention = chrono::Duration::from_std(self.job_retention).unwrap_or(chrono::Duration::days(1));
        let maintenance = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(PURGE_INTERVAL) => {}
                    _ = shutdown_rx.changed() => break,
                }
                match queue.purge_terminal(Utc::now() - retention).await {
                    Ok(0) => {}
                    Ok(purged) => debug!(purged, "finished jobs purged"),
                    Err(e) => warn!(error = %e, "job purge failed"),
                }
            }
        });

        PipelineHandle {
            pools,
            shutdown,
            maintenance,
        }
    }
}

/// Running worker pools.
pub struct PipelineHandle {
    pools: Vec<WorkerPoolHandle>,
    shutdown: watch::Sender<bool>,
    maintenance: JoinHandle<()>,
}

impl PipelineHandle {
    /// Stop claiming, let in-flight jobs finish, then return.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for pool in self.pools {
            pool.shutdown().await;
        }
        if let Err(e) = self.maintenance.await {
            warn!(error = %e, "maintenance task ended abnormally");
        }
        info!("pipeline stopped");
    }
}
