//! Sync engine facade.
//!
//! The [`SyncService`] wires the scheduler, the priority queue, the worker
//! pool and the executor together and is the surface the rest of the
//! application talks to: connecting and removing providers, manual syncs,
//! health queries and the event stream.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::clock::Clock;
use super::job_queue::{EnqueueError, InFlightRegistry, JobQueue, LaneReceivers, QueueConfig, WorkerPool};
use super::provider_service::{
    GenericConnection, OAuthConnection, ProviderService, ProviderServiceError,
};
use super::scheduler::{SchedulePolicy, Scheduler, TickReport};
use super::sync_executor::{ExecutorConfig, SyncEvent, SyncExecutor};
use super::token_service::{TokenEndpoint, TokenGrant, TokenManager};
use crate::domain::{JobId, Priority, ProviderConfig, ProviderHealth, ProviderId, TenantId, Trigger};
use crate::providers::AdapterFactory;
use crate::storage::{CredentialVault, DatabaseError, SyncRepository};

const EVENT_CAPACITY: usize = 100;

/// Errors returned by the engine facade.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("provider not found: {0}")]
    NotFound(ProviderId),

    #[error("provider {0} needs to be reconnected")]
    NeedsReconnection(ProviderId),

    #[error("provider {0} already has a sync queued or running")]
    AlreadySyncing(ProviderId),

    #[error("{0} lane is full")]
    Saturated(Priority),

    #[error("engine already started")]
    AlreadyStarted,

    #[error("engine is not running")]
    NotRunning,

    #[error(transparent)]
    Provider(#[from] ProviderServiceError),

    #[error("storage error: {0}")]
    Storage(#[from] DatabaseError),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Everything tunable about the engine.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub policy: SchedulePolicy,
    pub queue: QueueConfig,
    pub executor: ExecutorConfig,
    pub tokens: TokenSettings,
}

/// Refresh behaviour of the token manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenSettings {
    pub expiry_skew: Duration,
    pub refresh_timeout: Duration,
}

impl Default for TokenSettings {
    fn default() -> Self {
        Self {
            expiry_skew: Duration::from_secs(60),
            refresh_timeout: Duration::from_secs(15),
        }
    }
}

struct Running {
    cancel: CancellationToken,
    pool: WorkerPool,
    scheduler: JoinHandle<()>,
}

/// The sync engine.
///
/// # Example
///
/// ```ignore
/// let engine = SyncService::new(repo, vault, endpoint, adapters, Arc::new(SystemClock), EngineConfig::default());
/// engine.start().await?;
///
/// let mut events = engine.subscribe();
/// let job_id = engine.trigger_sync(&provider_id).await?;
///
/// engine.shutdown().await?;
/// ```
pub struct SyncService {
    repo: Arc<dyn SyncRepository>,
    queue: JobQueue,
    receivers: Mutex<Option<LaneReceivers>>,
    queue_config: QueueConfig,
    in_flight: InFlightRegistry,
    policy: Arc<SchedulePolicy>,
    scheduler: Arc<Scheduler>,
    executor: Arc<SyncExecutor>,
    tokens: Arc<TokenManager>,
    providers: ProviderService,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<SyncEvent>,
    running: Mutex<Option<Running>>,
}

impl SyncService {
    pub fn new(
        repo: Arc<dyn SyncRepository>,
        vault: Arc<CredentialVault>,
        endpoint: Arc<dyn TokenEndpoint>,
        adapters: Arc<dyn AdapterFactory>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        let (queue, receivers) = JobQueue::new(&config.queue);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let in_flight = InFlightRegistry::new();
        let policy = Arc::new(config.policy);

        let tokens = Arc::new(
            TokenManager::new(repo.clone(), vault.clone(), endpoint, clock.clone())
                .with_expiry_skew(config.tokens.expiry_skew)
                .with_refresh_timeout(config.tokens.refresh_timeout),
        );
        let scheduler = Arc::new(Scheduler::new(
            repo.clone(),
            queue.clone(),
            in_flight.clone(),
            clock.clone(),
            policy.clone(),
        ));
        let executor = Arc::new(SyncExecutor::new(
            repo.clone(),
            tokens.clone(),
            adapters.clone(),
            policy.clone(),
            clock.clone(),
            in_flight.clone(),
            events.clone(),
            config.executor,
        ));
        let providers = ProviderService::new(
            repo.clone(),
            vault,
            adapters,
            in_flight.clone(),
            clock.clone(),
        );

        Self {
            repo,
            queue,
            receivers: Mutex::new(Some(receivers)),
            queue_config: config.queue,
            in_flight,
            policy,
            scheduler,
            executor,
            tokens,
            providers,
            clock,
            events,
            running: Mutex::new(None),
        }
    }

    /// Spawns the worker pool and the scheduler driver.
    ///
    /// The engine can be started once; jobs queued before start are picked
    /// up as soon as the workers run.
    pub async fn start(&self) -> Result<()> {
        let receivers = self
            .receivers
            .lock()
            .await
            .take()
            .ok_or(EngineError::AlreadyStarted)?;

        let cancel = CancellationToken::new();
        let pool = WorkerPool::spawn(
            receivers,
            &self.queue_config,
            self.executor.clone(),
            cancel.clone(),
        );
        let scheduler = tokio::spawn(self.scheduler.clone().run(cancel.clone()));

        info!(workers = pool.worker_count(), "sync engine started");
        *self.running.lock().await = Some(Running {
            cancel,
            pool,
            scheduler,
        });
        Ok(())
    }

    /// Stops the scheduler, cancels running jobs and waits for every worker.
    pub async fn shutdown(&self) -> Result<()> {
        let running = self.running.lock().await.take().ok_or(EngineError::NotRunning)?;

        running.cancel.cancel();
        self.in_flight.cancel_all().await;
        if let Err(e) = running.scheduler.await {
            warn!(error = %e, "scheduler task ended abnormally");
        }
        running.pool.join().await;
        info!("sync engine stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Runs one scheduling pass immediately.
    pub async fn tick(&self) -> Result<TickReport> {
        Ok(self.scheduler.tick().await?)
    }

    /// Queues a high-priority sync for one provider.
    #[instrument(skip(self))]
    pub async fn trigger_sync(&self, provider_id: &ProviderId) -> Result<JobId> {
        let config = self
            .repo
            .get_provider(provider_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(provider_id.clone()))?;
        if !config.is_active || config.credentials.is_none() {
            return Err(EngineError::NeedsReconnection(provider_id.clone()));
        }
        if self.in_flight.claim(provider_id).await.is_none() {
            return Err(EngineError::AlreadySyncing(provider_id.clone()));
        }

        let job = self.policy.build_job(&config, Trigger::Manual, self.clock.now());
        let (job_id, lane) = (job.id.clone(), job.priority);
        match self.queue.try_enqueue(job) {
            Ok(()) => {
                info!(provider_id = %provider_id, job_id = %job_id, lane = %lane, "manual sync queued");
                Ok(job_id)
            }
            Err(EnqueueError::Full(_)) => {
                self.in_flight.release(provider_id).await;
                Err(EngineError::Saturated(lane))
            }
            Err(EnqueueError::Closed(_)) => {
                self.in_flight.release(provider_id).await;
                Err(EngineError::NotRunning)
            }
        }
    }

    pub async fn get_provider_health(&self, provider_id: &ProviderId) -> Result<ProviderHealth> {
        let config = self
            .repo
            .get_provider(provider_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(provider_id.clone()))?;
        let in_flight = self.in_flight.contains(provider_id).await;
        Ok(self.policy.health(&config, in_flight))
    }

    /// Health of every provider the tenant has connected.
    pub async fn list_provider_health(&self, tenant_id: &TenantId) -> Result<Vec<ProviderHealth>> {
        let mut health = Vec::new();
        for config in self.repo.list_providers(tenant_id).await? {
            let in_flight = self.in_flight.contains(&config.id).await;
            health.push(self.policy.health(&config, in_flight));
        }
        Ok(health)
    }

    pub async fn connect_oauth_provider(
        &self,
        request: OAuthConnection,
        grant: TokenGrant,
    ) -> Result<ProviderConfig> {
        Ok(self.providers.connect_oauth_provider(request, grant).await?)
    }

    pub async fn connect_generic_provider(&self, request: GenericConnection) -> Result<ProviderConfig> {
        Ok(self.providers.connect_generic_provider(request).await?)
    }

    /// Removes a provider and every record synced from it.
    pub async fn remove_provider(&self, provider_id: &ProviderId) -> Result<()> {
        if self.providers.remove_provider(provider_id).await? {
            self.tokens.forget(provider_id).await;
            Ok(())
        } else {
            Err(EngineError::NotFound(provider_id.clone()))
        }
    }

    /// Subscribes to engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Number of jobs waiting in a lane.
    pub fn queue_depth(&self, priority: Priority) -> usize {
        self.queue.depth(priority)
    }
}
