//! Priority job queue and worker pool.
//!
//! Three lanes (high, normal, low), each a bounded `mpsc` channel drained by
//! its own fixed set of workers. Lanes never share workers, so a deep low
//! lane cannot delay high-priority jobs. Within a lane jobs are dispatched in
//! FIFO order and each job is received by exactly one worker.
//!
//! [`InFlightRegistry`] tracks which providers have a job queued or running
//! and carries the cancellation token for that job.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::domain::{Priority, ProviderId, SyncJob};

/// Job could not be queued. The job is handed back to the caller.
#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("{} lane is full", .0.priority)]
    Full(Box<SyncJob>),

    #[error("{} lane is closed", .0.priority)]
    Closed(Box<SyncJob>),
}

impl EnqueueError {
    pub fn into_job(self) -> SyncJob {
        match self {
            Self::Full(job) | Self::Closed(job) => *job,
        }
    }
}

/// Worker count and queue capacity for one lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneConfig {
    pub workers: usize,
    pub capacity: usize,
}

/// Lane sizing. Worker counts are tuned defaults, not requirements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub high: LaneConfig,
    pub normal: LaneConfig,
    pub low: LaneConfig,
}

impl QueueConfig {
    pub fn lane(&self, priority: Priority) -> LaneConfig {
        match priority {
            Priority::High => self.high,
            Priority::Normal => self.normal,
            Priority::Low => self.low,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            high: LaneConfig {
                workers: 17,
                capacity: 100,
            },
            normal: LaneConfig {
                workers: 10,
                capacity: 100,
            },
            low: LaneConfig {
                workers: 7,
                capacity: 100,
            },
        }
    }
}

/// Producer side of the three lanes. Cheap to clone.
#[derive(Debug, Clone)]
pub struct JobQueue {
    high: mpsc::Sender<SyncJob>,
    normal: mpsc::Sender<SyncJob>,
    low: mpsc::Sender<SyncJob>,
}

/// Consumer side of the three lanes, handed to [`WorkerPool::spawn`].
#[derive(Debug)]
pub struct LaneReceivers {
    high: mpsc::Receiver<SyncJob>,
    normal: mpsc::Receiver<SyncJob>,
    low: mpsc::Receiver<SyncJob>,
}

impl JobQueue {
    pub fn new(config: &QueueConfig) -> (Self, LaneReceivers) {
        let (high_tx, high_rx) = mpsc::channel(config.high.capacity.max(1));
        let (normal_tx, normal_rx) = mpsc::channel(config.normal.capacity.max(1));
        let (low_tx, low_rx) = mpsc::channel(config.low.capacity.max(1));
        (
            Self {
                high: high_tx,
                normal: normal_tx,
                low: low_tx,
            },
            LaneReceivers {
                high: high_rx,
                normal: normal_rx,
                low: low_rx,
            },
        )
    }

    fn lane(&self, priority: Priority) -> &mpsc::Sender<SyncJob> {
        match priority {
            Priority::High => &self.high,
            Priority::Normal => &self.normal,
            Priority::Low => &self.low,
        }
    }

    /// Queues a job without waiting. A full lane hands the job back.
    pub fn try_enqueue(&self, job: SyncJob) -> Result<(), EnqueueError> {
        self.lane(job.priority).try_send(job).map_err(|err| match err {
            mpsc::error::TrySendError::Full(job) => EnqueueError::Full(Box::new(job)),
            mpsc::error::TrySendError::Closed(job) => EnqueueError::Closed(Box::new(job)),
        })
    }

    /// Queues a job, waiting for lane capacity.
    pub async fn enqueue(&self, job: SyncJob) -> Result<(), EnqueueError> {
        self.lane(job.priority)
            .send(job)
            .await
            .map_err(|err| EnqueueError::Closed(Box::new(err.0)))
    }

    /// Jobs waiting in a lane.
    pub fn depth(&self, priority: Priority) -> usize {
        let lane = self.lane(priority);
        lane.max_capacity() - lane.capacity()
    }
}

/// Runs one claimed job.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: SyncJob);
}

/// Fixed set of workers per lane.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns every lane's workers. They stop when `cancel` fires or their
    /// lane is closed and drained.
    pub fn spawn(
        receivers: LaneReceivers,
        config: &QueueConfig,
        handler: Arc<dyn JobHandler>,
        cancel: CancellationToken,
    ) -> Self {
        let lanes = [
            (Priority::High, receivers.high),
            (Priority::Normal, receivers.normal),
            (Priority::Low, receivers.low),
        ];

        let mut handles = Vec::new();
        for (priority, receiver) in lanes {
            let workers = config.lane(priority).workers;
            let receiver = Arc::new(Mutex::new(receiver));
            for worker in 0..workers {
                handles.push(tokio::spawn(run_worker(
                    priority,
                    worker,
                    receiver.clone(),
                    handler.clone(),
                    cancel.clone(),
                )));
            }
            info!(lane = %priority, workers, "lane started");
        }

        Self { handles }
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Waits for every worker to exit.
    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

async fn run_worker(
    lane: Priority,
    worker: usize,
    receiver: Arc<Mutex<mpsc::Receiver<SyncJob>>>,
    handler: Arc<dyn JobHandler>,
    cancel: CancellationToken,
) {
    loop {
        let job = {
            let mut receiver = receiver.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => None,
                job = receiver.recv() => job,
            }
        };
        let Some(job) = job else {
            break;
        };

        debug!(lane = %lane, worker, job_id = %job.id, provider_id = %job.provider_id, "job claimed");
        handler.handle(job).await;
    }
    debug!(lane = %lane, worker, "worker stopped");
}

/// Providers with a job queued or running.
///
/// A provider is claimed when its job is queued and released when the job
/// finishes, so at most one job per provider is ever in flight.
#[derive(Debug, Clone, Default)]
pub struct InFlightRegistry {
    inner: Arc<Mutex<HashMap<ProviderId, CancellationToken>>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the provider. `None` when it already has a job in flight.
    pub async fn claim(&self, provider_id: &ProviderId) -> Option<CancellationToken> {
        let mut inner = self.inner.lock().await;
        if inner.contains_key(provider_id) {
            return None;
        }
        let token = CancellationToken::new();
        inner.insert(provider_id.clone(), token.clone());
        Some(token)
    }

    pub async fn release(&self, provider_id: &ProviderId) {
        self.inner.lock().await.remove(provider_id);
    }

    /// Cancels and releases the provider's job. Returns whether one existed.
    pub async fn cancel(&self, provider_id: &ProviderId) -> bool {
        match self.inner.lock().await.remove(provider_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancellation token of the provider's current job.
    pub async fn token(&self, provider_id: &ProviderId) -> Option<CancellationToken> {
        self.inner.lock().await.get(provider_id).cloned()
    }

    pub async fn contains(&self, provider_id: &ProviderId) -> bool {
        self.inner.lock().await.contains_key(provider_id)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Cancels everything in flight.
    pub async fn cancel_all(&self) {
        for (_, token) in self.inner.lock().await.drain() {
            token.cancel();
        }
    }
}
