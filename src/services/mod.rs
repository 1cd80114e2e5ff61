//! Sync engine services.
//!
//! # Architecture
//!
//! ```text
//!   Scheduler --(due providers)--> JobQueue [high | normal | low]
//!                                       |
//!                                  WorkerPool (per-lane workers)
//!                                       |
//!                                  SyncExecutor --> TokenManager --> token endpoint
//!                                       |
//!                                  MailboxAdapter --> SyncRepository
//! ```
//!
//! # Services Overview
//!
//! - [`SyncService`]: engine facade (start, shutdown, manual sync, health, events)
//! - [`ProviderService`]: connecting and removing providers
//! - [`Scheduler`] and [`SchedulePolicy`]: adaptive intervals, backoff, priorities
//! - [`JobQueue`], [`WorkerPool`] and [`InFlightRegistry`]: prioritized dispatch
//! - [`SyncExecutor`]: runs one job against an adapter
//! - [`TokenManager`]: valid credentials and serialized refresh
//! - [`classify`]: maps provider failures to [`ErrorKind`]

mod classifier;
mod clock;
mod job_queue;
mod provider_service;
mod scheduler;
mod sync_executor;
mod sync_service;
mod token_service;

pub use classifier::{classify, classify_at, parse_retry_after, ClassifiedError, ErrorKind};
pub use clock::{Clock, ManualClock, SystemClock};
pub use job_queue::{
    EnqueueError, InFlightRegistry, JobHandler, JobQueue, LaneConfig, LaneReceivers, QueueConfig,
    WorkerPool,
};
pub use provider_service::{
    GenericConnection, OAuthConnection, ProviderService, ProviderServiceError,
};
pub use scheduler::{CapabilityPriorities, SchedulePolicy, Scheduler, TickReport};
pub use sync_executor::{ExecutorConfig, SyncEvent, SyncExecutor};
pub use sync_service::{EngineConfig, EngineError, SyncService, TokenSettings};
pub use token_service::{
    AccessCredential, OAuthClient, OAuthTokenClient, TokenEndpoint, TokenError, TokenGrant,
    TokenManager, GOOGLE_TOKEN_URL, MICROSOFT_TOKEN_URL,
};
