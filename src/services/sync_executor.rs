//! Per-job sync orchestration.
//!
//! For each claimed [`SyncJob`] the executor:
//!
//! 1. obtains a credential from the [`TokenManager`]
//! 2. builds the provider's adapter and syncs each scope in order
//! 3. classifies failures, retrying transient ones locally and refreshing the
//!    token once on an auth rejection
//! 4. upserts changed records by provider-scoped external ID and removes
//!    deleted ones
//! 5. advances cursors, applies the scheduler transition and emits a
//!    [`SyncEvent`]
//!
//! Cancellation is cooperative and checked between adapter calls and before
//! persisting.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::classifier::{classify_at, ClassifiedError, ErrorKind};
use super::clock::Clock;
use super::job_queue::{InFlightRegistry, JobHandler};
use super::scheduler::SchedulePolicy;
use super::token_service::{AccessCredential, TokenManager};
use crate::domain::{
    CalendarEvent, Capability, Contact, Email, JobId, Priority, ProviderConfig, ProviderId,
    ScopeOutcome, SyncJob, SyncResult, SyncType,
};
use crate::providers::{AdapterFactory, MailboxAdapter, ProviderError, SyncBatch, SyncParams};
use crate::storage::{DatabaseError, SyncRepository};

/// Engine events for subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Started {
        provider_id: ProviderId,
        job_id: JobId,
        priority: Priority,
    },
    Completed {
        provider_id: ProviderId,
        job_id: JobId,
        result: SyncResult,
    },
    Failed {
        provider_id: ProviderId,
        job_id: JobId,
        kind: ErrorKind,
        message: String,
    },
    /// Credentials were revoked; the tenant must reconnect.
    Revoked {
        provider_id: ProviderId,
        reason: String,
    },
}

/// Executor timeouts and retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Deadline for one adapter call.
    pub adapter_timeout: Duration,
    /// Deadline for the whole job, retries included.
    pub job_timeout: Duration,
    /// Attempts per scope for transient failures.
    pub max_attempts: u32,
    /// First local retry delay; grows linearly with the attempt.
    pub retry_backoff: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            adapter_timeout: Duration::from_secs(30),
            job_timeout: Duration::from_secs(300),
            max_attempts: 3,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

enum Failure {
    Cancelled,
    /// The provider was deleted while the job ran.
    Removed,
    Error {
        scope: Option<Capability>,
        error: ClassifiedError,
    },
}

impl Failure {
    fn at(scope: Option<Capability>, error: ClassifiedError) -> Self {
        Self::Error { scope, error }
    }
}

impl From<DatabaseError> for Failure {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::ProviderRemoved(_) => Self::Removed,
            err => Self::at(None, ClassifiedError::transient(err.to_string())),
        }
    }
}

enum ScopeBatch {
    Emails(SyncBatch<Email>),
    Events(SyncBatch<CalendarEvent>),
    Contacts(SyncBatch<Contact>),
}

/// Runs sync jobs claimed by the worker pool.
pub struct SyncExecutor {
    repo: Arc<dyn SyncRepository>,
    tokens: Arc<TokenManager>,
    adapters: Arc<dyn AdapterFactory>,
    policy: Arc<SchedulePolicy>,
    clock: Arc<dyn Clock>,
    in_flight: InFlightRegistry,
    events: broadcast::Sender<SyncEvent>,
    config: ExecutorConfig,
}

impl SyncExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: Arc<dyn SyncRepository>,
        tokens: Arc<TokenManager>,
        adapters: Arc<dyn AdapterFactory>,
        policy: Arc<SchedulePolicy>,
        clock: Arc<dyn Clock>,
        in_flight: InFlightRegistry,
        events: broadcast::Sender<SyncEvent>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            repo,
            tokens,
            adapters,
            policy,
            clock,
            in_flight,
            events,
            config,
        }
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    /// Executes one job to completion and records its outcome.
    #[instrument(skip(self, job, cancel), fields(job_id = %job.id, provider_id = %job.provider_id, lane = %job.priority))]
    pub async fn execute(&self, mut job: SyncJob, cancel: CancellationToken) -> SyncResult {
        self.emit(SyncEvent::Started {
            provider_id: job.provider_id.clone(),
            job_id: job.id.clone(),
            priority: job.priority,
        });

        let mut result = SyncResult::default();
        let outcome = match tokio::time::timeout(
            self.config.job_timeout,
            self.sync_scopes(&mut job, &cancel, &mut result),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(Failure::at(
                None,
                ClassifiedError::transient(format!("job exceeded {:?}", self.config.job_timeout)),
            )),
        };

        match outcome {
            Err(Failure::Cancelled) => {
                info!("job cancelled");
                result.error = Some("cancelled".to_string());
                return result;
            }
            Err(Failure::Removed) => {
                info!("provider removed during job");
                result.error = Some("provider removed".to_string());
                return result;
            }
            _ => {}
        }

        if let Err(Failure::Error { error, .. }) = &outcome {
            result.error = Some(error.to_string());
        }
        if let Err(e) = self.finish(&job, &result, outcome).await {
            warn!(error = %e, "failed to record sync outcome");
        }
        result
    }

    async fn sync_scopes(
        &self,
        job: &mut SyncJob,
        cancel: &CancellationToken,
        result: &mut SyncResult,
    ) -> Result<(), Failure> {
        let config = self
            .repo
            .get_provider(&job.provider_id)
            .await?
            .ok_or(Failure::Removed)?;

        let mut credential = self
            .tokens
            .get_valid_access_token(&job.provider_id)
            .await
            .map_err(|e| Failure::at(None, e.classify()))?;
        let mut adapter = self.adapter(&config, &credential)?;
        let mut refreshed = false;

        let scopes = job.scopes.clone();
        for scope in scopes {
            checkpoint(cancel)?;
            let params = self.params_for(job, scope);
            job.attempt = 1;

            let batch = loop {
                match self.call_scope(adapter.as_ref(), scope, &params).await {
                    Ok(batch) => break batch,
                    Err(err) => {
                        let classified = classify_at(&err, self.clock.now());
                        match classified.kind {
                            ErrorKind::AuthExpired if !refreshed => {
                                refreshed = true;
                                let Some(rejected) = credential.bearer().cloned() else {
                                    return Err(Failure::at(Some(scope), classified));
                                };
                                debug!(scope = %scope, "access token rejected, refreshing");
                                credential = self
                                    .tokens
                                    .refresh_after_rejection(&job.provider_id, &rejected)
                                    .await
                                    .map_err(|e| Failure::at(Some(scope), e.classify()))?;
                                adapter = self.adapter(&config, &credential)?;
                            }
                            ErrorKind::Transient if job.attempt < self.config.max_attempts => {
                                warn!(scope = %scope, attempt = job.attempt, error = %classified.message, "transient failure, retrying");
                                tokio::time::sleep(self.config.retry_backoff * job.attempt).await;
                                job.attempt += 1;
                            }
                            _ => return Err(Failure::at(Some(scope), classified)),
                        }
                        checkpoint(cancel)?;
                    }
                }
            };

            checkpoint(cancel)?;
            let outcome = self.persist(job, batch).await?;
            debug!(
                scope = %scope,
                synced = outcome.synced,
                new_items = outcome.new_items,
                deleted = outcome.deleted,
                "scope synced"
            );
            result.record(scope, outcome);

            if scope == Capability::Email {
                self.refresh_folders(job, adapter.as_ref()).await;
            }
        }
        Ok(())
    }

    fn adapter(
        &self,
        config: &ProviderConfig,
        credential: &AccessCredential,
    ) -> Result<Arc<dyn MailboxAdapter>, Failure> {
        self.adapters
            .create(config, credential.credential.clone())
            .map_err(|e| Failure::at(None, classify_at(&e, self.clock.now())))
    }

    fn params_for(&self, job: &SyncJob, scope: Capability) -> SyncParams {
        match (job.sync_type, job.cursors.get(scope)) {
            (SyncType::Incremental, Some(cursor)) => SyncParams::incremental(Some(cursor.to_string())),
            _ => SyncParams::full(self.policy.full_sync_limit),
        }
    }

    async fn bounded<T>(
        &self,
        call: impl std::future::Future<Output = crate::providers::Result<T>>,
    ) -> crate::providers::Result<T> {
        tokio::time::timeout(self.config.adapter_timeout, call)
            .await
            .unwrap_or(Err(ProviderError::Timeout(self.config.adapter_timeout)))
    }

    async fn call_scope(
        &self,
        adapter: &dyn MailboxAdapter,
        scope: Capability,
        params: &SyncParams,
    ) -> crate::providers::Result<ScopeBatch> {
        match scope {
            Capability::Email => self.bounded(adapter.sync_emails(params)).await.map(ScopeBatch::Emails),
            Capability::Calendar => self
                .bounded(adapter.sync_calendar(params))
                .await
                .map(ScopeBatch::Events),
            Capability::Contacts => self
                .bounded(adapter.sync_contacts(params))
                .await
                .map(ScopeBatch::Contacts),
        }
    }

    /// Upserts and deletes of one scope land in a single transaction.
    async fn persist(&self, job: &SyncJob, batch: ScopeBatch) -> Result<ScopeOutcome, Failure> {
        let (tenant, provider) = (&job.tenant_id, &job.provider_id);
        let (synced, applied, next_cursor) = match batch {
            ScopeBatch::Emails(batch) => (
                batch.items.len(),
                self.repo
                    .apply_emails(tenant, provider, &batch.items, &batch.deleted)
                    .await?,
                batch.next_cursor,
            ),
            ScopeBatch::Events(batch) => (
                batch.items.len(),
                self.repo
                    .apply_events(tenant, provider, &batch.items, &batch.deleted)
                    .await?,
                batch.next_cursor,
            ),
            ScopeBatch::Contacts(batch) => (
                batch.items.len(),
                self.repo
                    .apply_contacts(tenant, provider, &batch.items, &batch.deleted)
                    .await?,
                batch.next_cursor,
            ),
        };
        Ok(ScopeOutcome {
            synced,
            new_items: applied.created,
            deleted: applied.deleted,
            next_cursor,
        })
    }

    /// Best effort; a folder listing failure never fails the job.
    async fn refresh_folders(&self, job: &SyncJob, adapter: &dyn MailboxAdapter) {
        match self.bounded(adapter.get_labels()).await {
            Ok(folders) => {
                if let Err(e) = self.repo.upsert_folders(&job.provider_id, &folders).await {
                    warn!(error = %e, "failed to store folders");
                }
            }
            Err(e) => debug!(error = %e, "folder listing skipped"),
        }
    }

    /// Writes cursors and scheduling state. Reloads the config first so
    /// credentials refreshed during the job are not overwritten.
    async fn finish(
        &self,
        job: &SyncJob,
        result: &SyncResult,
        outcome: Result<(), Failure>,
    ) -> Result<(), DatabaseError> {
        let Some(mut config) = self.repo.get_provider(&job.provider_id).await? else {
            debug!("provider removed during job");
            return Ok(());
        };
        let now = self.clock.now();

        for &scope in &job.scopes {
            if let Some(outcome) = result.outcome(scope) {
                config.cursors.set(scope, outcome.next_cursor.clone());
            }
        }

        let event = match outcome {
            Ok(()) => {
                self.policy
                    .on_success(&mut config.schedule, now, result.had_activity());
                info!(
                    synced = result.total_synced(),
                    new_items = result.total_new(),
                    next_sync_at = ?config.schedule.next_sync_at,
                    "sync completed"
                );
                SyncEvent::Completed {
                    provider_id: job.provider_id.clone(),
                    job_id: job.id.clone(),
                    result: result.clone(),
                }
            }
            Err(Failure::Error { scope, error }) => {
                if let (true, Some(scope)) = (error.reset_cursor, scope) {
                    warn!(scope = %scope, "cursor rejected by provider, resetting");
                    config.cursors.set(scope, None);
                }

                self.policy.on_failure(&mut config.schedule, now, &error);
                if error.kind == ErrorKind::AuthRevoked {
                    if config.is_active {
                        config.revoke(error.message.clone());
                    }
                    warn!(tenant_id = %config.tenant_id, reason = %error.message, "provider needs reconnection");
                    SyncEvent::Revoked {
                        provider_id: job.provider_id.clone(),
                        reason: error.message,
                    }
                } else {
                    warn!(
                        kind = %error.kind,
                        attempt = job.attempt,
                        error_streak = config.schedule.error_streak,
                        next_sync_at = ?config.schedule.next_sync_at,
                        error = %error.message,
                        "sync failed"
                    );
                    SyncEvent::Failed {
                        provider_id: job.provider_id.clone(),
                        job_id: job.id.clone(),
                        kind: error.kind,
                        message: error.message,
                    }
                }
            }
            Err(Failure::Cancelled | Failure::Removed) => return Ok(()),
        };

        config.updated_at = now;
        if !self.repo.update_provider_config(&config).await? {
            debug!("provider removed before outcome was stored");
            return Ok(());
        }
        self.emit(event);
        Ok(())
    }
}

fn checkpoint(cancel: &CancellationToken) -> Result<(), Failure> {
    if cancel.is_cancelled() {
        Err(Failure::Cancelled)
    } else {
        Ok(())
    }
}

#[async_trait]
impl JobHandler for SyncExecutor {
    async fn handle(&self, job: SyncJob) {
        let provider_id = job.provider_id.clone();
        let Some(cancel) = self.in_flight.token(&provider_id).await else {
            debug!(provider_id = %provider_id, job_id = %job.id, "job for released provider dropped");
            return;
        };
        self.execute(job, cancel.clone()).await;
        if !cancel.is_cancelled() {
            self.in_flight.release(&provider_id).await;
        }
    }
}
