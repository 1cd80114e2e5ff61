//! Adaptive sync scheduling.
//!
//! [`SchedulePolicy`] holds the cadence rules and the pure state transitions
//! applied after every job. [`Scheduler`] is the single periodic driver: it
//! loads due providers, turns them into [`SyncJob`]s and queues them. It never
//! calls an adapter.
//!
//! Per provider the cycle is `Idle -> Due -> Enqueued -> Running`, ending in
//! `Idle` on success or `Backoff` on failure. Revoked providers have no
//! `next_sync_at` and are never loaded as due.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::classifier::{ClassifiedError, ErrorKind};
use super::clock::Clock;
use super::job_queue::{EnqueueError, InFlightRegistry, JobQueue};
use crate::domain::{
    Capability, HealthStatus, JobId, Priority, ProviderConfig, ProviderHealth, SchedulingState,
    SyncJob, SyncType, Trigger,
};
use crate::storage::{DatabaseError, SyncRepository};

/// Lane assigned to scheduled syncs of each capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityPriorities {
    pub email: Priority,
    pub calendar: Priority,
    pub contacts: Priority,
}

impl CapabilityPriorities {
    pub fn get(&self, capability: Capability) -> Priority {
        match capability {
            Capability::Email => self.email,
            Capability::Calendar => self.calendar,
            Capability::Contacts => self.contacts,
        }
    }
}

impl Default for CapabilityPriorities {
    fn default() -> Self {
        Self {
            email: Priority::Normal,
            calendar: Priority::Normal,
            contacts: Priority::Low,
        }
    }
}

/// Cadence and backoff rules.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulePolicy {
    /// How often the driver looks for due providers.
    pub tick_interval: Duration,
    /// Interval for mailboxes with new items inside `activity_window`.
    pub active_interval: Duration,
    pub base_interval: Duration,
    /// Interval for mailboxes quiet for longer than `idle_after`.
    pub idle_interval: Duration,
    /// Cap on any computed interval.
    pub max_interval: Duration,
    pub backoff_multiplier: f64,
    pub activity_window: Duration,
    pub idle_after: Duration,
    /// Throttle delay when the provider sent no retry hint.
    pub rate_limit_default: Duration,
    pub rate_limit_max: Duration,
    /// Delay before retrying a provider whose lane was full.
    pub saturation_delay: Duration,
    /// Error streak at which health turns `Degraded`.
    pub error_badge_threshold: u32,
    pub priorities: CapabilityPriorities,
    /// Upper bound handed to full syncs.
    pub full_sync_limit: Option<u32>,
}

impl Default for SchedulePolicy {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            active_interval: Duration::from_secs(60),
            base_interval: Duration::from_secs(300),
            idle_interval: Duration::from_secs(1800),
            max_interval: Duration::from_secs(3600),
            backoff_multiplier: 2.0,
            activity_window: Duration::from_secs(3600),
            idle_after: Duration::from_secs(24 * 3600),
            rate_limit_default: Duration::from_secs(60),
            rate_limit_max: Duration::from_secs(3600),
            saturation_delay: Duration::from_secs(30),
            error_badge_threshold: 3,
            priorities: CapabilityPriorities::default(),
            full_sync_limit: Some(500),
        }
    }
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn elapsed_within(since: Option<DateTime<Utc>>, now: DateTime<Utc>, window: Duration) -> bool {
    since.is_some_and(|at| (now - at).to_std().map_or(true, |elapsed| elapsed <= window))
}

/// `base * multiplier^exponent`, capped. Saturates instead of overflowing.
fn scaled(base: Duration, multiplier: f64, exponent: u32, cap: Duration) -> Duration {
    let exponent = i32::try_from(exponent).unwrap_or(i32::MAX);
    let secs = base.as_secs_f64() * multiplier.max(1.0).powi(exponent);
    Duration::try_from_secs_f64(secs).map_or(cap, |d| d.min(cap))
}

impl SchedulePolicy {
    /// Interval before backoff, from how recently the mailbox saw new items.
    pub fn activity_interval(&self, state: &SchedulingState, now: DateTime<Utc>) -> Duration {
        if elapsed_within(state.last_activity_at, now, self.activity_window) {
            self.active_interval
        } else if elapsed_within(state.last_activity_at, now, self.idle_after) {
            self.base_interval
        } else {
            self.idle_interval
        }
    }

    /// Activity interval scaled by the error streak, capped at `max_interval`.
    pub fn backoff_interval(&self, state: &SchedulingState, now: DateTime<Utc>) -> Duration {
        scaled(
            self.activity_interval(state, now),
            self.backoff_multiplier,
            state.error_streak,
            self.max_interval,
        )
    }

    pub fn next_sync_at(&self, state: &SchedulingState, now: DateTime<Utc>) -> DateTime<Utc> {
        after(now, self.backoff_interval(state, now))
    }

    /// Applies a successful sync.
    pub fn on_success(&self, state: &mut SchedulingState, now: DateTime<Utc>, had_activity: bool) {
        state.error_streak = 0;
        state.throttle_streak = 0;
        state.last_synced_at = Some(now);
        if had_activity {
            state.last_activity_at = Some(now);
        }
        state.last_error = None;
        state.next_sync_at = Some(self.next_sync_at(state, now));
    }

    /// Applies a classified failure. Revocation is handled by the caller
    /// disabling the provider; here it only unschedules.
    pub fn on_failure(&self, state: &mut SchedulingState, now: DateTime<Utc>, err: &ClassifiedError) {
        state.last_error = Some(err.to_string());
        let delay = match err.kind {
            ErrorKind::AuthRevoked => {
                state.next_sync_at = None;
                return;
            }
            ErrorKind::RateLimited => match err.retry_after {
                Some(hint) => hint.min(self.rate_limit_max),
                None => {
                    let delay = scaled(
                        self.rate_limit_default,
                        2.0,
                        state.throttle_streak,
                        self.rate_limit_max,
                    );
                    state.throttle_streak = state.throttle_streak.saturating_add(1);
                    delay
                }
            },
            ErrorKind::Transient | ErrorKind::AuthExpired => {
                state.error_streak = state.error_streak.saturating_add(1);
                err.retry_after
                    .map(|hint| hint.min(self.max_interval))
                    .unwrap_or_else(|| self.backoff_interval(state, now))
            }
            ErrorKind::Permanent if err.reset_cursor => Duration::ZERO,
            ErrorKind::Permanent => self.backoff_interval(state, now),
        };
        state.next_sync_at = Some(after(now, delay));
    }

    /// Applies a drop-and-reschedule after the lane was full.
    pub fn on_saturated(&self, state: &mut SchedulingState, now: DateTime<Utc>) {
        state.next_sync_at = Some(after(now, self.saturation_delay));
    }

    /// Lane for a job: manual triggers jump ahead, backfills go to the low
    /// lane, everything else takes the best capability priority.
    pub fn priority_for(&self, config: &ProviderConfig, trigger: Trigger, sync_type: SyncType) -> Priority {
        match (trigger, sync_type) {
            (Trigger::Manual, _) => Priority::High,
            (Trigger::Scheduled, SyncType::Full) => Priority::Low,
            (Trigger::Scheduled, SyncType::Incremental) => config
                .capabilities
                .iter()
                .map(|c| self.priorities.get(c))
                .min()
                .unwrap_or(Priority::Low),
        }
    }

    /// Full when no enabled capability has a cursor yet.
    pub fn sync_type_for(&self, config: &ProviderConfig) -> SyncType {
        if config
            .capabilities
            .iter()
            .any(|c| config.cursors.get(c).is_some())
        {
            SyncType::Incremental
        } else {
            SyncType::Full
        }
    }

    pub fn build_job(&self, config: &ProviderConfig, trigger: Trigger, now: DateTime<Utc>) -> SyncJob {
        let sync_type = self.sync_type_for(config);
        SyncJob {
            id: JobId::generate(),
            provider_id: config.id.clone(),
            tenant_id: config.tenant_id.clone(),
            sync_type,
            priority: self.priority_for(config, trigger, sync_type),
            scopes: config.capabilities.iter().collect(),
            cursors: config.cursors.clone(),
            attempt: 0,
            enqueued_at: now,
            trigger,
        }
    }

    /// Health as shown to the tenant. Failures only raise an error badge
    /// once the streak crosses the threshold.
    pub fn health(&self, config: &ProviderConfig, in_flight: bool) -> ProviderHealth {
        let state = &config.schedule;
        let status = if config.needs_reconnection() {
            HealthStatus::NeedsReconnection
        } else if in_flight {
            HealthStatus::Syncing
        } else if state.error_streak >= self.error_badge_threshold {
            HealthStatus::Degraded
        } else if state.error_streak > 0 || state.throttle_streak > 0 {
            HealthStatus::BackingOff
        } else {
            HealthStatus::Healthy
        };

        ProviderHealth {
            provider_id: config.id.clone(),
            status,
            last_synced_at: state.last_synced_at,
            next_sync_at: state.next_sync_at,
            error_streak: state.error_streak,
            last_error: if status == HealthStatus::Degraded || status == HealthStatus::NeedsReconnection {
                state.last_error.clone()
            } else {
                None
            },
        }
    }
}

/// Counts from one scheduler pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub due: usize,
    pub enqueued: usize,
    pub skipped_in_flight: usize,
    pub saturated: usize,
}

/// Periodic driver that turns due providers into queued jobs.
pub struct Scheduler {
    repo: Arc<dyn SyncRepository>,
    queue: JobQueue,
    in_flight: InFlightRegistry,
    clock: Arc<dyn Clock>,
    policy: Arc<SchedulePolicy>,
}

impl Scheduler {
    pub fn new(
        repo: Arc<dyn SyncRepository>,
        queue: JobQueue,
        in_flight: InFlightRegistry,
        clock: Arc<dyn Clock>,
        policy: Arc<SchedulePolicy>,
    ) -> Self {
        Self {
            repo,
            queue,
            in_flight,
            clock,
            policy,
        }
    }

    pub fn policy(&self) -> &SchedulePolicy {
        &self.policy
    }

    /// One scheduling pass.
    #[instrument(skip(self))]
    pub async fn tick(&self) -> Result<TickReport, DatabaseError> {
        let now = self.clock.now();
        let due = self.repo.load_due_providers(now).await?;
        let mut report = TickReport {
            due: due.len(),
            ..TickReport::default()
        };

        for mut config in due {
            if !config.is_active || config.credentials.is_none() {
                continue;
            }
            if self.in_flight.claim(&config.id).await.is_none() {
                report.skipped_in_flight += 1;
                continue;
            }

            let job = self.policy.build_job(&config, Trigger::Scheduled, now);
            let (job_id, lane) = (job.id.clone(), job.priority);
            match self.queue.try_enqueue(job) {
                Ok(()) => {
                    report.enqueued += 1;
                    debug!(provider_id = %config.id, tenant_id = %config.tenant_id, job_id = %job_id, lane = %lane, "job enqueued");
                }
                Err(EnqueueError::Full(_)) => {
                    self.in_flight.release(&config.id).await;
                    report.saturated += 1;
                    warn!(provider_id = %config.id, lane = %lane, "lane saturated, rescheduling");
                    self.policy.on_saturated(&mut config.schedule, now);
                    config.updated_at = now;
                    if !self.repo.update_provider_config(&config).await? {
                        debug!(provider_id = %config.id, "provider removed before reschedule");
                    }
                }
                Err(EnqueueError::Closed(_)) => {
                    self.in_flight.release(&config.id).await;
                    warn!(lane = %lane, "lane closed, stopping pass");
                    break;
                }
            }
        }

        if report.due > 0 {
            info!(
                due = report.due,
                enqueued = report.enqueued,
                skipped = report.skipped_in_flight,
                saturated = report.saturated,
                "scheduler pass"
            );
        }
        Ok(report)
    }

    /// Ticks every `tick_interval` until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.policy.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(tick_secs = self.policy.tick_interval.as_secs(), "scheduler started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "scheduler pass failed");
                    }
                }
            }
        }
        info!("scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        Capabilities, EncryptedSecret, ProviderType, StoredCredentials, TenantId,
    };
    use crate::services::clock::ManualClock;
    use crate::services::job_queue::{LaneConfig, QueueConfig};
    use crate::storage::{Database, SqliteRepository};
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 1, 12, 0, 0).unwrap()
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    fn provider(email: &str) -> ProviderConfig {
        let mut config = ProviderConfig::new(
            TenantId::from("t1"),
            ProviderType::Google,
            email,
            StoredCredentials::OAuth {
                access_token: EncryptedSecret {
                    ciphertext: "c".to_string(),
                    iv: "i".to_string(),
                },
                refresh_token: None,
                expires_at: None,
            },
        );
        config.schedule = SchedulingState::due_at(now() - secs(1));
        config
    }

    fn transient() -> ClassifiedError {
        ClassifiedError::transient("503 Service Unavailable")
    }

    #[test]
    fn activity_shortens_interval() {
        let policy = SchedulePolicy::default();
        let mut state = SchedulingState::default();
        assert_eq!(policy.activity_interval(&state, now()), policy.idle_interval);

        state.last_activity_at = Some(now() - secs(600));
        assert_eq!(policy.activity_interval(&state, now()), policy.active_interval);

        state.last_activity_at = Some(now() - secs(6 * 3600));
        assert_eq!(policy.activity_interval(&state, now()), policy.base_interval);

        state.last_activity_at = Some(now() - secs(3 * 24 * 3600));
        assert_eq!(policy.activity_interval(&state, now()), policy.idle_interval);
    }

    #[test]
    fn backoff_is_monotonic_and_capped() {
        let policy = SchedulePolicy::default();
        let mut state = SchedulingState {
            last_activity_at: Some(now()),
            ..SchedulingState::default()
        };

        let mut previous = Duration::ZERO;
        for _ in 0..200 {
            policy.on_failure(&mut state, now(), &transient());
            let delay = (state.next_sync_at.unwrap() - now()).to_std().unwrap();
            assert!(delay >= previous, "{delay:?} < {previous:?}");
            assert!(delay <= policy.max_interval);
            previous = delay;
        }
        assert_eq!(state.error_streak, 200);
        assert_eq!(previous, policy.max_interval);
    }

    #[test]
    fn success_resets_streaks() {
        let policy = SchedulePolicy::default();
        let mut state = SchedulingState {
            error_streak: 4,
            throttle_streak: 2,
            last_error: Some("boom".to_string()),
            ..SchedulingState::default()
        };

        policy.on_success(&mut state, now(), true);
        assert_eq!(state.error_streak, 0);
        assert_eq!(state.throttle_streak, 0);
        assert_eq!(state.last_synced_at, Some(now()));
        assert_eq!(state.last_activity_at, Some(now()));
        assert_eq!(state.last_error, None);
        assert_eq!(state.next_sync_at, Some(now() + secs(60)));
    }

    #[test]
    fn rate_limit_hint_leaves_error_streak() {
        let policy = SchedulePolicy::default();
        let mut state = SchedulingState {
            error_streak: 1,
            ..SchedulingState::default()
        };
        let mut err = ClassifiedError::new(ErrorKind::RateLimited, "429");
        err.retry_after = Some(Duration::from_secs(120));

        policy.on_failure(&mut state, now(), &err);
        assert_eq!(state.error_streak, 1);
        assert_eq!(state.throttle_streak, 0);
        assert_eq!(state.next_sync_at, Some(now() + secs(120)));
    }

    #[test]
    fn rate_limit_hint_is_capped() {
        let policy = SchedulePolicy::default();
        let mut state = SchedulingState::default();
        let mut err = ClassifiedError::new(ErrorKind::RateLimited, "429");
        err.retry_after = Some(Duration::from_secs(300_000_000_000));

        policy.on_failure(&mut state, now(), &err);
        assert_eq!(state.next_sync_at, Some(now() + secs(3600)));
        assert_eq!(state.error_streak, 0);
    }

    #[test]
    fn rate_limit_without_hint_soft_increments() {
        let policy = SchedulePolicy::default();
        let mut state = SchedulingState::default();
        let err = ClassifiedError::new(ErrorKind::RateLimited, "THROTTLED");

        policy.on_failure(&mut state, now(), &err);
        assert_eq!(state.next_sync_at, Some(now() + secs(60)));
        policy.on_failure(&mut state, now(), &err);
        assert_eq!(state.next_sync_at, Some(now() + secs(120)));
        assert_eq!(state.throttle_streak, 2);
        assert_eq!(state.error_streak, 0);

        for _ in 0..20 {
            policy.on_failure(&mut state, now(), &err);
        }
        assert_eq!(state.next_sync_at, Some(now() + secs(3600)));
    }

    #[test]
    fn permanent_failure_keeps_natural_interval() {
        let policy = SchedulePolicy::default();
        let mut state = SchedulingState {
            last_activity_at: Some(now() - secs(60)),
            ..SchedulingState::default()
        };
        policy.on_failure(&mut state, now(), &ClassifiedError::permanent("400"));
        assert_eq!(state.error_streak, 0);
        assert_eq!(state.next_sync_at, Some(now() + secs(60)));

        let mut reset = ClassifiedError::permanent("410 Gone");
        reset.reset_cursor = true;
        policy.on_failure(&mut state, now(), &reset);
        assert_eq!(state.next_sync_at, Some(now()));
    }

    #[test]
    fn revocation_unschedules() {
        let policy = SchedulePolicy::default();
        let mut state = SchedulingState::due_at(now());
        policy.on_failure(&mut state, now(), &ClassifiedError::revoked("invalid_grant"));
        assert_eq!(state.next_sync_at, None);
    }

    #[test]
    fn priorities_follow_trigger_and_capabilities() {
        let policy = SchedulePolicy::default();
        let mut config = provider("a@example.com");
        config.cursors.email = Some("abc123".to_string());

        assert_eq!(
            policy.priority_for(&config, Trigger::Manual, SyncType::Incremental),
            Priority::High
        );
        assert_eq!(
            policy.priority_for(&config, Trigger::Scheduled, SyncType::Full),
            Priority::Low
        );
        assert_eq!(
            policy.priority_for(&config, Trigger::Scheduled, SyncType::Incremental),
            Priority::Normal
        );

        config.capabilities = Capabilities {
            email: false,
            calendar: false,
            contacts: true,
        };
        assert_eq!(
            policy.priority_for(&config, Trigger::Scheduled, SyncType::Incremental),
            Priority::Low
        );
    }

    #[test]
    fn job_snapshot_carries_scopes_and_cursors() {
        let policy = SchedulePolicy::default();
        let mut config = provider("a@example.com");
        let job = policy.build_job(&config, Trigger::Scheduled, now());
        assert_eq!(job.sync_type, SyncType::Full);
        assert_eq!(job.scopes, vec![Capability::Email, Capability::Calendar, Capability::Contacts]);

        config.cursors.email = Some("abc123".to_string());
        let job = policy.build_job(&config, Trigger::Manual, now());
        assert_eq!(job.sync_type, SyncType::Incremental);
        assert_eq!(job.priority, Priority::High);
        assert_eq!(job.cursors.email.as_deref(), Some("abc123"));
        assert_eq!(job.enqueued_at, now());
    }

    #[test]
    fn health_badges_only_past_threshold() {
        let policy = SchedulePolicy::default();
        let mut config = provider("a@example.com");
        assert_eq!(policy.health(&config, false).status, HealthStatus::Healthy);
        assert_eq!(policy.health(&config, true).status, HealthStatus::Syncing);

        config.schedule.error_streak = 2;
        config.schedule.last_synced_at = Some(now());
        config.schedule.last_error = Some("transient: 503".to_string());
        let health = policy.health(&config, false);
        assert_eq!(health.status, HealthStatus::BackingOff);
        assert_eq!(health.last_synced_at, Some(now()));
        assert_eq!(health.last_error, None);

        config.schedule.error_streak = 3;
        let health = policy.health(&config, false);
        assert_eq!(health.status, HealthStatus::Degraded);
        assert!(health.last_error.is_some());

        config.revoke("invalid_grant");
        assert_eq!(
            policy.health(&config, false).status,
            HealthStatus::NeedsReconnection
        );
    }

    async fn scheduler(
        lanes: &QueueConfig,
    ) -> (
        Scheduler,
        Arc<SqliteRepository>,
        crate::services::job_queue::LaneReceivers,
        InFlightRegistry,
    ) {
        let repo = Arc::new(SqliteRepository::new(Database::open_in_memory().await.unwrap()));
        let (queue, receivers) = JobQueue::new(lanes);
        let in_flight = InFlightRegistry::new();
        let scheduler = Scheduler::new(
            repo.clone(),
            queue,
            in_flight.clone(),
            Arc::new(ManualClock::new(now())),
            Arc::new(SchedulePolicy::default()),
        );
        (scheduler, repo, receivers, in_flight)
    }

    #[tokio::test]
    async fn tick_enqueues_due_and_skips_in_flight() {
        let (scheduler, repo, _receivers, in_flight) = scheduler(&QueueConfig::default()).await;
        let due = provider("due@example.com");
        let busy = provider("busy@example.com");
        let mut later = provider("later@example.com");
        later.schedule.next_sync_at = Some(now() + secs(300));
        for config in [&due, &busy, &later] {
            repo.insert_provider_config(config).await.unwrap();
        }
        in_flight.claim(&busy.id).await.unwrap();

        let report = scheduler.tick().await.unwrap();
        assert_eq!(
            report,
            TickReport {
                due: 2,
                enqueued: 1,
                skipped_in_flight: 1,
                saturated: 0,
            }
        );
        assert!(in_flight.contains(&due.id).await);

        // Still in flight on the next pass, so nothing new is queued.
        let report = scheduler.tick().await.unwrap();
        assert_eq!(report.enqueued, 0);
        assert_eq!(report.skipped_in_flight, 2);
    }

    #[tokio::test]
    async fn revoked_provider_is_never_enqueued() {
        let (scheduler, repo, _receivers, _in_flight) = scheduler(&QueueConfig::default()).await;
        let mut config = provider("gone@example.com");
        config.revoke("invalid_grant");
        config.schedule.next_sync_at = Some(now() - secs(60));
        repo.insert_provider_config(&config).await.unwrap();

        for _ in 0..3 {
            let report = scheduler.tick().await.unwrap();
            assert_eq!(report.enqueued, 0);
        }
    }

    #[tokio::test]
    async fn huge_retry_after_does_not_make_provider_due() {
        let (scheduler, repo, _receivers, _in_flight) = scheduler(&QueueConfig::default()).await;
        let mut config = provider("throttled@example.com");
        let err = crate::services::classifier::classify_at(
            &crate::providers::ProviderError::Http {
                status: 429,
                code: None,
                message: "Too Many Requests".to_string(),
                retry_after: Some("300000000000".to_string()),
            },
            now(),
        );
        SchedulePolicy::default().on_failure(&mut config.schedule, now(), &err);
        repo.insert_provider_config(&config).await.unwrap();

        assert!(repo.load_due_providers(now()).await.unwrap().is_empty());
        assert_eq!(scheduler.tick().await.unwrap().due, 0);
    }

    #[tokio::test]
    async fn saturated_lane_drops_and_reschedules() {
        let lane = LaneConfig {
            workers: 1,
            capacity: 1,
        };
        let lanes = QueueConfig {
            high: lane,
            normal: lane,
            low: lane,
        };
        let (scheduler, repo, _receivers, in_flight) = scheduler(&lanes).await;
        let first = provider("first@example.com");
        let second = provider("second@example.com");
        repo.insert_provider_config(&first).await.unwrap();
        repo.insert_provider_config(&second).await.unwrap();

        let report = scheduler.tick().await.unwrap();
        assert_eq!(report.enqueued, 1);
        assert_eq!(report.saturated, 1);
        assert_eq!(in_flight.len().await, 1);

        let configs = repo.list_providers(&TenantId::from("t1")).await.unwrap();
        let rescheduled: Vec<_> = configs
            .iter()
            .filter(|c| c.schedule.next_sync_at == Some(now() + secs(30)))
            .collect();
        assert_eq!(rescheduled.len(), 1);
        assert!(!in_flight.contains(&rescheduled[0].id).await);
    }
}
