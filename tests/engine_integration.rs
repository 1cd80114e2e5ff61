//! End-to-end tests for the sync engine.
//!
//! The engine runs with its real scheduler, queue, workers and SQLite
//! storage. Provider adapters and the token endpoint are scripted and time is
//! driven by a manual clock.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::{broadcast, Notify};

use mailsync::domain::{
    CalendarEvent, Capabilities, Contact, Draft, Email, Folder, HealthStatus, ProviderConfig,
    ProviderId, ProviderType, TenantId,
};
use mailsync::providers::{
    AdapterFactory, Credential, ListThreadsParams, MailboxAdapter, OutgoingEmail, ProviderError,
    SyncBatch, SyncParams, ThreadPage, UserInfo,
};
use mailsync::services::{
    EngineConfig, EngineError, ErrorKind, ExecutorConfig, LaneConfig, ManualClock,
    OAuthConnection, QueueConfig, SyncEvent, SyncService, TokenEndpoint, TokenGrant,
};
use mailsync::storage::{CredentialVault, Database, Secret, SqliteRepository, SyncRepository};

fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 5, 1, 12, 0, 0).unwrap()
}

/// Per-mailbox scripted responses.
#[derive(Default)]
struct Mailbox {
    email: Mutex<VecDeque<mailsync::providers::Result<SyncBatch<Email>>>>,
    params: Mutex<Vec<SyncParams>>,
    /// When set, contact syncs wait for a notification.
    gate: Option<Arc<Notify>>,
}

#[derive(Default)]
struct Script {
    mailboxes: Mutex<HashMap<String, Arc<Mailbox>>>,
}

impl Script {
    fn mailbox(&self, address: &str) -> Arc<Mailbox> {
        self.mailboxes
            .lock()
            .unwrap()
            .entry(address.to_string())
            .or_default()
            .clone()
    }

    fn gate(&self, address: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.mailboxes.lock().unwrap().insert(
            address.to_string(),
            Arc::new(Mailbox {
                gate: Some(gate.clone()),
                ..Mailbox::default()
            }),
        );
        gate
    }
}

struct ScriptedAdapter(Arc<Mailbox>);

#[async_trait]
impl MailboxAdapter for ScriptedAdapter {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Google
    }
    async fn get_user_info(&self) -> mailsync::providers::Result<UserInfo> {
        Err(ProviderError::Unsupported("scripted".to_string()))
    }
    async fn list_threads(&self, _: &ListThreadsParams) -> mailsync::providers::Result<ThreadPage> {
        Ok(ThreadPage::default())
    }
    async fn get_message(&self, id: &str) -> mailsync::providers::Result<Email> {
        Err(ProviderError::NotFound(id.to_string()))
    }
    async fn send_email(&self, _: &OutgoingEmail) -> mailsync::providers::Result<String> {
        Err(ProviderError::Unsupported("scripted".to_string()))
    }
    async fn sync_emails(&self, params: &SyncParams) -> mailsync::providers::Result<SyncBatch<Email>> {
        self.0.params.lock().unwrap().push(params.clone());
        let next = self.0.email.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(SyncBatch::default()))
    }
    async fn get_labels(&self) -> mailsync::providers::Result<Vec<Folder>> {
        Ok(vec![Folder::new("INBOX", "Inbox"), Folder::new("SENT", "Sent")])
    }
    async fn create_label(&self, name: &str) -> mailsync::providers::Result<Folder> {
        Ok(Folder::new(name, name))
    }
    async fn mark_as_read(&self, _: &[String]) -> mailsync::providers::Result<()> {
        Ok(())
    }
    async fn mark_as_unread(&self, _: &[String]) -> mailsync::providers::Result<()> {
        Ok(())
    }
    async fn create_draft(&self, _: &OutgoingEmail) -> mailsync::providers::Result<Draft> {
        Err(ProviderError::Unsupported("scripted".to_string()))
    }
    async fn get_draft(&self, id: &str) -> mailsync::providers::Result<Draft> {
        Err(ProviderError::NotFound(id.to_string()))
    }
    async fn send_draft(&self, id: &str) -> mailsync::providers::Result<String> {
        Err(ProviderError::NotFound(id.to_string()))
    }
    async fn get_email_count(&self) -> mailsync::providers::Result<u64> {
        Ok(0)
    }
    async fn test_connection(&self) -> bool {
        true
    }
    fn normalize_ids(&self, ids: &[String]) -> Vec<String> {
        ids.to_vec()
    }
    async fn sync_calendar(
        &self,
        _: &SyncParams,
    ) -> mailsync::providers::Result<SyncBatch<CalendarEvent>> {
        Ok(SyncBatch::default())
    }
    async fn sync_contacts(&self, _: &SyncParams) -> mailsync::providers::Result<SyncBatch<Contact>> {
        if let Some(gate) = &self.0.gate {
            gate.notified().await;
        }
        Ok(SyncBatch::default())
    }
}

struct ScriptedFactory(Arc<Script>);

impl AdapterFactory for ScriptedFactory {
    fn create(
        &self,
        config: &ProviderConfig,
        _: Credential,
    ) -> mailsync::providers::Result<Arc<dyn MailboxAdapter>> {
        Ok(Arc::new(ScriptedAdapter(self.0.mailbox(&config.email))))
    }
}

/// Token endpoint that either issues a new token or rejects the refresh
/// token with `invalid_grant`.
#[derive(Default)]
struct ScriptedEndpoint {
    reject: AtomicBool,
    calls: AtomicUsize,
}

#[async_trait]
impl TokenEndpoint for ScriptedEndpoint {
    async fn refresh(&self, _: ProviderType, _: &Secret) -> Result<TokenGrant, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.reject.load(Ordering::SeqCst) {
            return Err(ProviderError::Http {
                status: 400,
                code: Some("invalid_grant".to_string()),
                message: "Token has been expired or revoked.".to_string(),
                retry_after: None,
            });
        }
        Ok(TokenGrant::new("fresh").expiring_in(Duration::from_secs(3600)))
    }
}

struct Harness {
    engine: SyncService,
    repo: Arc<SqliteRepository>,
    script: Arc<Script>,
    endpoint: Arc<ScriptedEndpoint>,
    clock: ManualClock,
    events: broadcast::Receiver<SyncEvent>,
}

async fn harness(queue: QueueConfig) -> Harness {
    let repo = Arc::new(SqliteRepository::new(Database::open_in_memory().await.unwrap()));
    let script = Arc::new(Script::default());
    let endpoint = Arc::new(ScriptedEndpoint::default());
    let clock = ManualClock::new(start_time());

    let engine = SyncService::new(
        repo.clone(),
        Arc::new(CredentialVault::new([5u8; 32])),
        endpoint.clone(),
        Arc::new(ScriptedFactory(script.clone())),
        Arc::new(clock.clone()),
        EngineConfig {
            queue,
            executor: ExecutorConfig {
                retry_backoff: Duration::from_millis(1),
                ..ExecutorConfig::default()
            },
            ..EngineConfig::default()
        },
    );
    let events = engine.subscribe();

    Harness {
        engine,
        repo,
        script,
        endpoint,
        clock,
        events,
    }
}

impl Harness {
    async fn connect(&self, address: &str, grant: TokenGrant) -> ProviderConfig {
        self.engine
            .connect_oauth_provider(
                OAuthConnection {
                    tenant_id: TenantId::from("tenant-1"),
                    provider_type: ProviderType::Google,
                    email: address.to_string(),
                    display_name: None,
                    capabilities: None,
                },
                grant,
            )
            .await
            .unwrap()
    }

    async fn update(&self, id: &ProviderId, change: impl FnOnce(&mut ProviderConfig)) {
        let mut config = self.repo.get_provider(id).await.unwrap().unwrap();
        change(&mut config);
        assert!(self.repo.update_provider_config(&config).await.unwrap());
    }

    async fn stored(&self, id: &ProviderId) -> ProviderConfig {
        self.repo.get_provider(id).await.unwrap().unwrap()
    }

    async fn next_event(&mut self, matches: impl Fn(&SyncEvent) -> bool) -> SyncEvent {
        let events = &mut self.events;
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let event = events.recv().await.unwrap();
                if matches(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for engine event")
    }

    /// Waits until the worker has released the provider's claim.
    async fn settle(&self, id: &ProviderId) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while self.engine.get_provider_health(id).await.unwrap().status == HealthStatus::Syncing {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("provider never left the syncing state");
    }
}

fn live_grant() -> TokenGrant {
    TokenGrant::new("live")
        .with_refresh_token("refresh-1")
        .expiring_in(Duration::from_secs(3600))
}

fn messages(n: usize) -> Vec<Email> {
    (0..n)
        .map(|i| Email::new(format!("msg-{i}"), format!("thread-{i}"), "sender@example.com"))
        .collect()
}

fn completed_for(id: &ProviderId) -> impl Fn(&SyncEvent) -> bool + '_ {
    move |event| matches!(event, SyncEvent::Completed { provider_id, .. } if provider_id == id)
}

#[tokio::test]
async fn scheduled_sync_persists_messages_and_advances_cursor() {
    let mut h = harness(QueueConfig::default()).await;
    let config = h.connect("user@gmail.com", live_grant()).await;
    h.update(&config.id, |c| {
        c.capabilities = Capabilities::email_only();
        c.cursors.email = Some("abc123".to_string());
    })
    .await;
    h.script
        .mailbox("user@gmail.com")
        .email
        .lock()
        .unwrap()
        .push_back(Ok(SyncBatch::new(messages(12), vec![], Some("abc456".to_string()))));

    h.engine.start().await.unwrap();
    let event = h.next_event(completed_for(&config.id)).await;
    let SyncEvent::Completed { result, .. } = event else {
        unreachable!()
    };
    assert_eq!(result.total_new(), 12);

    let params = h.script.mailbox("user@gmail.com").params.lock().unwrap().clone();
    assert_eq!(params, vec![SyncParams::incremental(Some("abc123".to_string()))]);

    let stored = h.stored(&config.id).await;
    assert_eq!(stored.cursors.email.as_deref(), Some("abc456"));
    assert_eq!(stored.schedule.error_streak, 0);
    assert_eq!(stored.schedule.last_synced_at, Some(start_time()));
    assert_eq!(
        stored.schedule.next_sync_at,
        Some(start_time() + chrono::Duration::seconds(60))
    );
    assert_eq!(h.repo.list_emails(&config.id).await.unwrap().len(), 12);
    assert_eq!(h.repo.list_folders(&config.id).await.unwrap().len(), 2);
    assert_eq!(h.endpoint.calls.load(Ordering::SeqCst), 0);

    h.engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn rate_limit_honors_retry_after() {
    let mut h = harness(QueueConfig::default()).await;
    let config = h.connect("busy@gmail.com", live_grant()).await;
    h.update(&config.id, |c| c.capabilities = Capabilities::email_only()).await;
    h.script
        .mailbox("busy@gmail.com")
        .email
        .lock()
        .unwrap()
        .push_back(Err(ProviderError::Http {
            status: 429,
            code: Some("rateLimitExceeded".to_string()),
            message: "quota".to_string(),
            retry_after: Some("120".to_string()),
        }));

    h.engine.start().await.unwrap();
    let event = h
        .next_event(|e| matches!(e, SyncEvent::Failed { .. }))
        .await;
    let SyncEvent::Failed { kind, .. } = event else {
        unreachable!()
    };
    assert_eq!(kind, ErrorKind::RateLimited);

    h.settle(&config.id).await;
    let health = h.engine.get_provider_health(&config.id).await.unwrap();
    assert_eq!(
        health.next_sync_at,
        Some(start_time() + chrono::Duration::seconds(120))
    );
    assert!(h.stored(&config.id).await.is_active);
    // One attempt only; rate limits are not retried inside the job.
    assert_eq!(h.script.mailbox("busy@gmail.com").params.lock().unwrap().len(), 1);

    // Not due again until the hint elapses.
    h.clock.advance(chrono::Duration::seconds(60));
    assert_eq!(h.engine.tick().await.unwrap().enqueued, 0);

    h.engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn busy_low_lane_does_not_delay_manual_sync() {
    let queue = QueueConfig {
        low: LaneConfig {
            workers: 1,
            capacity: 10,
        },
        ..QueueConfig::default()
    };
    let mut h = harness(queue).await;

    let gate = h.script.gate("contacts@gmail.com");
    let slow = h.connect("contacts@gmail.com", live_grant()).await;
    h.update(&slow.id, |c| {
        c.capabilities = Capabilities {
            email: false,
            calendar: false,
            contacts: true,
        };
    })
    .await;

    let fast = h.connect("inbox@gmail.com", live_grant()).await;
    h.update(&fast.id, |c| {
        c.capabilities = Capabilities::email_only();
        c.schedule.next_sync_at = Some(start_time() + chrono::Duration::hours(1));
    })
    .await;

    h.engine.start().await.unwrap();
    h.next_event(|e| matches!(e, SyncEvent::Started { provider_id, .. } if *provider_id == slow.id))
        .await;

    h.engine.trigger_sync(&fast.id).await.unwrap();
    h.next_event(completed_for(&fast.id)).await;
    assert_eq!(
        h.engine.get_provider_health(&slow.id).await.unwrap().status,
        HealthStatus::Syncing
    );

    gate.notify_one();
    h.next_event(completed_for(&slow.id)).await;

    h.engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn revoked_refresh_token_stops_scheduling_until_reconnect() {
    let mut h = harness(QueueConfig::default()).await;
    h.endpoint.reject.store(true, Ordering::SeqCst);

    let expired = TokenGrant::new("stale")
        .with_refresh_token("refresh-1")
        .expiring_in(Duration::ZERO);
    let config = h.connect("gone@gmail.com", expired).await;

    h.engine.start().await.unwrap();
    let event = h
        .next_event(|e| matches!(e, SyncEvent::Revoked { .. }))
        .await;
    let SyncEvent::Revoked { provider_id, .. } = event else {
        unreachable!()
    };
    assert_eq!(provider_id, config.id);

    h.settle(&config.id).await;
    let stored = h.stored(&config.id).await;
    assert!(!stored.is_active);
    assert!(stored.credentials.is_none());
    assert_eq!(stored.schedule.next_sync_at, None);
    assert!(h.script.mailbox("gone@gmail.com").params.lock().unwrap().is_empty());

    let health = h.engine.get_provider_health(&config.id).await.unwrap();
    assert_eq!(health.status, HealthStatus::NeedsReconnection);
    assert!(health.last_error.is_some());

    // Never picked up again, however much time passes.
    h.clock.advance(chrono::Duration::days(7));
    assert_eq!(h.engine.tick().await.unwrap().enqueued, 0);
    assert!(matches!(
        h.engine.trigger_sync(&config.id).await,
        Err(EngineError::NeedsReconnection(_))
    ));

    // Reconnecting restores the same provider.
    h.endpoint.reject.store(false, Ordering::SeqCst);
    let reconnected = h.connect("gone@gmail.com", live_grant()).await;
    assert_eq!(reconnected.id, config.id);
    match h.engine.trigger_sync(&config.id).await {
        // The scheduler may have claimed the now-due provider first.
        Ok(_) | Err(EngineError::AlreadySyncing(_)) => {}
        Err(e) => panic!("unexpected trigger error: {e}"),
    }
    h.next_event(completed_for(&config.id)).await;

    h.engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn expired_token_is_refreshed_once_before_sync() {
    let mut h = harness(QueueConfig::default()).await;
    let expired = TokenGrant::new("stale")
        .with_refresh_token("refresh-1")
        .expiring_in(Duration::ZERO);
    let config = h.connect("renew@gmail.com", expired).await;
    h.update(&config.id, |c| c.capabilities = Capabilities::email_only()).await;

    h.engine.start().await.unwrap();
    h.next_event(completed_for(&config.id)).await;
    assert_eq!(h.endpoint.calls.load(Ordering::SeqCst), 1);

    h.settle(&config.id).await;
    let stored = h.stored(&config.id).await;
    assert!(stored.is_active);
    assert_eq!(h.engine.get_provider_health(&config.id).await.unwrap().status, HealthStatus::Healthy);

    h.engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn removing_provider_deletes_synced_records() {
    let mut h = harness(QueueConfig::default()).await;
    let config = h.connect("old@gmail.com", live_grant()).await;
    h.update(&config.id, |c| c.capabilities = Capabilities::email_only()).await;
    h.script
        .mailbox("old@gmail.com")
        .email
        .lock()
        .unwrap()
        .push_back(Ok(SyncBatch::new(messages(3), vec![], Some("c1".to_string()))));

    h.engine.start().await.unwrap();
    h.next_event(completed_for(&config.id)).await;
    h.settle(&config.id).await;
    assert_eq!(h.repo.list_emails(&config.id).await.unwrap().len(), 3);

    h.engine.remove_provider(&config.id).await.unwrap();
    assert!(h.repo.get_provider(&config.id).await.unwrap().is_none());
    assert!(h.repo.list_emails(&config.id).await.unwrap().is_empty());
    assert!(matches!(
        h.engine.get_provider_health(&config.id).await,
        Err(EngineError::NotFound(_))
    ));

    h.engine.shutdown().await.unwrap();
}
