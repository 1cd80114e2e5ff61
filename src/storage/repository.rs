//! Persistence repository consumed by the sync engine.
//!
//! The engine only sees [`SyncRepository`]; [`SqliteRepository`] is the
//! default implementation over [`Database`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::Connection;

use super::database::{Database, Result};
use super::queries::{contacts, emails, events, folders, providers};
use crate::domain::{
    CalendarEvent, Contact, Email, Folder, ProviderConfig, ProviderId, ProviderType, TenantId,
};

/// What one scope's write changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppliedChanges {
    pub created: usize,
    pub deleted: usize,
}

/// Storage operations the engine depends on.
///
/// Record writes are keyed by provider-scoped external ID. Each `apply_*`
/// call upserts and deletes in one transaction and fails with
/// [`DatabaseError::ProviderRemoved`](super::DatabaseError::ProviderRemoved)
/// once the provider is gone.
#[async_trait]
pub trait SyncRepository: Send + Sync {
    /// Active providers whose `next_sync_at` is at or before `now`.
    async fn load_due_providers(&self, now: DateTime<Utc>) -> Result<Vec<ProviderConfig>>;

    async fn get_provider(&self, id: &ProviderId) -> Result<Option<ProviderConfig>>;

    async fn find_provider(
        &self,
        tenant_id: &TenantId,
        provider_type: ProviderType,
        email: &str,
    ) -> Result<Option<ProviderConfig>>;

    async fn list_providers(&self, tenant_id: &TenantId) -> Result<Vec<ProviderConfig>>;

    /// Stores a newly connected provider.
    async fn insert_provider_config(&self, config: &ProviderConfig) -> Result<()>;

    /// Writes state or credentials of an existing provider. Returns `false`
    /// and writes nothing when the provider was removed.
    async fn update_provider_config(&self, config: &ProviderConfig) -> Result<bool>;

    /// Hard-deletes a provider and its records. Returns `false` if it did not exist.
    async fn delete_provider(&self, id: &ProviderId) -> Result<bool>;

    async fn apply_emails(
        &self,
        tenant_id: &TenantId,
        provider_id: &ProviderId,
        items: &[Email],
        deleted: &[String],
    ) -> Result<AppliedChanges>;

    async fn apply_events(
        &self,
        tenant_id: &TenantId,
        provider_id: &ProviderId,
        items: &[CalendarEvent],
        deleted: &[String],
    ) -> Result<AppliedChanges>;

    async fn apply_contacts(
        &self,
        tenant_id: &TenantId,
        provider_id: &ProviderId,
        items: &[Contact],
        deleted: &[String],
    ) -> Result<AppliedChanges>;

    async fn upsert_folders(&self, provider_id: &ProviderId, items: &[Folder]) -> Result<()>;
}

type UpsertFn<T> = fn(&Connection, &TenantId, &ProviderId, &T) -> rusqlite::Result<bool>;
type DeleteFn = fn(&Connection, &ProviderId, &[String]) -> rusqlite::Result<usize>;

/// SQLite-backed repository.
#[derive(Debug, Clone)]
pub struct SqliteRepository {
    db: Database,
}

impl SqliteRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    async fn apply<T>(
        &self,
        tenant_id: &TenantId,
        provider_id: &ProviderId,
        items: &[T],
        deleted: &[String],
        upsert: UpsertFn<T>,
        delete: DeleteFn,
    ) -> Result<AppliedChanges>
    where
        T: Clone + Send + Sync + 'static,
    {
        let (tenant_id, provider_id) = (tenant_id.clone(), provider_id.clone());
        let (items, deleted) = (items.to_vec(), deleted.to_vec());
        self.db
            .transaction(move |tx| {
                providers::ensure_exists(tx, &provider_id)?;
                let mut changes = AppliedChanges::default();
                for item in &items {
                    if upsert(tx, &tenant_id, &provider_id, item)? {
                        changes.created += 1;
                    }
                }
                changes.deleted = delete(tx, &provider_id, &deleted)?;
                Ok(changes)
            })
            .await
    }

    /// Reads back a provider's stored emails.
    pub async fn list_emails(&self, provider_id: &ProviderId) -> Result<Vec<Email>> {
        let provider_id = provider_id.clone();
        self.db
            .with_conn(move |conn| Ok(emails::list_by_provider(conn, &provider_id)?))
            .await
    }

    pub async fn list_events(&self, provider_id: &ProviderId) -> Result<Vec<CalendarEvent>> {
        let provider_id = provider_id.clone();
        self.db
            .with_conn(move |conn| Ok(events::list_by_provider(conn, &provider_id)?))
            .await
    }

    pub async fn list_contacts(&self, provider_id: &ProviderId) -> Result<Vec<Contact>> {
        let provider_id = provider_id.clone();
        self.db
            .with_conn(move |conn| Ok(contacts::list_by_provider(conn, &provider_id)?))
            .await
    }

    pub async fn list_folders(&self, provider_id: &ProviderId) -> Result<Vec<Folder>> {
        let provider_id = provider_id.clone();
        self.db
            .with_conn(move |conn| Ok(folders::list_by_provider(conn, &provider_id)?))
            .await
    }
}

#[async_trait]
impl SyncRepository for SqliteRepository {
    async fn load_due_providers(&self, now: DateTime<Utc>) -> Result<Vec<ProviderConfig>> {
        providers::load_due(&self.db, now).await
    }

    async fn get_provider(&self, id: &ProviderId) -> Result<Option<ProviderConfig>> {
        providers::get_by_id(&self.db, id).await
    }

    async fn find_provider(
        &self,
        tenant_id: &TenantId,
        provider_type: ProviderType,
        email: &str,
    ) -> Result<Option<ProviderConfig>> {
        providers::find_by_identity(&self.db, tenant_id, provider_type, email).await
    }

    async fn list_providers(&self, tenant_id: &TenantId) -> Result<Vec<ProviderConfig>> {
        providers::list_by_tenant(&self.db, tenant_id).await
    }

    async fn insert_provider_config(&self, config: &ProviderConfig) -> Result<()> {
        providers::insert(&self.db, config).await
    }

    async fn update_provider_config(&self, config: &ProviderConfig) -> Result<bool> {
        providers::update(&self.db, config).await
    }

    async fn delete_provider(&self, id: &ProviderId) -> Result<bool> {
        providers::delete(&self.db, id).await
    }

    async fn apply_emails(
        &self,
        tenant_id: &TenantId,
        provider_id: &ProviderId,
        items: &[Email],
        deleted: &[String],
    ) -> Result<AppliedChanges> {
        self.apply(
            tenant_id,
            provider_id,
            items,
            deleted,
            emails::upsert,
            emails::delete_by_external_ids,
        )
        .await
    }

    async fn apply_events(
        &self,
        tenant_id: &TenantId,
        provider_id: &ProviderId,
        items: &[CalendarEvent],
        deleted: &[String],
    ) -> Result<AppliedChanges> {
        self.apply(
            tenant_id,
            provider_id,
            items,
            deleted,
            events::upsert,
            events::delete_by_external_ids,
        )
        .await
    }

    async fn apply_contacts(
        &self,
        tenant_id: &TenantId,
        provider_id: &ProviderId,
        items: &[Contact],
        deleted: &[String],
    ) -> Result<AppliedChanges> {
        self.apply(
            tenant_id,
            provider_id,
            items,
            deleted,
            contacts::upsert,
            contacts::delete_by_external_ids,
        )
        .await
    }

    async fn upsert_folders(&self, provider_id: &ProviderId, items: &[Folder]) -> Result<()> {
        let (provider_id, items) = (provider_id.clone(), items.to_vec());
        self.db
            .transaction(move |tx| {
                providers::ensure_exists(tx, &provider_id)?;
                for folder in &items {
                    folders::upsert(tx, &provider_id, folder)?;
                }
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Address, StoredCredentials};
    use crate::storage::DatabaseError;

    fn email(id: &str) -> Email {
        Email {
            external_id: id.to_string(),
            thread_id: format!("thread-{id}"),
            message_id: None,
            from: Address::new("a@example.com"),
            to: vec![],
            cc: vec![],
            subject: None,
            body_text: None,
            body_html: None,
            snippet: String::new(),
            date: Utc::now(),
            is_read: false,
            is_starred: false,
            is_draft: false,
            labels: vec![],
        }
    }

    async fn repo_with_provider() -> (SqliteRepository, ProviderConfig) {
        let repo = SqliteRepository::new(Database::open_in_memory().await.unwrap());
        let config = ProviderConfig::new(
            TenantId::from("t1"),
            ProviderType::Google,
            "a@gmail.com",
            StoredCredentials::OAuth {
                access_token: crate::domain::EncryptedSecret {
                    ciphertext: "ct".to_string(),
                    iv: "iv".to_string(),
                },
                refresh_token: None,
                expires_at: None,
            },
        );
        repo.insert_provider_config(&config).await.unwrap();
        (repo, config)
    }

    #[tokio::test]
    async fn apply_batch_counts_new_items_only() {
        let (repo, config) = repo_with_provider().await;
        let batch: Vec<Email> = (0..12).map(|i| email(&format!("m{i}"))).collect();

        let first = repo
            .apply_emails(&config.tenant_id, &config.id, &batch, &[])
            .await
            .unwrap();
        assert_eq!(first, AppliedChanges { created: 12, deleted: 0 });
        let again = repo
            .apply_emails(&config.tenant_id, &config.id, &batch, &["m0".to_string()])
            .await
            .unwrap();
        assert_eq!(again, AppliedChanges { created: 0, deleted: 1 });
        assert_eq!(repo.list_emails(&config.id).await.unwrap().len(), 11);
    }

    #[tokio::test]
    async fn delete_and_list_records() {
        let (repo, config) = repo_with_provider().await;
        let (tenant, provider) = (&config.tenant_id, &config.id);

        repo.apply_contacts(tenant, provider, &[Contact::new("c1"), Contact::new("c2")], &[])
            .await
            .unwrap();
        repo.apply_events(tenant, provider, &[CalendarEvent::new("e1")], &[])
            .await
            .unwrap();
        repo.upsert_folders(
            provider,
            &[Folder {
                external_id: "INBOX".to_string(),
                name: "Inbox".to_string(),
                is_system: true,
            }],
        )
        .await
        .unwrap();

        let contacts = repo
            .apply_contacts(tenant, provider, &[], &["c1".to_string()])
            .await
            .unwrap();
        assert_eq!(contacts.deleted, 1);
        let events = repo
            .apply_events(tenant, provider, &[], &["e1".to_string()])
            .await
            .unwrap();
        assert_eq!(events.deleted, 1);
        assert_eq!(repo.list_contacts(provider).await.unwrap().len(), 1);
        assert!(repo.list_events(provider).await.unwrap().is_empty());
        assert_eq!(repo.list_folders(provider).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn writes_after_removal_are_refused() {
        let (repo, mut config) = repo_with_provider().await;
        repo.apply_emails(&config.tenant_id, &config.id, &[email("m1")], &[])
            .await
            .unwrap();
        assert!(repo.delete_provider(&config.id).await.unwrap());

        let late = repo
            .apply_emails(&config.tenant_id, &config.id, &[email("m2")], &[])
            .await;
        assert!(matches!(late, Err(DatabaseError::ProviderRemoved(_))));
        let folders = repo.upsert_folders(&config.id, &[]).await;
        assert!(matches!(folders, Err(DatabaseError::ProviderRemoved(_))));
        assert!(repo.list_emails(&config.id).await.unwrap().is_empty());

        config.schedule.next_sync_at = Some(Utc::now());
        assert!(!repo.update_provider_config(&config).await.unwrap());
        assert!(repo.get_provider(&config.id).await.unwrap().is_none());
    }
}
