//! Closed adapter set and the factory that builds one per job.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::google::{GoogleAdapter, GoogleEndpoints};
use super::imap::GenericAdapter;
use super::microsoft::{MicrosoftAdapter, GRAPH_API_BASE};
use super::{
    Credential, ListThreadsParams, MailboxAdapter, OutgoingEmail, ProviderError, Result, SyncBatch,
    SyncParams, ThreadPage, UserInfo,
};
use crate::domain::{CalendarEvent, Contact, Draft, Email, Folder, ProviderConfig, ProviderType};

/// Knobs shared by every adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterOptions {
    /// Deadline for a single provider call.
    pub request_timeout: Duration,
    /// Deadline for `test_connection`.
    pub test_timeout: Duration,
    /// Upper bound on messages fetched by a full sync without `max_items`.
    pub full_sync_limit: u32,
    pub google: GoogleEndpoints,
    pub graph_base: String,
}

impl Default for AdapterOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            test_timeout: Duration::from_secs(10),
            full_sync_limit: 500,
            google: GoogleEndpoints::default(),
            graph_base: GRAPH_API_BASE.to_string(),
        }
    }
}

/// One provider adapter of the closed variant set.
pub enum Adapter {
    Google(GoogleAdapter),
    Microsoft(MicrosoftAdapter),
    Generic(GenericAdapter),
}

macro_rules! delegate {
    ($self:ident, $adapter:ident => $call:expr) => {
        match $self {
            Adapter::Google($adapter) => $call,
            Adapter::Microsoft($adapter) => $call,
            Adapter::Generic($adapter) => $call,
        }
    };
}

#[async_trait]
impl MailboxAdapter for Adapter {
    fn provider_type(&self) -> ProviderType {
        delegate!(self, a => a.provider_type())
    }

    async fn get_user_info(&self) -> Result<UserInfo> {
        delegate!(self, a => a.get_user_info().await)
    }

    async fn list_threads(&self, params: &ListThreadsParams) -> Result<ThreadPage> {
        delegate!(self, a => a.list_threads(params).await)
    }

    async fn get_message(&self, id: &str) -> Result<Email> {
        delegate!(self, a => a.get_message(id).await)
    }

    async fn send_email(&self, email: &OutgoingEmail) -> Result<String> {
        delegate!(self, a => a.send_email(email).await)
    }

    async fn sync_emails(&self, params: &SyncParams) -> Result<SyncBatch<Email>> {
        delegate!(self, a => a.sync_emails(params).await)
    }

    async fn get_labels(&self) -> Result<Vec<Folder>> {
        delegate!(self, a => a.get_labels().await)
    }

    async fn create_label(&self, name: &str) -> Result<Folder> {
        delegate!(self, a => a.create_label(name).await)
    }

    async fn mark_as_read(&self, ids: &[String]) -> Result<()> {
        delegate!(self, a => a.mark_as_read(ids).await)
    }

    async fn mark_as_unread(&self, ids: &[String]) -> Result<()> {
        delegate!(self, a => a.mark_as_unread(ids).await)
    }

    async fn create_draft(&self, email: &OutgoingEmail) -> Result<Draft> {
        delegate!(self, a => a.create_draft(email).await)
    }

    async fn get_draft(&self, id: &str) -> Result<Draft> {
        delegate!(self, a => a.get_draft(id).await)
    }

    async fn send_draft(&self, id: &str) -> Result<String> {
        delegate!(self, a => a.send_draft(id).await)
    }

    async fn get_email_count(&self) -> Result<u64> {
        delegate!(self, a => a.get_email_count().await)
    }

    async fn test_connection(&self) -> bool {
        delegate!(self, a => a.test_connection().await)
    }

    fn normalize_ids(&self, ids: &[String]) -> Vec<String> {
        delegate!(self, a => a.normalize_ids(ids))
    }

    async fn sync_calendar(&self, params: &SyncParams) -> Result<SyncBatch<CalendarEvent>> {
        delegate!(self, a => a.sync_calendar(params).await)
    }

    async fn sync_contacts(&self, params: &SyncParams) -> Result<SyncBatch<Contact>> {
        delegate!(self, a => a.sync_contacts(params).await)
    }
}

/// Maps a provider type and its decrypted credential to an adapter.
///
/// # Errors
///
/// Returns [`ProviderError::InvalidRequest`] when the credential kind does not
/// match the provider type or a generic provider has no server settings.
pub fn build_adapter(
    config: &ProviderConfig,
    credential: Credential,
    client: reqwest::Client,
    options: &AdapterOptions,
) -> Result<Adapter> {
    match (config.provider_type, credential) {
        (ProviderType::Google, Credential::Bearer(token)) => {
            Ok(Adapter::Google(GoogleAdapter::new(client, token, options)))
        }
        (ProviderType::Microsoft, Credential::Bearer(token)) => {
            Ok(Adapter::Microsoft(MicrosoftAdapter::new(client, token, options)))
        }
        (ProviderType::Generic, Credential::Logins { imap, smtp, dav }) => {
            let server = config.server.clone().ok_or_else(|| {
                ProviderError::InvalidRequest("generic provider has no server settings".to_string())
            })?;
            Ok(Adapter::Generic(GenericAdapter::new(
                client, server, imap, smtp, dav, options,
            )))
        }
        (provider_type, _) => Err(ProviderError::InvalidRequest(format!(
            "credential kind does not match {} provider",
            provider_type
        ))),
    }
}

/// Builds adapters for the executor.
pub trait AdapterFactory: Send + Sync {
    fn create(
        &self,
        config: &ProviderConfig,
        credential: Credential,
    ) -> Result<Arc<dyn MailboxAdapter>>;
}

/// Factory backed by [`build_adapter`] and one shared HTTP client.
#[derive(Debug, Clone)]
pub struct DefaultAdapterFactory {
    client: reqwest::Client,
    options: AdapterOptions,
}

impl DefaultAdapterFactory {
    pub fn new(options: AdapterOptions) -> Self {
        Self {
            client: reqwest::Client::new(),
            options,
        }
    }
}

impl AdapterFactory for DefaultAdapterFactory {
    fn create(
        &self,
        config: &ProviderConfig,
        credential: Credential,
    ) -> Result<Arc<dyn MailboxAdapter>> {
        let adapter = build_adapter(config, credential, self.client.clone(), &self.options)?;
        Ok(Arc::new(adapter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        EncryptedSecret, Security, ServerSettings, StoredCredentials, TenantId,
    };
    use crate::storage::{Login, Secret};

    fn config(provider_type: ProviderType) -> ProviderConfig {
        ProviderConfig::new(
            TenantId::from("t1"),
            provider_type,
            "user@example.com",
            StoredCredentials::OAuth {
                access_token: EncryptedSecret {
                    ciphertext: String::new(),
                    iv: String::new(),
                },
                refresh_token: None,
                expires_at: None,
            },
        )
    }

    fn logins() -> Credential {
        Credential::Logins {
            imap: Login::new("user@example.com", "pw"),
            smtp: None,
            dav: None,
        }
    }

    #[test]
    fn builds_variant_for_provider_type() {
        let client = reqwest::Client::new();
        let options = AdapterOptions::default();

        let google = build_adapter(
            &config(ProviderType::Google),
            Credential::Bearer(Secret::from("t")),
            client.clone(),
            &options,
        )
        .unwrap();
        assert_eq!(google.provider_type(), ProviderType::Google);

        let microsoft = build_adapter(
            &config(ProviderType::Microsoft),
            Credential::Bearer(Secret::from("t")),
            client.clone(),
            &options,
        )
        .unwrap();
        assert_eq!(microsoft.provider_type(), ProviderType::Microsoft);

        let mut generic_config = config(ProviderType::Generic);
        generic_config.server = Some(ServerSettings {
            imap_host: "imap.example.com".to_string(),
            imap_port: 993,
            imap_security: Security::Tls,
            smtp_host: "smtp.example.com".to_string(),
            smtp_port: 587,
            smtp_security: Security::StartTls,
            caldav_url: None,
            carddav_url: None,
        });
        let generic = build_adapter(&generic_config, logins(), client, &options).unwrap();
        assert_eq!(generic.provider_type(), ProviderType::Generic);
        assert_eq!(generic.normalize_ids(&["5".to_string()]), vec!["INBOX:5"]);
    }

    #[test]
    fn rejects_mismatched_credentials() {
        let options = AdapterOptions::default();
        let err = build_adapter(
            &config(ProviderType::Google),
            logins(),
            reqwest::Client::new(),
            &options,
        )
        .err()
        .unwrap();
        assert!(matches!(err, ProviderError::InvalidRequest(_)));

        let err = build_adapter(
            &config(ProviderType::Generic),
            logins(),
            reqwest::Client::new(),
            &options,
        )
        .err()
        .unwrap();
        assert!(matches!(err, ProviderError::InvalidRequest(_)));
    }

    #[test]
    fn default_options() {
        let options = AdapterOptions::default();
        assert_eq!(options.request_timeout, Duration::from_secs(30));
        assert_eq!(options.graph_base, "https://graph.microsoft.com/v1.0/me");
    }
}
