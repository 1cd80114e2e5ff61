//! Provider registry: connecting and removing mailboxes.
//!
//! Connecting stores encrypted credentials and makes the provider due
//! immediately. Each tenant keeps exactly one default provider per
//! capability; connect fills empty default slots and remove promotes a
//! replacement.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use super::clock::Clock;
use super::job_queue::InFlightRegistry;
use super::token_service::TokenGrant;
use crate::domain::{
    Capabilities, Capability, ProviderConfig, ProviderId, ProviderType, SchedulingState,
    ServerSettings, StoredCredentials, TenantId,
};
use crate::providers::{AdapterFactory, Credential, ProviderError};
use crate::storage::{CredentialVault, DatabaseError, Login, SyncRepository, VaultError};

/// Errors that can occur while connecting or removing providers.
#[derive(Debug, Error)]
pub enum ProviderServiceError {
    #[error("invalid connection request: {0}")]
    InvalidRequest(String),

    /// The server rejected the credentials or could not be reached.
    #[error("connection test failed for {0}")]
    ConnectionFailed(String),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("storage error: {0}")]
    Storage(#[from] DatabaseError),
}

pub type Result<T> = std::result::Result<T, ProviderServiceError>;

/// OAuth mailbox handed over by the external authorization flow.
#[derive(Debug, Clone)]
pub struct OAuthConnection {
    pub tenant_id: TenantId,
    pub provider_type: ProviderType,
    pub email: String,
    pub display_name: Option<String>,
    /// Defaults to everything the provider type supports.
    pub capabilities: Option<Capabilities>,
}

/// IMAP/SMTP mailbox with optional DAV collections.
#[derive(Debug, Clone)]
pub struct GenericConnection {
    pub tenant_id: TenantId,
    pub email: String,
    pub display_name: Option<String>,
    pub server: ServerSettings,
    pub imap: Login,
    /// Falls back to the IMAP login.
    pub smtp: Option<Login>,
    /// Falls back to the IMAP login.
    pub dav: Option<Login>,
}

pub struct ProviderService {
    repo: Arc<dyn SyncRepository>,
    vault: Arc<CredentialVault>,
    adapters: Arc<dyn AdapterFactory>,
    in_flight: InFlightRegistry,
    clock: Arc<dyn Clock>,
}

impl ProviderService {
    pub fn new(
        repo: Arc<dyn SyncRepository>,
        vault: Arc<CredentialVault>,
        adapters: Arc<dyn AdapterFactory>,
        in_flight: InFlightRegistry,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repo,
            vault,
            adapters,
            in_flight,
            clock,
        }
    }

    /// Stores a freshly issued token pair. Reconnecting the same tenant,
    /// provider type and address replaces the credentials of the existing
    /// config and reactivates it.
    pub async fn connect_oauth_provider(
        &self,
        request: OAuthConnection,
        grant: TokenGrant,
    ) -> Result<ProviderConfig> {
        if !request.provider_type.uses_oauth() {
            return Err(ProviderServiceError::InvalidRequest(format!(
                "{} providers do not use OAuth",
                request.provider_type
            )));
        }
        if request.email.trim().is_empty() {
            return Err(ProviderServiceError::InvalidRequest("email is required".to_string()));
        }

        let now = self.clock.now();
        let credentials = StoredCredentials::OAuth {
            access_token: self.vault.encrypt(grant.access_token.expose())?,
            refresh_token: grant
                .refresh_token
                .as_ref()
                .map(|t| self.vault.encrypt(t.expose()))
                .transpose()?,
            expires_at: grant.expires_at(now),
        };

        let existing = self
            .repo
            .find_provider(&request.tenant_id, request.provider_type, &request.email)
            .await?;
        let reconnect = existing.is_some();
        let mut config = match existing {
            Some(mut config) => {
                info!(provider_id = %config.id, tenant_id = %config.tenant_id, "reconnecting provider");
                config.credentials = Some(credentials);
                config.is_active = true;
                config.schedule = SchedulingState::due_at(now);
                config
            }
            None => {
                let mut config = ProviderConfig::new(
                    request.tenant_id.clone(),
                    request.provider_type,
                    request.email.clone(),
                    credentials,
                );
                config.created_at = now;
                config.schedule = SchedulingState::due_at(now);
                config
            }
        };
        if let Some(capabilities) = request.capabilities {
            config.capabilities = capabilities;
        }
        if request.display_name.is_some() {
            config.display_name = request.display_name;
        }
        config.updated_at = now;

        self.claim_default_slots(&mut config).await?;
        self.store(&config, reconnect).await?;
        info!(
            provider_id = %config.id,
            tenant_id = %config.tenant_id,
            provider_type = %config.provider_type,
            "provider connected"
        );
        Ok(config)
    }

    /// Validates the logins against the server before storing anything.
    pub async fn connect_generic_provider(&self, request: GenericConnection) -> Result<ProviderConfig> {
        if request.server.imap_host.trim().is_empty() || request.server.smtp_host.trim().is_empty() {
            return Err(ProviderServiceError::InvalidRequest(
                "IMAP and SMTP hosts are required".to_string(),
            ));
        }

        let now = self.clock.now();
        let encrypt = |login: &Option<Login>| {
            login
                .as_ref()
                .map(|l| self.vault.encrypt_login(l))
                .transpose()
        };
        let credentials = StoredCredentials::Password {
            imap: self.vault.encrypt_login(&request.imap)?,
            smtp: encrypt(&request.smtp)?,
            dav: encrypt(&request.dav)?,
        };

        let existing = self
            .repo
            .find_provider(&request.tenant_id, ProviderType::Generic, &request.email)
            .await?;
        let reconnect = existing.is_some();
        let mut config = match existing {
            Some(mut config) => {
                config.credentials = Some(credentials);
                config.is_active = true;
                config
            }
            None => {
                let mut config = ProviderConfig::new(
                    request.tenant_id.clone(),
                    ProviderType::Generic,
                    request.email.clone(),
                    credentials,
                );
                config.created_at = now;
                config
            }
        };
        config.capabilities = request.server.capabilities();
        config.server = Some(request.server.clone());
        config.schedule = SchedulingState::due_at(now);
        config.updated_at = now;
        if request.display_name.is_some() {
            config.display_name = request.display_name.clone();
        }

        let adapter = self.adapters.create(
            &config,
            Credential::Logins {
                imap: request.imap,
                smtp: request.smtp,
                dav: request.dav,
            },
        )?;
        if !adapter.test_connection().await {
            warn!(tenant_id = %config.tenant_id, host = %request.server.imap_host, "connection test failed");
            return Err(ProviderServiceError::ConnectionFailed(request.server.imap_host));
        }

        self.claim_default_slots(&mut config).await?;
        self.store(&config, reconnect).await?;
        info!(provider_id = %config.id, tenant_id = %config.tenant_id, "generic provider connected");
        Ok(config)
    }

    /// Cancels any in-flight job, deletes the config with its records, and
    /// promotes another provider for each default it held.
    ///
    /// Returns `false` when the provider did not exist.
    pub async fn remove_provider(&self, provider_id: &ProviderId) -> Result<bool> {
        let Some(config) = self.repo.get_provider(provider_id).await? else {
            return Ok(false);
        };

        if self.in_flight.cancel(provider_id).await {
            info!(provider_id = %provider_id, "cancelled in-flight job");
        }
        self.repo.delete_provider(provider_id).await?;

        let mut remaining = self.repo.list_providers(&config.tenant_id).await?;
        remaining.sort_by_key(|c| (!c.is_active, c.created_at));
        for capability in config.default_for.iter() {
            let successor = remaining
                .iter_mut()
                .find(|c| c.capabilities.contains(capability));
            if let Some(successor) = successor {
                successor.default_for.set(capability, true);
                successor.updated_at = self.clock.now();
                if self.repo.update_provider_config(successor).await? {
                    info!(provider_id = %successor.id, capability = %capability, "promoted default provider");
                }
            }
        }

        info!(provider_id = %provider_id, tenant_id = %config.tenant_id, "provider removed");
        Ok(true)
    }

    /// Inserts a new config or updates a reconnected one. A reconnected
    /// config removed in the meantime is inserted again as new.
    async fn store(&self, config: &ProviderConfig, reconnect: bool) -> Result<()> {
        if reconnect && self.repo.update_provider_config(config).await? {
            return Ok(());
        }
        self.repo.insert_provider_config(config).await?;
        Ok(())
    }

    /// Makes `config` the default for each capability it supports that has
    /// no default yet among the tenant's other providers.
    async fn claim_default_slots(&self, config: &mut ProviderConfig) -> Result<()> {
        let others: Vec<ProviderConfig> = self
            .repo
            .list_providers(&config.tenant_id)
            .await?
            .into_iter()
            .filter(|c| c.id != config.id)
            .collect();

        for capability in Capability::ALL {
            let taken = others.iter().any(|c| c.default_for.contains(capability));
            let supported = config.capabilities.contains(capability);
            if !supported {
                config.default_for.set(capability, false);
            } else if !taken {
                config.default_for.set(capability, true);
            }
        }
        Ok(())
    }
}
