//! Token lifecycle management.
//!
//! [`TokenManager`] hands the executor a usable credential for one provider:
//!
//! - OAuth providers get the decrypted access token, refreshed through a
//!   [`TokenEndpoint`] when it is expired or was just rejected
//! - generic providers get their decrypted static logins
//!
//! Refreshes are serialized per provider. Callers queue on the provider's
//! lock and re-read the stored token once they hold it, so a burst of
//! callers with an expired token produces exactly one network refresh.
//! An unrecoverable refresh failure soft-disables the provider.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::classifier::{classify_at, ClassifiedError, ErrorKind};
use super::clock::Clock;
use crate::domain::{
    EncryptedLogin, EncryptedSecret, ProviderConfig, ProviderId, ProviderType, StoredCredentials,
};
use crate::providers::{error_from_response, map_send_error, Credential, ProviderError};
use crate::storage::{CredentialVault, DatabaseError, Login, Secret, SyncRepository, VaultError};

pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const MICROSOFT_TOKEN_URL: &str = "https://login.microsoftonline.com/common/oauth2/v2.0/token";

/// Errors raised while producing a credential.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("provider not found: {0}")]
    NotFound(ProviderId),

    /// The credential is permanently unusable; the provider was disabled.
    #[error("credentials revoked: {0}")]
    Revoked(String),

    #[error("token refresh failed: {0}")]
    Refresh(ClassifiedError),

    #[error("vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("storage error: {0}")]
    Storage(#[from] DatabaseError),
}

impl TokenError {
    /// Maps the failure onto the engine's error taxonomy.
    pub fn classify(&self) -> ClassifiedError {
        match self {
            Self::Revoked(reason) => ClassifiedError::revoked(reason.clone()),
            Self::Refresh(classified) => classified.clone(),
            Self::Storage(err) => ClassifiedError::transient(err.to_string()),
            Self::NotFound(_) | Self::Vault(_) => ClassifiedError::permanent(self.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, TokenError>;

/// Token pair issued by an authorization-code exchange or a refresh.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: Secret,
    /// `None` when the endpoint did not rotate the refresh token.
    pub refresh_token: Option<Secret>,
    pub expires_in: Option<Duration>,
}

impl TokenGrant {
    pub fn new(access_token: impl Into<Secret>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            expires_in: None,
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<Secret>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    pub fn expiring_in(mut self, expires_in: Duration) -> Self {
        self.expires_in = Some(expires_in);
        self
    }

    pub fn expires_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.expires_in
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| now + d)
    }
}

/// A provider's OAuth token endpoint.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    /// Exchanges a refresh token for a new grant.
    async fn refresh(
        &self,
        provider_type: ProviderType,
        refresh_token: &Secret,
    ) -> std::result::Result<TokenGrant, ProviderError>;
}

/// OAuth client registration for one provider.
#[derive(Debug, Clone)]
pub struct OAuthClient {
    pub client_id: String,
    pub client_secret: Option<Secret>,
    pub token_url: String,
}

impl OAuthClient {
    pub fn new(client_id: impl Into<String>, token_url: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: None,
            token_url: token_url.into(),
        }
    }

    pub fn with_secret(mut self, secret: impl Into<Secret>) -> Self {
        self.client_secret = Some(secret.into());
        self
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
}

/// `refresh_token` grant over HTTP form posts.
#[derive(Debug, Clone)]
pub struct OAuthTokenClient {
    http: reqwest::Client,
    google: Option<OAuthClient>,
    microsoft: Option<OAuthClient>,
    timeout: Duration,
}

impl OAuthTokenClient {
    pub fn new(http: reqwest::Client, timeout: Duration) -> Self {
        Self {
            http,
            google: None,
            microsoft: None,
            timeout,
        }
    }

    pub fn with_google(mut self, client: OAuthClient) -> Self {
        self.google = Some(client);
        self
    }

    pub fn with_microsoft(mut self, client: OAuthClient) -> Self {
        self.microsoft = Some(client);
        self
    }

    fn client_for(&self, provider_type: ProviderType) -> std::result::Result<&OAuthClient, ProviderError> {
        let client = match provider_type {
            ProviderType::Google => self.google.as_ref(),
            ProviderType::Microsoft => self.microsoft.as_ref(),
            ProviderType::Generic => None,
        };
        client.ok_or_else(|| {
            ProviderError::InvalidRequest(format!("no OAuth client configured for {}", provider_type))
        })
    }
}

#[async_trait]
impl TokenEndpoint for OAuthTokenClient {
    async fn refresh(
        &self,
        provider_type: ProviderType,
        refresh_token: &Secret,
    ) -> std::result::Result<TokenGrant, ProviderError> {
        let client = self.client_for(provider_type)?;

        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.expose()),
            ("client_id", client.client_id.as_str()),
        ];
        if let Some(secret) = &client.client_secret {
            form.push(("client_secret", secret.expose()));
        }

        let response = self
            .http
            .post(&client.token_url)
            .form(&form)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| map_send_error(e, self.timeout))?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Parse(format!("token response: {}", e)))?;

        Ok(TokenGrant {
            access_token: Secret::new(body.access_token),
            refresh_token: body.refresh_token.map(Secret::new),
            expires_in: body.expires_in.map(Duration::from_secs),
        })
    }
}

/// A credential ready to hand to an adapter.
#[derive(Debug, Clone)]
pub struct AccessCredential {
    pub credential: Credential,
    pub expires_at: Option<DateTime<Utc>>,
}

impl AccessCredential {
    /// The bearer token, for OAuth providers.
    pub fn bearer(&self) -> Option<&Secret> {
        match &self.credential {
            Credential::Bearer(token) => Some(token),
            Credential::Logins { .. } => None,
        }
    }
}

/// Produces valid credentials and owns the refresh path.
pub struct TokenManager {
    repo: Arc<dyn SyncRepository>,
    vault: Arc<CredentialVault>,
    endpoint: Arc<dyn TokenEndpoint>,
    clock: Arc<dyn Clock>,
    locks: Mutex<HashMap<ProviderId, Arc<Mutex<()>>>>,
    expiry_skew: chrono::Duration,
    refresh_timeout: Duration,
}

impl TokenManager {
    pub fn new(
        repo: Arc<dyn SyncRepository>,
        vault: Arc<CredentialVault>,
        endpoint: Arc<dyn TokenEndpoint>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repo,
            vault,
            endpoint,
            clock,
            locks: Mutex::new(HashMap::new()),
            expiry_skew: chrono::Duration::seconds(60),
            refresh_timeout: Duration::from_secs(15),
        }
    }

    /// Treat tokens as expired this long before their stated expiry.
    pub fn with_expiry_skew(mut self, skew: Duration) -> Self {
        self.expiry_skew = chrono::Duration::from_std(skew).unwrap_or(self.expiry_skew);
        self
    }

    pub fn with_refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_timeout = timeout;
        self
    }

    pub fn vault(&self) -> &CredentialVault {
        &self.vault
    }

    /// Returns a credential that is valid now, refreshing if the stored
    /// access token has expired.
    ///
    /// # Errors
    ///
    /// [`TokenError::Revoked`] when the provider is disabled or its refresh
    /// token was rejected. The caller must not retry.
    pub async fn get_valid_access_token(&self, provider_id: &ProviderId) -> Result<AccessCredential> {
        let config = self.load(provider_id).await?;
        match usable_credentials(&config)? {
            StoredCredentials::Password { .. } => self.static_logins(&config),
            StoredCredentials::OAuth {
                access_token,
                expires_at,
                ..
            } => {
                if self.is_expired(*expires_at) {
                    debug!(provider_id = %provider_id, "access token expired");
                    self.refresh_serialized(provider_id, None).await
                } else {
                    Ok(AccessCredential {
                        credential: Credential::Bearer(self.vault.decrypt(access_token)?),
                        expires_at: *expires_at,
                    })
                }
            }
        }
    }

    /// Entry point for a caller whose request was rejected with an auth error.
    ///
    /// If another caller already replaced `rejected`, the stored token is
    /// returned without a second refresh.
    pub async fn refresh_after_rejection(
        &self,
        provider_id: &ProviderId,
        rejected: &Secret,
    ) -> Result<AccessCredential> {
        self.refresh_serialized(provider_id, Some(rejected)).await
    }

    /// Disables the provider and nulls its credentials.
    pub async fn revoke(&self, provider_id: &ProviderId, reason: &str) -> Result<()> {
        let mut config = self.load(provider_id).await?;
        self.revoke_config(&mut config, reason).await
    }

    /// Drops the refresh lock of a removed provider.
    pub async fn forget(&self, provider_id: &ProviderId) {
        self.locks.lock().await.remove(provider_id);
    }

    async fn lock_for(&self, provider_id: &ProviderId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(provider_id.clone()).or_default().clone()
    }

    #[instrument(skip(self, rejected), fields(provider_id = %provider_id))]
    async fn refresh_serialized(
        &self,
        provider_id: &ProviderId,
        rejected: Option<&Secret>,
    ) -> Result<AccessCredential> {
        let lock = self.lock_for(provider_id).await;
        let _guard = lock.lock().await;

        // Another caller may have refreshed while we waited.
        let mut config = self.load(provider_id).await?;
        let (access_token, refresh_token, expires_at) = match usable_credentials(&config)? {
            StoredCredentials::Password { .. } => return self.static_logins(&config),
            StoredCredentials::OAuth {
                access_token,
                refresh_token,
                expires_at,
            } => (access_token.clone(), refresh_token.clone(), *expires_at),
        };

        let current = self.vault.decrypt(&access_token)?;
        let replaced = rejected.map_or(true, |r| *r != current);
        if replaced && !self.is_expired(expires_at) {
            debug!("token already refreshed by another caller");
            return Ok(AccessCredential {
                credential: Credential::Bearer(current),
                expires_at,
            });
        }

        let Some(refresh_token) = refresh_token else {
            self.revoke_config(&mut config, "access token expired and no refresh token is stored")
                .await?;
            return Err(TokenError::Revoked("no refresh token".to_string()));
        };
        let refresh_secret = self.vault.decrypt(&refresh_token)?;

        let outcome = tokio::time::timeout(
            self.refresh_timeout,
            self.endpoint.refresh(config.provider_type, &refresh_secret),
        )
        .await
        .unwrap_or(Err(ProviderError::Timeout(self.refresh_timeout)));

        match outcome {
            Ok(grant) => self.persist_grant(&mut config, grant, refresh_token).await,
            Err(err) => {
                let classified = classify_at(&err, self.clock.now());
                if classified.kind == ErrorKind::AuthRevoked {
                    self.revoke_config(&mut config, &classified.message).await?;
                    Err(TokenError::Revoked(classified.message))
                } else {
                    warn!(kind = %classified.kind, error = %classified.message, "token refresh failed");
                    Err(TokenError::Refresh(classified))
                }
            }
        }
    }

    async fn persist_grant(
        &self,
        config: &mut ProviderConfig,
        grant: TokenGrant,
        previous_refresh: EncryptedSecret,
    ) -> Result<AccessCredential> {
        let now = self.clock.now();
        let expires_at = grant.expires_at(now);
        let refresh_token = match &grant.refresh_token {
            Some(rotated) => self.vault.encrypt(rotated.expose())?,
            None => previous_refresh,
        };

        config.credentials = Some(StoredCredentials::OAuth {
            access_token: self.vault.encrypt(grant.access_token.expose())?,
            refresh_token: Some(refresh_token),
            expires_at,
        });
        config.updated_at = now;
        if !self.repo.update_provider_config(config).await? {
            return Err(TokenError::NotFound(config.id.clone()));
        }

        info!(provider_id = %config.id, expires_at = ?expires_at, "access token refreshed");
        Ok(AccessCredential {
            credential: Credential::Bearer(grant.access_token),
            expires_at,
        })
    }

    async fn revoke_config(&self, config: &mut ProviderConfig, reason: &str) -> Result<()> {
        warn!(provider_id = %config.id, tenant_id = %config.tenant_id, reason, "credentials revoked, disabling provider");
        config.revoke(reason);
        if !self.repo.update_provider_config(config).await? {
            debug!(provider_id = %config.id, "provider removed before revocation was stored");
        }
        Ok(())
    }

    fn static_logins(&self, config: &ProviderConfig) -> Result<AccessCredential> {
        let Some(StoredCredentials::Password { imap, smtp, dav }) = &config.credentials else {
            return Err(TokenError::Revoked("provider has no stored logins".to_string()));
        };
        let decrypt = |login: &Option<EncryptedLogin>| -> Result<Option<Login>> {
            login
                .as_ref()
                .map(|l| self.vault.decrypt_login(l))
                .transpose()
                .map_err(TokenError::from)
        };
        Ok(AccessCredential {
            credential: Credential::Logins {
                imap: self.vault.decrypt_login(imap)?,
                smtp: decrypt(smtp)?,
                dav: decrypt(dav)?,
            },
            expires_at: None,
        })
    }

    async fn load(&self, provider_id: &ProviderId) -> Result<ProviderConfig> {
        self.repo
            .get_provider(provider_id)
            .await?
            .ok_or_else(|| TokenError::NotFound(provider_id.clone()))
    }

    fn is_expired(&self, expires_at: Option<DateTime<Utc>>) -> bool {
        expires_at.is_some_and(|at| at - self.expiry_skew <= self.clock.now())
    }
}

fn usable_credentials(config: &ProviderConfig) -> Result<&StoredCredentials> {
    match (&config.credentials, config.is_active) {
        (Some(credentials), true) => Ok(credentials),
        _ => Err(TokenError::Revoked(
            config
                .schedule
                .last_error
                .clone()
                .unwrap_or_else(|| "provider is disconnected".to_string()),
        )),
    }
}
