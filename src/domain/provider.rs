//! Provider configuration types.
//!
//! A [`ProviderConfig`] is one connected mailbox of one tenant. It carries the
//! encrypted credential material, the plaintext server settings for generic
//! providers, the adaptive scheduling state and the per-capability sync cursors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ProviderId, TenantId};

/// A connected mailbox/tenant pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Unique identifier for this provider.
    pub id: ProviderId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Which adapter variant drives this provider.
    pub provider_type: ProviderType,
    /// Mailbox address.
    pub email: String,
    /// Display name reported by the provider.
    pub display_name: Option<String>,
    /// Capabilities this provider is synced for.
    pub capabilities: Capabilities,
    /// Capability categories for which this provider is the tenant default.
    pub default_for: Capabilities,
    /// Inactive providers are never scheduled.
    pub is_active: bool,
    /// Encrypted credential material. `None` once revoked.
    pub credentials: Option<StoredCredentials>,
    /// Server endpoints for generic providers.
    pub server: Option<ServerSettings>,
    /// Adaptive scheduling state.
    pub schedule: SchedulingState,
    /// Resumable sync cursors, one per capability.
    pub cursors: SyncCursors,
    /// When the provider was connected.
    pub created_at: DateTime<Utc>,
    /// Last time any field changed.
    pub updated_at: DateTime<Utc>,
}

impl ProviderConfig {
    /// Creates an active provider with empty scheduling state, due immediately.
    pub fn new(
        tenant_id: TenantId,
        provider_type: ProviderType,
        email: impl Into<String>,
        credentials: StoredCredentials,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ProviderId::generate(),
            tenant_id,
            provider_type,
            email: email.into(),
            display_name: None,
            capabilities: provider_type.default_capabilities(),
            default_for: Capabilities::none(),
            is_active: true,
            credentials: Some(credentials),
            server: None,
            schedule: SchedulingState::due_at(now),
            cursors: SyncCursors::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether this provider is the tenant default for the email category.
    pub fn is_default(&self) -> bool {
        self.default_for.email
    }

    /// Whether the provider is revoked and waiting for the tenant to reconnect.
    pub fn needs_reconnection(&self) -> bool {
        !self.is_active && self.credentials.is_none()
    }

    /// Soft-disables the provider after an unrecoverable auth failure.
    pub fn revoke(&mut self, reason: impl Into<String>) {
        self.is_active = false;
        self.credentials = None;
        self.schedule.next_sync_at = None;
        self.schedule.last_error = Some(reason.into());
        self.updated_at = Utc::now();
    }
}

/// Type of mailbox provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    /// Gmail, Google Calendar and Google People APIs.
    Google,
    /// Microsoft Graph.
    Microsoft,
    /// IMAP/SMTP with optional CalDAV/CardDAV.
    Generic,
}

impl ProviderType {
    /// Returns the lowercase name used in storage.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Google => "google",
            Self::Microsoft => "microsoft",
            Self::Generic => "generic",
        }
    }

    /// Parses the storage name.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "google" => Some(Self::Google),
            "microsoft" => Some(Self::Microsoft),
            "generic" => Some(Self::Generic),
            _ => None,
        }
    }

    /// Whether credentials for this type are refreshed through an OAuth token endpoint.
    pub fn uses_oauth(self) -> bool {
        !matches!(self, Self::Generic)
    }

    /// Capabilities enabled when a provider of this type is connected.
    pub fn default_capabilities(self) -> Capabilities {
        match self {
            Self::Google | Self::Microsoft => Capabilities::all(),
            Self::Generic => Capabilities::email_only(),
        }
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A syncable data category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Email,
    Calendar,
    Contacts,
}

impl Capability {
    /// All capabilities in sync order.
    pub const ALL: [Capability; 3] = [Self::Email, Self::Calendar, Self::Contacts];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Calendar => "calendar",
            Self::Contacts => "contacts",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A set of capability flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capabilities {
    pub email: bool,
    pub calendar: bool,
    pub contacts: bool,
}

impl Capabilities {
    pub fn all() -> Self {
        Self {
            email: true,
            calendar: true,
            contacts: true,
        }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn email_only() -> Self {
        Self {
            email: true,
            ..Self::default()
        }
    }

    pub fn contains(&self, capability: Capability) -> bool {
        match capability {
            Capability::Email => self.email,
            Capability::Calendar => self.calendar,
            Capability::Contacts => self.contacts,
        }
    }

    pub fn set(&mut self, capability: Capability, enabled: bool) {
        match capability {
            Capability::Email => self.email = enabled,
            Capability::Calendar => self.calendar = enabled,
            Capability::Contacts => self.contacts = enabled,
        }
    }

    /// Enabled capabilities in sync order.
    pub fn iter(&self) -> impl Iterator<Item = Capability> {
        let caps = *self;
        Capability::ALL.into_iter().filter(move |c| caps.contains(*c))
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

/// A secret encrypted by the credential vault.
///
/// Both fields are standard base64. The authentication tag is appended to
/// the ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedSecret {
    pub ciphertext: String,
    pub iv: String,
}

/// An encrypted username/password pair for a generic server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedLogin {
    pub username: EncryptedSecret,
    pub password: EncryptedSecret,
}

/// Encrypted credential material stored with a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoredCredentials {
    /// OAuth token pair for Google and Microsoft.
    #[serde(rename = "oauth")]
    OAuth {
        access_token: EncryptedSecret,
        refresh_token: Option<EncryptedSecret>,
        expires_at: Option<DateTime<Utc>>,
    },
    /// Static logins for generic providers.
    Password {
        imap: EncryptedLogin,
        smtp: Option<EncryptedLogin>,
        dav: Option<EncryptedLogin>,
    },
}

/// Transport security for a generic server connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Security {
    /// Implicit TLS (IMAPS 993, SMTPS 465).
    Tls,
    /// Plain connection upgraded with STARTTLS.
    StartTls,
}

/// Server endpoints for a generic provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSettings {
    pub imap_host: String,
    pub imap_port: u16,
    pub imap_security: Security,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_security: Security,
    /// CalDAV collection URL, enables calendar sync when set.
    pub caldav_url: Option<String>,
    /// CardDAV collection URL, enables contacts sync when set.
    pub carddav_url: Option<String>,
}

impl ServerSettings {
    /// Capabilities the configured endpoints support.
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            email: true,
            calendar: self.caldav_url.is_some(),
            contacts: self.carddav_url.is_some(),
        }
    }
}

/// Adaptive scheduling state persisted with each provider.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SchedulingState {
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Last time a sync observed new items.
    pub last_activity_at: Option<DateTime<Utc>>,
    /// Consecutive failed sync attempts.
    pub error_streak: u32,
    /// Consecutive rate-limit responses without a retry hint.
    pub throttle_streak: u32,
    /// Earliest time the provider may be enqueued again. `None` when unscheduled.
    pub next_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl SchedulingState {
    pub fn due_at(at: DateTime<Utc>) -> Self {
        Self {
            next_sync_at: Some(at),
            ..Self::default()
        }
    }
}

/// Opaque per-capability sync cursors.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncCursors {
    pub email: Option<String>,
    pub calendar: Option<String>,
    pub contacts: Option<String>,
}

impl SyncCursors {
    pub fn get(&self, capability: Capability) -> Option<&str> {
        match capability {
            Capability::Email => self.email.as_deref(),
            Capability::Calendar => self.calendar.as_deref(),
            Capability::Contacts => self.contacts.as_deref(),
        }
    }

    pub fn set(&mut self, capability: Capability, cursor: Option<String>) {
        match capability {
            Capability::Email => self.email = cursor,
            Capability::Calendar => self.calendar = cursor,
            Capability::Contacts => self.contacts = cursor,
        }
    }
}

/// Coarse health state shown by the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Last sync succeeded.
    Healthy,
    /// A job for this provider is running or queued.
    Syncing,
    /// Recent failures below the error-badge threshold.
    BackingOff,
    /// Error streak crossed the badge threshold.
    Degraded,
    /// Credentials were revoked; the tenant must reconnect.
    NeedsReconnection,
}

/// Health snapshot for one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub provider_id: ProviderId,
    pub status: HealthStatus,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub next_sync_at: Option<DateTime<Utc>>,
    pub error_streak: u32,
    pub last_error: Option<String>,
}
