//! Domain layer types for the sync engine.
//!
//! This module contains the core domain types used throughout the crate:
//! provider configurations, sync jobs, and the email, calendar and contact
//! records that syncs produce.

mod contact;
mod email;
mod event;
mod job;
mod provider;
mod types;

pub use contact::Contact;
pub use email::{Address, Draft, Email, Folder};
pub use event::CalendarEvent;
pub use job::{Priority, ScopeOutcome, SyncJob, SyncResult, SyncType, Trigger};
pub use provider::{
    Capabilities, Capability, EncryptedLogin, EncryptedSecret, HealthStatus, ProviderConfig,
    ProviderHealth, ProviderType, SchedulingState, Security, ServerSettings, StoredCredentials,
    SyncCursors,
};
pub use types::{JobId, ProviderId, TenantId};
