//! Configuration and settings management.
//!
//! Settings are stored in the user's config directory as JSON, with
//! `MAILSYNC_*` environment variables overriding secrets and paths.

mod settings;

pub use settings::{
    OAuthClientSettings, OAuthSettings, RetrySettings, SchedulerSettings, Settings, SettingsError,
    StorageSettings, TimeoutSettings, VaultSettings, ENV_DATABASE_PATH, ENV_GOOGLE_CLIENT_ID,
    ENV_GOOGLE_CLIENT_SECRET, ENV_MICROSOFT_CLIENT_ID, ENV_MICROSOFT_CLIENT_SECRET, ENV_VAULT_KEY,
};
