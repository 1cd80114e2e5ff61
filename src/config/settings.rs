//! Engine settings and configuration types.
//!
//! Settings are persisted to `~/.config/mailsync/settings.json` (or the
//! platform equivalent) and loaded at startup. Secrets and paths can be
//! overridden from the environment so they never need to be written to disk.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::providers::AdapterOptions;
use crate::services::{
    CapabilityPriorities, EngineConfig, ExecutorConfig, OAuthClient, OAuthTokenClient,
    QueueConfig, SchedulePolicy, TokenSettings, GOOGLE_TOKEN_URL, MICROSOFT_TOKEN_URL,
};

const APP_NAME: &str = "mailsync";
const SETTINGS_FILE: &str = "settings.json";
const DATABASE_FILE: &str = "mailsync.db";

pub const ENV_VAULT_KEY: &str = "MAILSYNC_VAULT_KEY";
pub const ENV_GOOGLE_CLIENT_ID: &str = "MAILSYNC_GOOGLE_CLIENT_ID";
pub const ENV_GOOGLE_CLIENT_SECRET: &str = "MAILSYNC_GOOGLE_CLIENT_SECRET";
pub const ENV_MICROSOFT_CLIENT_ID: &str = "MAILSYNC_MICROSOFT_CLIENT_ID";
pub const ENV_MICROSOFT_CLIENT_SECRET: &str = "MAILSYNC_MICROSOFT_CLIENT_SECRET";
pub const ENV_DATABASE_PATH: &str = "MAILSYNC_DATABASE_PATH";

/// Errors that can occur while loading or saving settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid settings file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid setting: {0}")]
    Invalid(String),

    #[error("no configuration directory available on this platform")]
    NoConfigDir,
}

pub type Result<T> = std::result::Result<T, SettingsError>;

/// Top-level engine settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Adaptive interval and backoff tuning.
    pub scheduler: SchedulerSettings,
    /// Worker count and queue capacity per priority lane.
    pub workers: QueueConfig,
    pub timeouts: TimeoutSettings,
    /// Local retry budget for transient failures inside one job.
    pub retry: RetrySettings,
    /// OAuth client registrations used to refresh tokens.
    pub oauth: OAuthSettings,
    pub vault: VaultSettings,
    pub storage: StorageSettings,
}

/// Scheduler tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub tick_seconds: u64,
    pub active_interval_seconds: u64,
    pub base_interval_seconds: u64,
    pub idle_interval_seconds: u64,
    pub max_interval_seconds: u64,
    pub backoff_multiplier: f64,
    /// New items within this window select the active interval.
    pub activity_window_seconds: u64,
    /// No new items for this long selects the idle interval.
    pub idle_after_seconds: u64,
    pub rate_limit_default_seconds: u64,
    pub rate_limit_max_seconds: u64,
    pub saturation_delay_seconds: u64,
    pub error_badge_threshold: u32,
    pub full_sync_limit: Option<u32>,
    pub priorities: CapabilityPriorities,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from(&SchedulePolicy::default())
    }
}

impl From<&SchedulePolicy> for SchedulerSettings {
    fn from(policy: &SchedulePolicy) -> Self {
        Self {
            tick_seconds: policy.tick_interval.as_secs(),
            active_interval_seconds: policy.active_interval.as_secs(),
            base_interval_seconds: policy.base_interval.as_secs(),
            idle_interval_seconds: policy.idle_interval.as_secs(),
            max_interval_seconds: policy.max_interval.as_secs(),
            backoff_multiplier: policy.backoff_multiplier,
            activity_window_seconds: policy.activity_window.as_secs(),
            idle_after_seconds: policy.idle_after.as_secs(),
            rate_limit_default_seconds: policy.rate_limit_default.as_secs(),
            rate_limit_max_seconds: policy.rate_limit_max.as_secs(),
            saturation_delay_seconds: policy.saturation_delay.as_secs(),
            error_badge_threshold: policy.error_badge_threshold,
            full_sync_limit: policy.full_sync_limit,
            priorities: policy.priorities,
        }
    }
}

/// Deadlines for provider and token endpoint calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    /// One adapter call.
    pub request_seconds: u64,
    pub test_connection_seconds: u64,
    /// A whole job, retries included.
    pub job_seconds: u64,
    pub token_refresh_seconds: u64,
    /// Tokens are treated as expired this long before their stated expiry.
    pub token_expiry_skew_seconds: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            request_seconds: 30,
            test_connection_seconds: 10,
            job_seconds: 300,
            token_refresh_seconds: 15,
            token_expiry_skew_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 500,
        }
    }
}

/// A registered OAuth application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthClientSettings {
    pub client_id: String,
    /// Usually supplied through the environment instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    pub token_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthSettings {
    pub google: Option<OAuthClientSettings>,
    pub microsoft: Option<OAuthClientSettings>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultSettings {
    /// Base64 master key. Never written back to disk.
    #[serde(skip_serializing)]
    pub key: Option<String>,
    /// Keychain service holding the generated key when `key` is unset.
    pub keychain_service: String,
}

impl Default for VaultSettings {
    fn default() -> Self {
        Self {
            key: None,
            keychain_service: crate::storage::KeychainAccess::DEFAULT_SERVICE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Defaults to `mailsync.db` in the platform data directory.
    pub database_path: Option<PathBuf>,
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("", "", APP_NAME)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl Settings {
    /// Location of the settings file.
    pub fn path() -> Result<PathBuf> {
        project_dirs()
            .map(|dirs| dirs.config_dir().join(SETTINGS_FILE))
            .ok_or(SettingsError::NoConfigDir)
    }

    /// Loads settings from the default location, applies environment
    /// overrides and validates the result. A missing file yields defaults.
    pub fn load() -> Result<Self> {
        let mut settings = Self::load_from(&Self::path()?)?;
        settings.apply_env();
        settings.validate()?;
        Ok(settings)
    }

    /// Reads a settings file without applying overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(json) => Ok(serde_json::from_str(&json)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No settings file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Applies `MAILSYNC_*` environment overrides.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Applies overrides from an arbitrary variable source.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = non_empty(lookup(ENV_VAULT_KEY)) {
            self.vault.key = Some(key);
        }
        if let Some(path) = non_empty(lookup(ENV_DATABASE_PATH)) {
            self.storage.database_path = Some(PathBuf::from(path));
        }
        override_client(
            &mut self.oauth.google,
            non_empty(lookup(ENV_GOOGLE_CLIENT_ID)),
            non_empty(lookup(ENV_GOOGLE_CLIENT_SECRET)),
            GOOGLE_TOKEN_URL,
        );
        override_client(
            &mut self.oauth.microsoft,
            non_empty(lookup(ENV_MICROSOFT_CLIENT_ID)),
            non_empty(lookup(ENV_MICROSOFT_CLIENT_SECRET)),
            MICROSOFT_TOKEN_URL,
        );
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        for (lane, config) in [
            ("high", self.workers.high),
            ("normal", self.workers.normal),
            ("low", self.workers.low),
        ] {
            if config.workers == 0 {
                return Err(SettingsError::Invalid(format!("{lane} lane needs at least one worker")));
            }
            if config.capacity == 0 {
                return Err(SettingsError::Invalid(format!("{lane} lane capacity must be positive")));
            }
        }

        let s = &self.scheduler;
        if s.tick_seconds == 0 {
            return Err(SettingsError::Invalid("tick_seconds must be positive".to_string()));
        }
        if s.base_interval_seconds > s.max_interval_seconds {
            return Err(SettingsError::Invalid(
                "base_interval_seconds exceeds max_interval_seconds".to_string(),
            ));
        }
        if s.backoff_multiplier.is_nan() || s.backoff_multiplier < 1.0 {
            return Err(SettingsError::Invalid("backoff_multiplier must be at least 1".to_string()));
        }
        if s.rate_limit_default_seconds > s.rate_limit_max_seconds {
            return Err(SettingsError::Invalid(
                "rate_limit_default_seconds exceeds rate_limit_max_seconds".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(SettingsError::Invalid("retry.max_attempts must be positive".to_string()));
        }
        Ok(())
    }

    /// Resolved database location.
    pub fn database_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.storage.database_path {
            return Ok(path.clone());
        }
        project_dirs()
            .map(|dirs| dirs.data_dir().join(DATABASE_FILE))
            .ok_or(SettingsError::NoConfigDir)
    }

    pub fn schedule_policy(&self) -> SchedulePolicy {
        let s = &self.scheduler;
        SchedulePolicy {
            tick_interval: Duration::from_secs(s.tick_seconds),
            active_interval: Duration::from_secs(s.active_interval_seconds),
            base_interval: Duration::from_secs(s.base_interval_seconds),
            idle_interval: Duration::from_secs(s.idle_interval_seconds),
            max_interval: Duration::from_secs(s.max_interval_seconds),
            backoff_multiplier: s.backoff_multiplier,
            activity_window: Duration::from_secs(s.activity_window_seconds),
            idle_after: Duration::from_secs(s.idle_after_seconds),
            rate_limit_default: Duration::from_secs(s.rate_limit_default_seconds),
            rate_limit_max: Duration::from_secs(s.rate_limit_max_seconds),
            saturation_delay: Duration::from_secs(s.saturation_delay_seconds),
            error_badge_threshold: s.error_badge_threshold,
            priorities: s.priorities,
            full_sync_limit: s.full_sync_limit,
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            adapter_timeout: Duration::from_secs(self.timeouts.request_seconds),
            job_timeout: Duration::from_secs(self.timeouts.job_seconds),
            max_attempts: self.retry.max_attempts,
            retry_backoff: Duration::from_millis(self.retry.backoff_ms),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            policy: self.schedule_policy(),
            queue: self.workers,
            executor: self.executor_config(),
            tokens: TokenSettings {
                expiry_skew: Duration::from_secs(self.timeouts.token_expiry_skew_seconds),
                refresh_timeout: Duration::from_secs(self.timeouts.token_refresh_seconds),
            },
        }
    }

    pub fn adapter_options(&self) -> AdapterOptions {
        let defaults = AdapterOptions::default();
        AdapterOptions {
            request_timeout: Duration::from_secs(self.timeouts.request_seconds),
            test_timeout: Duration::from_secs(self.timeouts.test_connection_seconds),
            full_sync_limit: self.scheduler.full_sync_limit.unwrap_or(defaults.full_sync_limit),
            ..defaults
        }
    }

    /// Token endpoint client for every configured OAuth application.
    pub fn token_client(&self, http: reqwest::Client) -> OAuthTokenClient {
        let timeout = Duration::from_secs(self.timeouts.token_refresh_seconds);
        let mut client = OAuthTokenClient::new(http, timeout);
        if let Some(google) = &self.oauth.google {
            client = client.with_google(oauth_client(google));
        }
        if let Some(microsoft) = &self.oauth.microsoft {
            client = client.with_microsoft(oauth_client(microsoft));
        }
        client
    }
}

fn override_client(
    slot: &mut Option<OAuthClientSettings>,
    client_id: Option<String>,
    client_secret: Option<String>,
    default_token_url: &str,
) {
    if let Some(client_id) = client_id {
        match slot {
            Some(existing) => existing.client_id = client_id,
            None => {
                *slot = Some(OAuthClientSettings {
                    client_id,
                    client_secret: None,
                    token_url: default_token_url.to_string(),
                })
            }
        }
    }
    if let (Some(secret), Some(existing)) = (client_secret, slot.as_mut()) {
        existing.client_secret = Some(secret);
    }
}

fn oauth_client(settings: &OAuthClientSettings) -> OAuthClient {
    let client = OAuthClient::new(settings.client_id.clone(), settings.token_url.clone());
    match &settings.client_secret {
        Some(secret) => client.with_secret(secret.clone()),
        None => client,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Priority;
    use crate::services::LaneConfig;
    use std::collections::HashMap;

    #[test]
    fn default_settings_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.workers.high.workers, 17);
        assert_eq!(settings.workers.normal.workers, 10);
        assert_eq!(settings.workers.low.workers, 7);
        assert_eq!(settings.retry.max_attempts, 3);
    }

    #[test]
    fn default_policy_matches_scheduler_defaults() {
        assert_eq!(Settings::default().schedule_policy(), SchedulePolicy::default());
    }

    #[test]
    fn settings_roundtrip() {
        let mut settings = Settings::default();
        settings.scheduler.base_interval_seconds = 120;
        settings.workers.low = LaneConfig {
            workers: 2,
            capacity: 10,
        };
        settings.oauth.google = Some(OAuthClientSettings {
            client_id: "client".to_string(),
            client_secret: None,
            token_url: GOOGLE_TOKEN_URL.to_string(),
        });

        let json = serde_json::to_string_pretty(&settings).unwrap();
        let deserialized: Settings = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, settings);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{"scheduler": {"base_interval_seconds": 90}}"#).unwrap();
        assert_eq!(settings.scheduler.base_interval_seconds, 90);
        assert_eq!(settings.scheduler.max_interval_seconds, 3600);
        assert_eq!(settings.workers, QueueConfig::default());
    }

    #[test]
    fn vault_key_is_never_serialized() {
        let mut settings = Settings::default();
        settings.vault.key = Some("c2VjcmV0".to_string());
        let json = serde_json::to_string(&settings).unwrap();
        assert!(!json.contains("c2VjcmV0"));
    }

    #[test]
    fn environment_overrides() {
        let vars: HashMap<&str, &str> = [
            (ENV_VAULT_KEY, "a2V5"),
            (ENV_DATABASE_PATH, "/tmp/sync.db"),
            (ENV_MICROSOFT_CLIENT_ID, "ms-client"),
            (ENV_MICROSOFT_CLIENT_SECRET, "ms-secret"),
            (ENV_GOOGLE_CLIENT_SECRET, "orphan"),
        ]
        .into_iter()
        .collect();

        let mut settings = Settings::default();
        settings.apply_overrides(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(settings.vault.key.as_deref(), Some("a2V5"));
        assert_eq!(settings.database_path().unwrap(), PathBuf::from("/tmp/sync.db"));
        let microsoft = settings.oauth.microsoft.unwrap();
        assert_eq!(microsoft.client_id, "ms-client");
        assert_eq!(microsoft.client_secret.as_deref(), Some("ms-secret"));
        assert_eq!(microsoft.token_url, MICROSOFT_TOKEN_URL);
        // A secret without a client id configures nothing.
        assert!(settings.oauth.google.is_none());
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut settings = Settings::default();
        settings.workers.normal.workers = 0;
        assert!(matches!(settings.validate(), Err(SettingsError::Invalid(_))));

        let mut settings = Settings::default();
        settings.scheduler.base_interval_seconds = 7200;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.scheduler.backoff_multiplier = 0.5;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.scheduler.backoff_multiplier = f64::NAN;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn conversions_carry_tuning() {
        let mut settings = Settings::default();
        settings.timeouts.request_seconds = 5;
        settings.retry.backoff_ms = 50;
        settings.scheduler.full_sync_limit = Some(200);
        settings.scheduler.priorities.contacts = Priority::Normal;

        let engine = settings.engine_config();
        assert_eq!(engine.executor.adapter_timeout, Duration::from_secs(5));
        assert_eq!(engine.executor.retry_backoff, Duration::from_millis(50));
        assert_eq!(engine.policy.priorities.contacts, Priority::Normal);
        assert_eq!(engine.tokens.expiry_skew, Duration::from_secs(60));
        assert_eq!(settings.adapter_options().full_sync_limit, 200);
        assert_eq!(settings.adapter_options().request_timeout, Duration::from_secs(5));
    }

    #[test]
    fn load_and_save_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(SETTINGS_FILE);

        let missing = Settings::load_from(&path).unwrap();
        assert_eq!(missing, Settings::default());

        let mut settings = Settings::default();
        settings.retry.max_attempts = 5;
        settings.save_to(&path).unwrap();
        assert_eq!(Settings::load_from(&path).unwrap().retry.max_attempts, 5);

        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(Settings::load_from(&path), Err(SettingsError::Parse(_))));
    }
}
