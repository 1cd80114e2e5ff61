//! Keychain access for the vault master key.
//!
//! Wraps the keyring crate to provide OS-native secret storage. Provider
//! credentials live encrypted in the database; only the key that unlocks
//! them is kept here.

use thiserror::Error;

/// Errors that can occur during keychain operations.
#[derive(Debug, Error)]
pub enum KeychainError {
    #[error("Keychain error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("Credential not found: {0}")]
    NotFound(String),

    #[error("Failed to spawn blocking task: {0}")]
    TaskFailed(String),
}

/// Result type for keychain operations.
pub type Result<T> = std::result::Result<T, KeychainError>;

/// Provides access to the OS keychain.
///
/// Entries are namespaced by the service name so test runs never touch the
/// production key.
#[derive(Debug, Clone)]
pub struct KeychainAccess {
    service_name: String,
}

impl KeychainAccess {
    /// Default service name.
    pub const DEFAULT_SERVICE: &'static str = "io.mailsync.engine";

    /// Entry holding the base64 vault master key.
    pub const VAULT_KEY_ENTRY: &'static str = "vault.master_key";

    /// Creates a new KeychainAccess with the default service name.
    pub fn new() -> Self {
        Self {
            service_name: Self::DEFAULT_SERVICE.to_string(),
        }
    }

    /// Creates a new KeychainAccess with a custom service name.
    ///
    /// Useful for testing to avoid interfering with real credentials.
    pub fn with_service(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }

    /// Stores a credential in the keychain.
    ///
    /// If a credential with the same key already exists, it is overwritten.
    pub async fn store(&self, key: &str, value: &str) -> Result<()> {
        let service = self.service_name.clone();
        let key = key.to_string();
        let value = value.to_string();

        tokio::task::spawn_blocking(move || {
            let entry = keyring::Entry::new(&service, &key)?;
            entry.set_password(&value)?;
            Ok(())
        })
        .await
        .map_err(|e| KeychainError::TaskFailed(e.to_string()))?
    }

    /// Retrieves a credential from the keychain.
    ///
    /// Returns `None` if no credential exists for the key.
    pub async fn retrieve(&self, key: &str) -> Result<Option<String>> {
        let service = self.service_name.clone();
        let key = key.to_string();

        tokio::task::spawn_blocking(move || {
            let entry = keyring::Entry::new(&service, &key)?;
            match entry.get_password() {
                Ok(password) => Ok(Some(password)),
                Err(keyring::Error::NoEntry) => Ok(None),
                Err(e) => Err(KeychainError::Keyring(e)),
            }
        })
        .await
        .map_err(|e| KeychainError::TaskFailed(e.to_string()))?
    }

    /// Deletes a credential from the keychain.
    ///
    /// Returns an error if the credential does not exist.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let service = self.service_name.clone();
        let key = key.to_string();

        tokio::task::spawn_blocking(move || {
            let entry = keyring::Entry::new(&service, &key)?;
            match entry.delete_credential() {
                Ok(()) => Ok(()),
                Err(keyring::Error::NoEntry) => Err(KeychainError::NotFound(key)),
                Err(e) => Err(KeychainError::Keyring(e)),
            }
        })
        .await
        .map_err(|e| KeychainError::TaskFailed(e.to_string()))?
    }

    /// Returns the stored value, storing `init()` first when the entry is missing.
    pub async fn get_or_insert_with<F>(&self, key: &str, init: F) -> Result<String>
    where
        F: FnOnce() -> String,
    {
        if let Some(existing) = self.retrieve(key).await? {
            return Ok(existing);
        }
        let value = init();
        self.store(key, &value).await?;
        tracing::info!(service = %self.service_name, key, "Created keychain entry");
        Ok(value)
    }

    /// Returns the service name used for this keychain access.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }
}

impl Default for KeychainAccess {
    fn default() -> Self {
        Self::new()
    }
}
