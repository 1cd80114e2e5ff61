//! Database and credential storage.
//!
//! This module provides the storage layer for the sync engine:
//!
//! - SQLite database for provider configs and synced records
//! - the credential vault that encrypts provider secrets at rest
//! - OS keychain integration for the vault master key
//! - Async-safe database operations via tokio::task::spawn_blocking

mod database;
mod keychain;
pub mod queries;
mod repository;
mod schema;
mod vault;

pub use database::{Database, DatabaseError, Result};
pub use keychain::{KeychainAccess, KeychainError};
pub use repository::{AppliedChanges, SqliteRepository, SyncRepository};
pub use vault::{CredentialVault, Login, Secret, VaultError};

use std::sync::Arc;

/// Combined storage layer with database and keychain access.
///
/// This is the main entry point for storage operations.
#[derive(Debug, Clone)]
pub struct StorageLayer {
    db: Database,
    keychain: KeychainAccess,
}

impl StorageLayer {
    /// Opens the database at `db_path` and binds the keychain to
    /// `keychain_service`.
    pub async fn new(
        db_path: impl AsRef<std::path::Path>,
        keychain_service: impl Into<String>,
    ) -> Result<Self> {
        let db = Database::open(db_path).await?;
        Ok(Self {
            db,
            keychain: KeychainAccess::with_service(keychain_service),
        })
    }

    /// Creates a storage layer with an in-memory database for testing.
    pub async fn in_memory() -> Result<Self> {
        let db = Database::open_in_memory().await?;
        Ok(Self {
            db,
            keychain: KeychainAccess::with_service("io.mailsync.test"),
        })
    }

    /// Returns a reference to the database.
    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Returns a reference to the keychain.
    pub fn keychain(&self) -> &KeychainAccess {
        &self.keychain
    }

    /// Unlocks the credential vault with the explicit key, else the key kept
    /// in this layer's keychain.
    pub async fn unlock_vault(&self, explicit_key: Option<&str>) -> vault::Result<CredentialVault> {
        CredentialVault::load(explicit_key, &self.keychain).await
    }

    /// Returns the repository the engine persists through.
    pub fn repository(&self) -> Arc<SqliteRepository> {
        Arc::new(SqliteRepository::new(self.db.clone()))
    }
}
