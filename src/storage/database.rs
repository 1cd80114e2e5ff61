//! SQLite connection wrapper.
//!
//! Provides a thread-safe wrapper around rusqlite for async operations.

use std::path::Path;
use std::sync::Arc;

use rusqlite::Connection;
use thiserror::Error;
use tokio::sync::Mutex;

use super::schema;

/// Errors that can occur during database operations.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Provider {0} no longer exists")]
    ProviderRemoved(String),

    #[error("Stored value could not be decoded: {0}")]
    Corrupt(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Blocking task failed: {0}")]
    TaskFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for database operations.
pub type Result<T> = std::result::Result<T, DatabaseError>;

/// Thread-safe database connection wrapper.
///
/// A single connection guarded by an async mutex. Every closure runs on the
/// blocking pool so SQLite I/O never stalls a runtime worker.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Opens a database at the given path, creating parent directories and
    /// running migrations.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let conn = Connection::open(&path)?;
            conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")?;
            Ok(conn)
        })
        .await
        .map_err(|e| DatabaseError::TaskFailed(e.to_string()))??;

        Self::migrated(conn).await
    }

    /// Opens an in-memory database for tests.
    pub async fn open_in_memory() -> Result<Self> {
        let conn = tokio::task::spawn_blocking(|| -> Result<Connection> {
            let conn = Connection::open_in_memory()?;
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            Ok(conn)
        })
        .await
        .map_err(|e| DatabaseError::TaskFailed(e.to_string()))??;

        Self::migrated(conn).await
    }

    async fn migrated(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.with_conn(|conn| {
            for migration in schema::all_migrations() {
                conn.execute_batch(migration)
                    .map_err(|e| DatabaseError::MigrationFailed(e.to_string()))?;
            }
            Ok(())
        })
        .await?;
        Ok(db)
    }

    /// Executes a function with access to the database connection.
    pub async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            f(&conn)
        })
        .await
        .map_err(|e| DatabaseError::TaskFailed(e.to_string()))?
    }

    /// Executes a transaction with the given function.
    ///
    /// Committed when `f` returns `Ok`, rolled back otherwise.
    pub async fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = conn.blocking_lock();
            let tx = conn.transaction()?;
            let result = f(&tx)?;
            tx.commit()?;
            Ok(result)
        })
        .await
        .map_err(|e| DatabaseError::TaskFailed(e.to_string()))?
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INSERT_PROVIDER: &str = "INSERT INTO provider_configs
        (id, tenant_id, provider_type, email, created_at, updated_at)
        VALUES ('p1', 't1', 'google', 'a@gmail.com', '2025-01-01T00:00:00Z', '2025-01-01T00:00:00Z')";

    #[tokio::test]
    async fn open_in_memory_creates_schema() {
        let db = Database::open_in_memory().await.unwrap();

        let tables: Vec<String> = db
            .with_conn(|conn| {
                let mut stmt = conn
                    .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
            })
            .await
            .unwrap();

        for table in ["provider_configs", "emails", "folders", "calendar_events", "contacts"] {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }
    }

    #[tokio::test]
    async fn open_on_disk_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("mailsync.db");
        let db = Database::open(&path).await.unwrap();
        let count: i64 = db
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM provider_configs", [], |row| {
                    row.get(0)
                })?)
            })
            .await
            .unwrap();
        assert_eq!(count, 0);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mailsync.db");
        drop(Database::open(&path).await.unwrap());
        Database::open(&path).await.unwrap();
    }

    #[tokio::test]
    async fn transaction_rolls_back_on_error() {
        let db = Database::open_in_memory().await.unwrap();

        let result: Result<()> = db
            .transaction(|tx| {
                tx.execute(INSERT_PROVIDER, [])?;
                Err(DatabaseError::Corrupt("intentional".to_string()))
            })
            .await;
        assert!(result.is_err());

        let count: i64 = db
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM provider_configs", [], |row| {
                    row.get(0)
                })?)
            })
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn foreign_keys_are_enforced() {
        let db = Database::open_in_memory().await.unwrap();
        let orphan = db
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO folders (provider_id, external_id, name, is_system, updated_at)
                     VALUES ('missing', 'INBOX', 'Inbox', 1, '2025-01-01T00:00:00Z')",
                    [],
                )?;
                Ok(())
            })
            .await;
        assert!(orphan.is_err());
    }

    #[tokio::test]
    async fn database_is_clone() {
        let db1 = Database::open_in_memory().await.unwrap();
        let db2 = db1.clone();

        db1.transaction(|tx| {
            tx.execute(INSERT_PROVIDER, [])?;
            tx.execute(
                "INSERT INTO folders (provider_id, external_id, name, is_system, updated_at)
                 VALUES ('p1', 'SENT', 'Sent', 1, '2025-01-01T00:00:00Z')",
                [],
            )?;
            Ok(())
        })
        .await
        .unwrap();

        let name: String = db2
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT name FROM folders WHERE external_id = 'SENT'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(name, "Sent");
    }
}
