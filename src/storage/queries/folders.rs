//! Folder (label) queries.

use chrono::Utc;
use rusqlite::{params, Connection, Result};

use super::ts;
use crate::domain::{Folder, ProviderId};

/// Inserts or renames a folder.
pub fn upsert(conn: &Connection, provider_id: &ProviderId, folder: &Folder) -> Result<()> {
    conn.execute(
        "INSERT INTO folders (provider_id, external_id, name, is_system, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(provider_id, external_id) DO UPDATE SET
             name = excluded.name,
             is_system = excluded.is_system,
             updated_at = excluded.updated_at",
        params![
            provider_id.0,
            folder.external_id,
            folder.name,
            folder.is_system,
            ts(Utc::now()),
        ],
    )?;
    Ok(())
}

/// Lists a provider's folders by name.
pub fn list_by_provider(conn: &Connection, provider_id: &ProviderId) -> Result<Vec<Folder>> {
    let mut stmt = conn.prepare(
        "SELECT external_id, name, is_system FROM folders
         WHERE provider_id = ?1 ORDER BY is_system DESC, name",
    )?;
    let rows = stmt.query_map([&provider_id.0], |row| {
        Ok(Folder {
            external_id: row.get(0)?,
            name: row.get(1)?,
            is_system: row.get(2)?,
        })
    })?;
    rows.collect()
}

pub fn delete_for_provider(conn: &Connection, provider_id: &ProviderId) -> Result<usize> {
    conn.execute("DELETE FROM folders WHERE provider_id = ?1", [&provider_id.0])
}
