//! Calendar event queries.

use chrono::Utc;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Result};

use super::{opt_ts, parse_ts, placeholders, ts};
use crate::domain::{CalendarEvent, ProviderId, TenantId};

/// Inserts or updates an event. Returns `true` when the row is new.
pub fn upsert(
    conn: &Connection,
    tenant_id: &TenantId,
    provider_id: &ProviderId,
    event: &CalendarEvent,
) -> Result<bool> {
    let existed = conn
        .query_row(
            "SELECT 1 FROM calendar_events WHERE provider_id = ?1 AND external_id = ?2",
            params![provider_id.0, event.external_id],
            |_| Ok(()),
        )
        .optional()?
        .is_some();

    conn.execute(
        "INSERT INTO calendar_events (
             provider_id, tenant_id, external_id, summary, description, location,
             starts_at, ends_at, all_day, status, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(provider_id, external_id) DO UPDATE SET
             summary = excluded.summary,
             description = excluded.description,
             location = excluded.location,
             starts_at = excluded.starts_at,
             ends_at = excluded.ends_at,
             all_day = excluded.all_day,
             status = excluded.status,
             updated_at = excluded.updated_at",
        params![
            provider_id.0,
            tenant_id.0,
            event.external_id,
            event.summary,
            event.description,
            event.location,
            opt_ts(event.starts_at),
            opt_ts(event.ends_at),
            event.all_day,
            event.status,
            ts(Utc::now()),
        ],
    )?;

    Ok(!existed)
}

pub fn delete_by_external_ids(
    conn: &Connection,
    provider_id: &ProviderId,
    external_ids: &[String],
) -> Result<usize> {
    if external_ids.is_empty() {
        return Ok(0);
    }
    let sql = format!(
        "DELETE FROM calendar_events WHERE provider_id = ?1 AND external_id IN ({})",
        placeholders(2, external_ids.len())
    );
    let values = std::iter::once(provider_id.0.as_str()).chain(external_ids.iter().map(String::as_str));
    conn.execute(&sql, params_from_iter(values))
}

pub fn delete_for_provider(conn: &Connection, provider_id: &ProviderId) -> Result<usize> {
    conn.execute(
        "DELETE FROM calendar_events WHERE provider_id = ?1",
        [&provider_id.0],
    )
}

/// Lists a provider's events by start time.
pub fn list_by_provider(conn: &Connection, provider_id: &ProviderId) -> Result<Vec<CalendarEvent>> {
    let mut stmt = conn.prepare(
        "SELECT external_id, summary, description, location, starts_at, ends_at, all_day, status
         FROM calendar_events WHERE provider_id = ?1 ORDER BY starts_at, external_id",
    )?;
    let rows = stmt.query_map([&provider_id.0], |row| {
        Ok(CalendarEvent {
            external_id: row.get(0)?,
            summary: row.get(1)?,
            description: row.get(2)?,
            location: row.get(3)?,
            starts_at: parse_ts(row.get(4)?),
            ends_at: parse_ts(row.get(5)?),
            all_day: row.get(6)?,
            status: row.get(7)?,
        })
    })?;
    rows.collect()
}
