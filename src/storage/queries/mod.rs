//! Database query modules.
//!
//! `providers` exposes async functions over [`Database`](super::Database).
//! The record modules take a `&Connection` so the repository can batch them
//! inside one transaction.

pub mod contacts;
pub mod emails;
pub mod events;
pub mod folders;
pub mod providers;

use chrono::{DateTime, SecondsFormat, Utc};

/// 9999-12-31T23:59:59Z, the last instant with a four-digit year.
const LATEST_STORABLE_SECS: i64 = 253_402_300_799;

/// Formats a timestamp so lexical order matches chronological order.
/// Later instants are clamped; a five-digit year would sort first.
pub(crate) fn ts(value: DateTime<Utc>) -> String {
    let latest = DateTime::from_timestamp(LATEST_STORABLE_SECS, 0).unwrap_or(value);
    value.min(latest).to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn opt_ts(value: Option<DateTime<Utc>>) -> Option<String> {
    value.map(ts)
}

pub(crate) fn parse_ts(value: Option<String>) -> Option<DateTime<Utc>> {
    value.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    })
}

/// Builds a `(?1, ?2, ...)` placeholder list starting at `start`.
pub(crate) fn placeholders(start: usize, count: usize) -> String {
    let items: Vec<String> = (start..start + count).map(|i| format!("?{i}")).collect();
    items.join(", ")
}

#[cfg(test)]
pub(crate) fn test_conn() -> rusqlite::Connection {
    let conn = rusqlite::Connection::open_in_memory().unwrap();
    for migration in super::schema::all_migrations() {
        conn.execute_batch(migration).unwrap();
    }
    conn
}
