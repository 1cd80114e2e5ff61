//! Email record queries.
//!
//! Emails are upserted by `(provider_id, external_id)`.

use chrono::Utc;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Result, Row};

use super::{parse_ts, placeholders, ts};
use crate::domain::{Address, Email, ProviderId, TenantId};

/// Inserts or updates an email. Returns `true` when the row is new.
pub fn upsert(
    conn: &Connection,
    tenant_id: &TenantId,
    provider_id: &ProviderId,
    email: &Email,
) -> Result<bool> {
    let existed = exists(conn, provider_id, &email.external_id)?;
    let now = ts(Utc::now());

    conn.execute(
        r#"
        INSERT INTO emails (
            provider_id, tenant_id, external_id, thread_id, message_id,
            from_address, from_name, to_addresses, cc_addresses,
            subject, body_text, body_html, snippet, date,
            is_read, is_starred, is_draft, labels, created_at, updated_at
        ) VALUES (
            ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
            ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?19
        )
        ON CONFLICT(provider_id, external_id) DO UPDATE SET
            thread_id = excluded.thread_id,
            message_id = excluded.message_id,
            from_address = excluded.from_address,
            from_name = excluded.from_name,
            to_addresses = excluded.to_addresses,
            cc_addresses = excluded.cc_addresses,
            subject = excluded.subject,
            body_text = COALESCE(excluded.body_text, body_text),
            body_html = COALESCE(excluded.body_html, body_html),
            snippet = excluded.snippet,
            date = excluded.date,
            is_read = excluded.is_read,
            is_starred = excluded.is_starred,
            is_draft = excluded.is_draft,
            labels = excluded.labels,
            updated_at = excluded.updated_at
        "#,
        params![
            provider_id.0,
            tenant_id.0,
            email.external_id,
            email.thread_id,
            email.message_id,
            email.from.email,
            email.from.name,
            serde_json::to_string(&email.to).unwrap_or_default(),
            serde_json::to_string(&email.cc).unwrap_or_default(),
            email.subject,
            email.body_text,
            email.body_html,
            email.snippet,
            ts(email.date),
            email.is_read,
            email.is_starred,
            email.is_draft,
            serde_json::to_string(&email.labels).unwrap_or_default(),
            now,
        ],
    )?;

    Ok(!existed)
}

/// Whether an email with this external ID is stored for the provider.
pub fn exists(conn: &Connection, provider_id: &ProviderId, external_id: &str) -> Result<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM emails WHERE provider_id = ?1 AND external_id = ?2",
            params![provider_id.0, external_id],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Deletes emails by external ID. Returns the number of rows removed.
pub fn delete_by_external_ids(
    conn: &Connection,
    provider_id: &ProviderId,
    external_ids: &[String],
) -> Result<usize> {
    if external_ids.is_empty() {
        return Ok(0);
    }
    let sql = format!(
        "DELETE FROM emails WHERE provider_id = ?1 AND external_id IN ({})",
        placeholders(2, external_ids.len())
    );
    let values = std::iter::once(provider_id.0.as_str()).chain(external_ids.iter().map(String::as_str));
    conn.execute(&sql, params_from_iter(values))
}

/// Deletes every email of a provider.
pub fn delete_for_provider(conn: &Connection, provider_id: &ProviderId) -> Result<usize> {
    conn.execute("DELETE FROM emails WHERE provider_id = ?1", [&provider_id.0])
}

/// Lists a provider's emails, newest first.
pub fn list_by_provider(conn: &Connection, provider_id: &ProviderId) -> Result<Vec<Email>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT
            external_id, thread_id, message_id, from_address, from_name,
            to_addresses, cc_addresses, subject, body_text, body_html,
            snippet, date, is_read, is_starred, is_draft, labels
        FROM emails
        WHERE provider_id = ?1
        ORDER BY date DESC, external_id
        "#,
    )?;
    let rows = stmt.query_map([&provider_id.0], row_to_email)?;
    rows.collect()
}

/// Counts a provider's emails.
pub fn count_by_provider(conn: &Connection, provider_id: &ProviderId) -> Result<u32> {
    conn.query_row(
        "SELECT COUNT(*) FROM emails WHERE provider_id = ?1",
        [&provider_id.0],
        |row| row.get(0),
    )
}

fn row_to_email(row: &Row<'_>) -> Result<Email> {
    let to_json: String = row.get(5)?;
    let cc_json: String = row.get(6)?;
    let labels_json: String = row.get(15)?;

    Ok(Email {
        external_id: row.get(0)?,
        thread_id: row.get(1)?,
        message_id: row.get(2)?,
        from: Address {
            email: row.get(3)?,
            name: row.get(4)?,
        },
        to: serde_json::from_str(&to_json).unwrap_or_default(),
        cc: serde_json::from_str(&cc_json).unwrap_or_default(),
        subject: row.get(7)?,
        body_text: row.get(8)?,
        body_html: row.get(9)?,
        snippet: row.get::<_, Option<String>>(10)?.unwrap_or_default(),
        date: parse_ts(row.get(11)?).unwrap_or_else(Utc::now),
        is_read: row.get(12)?,
        is_starred: row.get(13)?,
        is_draft: row.get(14)?,
        labels: serde_json::from_str(&labels_json).unwrap_or_default(),
    })
}
