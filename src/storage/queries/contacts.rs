//! Contact database queries.
//!
//! Address-book entries synced from the provider, keyed by external ID.

use chrono::Utc;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Result};

use super::{placeholders, ts};
use crate::domain::{Contact, ProviderId, TenantId};

/// Inserts or updates a contact. Returns `true` when the row is new.
pub fn upsert(
    conn: &Connection,
    tenant_id: &TenantId,
    provider_id: &ProviderId,
    contact: &Contact,
) -> Result<bool> {
    let existed = get_by_external_id(conn, provider_id, &contact.external_id)?.is_some();

    conn.execute(
        "INSERT INTO contacts (provider_id, tenant_id, external_id, display_name, emails, phones, organization, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(provider_id, external_id) DO UPDATE SET
             display_name = excluded.display_name,
             emails = excluded.emails,
             phones = excluded.phones,
             organization = excluded.organization,
             updated_at = excluded.updated_at",
        params![
            provider_id.0,
            tenant_id.0,
            contact.external_id,
            contact.display_name,
            serde_json::to_string(&contact.emails).unwrap_or_default(),
            serde_json::to_string(&contact.phones).unwrap_or_default(),
            contact.organization,
            ts(Utc::now()),
        ],
    )?;
    Ok(!existed)
}

/// Gets a contact by its provider-scoped external ID.
pub fn get_by_external_id(
    conn: &Connection,
    provider_id: &ProviderId,
    external_id: &str,
) -> Result<Option<Contact>> {
    conn.query_row(
        "SELECT external_id, display_name, emails, phones, organization
         FROM contacts WHERE provider_id = ?1 AND external_id = ?2",
        params![provider_id.0, external_id],
        row_to_contact,
    )
    .optional()
}

/// Lists a provider's contacts by name.
pub fn list_by_provider(conn: &Connection, provider_id: &ProviderId) -> Result<Vec<Contact>> {
    let mut stmt = conn.prepare(
        "SELECT external_id, display_name, emails, phones, organization
         FROM contacts WHERE provider_id = ?1 ORDER BY display_name, external_id",
    )?;
    let rows = stmt.query_map([&provider_id.0], row_to_contact)?;
    rows.collect()
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
        "DELETE FROM contacts WHERE provider_id = ?1 AND external_id IN ({})",
        placeholders(2, external_ids.len())
    );
    let values = std::iter::once(provider_id.0.as_str()).chain(external_ids.iter().map(String::as_str));
    conn.execute(&sql, params_from_iter(values))
}

pub fn delete_for_provider(conn: &Connection, provider_id: &ProviderId) -> Result<usize> {
    conn.execute("DELETE FROM contacts WHERE provider_id = ?1", [&provider_id.0])
}

fn row_to_contact(row: &rusqlite::Row) -> Result<Contact> {
    let emails: String = row.get(2)?;
    let phones: String = row.get(3)?;
    Ok(Contact {
        external_id: row.get(0)?,
        display_name: row.get(1)?,
        emails: serde_json::from_str(&emails).unwrap_or_default(),
        phones: serde_json::from_str(&phones).unwrap_or_default(),
        organization: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::queries::test_conn;

    fn make_contact(id: &str, email: &str) -> Contact {
        let mut contact = Contact::new(id);
        contact.emails.push(email.to_string());
        contact
    }

    #[test]
    fn upsert_and_get() {
        let conn = test_conn();
        let provider = ProviderId::from("p1");
        let contact = make_contact("people/c1", "test@example.com");

        assert!(upsert(&conn, &TenantId::from("t1"), &provider, &contact).unwrap());
        let fetched = get_by_external_id(&conn, &provider, "people/c1").unwrap().unwrap();
        assert_eq!(fetched, contact);
    }

    #[test]
    fn upsert_is_idempotent() {
        let conn = test_conn();
        let tenant = TenantId::from("t1");
        let provider = ProviderId::from("p1");
        let contact = make_contact("people/c1", "test@example.com");

        upsert(&conn, &tenant, &provider, &contact).unwrap();
        assert!(!upsert(&conn, &tenant, &provider, &contact).unwrap());
        assert_eq!(list_by_provider(&conn, &provider).unwrap().len(), 1);
    }

    #[test]
    fn delete_contacts() {
        let conn = test_conn();
        let tenant = TenantId::from("t1");
        let provider = ProviderId::from("p1");
        upsert(&conn, &tenant, &provider, &make_contact("a", "a@example.com")).unwrap();
        upsert(&conn, &tenant, &provider, &make_contact("b", "b@example.com")).unwrap();

        delete_by_external_ids(&conn, &provider, &["a".to_string()]).unwrap();
        assert!(get_by_external_id(&conn, &provider, "a").unwrap().is_none());
        assert_eq!(delete_for_provider(&conn, &provider).unwrap(), 1);
    }
}
