//! SQL schema definitions as const strings.
//!
//! Record tables are keyed by `(provider_id, external_id)` so re-running a
//! sync upserts instead of duplicating, and reference `provider_configs`
//! so deleting a provider removes its records and blocks late writes.

/// SQL to create the provider configuration table.
///
/// OAuth tokens keep the two-column `ciphertext`/`iv` layout. Generic logins
/// are stored as a JSON document of encrypted pairs in `login_credentials`.
pub const CREATE_PROVIDER_CONFIGS: &str = r#"
CREATE TABLE IF NOT EXISTS provider_configs (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    provider_type TEXT NOT NULL,
    email TEXT NOT NULL,
    display_name TEXT,
    supports_email INTEGER NOT NULL DEFAULT 1,
    supports_calendar INTEGER NOT NULL DEFAULT 0,
    supports_contacts INTEGER NOT NULL DEFAULT 0,
    default_email INTEGER NOT NULL DEFAULT 0,
    default_calendar INTEGER NOT NULL DEFAULT 0,
    default_contacts INTEGER NOT NULL DEFAULT 0,
    is_active INTEGER NOT NULL DEFAULT 1,
    access_token_ciphertext TEXT,
    access_token_iv TEXT,
    refresh_token_ciphertext TEXT,
    refresh_token_iv TEXT,
    token_expires_at TEXT,
    login_credentials TEXT,
    server_settings TEXT,
    last_synced_at TEXT,
    last_activity_at TEXT,
    error_streak INTEGER NOT NULL DEFAULT 0,
    throttle_streak INTEGER NOT NULL DEFAULT 0,
    next_sync_at TEXT,
    last_error TEXT,
    email_cursor TEXT,
    calendar_cursor TEXT,
    contacts_cursor TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(tenant_id, provider_type, email)
)
"#;

/// SQL to create provider indexes.
pub const CREATE_PROVIDER_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_providers_tenant ON provider_configs(tenant_id);
CREATE INDEX IF NOT EXISTS idx_providers_due ON provider_configs(is_active, next_sync_at)
"#;

/// SQL to create the emails table.
pub const CREATE_EMAILS: &str = r#"
CREATE TABLE IF NOT EXISTS emails (
    provider_id TEXT NOT NULL REFERENCES provider_configs(id) ON DELETE CASCADE,
    tenant_id TEXT NOT NULL,
    external_id TEXT NOT NULL,
    thread_id TEXT NOT NULL,
    message_id TEXT,
    from_address TEXT NOT NULL,
    from_name TEXT,
    to_addresses TEXT NOT NULL,
    cc_addresses TEXT NOT NULL,
    subject TEXT,
    body_text TEXT,
    body_html TEXT,
    snippet TEXT,
    date TEXT NOT NULL,
    is_read INTEGER NOT NULL DEFAULT 0,
    is_starred INTEGER NOT NULL DEFAULT 0,
    is_draft INTEGER NOT NULL DEFAULT 0,
    labels TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(provider_id, external_id)
)
"#;

/// SQL to create email indexes.
pub const CREATE_EMAIL_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_emails_tenant ON emails(tenant_id);
CREATE INDEX IF NOT EXISTS idx_emails_thread ON emails(provider_id, thread_id);
CREATE INDEX IF NOT EXISTS idx_emails_date ON emails(date DESC)
"#;

/// SQL to create the folders table.
pub const CREATE_FOLDERS: &str = r#"
CREATE TABLE IF NOT EXISTS folders (
    provider_id TEXT NOT NULL REFERENCES provider_configs(id) ON DELETE CASCADE,
    external_id TEXT NOT NULL,
    name TEXT NOT NULL,
    is_system INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL,
    UNIQUE(provider_id, external_id)
)
"#;

/// SQL to create the calendar events table.
pub const CREATE_CALENDAR_EVENTS: &str = r#"
CREATE TABLE IF NOT EXISTS calendar_events (
    provider_id TEXT NOT NULL REFERENCES provider_configs(id) ON DELETE CASCADE,
    tenant_id TEXT NOT NULL,
    external_id TEXT NOT NULL,
    summary TEXT,
    description TEXT,
    location TEXT,
    starts_at TEXT,
    ends_at TEXT,
    all_day INTEGER NOT NULL DEFAULT 0,
    status TEXT,
    updated_at TEXT NOT NULL,
    UNIQUE(provider_id, external_id)
)
"#;

/// SQL to create the contacts table.
pub const CREATE_CONTACTS: &str = r#"
CREATE TABLE IF NOT EXISTS contacts (
    provider_id TEXT NOT NULL REFERENCES provider_configs(id) ON DELETE CASCADE,
    tenant_id TEXT NOT NULL,
    external_id TEXT NOT NULL,
    display_name TEXT,
    emails TEXT NOT NULL,
    phones TEXT NOT NULL,
    organization TEXT,
    updated_at TEXT NOT NULL,
    UNIQUE(provider_id, external_id)
)
"#;

/// Returns all schema creation statements in order.
pub fn all_migrations() -> Vec<&'static str> {
    vec![
        CREATE_PROVIDER_CONFIGS,
        CREATE_PROVIDER_INDEXES,
        CREATE_EMAILS,
        CREATE_EMAIL_INDEXES,
        CREATE_FOLDERS,
        CREATE_CALENDAR_EVENTS,
        CREATE_CONTACTS,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_tables_are_keyed_by_external_id() {
        for sql in [CREATE_EMAILS, CREATE_FOLDERS, CREATE_CALENDAR_EVENTS, CREATE_CONTACTS] {
            assert!(sql.contains("UNIQUE(provider_id, external_id)"));
        }
    }

    #[test]
    fn record_tables_cascade_from_providers() {
        for sql in [CREATE_EMAILS, CREATE_FOLDERS, CREATE_CALENDAR_EVENTS, CREATE_CONTACTS] {
            assert!(sql.contains("REFERENCES provider_configs(id) ON DELETE CASCADE"));
        }
    }

    #[test]
    fn provider_table_keeps_ciphertext_iv_pairs() {
        for column in [
            "access_token_ciphertext",
            "access_token_iv",
            "refresh_token_ciphertext",
            "refresh_token_iv",
        ] {
            assert!(CREATE_PROVIDER_CONFIGS.contains(column));
        }
    }

    #[test]
    fn statements_use_if_not_exists() {
        for sql in all_migrations() {
            assert!(sql.contains("IF NOT EXISTS"));
        }
    }
}
