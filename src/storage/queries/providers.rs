//! Provider configuration queries.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{contacts, emails, events, folders, opt_ts, parse_ts, ts};
use crate::domain::{
    Capabilities, EncryptedSecret, ProviderConfig, ProviderId, ProviderType, SchedulingState,
    ServerSettings, StoredCredentials, SyncCursors, TenantId,
};
use crate::storage::database::{Database, DatabaseError, Result};

const COLUMNS: &str = r#"
    id, tenant_id, provider_type, email, display_name,
    supports_email, supports_calendar, supports_contacts,
    default_email, default_calendar, default_contacts, is_active,
    access_token_ciphertext, access_token_iv, refresh_token_ciphertext, refresh_token_iv,
    token_expires_at, login_credentials, server_settings,
    last_synced_at, last_activity_at, error_streak, throttle_streak, next_sync_at, last_error,
    email_cursor, calendar_cursor, contacts_cursor, created_at, updated_at
"#;

const INSERT: &str = r#"
    INSERT INTO provider_configs (
        id, tenant_id, provider_type, email, display_name,
        supports_email, supports_calendar, supports_contacts,
        default_email, default_calendar, default_contacts, is_active,
        access_token_ciphertext, access_token_iv, refresh_token_ciphertext, refresh_token_iv,
        token_expires_at, login_credentials, server_settings,
        last_synced_at, last_activity_at, error_streak, throttle_streak, next_sync_at, last_error,
        email_cursor, calendar_cursor, contacts_cursor, created_at, updated_at
    ) VALUES (
        ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
        ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20,
        ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30
    )
"#;

/// Never inserts, so a write racing a delete cannot bring the row back.
const UPDATE: &str = r#"
    UPDATE provider_configs SET
        tenant_id = ?2, provider_type = ?3, email = ?4, display_name = ?5,
        supports_email = ?6, supports_calendar = ?7, supports_contacts = ?8,
        default_email = ?9, default_calendar = ?10, default_contacts = ?11, is_active = ?12,
        access_token_ciphertext = ?13, access_token_iv = ?14,
        refresh_token_ciphertext = ?15, refresh_token_iv = ?16,
        token_expires_at = ?17, login_credentials = ?18, server_settings = ?19,
        last_synced_at = ?20, last_activity_at = ?21, error_streak = ?22,
        throttle_streak = ?23, next_sync_at = ?24, last_error = ?25,
        email_cursor = ?26, calendar_cursor = ?27, contacts_cursor = ?28,
        created_at = ?29, updated_at = ?30
    WHERE id = ?1
"#;

/// Inserts a newly connected provider. Fails if the ID or the
/// tenant/type/email identity is taken.
pub async fn insert(db: &Database, config: &ProviderConfig) -> Result<()> {
    let config = config.clone();
    db.with_conn(move |conn| write(conn, INSERT, &config).map(|_| ()))
        .await
}

/// Replaces every column of an existing provider. Returns `false` when the
/// provider no longer exists.
pub async fn update(db: &Database, config: &ProviderConfig) -> Result<bool> {
    let config = config.clone();
    db.with_conn(move |conn| Ok(write(conn, UPDATE, &config)? > 0))
        .await
}

/// Fails with [`DatabaseError::ProviderRemoved`] unless the provider exists.
pub(crate) fn ensure_exists(conn: &Connection, id: &ProviderId) -> Result<()> {
    let found = conn
        .query_row("SELECT 1 FROM provider_configs WHERE id = ?1", [&id.0], |_| Ok(()))
        .optional()?;
    found.ok_or_else(|| DatabaseError::ProviderRemoved(id.0.clone()))
}

fn write(conn: &Connection, sql: &str, config: &ProviderConfig) -> Result<usize> {
    let (access, refresh, expires_at, login) = match &config.credentials {
        Some(StoredCredentials::OAuth {
            access_token,
            refresh_token,
            expires_at,
        }) => (
            Some(access_token.clone()),
            refresh_token.clone(),
            *expires_at,
            None,
        ),
        Some(password @ StoredCredentials::Password { .. }) => {
            (None, None, None, Some(serde_json::to_string(password)?))
        }
        None => (None, None, None, None),
    };
    let server = config
        .server
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    let changed = conn.execute(
        sql,
        params![
            config.id.0,
            config.tenant_id.0,
            config.provider_type.as_str(),
            config.email,
            config.display_name,
            config.capabilities.email,
            config.capabilities.calendar,
            config.capabilities.contacts,
            config.default_for.email,
            config.default_for.calendar,
            config.default_for.contacts,
            config.is_active,
            access.as_ref().map(|s| s.ciphertext.as_str()),
            access.as_ref().map(|s| s.iv.as_str()),
            refresh.as_ref().map(|s| s.ciphertext.as_str()),
            refresh.as_ref().map(|s| s.iv.as_str()),
            opt_ts(expires_at),
            login,
            server,
            opt_ts(config.schedule.last_synced_at),
            opt_ts(config.schedule.last_activity_at),
            config.schedule.error_streak,
            config.schedule.throttle_streak,
            opt_ts(config.schedule.next_sync_at),
            config.schedule.last_error,
            config.cursors.email,
            config.cursors.calendar,
            config.cursors.contacts,
            ts(config.created_at),
            ts(config.updated_at),
        ],
    )?;
    Ok(changed)
}

/// Retrieves a provider by ID.
pub async fn get_by_id(db: &Database, id: &ProviderId) -> Result<Option<ProviderConfig>> {
    let id = id.clone();
    db.with_conn(move |conn| {
        let sql = format!("SELECT {COLUMNS} FROM provider_configs WHERE id = ?1");
        Ok(conn.query_row(&sql, [&id.0], row_to_config).optional()?)
    })
    .await
}

/// Retrieves a provider by its tenant/type/email identity.
pub async fn find_by_identity(
    db: &Database,
    tenant_id: &TenantId,
    provider_type: ProviderType,
    email: &str,
) -> Result<Option<ProviderConfig>> {
    let tenant_id = tenant_id.clone();
    let email = email.to_string();
    db.with_conn(move |conn| {
        let sql = format!(
            "SELECT {COLUMNS} FROM provider_configs
             WHERE tenant_id = ?1 AND provider_type = ?2 AND email = ?3"
        );
        Ok(conn
            .query_row(
                &sql,
                params![tenant_id.0, provider_type.as_str(), email],
                row_to_config,
            )
            .optional()?)
    })
    .await
}

/// Lists every provider of a tenant, oldest first.
pub async fn list_by_tenant(db: &Database, tenant_id: &TenantId) -> Result<Vec<ProviderConfig>> {
    let tenant_id = tenant_id.clone();
    db.with_conn(move |conn| {
        let sql = format!(
            "SELECT {COLUMNS} FROM provider_configs WHERE tenant_id = ?1 ORDER BY created_at, id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([&tenant_id.0], row_to_config)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    })
    .await
}

/// Lists active providers whose `next_sync_at` has passed, most overdue first.
pub async fn load_due(db: &Database, now: DateTime<Utc>) -> Result<Vec<ProviderConfig>> {
    db.with_conn(move |conn| {
        let sql = format!(
            "SELECT {COLUMNS} FROM provider_configs
             WHERE is_active = 1 AND next_sync_at IS NOT NULL AND next_sync_at <= ?1
             ORDER BY next_sync_at, id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([ts(now)], row_to_config)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    })
    .await
}

/// Deletes a provider together with every record synced for it. Record
/// tables also cascade on the foreign key.
pub async fn delete(db: &Database, id: &ProviderId) -> Result<bool> {
    let id = id.clone();
    db.transaction(move |tx| {
        emails::delete_for_provider(tx, &id)?;
        folders::delete_for_provider(tx, &id)?;
        events::delete_for_provider(tx, &id)?;
        contacts::delete_for_provider(tx, &id)?;
        let removed = tx.execute("DELETE FROM provider_configs WHERE id = ?1", [&id.0])?;
        Ok(removed > 0)
    })
    .await
}

fn json_column<T: serde::de::DeserializeOwned>(
    idx: usize,
    value: Option<String>,
) -> rusqlite::Result<Option<T>> {
    value
        .map(|raw| {
            serde_json::from_str(&raw)
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
        })
        .transpose()
}

fn secret_pair(ciphertext: Option<String>, iv: Option<String>) -> Option<EncryptedSecret> {
    match (ciphertext, iv) {
        (Some(ciphertext), Some(iv)) => Some(EncryptedSecret { ciphertext, iv }),
        _ => None,
    }
}

fn row_to_config(row: &Row<'_>) -> rusqlite::Result<ProviderConfig> {
    let type_name: String = row.get(2)?;
    let provider_type = ProviderType::parse(&type_name).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            Type::Text,
            format!("unknown provider type {type_name}").into(),
        )
    })?;

    let access = secret_pair(row.get(12)?, row.get(13)?);
    let refresh = secret_pair(row.get(14)?, row.get(15)?);
    let login: Option<StoredCredentials> = json_column(17, row.get(17)?)?;
    let credentials = match (access, login) {
        (Some(access_token), _) => Some(StoredCredentials::OAuth {
            access_token,
            refresh_token: refresh,
            expires_at: parse_ts(row.get(16)?),
        }),
        (None, login) => login,
    };

    Ok(ProviderConfig {
        id: ProviderId(row.get(0)?),
        tenant_id: TenantId(row.get(1)?),
        provider_type,
        email: row.get(3)?,
        display_name: row.get(4)?,
        capabilities: Capabilities {
            email: row.get(5)?,
            calendar: row.get(6)?,
            contacts: row.get(7)?,
        },
        default_for: Capabilities {
            email: row.get(8)?,
            calendar: row.get(9)?,
            contacts: row.get(10)?,
        },
        is_active: row.get(11)?,
        credentials,
        server: json_column::<ServerSettings>(18, row.get(18)?)?,
        schedule: SchedulingState {
            last_synced_at: parse_ts(row.get(19)?),
            last_activity_at: parse_ts(row.get(20)?),
            error_streak: row.get(21)?,
            throttle_streak: row.get(22)?,
            next_sync_at: parse_ts(row.get(23)?),
            last_error: row.get(24)?,
        },
        cursors: SyncCursors {
            email: row.get(25)?,
            calendar: row.get(26)?,
            contacts: row.get(27)?,
        },
        created_at: parse_ts(row.get(28)?).unwrap_or_else(Utc::now),
        updated_at: parse_ts(row.get(29)?).unwrap_or_else(Utc::now),
    })
}
