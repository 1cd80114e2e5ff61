//! Mailbox adapter trait definition.
//!
//! This module defines the [`MailboxAdapter`] trait which abstracts over the
//! supported mailbox backends (Gmail/Google APIs, Microsoft Graph, IMAP/SMTP with
//! CalDAV/CardDAV). The sync executor drives every provider through this one
//! contract and never sees provider wire formats.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Address, CalendarEvent, Contact, Draft, Email, Folder, ProviderType, SyncType};
use crate::storage::{Login, Secret};

/// Result type alias for adapter operations.
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Raw, unclassified failures surfaced by adapters.
///
/// Adapters never decide whether an error is retryable; they report what the
/// provider said and leave the decision to the error classifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// Non-success HTTP response.
    #[error("HTTP {status}: {message}")]
    Http {
        /// Response status code.
        status: u16,
        /// Provider error code from the response body (`rateLimitExceeded`,
        /// `ErrorThrottled`, `invalid_grant`, ...).
        code: Option<String>,
        /// Error message or raw body.
        message: String,
        /// Raw `Retry-After` header value.
        retry_after: Option<String>,
    },

    /// Connection-level failure (DNS, TCP, TLS, reset).
    #[error("network error: {0}")]
    Network(String),

    /// A call exceeded its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// IMAP or SMTP server rejected the static login.
    #[error("login rejected: {0}")]
    LoginRejected(String),

    /// IMAP/SMTP/DAV protocol-level failure.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The stored sync cursor can no longer be used.
    #[error("sync cursor invalidated: {0}")]
    CursorInvalidated(String),

    /// Response could not be decoded.
    #[error("parse error: {0}")]
    Parse(String),

    /// Requested resource was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid request or parameters.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Operation not available for this provider or configuration.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Parse(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

/// Decrypted credential handed to an adapter for the duration of one job.
#[derive(Debug, Clone)]
pub enum Credential {
    /// OAuth access token for Google and Microsoft.
    Bearer(Secret),
    /// Static logins for a generic server.
    Logins {
        imap: Login,
        /// Falls back to the IMAP login when absent.
        smtp: Option<Login>,
        /// Falls back to the IMAP login when absent.
        dav: Option<Login>,
    },
}

/// Account identity reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub email: String,
    pub display_name: Option<String>,
}

/// Parameters for listing threads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListThreadsParams {
    /// Folder or label to list. Defaults to the inbox.
    pub folder: Option<String>,
    /// Maximum number of threads to return.
    pub max_results: u32,
    /// Opaque token from a previous page.
    pub page_token: Option<String>,
}

impl Default for ListThreadsParams {
    fn default() -> Self {
        Self {
            folder: None,
            max_results: 50,
            page_token: None,
        }
    }
}

/// Lightweight thread listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadSummary {
    pub thread_id: String,
    pub subject: Option<String>,
    pub snippet: String,
    pub from: Option<Address>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub unread: bool,
}

/// One page of threads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadPage {
    pub threads: Vec<ThreadSummary>,
    pub next_page_token: Option<String>,
}

/// An email to be sent or saved as a draft.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingEmail {
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub subject: String,
    pub body_text: String,
    pub body_html: Option<String>,
    /// Message-ID this email replies to.
    pub in_reply_to: Option<String>,
    /// Provider thread to attach the message to, when supported.
    pub thread_id: Option<String>,
}

impl OutgoingEmail {
    /// Renders a minimal RFC 5322 message.
    pub fn to_rfc822(&self, from: &str) -> String {
        let join = |addrs: &[Address]| {
            addrs
                .iter()
                .map(Address::to_header_value)
                .collect::<Vec<_>>()
                .join(", ")
        };

        let mut message = String::new();
        message.push_str(&format!("From: {}\r\n", from));
        message.push_str(&format!("To: {}\r\n", join(&self.to)));
        if !self.cc.is_empty() {
            message.push_str(&format!("Cc: {}\r\n", join(&self.cc)));
        }
        if !self.bcc.is_empty() {
            message.push_str(&format!("Bcc: {}\r\n", join(&self.bcc)));
        }
        message.push_str(&format!("Subject: {}\r\n", self.subject));
        if let Some(in_reply_to) = &self.in_reply_to {
            message.push_str(&format!("In-Reply-To: {}\r\n", in_reply_to));
            message.push_str(&format!("References: {}\r\n", in_reply_to));
        }
        message.push_str("MIME-Version: 1.0\r\n");
        match &self.body_html {
            Some(html) => {
                message.push_str("Content-Type: text/html; charset=utf-8\r\n\r\n");
                message.push_str(html);
            }
            None => {
                message.push_str("Content-Type: text/plain; charset=utf-8\r\n\r\n");
                message.push_str(&self.body_text);
            }
        }
        message
    }
}

/// Parameters for a `sync_*` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncParams {
    pub sync_type: SyncType,
    /// Resume point for incremental syncs. Ignored by full syncs.
    pub cursor: Option<String>,
    /// Upper bound on items fetched by a full sync.
    pub max_items: Option<u32>,
}

impl SyncParams {
    pub fn incremental(cursor: Option<String>) -> Self {
        Self {
            sync_type: SyncType::Incremental,
            cursor,
            max_items: None,
        }
    }

    pub fn full(max_items: Option<u32>) -> Self {
        Self {
            sync_type: SyncType::Full,
            cursor: None,
            max_items,
        }
    }

    /// The cursor to resume from, or `None` when the call must start over.
    pub fn resume_cursor(&self) -> Option<&str> {
        match self.sync_type {
            SyncType::Incremental => self.cursor.as_deref(),
            SyncType::Full => None,
        }
    }
}

/// Items changed since the input cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncBatch<T> {
    /// Created or updated items.
    pub items: Vec<T>,
    /// External IDs removed on the provider side.
    pub deleted: Vec<String>,
    /// Cursor to resume from next time.
    pub next_cursor: Option<String>,
}

impl<T> SyncBatch<T> {
    pub fn new(items: Vec<T>, deleted: Vec<String>, next_cursor: Option<String>) -> Self {
        Self {
            items,
            deleted,
            next_cursor,
        }
    }
}

impl<T> Default for SyncBatch<T> {
    fn default() -> Self {
        Self::new(Vec::new(), Vec::new(), None)
    }
}

/// Uniform mailbox contract implemented by every provider variant.
///
/// Implementations perform network calls only. They never persist anything
/// and surface raw [`ProviderError`]s.
#[async_trait]
pub trait MailboxAdapter: Send + Sync {
    /// Returns the provider type.
    fn provider_type(&self) -> ProviderType;

    /// Fetches the mailbox identity.
    async fn get_user_info(&self) -> Result<UserInfo>;

    /// Lists threads in a folder.
    async fn list_threads(&self, params: &ListThreadsParams) -> Result<ThreadPage>;

    /// Fetches one message by provider ID.
    async fn get_message(&self, id: &str) -> Result<Email>;

    /// Sends an email.
    ///
    /// # Returns
    ///
    /// The provider-assigned message ID, when the provider reports one.
    async fn send_email(&self, email: &OutgoingEmail) -> Result<String>;

    /// Syncs mail.
    ///
    /// With [`SyncType::Incremental`] and a cursor, returns exactly the messages
    /// changed since the cursor plus a new cursor. [`SyncType::Full`] ignores the
    /// cursor and pages from the start, bounded by `max_items`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::CursorInvalidated`] when the cursor is too old
    /// or otherwise unusable.
    async fn sync_emails(&self, params: &SyncParams) -> Result<SyncBatch<Email>>;

    /// Lists folders or labels.
    async fn get_labels(&self) -> Result<Vec<Folder>>;

    /// Creates a folder or label.
    async fn create_label(&self, name: &str) -> Result<Folder>;

    async fn mark_as_read(&self, ids: &[String]) -> Result<()>;

    async fn mark_as_unread(&self, ids: &[String]) -> Result<()>;

    async fn create_draft(&self, email: &OutgoingEmail) -> Result<Draft>;

    async fn get_draft(&self, id: &str) -> Result<Draft>;

    /// Sends a saved draft and returns the sent message ID.
    async fn send_draft(&self, id: &str) -> Result<String>;

    /// Total number of messages in the mailbox.
    async fn get_email_count(&self) -> Result<u64>;

    /// Health check. Side-effect free, bounded by a timeout, never errors.
    async fn test_connection(&self) -> bool;

    /// Canonicalizes caller-supplied message IDs for this provider.
    fn normalize_ids(&self, ids: &[String]) -> Vec<String>;

    /// Syncs calendar events.
    async fn sync_calendar(&self, params: &SyncParams) -> Result<SyncBatch<CalendarEvent>>;

    /// Syncs contacts.
    async fn sync_contacts(&self, params: &SyncParams) -> Result<SyncBatch<Contact>>;
}

/// Trims, drops empties and deduplicates IDs in order, mapping each survivor.
pub(crate) fn normalize_with(ids: &[String], map: impl Fn(&str) -> String) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    ids.iter()
        .map(|id| id.trim())
        .filter(|id| !id.is_empty())
        .map(map)
        .filter(|id| seen.insert(id.clone()))
        .collect()
}
