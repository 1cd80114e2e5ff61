//! Email domain types.
//!
//! Represents individual email messages, folders and drafts as the engine
//! persists them. Every record is keyed by the provider-scoped external ID.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An individual email message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Email {
    /// Identifier assigned by the provider (Gmail message ID, Graph ID, `folder:uid`).
    pub external_id: String,
    /// Provider thread (conversation) identifier.
    pub thread_id: String,
    /// RFC 5322 Message-ID header.
    pub message_id: Option<String>,
    /// Sender address.
    pub from: Address,
    /// Primary recipient addresses.
    pub to: Vec<Address>,
    /// Carbon copy recipient addresses.
    pub cc: Vec<Address>,
    /// Email subject line.
    pub subject: Option<String>,
    /// Plain text body content.
    pub body_text: Option<String>,
    /// HTML body content.
    pub body_html: Option<String>,
    /// Short preview of the email content.
    pub snippet: String,
    /// Date and time the email was sent.
    pub date: DateTime<Utc>,
    /// Whether the email has been read.
    pub is_read: bool,
    /// Whether the email is starred/flagged.
    pub is_starred: bool,
    /// Whether this is a draft.
    pub is_draft: bool,
    /// Provider labels or folders this email sits in.
    pub labels: Vec<String>,
}

impl Email {
    /// Creates an unread message with identity fields only, dated now.
    pub fn new(
        external_id: impl Into<String>,
        thread_id: impl Into<String>,
        from: impl Into<String>,
    ) -> Self {
        Self {
            external_id: external_id.into(),
            thread_id: thread_id.into(),
            message_id: None,
            from: Address::new(from),
            to: Vec::new(),
            cc: Vec::new(),
            subject: None,
            body_text: None,
            body_html: None,
            snippet: String::new(),
            date: Utc::now(),
            is_read: false,
            is_starred: false,
            is_draft: false,
            labels: Vec::new(),
        }
    }
}

/// An email address with optional display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    /// Email address.
    pub email: String,
    /// Display name (e.g., "John Doe").
    pub name: Option<String>,
}

impl Address {
    /// Creates a new address with just an email.
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: None,
        }
    }

    /// Creates a new address with email and display name.
    pub fn with_name(email: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: Some(name.into()),
        }
    }

    /// Parses a header value like `"Jane Doe" <jane@example.com>`.
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        if let (Some(start), Some(end)) = (value.find('<'), value.rfind('>')) {
            if start < end {
                let email = value[start + 1..end].trim().to_string();
                let name = value[..start].trim().trim_matches('"').trim().to_string();
                return Self {
                    email,
                    name: (!name.is_empty()).then_some(name),
                };
            }
        }
        Self::new(value)
    }

    /// Parses a comma-separated list of addresses.
    pub fn parse_list(value: &str) -> Vec<Self> {
        value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Self::parse)
            .collect()
    }

    /// Formats as an RFC 5322 mailbox.
    pub fn to_header_value(&self) -> String {
        match &self.name {
            Some(name) => format!("\"{}\" <{}>", name.replace('"', ""), self.email),
            None => self.email.clone(),
        }
    }
}

/// A folder or label as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
    /// Provider-side identifier.
    pub external_id: String,
    /// Display name.
    pub name: String,
    /// Whether this is a system folder (INBOX, SENT, etc.).
    pub is_system: bool,
}

impl Folder {
    pub fn new(external_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            name: name.into(),
            is_system: false,
        }
    }
}

/// A draft stored on the provider side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    /// Provider-side draft identifier.
    pub id: String,
    /// The draft message, when the provider returns it.
    pub message: Option<Email>,
}
