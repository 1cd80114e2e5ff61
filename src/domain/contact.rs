//! Contact domain types.
//!
//! Represents address-book entries synced from Google People, Graph contacts
//! or a CardDAV collection.

use serde::{Deserialize, Serialize};

/// A contact synced from the provider's address book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    /// Identifier assigned by the provider (resource name, Graph ID, vCard href).
    pub external_id: String,
    /// Display name.
    pub display_name: Option<String>,
    /// Email addresses, primary first.
    pub emails: Vec<String>,
    /// Phone numbers.
    pub phones: Vec<String>,
    /// Organization name.
    pub organization: Option<String>,
}

impl Contact {
    /// Creates a contact with just an identifier.
    pub fn new(external_id: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            display_name: None,
            emails: Vec::new(),
            phones: Vec::new(),
            organization: None,
        }
    }

    /// Returns the display name, falling back to the primary email.
    pub fn label(&self) -> &str {
        self.display_name
            .as_deref()
            .or_else(|| self.emails.first().map(String::as_str))
            .unwrap_or(&self.external_id)
    }
}
