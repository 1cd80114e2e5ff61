//! Calendar event domain types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A calendar event synced from the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarEvent {
    /// Identifier assigned by the provider (event ID, iCalendar UID).
    pub external_id: String,
    /// Event title.
    pub summary: Option<String>,
    /// Free-form description.
    pub description: Option<String>,
    /// Location text.
    pub location: Option<String>,
    /// Start time (midnight UTC for all-day events).
    pub starts_at: Option<DateTime<Utc>>,
    /// End time.
    pub ends_at: Option<DateTime<Utc>>,
    /// Whether the event spans whole days.
    pub all_day: bool,
    /// Provider status (`confirmed`, `tentative`, ...).
    pub status: Option<String>,
}

impl CalendarEvent {
    /// Creates an event with just an identifier.
    pub fn new(external_id: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            summary: None,
            description: None,
            location: None,
            starts_at: None,
            ends_at: None,
            all_day: false,
            status: None,
        }
    }
}
