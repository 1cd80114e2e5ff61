//! Sync job types.
//!
//! A [`SyncJob`] is the ephemeral unit of work that flows from the scheduler
//! through a queue lane to exactly one worker. It is never persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Capability, JobId, ProviderId, SyncCursors, TenantId};

/// Whether a sync resumes from the stored cursor or starts over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncType {
    Incremental,
    Full,
}

/// Queue lane a job is dispatched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Self::High, Self::Normal, Self::Low];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What caused a job to be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Scheduled,
    Manual,
}

/// One unit of sync work for a single provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: JobId,
    pub provider_id: ProviderId,
    pub tenant_id: TenantId,
    pub sync_type: SyncType,
    pub priority: Priority,
    /// Capabilities to sync, in order.
    pub scopes: Vec<Capability>,
    /// Cursor snapshot taken when the job was built.
    pub cursors: SyncCursors,
    /// Attempts on the scope being synced, local retries included. Zero
    /// until an executor picks the job up.
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
    pub trigger: Trigger,
}

/// Outcome of syncing one capability.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScopeOutcome {
    pub synced: usize,
    pub new_items: usize,
    pub deleted: usize,
    pub next_cursor: Option<String>,
}

/// Transient result of one executed job.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SyncResult {
    pub emails: Option<ScopeOutcome>,
    pub events: Option<ScopeOutcome>,
    pub contacts: Option<ScopeOutcome>,
    pub error: Option<String>,
}

impl SyncResult {
    pub fn outcome(&self, scope: Capability) -> Option<&ScopeOutcome> {
        match scope {
            Capability::Email => self.emails.as_ref(),
            Capability::Calendar => self.events.as_ref(),
            Capability::Contacts => self.contacts.as_ref(),
        }
    }

    pub fn record(&mut self, scope: Capability, outcome: ScopeOutcome) {
        match scope {
            Capability::Email => self.emails = Some(outcome),
            Capability::Calendar => self.events = Some(outcome),
            Capability::Contacts => self.contacts = Some(outcome),
        }
    }

    /// Total items written across all scopes.
    pub fn total_synced(&self) -> usize {
        Capability::ALL
            .iter()
            .filter_map(|c| self.outcome(*c))
            .map(|o| o.synced)
            .sum()
    }

    /// Total new items across all scopes.
    pub fn total_new(&self) -> usize {
        Capability::ALL
            .iter()
            .filter_map(|c| self.outcome(*c))
            .map(|o| o.new_items)
            .sum()
    }

    pub fn had_activity(&self) -> bool {
        self.total_new() > 0
    }
}
