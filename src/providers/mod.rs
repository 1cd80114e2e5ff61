//! Mailbox provider adapters.
//!
//! Every provider is driven through the [`MailboxAdapter`] contract:
//!
//! - [`GoogleAdapter`] - Gmail, Calendar and People REST APIs
//! - [`MicrosoftAdapter`] - Microsoft Graph delta queries
//! - [`GenericAdapter`] - IMAP/SMTP with CalDAV/CardDAV
//!
//! The variant set is closed ([`Adapter`]) and [`build_adapter`] maps a
//! provider type plus its decrypted [`Credential`] to one of them.
//!
//! # Example
//!
//! ```ignore
//! use mailsync::providers::{build_adapter, AdapterOptions, Credential, MailboxAdapter, SyncParams};
//!
//! let adapter = build_adapter(&config, Credential::Bearer(token), client, &AdapterOptions::default())?;
//! let batch = adapter.sync_emails(&SyncParams::incremental(config.cursors.email.clone())).await?;
//! println!("{} changed, next cursor {:?}", batch.items.len(), batch.next_cursor);
//! ```

mod adapter;
mod dav;
mod google;
mod http;
mod imap;
mod microsoft;
mod traits;

pub use adapter::{build_adapter, Adapter, AdapterFactory, AdapterOptions, DefaultAdapterFactory};
pub use google::{GoogleAdapter, GoogleEndpoints};
pub use imap::GenericAdapter;
pub use microsoft::{MicrosoftAdapter, GRAPH_API_BASE};
pub use traits::{
    Credential, ListThreadsParams, MailboxAdapter, OutgoingEmail, ProviderError, Result,
    SyncBatch, SyncParams, ThreadPage, ThreadSummary, UserInfo,
};

pub(crate) use http::{error_from_response, map_send_error};
