//! mailsync - Multi-tenant mailbox, calendar and contact synchronization
//!
//! This crate keeps a local store in step with Google, Microsoft and generic
//! IMAP/DAV providers: adaptive scheduling, prioritized workers, OAuth token
//! lifecycle and error-aware retries.

pub mod config;
pub mod domain;
pub mod providers;
pub mod services;
pub mod storage;

pub use services::SyncService;
