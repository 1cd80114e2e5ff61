//! Error classification.
//!
//! Adapters report raw [`ProviderError`]s. [`classify`] turns them into one of
//! five kinds the executor and scheduler act on, extracting the retry hint
//! and whether the stored cursor must be discarded.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::providers::ProviderError;

/// What the engine should do about a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Access token expired or was rejected; one refresh and retry.
    AuthExpired,
    /// Credential is permanently unusable; disable the provider.
    AuthRevoked,
    /// Provider throttling; reschedule after the hint.
    RateLimited,
    /// Retry locally, then back off.
    Transient,
    /// Not retried.
    Permanent,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthExpired => "auth_expired",
            Self::AuthRevoked => "auth_revoked",
            Self::RateLimited => "rate_limited",
            Self::Transient => "transient",
            Self::Permanent => "permanent",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    /// Provider-supplied delay before the next attempt.
    pub retry_after: Option<Duration>,
    /// The stored sync cursor is unusable and must be cleared.
    pub reset_cursor: bool,
    pub message: String,
}

impl ClassifiedError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            retry_after: None,
            reset_cursor: false,
            message: message.into(),
        }
    }

    pub fn revoked(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthRevoked, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, message)
    }

    fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    fn with_reset(mut self) -> Self {
        self.reset_cursor = true;
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == ErrorKind::Transient
    }
}

const REVOKED_CODES: &[&str] = &["invalid_grant", "unauthorized_client", "invalid_client"];

const EXPIRED_CODES: &[&str] = &[
    "InvalidAuthenticationToken",
    "UNAUTHENTICATED",
    "invalid_token",
    "authError",
];

const THROTTLE_CODES: &[&str] = &[
    "rateLimitExceeded",
    "userRateLimitExceeded",
    "RATE_LIMIT_EXCEEDED",
    "ErrorThrottled",
    "ApplicationThrottled",
    "TooManyRequests",
];

const RESYNC_CODES: &[&str] = &[
    "SyncStateNotFound",
    "SyncStateInvalid",
    "resyncRequired",
    "EXPIRED_SYNC_TOKEN",
    "fullSyncRequired",
];

const TRANSIENT_PROTOCOL_MARKERS: &[&str] = &["UNAVAILABLE", "TRYLATER", "SMTP transient"];

fn code_in(code: Option<&str>, set: &[&str]) -> bool {
    code.is_some_and(|c| set.iter().any(|s| s.eq_ignore_ascii_case(c)))
}

/// Parses a `Retry-After` value: delta-seconds or an HTTP-date.
///
/// Dates in the past yield a zero delay.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

/// Classifies a provider error at the current time.
pub fn classify(err: &ProviderError) -> ClassifiedError {
    classify_at(err, Utc::now())
}

/// Classifies a provider error, resolving HTTP-date retry hints against `now`.
pub fn classify_at(err: &ProviderError, now: DateTime<Utc>) -> ClassifiedError {
    let message = err.to_string();
    match err {
        ProviderError::Http {
            status,
            code,
            retry_after,
            ..
        } => {
            let code = code.as_deref();
            let hint = retry_after
                .as_deref()
                .and_then(|value| parse_retry_after(value, now));

            if code_in(code, REVOKED_CODES) {
                ClassifiedError::revoked(message)
            } else if *status == 410 || code_in(code, RESYNC_CODES) {
                ClassifiedError::permanent(message).with_reset()
            } else if *status == 401 || code_in(code, EXPIRED_CODES) {
                ClassifiedError::new(ErrorKind::AuthExpired, message)
            } else if *status == 429 || code_in(code, THROTTLE_CODES) {
                ClassifiedError::new(ErrorKind::RateLimited, message).with_retry_after(hint)
            } else if *status >= 500 || *status == 408 {
                ClassifiedError::transient(message).with_retry_after(hint)
            } else {
                ClassifiedError::permanent(message)
            }
        }
        ProviderError::Network(_) | ProviderError::Timeout(_) => ClassifiedError::transient(message),
        ProviderError::LoginRejected(_) => ClassifiedError::revoked(message),
        ProviderError::Protocol(text) => {
            if text.to_uppercase().contains("THROTTLED") {
                ClassifiedError::new(ErrorKind::RateLimited, message)
            } else if TRANSIENT_PROTOCOL_MARKERS.iter().any(|m| text.contains(m)) {
                ClassifiedError::transient(message)
            } else {
                ClassifiedError::permanent(message)
            }
        }
        ProviderError::CursorInvalidated(_) => ClassifiedError::permanent(message).with_reset(),
        ProviderError::Parse(_)
        | ProviderError::NotFound(_)
        | ProviderError::InvalidRequest(_)
        | ProviderError::Unsupported(_) => ClassifiedError::permanent(message),
    }
}
