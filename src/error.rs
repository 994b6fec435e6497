//! Error handling for the sync engine
//!
//! Leaf I/O classifies every failure into an [`ErrorKind`]; the sync phases
//! use the kind to decide whether to skip a record, retry on the next tick,
//! or abort.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Classification of a failure, used for retry and propagation decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Retried inside the client call.
    Transient,
    /// Backoff and retry inside the client call.
    RateLimited,
    /// Skip the record.
    NotFound,
    /// Logged and surfaced; the batch continues.
    Conflict,
    /// Aborts the current phase.
    Permanent,
    /// Terminates the process at startup.
    Configuration,
}

impl ErrorKind {
    /// Kinds the client retries on its own.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient | ErrorKind::RateLimited)
    }

    /// Kinds that abort the current tick instead of being skipped per record.
    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorKind::Permanent | ErrorKind::Configuration)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Configuration => "configuration",
        };
        f.write_str(s)
    }
}

/// Main error type for the sync engine
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Transient sheet service failure: {message}")]
    Transient { message: String },

    #[error("Rate limited by sheet service (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Not found: {resource}")]
    NotFound { resource: String },

    #[error("Conflict writing {resource}: {message}")]
    Conflict { resource: String, message: String },

    #[error("Sheet service error {status}: {message}")]
    Permanent { status: u16, message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Invalid chunk size {size} for {len} items")]
    InvalidChunkSize { size: usize, len: usize },

    #[error("Malformed response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Transient { .. } => ErrorKind::Transient,
            SyncError::RateLimited { .. } => ErrorKind::RateLimited,
            SyncError::NotFound { .. } => ErrorKind::NotFound,
            SyncError::Conflict { .. } => ErrorKind::Conflict,
            SyncError::Permanent { .. } => ErrorKind::Permanent,
            SyncError::Configuration { .. } => ErrorKind::Configuration,
            SyncError::InvalidChunkSize { .. } | SyncError::Decode(_) => ErrorKind::Permanent,
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        SyncError::Configuration {
            message: message.into(),
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        SyncError::NotFound {
            resource: resource.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        SyncError::Transient {
            message: message.into(),
        }
    }

    /// Map an HTTP status and response body onto the error taxonomy.
    pub fn from_status(
        status: u16,
        resource: &str,
        body: &str,
        retry_after: Option<Duration>,
    ) -> Self {
        let message: String = body.chars().take(200).collect();
        match status {
            404 => SyncError::not_found(resource),
            409 => SyncError::Conflict {
                resource: resource.to_string(),
                message,
            },
            429 => SyncError::RateLimited { retry_after },
            500..=599 => SyncError::Transient {
                message: format!("{} returned {}: {}", resource, status, message),
            },
            _ => SyncError::Permanent { status, message },
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return SyncError::Permanent {
                status: err.status().map(|s| s.as_u16()).unwrap_or(0),
                message: format!("failed to decode response: {}", err),
            };
        }
        match err.status() {
            Some(status) => SyncError::from_status(status.as_u16(), "request", &err.to_string(), None),
            // Timeouts, connection resets and DNS failures carry no status
            None => SyncError::transient(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
