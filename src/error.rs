//! Error types for the sync pipeline
//!
//! One enum per collaborator so callers can tell expected conditions
//! (missing week, week already stored) apart from real failures.

use std::time::Duration;

use thiserror::Error;

use crate::types::WeekKey;

/// Failures of the box office source
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SourceError {
    /// No chart published for the requested week
    #[error("No box office data for week {0}")]
    NotFound(WeekKey),

    /// Credentials rejected; never retried
    #[error("Box office source rejected credentials: {0}")]
    Auth(String),

    #[error("Box office source rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// Timeouts, connection failures and 5xx responses
    #[error("Transient box office source error: {0}")]
    Transient(String),

    /// Any other client error; not retried
    #[error("Box office source rejected request with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("Failed to decode box office response: {0}")]
    Decode(String),
}

/// Failures of the managed library
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LibraryError {
    #[error("Library rejected credentials")]
    Auth,

    #[error("Library resource not found: {0}")]
    NotFound(String),

    /// The external id is already present in the library
    #[error("Title already exists in library: {0}")]
    AlreadyExists(String),

    #[error("Unknown quality profile: {0}")]
    UnknownProfile(String),

    #[error("Cannot connect to library: {0}")]
    Connection(String),

    #[error("Library API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Failed to decode library response: {0}")]
    Decode(String),
}

/// Failures of the snapshot store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Snapshot for week {0} already exists")]
    AlreadyExists(WeekKey),

    #[error("No snapshot for week {0}")]
    NotFound(WeekKey),

    #[error("Snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Snapshot serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Library error while refreshing snapshot: {0}")]
    Library(#[from] LibraryError),
}

/// Invalid acquisition rule set or rule-list edit
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid acquisition rules: {0}")]
pub struct RuleConfigError(pub String);

/// Run-level failure; aborts the run before any snapshot write
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("{0} is not a valid ISO week")]
    InvalidWeek(WeekKey),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Library(#[from] LibraryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    RuleConfig(#[from] RuleConfigError),
}

/// Returned when a trigger arrives while a run is in flight
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("A box office sync is already running")]
pub struct AlreadyRunning;
