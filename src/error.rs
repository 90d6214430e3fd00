//! Error types for every boundary of the catalog core.
//!
//! The taxonomy follows how failures are handled rather than where they come from:
//! - infrastructure errors (`StoreError`, `QueueError::Broker`) are absorbed at the
//!   cache/queue boundary and turned into "consult the source of truth"
//! - data errors (bad cached bytes, bad task payload) are never retried
//! - domain violations (`CatalogError::Duplicate`, `CatalogError::NotFound`) reach the caller

use crate::model::EntityKind;
use thiserror::Error;

/// Errors raised by a [`KeyValueStore`](crate::store::KeyValueStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// Store unreachable or connection dropped
    #[error("key-value store unavailable: {0}")]
    Unavailable(String),

    /// Caller deadline expired before the store answered
    #[error("key-value operation timed out")]
    Timeout,

    /// Caller context was cancelled
    #[error("key-value operation cancelled")]
    Cancelled,

    /// Command applied to a key holding another kind of value
    #[error("WRONGTYPE operation against key '{key}' holding the wrong kind of value")]
    WrongType { key: String },

    /// Reply did not have the shape the command implies
    #[error("unexpected reply: {0}")]
    Protocol(String),

    /// Entity could not be encoded for caching
    #[error("failed to encode cache payload: {0}")]
    Encode(#[from] serde_json::Error),

    /// Server rejected a command
    #[error("server error: {0}")]
    Response(String),

    /// `BF.RESERVE` on a filter that is already there
    #[error("ERR item exists: '{key}'")]
    KeyExists { key: String },

    #[cfg(feature = "redis-store")]
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
}

impl StoreError {
    /// Transient errors are worth a retry by whoever owns retries (never this crate).
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Unavailable(_) | StoreError::Timeout => true,
            #[cfg(feature = "redis-store")]
            StoreError::Redis(_) => true,
            _ => false,
        }
    }
}

/// Errors raised by the task pipeline (distributor, broker, worker pool).
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("failed to serialize task payload: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("broker unavailable: {0}")]
    Broker(String),

    #[error("unknown queue '{0}'")]
    UnknownQueue(String),

    #[error("task {0} not found")]
    TaskNotFound(u64),

    #[error("enqueue timed out")]
    Timeout,

    #[error("enqueue cancelled")]
    Cancelled,

    #[error("worker pool is shut down")]
    ShutDown,
}

/// Outcome of a failed handler invocation, classified by the handler itself.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Worth retrying within the broker's retry budget
    #[error("{0}")]
    Retry(String),

    /// Terminal; the task goes straight to the failed set
    #[error("skip retry: {0}")]
    SkipRetry(String),
}

/// Errors raised by the external source of truth.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: u64 },

    #[error("constraint violated: {0}")]
    Conflict(String),

    #[error("repository backend failed: {0}")]
    Backend(String),
}

/// Errors surfaced by the catalog service to its (HTTP) caller.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("{kind} with key '{key}' already exists")]
    Duplicate { kind: EntityKind, key: String },

    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: u64 },

    #[error("no copies of book {book_id} available")]
    NoCopiesAvailable { book_id: u64 },

    #[error("loan {loan_id} is already completed")]
    LoanAlreadyCompleted { loan_id: u64 },

    #[error(transparent)]
    Repository(RepositoryError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl From<RepositoryError> for CatalogError {
    fn from(e: RepositoryError) -> Self {
        match e {
            RepositoryError::NotFound { kind, id } => CatalogError::NotFound { kind, id },
            other => CatalogError::Repository(other),
        }
    }
}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {var}: {value}")]
    Env { var: String, value: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}
