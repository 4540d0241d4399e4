//! Error types for the analysis worker.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the worker.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Analysis backend error: {0}")]
    Analysis(#[from] AnalysisError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Message broker errors.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Broker connection failed: {0}")]
    Connection(String),

    #[error("Broker command {command} failed: {reason}")]
    Command {
        command: &'static str,
        reason: String,
    },

    #[error("Broker is closed")]
    Closed,
}

/// Job lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Unknown job type: {0}")]
    UnknownType(String),

    #[error("No handler registered for job type {0}")]
    NoHandler(String),

    #[error("Malformed queue message: {0}")]
    MalformedMessage(String),

    #[error("Invalid payload for job {id}: {reason}")]
    InvalidPayload { id: Uuid, reason: String },

    #[error("Job {id} timed out after {timeout:?} in processing")]
    TimedOut { id: Uuid, timeout: Duration },
}

/// Errors from the external AI analysis backend.
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("Analysis request to {endpoint} failed: {reason}")]
    RequestFailed { endpoint: String, reason: String },

    #[error("Analysis backend rejected {endpoint} with status {status}: {body}")]
    Rejected {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("Analysis backend unavailable at {endpoint} (status {status})")]
    Unavailable { endpoint: String, status: u16 },

    #[error("Invalid response from {endpoint}: {reason}")]
    InvalidResponse { endpoint: String, reason: String },
}

impl AnalysisError {
    /// Whether retrying the same request can never succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Rejected { .. } | Self::InvalidResponse { .. })
    }
}

/// Error returned by a job handler.
///
/// The variant is the retry classification: only `Transient` errors consume
/// retry budget and get re-enqueued.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// May succeed if attempted again later.
    #[error("{0}")]
    Transient(String),

    /// Will fail again no matter how often it is retried.
    #[error("{0}")]
    Permanent(String),

    /// Stopped between items because the worker is shutting down.
    #[error("interrupted by worker shutdown")]
    Interrupted,
}

impl HandlerError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

impl From<AnalysisError> for HandlerError {
    fn from(e: AnalysisError) -> Self {
        if e.is_permanent() {
            Self::Permanent(e.to_string())
        } else {
            Self::Transient(e.to_string())
        }
    }
}

impl From<JobError> for HandlerError {
    fn from(e: JobError) -> Self {
        Self::Permanent(e.to_string())
    }
}

impl From<DatabaseError> for HandlerError {
    fn from(e: DatabaseError) -> Self {
        Self::Transient(e.to_string())
    }
}

/// Result type alias for the worker.
pub type Result<T> = std::result::Result<T, Error>;
