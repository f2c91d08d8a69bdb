//! Error types for the orchestration engine

use pipeline_contracts::{ContractError, Status};
use thiserror::Error;

/// Result type alias using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur in the orchestration engine
///
/// Configuration errors (`UnregisteredKey`, `DuplicateRegistration`,
/// `Config`) are fatal at startup or plan validation. `StaleState` is a
/// transient compare-and-swap conflict that callers re-read and retry.
/// Step failures never surface here: they are captured as `FailureInfo`
/// on the node execution.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Lookup of a type that was never registered
    #[error("No {registry} registered for key '{key}'")]
    UnregisteredKey { registry: &'static str, key: String },

    /// The same type was registered twice
    #[error("Duplicate {registry} registration for key '{key}'")]
    DuplicateRegistration { registry: &'static str, key: String },

    /// Compare-and-swap failed: the record moved on since it was read
    #[error("Stale state for {collection} '{uuid}'")]
    StaleState {
        collection: &'static str,
        uuid: String,
    },

    /// A status transition outside the state machine's table
    #[error("Illegal status transition for {collection} '{uuid}': {from} -> {to}")]
    IllegalTransition {
        collection: &'static str,
        uuid: String,
        from: Status,
        to: Status,
    },

    /// Insert of a record whose key already exists
    #[error("{collection} '{uuid}' already exists")]
    DuplicateKey {
        collection: &'static str,
        uuid: String,
    },

    /// A record that should exist does not
    #[error("{collection} '{uuid}' not found")]
    NotFound {
        collection: &'static str,
        uuid: String,
    },

    /// A sweeping output or outcome was already written in this scope
    #[error("Output '{name}' already exists in scope '{scope}'")]
    DuplicateOutput { name: String, scope: String },

    /// A sweeping output or outcome could not be resolved
    #[error("Output '{name}' not found in any enclosing scope")]
    OutputNotFound { name: String },

    /// The request is malformed for the current state
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Plan validation found unregistered or inconsistent references
    #[error("Plan validation failed: {0}")]
    Validation(String),

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),

    /// The remote worker pool rejected a task
    #[error("Task dispatch error: {0}")]
    Dispatch(String),

    /// Payload codec error
    #[error("Contract error: {0}")]
    Contract(#[from] ContractError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// SQLite store error
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Create an invalid request error with a message
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn not_found(collection: &'static str, uuid: impl Into<String>) -> Self {
        Self::NotFound {
            collection,
            uuid: uuid.into(),
        }
    }

    pub fn stale(collection: &'static str, uuid: impl Into<String>) -> Self {
        Self::StaleState {
            collection,
            uuid: uuid.into(),
        }
    }

    /// Transient conflict that a re-read may resolve
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::StaleState { .. })
    }

    /// Packaging or configuration defect rather than a runtime condition
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::UnregisteredKey { .. }
                | Self::DuplicateRegistration { .. }
                | Self::Validation(_)
                | Self::Config(_)
        )
    }
}
