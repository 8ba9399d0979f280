use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::IntegrityPattern;
use crate::item::{ConnectionId, ItemId, ResourceId};
use crate::status::AnalysisStatus;

/// Details of a constraint violation reported by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityViolation {
    pub table: String,
    pub constraint: Option<String>,
    /// SQLSTATE-style code, e.g. `23514`.
    pub code: String,
    pub message: String,
}

impl fmt::Display for IntegrityViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}: {}", self.code, self.table, self.message)
    }
}

/// Errors raised by the store and by business steps.
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("stale item {0}: updated by another transaction")]
    Stale(ItemId),

    #[error("serialization failure: {0}")]
    SerializationFailure(String),

    #[error("lock on item {0} not available")]
    LockNotAvailable(ItemId),

    #[error("command timeout: {0}")]
    CommandTimeout(String),

    #[error("integrity violation: {0}")]
    IntegrityViolation(IntegrityViolation),

    #[error("temporary failure, retry after a delay: {0}")]
    TemporaryWithDelay(String),

    #[error("temporary failure: {0}")]
    Temporary(String),

    #[error("connection {0} was killed")]
    ConnectionKilled(ConnectionId),

    #[error("step timeout: {0}")]
    StepTimeout(String),

    #[error("cancelled")]
    Cancelled,

    #[error("aborted")]
    Aborted,

    #[error("resource {resource} is paused by item {owner}")]
    ResourceBusy { resource: ResourceId, owner: ItemId },

    #[error("out of memory")]
    OutOfMemory,

    #[error("unrecoverable store failure: {0}")]
    Unrecoverable(String),

    #[error("item {0} not found")]
    NotFound(ItemId),

    #[error("invalid transition of item {id} from {from} to {to}")]
    InvalidTransition {
        id: ItemId,
        from: AnalysisStatus,
        to: AnalysisStatus,
    },

    #[error("no handler registered for kind '{0}'")]
    UnknownKind(String),

    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("{0}")]
    Business(String),
}

/// How the scheduler reacts to an [`AnalysisError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Optimistic conflict, serialization failure: retry now.
    TransientRetryable,
    /// Retry after a cooldown sleep.
    TransientWithDelay,
    StepBudgetExceeded,
    DatabaseTimeout,
    /// Pause denied.
    ResourceBusy,
    IntegrityViolationTransient,
    IntegrityViolationFatal,
    /// Request process exit.
    Fatal,
    /// The attempt was cancelled by the supervisor.
    Interrupted,
    /// Anything else: logged and propagated, scheduling continues.
    Unclassified,
}

impl AnalysisError {
    /// Classify against the configured transient integrity patterns.
    pub fn class(&self, transient_integrity: &[IntegrityPattern]) -> ErrorClass {
        match self {
            AnalysisError::Stale(_)
            | AnalysisError::SerializationFailure(_)
            | AnalysisError::LockNotAvailable(_)
            | AnalysisError::Temporary(_)
            | AnalysisError::ConnectionKilled(_) => ErrorClass::TransientRetryable,
            AnalysisError::TemporaryWithDelay(_) => ErrorClass::TransientWithDelay,
            AnalysisError::StepTimeout(_) => ErrorClass::StepBudgetExceeded,
            AnalysisError::CommandTimeout(_) => ErrorClass::DatabaseTimeout,
            AnalysisError::ResourceBusy { .. } => ErrorClass::ResourceBusy,
            AnalysisError::IntegrityViolation(v) => {
                if transient_integrity.iter().any(|p| p.matches(v)) {
                    ErrorClass::IntegrityViolationTransient
                } else {
                    ErrorClass::IntegrityViolationFatal
                }
            }
            AnalysisError::OutOfMemory | AnalysisError::Unrecoverable(_) => ErrorClass::Fatal,
            AnalysisError::Cancelled | AnalysisError::Aborted => ErrorClass::Interrupted,
            AnalysisError::NotFound(_)
            | AnalysisError::InvalidTransition { .. }
            | AnalysisError::UnknownKind(_)
            | AnalysisError::Payload(_)
            | AnalysisError::Business(_) => ErrorClass::Unclassified,
        }
    }
}

/// Configuration loading errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
