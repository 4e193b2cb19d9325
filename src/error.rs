//! Error types for KyroLog.
//!
//! All errors in KyroLog are strongly typed using thiserror.
//! Recoverable validation failures of branch/merge/fast-forward and
//! retroactive inserts are NOT errors: they are returned as typed outcome
//! values so callers can branch on them. The types here cover bad input,
//! execution failures and structural corruption.

use thiserror::Error;

use crate::message::MessageId;
use crate::storage::StorageError;
use crate::stream::StreamVersion;

/// Validation errors that occur during input validation.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Timeline id cannot be empty")]
    EmptyTimeline,

    #[error("Timeline id '{timeline}' must not contain ':'")]
    InvalidTimeline { timeline: String },

    #[error("Invalid stream key '{key}': expected '{{timeline}}:{{type}}:{{id}}'")]
    InvalidStreamKey { key: String },

    #[error("Cannot branch timeline '{timeline}' onto itself")]
    SameTimeline { timeline: String },

    #[error("Version {version} is out of range for stream {key} (current: {current})")]
    VersionOutOfRange {
        key: String,
        version: u64,
        current: StreamVersion,
    },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("Timeline '{timeline}' is the root timeline and cannot be deleted")]
    RootTimeline { timeline: String },

    #[error("Stream {key} is still referenced by {dependent}")]
    StreamInUse { key: String, dependent: String },
}

/// Execution errors that occur during operation execution.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Concurrency conflict on {key}: expected {expected}, actual {actual}")]
    ConcurrencyConflict {
        key: String,
        expected: String,
        actual: StreamVersion,
    },

    #[error("Stream not found: {key}")]
    StreamNotFound { key: String },

    #[error("No timestamp recorded for {key} at version {version}")]
    TimestampUnresolved { key: String, version: u64 },

    #[error("Operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    #[error("Operation cancelled: {operation}")]
    Cancelled { operation: String },

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Queue full on {path} (capacity: {capacity})")]
    QueueFull { path: String, capacity: usize },

    #[error("Worker disconnected on {path}")]
    Disconnected { path: String },

    #[error("A rewrite of {key} is already in progress")]
    RewriteInProgress { key: String },

    #[error("Command not found: {id} in timeline {timeline}")]
    CommandNotFound { id: MessageId, timeline: String },
}

/// Structural corruption of the causality DAG or of a stream.
///
/// These are unrecoverable for the affected stream: the offending operation
/// stops immediately and nothing attempts a silent repair.
#[derive(Debug, Error)]
pub enum CorruptionError {
    #[error("Cycle detected in causality graph: {from} -> {to}")]
    Cycle { from: String, to: String },

    #[error("Version gap in {key}: expected {expected}, found {found}")]
    VersionGap { key: String, expected: u64, found: u64 },

    #[error("Hash mismatch in {key}: stored {stored}, recomputed {recomputed}")]
    HashMismatch {
        key: String,
        stored: String,
        recomputed: String,
    },

    #[error("Stream {key} references missing parent {parent}")]
    DanglingParent { key: String, parent: String },

    #[error("Event {message} linked into {key} is missing from the graph")]
    DanglingEvent { key: String, message: MessageId },
}

/// Top-level error type for KyroLog.
#[derive(Debug, Error)]
pub enum KyroError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Structural corruption: {0}")]
    Corruption(#[from] CorruptionError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl KyroError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if this error reports structural corruption.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Corruption(_))
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    /// Returns true for timeouts, as opposed to "not found".
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Execution(ExecutionError::Timeout { .. }))
    }

    /// Returns true if this error is retryable.
    ///
    /// The core never retries on its own; an outer decorator may.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) | Self::Corruption(_) | Self::Internal { .. } => false,
            Self::Execution(e) => matches!(
                e,
                ExecutionError::Timeout { .. } | ExecutionError::ConcurrencyConflict { .. }
            ),
        }
    }
}

impl From<StorageError> for KyroError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::WrongExpectedVersion {
                key,
                expected,
                actual,
            } => Self::Execution(ExecutionError::ConcurrencyConflict {
                key,
                expected,
                actual,
            }),
            StorageError::StreamNotFound(key) => {
                Self::Execution(ExecutionError::StreamNotFound { key })
            }
            other => Self::Execution(ExecutionError::Storage {
                message: other.to_string(),
            }),
        }
    }
}

/// Result type alias for KyroLog operations.
pub type KyroResult<T> = Result<T, KyroError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_stream_key() {
        let err = ValidationError::InvalidStreamKey {
            key: "nope".to_string(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("nope"));
        assert!(msg.contains("{timeline}:{type}:{id}"));
    }

    #[test]
    fn test_execution_error_timeout() {
        let err = ExecutionError::Timeout { duration_ms: 5000 };
        let msg = format!("{err}");
        assert!(msg.contains("5000ms"));
    }

    #[test]
    fn test_corruption_error_cycle() {
        let err = CorruptionError::Cycle {
            from: "a".to_string(),
            to: "b".to_string(),
        };
        assert!(format!("{err}").contains("a -> b"));
    }

    #[test]
    fn test_kyro_error_from_validation() {
        let kyro_err: KyroError = ValidationError::EmptyTimeline.into();
        assert!(kyro_err.is_validation());
        assert!(!kyro_err.is_retryable());
    }

    #[test]
    fn test_kyro_error_timeout_is_retryable_and_distinct() {
        let kyro_err: KyroError = ExecutionError::Timeout { duration_ms: 10 }.into();
        assert!(kyro_err.is_timeout());
        assert!(kyro_err.is_retryable());

        let not_found: KyroError = ExecutionError::StreamNotFound {
            key: "master:Root:1".to_string(),
        }
        .into();
        assert!(!not_found.is_timeout());
        assert!(!not_found.is_retryable());
    }

    #[test]
    fn test_corruption_is_fatal() {
        let err: KyroError = CorruptionError::VersionGap {
            key: "master:Root:1".to_string(),
            expected: 2,
            found: 4,
        }
        .into();
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_storage_conflict_keeps_its_type() {
        let err: KyroError = StorageError::WrongExpectedVersion {
            key: "master:Root:1".to_string(),
            expected: "0".to_string(),
            actual: StreamVersion::At(3),
        }
        .into();
        assert!(matches!(
            err,
            KyroError::Execution(ExecutionError::ConcurrencyConflict { .. })
        ));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_kyro_error_internal() {
        let err = KyroError::internal("unexpected state");
        assert!(err.is_internal());
        assert!(format!("{err}").contains("unexpected state"));
    }
}
