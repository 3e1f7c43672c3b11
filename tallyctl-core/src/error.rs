//! Structured error types for tallyctl-core.
//!
//! Two layers:
//! - [`StoreError`] classifies what the store reported for a single round trip.
//! - [`TxError`] is what a caller of the coordinator sees, and says which phase of
//!   the unit of work failed and whether the store state is still known.
//!
//! The CLI wraps these in `anyhow` for context, but library consumers match on
//! the variants.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::uow::UowState;

/// Failure of a single store round trip
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Could not reach the store or the connection broke mid-flight
    #[error("connection error: {0}")]
    Connection(String),

    /// Round trip did not complete within the configured bound
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Serialization failure or deadlock reported by the store
    #[error("transaction conflict ({code}): {message}")]
    Conflict { code: String, message: String },

    /// Integrity constraint violation (check, foreign key, unique, not null)
    #[error("constraint violation ({code}): {message}")]
    Constraint { code: String, message: String },

    /// A row could not be scanned into its projection type
    #[error("failed to decode row: {0}")]
    Decode(String),

    /// Statement touched a different number of rows than the step expected
    #[error("expected {expected} affected row(s), store reported {actual}")]
    UnexpectedRowCount { expected: String, actual: u64 },

    #[error("store error: {0}")]
    Other(String),
}

/// Result type alias for store round trips
pub type StoreResult<T> = std::result::Result<T, StoreError>;

impl StoreError {
    /// Whether the same round trip may succeed if the whole unit of work is rerun
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Timeout(_) | Self::Conflict { .. }
        )
    }

    pub fn conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Conflict {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn constraint(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Constraint {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db) => {
                let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
                let message = db.message().to_owned();
                // 40001 serialization_failure, 40P01 deadlock_detected
                if code == "40001" || code == "40P01" {
                    Self::Conflict { code, message }
                } else if code.starts_with("23") {
                    Self::Constraint { code, message }
                } else {
                    Self::Other(format!("{} ({})", message, code))
                }
            }
            sqlx::Error::PoolTimedOut => Self::Connection("pool timed out".to_owned()),
            sqlx::Error::PoolClosed => Self::Connection("pool closed".to_owned()),
            sqlx::Error::Io(e) => Self::Connection(e.to_string()),
            sqlx::Error::Tls(e) => Self::Connection(e.to_string()),
            sqlx::Error::ColumnDecode { index, source } => {
                Self::Decode(format!("column {}: {}", index, source))
            }
            sqlx::Error::ColumnNotFound(column) => {
                Self::Decode(format!("column not found: {}", column))
            }
            sqlx::Error::Decode(e) => Self::Decode(e.to_string()),
            other => Self::Other(other.to_string()),
        }
    }
}

/// Error returned to callers of the coordinator
#[derive(Error, Debug)]
pub enum TxError {
    /// Unit of work could not begin
    #[error("connection unavailable: {source}")]
    ConnectionUnavailable {
        #[source]
        source: StoreError,
    },

    /// Business rule rejected the request before any mutation
    #[error("precondition violated: {reason}")]
    PreconditionViolated { reason: String },

    /// Target entity does not exist
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// A statement failed inside the unit of work; it was rolled back
    #[error("statement '{step}' failed: {source}")]
    StatementFailed {
        step: &'static str,
        #[source]
        source: StoreError,
    },

    /// Commit did not acknowledge; the store may or may not have applied it
    #[error("commit failed, outcome unknown: {source}")]
    CommitFailed {
        #[source]
        source: StoreError,
    },

    /// Rollback failed; store state is indeterminate.
    ///
    /// `cause` is the failure that triggered the rollback, when there was one.
    #[error("rollback failed, store state unknown: {source}")]
    RollbackFailed {
        cause: Option<Box<TxError>>,
        #[source]
        source: StoreError,
    },

    /// Projection rows could not be read or scanned
    #[error("failed to read {what}: {source}")]
    Projection {
        what: &'static str,
        #[source]
        source: StoreError,
    },

    /// Operation attempted in a state that forbids it
    #[error("cannot {action} a unit of work that is {state}")]
    InvalidState {
        action: &'static str,
        state: UowState,
    },
}

/// Result type alias for coordinator operations
pub type Result<T> = std::result::Result<T, TxError>;

/// Stable, serializable name for each [`TxError`] variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConnectionUnavailable,
    PreconditionViolated,
    NotFound,
    StatementFailed,
    CommitFailed,
    RollbackFailed,
    Projection,
    InvalidState,
}

impl TxError {
    pub fn statement(step: &'static str, source: StoreError) -> Self {
        Self::StatementFailed { step, source }
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn violated(reason: impl Into<String>) -> Self {
        Self::PreconditionViolated {
            reason: reason.into(),
        }
    }

    /// Attach the failure that led to a rollback which then failed itself
    pub fn with_rollback_cause(self, cause: TxError) -> Self {
        match self {
            Self::RollbackFailed { source, .. } => Self::RollbackFailed {
                cause: Some(Box::new(cause)),
                source,
            },
            other => other,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConnectionUnavailable { .. } => ErrorKind::ConnectionUnavailable,
            Self::PreconditionViolated { .. } => ErrorKind::PreconditionViolated,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::StatementFailed { .. } => ErrorKind::StatementFailed,
            Self::CommitFailed { .. } => ErrorKind::CommitFailed,
            Self::RollbackFailed { .. } => ErrorKind::RollbackFailed,
            Self::Projection { .. } => ErrorKind::Projection,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
        }
    }

    /// Whether rerunning the whole workflow (precondition included) may succeed.
    ///
    /// Commit failures are never retryable: the first attempt may have landed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectionUnavailable { .. } => true,
            Self::StatementFailed { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Store state is unknown and automated processing must stop
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::RollbackFailed { .. })
    }

    /// Caller must re-query the entity to learn what happened
    pub fn outcome_unknown(&self) -> bool {
        matches!(self, Self::CommitFailed { .. } | Self::RollbackFailed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification() {
        let deadlock =
            TxError::statement("decrement_inventory", StoreError::conflict("40P01", "deadlock"));
        assert!(deadlock.is_retryable());

        let check = TxError::statement(
            "decrement_inventory",
            StoreError::constraint("23514", "album_quantity_check"),
        );
        assert!(!check.is_retryable());

        let unavailable = TxError::ConnectionUnavailable {
            source: StoreError::Timeout(Duration::from_millis(50)),
        };
        assert!(unavailable.is_retryable());

        let commit = TxError::CommitFailed {
            source: StoreError::Connection("reset by peer".into()),
        };
        assert!(!commit.is_retryable());
        assert!(commit.outcome_unknown());
    }

    #[test]
    fn rollback_failure_is_fatal_and_keeps_cause() {
        let err = TxError::RollbackFailed {
            cause: None,
            source: StoreError::Connection("broken pipe".into()),
        }
        .with_rollback_cause(TxError::statement(
            "insert_order",
            StoreError::Other("boom".into()),
        ));
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), ErrorKind::RollbackFailed);
        assert!(err.to_string().contains("broken pipe"));
        match err {
            TxError::RollbackFailed { cause: Some(cause), .. } => {
                assert_eq!(cause.kind(), ErrorKind::StatementFailed);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn not_found_is_distinct_from_violation() {
        let missing = TxError::not_found("album", 42);
        assert_eq!(missing.to_string(), "album 42 not found");
        assert_eq!(missing.kind(), ErrorKind::NotFound);
        assert_eq!(
            TxError::violated("insufficient quantity").kind(),
            ErrorKind::PreconditionViolated
        );
    }

    #[test]
    fn unexpected_row_count_display() {
        let err = StoreError::UnexpectedRowCount {
            expected: "exactly 1".into(),
            actual: 0,
        };
        assert_eq!(
            err.to_string(),
            "expected exactly 1 affected row(s), store reported 0"
        );
        assert!(!err.is_transient());
    }
}
