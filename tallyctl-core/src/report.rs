//! Serializable summaries of a workflow run, for the CLI and logs.

use serde::Serialize;

use crate::error::{ErrorKind, TxError};

/// What happened to the unit of work after a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStatus {
    /// The unit of work never opened
    NotNeeded,
    Completed,
    /// Rollback itself failed
    Failed,
    /// Commit was sent but not acknowledged
    InDoubt,
}

impl RollbackStatus {
    pub fn for_error(err: &TxError) -> Self {
        match err {
            TxError::ConnectionUnavailable { .. } => Self::NotNeeded,
            TxError::RollbackFailed { .. } => Self::Failed,
            TxError::CommitFailed { .. } => Self::InDoubt,
            _ => Self::Completed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MutationReport<T> {
    Committed {
        workflow: &'static str,
        receipt: T,
    },
    Failed {
        workflow: &'static str,
        error: ErrorKind,
        reason: String,
        rollback: RollbackStatus,
        retryable: bool,
        outcome_unknown: bool,
    },
}

impl<T> MutationReport<T> {
    pub fn from_result(workflow: &'static str, result: &Result<T, TxError>) -> Self
    where
        T: Clone,
    {
        match result {
            Ok(receipt) => Self::Committed {
                workflow,
                receipt: receipt.clone(),
            },
            Err(err) => Self::failed(workflow, err),
        }
    }

    pub fn failed(workflow: &'static str, err: &TxError) -> Self {
        let reason = match err {
            TxError::RollbackFailed {
                cause: Some(cause), ..
            } => format!("{} (after: {})", err, cause),
            other => other.to_string(),
        };
        Self::Failed {
            workflow,
            error: err.kind(),
            reason,
            rollback: RollbackStatus::for_error(err),
            retryable: err.is_retryable(),
            outcome_unknown: err.outcome_unknown(),
        }
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use serde_json::json;

    #[test]
    fn violation_report_shape() {
        let result: Result<u64, TxError> = Err(TxError::violated(
            "insufficient quantity: requested 3, available 2",
        ));
        let report = MutationReport::from_result("place_order", &result);
        assert!(!report.is_committed());
        assert_eq!(
            serde_json::to_value(&report).unwrap(),
            json!({
                "status": "failed",
                "workflow": "place_order",
                "error": "precondition_violated",
                "reason": "precondition violated: insufficient quantity: requested 3, available 2",
                "rollback": "completed",
                "retryable": false,
                "outcome_unknown": false,
            })
        );
    }

    #[test]
    fn commit_failure_is_in_doubt() {
        let err = TxError::CommitFailed {
            source: StoreError::Connection("reset".into()),
        };
        match MutationReport::<()>::failed("place_order", &err) {
            MutationReport::Failed {
                rollback,
                outcome_unknown,
                ..
            } => {
                assert_eq!(rollback, RollbackStatus::InDoubt);
                assert!(outcome_unknown);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn rollback_failure_mentions_cause() {
        let err = TxError::RollbackFailed {
            cause: None,
            source: StoreError::Connection("broken pipe".into()),
        }
        .with_rollback_cause(TxError::statement(
            "insert_order",
            StoreError::Other("boom".into()),
        ));
        match MutationReport::<()>::failed("place_order", &err) {
            MutationReport::Failed {
                reason, rollback, ..
            } => {
                assert_eq!(rollback, RollbackStatus::Failed);
                assert!(reason.contains("insert_order"), "{}", reason);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn committed_report_carries_receipt() {
        let report = MutationReport::from_result("raise_budgets", &Ok::<_, TxError>(2u64));
        assert_eq!(
            serde_json::to_value(&report).unwrap(),
            json!({"status": "committed", "workflow": "raise_budgets", "receipt": 2})
        );
    }
}
