//! Unit of work: one transaction, one connection, one terminal action.
//!
//! ```text
//!              check ok            commit ok
//! Unchecked ───────────> Checked ───────────> Committed
//!     │ check failed        │ statement error
//!     v                     v
//! Rejected               Failed
//!     │                     │
//!     └──── rollback ───────┴──────────────> RolledBack
//! ```
//!
//! Commit failures land in `InDoubt`, rollback failures in `Indeterminate`.
//! Every terminal state rejects further calls with `TxError::InvalidState`.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult, TxError};
use crate::model::AlbumId;
use crate::precondition::PreconditionResult;
use crate::store::{ExecOutcome, IsolationLevel, Statement, Transaction};

/// Lifecycle of a [`UnitOfWork`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UowState {
    /// Begun, precondition not evaluated yet
    Unchecked,
    /// Precondition satisfied; statements may run
    Checked,
    /// Precondition negative; only rollback is allowed
    Rejected,
    /// A round trip failed; only rollback is allowed
    Failed,
    Committed,
    RolledBack,
    /// Commit was attempted and did not acknowledge
    InDoubt,
    /// Rollback was attempted and failed
    Indeterminate,
}

impl UowState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Committed | Self::RolledBack | Self::InDoubt | Self::Indeterminate
        )
    }
}

impl fmt::Display for UowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Unchecked => "unchecked",
            Self::Checked => "checked",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
            Self::Committed => "committed",
            Self::RolledBack => "rolled back",
            Self::InDoubt => "in doubt",
            Self::Indeterminate => "indeterminate",
        };
        f.write_str(text)
    }
}

async fn bounded<T>(limit: Duration, fut: impl Future<Output = StoreResult<T>>) -> StoreResult<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}

/// Handle to an open transaction.
///
/// Created by [`Coordinator::begin`](crate::Coordinator::begin). Not `Clone`
/// and not shared: the owner drives it to exactly one terminal action.
pub struct UnitOfWork {
    id: Uuid,
    isolation: IsolationLevel,
    round_trip: Duration,
    state: UowState,
    statements: usize,
    tx: Option<Box<dyn Transaction>>,
}

impl UnitOfWork {
    pub(crate) fn new(
        tx: Box<dyn Transaction>,
        isolation: IsolationLevel,
        round_trip: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            isolation,
            round_trip,
            state: UowState::Unchecked,
            statements: 0,
            tx: Some(tx),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn state(&self) -> UowState {
        self.state
    }

    /// Mutating statements that reached the store
    pub fn statements_issued(&self) -> usize {
        self.statements
    }

    fn live(&mut self, action: &'static str) -> Result<&mut Box<dyn Transaction>, TxError> {
        match (self.state, self.tx.as_mut()) {
            (UowState::Unchecked | UowState::Checked, Some(tx)) => Ok(tx),
            (state, _) => Err(TxError::InvalidState { action, state }),
        }
    }

    pub(crate) fn poison(&mut self) {
        if !self.state.is_terminal() {
            self.state = UowState::Failed;
        }
    }

    /// Read an album's quantity inside this transaction's snapshot
    pub async fn album_quantity(&mut self, album: AlbumId) -> Result<Option<i64>, TxError> {
        let limit = self.round_trip;
        let tx = self.live("read from")?;
        let result = bounded(limit, tx.album_quantity(album)).await;
        debug!(uow = %self.id, %album, ok = result.is_ok(), "read album quantity");
        result.map_err(|source| {
            self.poison();
            TxError::statement("read_album_quantity", source)
        })
    }

    /// Count projects started on or after `since` inside this transaction
    pub async fn count_projects_since(&mut self, since: NaiveDate) -> Result<u64, TxError> {
        let limit = self.round_trip;
        let tx = self.live("read from")?;
        let result = bounded(limit, tx.count_projects_since(since)).await;
        debug!(uow = %self.id, %since, ok = result.is_ok(), "counted projects");
        result.map_err(|source| {
            self.poison();
            TxError::statement("count_projects", source)
        })
    }

    /// Record the precondition outcome. Must happen before any `execute`.
    pub fn record_precondition(&mut self, result: &PreconditionResult) -> Result<(), TxError> {
        self.live("check")?;
        self.state = if result.is_satisfied() {
            UowState::Checked
        } else {
            UowState::Rejected
        };
        Ok(())
    }

    /// Issue a mutating statement. Visible to others only after commit.
    pub async fn execute(&mut self, statement: &Statement) -> Result<ExecOutcome, TxError> {
        if self.state != UowState::Checked {
            return Err(TxError::InvalidState {
                action: "execute a statement on",
                state: self.state,
            });
        }
        let limit = self.round_trip;
        let kind = statement.kind();
        let tx = self.live("execute a statement on")?;
        let result = bounded(limit, tx.execute(statement)).await;
        self.statements += 1;
        match result {
            Ok(outcome) => {
                debug!(
                    uow = %self.id,
                    statement = %kind,
                    rows = outcome.rows_affected,
                    "statement executed"
                );
                Ok(outcome)
            }
            Err(source) => {
                self.poison();
                Err(TxError::statement(kind.as_str(), source))
            }
        }
    }

    /// Commit. Refused after a rejected precondition or a failed step.
    pub async fn commit(&mut self) -> Result<(), TxError> {
        if matches!(self.state, UowState::Rejected | UowState::Failed) {
            return Err(TxError::InvalidState {
                action: "commit",
                state: self.state,
            });
        }
        let limit = self.round_trip;
        self.live("commit")?;
        let Some(tx) = self.tx.take() else {
            return Err(TxError::InvalidState {
                action: "commit",
                state: self.state,
            });
        };
        match bounded(limit, tx.commit()).await {
            Ok(()) => {
                self.state = UowState::Committed;
                Ok(())
            }
            Err(source) => {
                self.state = UowState::InDoubt;
                Err(TxError::CommitFailed { source })
            }
        }
    }

    /// Roll back. Allowed from any non-terminal state, exactly once.
    pub async fn rollback(&mut self) -> Result<(), TxError> {
        if self.state.is_terminal() {
            return Err(TxError::InvalidState {
                action: "roll back",
                state: self.state,
            });
        }
        let limit = self.round_trip;
        let Some(tx) = self.tx.take() else {
            return Err(TxError::InvalidState {
                action: "roll back",
                state: self.state,
            });
        };
        match bounded(limit, tx.rollback()).await {
            Ok(()) => {
                self.state = UowState::RolledBack;
                Ok(())
            }
            Err(source) => {
                self.state = UowState::Indeterminate;
                Err(TxError::RollbackFailed {
                    cause: None,
                    source,
                })
            }
        }
    }
}

impl fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("id", &self.id)
            .field("isolation", &self.isolation)
            .field("state", &self.state)
            .field("statements", &self.statements)
            .finish()
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        if self.tx.is_some() {
            // The store discards uncommitted work when the connection is released
            warn!(
                uow = %self.id,
                state = %self.state,
                "unit of work dropped without commit or rollback"
            );
        }
    }
}
