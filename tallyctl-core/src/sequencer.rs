//! Ordered execution of dependent statements.
//!
//! Each step names the rows it must touch. A mismatch is a statement failure
//! (the row moved under us), not a warning, and it poisons the unit of work so
//! nothing after it runs and commit is refused.

use std::fmt;

use serde::Serialize;
use tracing::warn;

use crate::error::{StoreError, TxError};
use crate::store::{ExecOutcome, Statement, StatementKind};
use crate::uow::UnitOfWork;

/// Affected-row expectation for one step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Expect {
    Exactly(u64),
    AtLeast(u64),
}

impl Expect {
    pub fn accepts(self, rows: u64) -> bool {
        match self {
            Self::Exactly(n) => rows == n,
            Self::AtLeast(n) => rows >= n,
        }
    }
}

impl fmt::Display for Expect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exactly(n) => write!(f, "exactly {}", n),
            Self::AtLeast(n) => write!(f, "at least {}", n),
        }
    }
}

/// What one step did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub statement: StatementKind,
    pub expected: Expect,
    pub rows_affected: u64,
}

/// Runs statements in order against one unit of work
pub struct MutationSequencer<'a> {
    uow: &'a mut UnitOfWork,
    steps: Vec<StepReport>,
}

impl<'a> MutationSequencer<'a> {
    pub fn new(uow: &'a mut UnitOfWork) -> Self {
        Self {
            uow,
            steps: Vec::new(),
        }
    }

    /// Execute `statement` and hold it to `expect`.
    ///
    /// Callers issue dependent steps only after this returns `Ok`, so a failure
    /// here stops the sequence.
    pub async fn step(
        &mut self,
        statement: Statement,
        expect: Expect,
    ) -> Result<ExecOutcome, TxError> {
        let kind = statement.kind();
        let outcome = self.uow.execute(&statement).await?;
        if !expect.accepts(outcome.rows_affected) {
            warn!(
                uow = %self.uow.id(),
                statement = %kind,
                expected = %expect,
                actual = outcome.rows_affected,
                "unexpected affected-row count"
            );
            self.uow.poison();
            return Err(TxError::statement(
                kind.as_str(),
                StoreError::UnexpectedRowCount {
                    expected: expect.to_string(),
                    actual: outcome.rows_affected,
                },
            ));
        }
        self.steps.push(StepReport {
            statement: kind,
            expected: expect,
            rows_affected: outcome.rows_affected,
        });
        Ok(outcome)
    }

    /// Total rows touched by the completed steps
    pub fn rows_affected(&self) -> u64 {
        self.steps.iter().map(|s| s.rows_affected).sum()
    }

    pub fn finish(self) -> Vec<StepReport> {
        self.steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AlbumId;
    use crate::precondition::PreconditionResult;
    use crate::store::{Fault, IsolationLevel, MemoryStore};
    use crate::uow::UowState;
    use crate::{Coordinator, TxSettings};
    use chrono::Utc;

    async fn checked(store: &MemoryStore) -> UnitOfWork {
        let mut uow = Coordinator::new(store.clone(), TxSettings::default())
            .begin(IsolationLevel::Serializable)
            .await
            .unwrap();
        uow.record_precondition(&PreconditionResult::satisfied(1))
            .unwrap();
        uow
    }

    #[test]
    fn expectations() {
        assert!(Expect::Exactly(1).accepts(1));
        assert!(!Expect::Exactly(1).accepts(0));
        assert!(!Expect::Exactly(1).accepts(2));
        assert!(Expect::AtLeast(1).accepts(3));
        assert!(!Expect::AtLeast(1).accepts(0));
    }

    #[tokio::test]
    async fn zero_rows_aborts_the_sequence() {
        let store = MemoryStore::demo();
        store.inject(Fault::ZeroRows(StatementKind::DecrementInventory));
        let mut uow = checked(&store).await;

        let mut seq = MutationSequencer::new(&mut uow);
        let err = seq
            .step(
                Statement::DecrementInventory {
                    album: AlbumId(1),
                    quantity: 1,
                },
                Expect::Exactly(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TxError::StatementFailed {
                step: "decrement_inventory",
                source: StoreError::UnexpectedRowCount { actual: 0, .. },
            }
        ));

        // Dependent step is refused once the unit of work is poisoned
        let next = seq
            .step(
                Statement::InsertOrder {
                    album: AlbumId(1),
                    customer: None,
                    quantity: 1,
                    placed_at: Utc::now(),
                },
                Expect::Exactly(1),
            )
            .await;
        assert!(matches!(next, Err(TxError::InvalidState { .. })));
        assert!(seq.finish().is_empty());

        assert_eq!(uow.state(), UowState::Failed);
        uow.rollback().await.unwrap();
        assert!(store.orders().await.is_empty());
    }

    #[tokio::test]
    async fn steps_are_reported_in_order() {
        let store = MemoryStore::demo();
        let mut uow = checked(&store).await;
        let mut seq = MutationSequencer::new(&mut uow);
        seq.step(
            Statement::DecrementInventory {
                album: AlbumId(3),
                quantity: 4,
            },
            Expect::Exactly(1),
        )
        .await
        .unwrap();
        seq.step(
            Statement::InsertOrder {
                album: AlbumId(3),
                customer: None,
                quantity: 4,
                placed_at: Utc::now(),
            },
            Expect::Exactly(1),
        )
        .await
        .unwrap();
        assert_eq!(seq.rows_affected(), 2);
        let steps = seq.finish();
        assert_eq!(steps[0].statement, StatementKind::DecrementInventory);
        assert_eq!(steps[1].statement, StatementKind::InsertOrder);
        uow.commit().await.unwrap();
    }
}
