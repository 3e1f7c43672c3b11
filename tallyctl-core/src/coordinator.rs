//! Transaction coordinator
//!
//! Opens units of work and drives a [`Workflow`] through them:
//!
//! 1. `begin` at the stronger of the configured and the workflow's isolation
//! 2. `check` inside the unit of work, record the outcome
//! 3. `apply` the statements in dependency order
//! 4. `commit`, or on any error `rollback` exactly once
//!
//! There is no retry in here. A rerun has to repeat the check against fresh
//! state, so retries belong to the caller (see [`crate::retry`]).

use std::time::Duration;

use tracing::{error, info, info_span, instrument, warn, Instrument};

use crate::error::{StoreError, TxError};
use crate::store::{IsolationLevel, Store};
use crate::uow::UnitOfWork;
use crate::workflow::Workflow;

/// Per-request bounds and isolation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxSettings {
    /// Minimum isolation for every unit of work
    pub isolation: IsolationLevel,
    /// How long to wait for a pooled connection
    pub acquire_timeout: Duration,
    /// Bound on each round trip inside a unit of work
    pub round_trip_timeout: Duration,
}

impl Default for TxSettings {
    fn default() -> Self {
        Self {
            isolation: IsolationLevel::Serializable,
            acquire_timeout: Duration::from_secs(5),
            round_trip_timeout: Duration::from_secs(10),
        }
    }
}

/// Drives units of work against a store
pub struct Coordinator<S> {
    store: S,
    settings: TxSettings,
}

impl<S: Store> Coordinator<S> {
    pub fn new(store: S, settings: TxSettings) -> Self {
        Self { store, settings }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn settings(&self) -> TxSettings {
        self.settings
    }

    /// Open a unit of work at `isolation`.
    ///
    /// A timeout while waiting for the pool drops the pending acquisition, so
    /// nothing is left holding a connection.
    #[instrument(level = "debug", skip(self))]
    pub async fn begin(&self, isolation: IsolationLevel) -> Result<UnitOfWork, TxError> {
        let limit = self.settings.acquire_timeout;
        match tokio::time::timeout(limit, self.store.begin(isolation)).await {
            Ok(Ok(tx)) => Ok(UnitOfWork::new(
                tx,
                isolation,
                self.settings.round_trip_timeout,
            )),
            Ok(Err(source)) => Err(TxError::ConnectionUnavailable { source }),
            Err(_) => Err(TxError::ConnectionUnavailable {
                source: StoreError::Timeout(limit),
            }),
        }
    }

    /// Run a workflow in its own unit of work with all-or-nothing semantics.
    pub async fn run<W: Workflow>(&self, work: &W) -> Result<W::Output, TxError> {
        let isolation = self.settings.isolation.max(work.isolation());
        let mut uow = self.begin(isolation).await?;
        let span = info_span!(
            "unit_of_work",
            uow = %uow.id(),
            workflow = work.name(),
            %isolation
        );

        async {
            match drive(work, &mut uow).await {
                Ok(output) => match uow.commit().await {
                    Ok(()) => {
                        info!(statements = uow.statements_issued(), "committed");
                        Ok(output)
                    }
                    Err(err @ TxError::CommitFailed { .. }) => {
                        error!(error = %err, "commit not acknowledged, re-read state");
                        Err(err)
                    }
                    // Commit refused, the transaction is still open
                    Err(err) => Err(abort(&mut uow, err).await),
                },
                Err(cause) => Err(abort(&mut uow, cause).await),
            }
        }
        .instrument(span)
        .await
    }
}

async fn drive<W: Workflow>(work: &W, uow: &mut UnitOfWork) -> Result<W::Output, TxError> {
    let check = work.check(uow).await?;
    uow.record_precondition(&check)?;
    let observed = check.into_result()?;
    work.apply(uow, observed).await
}

/// Roll back after `cause` and return the error the caller should see
async fn abort(uow: &mut UnitOfWork, cause: TxError) -> TxError {
    match uow.rollback().await {
        Ok(()) => {
            warn!(
                error = %cause,
                statements = uow.statements_issued(),
                "rolled back"
            );
            cause
        }
        Err(err @ TxError::RollbackFailed { .. }) => {
            error!(
                error = %cause,
                rollback_error = %err,
                "ROLLBACK FAILED: store state unknown, operator attention required"
            );
            err.with_rollback_cause(cause)
        }
        Err(err) => {
            // Only reachable if the workflow already ended the unit of work
            error!(error = %cause, rollback_error = %err, "unit of work already terminated");
            cause
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AlbumId, OrderRequest};
    use crate::store::{Fault, MemoryStore, StatementKind};
    use crate::uow::UowState;
    use crate::workflow::PlaceOrder;

    fn order(album: i64, quantity: i64) -> PlaceOrder {
        PlaceOrder::new(OrderRequest::new(AlbumId(album), quantity, None).unwrap())
    }

    #[tokio::test]
    async fn workflow_isolation_wins_over_weaker_setting() {
        let store = MemoryStore::demo();
        let settings = TxSettings {
            isolation: IsolationLevel::ReadCommitted,
            ..TxSettings::default()
        };
        let coordinator = Coordinator::new(store.clone(), settings);
        coordinator.run(&order(1, 1)).await.unwrap();
        assert_eq!(store.begun_with(), vec![IsolationLevel::Serializable]);
    }

    #[tokio::test]
    async fn unavailable_store_is_connection_error() {
        let store = MemoryStore::demo();
        store.set_available(false);
        let coordinator = Coordinator::new(store.clone(), TxSettings::default());
        let err = coordinator.run(&order(1, 1)).await.unwrap_err();
        assert!(matches!(err, TxError::ConnectionUnavailable { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_timeout_leaves_no_connection_behind() {
        let store = MemoryStore::demo();
        let coordinator = Coordinator::new(
            store.clone(),
            TxSettings {
                acquire_timeout: Duration::from_millis(100),
                ..TxSettings::default()
            },
        );
        // Hold the only "connection" so the next begin has to wait
        let mut holder = coordinator.begin(IsolationLevel::Serializable).await.unwrap();

        let err = coordinator
            .begin(IsolationLevel::Serializable)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TxError::ConnectionUnavailable {
                source: StoreError::Timeout(_)
            }
        ));
        assert_eq!(store.open_transactions(), 1);

        holder.rollback().await.unwrap();
        assert_eq!(holder.state(), UowState::RolledBack);
        assert_eq!(store.open_transactions(), 0);
    }

    #[tokio::test]
    async fn rollback_failure_is_surfaced_with_its_cause() {
        let store = MemoryStore::demo();
        store.inject(Fault::FailStatement(
            StatementKind::InsertOrder,
            StoreError::constraint("23514", "album_order_quantity_check"),
        ));
        store.inject(Fault::FailRollback(StoreError::Connection(
            "server closed the connection".into(),
        )));
        let coordinator = Coordinator::new(store.clone(), TxSettings::default());

        let err = coordinator.run(&order(1, 2)).await.unwrap_err();
        assert!(err.is_fatal());
        match &err {
            TxError::RollbackFailed {
                cause: Some(cause), ..
            } => assert!(matches!(
                **cause,
                TxError::StatementFailed {
                    step: "insert_order",
                    ..
                }
            )),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(store.open_transactions(), 0);
    }

    #[tokio::test]
    async fn commit_failure_reports_unknown_outcome() {
        let store = MemoryStore::demo();
        store.inject(Fault::FailCommit(StoreError::Connection(
            "connection reset".into(),
        )));
        let coordinator = Coordinator::new(store.clone(), TxSettings::default());

        let err = coordinator.run(&order(1, 2)).await.unwrap_err();
        assert!(matches!(err, TxError::CommitFailed { .. }));
        assert!(err.outcome_unknown());
        assert!(!err.is_retryable());
        assert_eq!(store.open_transactions(), 0);
        assert_eq!(store.pending_faults(), 0);
        assert_eq!(store.album(AlbumId(1)).await.unwrap().quantity, 5);
    }
}
