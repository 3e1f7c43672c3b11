//! Workflows: the check-then-mutate recipes the coordinator runs.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde::Serialize;

use crate::error::{StoreError, TxError};
use crate::model::{AlbumId, BudgetRaise, CustomerId, OrderId, OrderRequest};
use crate::precondition::{check_budget_targets, check_inventory, PreconditionResult};
use crate::sequencer::{Expect, MutationSequencer, StepReport};
use crate::store::{IsolationLevel, Statement, StatementKind};
use crate::uow::UnitOfWork;

/// A unit of work recipe.
///
/// `check` runs first and must not mutate. `apply` only runs when the check
/// was satisfied and receives the value the check observed.
#[async_trait]
pub trait Workflow: Send + Sync {
    type Output: Send;

    fn name(&self) -> &'static str;

    /// Minimum isolation this workflow's invariant needs
    fn isolation(&self) -> IsolationLevel {
        IsolationLevel::Serializable
    }

    async fn check(&self, uow: &mut UnitOfWork) -> Result<PreconditionResult, TxError>;

    async fn apply(&self, uow: &mut UnitOfWork, observed: i64) -> Result<Self::Output, TxError>;
}

/// Result of a committed order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderReceipt {
    pub order_id: OrderId,
    pub album: AlbumId,
    pub customer: Option<CustomerId>,
    pub quantity: i64,
    /// Inventory left after this order
    pub remaining: i64,
    pub rows_affected: u64,
    pub steps: Vec<StepReport>,
}

/// Decrement inventory, then record the order
#[derive(Debug, Clone)]
pub struct PlaceOrder {
    request: OrderRequest,
}

impl PlaceOrder {
    pub fn new(request: OrderRequest) -> Self {
        Self { request }
    }

    pub fn request(&self) -> &OrderRequest {
        &self.request
    }
}

#[async_trait]
impl Workflow for PlaceOrder {
    type Output = OrderReceipt;

    fn name(&self) -> &'static str {
        "place_order"
    }

    async fn check(&self, uow: &mut UnitOfWork) -> Result<PreconditionResult, TxError> {
        check_inventory(uow, self.request.album(), self.request.quantity()).await
    }

    async fn apply(&self, uow: &mut UnitOfWork, available: i64) -> Result<OrderReceipt, TxError> {
        let request = &self.request;
        let mut seq = MutationSequencer::new(uow);

        seq.step(
            Statement::DecrementInventory {
                album: request.album(),
                quantity: request.quantity(),
            },
            Expect::Exactly(1),
        )
        .await?;

        let inserted = seq
            .step(
                Statement::InsertOrder {
                    album: request.album(),
                    customer: request.customer(),
                    quantity: request.quantity(),
                    placed_at: Utc::now(),
                },
                Expect::Exactly(1),
            )
            .await?;
        let order_id = inserted.last_insert_id.ok_or_else(|| {
            TxError::statement(
                StatementKind::InsertOrder.as_str(),
                StoreError::Decode("insert returned no order id".to_owned()),
            )
        })?;

        let rows_affected = seq.rows_affected();
        Ok(OrderReceipt {
            order_id: OrderId(order_id),
            album: request.album(),
            customer: request.customer(),
            quantity: request.quantity(),
            remaining: available - request.quantity(),
            rows_affected,
            steps: seq.finish(),
        })
    }
}

/// Result of a committed budget raise
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BudgetReceipt {
    pub since: NaiveDate,
    pub percent: i64,
    pub projects_updated: u64,
    pub steps: Vec<StepReport>,
}

/// Raise every matching project's budget in one statement.
///
/// Runs in its own unit of work, separate from orders. The check counts the
/// matching projects and the update must touch exactly that many.
#[derive(Debug, Clone)]
pub struct RaiseBudgets {
    raise: BudgetRaise,
}

impl RaiseBudgets {
    pub fn new(raise: BudgetRaise) -> Self {
        Self { raise }
    }
}

#[async_trait]
impl Workflow for RaiseBudgets {
    type Output = BudgetReceipt;

    fn name(&self) -> &'static str {
        "raise_budgets"
    }

    async fn check(&self, uow: &mut UnitOfWork) -> Result<PreconditionResult, TxError> {
        check_budget_targets(uow, self.raise.since()).await
    }

    async fn apply(&self, uow: &mut UnitOfWork, matching: i64) -> Result<BudgetReceipt, TxError> {
        let mut seq = MutationSequencer::new(uow);
        let outcome = seq
            .step(
                Statement::RaiseBudgets {
                    since: self.raise.since(),
                    percent: self.raise.percent(),
                },
                Expect::Exactly(matching.max(0) as u64),
            )
            .await?;

        Ok(BudgetReceipt {
            since: self.raise.since(),
            percent: self.raise.percent(),
            projects_updated: outcome.rows_affected,
            steps: seq.finish(),
        })
    }
}
