pub mod config;
pub mod coordinator;
pub mod error;
pub mod model;
pub mod precondition;
pub mod projection;
pub mod report;
pub mod retry;
pub mod sequencer;
pub mod store;
pub mod uow;
pub mod workflow;

pub use config::{BudgetConfig, DatabaseConfig, TallyConfig, TransactionConfig};
pub use coordinator::{Coordinator, TxSettings};
pub use error::{ErrorKind, StoreError, TxError};
pub use model::{
    raised_budget, Album, AlbumId, BudgetRaise, CompanyId, CustomerId, Order, OrderId,
    OrderRequest, Project, ProjectId, UserId, ValidationError,
};
pub use precondition::{check_budget_targets, check_inventory, PreconditionResult};
pub use projection::{fetch_albums, fetch_projects, health, HealthStatus};
pub use report::{MutationReport, RollbackStatus};
pub use retry::{run_with_retry, RetryPolicy};
pub use sequencer::{Expect, MutationSequencer, StepReport};
pub use store::{
    ExecOutcome, Fault, IsolationLevel, MemoryStore, PgStore, Statement, StatementKind, Store,
    Transaction,
};
pub use uow::{UnitOfWork, UowState};
pub use workflow::{BudgetReceipt, OrderReceipt, PlaceOrder, RaiseBudgets, Workflow};
