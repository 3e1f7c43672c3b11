//! Store seam: what the coordinator needs from a relational store
//!
//! # Design Principles
//!
//! - One `Transaction` is one connection; it is consumed by commit or rollback
//! - Reads that feed a precondition go through the transaction, never the pool
//! - Mutations are typed `Statement`s, so every backend issues the same SQL shape
//! - Projection reads (`projects`, `albums`) use pooled connections outside any
//!   unit of work and fetch associations with a single extra query (no N+1)

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreResult;
use crate::model::{Album, AlbumId, CustomerId, Project};

pub mod memory;
pub mod postgres;

pub use memory::{Fault, MemoryStore};
pub use postgres::PgStore;

/// Transaction isolation levels, weakest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

impl FromStr for IsolationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace([' ', '-'], "_").as_str() {
            "read_committed" => Ok(Self::ReadCommitted),
            "repeatable_read" => Ok(Self::RepeatableRead),
            "serializable" => Ok(Self::Serializable),
            other => Err(format!("unknown isolation level '{}'", other)),
        }
    }
}

/// Mutating statement issued inside a unit of work
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    /// `quantity = quantity - n` guarded by `quantity >= n`
    DecrementInventory { album: AlbumId, quantity: i64 },

    /// New `album_order` row; returns its id
    InsertOrder {
        album: AlbumId,
        customer: Option<CustomerId>,
        quantity: i64,
        placed_at: DateTime<Utc>,
    },

    /// Percentage raise for projects started on or after `since`
    RaiseBudgets { since: NaiveDate, percent: i64 },
}

/// Discriminant of [`Statement`], used for logging and fault injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementKind {
    DecrementInventory,
    InsertOrder,
    RaiseBudgets,
}

impl Statement {
    pub fn kind(&self) -> StatementKind {
        match self {
            Self::DecrementInventory { .. } => StatementKind::DecrementInventory,
            Self::InsertOrder { .. } => StatementKind::InsertOrder,
            Self::RaiseBudgets { .. } => StatementKind::RaiseBudgets,
        }
    }
}

impl StatementKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DecrementInventory => "decrement_inventory",
            Self::InsertOrder => "insert_order",
            Self::RaiseBudgets => "raise_budgets",
        }
    }
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a statement did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ExecOutcome {
    pub rows_affected: u64,
    /// Generated primary key for inserts
    pub last_insert_id: Option<i64>,
}

/// Pooled relational store
#[async_trait]
pub trait Store: Send + Sync {
    /// Acquire a connection and open a transaction at `isolation`.
    async fn begin(&self, isolation: IsolationLevel) -> StoreResult<Box<dyn Transaction>>;

    /// Liveness probe
    async fn ping(&self) -> StoreResult<()>;

    /// All projects with their assigned user ids, ordered by id
    async fn projects(&self) -> StoreResult<Vec<Project>>;

    /// All albums, ordered by id
    async fn albums(&self) -> StoreResult<Vec<Album>>;
}

/// Open transaction bound to a single connection
#[async_trait]
pub trait Transaction: Send {
    /// Current quantity of an album, `None` when the row does not exist
    async fn album_quantity(&mut self, album: AlbumId) -> StoreResult<Option<i64>>;

    /// Number of projects started on or after `since`
    async fn count_projects_since(&mut self, since: NaiveDate) -> StoreResult<u64>;

    async fn execute(&mut self, statement: &Statement) -> StoreResult<ExecOutcome>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;

    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isolation_levels_are_ordered() {
        assert!(IsolationLevel::Serializable > IsolationLevel::RepeatableRead);
        assert!(IsolationLevel::RepeatableRead > IsolationLevel::ReadCommitted);
        assert_eq!(
            IsolationLevel::ReadCommitted.max(IsolationLevel::Serializable),
            IsolationLevel::Serializable
        );
    }

    #[test]
    fn isolation_level_parses_loose_spellings() {
        assert_eq!(
            "repeatable read".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::RepeatableRead
        );
        assert_eq!(
            "Serializable".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::Serializable
        );
        assert!("snapshot".parse::<IsolationLevel>().is_err());
    }
}
