//! In-memory store with fault injection.
//!
//! Units of work run one at a time: `begin` takes an owned lock on the tables
//! and the transaction mutates a private copy that replaces the tables on
//! commit. That is serial execution, which satisfies every isolation level.
//!
//! Faults are one-shot and consumed by the first operation they match, so a
//! test can make exactly one statement, commit or rollback misbehave.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use super::{ExecOutcome, IsolationLevel, Statement, StatementKind, Store, Transaction};
use crate::error::{StoreError, StoreResult};
use crate::model::{
    raised_budget, Album, AlbumId, CompanyId, Order, OrderId, Project, ProjectId, UserId,
};

/// One-shot misbehaviour for the next matching operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Next statement of this kind fails with the error
    FailStatement(StatementKind, StoreError),
    /// Next statement of this kind reports zero affected rows and changes nothing
    ZeroRows(StatementKind),
    /// Next statement of this kind sleeps before running
    Stall(StatementKind, Duration),
    /// Next `begin` sleeps after taking the lock
    StallBegin(Duration),
    FailCommit(StoreError),
    FailRollback(StoreError),
}

#[derive(Debug, Clone, Default)]
struct Tables {
    albums: BTreeMap<AlbumId, Album>,
    projects: BTreeMap<ProjectId, Project>,
    orders: Vec<Order>,
    next_order_id: i64,
}

struct Inner {
    tables: Arc<Mutex<Tables>>,
    faults: StdMutex<Vec<Fault>>,
    open: AtomicUsize,
    available: AtomicBool,
    begun_with: StdMutex<Vec<IsolationLevel>>,
}

impl Inner {
    fn take_fault(&self, matches: impl Fn(&Fault) -> bool) -> Option<Fault> {
        let mut faults = self.faults.lock().unwrap_or_else(|e| e.into_inner());
        let index = faults.iter().position(matches)?;
        Some(faults.remove(index))
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Connection("connection refused".to_owned()))
        }
    }
}

/// Shared handle to an in-memory store. Clones see the same tables.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new(albums: Vec<Album>, projects: Vec<Project>) -> Self {
        let tables = Tables {
            albums: albums.into_iter().map(|a| (a.id, a)).collect(),
            projects: projects.into_iter().map(|p| (p.id, p)).collect(),
            orders: Vec::new(),
            next_order_id: 1,
        };
        Self {
            inner: Arc::new(Inner {
                tables: Arc::new(Mutex::new(tables)),
                faults: StdMutex::new(Vec::new()),
                open: AtomicUsize::new(0),
                available: AtomicBool::new(true),
                begun_with: StdMutex::new(Vec::new()),
            }),
        }
    }

    /// Small catalogue used by the `demo` command and tests
    pub fn demo() -> Self {
        let date = |y, m, d| NaiveDate::from_ymd_opt(y, m, d).unwrap_or_default();
        let albums = vec![
            Album {
                id: AlbumId(1),
                title: "Blue Train".into(),
                artist: "John Coltrane".into(),
                quantity: 5,
            },
            Album {
                id: AlbumId(2),
                title: "Giant Steps".into(),
                artist: "John Coltrane".into(),
                quantity: 2,
            },
            Album {
                id: AlbumId(3),
                title: "Jeru".into(),
                artist: "Gerry Mulligan".into(),
                quantity: 10,
            },
        ];
        let projects = vec![
            Project {
                id: ProjectId(1),
                name: "Catalogue import".into(),
                description: "Load legacy catalogue".into(),
                budget: 10_000,
                finished: true,
                start_date: date(1989, 6, 1),
                company_id: CompanyId(1),
                user_ids: vec![UserId(1)],
            },
            Project {
                id: ProjectId(2),
                name: "Storefront".into(),
                description: "Online ordering".into(),
                budget: 25_000,
                finished: false,
                start_date: date(2020, 3, 15),
                company_id: CompanyId(1),
                user_ids: vec![UserId(1), UserId(2)],
            },
            Project {
                id: ProjectId(3),
                name: "Warehouse sync".into(),
                description: "Inventory reconciliation".into(),
                budget: 7_505,
                finished: false,
                start_date: date(2021, 1, 10),
                company_id: CompanyId(2),
                user_ids: vec![],
            },
        ];
        Self::new(albums, projects)
    }

    pub fn inject(&self, fault: Fault) {
        self.inner
            .faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(fault);
    }

    /// Faults that have not fired yet
    pub fn pending_faults(&self) -> usize {
        self.inner
            .faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Simulate the store going away (`false`) or coming back (`true`)
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Transactions currently holding a connection
    pub fn open_transactions(&self) -> usize {
        self.inner.open.load(Ordering::SeqCst)
    }

    /// Isolation level requested by every `begin`, in order
    pub fn begun_with(&self) -> Vec<IsolationLevel> {
        self.inner
            .begun_with
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub async fn album(&self, id: AlbumId) -> Option<Album> {
        self.inner.tables.lock().await.albums.get(&id).cloned()
    }

    pub async fn project(&self, id: ProjectId) -> Option<Project> {
        self.inner.tables.lock().await.projects.get(&id).cloned()
    }

    pub async fn orders(&self) -> Vec<Order> {
        self.inner.tables.lock().await.orders.clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self, isolation: IsolationLevel) -> StoreResult<Box<dyn Transaction>> {
        self.inner.check_available()?;
        let committed = self.inner.tables.clone().lock_owned().await;
        let release = ConnectionSlot::acquire(self.inner.clone());
        self.inner
            .begun_with
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(isolation);

        if let Some(Fault::StallBegin(delay)) =
            self.inner.take_fault(|f| matches!(f, Fault::StallBegin(_)))
        {
            tokio::time::sleep(delay).await;
        }

        let working = committed.clone();
        debug!(%isolation, "memory transaction opened");
        Ok(Box::new(MemoryTransaction {
            committed,
            working,
            inner: self.inner.clone(),
            _slot: release,
        }))
    }

    async fn ping(&self) -> StoreResult<()> {
        self.inner.check_available()
    }

    async fn projects(&self) -> StoreResult<Vec<Project>> {
        self.inner.check_available()?;
        Ok(self.inner.tables.lock().await.projects.values().cloned().collect())
    }

    async fn albums(&self) -> StoreResult<Vec<Album>> {
        self.inner.check_available()?;
        Ok(self.inner.tables.lock().await.albums.values().cloned().collect())
    }
}

/// Counts a held connection until dropped
struct ConnectionSlot {
    inner: Arc<Inner>,
}

impl ConnectionSlot {
    fn acquire(inner: Arc<Inner>) -> Self {
        inner.open.fetch_add(1, Ordering::SeqCst);
        Self { inner }
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.inner.open.fetch_sub(1, Ordering::SeqCst);
    }
}

struct MemoryTransaction {
    committed: OwnedMutexGuard<Tables>,
    working: Tables,
    inner: Arc<Inner>,
    _slot: ConnectionSlot,
}

impl MemoryTransaction {
    fn apply(&mut self, statement: &Statement) -> StoreResult<ExecOutcome> {
        let tables = &mut self.working;
        match statement {
            Statement::DecrementInventory { album, quantity } => {
                let rows = match tables.albums.get_mut(album) {
                    Some(row) if row.quantity >= *quantity => {
                        row.quantity -= quantity;
                        1
                    }
                    _ => 0,
                };
                Ok(ExecOutcome {
                    rows_affected: rows,
                    last_insert_id: None,
                })
            }
            Statement::InsertOrder {
                album,
                customer,
                quantity,
                placed_at,
            } => {
                if !tables.albums.contains_key(album) {
                    return Err(StoreError::constraint(
                        "23503",
                        "insert on album_order violates foreign key album_order_album_id_fkey",
                    ));
                }
                let id = tables.next_order_id;
                tables.next_order_id += 1;
                tables.orders.push(Order {
                    id: OrderId(id),
                    album_id: *album,
                    cust_id: *customer,
                    quantity: *quantity,
                    date: *placed_at,
                });
                Ok(ExecOutcome {
                    rows_affected: 1,
                    last_insert_id: Some(id),
                })
            }
            Statement::RaiseBudgets { since, percent } => {
                // All or nothing, like the single UPDATE it stands in for
                let mut raised = Vec::new();
                for project in tables.projects.values() {
                    if project.start_date >= *since {
                        let budget = raised_budget(project.budget, *percent).ok_or_else(|| {
                            StoreError::Other("bigint out of range (22003)".to_owned())
                        })?;
                        raised.push((project.id, budget));
                    }
                }
                let rows = raised.len() as u64;
                for (id, budget) in raised {
                    if let Some(project) = tables.projects.get_mut(&id) {
                        project.budget = budget;
                    }
                }
                Ok(ExecOutcome {
                    rows_affected: rows,
                    last_insert_id: None,
                })
            }
        }
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn album_quantity(&mut self, album: AlbumId) -> StoreResult<Option<i64>> {
        Ok(self.working.albums.get(&album).map(|a| a.quantity))
    }

    async fn count_projects_since(&mut self, since: NaiveDate) -> StoreResult<u64> {
        Ok(self
            .working
            .projects
            .values()
            .filter(|p| p.start_date >= since)
            .count() as u64)
    }

    async fn execute(&mut self, statement: &Statement) -> StoreResult<ExecOutcome> {
        let kind = statement.kind();
        let fault = self.inner.take_fault(|f| match f {
            Fault::FailStatement(k, _) | Fault::ZeroRows(k) | Fault::Stall(k, _) => *k == kind,
            _ => false,
        });
        match fault {
            Some(Fault::FailStatement(_, err)) => return Err(err),
            Some(Fault::ZeroRows(_)) => return Ok(ExecOutcome::default()),
            Some(Fault::Stall(_, delay)) => tokio::time::sleep(delay).await,
            _ => {}
        }
        self.apply(statement)
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let MemoryTransaction {
            mut committed,
            working,
            inner,
            _slot,
        } = *self;
        if let Some(Fault::FailCommit(err)) =
            inner.take_fault(|f| matches!(f, Fault::FailCommit(_)))
        {
            return Err(err);
        }
        *committed = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        if let Some(Fault::FailRollback(err)) =
            self.inner.take_fault(|f| matches!(f, Fault::FailRollback(_)))
        {
            return Err(err);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn uncommitted_work_is_discarded() {
        let store = MemoryStore::demo();
        let mut tx = store.begin(IsolationLevel::Serializable).await.unwrap();
        let outcome = tx
            .execute(&Statement::DecrementInventory {
                album: AlbumId(1),
                quantity: 2,
            })
            .await
            .unwrap();
        assert_eq!(outcome.rows_affected, 1);
        assert_eq!(tx.album_quantity(AlbumId(1)).await.unwrap(), Some(3));
        tx.rollback().await.unwrap();

        assert_eq!(store.album(AlbumId(1)).await.unwrap().quantity, 5);
        assert_eq!(store.open_transactions(), 0);
    }

    #[tokio::test]
    async fn decrement_is_guarded_by_quantity() {
        let store = MemoryStore::demo();
        let mut tx = store.begin(IsolationLevel::Serializable).await.unwrap();
        let outcome = tx
            .execute(&Statement::DecrementInventory {
                album: AlbumId(2),
                quantity: 3,
            })
            .await
            .unwrap();
        assert_eq!(outcome.rows_affected, 0);
        tx.commit().await.unwrap();
        assert_eq!(store.album(AlbumId(2)).await.unwrap().quantity, 2);
    }

    #[tokio::test]
    async fn order_insert_checks_foreign_key() {
        let store = MemoryStore::demo();
        let mut tx = store.begin(IsolationLevel::Serializable).await.unwrap();
        let err = tx
            .execute(&Statement::InsertOrder {
                album: AlbumId(99),
                customer: None,
                quantity: 1,
                placed_at: Utc::now(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Constraint { ref code, .. } if code == "23503"));
    }

    #[tokio::test]
    async fn budget_overflow_fails_the_whole_statement() {
        let mut projects = MemoryStore::demo().projects().await.unwrap();
        projects[2].budget = i64::MAX;
        let store = MemoryStore::new(vec![], projects);

        let mut tx = store.begin(IsolationLevel::Serializable).await.unwrap();
        let err = tx
            .execute(&Statement::RaiseBudgets {
                since: NaiveDate::from_ymd_opt(1991, 1, 1).unwrap(),
                percent: 20,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Other(ref msg) if msg.contains("22003")));
        tx.commit().await.unwrap();

        // Storefront sorts before the overflowing project and is untouched
        assert_eq!(store.project(ProjectId(2)).await.unwrap().budget, 25_000);
    }

    #[tokio::test]
    async fn faults_fire_once() {
        let store = MemoryStore::demo();
        store.inject(Fault::ZeroRows(StatementKind::DecrementInventory));
        let statement = Statement::DecrementInventory {
            album: AlbumId(3),
            quantity: 1,
        };

        let mut tx = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
        assert_eq!(tx.execute(&statement).await.unwrap().rows_affected, 0);
        assert_eq!(tx.execute(&statement).await.unwrap().rows_affected, 1);
        tx.commit().await.unwrap();

        assert_eq!(store.pending_faults(), 0);
        assert_eq!(store.album(AlbumId(3)).await.unwrap().quantity, 9);
        assert_eq!(store.begun_with(), vec![IsolationLevel::ReadCommitted]);
    }

    #[tokio::test]
    async fn unavailable_store_refuses_connections() {
        let store = MemoryStore::demo();
        store.set_available(false);
        assert!(store.ping().await.is_err());
        assert!(matches!(
            store.begin(IsolationLevel::Serializable).await,
            Err(StoreError::Connection(_))
        ));
        store.set_available(true);
        assert!(store.ping().await.is_ok());
    }
}
