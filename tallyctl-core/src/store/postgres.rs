//! PostgreSQL store backed by `sqlx::PgPool`.
//!
//! Pool sizing, lifetimes and timeouts come from [`DatabaseConfig`]. A
//! transaction owns its pooled connection until commit or rollback; if it is
//! dropped instead, sqlx rolls it back before the connection returns to the pool.
//!
//! With a statement timeout set, every transaction also carries
//! `SET LOCAL statement_timeout`, so the server cancels a statement the client
//! has stopped waiting for and the connection is free for `ROLLBACK`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::postgres::{PgPoolOptions, Postgres};
use sqlx::{PgPool, Row};
use tracing::debug;

use super::{ExecOutcome, IsolationLevel, Statement, Store, Transaction};
use crate::config::DatabaseConfig;
use crate::error::{StoreError, StoreResult};
use crate::model::{Album, AlbumId, Project, ProjectId, UserId};

/// PostgreSQL-backed store
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    statement_timeout: Option<Duration>,
}

/// SQLSTATE for a statement cancelled by `statement_timeout`
const QUERY_CANCELED: &str = "57014";

impl PgStore {
    /// Connect a pool using the configured limits.
    ///
    /// # Errors
    ///
    /// Returns an error if the first connection cannot be established.
    pub async fn connect(config: &DatabaseConfig) -> StoreResult<Self> {
        let pool = Self::pool_options(config).connect(&config.url).await?;
        Ok(Self::from_pool(pool))
    }

    /// Build the pool without connecting; the first acquire opens a connection.
    ///
    /// Only a malformed url fails here. An unreachable server surfaces later as
    /// a connection error from `begin` or `ping`.
    pub fn connect_lazy(config: &DatabaseConfig) -> StoreResult<Self> {
        let pool = Self::pool_options(config).connect_lazy(&config.url)?;
        Ok(Self::from_pool(pool))
    }

    fn pool_options(config: &DatabaseConfig) -> PgPoolOptions {
        PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .max_lifetime(config.max_lifetime())
            .idle_timeout(config.idle_timeout())
            .acquire_timeout(config.acquire_timeout())
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            statement_timeout: None,
        }
    }

    /// Have the server cancel any statement running longer than `limit`.
    ///
    /// Pass the coordinator's round-trip bound here.
    pub fn with_statement_timeout(mut self, limit: Duration) -> Self {
        self.statement_timeout = Some(limit);
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self, isolation: IsolationLevel) -> StoreResult<Box<dyn Transaction>> {
        let mut tx = self.pool.begin().await?;
        // Must be the first statement of the transaction
        sqlx::query(&format!(
            "SET TRANSACTION ISOLATION LEVEL {}",
            isolation.as_sql()
        ))
        .execute(&mut *tx)
        .await?;
        if let Some(limit) = self.statement_timeout {
            sqlx::query(&statement_timeout_sql(limit))
                .execute(&mut *tx)
                .await?;
        }
        debug!(
            %isolation,
            statement_timeout = ?self.statement_timeout,
            "postgres transaction opened"
        );
        Ok(Box::new(PgTransaction {
            tx,
            statement_timeout: self.statement_timeout,
        }))
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn projects(&self) -> StoreResult<Vec<Project>> {
        let mut projects: Vec<Project> = sqlx::query_as(
            r#"
            SELECT id, name, description, budget, finished, start_date, company_id
            FROM projects
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        // One query for every assignment instead of one per project
        let rows = sqlx::query(
            r#"
            SELECT project_id, user_id
            FROM projects_users
            ORDER BY project_id, user_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut users: HashMap<ProjectId, Vec<UserId>> = HashMap::new();
        for row in rows {
            let project: ProjectId = row.try_get("project_id")?;
            let user: UserId = row.try_get("user_id")?;
            users.entry(project).or_default().push(user);
        }
        for project in &mut projects {
            project.user_ids = users.remove(&project.id).unwrap_or_default();
        }

        Ok(projects)
    }

    async fn albums(&self) -> StoreResult<Vec<Album>> {
        let albums = sqlx::query_as(
            r#"
            SELECT id, title, artist, quantity
            FROM album
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(albums)
    }
}

struct PgTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
    statement_timeout: Option<Duration>,
}

/// `SET LOCAL` takes no bind parameters. Zero would disable the limit.
fn statement_timeout_sql(limit: Duration) -> String {
    let millis = limit.as_millis().clamp(1, i32::MAX as u128);
    format!("SET LOCAL statement_timeout = {}", millis)
}

/// Like `StoreError::from`, but a server-side cancellation reads as a timeout
fn classify(err: sqlx::Error, statement_timeout: Option<Duration>) -> StoreError {
    if let (sqlx::Error::Database(db), Some(limit)) = (&err, statement_timeout) {
        if db.code().as_deref() == Some(QUERY_CANCELED) {
            return StoreError::Timeout(limit);
        }
    }
    StoreError::from(err)
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn album_quantity(&mut self, album: AlbumId) -> StoreResult<Option<i64>> {
        let quantity: Option<(i64,)> = sqlx::query_as("SELECT quantity FROM album WHERE id = $1")
            .bind(album)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| classify(e, self.statement_timeout))?;
        Ok(quantity.map(|(q,)| q))
    }

    async fn count_projects_since(&mut self, since: NaiveDate) -> StoreResult<u64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM projects WHERE start_date >= $1")
                .bind(since)
                .fetch_one(&mut *self.tx)
                .await
                .map_err(|e| classify(e, self.statement_timeout))?;
        Ok(count.max(0) as u64)
    }

    async fn execute(&mut self, statement: &Statement) -> StoreResult<ExecOutcome> {
        let limit = self.statement_timeout;
        match statement {
            Statement::DecrementInventory { album, quantity } => {
                let result = sqlx::query(
                    r#"
                    UPDATE album
                    SET quantity = quantity - $1
                    WHERE id = $2 AND quantity >= $1
                    "#,
                )
                .bind(quantity)
                .bind(album)
                .execute(&mut *self.tx)
                .await
                .map_err(|e| classify(e, limit))?;
                Ok(ExecOutcome {
                    rows_affected: result.rows_affected(),
                    last_insert_id: None,
                })
            }
            Statement::InsertOrder {
                album,
                customer,
                quantity,
                placed_at,
            } => {
                let (id,): (i64,) = sqlx::query_as(
                    r#"
                    INSERT INTO album_order (album_id, cust_id, quantity, date)
                    VALUES ($1, $2, $3, $4)
                    RETURNING id
                    "#,
                )
                .bind(album)
                .bind(customer)
                .bind(quantity)
                .bind(placed_at)
                .fetch_one(&mut *self.tx)
                .await
                .map_err(|e| classify(e, limit))?;
                Ok(ExecOutcome {
                    rows_affected: 1,
                    last_insert_id: Some(id),
                })
            }
            Statement::RaiseBudgets { since, percent } => {
                // numeric product; only a result past bigint range fails (22003)
                let result = sqlx::query(
                    r#"
                    UPDATE projects
                    SET budget = ROUND(budget::numeric * (100 + $1) / 100)
                    WHERE start_date >= $2
                    "#,
                )
                .bind(percent)
                .bind(since)
                .execute(&mut *self.tx)
                .await
                .map_err(|e| classify(e, limit))?;
                Ok(ExecOutcome {
                    rows_affected: result.rows_affected(),
                    last_insert_id: None,
                })
            }
        }
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let limit = self.statement_timeout;
        self.tx.commit().await.map_err(|e| classify(e, limit))
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
