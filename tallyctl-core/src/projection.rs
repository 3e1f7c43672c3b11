//! Read-only projections and the health ping.
//!
//! These run on pooled connections outside any unit of work.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult, TxError};
use crate::model::{Album, Project};
use crate::store::Store;

async fn within<T>(
    limit: Duration,
    fut: impl std::future::Future<Output = StoreResult<T>>,
) -> StoreResult<T> {
    tokio::time::timeout(limit, fut)
        .await
        .unwrap_or(Err(StoreError::Timeout(limit)))
}

/// All projects with their user ids, ordered by id
pub async fn fetch_projects<S: Store + ?Sized>(
    store: &S,
    limit: Duration,
) -> Result<Vec<Project>, TxError> {
    let projects = within(limit, store.projects())
        .await
        .map_err(|source| TxError::Projection {
            what: "projects",
            source,
        })?;
    debug!(count = projects.len(), "projects fetched");
    Ok(projects)
}

/// All albums with their current inventory, ordered by id
pub async fn fetch_albums<S: Store + ?Sized>(
    store: &S,
    limit: Duration,
) -> Result<Vec<Album>, TxError> {
    let albums = within(limit, store.albums())
        .await
        .map_err(|source| TxError::Projection {
            what: "albums",
            source,
        })?;
    debug!(count = albums.len(), "albums fetched");
    Ok(albums)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Up,
    Down,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Up => f.write_str("up"),
            Self::Down => f.write_str("down"),
        }
    }
}

/// Ping the store; anything but a prompt success is `Down`
pub async fn health<S: Store + ?Sized>(store: &S, limit: Duration) -> HealthStatus {
    match within(limit, store.ping()).await {
        Ok(()) => HealthStatus::Up,
        Err(err) => {
            warn!(error = %err, "store ping failed");
            HealthStatus::Down
        }
    }
}
