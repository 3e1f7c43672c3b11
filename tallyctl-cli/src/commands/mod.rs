//! Command implementations for tallyctl CLI

pub mod demo;
pub mod inspect;
pub mod mutate;

use anyhow::{Context, Result};
use tallyctl_core::{PgStore, TallyConfig};

// Re-export dispatcher functions for flat access from main.rs
pub use demo::run_demo;
pub use inspect::{run_albums, run_projects, run_status};
pub use mutate::{run_order, run_raise_budgets};

/// Lazily connected pool; unreachable servers surface on first use.
///
/// The server enforces the same per-statement bound as the coordinator.
pub(crate) fn connect(config: &TallyConfig) -> Result<PgStore> {
    let store = PgStore::connect_lazy(&config.database)
        .with_context(|| format!("Invalid database url {}", config.redacted_url()))?;
    Ok(store.with_statement_timeout(config.transactions.round_trip_timeout()))
}
