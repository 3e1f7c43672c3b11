//! Walk through the order and budget workflows on a seeded in-memory store,
//! including the failure paths that are hard to provoke against a real server.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Serialize;
use tallyctl_core::{
    fetch_albums, fetch_projects, run_with_retry, AlbumId, BudgetRaise, Coordinator, Fault,
    MemoryStore, MutationReport, OrderRequest, PlaceOrder, RaiseBudgets, RetryPolicy,
    StatementKind, StoreError, TxError, TxSettings, Workflow,
};

use super::inspect::{print_albums, print_projects};
use crate::protocol::{is_json_mode, output};

#[derive(Debug, Serialize)]
struct DemoStep {
    scenario: &'static str,
    summary: String,
    report: serde_json::Value,
}

#[derive(Serialize)]
struct DemoOutput {
    steps: Vec<DemoStep>,
    albums: Vec<tallyctl_core::Album>,
    projects: Vec<tallyctl_core::Project>,
}

fn order(album: i64, quantity: i64) -> Result<PlaceOrder> {
    let request = OrderRequest::new(AlbumId(album), quantity, None).context("Invalid order")?;
    Ok(PlaceOrder::new(request))
}

fn label<T: Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(str::to_owned))
        .unwrap_or_default()
}

fn record<T: Serialize + Clone>(
    steps: &mut Vec<DemoStep>,
    scenario: &'static str,
    workflow: &'static str,
    result: Result<T, TxError>,
) -> Result<()> {
    let report = MutationReport::from_result(workflow, &result);
    let summary = match &report {
        MutationReport::Committed { .. } => "committed".to_string(),
        MutationReport::Failed {
            error,
            reason,
            rollback,
            ..
        } => format!(
            "{}, rollback {}: {}",
            label(error),
            label(rollback),
            reason
        ),
    };
    steps.push(DemoStep {
        scenario,
        summary,
        report: serde_json::to_value(&report).context("Failed to serialize report")?,
    });
    Ok(())
}

async fn run_one<W>(
    coordinator: &Coordinator<MemoryStore>,
    steps: &mut Vec<DemoStep>,
    scenario: &'static str,
    work: W,
) -> Result<()>
where
    W: Workflow,
    W::Output: Serialize + Clone,
{
    let result = coordinator.run(&work).await;
    record(steps, scenario, work.name(), result)
}

pub async fn run_demo() -> Result<()> {
    let store = MemoryStore::demo();
    let coordinator = Coordinator::new(store.clone(), TxSettings::default());
    let mut steps = Vec::new();

    run_one(&coordinator, &mut steps, "order within inventory", order(1, 3)?).await?;
    run_one(&coordinator, &mut steps, "order beyond inventory", order(2, 3)?).await?;
    run_one(&coordinator, &mut steps, "order for unknown album", order(99, 1)?).await?;

    store.inject(Fault::FailStatement(
        StatementKind::InsertOrder,
        StoreError::constraint("23514", "album_order_quantity_check"),
    ));
    run_one(&coordinator, &mut steps, "insert fails after decrement", order(3, 2)?).await?;

    store.inject(Fault::FailStatement(
        StatementKind::DecrementInventory,
        StoreError::conflict("40001", "could not serialize access"),
    ));
    let work = order(3, 2)?;
    let result = run_with_retry(&coordinator, &work, RetryPolicy::with_retries(2)).await;
    record(&mut steps, "conflict retried", work.name(), result)?;

    let since = NaiveDate::from_ymd_opt(1991, 1, 1).context("Invalid cutoff date")?;
    let raise = BudgetRaise::new(since, 20).context("Invalid budget raise")?;
    run_one(&coordinator, &mut steps, "budget raise", RaiseBudgets::new(raise)).await?;

    store.inject(Fault::FailCommit(StoreError::Connection(
        "connection reset by peer".into(),
    )));
    run_one(&coordinator, &mut steps, "commit not acknowledged", order(1, 1)?).await?;

    store.inject(Fault::FailStatement(
        StatementKind::InsertOrder,
        StoreError::constraint("23514", "album_order_quantity_check"),
    ));
    store.inject(Fault::FailRollback(StoreError::Connection(
        "server closed the connection".into(),
    )));
    run_one(&coordinator, &mut steps, "rollback fails", order(3, 1)?).await?;

    let limit = coordinator.settings().round_trip_timeout;
    let demo = DemoOutput {
        steps,
        albums: fetch_albums(&store, limit).await?,
        projects: fetch_projects(&store, limit).await?,
    };

    output(demo, |demo| {
        for (i, step) in demo.steps.iter().enumerate() {
            println!("{}. {}: {}", i + 1, step.scenario, step.summary);
        }
        println!();
        print_albums(&demo.albums);
        println!();
        print_projects(&demo.projects);
    });
    if !is_json_mode() {
        println!("\n(in-memory store; nothing was written to a database)");
    }
    Ok(())
}
