use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::Parser;
use tallyctl_core::{
    run_with_retry, AlbumId, BudgetRaise, Coordinator, CustomerId, OrderRequest, PlaceOrder,
    RaiseBudgets, RetryPolicy, TallyConfig,
};
use tracing::info;

use super::connect;
use crate::protocol::output;

#[derive(Parser, Debug)]
pub struct OrderArgs {
    /// Album id to order
    #[arg(long)]
    pub album: i64,

    /// Number of copies
    #[arg(long, short = 'n')]
    pub quantity: i64,

    /// Customer id recorded on the order
    #[arg(long)]
    pub customer: Option<i64>,

    /// Extra attempts for transient failures (conflicts, timeouts, lost connections)
    #[arg(long, default_value_t = 0)]
    pub retries: u32,
}

#[derive(Parser, Debug)]
pub struct RaiseArgs {
    /// Percentage to add (default: [budget].raise_percent)
    #[arg(long)]
    pub percent: Option<i64>,

    /// Cutoff start date, YYYY-MM-DD (default: [budget].since)
    #[arg(long, value_name = "DATE")]
    pub since: Option<NaiveDate>,

    /// Extra attempts for transient failures
    #[arg(long, default_value_t = 0)]
    pub retries: u32,
}

pub async fn run_order(args: &OrderArgs, config: &TallyConfig) -> Result<()> {
    let request = OrderRequest::new(
        AlbumId(args.album),
        args.quantity,
        args.customer.map(CustomerId),
    )
    .context("Invalid order")?;

    let coordinator = Coordinator::new(connect(config)?, config.tx_settings());
    let receipt = run_with_retry(
        &coordinator,
        &PlaceOrder::new(request),
        RetryPolicy::with_retries(args.retries),
    )
    .await
    .with_context(|| format!("Order for album {} failed", args.album))?;

    info!(order = %receipt.order_id, album = %receipt.album, "order placed");
    output(receipt, |r| {
        println!(
            "order {} placed: album {} x{} ({} left)",
            r.order_id, r.album, r.quantity, r.remaining
        );
    });
    Ok(())
}

pub async fn run_raise_budgets(args: &RaiseArgs, config: &TallyConfig) -> Result<()> {
    let raise = BudgetRaise::new(
        args.since.unwrap_or(config.budget.since),
        args.percent.unwrap_or(config.budget.raise_percent),
    )
    .context("Invalid budget raise")?;

    let coordinator = Coordinator::new(connect(config)?, config.tx_settings());
    let receipt = run_with_retry(
        &coordinator,
        &RaiseBudgets::new(raise),
        RetryPolicy::with_retries(args.retries),
    )
    .await
    .context("Budget raise failed")?;

    output(receipt, |r| {
        println!(
            "raised {} project budget(s) by {}% (started on or after {})",
            r.projects_updated, r.percent, r.since
        );
    });
    Ok(())
}
