use anyhow::{Context, Result};
use serde::Serialize;
use tallyctl_core::{fetch_albums, fetch_projects, health, Album, HealthStatus, Project, TallyConfig};

use super::connect;
use crate::protocol::output;

pub async fn run_projects(config: &TallyConfig) -> Result<()> {
    let store = connect(config)?;
    let projects = fetch_projects(&store, config.transactions.round_trip_timeout())
        .await
        .context("Failed to list projects")?;
    output(projects, |projects| print_projects(projects));
    Ok(())
}

pub async fn run_albums(config: &TallyConfig) -> Result<()> {
    let store = connect(config)?;
    let albums = fetch_albums(&store, config.transactions.round_trip_timeout())
        .await
        .context("Failed to list albums")?;
    output(albums, |albums| print_albums(albums));
    Ok(())
}

#[derive(Serialize)]
struct StatusReport {
    database: HealthStatus,
    url: String,
}

/// Prints `up` or `down`; a down database is a report, not an error
pub async fn run_status(config: &TallyConfig) -> Result<()> {
    let store = connect(config)?;
    let report = StatusReport {
        database: health(&store, config.database.ping_timeout()).await,
        url: config.redacted_url(),
    };
    output(report, |r| println!("{}", r.database));
    Ok(())
}

pub(crate) fn print_projects(projects: &[Project]) {
    println!(
        "{:>4}  {:<24} {:>12}  {:<10}  {:<8}  USERS",
        "ID", "NAME", "BUDGET", "START", "FINISHED"
    );
    for p in projects {
        let users = p
            .user_ids
            .iter()
            .map(|u| u.to_string())
            .collect::<Vec<_>>()
            .join(",");
        println!(
            "{:>4}  {:<24} {:>12}  {:<10}  {:<8}  {}",
            p.id,
            truncate(&p.name, 24),
            p.budget,
            p.start_date,
            if p.finished { "yes" } else { "no" },
            if users.is_empty() { "-".to_string() } else { users }
        );
    }
}

pub(crate) fn print_albums(albums: &[Album]) {
    println!("{:>4}  {:<24} {:<20} {:>8}", "ID", "TITLE", "ARTIST", "QUANTITY");
    for a in albums {
        println!(
            "{:>4}  {:<24} {:<20} {:>8}",
            a.id,
            truncate(&a.title, 24),
            truncate(&a.artist, 20),
            a.quantity
        );
    }
}

fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        return s.to_string();
    }
    let mut out: String = s.chars().take(width.saturating_sub(1)).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("Blue Train", 24), "Blue Train");
        assert_eq!(truncate("Ascenseur pour l'échafaud", 10), "Ascenseur…");
        assert_eq!(truncate("échafaud", 3).chars().count(), 3);
    }
}
