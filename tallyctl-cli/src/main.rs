//! tallyctl CLI - transactional inventory and budget mutations
//!
//! Every mutating command runs as one unit of work: the precondition is
//! checked inside the transaction, the statements run in order, and the
//! whole thing commits or rolls back.
//!
//! - `order` / `raise-budgets`: mutations against PostgreSQL
//! - `projects` / `albums` / `status`: read-only inspection
//! - `demo`: the same workflows against a seeded in-memory store

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tallyctl_core::TallyConfig;

mod commands;
mod config;
mod protocol;
mod tracing_setup;

#[derive(Parser, Debug)]
#[command(
    name = "tallyctl",
    author,
    version,
    about = "Check-then-mutate transactions for album inventory and project budgets",
    long_about = "Run business mutations as single units of work: preconditions are checked \
                  inside the transaction, dependent statements run in order, and any failure \
                  rolls the whole unit back."
)]
struct Cli {
    /// Emit a JSON envelope on stdout instead of human output
    #[arg(long, global = true)]
    json: bool,

    /// Debug logging on stderr (RUST_LOG still wins)
    #[arg(long, global = true)]
    debug: bool,

    /// Export spans over OTLP (needs the `telemetry` feature)
    #[arg(long, global = true)]
    otel: bool,

    /// Database url, overriding [database].url
    #[arg(long, global = true, env = "DATABASE_URL", hide_env_values = true)]
    database_url: Option<String>,

    /// Config file (default: ~/.tallyctl/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Order copies of an album (checks inventory, decrements it, records the order)
    Order(commands::mutate::OrderArgs),
    /// Raise the budget of every project started on or after a date
    RaiseBudgets(commands::mutate::RaiseArgs),
    /// List projects with their assigned users
    Projects,
    /// List albums with their current inventory
    Albums,
    /// Ping the database and report up or down
    Status,
    /// Run the order and budget scenarios against an in-memory store
    Demo,
    /// Manage tallyctl configuration (init, show, path)
    Config(config::ConfigArgs),
    /// Generate shell completion scripts
    Completions(CompletionsArgs),
}

#[derive(Parser, Debug)]
struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    shell: Shell,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
#[allow(clippy::enum_variant_names)] // PowerShell is a proper noun, not a suffix
enum Shell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Elvish,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    protocol::init_json_mode(cli.json);
    tracing_setup::init(&tracing_setup::TracingConfig {
        debug: cli.debug,
        otel: cli.otel,
        json: cli.json,
    })
    .ok();

    let result = protocol::handle_result(run(cli).await);
    tracing_setup::shutdown_otel();
    result
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Order(ref args) => commands::run_order(args, &load_config(&cli)?).await,
        Commands::RaiseBudgets(ref args) => {
            commands::run_raise_budgets(args, &load_config(&cli)?).await
        }
        Commands::Projects => commands::run_projects(&load_config(&cli)?).await,
        Commands::Albums => commands::run_albums(&load_config(&cli)?).await,
        Commands::Status => commands::run_status(&load_config(&cli)?).await,
        Commands::Demo => commands::run_demo().await,
        Commands::Config(ref args) => config::run_config(args, cli.config.clone()),
        Commands::Completions(ref args) => run_completions(args),
    }
}

fn load_config(cli: &Cli) -> Result<TallyConfig> {
    let path = cli.config.clone().unwrap_or_else(TallyConfig::config_path);
    let mut config = TallyConfig::load_from(&path)
        .with_context(|| format!("Failed to load config from {:?}", path))?;
    if let Some(url) = &cli.database_url {
        config.database.url = url.clone();
    }
    Ok(config)
}

fn run_completions(args: &CompletionsArgs) -> Result<()> {
    use clap::CommandFactory;
    use clap_complete::{generate, Shell as CompletionShell};
    use std::io;

    let mut cmd = Cli::command();
    let bin_name = cmd.get_name().to_string();

    let shell = match args.shell {
        Shell::Bash => CompletionShell::Bash,
        Shell::Zsh => CompletionShell::Zsh,
        Shell::Fish => CompletionShell::Fish,
        Shell::PowerShell => CompletionShell::PowerShell,
        Shell::Elvish => CompletionShell::Elvish,
    };

    generate(shell, &mut cmd, bin_name, &mut io::stdout());

    Ok(())
}
