use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tallyctl_core::TallyConfig;

use crate::protocol::{is_json_mode, output, output_message};

#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Write a config file with default values
    Init(InitArgs),
    /// Show the effective configuration (password redacted)
    Show,
    /// Show config file path
    Path,
}

#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Force overwrite existing config
    #[arg(long, short)]
    pub force: bool,
}

pub fn run_config(args: &ConfigArgs, path: Option<PathBuf>) -> Result<()> {
    let path = path.unwrap_or_else(TallyConfig::config_path);
    match &args.command {
        ConfigCommands::Init(args) => run_init(args, path),
        ConfigCommands::Show => run_show(path),
        ConfigCommands::Path => {
            output_message(path.display().to_string());
            Ok(())
        }
    }
}

fn run_init(args: &InitArgs, path: PathBuf) -> Result<()> {
    if path.exists() && !args.force {
        anyhow::bail!(
            "Config already exists at {:?}\n\nUse --force to overwrite",
            path
        );
    }

    TallyConfig::default().save_to(&path)?;
    output_message(format!("Wrote default config to {}", path.display()));
    Ok(())
}

fn run_show(path: PathBuf) -> Result<()> {
    let mut config = TallyConfig::load_from(&path)
        .with_context(|| format!("Failed to load config from {:?}", path))?;
    config.database.url = config.redacted_url();

    if is_json_mode() {
        output(config, |_| {});
        return Ok(());
    }

    let rendered =
        toml::to_string_pretty(&config).context("Failed to serialize config to TOML")?;
    println!("# {}", path.display());
    print!("{}", rendered);
    Ok(())
}
