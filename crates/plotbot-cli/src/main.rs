//! PlotBot CLI - keeps proof-of-space plotters busy
//!
//! Usage:
//!   plotbot run                  Run the plotting service until Ctrl-C
//!   plotbot validate             Check the configuration
//!   plotbot init [path]          Write a default configuration
//!   plotbot status               Show instances found in working directories
//!   plotbot parse <file>         Run a progress parser over a file

mod logging;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use plotbot_core::config::DEFAULT_CONFIG_FILE;
use plotbot_core::{ComponentSpec, LoggingConfig, PlotBotConfig};
use plotbot_host::{Drives, LocalDrives, ShellLauncher};
use plotbot_orchestrator::{
    parse_progress, scan_progress_files, validate_config, Orchestrator, ParseOutcome,
    PlotBotService, Registry,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "plotbot")]
#[command(author, version, about = "Proof-of-space plotting automation")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the plotting service until interrupted
    Run,

    /// Validate the configuration and print a summary
    Validate,

    /// Write a default configuration file
    Init {
        /// Where to write (defaults to --config)
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Show the parsed progress of every instance in the working directories
    Status {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Run a progress parser over a file
    Parse {
        /// Parser name (string, regex, madmax, chia)
        #[arg(short, long, default_value = "madmax")]
        parser: String,

        /// Parser argument, repeatable
        #[arg(short, long = "arg")]
        args: Vec<String>,

        /// Progress file or plotter log
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run => cmd_run(load_config(&cli.config, cli.verbose)?).await,
        Commands::Validate => {
            let config = load_config(&cli.config, cli.verbose)?;
            cmd_validate(&config, &cli.config)
        }
        Commands::Status { json } => cmd_status(&load_config(&cli.config, cli.verbose)?, json).await,
        Commands::Init { path, force } => {
            logging::init(&LoggingConfig::default(), cli.verbose)?;
            cmd_init(path.unwrap_or(cli.config), force)
        }
        Commands::Parse { parser, args, file } => {
            logging::init(&LoggingConfig::default(), cli.verbose)?;
            cmd_parse(parser, args, &file).await
        }
    }
}

/// Load the configuration and install logging as it asks
fn load_config(path: &Path, verbose: bool) -> Result<PlotBotConfig> {
    let config = PlotBotConfig::load(path)
        .with_context(|| format!("Failed to load {}", path.display()))?;
    logging::init(&config.logging, verbose)?;
    Ok(config)
}

async fn cmd_run(config: PlotBotConfig) -> Result<()> {
    let registry = Registry::default();
    if config.settings.test_mode {
        warn!("Test mode: drive deletions and moves are only logged");
    }

    let drives = Arc::new(LocalDrives::new().dry_run(config.settings.test_mode));
    let launcher = Arc::new(ShellLauncher::default());
    let orchestrator = Orchestrator::new(&config, &registry, drives, launcher)
        .context("Invalid configuration")?;

    let adopted = orchestrator
        .initialize()
        .await
        .context("Startup recovery failed")?;
    if adopted > 0 {
        info!("Resumed supervision of {} running instances", adopted);
    }

    let mut service = PlotBotService::from_config(Arc::new(orchestrator), &config)?;
    let shutdown = service.shutdown_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => shutdown.stop().await,
            Err(e) => error!("Cannot listen for Ctrl-C: {}", e),
        }
    });

    service.run().await?;
    Ok(())
}

fn cmd_validate(config: &PlotBotConfig, path: &Path) -> Result<()> {
    validate_config(config, &Registry::default())
        .with_context(|| format!("{} is invalid", path.display()))?;

    println!("{} is valid", path.display());
    println!();
    println!("Plotters:");
    for plotter in &config.plotters {
        let delays: Vec<String> = plotter.delay.iter().map(ToString::to_string).collect();
        println!(
            "  <{}> {} x{} ({}), parser {}, delays [{}]",
            plotter.alias,
            plotter.plot_size,
            plotter.max_instances,
            plotter.budget(),
            config.progress_parser_for(plotter),
            delays.join(", ")
        );
        for cache in &plotter.working_directories.caches {
            println!("      cache {}", cache.display());
        }
    }
    println!("Drives:");
    for drive in &config.drives {
        let clearers: Vec<String> = drive.clearers.iter().map(ToString::to_string).collect();
        let plotters = if drive.plotters.is_empty() {
            "all plotters".to_string()
        } else {
            drive.plotters.join(", ")
        };
        println!(
            "  <{}> {} for {}, clearers [{}]",
            drive.alias,
            drive.directory.display(),
            plotters,
            clearers.join(", ")
        );
    }
    println!("Plotting window: {}", config.settings.plotting_window);
    Ok(())
}

fn cmd_init(path: PathBuf, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    PlotBotConfig::write_default(&path)?;
    println!("Wrote default configuration to {}", path.display());
    println!("Edit the cache and drive paths, then run `plotbot validate`.");
    Ok(())
}

async fn cmd_status(config: &PlotBotConfig, json: bool) -> Result<()> {
    let registry = Registry::default();
    let drives = LocalDrives::new();
    let mut rows = Vec::new();

    for plotter in &config.plotters {
        let parser = registry.parser(config.progress_parser_for(plotter))?;
        let working_dir = &plotter.working_directories.working_directory;
        for found in scan_progress_files(&drives, working_dir, &plotter.alias).await? {
            let raw = drives.read(&found.progress_file).await?;
            let progress = match parse_progress(parser.as_ref(), &raw) {
                ParseOutcome::Status(status) => status.to_string(),
                ParseOutcome::Malformed(message) => format!("unreadable: {}", message),
            };
            rows.push(serde_json::json!({
                "id": found.header.instance.to_string(),
                "profile": found.header.profile,
                "started": found.header.started,
                "cache": found.header.cache,
                "progress_file": found.progress_file,
                "progress": progress,
            }));
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    if rows.is_empty() {
        println!("No instances found");
        return Ok(());
    }
    for row in &rows {
        println!(
            "{:<10} {:<16} {:<27} {}",
            row["id"].as_str().unwrap_or_default(),
            row["profile"].as_str().unwrap_or_default(),
            row["started"].as_str().unwrap_or_default(),
            row["progress"].as_str().unwrap_or_default()
        );
    }
    Ok(())
}

async fn cmd_parse(parser: String, args: Vec<String>, file: &Path) -> Result<()> {
    let spec = ComponentSpec { name: parser, args };
    let parser = Registry::default().parser(&spec)?;
    let raw = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;

    match parse_progress(parser.as_ref(), &raw) {
        ParseOutcome::Status(status) => {
            println!("{}", status);
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        ParseOutcome::Malformed(message) => bail!("{}: malformed output: {}", spec, message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command_line() {
        let cli = Cli::try_parse_from([
            "plotbot", "parse", "--parser", "string", "--arg", "DONE", "--arg", "FAILED", "log.txt",
        ])
        .unwrap();
        match cli.command {
            Commands::Parse { parser, args, file } => {
                assert_eq!(parser, "string");
                assert_eq!(args, vec!["DONE", "FAILED"]);
                assert_eq!(file, PathBuf::from("log.txt"));
            }
            _ => panic!("expected parse"),
        }
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_FILE));
    }

    #[test]
    fn test_global_config_flag() {
        let cli = Cli::try_parse_from(["plotbot", "validate", "--config", "/etc/plotbot.toml"])
            .unwrap();
        assert!(matches!(cli.command, Commands::Validate));
        assert_eq!(cli.config, PathBuf::from("/etc/plotbot.toml"));
    }

    #[test]
    fn test_init_refuses_to_overwrite() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        cmd_init(path.clone(), false).unwrap();
        assert!(cmd_init(path.clone(), false).is_err());
        cmd_init(path.clone(), true).unwrap();

        let config = PlotBotConfig::load(&path).unwrap();
        validate_config(&config, &Registry::default()).unwrap();
    }
}
