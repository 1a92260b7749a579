//! # Conveyor Configuration Validator
//!
//! Loads a configuration file through the same layering the pipeline uses (defaults,
//! TOML file, `CONVEYOR__*` environment overrides), validates it and prints the
//! effective settings.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use conveyor_core::config::{ConfigManager, PipelineConfig};
use conveyor_core::TaskKind;
use std::path::PathBuf;
use std::process;
use tracing::Level;

#[derive(Parser)]
#[command(name = "config-validator")]
#[command(about = "Validate Conveyor pipeline configuration files")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file (TOML). Defaults plus environment only when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, value_enum, default_value_t = Format::Table)]
    format: Format,

    /// Verbose output level (use multiple times for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Table,
    Json,
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    match run(&cli) {
        Ok(()) => process::exit(0),
        Err(e) => {
            eprintln!("❌ {e:#}");
            process::exit(1);
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let manager = match &cli.config {
        Some(path) => ConfigManager::load_from_file(path)
            .with_context(|| format!("invalid configuration in {}", path.display()))?,
        None => ConfigManager::load().context("invalid configuration")?,
    };

    match cli.format {
        Format::Json => println!("{}", serde_json::to_string_pretty(manager.config())?),
        Format::Table => print_table(manager.config(), cli.config.as_ref()),
    }
    Ok(())
}

fn print_table(config: &PipelineConfig, path: Option<&PathBuf>) {
    println!("🔧 Conveyor configuration");
    if let Some(path) = path {
        println!("File:        {}", path.display());
    }
    println!("Environment: {}", config.environment);
    println!(
        "Admission:   default quota {}, atomic {}",
        config
            .admission
            .default_daily_quota
            .map_or_else(|| "none".to_string(), |q| q.to_string()),
        config.admission.atomic
    );
    println!(
        "Broker:      enabled {}, breaker {} failures / {}ms",
        config.broker.enabled,
        config.broker.circuit_breaker.failure_threshold,
        config.broker.circuit_breaker.timeout.as_millis()
    );
    println!();
    println!(
        "{:<10} {:<24} {:>8} {:>8} {:>10} {:>10} {:>6}",
        "kind", "queue", "priority", "attempts", "base_ms", "max_ms", "conc"
    );
    for kind in TaskKind::ALL {
        let queue = config.queues.for_kind(kind);
        println!(
            "{:<10} {:<24} {:>8} {:>8} {:>10} {:>10} {:>6}",
            kind.as_str(),
            queue.name,
            queue.priority,
            queue.max_attempts,
            queue.backoff_base_ms,
            queue.backoff_max_ms,
            queue.concurrency
        );
    }
    println!("\n✅ Configuration is valid");
}
