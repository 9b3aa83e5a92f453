//! table-refresh CLI - refresh SQL Server tables from a source database.

use clap::{Parser, Subcommand};
use dialoguer::Confirm;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use table_refresh::{BatchSummary, Config, Orchestrator, RefreshError, RefreshResult};
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Parser)]
#[command(name = "table-refresh")]
#[command(about = "Refresh SQL Server tables from a source database")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Refresh one table or all configured tables
    Run {
        /// Refresh only this table
        #[arg(long)]
        table: Option<String>,

        /// Dry run: report what would be refreshed without touching data
        #[arg(long)]
        dry_run: bool,

        /// Skip the confirmation prompt
        #[arg(long, short)]
        force: bool,
    },

    /// Show row counts and watermarks on both sides
    Status {
        /// Show only this table
        #[arg(long)]
        table: Option<String>,
    },

    /// Test database connections
    HealthCheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), RefreshError> {
    let cli = Cli::parse();

    let mut config = Config::load(&cli.config)?;

    // settings.verbose_logging only applies when --verbosity is left at its default
    let verbosity = if config.settings.verbose_logging && cli.verbosity == "info" {
        "debug"
    } else {
        cli.verbosity.as_str()
    };
    setup_logging(verbosity, &cli.log_format)
        .map_err(|e| RefreshError::Config(e.to_string()))?;
    info!("Loaded configuration from {:?}", cli.config);

    match cli.command {
        Commands::Run {
            table,
            dry_run,
            force,
        } => {
            if dry_run {
                config.settings.dry_run = true;
            }

            if !config.settings.dry_run && !force {
                let prompt = match &table {
                    Some(name) => format!("Refresh table '{}'?", name),
                    None => format!("Refresh all {} tables?", config.tables.len()),
                };
                if !confirm(&prompt)? {
                    println!("Cancelled.");
                    return Ok(());
                }
            }

            let orchestrator = Orchestrator::connect(config).await?;
            let results = match &table {
                Some(name) => vec![orchestrator.refresh_table(name).await],
                None => orchestrator.refresh_all_tables().await,
            };

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                print_results(&results);
            }

            BatchSummary::from_results(&results).into_result()?;
        }

        Commands::Status { table } => {
            let orchestrator = Orchestrator::connect(config).await?;
            let statuses = orchestrator.table_status(table.as_deref()).await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&statuses)?);
            } else {
                for status in &statuses {
                    println!("Table: {}", status.table_name);
                    if let Some(ref err) = status.error {
                        println!("  Error: {}", err);
                    }
                    if let (Some(strategy), Some(sync_mode)) = (status.strategy, status.sync_mode) {
                        println!("  Strategy: {} ({})", strategy, sync_mode);
                    }
                    if let Some(count) = status.source_count {
                        println!("  Source rows: {}", count);
                    }
                    if let Some(count) = status.target_count {
                        println!("  Target rows: {}", count);
                    }
                    if let Some(ref max) = status.source_max_value {
                        println!("  Source max: {}", max);
                    }
                    if let Some(ref max) = status.target_max_value {
                        println!("  Target max: {}", max);
                    }
                    println!();
                }
            }
        }

        Commands::HealthCheck => {
            let orchestrator = Orchestrator::connect(config).await?;
            let result = orchestrator.health_check().await;

            if cli.output_json {
                println!("{}", result.to_json()?);
            } else {
                println!("Health Check Results:");
                println!(
                    "  Source: {} ({}ms)",
                    if result.source_connected { "OK" } else { "FAILED" },
                    result.source_latency_ms
                );
                if let Some(ref err) = result.source_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "  Target: {} ({}ms)",
                    if result.target_connected { "OK" } else { "FAILED" },
                    result.target_latency_ms
                );
                if let Some(ref err) = result.target_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "\n  Overall: {}",
                    if result.healthy { "HEALTHY" } else { "UNHEALTHY" }
                );
            }

            if !result.healthy {
                return Err(RefreshError::query("health-check", "Health check failed"));
            }
        }
    }

    Ok(())
}

/// Ask before touching data. A non-interactive stdin needs `--force`.
fn confirm(prompt: &str) -> Result<bool, RefreshError> {
    if !std::io::stdin().is_terminal() {
        return Err(RefreshError::Config(
            "stdin is not a terminal; pass --force to run without confirmation".to_string(),
        ));
    }
    Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()
        .map_err(|e| RefreshError::Config(e.to_string()))
}

fn print_results(results: &[RefreshResult]) {
    for result in results {
        print!(
            "Table {}: {} ({}, {}",
            result.table_name, result.status, result.strategy, result.sync_mode
        );
        if result.status == table_refresh::RefreshStatus::Success {
            print!(", {} rows in {:.2}s", result.rows_processed, result.duration_seconds);
        }
        println!(")");
        if let Some(ref from) = result.incremental_from {
            println!("  From: {}", from);
        }
        if let Some(ref partitions) = result.partitions_created {
            if !partitions.is_empty() {
                println!("  Partitions created: {:?}", partitions);
            }
        }
        if let Some(ref err) = result.error {
            println!("  Error: {}", err);
        }
    }

    let summary = BatchSummary::from_results(results);
    println!(
        "\nRefreshed {}/{} tables ({} rows)",
        summary.success + summary.dry_run,
        summary.total,
        summary.rows_processed
    );
    if !summary.failed_tables.is_empty() {
        println!("  Failed tables: {:?}", summary.failed_tables);
    }
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}
