//! xenops CLI - operation tracking for a virtualization console.

mod config;
mod context;
mod scenario;
mod sim;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use xenops_core::SystemClock;
use xenops_registry::{OperationRecord, RecordOutcome};

use crate::config::ConsoleConfig;
use crate::context::ConsoleContext;
use crate::scenario::SimulateOptions;

#[derive(Parser)]
#[command(name = "xenops")]
#[command(about = "Operation tracking for a virtualization console", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run local and foreign operations against a simulated pool
    Simulate {
        /// Local operations to launch
        #[arg(long, default_value = "4")]
        count: usize,
        /// Run the batch in parallel with this cap
        #[arg(long)]
        parallel: Option<usize>,
        /// Stop the batch after the first failure
        #[arg(long)]
        stop_on_first_failure: bool,
        /// Index of a local operation that should fail (repeatable)
        #[arg(long)]
        fail: Vec<usize>,
        /// Tasks started by another console
        #[arg(long, default_value = "2")]
        foreign: usize,
        /// Milliseconds between progress steps
        #[arg(long, default_value = "100")]
        step_ms: u64,
    },
    /// Rehydrate a seeded pool and show how each task was classified
    Rehydrate {
        /// Print JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration
    Config,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    // Logs go to stderr so command output stays parseable.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = ConsoleConfig::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Commands::Simulate {
            count,
            parallel,
            stop_on_first_failure,
            fail,
            foreign,
            step_ms,
        } => {
            let ctx = ConsoleContext::new(config, Arc::new(SystemClock));
            let options = SimulateOptions {
                count,
                parallel,
                stop_on_first_failure,
                fail,
                foreign,
                step: Duration::from_millis(step_ms),
                ..SimulateOptions::default()
            };
            let outcome = scenario::simulate(&ctx, &options).await?;

            println!(
                "Launched {} operation(s), skipped {}, prepared {} for restart",
                outcome.launched, outcome.skipped, outcome.prepared
            );
            println!();
            print_history(&outcome.records);
        }
        Commands::Rehydrate { json } => {
            let ctx = ConsoleContext::new(config, Arc::new(SystemClock));
            let outcome = scenario::rehydrate(&ctx).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                let s = &outcome.summary;
                println!(
                    "Enumerated {}: {} matched, {} unmatched, {} ignored, {} skipped, {} removed",
                    s.enumerated, s.matched, s.unmatched, s.ignored, s.skipped, s.removed
                );
                println!();
                for task in &outcome.tasks {
                    println!("  {:<24} {:<10} {}", task.task, format!("{:?}", task.classification), task.label);
                }
            }
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn print_history(records: &[OperationRecord]) {
    if records.is_empty() {
        println!("No operations recorded.");
        return;
    }

    println!("History ({} record(s)):", records.len());
    for record in records {
        let elapsed = record
            .elapsed()
            .map(|d| format!("{}ms", d.num_milliseconds()))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  [{:<9}] {:<20} {:>3}%  {:>7}  {}",
            record.state.to_string(),
            record.title,
            record.percent_complete,
            elapsed,
            record.description
        );
        match record.outcome() {
            RecordOutcome::Failed(Some(failure)) => {
                println!("              error: {}", failure.message);
                for detail in &failure.details {
                    println!("                - {}", detail);
                }
            }
            RecordOutcome::Failed(None) => println!("              error: unknown"),
            RecordOutcome::Cancelled => println!("              cancelled"),
            RecordOutcome::InProgress | RecordOutcome::Succeeded => {}
        }
    }
}
