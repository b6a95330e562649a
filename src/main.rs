use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::warn;

use lockbench::config::Config;
use lockbench::scenarios::{ScenarioKind, ScenarioReport};
use lockbench::{HarnessContext, logging, server};

#[derive(Parser)]
#[command(name = "lockbench")]
#[command(about = "Observe session timeouts and pool limits under row contention", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to lockbench.toml (defaults to ./lockbench.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one scenario and print its outcomes
    Run {
        scenario: ScenarioKind,
        /// Print the full report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Serve the HTTP trigger surface
    Serve {
        /// Port to listen on (overrides the config)
        #[arg(short, long)]
        port: Option<u16>,
        /// Host to bind (overrides the config)
        #[arg(long)]
        host: Option<String>,
    },
    /// List the available scenarios
    List,
    /// Reset row 'ian' to its baseline value
    Reset,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::List = cli.command {
        for kind in ScenarioKind::ALL {
            println!("{:<30} {}", kind.name(), kind.description());
        }
        return Ok(());
    }

    let config = Config::discover(cli.config.as_deref())?;
    logging::init(&config.logging);
    for warning in config.validate()?.warnings {
        warn!("{warning}");
    }

    match cli.command {
        Commands::Run { scenario, json } => {
            let ctx = HarnessContext::bootstrap(config).await?;
            let report = ctx.invoke(scenario).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
            ctx.shutdown();
        },
        Commands::Serve { port, host } => {
            let host = host.unwrap_or_else(|| config.server.host.clone());
            let port = port.unwrap_or(config.server.port);
            let addr: SocketAddr = format!("{host}:{port}")
                .parse()
                .with_context(|| format!("Invalid listen address {host}:{port}"))?;
            let ctx = Arc::new(HarnessContext::bootstrap(config).await?);
            server::serve(ctx, addr).await?;
        },
        Commands::Reset => {
            let ctx = HarnessContext::bootstrap(config).await?;
            ctx.reset().await?;
            println!("row 'ian' = {:?}", ctx.current_value().await?);
            ctx.shutdown();
        },
        Commands::List => {},
    }

    Ok(())
}

fn print_report(report: &ScenarioReport) {
    println!("scenario: {}", report.scenario);
    for (i, batch) in report.batches.iter().enumerate() {
        println!(
            "batch {} ({}ms, peak in use {})",
            i + 1,
            batch.elapsed_ms,
            batch.peak_in_use()
        );
        for outcome in &batch.outcomes {
            let conn = outcome
                .connection_id
                .map_or_else(|| "-".to_string(), |id| id.to_string());
            if outcome.message.is_empty() {
                println!("  {:>3}: {:<18} conn {conn}", outcome.task_index, outcome.kind);
            } else {
                println!(
                    "  {:>3}: {:<18} conn {conn}  {}",
                    outcome.task_index, outcome.kind, outcome.message
                );
            }
        }
    }
    for sample in &report.samples {
        println!("connections {}: {}", sample.label, sample.connections);
    }
    match report.final_value {
        Some(value) => println!("row 'ian' = {value}"),
        None => println!("row 'ian' is missing"),
    }
}
