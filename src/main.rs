//! rust_tsp command line
//!
//! Deploys the configured script manifest, reports the status byte and event
//! registers, or drains the error queue of one instrument.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use figment::Figment;
use tracing::{error, info};

use rust_tsp::config::TspConfig;
use rust_tsp::registers::EventRegister;
use rust_tsp::script::{DeployOptions, DeploymentEngine};
use rust_tsp::transport::SocketTransport;
use rust_tsp::{logging, TspError, TspSession};

/// TSP instrument script deployment and diagnostics
#[derive(Parser, Debug)]
#[command(name = "rust_tsp")]
#[command(about = "TSP instrument script deployment and diagnostics", long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "config/rust_tsp.toml")]
    config: PathBuf,

    /// Override the resource address from the configuration
    #[arg(short, long)]
    resource: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Bring the instrument in line with the script manifest
    Deploy {
        /// Delete and redeploy every manifest script
        #[arg(long)]
        force: bool,
        /// Delete persisted scripts the manifest does not list
        #[arg(long)]
        prune: bool,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the status byte and event registers
    Status,
    /// Drain and print the error queue
    Errors,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut overrides = Figment::new();
    if let Some(resource) = &args.resource {
        overrides = overrides.merge(("session.resource", resource.as_str()));
    }
    let config = TspConfig::load_with_overrides(&args.config, overrides)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    logging::init(&config.application.log_level);
    info!(app = %config.application.name, resource = %config.session.resource, "Starting");

    let transport = Box::new(SocketTransport::new());
    let mut session_config = config.session.clone();
    // Diagnostics report the instrument as found.
    if !matches!(args.command, Command::Deploy { .. }) {
        session_config.clear_on_connect = false;
    }
    let commands = config.commands.clone();

    let result = TspSession::scoped(transport, session_config, commands, |session| async move {
        match args.command {
            Command::Deploy { force, prune, json } => {
                let options = DeployOptions {
                    force_reload: force || config.deployment.force_reload,
                    prune_unlisted: prune || config.deployment.prune_unlisted,
                };
                let mut engine = DeploymentEngine::new(session, options);
                let report = engine.deploy(&config.deployment.scripts).await?;
                if json {
                    let text = serde_json::to_string_pretty(&report)
                        .map_err(|e| TspError::InvalidOperation(format!("Cannot encode report: {e}")))?;
                    println!("{text}");
                } else {
                    for outcome in &report.outcomes {
                        println!(
                            "node {:>3}  {:<24} {:?}",
                            outcome.node, outcome.script, outcome.action
                        );
                    }
                    println!("{report}");
                }
            }
            Command::Status => {
                println!("Instrument: {}", session.identity().await?);
                println!("Firmware:   {} ({:?})", session.firmware(), session.rules());
                println!("Status:     {}", session.read_status_byte().await?);
                let registers = session.registers().await;
                for register in [
                    EventRegister::Standard,
                    EventRegister::Operation,
                    EventRegister::Questionable,
                    EventRegister::Measurement,
                ] {
                    let value = session.read_event_register(register).await?;
                    println!(
                        "{:<13} 0x{:04X} {:?}",
                        format!("{register:?}:"),
                        value,
                        registers.describe_event(register, value)
                    );
                }
            }
            Command::Errors => {
                let queue = session.drain_error_queue().await?;
                if queue.is_empty() {
                    println!("No errors");
                }
                for entry in queue.errors() {
                    println!("{entry}");
                }
            }
        }
        Ok(())
    })
    .await;

    if let Err(e) = result {
        error!(error = %e, "Command failed");
        return Err(e.into());
    }
    Ok(())
}
