use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use autoscale_converge::config::{config, ConvergeConfig};
use autoscale_converge::convergence::{
    DesiredGroupState, LoadBalancerNode, NetworkAddressPolicy, Planner, ServerRecord,
};
use autoscale_converge::telemetry::init_telemetry;

#[derive(Parser)]
#[command(name = "autoscale-converge")]
#[command(about = "Reconciliation core of an autoscaling control plane")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan convergence for one group and print the resulting requests
    Plan {
        /// JSON document with `desired`, `servers` and optional `lb_nodes`
        #[arg(long, help = "Path to the group snapshot to plan against")]
        input: PathBuf,
        /// Planning time (RFC 3339); defaults to now
        #[arg(long, help = "Evaluate build timeouts as of this instant")]
        now: Option<DateTime<Utc>>,
    },
    /// Print the effective configuration as TOML
    ShowConfig,
}

#[derive(Debug, Deserialize)]
struct GroupSnapshot {
    desired: DesiredGroupState,
    #[serde(default)]
    servers: Vec<ServerRecord>,
    #[serde(default)]
    lb_nodes: Vec<LoadBalancerNode>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Fall back to defaults so a broken config file still reports through show-config
    let settings = match config() {
        Ok(settings) => settings.clone(),
        Err(e) => {
            eprintln!("{e:#}; using defaults");
            ConvergeConfig::default()
        }
    };
    init_telemetry(&settings.observability.log_level)?;

    match cli.command {
        Commands::Plan { input, now } => plan(&settings, input, now),
        Commands::ShowConfig => {
            print!("{}", settings.to_toml()?);
            Ok(())
        }
    }
}

fn plan(settings: &ConvergeConfig, input: PathBuf, now: Option<DateTime<Utc>>) -> Result<()> {
    let raw = fs::read_to_string(&input)
        .with_context(|| format!("Failed to read {}", input.display()))?;
    let snapshot: GroupSnapshot = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid group snapshot in {}", input.display()))?;

    let planner = Planner::new(
        settings.convergence.build_timeout(),
        Arc::new(NetworkAddressPolicy::new(&settings.convergence.address_network)),
    );
    let plan = planner.converge(
        &snapshot.desired,
        &snapshot.servers,
        &snapshot.lb_nodes,
        now.unwrap_or_else(Utc::now),
    );

    tracing::info!(steps = plan.len(), "Planned convergence");
    for step in plan.iter() {
        println!("{}", serde_json::to_string(&step.as_request())?);
    }
    Ok(())
}
