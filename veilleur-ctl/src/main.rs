//! veilleur-ctl - drive fleet lifecycle operations from the command line
//!
//! Thin shell over the engine: resolves targets, runs one operation or a
//! full cycle, and prints the structured per-host results as JSON. The
//! reporting layer consumes the same JSON from `cycle --output`.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;
use veilleur_engine::cycle::{Collaborators, CycleOptions, FleetCycle};
use veilleur_engine::model::HostGroup;
use veilleur_engine::probe::Prober;
use veilleur_engine::remote::KeyringCredentials;
use veilleur_engine::shutdown::ShutdownOrchestrator;
use veilleur_engine::update::UpdateOrchestrator;
use veilleur_engine::wake::WakeOrchestrator;
use veilleur_engine::FleetConfig;

const KEYRING_SERVICE: &str = "veilleur";

#[derive(Parser)]
#[command(name = "veilleur-ctl", version, about)]
struct Cli {
    /// Fleet configuration file
    #[arg(long, env = "VEILLEUR_CONFIG", default_value = "fleet.yaml", global = true)]
    config: PathBuf,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

/// Target selection shared by the per-stage commands: a named group or an
/// explicit host list, both routed through the same batch paths.
#[derive(Args)]
struct Target {
    /// Named group from the fleet file
    #[arg(long, conflicts_with = "hosts")]
    group: Option<String>,

    /// Explicit comma-separated host list
    #[arg(long, value_delimiter = ',')]
    hosts: Vec<String>,
}

impl Target {
    fn resolve(&self, config: &FleetConfig) -> Result<HostGroup> {
        if let Some(name) = &self.group {
            return Ok(config.resolve_group(name)?);
        }
        if self.hosts.is_empty() {
            bail!("either --group or --hosts is required");
        }
        Ok(config.ephemeral_group(&self.hosts))
    }
}

#[derive(Subcommand)]
enum Command {
    /// Probe one host for reachability and manageability
    Probe {
        #[arg(long)]
        host: String,
        /// Resolve and test every IPv4 address of the name
        #[arg(long)]
        dns: bool,
    },
    /// Send wake frames and verify the hosts came up
    Wake {
        #[command(flatten)]
        target: Target,
    },
    /// Shut down session-free hosts and verify they went down
    Shutdown {
        #[command(flatten)]
        target: Target,
    },
    /// Apply and/or verify software updates
    Update {
        #[command(flatten)]
        target: Target,
        /// Update even when a user session is active
        #[arg(long)]
        force: bool,
        /// Also verify update history over the last N days
        #[arg(long, value_name = "DAYS")]
        verify_days: Option<u32>,
        /// Verification only, skip the apply pass
        #[arg(long)]
        no_apply: bool,
    },
    /// Run a full lifecycle cycle against a named group
    Cycle {
        #[arg(long)]
        group: String,
        /// Apply updates to hosts that are up
        #[arg(long)]
        update: bool,
        #[arg(long)]
        force: bool,
        #[arg(long, value_name = "DAYS")]
        verify_days: Option<u32>,
        /// Leave every host running
        #[arg(long)]
        no_shutdown: bool,
        /// Capture a hardware/OS inventory snapshot per host
        #[arg(long)]
        inventory: bool,
        /// Write the report here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = FleetConfig::load(&cli.config)
        .await
        .context("fleet configuration")?;
    let credentials = KeyringCredentials::new(KEYRING_SERVICE, &config.remote.username);
    let collaborators = Collaborators::standard(&config, &credentials)?;

    match cli.command {
        Command::Probe { host, dns } => {
            let result = collaborators.probe.probe(&host, dns).await;
            info!("{}: {:?}", host, result.classification());
            print_json(&result)?;
        }
        Command::Wake { target } => {
            let group = target.resolve(&config)?;
            let orchestrator = WakeOrchestrator::new(
                collaborators.probe.clone(),
                collaborators.wake_sender.clone(),
                config.wake_policy(),
                config.parallelism,
                config.probe.use_dns,
            );
            let results = orchestrator.wake_batch(&group).await;
            print_json(&results)?;
        }
        Command::Shutdown { target } => {
            let group = target.resolve(&config)?;
            let orchestrator = ShutdownOrchestrator::new(
                collaborators.probe.clone(),
                collaborators.sessions.clone(),
                collaborators.executor.clone(),
                collaborators.credential.clone(),
                config.shutdown_policy(),
                config.parallelism,
                config.probe.use_dns,
            );
            let outcomes = orchestrator.shutdown_batch(&group).await;
            print_json(&outcomes)?;
        }
        Command::Update {
            target,
            force,
            verify_days,
            no_apply,
        } => {
            let group = target.resolve(&config)?;
            let orchestrator =
                UpdateOrchestrator::new(collaborators.sessions.clone(), config.parallelism);
            let mut entries = Vec::new();
            if !no_apply {
                entries.extend(
                    orchestrator
                        .apply(&group, collaborators.provider.clone(), force)
                        .await,
                );
            }
            if let Some(days) = verify_days {
                entries.extend(
                    orchestrator
                        .verify(&group, collaborators.provider.clone(), days)
                        .await,
                );
            }
            print_json(&entries)?;
        }
        Command::Cycle {
            group,
            update,
            force,
            verify_days,
            no_shutdown,
            inventory,
            output,
        } => {
            let cycle = FleetCycle::new(config, collaborators);
            let report = cycle
                .run(
                    &group,
                    &CycleOptions {
                        apply_updates: update,
                        force_updates: force,
                        verify_window_days: verify_days,
                        shutdown: !no_shutdown,
                        collect_inventory: inventory,
                    },
                )
                .await?;
            match output {
                Some(path) => {
                    let json = serde_json::to_string_pretty(&report)?;
                    tokio::fs::write(&path, json)
                        .await
                        .with_context(|| format!("writing report to {}", path.display()))?;
                    info!("report written to {}", path.display());
                }
                None => print_json(&report)?,
            }
        }
    }
    Ok(())
}
