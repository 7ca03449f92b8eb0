//! Fleetward - phased configuration rollout for managed node fleets
//!
//! This is the main CLI entry point for Fleetward.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use fleetward::config::OperatorConfig;
use fleetward::controller::Controller;
use fleetward::fingerprint::{fingerprint, guard_id};
use fleetward::fleet::condition::DEPLOYMENT_READY;
use fleetward::fleet::Fleet;
use fleetward::guard::{marker, GuardManager};
use fleetward::job::DryRunRunner;
use fleetward::manifest;
use fleetward::store::{Deletion, RecordStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Fleetward - phased configuration rollout with credential guards
#[derive(Parser)]
#[command(name = "fleetward")]
#[command(version)]
#[command(about = "Phased configuration rollout for managed node fleets", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Operator configuration file (YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding fleet state and job bundles
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or update objects from manifest files or directories
    Apply {
        /// Manifest file or directory
        #[arg(short, long = "filename", required = true)]
        files: Vec<PathBuf>,
    },

    /// Reconcile every object until the fleet is idle
    Reconcile {
        /// Stop after this many reconcile passes
        #[arg(long, default_value = "100")]
        max_passes: usize,
    },

    /// Reconcile continuously until interrupted
    Run,

    /// Show objects of a kind
    Status {
        kind: Kind,
        /// Show one object in full
        name: Option<String>,
    },

    /// Delete an object
    Delete { kind: Kind, name: String },

    /// Print the guard ID of a node group
    GuardId {
        node_group: String,
        /// Also print the guard marker for this service kind
        #[arg(long)]
        service: Option<String>,
    },

    /// Print the SHA-256 fingerprint of a file
    Fingerprint { file: PathBuf },
}

#[derive(Clone, Copy, ValueEnum)]
enum Kind {
    #[value(alias = "ng")]
    NodeGroup,
    Service,
    Rollout,
    #[value(alias = "sharedcredential")]
    Credential,
    Secret,
}

fn default_state_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("/var/lib"))
        .join("fleetward")
}

fn load_config(path: Option<&Path>) -> Result<OperatorConfig> {
    match path {
        Some(path) => OperatorConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => Ok(OperatorConfig::default()),
    }
}

fn short(hash: &str) -> &str {
    &hash[..hash.len().min(12)]
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging; RUST_LOG wins over --debug
    let default_level = if cli.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = load_config(cli.config.as_deref())?;
    let state_dir = cli.state_dir.unwrap_or_else(default_state_dir);
    let state_path = state_dir.join("state.json");

    match &cli.command {
        Commands::GuardId {
            node_group,
            service,
        } => {
            let id = guard_id(node_group);
            println!("{}", id);
            if let Some(service) = service {
                println!("{}", marker(&config.guard_prefix, &id, service)?);
            }
            return Ok(());
        }
        Commands::Fingerprint { file } => {
            let bytes = std::fs::read(file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            println!("{}", fingerprint(&bytes));
            return Ok(());
        }
        _ => {}
    }

    let fleet = Fleet::load(config, &state_path)
        .with_context(|| format!("Failed to load fleet state from {}", state_path.display()))?;

    match cli.command {
        Commands::Apply { files } => {
            let mut manifests = Vec::new();
            for path in &files {
                manifests.extend(
                    manifest::load_path(path)
                        .with_context(|| format!("Failed to load {}", path.display()))?,
                );
            }
            for applied in manifest::apply(&fleet, manifests)? {
                println!("{}/{} {}", applied.kind, applied.name, applied.action);
            }
            save(&fleet, &state_path)?;
        }

        Commands::Reconcile { max_passes } => {
            let runner = Arc::new(DryRunRunner::new(state_dir.join("bundles"))?);
            let mut controller = Controller::new(fleet.clone(), runner);
            controller.enqueue_all()?;
            let report = controller.run_until_idle(max_passes)?;
            save(&fleet, &state_path)?;
            println!(
                "{} passes, {} object(s) still queued",
                report.passes, report.remaining
            );
        }

        Commands::Run => {
            let runner = Arc::new(DryRunRunner::new(state_dir.join("bundles"))?);
            let mut controller = Controller::new(fleet.clone(), runner);
            let shutdown = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to listen for ctrl-c: {}", e);
                }
            };
            let result = controller.run(shutdown).await;
            save(&fleet, &state_path)?;
            result?;
        }

        Commands::Status { kind, name } => match name {
            Some(name) => show(&fleet, kind, &name)?,
            None => list(&fleet, kind)?,
        },

        Commands::Delete { kind, name } => {
            let deletion = match kind {
                Kind::NodeGroup => {
                    GuardManager::for_fleet(&fleet, fleet.inventory()).release_node_group(&name)?;
                    fleet.delete_node_group(&name)?
                }
                Kind::Service => fleet.services.delete(&name)?,
                Kind::Rollout => fleet.rollouts.delete(&name)?,
                Kind::Credential => fleet.credentials.delete(&name)?,
                Kind::Secret => fleet.secrets.delete(&name)?,
            };
            match deletion {
                Deletion::Deleted => println!("{} deleted", name),
                Deletion::Pending => {
                    println!("{} marked for deletion, waiting for guard markers", name)
                }
            }
            save(&fleet, &state_path)?;
        }

        Commands::GuardId { .. } | Commands::Fingerprint { .. } => {}
    }

    Ok(())
}

fn save(fleet: &Fleet, path: &Path) -> Result<()> {
    fleet
        .save(path)
        .with_context(|| format!("Failed to save fleet state to {}", path.display()))?;
    info!("Fleet state saved to {}", path.display());
    Ok(())
}

fn show(fleet: &Fleet, kind: Kind, name: &str) -> Result<()> {
    let json = match kind {
        Kind::NodeGroup => serde_json::to_string_pretty(&fleet.node_groups.get(name)?)?,
        Kind::Service => serde_json::to_string_pretty(&fleet.services.get(name)?)?,
        Kind::Rollout => serde_json::to_string_pretty(&fleet.rollouts.get(name)?)?,
        Kind::Credential => serde_json::to_string_pretty(&fleet.credentials.get(name)?)?,
        Kind::Secret => {
            // Only key names; values may hold passwords.
            let secret = fleet.secrets.get(name)?;
            let keys: Vec<&String> = secret.data.keys().collect();
            serde_json::to_string_pretty(&serde_json::json!({
                "meta": secret.meta,
                "keys": keys,
                "modified_at": secret.modified_at,
            }))?
        }
    };
    println!("{}", json);
    Ok(())
}

fn list(fleet: &Fleet, kind: Kind) -> Result<()> {
    match kind {
        Kind::NodeGroup => {
            println!(
                "{:<24} {:<6} {:<14} {:<10} {:<20}",
                "NAME", "NODES", "CONFIG HASH", "DEPLOYED", "ROLLOUT"
            );
            for group in fleet.node_groups.list()? {
                let deployed = group
                    .status
                    .conditions
                    .get(DEPLOYMENT_READY)
                    .map(|c| format!("{:?}", c.status))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<24} {:<6} {:<14} {:<10} {:<20}",
                    group.meta.name,
                    group.spec.nodes.len(),
                    short(&group.status.config_hash),
                    deployed,
                    group.status.authoritative_rollout.as_deref().unwrap_or("-")
                );
            }
        }
        Kind::Service => {
            println!("{:<24} {:<16} {:<8}", "NAME", "KIND", "ALL GROUPS");
            for service in fleet.services.list()? {
                println!(
                    "{:<24} {:<16} {:<8}",
                    service.meta.name,
                    service.kind(),
                    service.spec.deploy_on_all_node_groups
                );
            }
        }
        Kind::Rollout => {
            println!("{:<24} {:<16} {:<30} {}", "NAME", "PHASE", "NODE GROUPS", "MESSAGE");
            for rollout in fleet.rollouts.list()? {
                println!(
                    "{:<24} {:<16} {:<30} {}",
                    rollout.meta.name,
                    rollout.status.phase.to_string(),
                    rollout.spec.node_groups.join(","),
                    rollout.status.message.as_deref().unwrap_or("")
                );
            }
        }
        Kind::Credential => {
            println!("{:<24} {:<24} {:<8} {:<8}", "NAME", "USERNAME", "MARKERS", "DELETING");
            for credential in fleet.credentials.list()? {
                println!(
                    "{:<24} {:<24} {:<8} {:<8}",
                    credential.meta.name,
                    credential.status.username,
                    credential.meta.finalizers.len(),
                    credential.meta.is_deleting()
                );
            }
        }
        Kind::Secret => {
            println!("{:<40} {:<6}", "NAME", "KEYS");
            for secret in fleet.secrets.list()? {
                println!("{:<40} {:<6}", secret.meta.name, secret.data.len());
            }
        }
    }
    Ok(())
}
