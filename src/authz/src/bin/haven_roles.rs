//! # haven-roles
//!
//! Operator tool for inspecting and repairing role assignments offline.
//! Loads a JSON snapshot of role records, then checks, repairs or resolves
//! subjects with the configured engine.
//!
//! ## Configuration
//!
//! - `HAVEN_CONFIG` - engine TOML file (defaults apply when unset)
//! - `RUST_LOG` - log level (default: info)

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use haven_authz::{
    AuthzError, Capabilities, ConsistencyCheck, EngineConfig, InMemoryRoleStore, RepairOutcome,
    RoleRecord, RoleRecordStore, SubjectId,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "haven-roles", version, about = "Inspect and repair role assignments")]
struct Cli {
    /// Engine configuration file
    #[arg(short, long, env = "HAVEN_CONFIG")]
    config: Option<PathBuf>,

    /// JSON array of role records
    #[arg(short, long)]
    records: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Report consistency for every subject
    Check,
    /// Repair every divergent subject
    Repair {
        /// Write the repaired record snapshot here
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Resolve one subject and list its permissions
    Resolve {
        #[arg(short, long)]
        subject: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => EngineConfig::default(),
    };

    let contents = std::fs::read_to_string(&cli.records)
        .with_context(|| format!("Failed to read records from {}", cli.records.display()))?;
    let records: Vec<RoleRecord> =
        serde_json::from_str(&contents).context("Failed to parse role records")?;
    info!("Loaded {} role records", records.len());

    let store = Arc::new(InMemoryRoleStore::from_records(records));
    let engine = config.build(store.clone()).context("Invalid engine configuration")?;

    match cli.command {
        Command::Check => {
            for subject in store.subjects().await {
                match engine.checker.check_consistency(&subject).await {
                    Ok(ConsistencyCheck::Consistent(resolution)) => {
                        println!("{}\tconsistent\tprimary={}", subject, resolution.primary);
                    }
                    Ok(ConsistencyCheck::Divergent(issue)) => {
                        println!(
                            "{}\t{:?}\t{}={:?}\t{}={:?}",
                            subject,
                            issue.severity,
                            issue.source_a,
                            issue.roles_a,
                            issue.source_b,
                            issue.roles_b
                        );
                    }
                    Err(e) => println!("{}\terror\t{}", subject, e),
                }
            }
        }
        Command::Repair { output } => {
            let mut failures = 0usize;
            for subject in store.subjects().await {
                match engine.repairer.repair_subject(&subject).await {
                    Ok(RepairOutcome::AlreadyConsistent { .. }) => {}
                    Ok(RepairOutcome::Repaired { plan, resolution }) => {
                        println!(
                            "{}\trepaired\t{} action(s)\tprimary={}",
                            subject,
                            plan.actions.len(),
                            resolution.primary
                        );
                    }
                    Err(e @ AuthzError::NoRoleAssigned(_)) => {
                        println!("{}\tskipped\t{}", subject, e);
                    }
                    Err(e) => {
                        error!("Repair of {} failed: {}", subject, e);
                        failures += 1;
                    }
                }
            }

            if let Some(path) = output {
                let snapshot = serde_json::to_string_pretty(&store.all_records().await)?;
                std::fs::write(&path, snapshot)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                info!("Wrote repaired records to {}", path.display());
            }

            if failures > 0 {
                anyhow::bail!("{} subject(s) could not be repaired", failures);
            }
        }
        Command::Resolve { subject } => {
            let subject = SubjectId::new(subject);
            let records = store.fetch_records(&subject).await?;
            let resolution = engine.resolver.resolve(&subject, &records)?;
            let caps = Capabilities::new(resolution.roles.clone(), engine.permissions.clone());

            println!("subject:     {}", subject);
            println!("roles:       {:?}", resolution.roles.to_vec());
            println!("primary:     {}", resolution.primary);
            println!("admin:       {}", caps.is_admin());
            println!("permissions: {:?}", caps.permissions()?);
        }
    }

    Ok(())
}
