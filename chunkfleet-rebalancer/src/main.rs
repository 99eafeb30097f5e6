//! ChunkFleet CLI
//!
//! Operates a fleet catalog from the command line.
//!
//! # Commands
//! - `seed` - Register drives and policies from a TOML manifest
//! - `status` - Show system health and fleet summary
//! - `scan` - Detect under-replicated chunks and drives at risk
//! - `rebalance` - Restore replica counts and run the structural step
//! - `create-chunk` / `update-chunk` / `delete-chunk` - Place, edit or remove a chunk
//! - `relocate` - Move a chunk to another drive
//! - `fail-drive` / `corrupt-chunk` / `recover` - Fault simulation and repair
//! - `high-load` / `random-chunks` / `reset` - Load simulation
//! - `drive` / `policy` - Drive and policy administration
//! - `analysis` / `timeline` / `recommend` / `performance` - Read-only reports
//!
//! Reports are printed to stdout as JSON; logs go to stderr.

use anyhow::{Context, Result};
use chunkfleet_metadata::{
    ChunkStatus, ChunkUpdate, DriveStatus, DriveType, DriveUpdate, NewChunk, NewDrive, NewMetric,
    NewPolicy, PolicyUpdate,
};
use chunkfleet_rebalancer::config::RebalanceSettings;
use chunkfleet_rebalancer::{
    metrics, FailureKind, FleetManifest, FleetService, RandomChunkRequest, RebalancerConfig,
    ServiceOptions, StructuralMode,
};
use chunkfleet_storage::{MemoryStore, RecordStore, SledStore};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "chunkfleet")]
#[command(about = "Chunk placement and rebalancing for a drive fleet")]
#[command(version)]
struct Cli {
    /// Catalog directory (in-memory catalog when absent)
    #[arg(long, global = true, env = "CHUNKFLEET_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Path to a TOML configuration file
    #[arg(long, global = true, env = "CHUNKFLEET_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true, default_value = "false")]
    json_logs: bool,

    /// Print a Prometheus snapshot of the counters after the command
    #[arg(long, global = true, default_value = "false")]
    print_metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum StructuralArg {
    None,
    Utilization,
}

impl From<StructuralArg> for StructuralMode {
    fn from(arg: StructuralArg) -> Self {
        match arg {
            StructuralArg::None => StructuralMode::None,
            StructuralArg::Utilization => StructuralMode::Utilization,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Register drives and policies from a manifest
    Seed {
        /// Fleet manifest (TOML)
        manifest: PathBuf,
    },

    /// Show system health and fleet summary
    Status,

    /// Scan for under-replicated chunks and drives at risk
    Scan,

    /// Run a rebalance pass
    Rebalance {
        /// Structural planner for this pass (overrides config)
        #[arg(long, value_enum)]
        structural: Option<StructuralArg>,
    },

    /// Place a new chunk
    CreateChunk {
        #[arg(long)]
        name: String,

        #[arg(long)]
        size_mb: u64,

        /// Priority 1-5
        #[arg(long)]
        priority: Option<u8>,

        /// Explicit primary drive
        #[arg(long)]
        drive: Option<String>,

        #[arg(long)]
        checksum: Option<String>,

        /// Skip replica placement
        #[arg(long, default_value = "false")]
        no_replicate: bool,
    },

    /// Delete a chunk with its replicas
    DeleteChunk { chunk_id: String },

    /// Add up to COUNT replicas to a chunk
    Replicate {
        chunk_id: String,

        #[arg(long, default_value = "1")]
        count: u32,
    },

    /// Move a chunk to another drive
    Relocate {
        chunk_id: String,
        target_drive_id: String,

        #[arg(long)]
        reason: Option<String>,
    },

    /// Simulate a drive failure
    FailDrive {
        drive_id: String,

        /// complete, degraded or partial
        #[arg(long, default_value = "complete")]
        kind: String,
    },

    /// Simulate chunk corruption
    CorruptChunk { chunk_id: String },

    /// Recover a corrupted chunk from a healthy replica
    Recover { chunk_id: String },

    /// Record a drive metric
    Metric {
        drive_id: String,

        #[arg(long, default_value = "0")]
        error_rate: f64,

        #[arg(long, default_value = "40")]
        temperature: f64,
    },

    /// Fill the emptiest drives to a load percentage
    HighLoad {
        #[arg(long)]
        drives: Option<usize>,

        #[arg(long)]
        load: Option<u8>,
    },

    /// Generate randomly sized chunks
    RandomChunks {
        #[arg(long)]
        count: Option<usize>,

        #[arg(long)]
        min_size_mb: Option<u64>,

        #[arg(long)]
        max_size_mb: Option<u64>,

        #[arg(long)]
        priority: Option<u8>,
    },

    /// Remove simulation chunks and reset degraded drives
    Reset,

    /// Edit a chunk's name, priority, checksum or status
    UpdateChunk {
        chunk_id: String,

        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        priority: Option<u8>,

        #[arg(long)]
        checksum: Option<String>,

        /// ACTIVE or CORRUPTED
        #[arg(long)]
        status: Option<String>,
    },

    /// Drive administration
    Drive {
        #[command(subcommand)]
        action: DriveCommand,
    },

    /// Policy administration
    Policy {
        #[command(subcommand)]
        action: PolicyCommand,
    },

    /// Per-drive load with priority, location and type distributions
    Analysis,

    /// Recent redistributions, drive incidents and corrupted chunks
    Timeline {
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Suggest rebalancing, protection and consolidation actions
    Recommend,

    /// Recent metrics per drive
    Performance {
        #[arg(long, default_value = "24")]
        hours: u32,
    },
}

#[derive(Subcommand)]
enum DriveCommand {
    /// Register a drive
    Add {
        #[arg(long)]
        name: String,

        #[arg(long)]
        location: String,

        #[arg(long)]
        capacity_mb: u64,

        /// Defaults to the full capacity
        #[arg(long)]
        available_mb: Option<u64>,

        /// SSD, HDD, NVMe, SATA or SAS
        #[arg(long, default_value = "SSD")]
        drive_type: String,

        /// Host replicas only
        #[arg(long, default_value = "false")]
        backup: bool,
    },

    /// Update drive fields
    Update {
        drive_id: String,

        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        location: Option<String>,

        #[arg(long)]
        capacity_mb: Option<u64>,

        #[arg(long)]
        available_mb: Option<u64>,

        #[arg(long)]
        status: Option<String>,

        #[arg(long)]
        drive_type: Option<String>,

        #[arg(long)]
        backup: Option<bool>,
    },

    /// Delete a drive
    Delete {
        drive_id: String,

        /// Also delete chunks, replicas and logs that reference the drive
        #[arg(long, default_value = "false")]
        force: bool,
    },

    /// List all drives
    List,

    /// Metrics, chunk and replica totals of one drive
    Stats { drive_id: String },
}

#[derive(Subcommand)]
enum PolicyCommand {
    /// Create a policy
    Create {
        #[arg(long)]
        name: String,

        #[arg(long)]
        min_replicas: Option<u32>,

        /// Rebalance threshold in percent
        #[arg(long)]
        threshold: Option<u8>,

        #[arg(long, default_value = "false")]
        priority_based: bool,

        #[arg(long, default_value = "false")]
        locality_aware: bool,

        /// Make it the active policy
        #[arg(long, default_value = "false")]
        activate: bool,
    },

    /// Update policy fields
    Update {
        policy_id: String,

        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        min_replicas: Option<u32>,

        #[arg(long)]
        threshold: Option<u8>,

        #[arg(long)]
        priority_based: Option<bool>,

        #[arg(long)]
        locality_aware: Option<bool>,
    },

    /// Make a policy the only active one
    Activate { policy_id: String },

    /// Delete an inactive policy
    Delete { policy_id: String },

    /// List all policies
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = RebalancerConfig::load(cli.config.as_deref())
        .context("Failed to load configuration")?
        .with_overrides(cli.data_dir.clone(), cli.json_logs);

    init_logging(&config);

    let prometheus = if cli.print_metrics || config.metrics.enabled {
        Some(metrics::install_recorder().context("Failed to install metrics recorder")?)
    } else {
        None
    };

    let options = ServiceOptions::from_config(&config);
    let storage = config.storage.to_storage_config();

    match &storage.path {
        Some(dir) => {
            info!(data_dir = ?dir, "Opening catalog");
            let store = Arc::new(
                SledStore::open(dir)
                    .with_context(|| format!("Failed to open catalog at {}", dir.display()))?,
            );
            let service = FleetService::with_options(store.clone(), options);
            execute(&service, cli.command, &config.rebalance).await?;
            if storage.flush_on_write {
                store.flush().context("Failed to flush catalog")?;
            }
        }
        None => {
            warn!("No data directory configured, using an in-memory catalog");
            let service = FleetService::with_options(Arc::new(MemoryStore::new()), options);
            execute(&service, cli.command, &config.rebalance).await?;
        }
    }

    if let (Some(handle), true) = (prometheus, cli.print_metrics) {
        println!("{}", handle.render());
    }

    Ok(())
}

fn init_logging(config: &RebalancerConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str()));

    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    }
}

async fn execute<S: RecordStore>(
    service: &FleetService<S>,
    command: Commands,
    rebalance: &RebalanceSettings,
) -> Result<()> {
    match command {
        Commands::Seed { manifest } => {
            let manifest = FleetManifest::from_file(&manifest)
                .with_context(|| format!("Failed to load manifest {}", manifest.display()))?;
            print_json(&service.seed(&manifest).await?)
        }

        Commands::Status => {
            #[derive(Serialize)]
            struct Status {
                health: chunkfleet_metadata::SystemHealth,
                summary: chunkfleet_metadata::FleetSummary,
            }
            let health = service.system_health().await?;
            info!(summary = %health.summary(), "System health");
            print_json(&Status {
                health,
                summary: service.fleet_summary().await?,
            })
        }

        Commands::Scan => {
            let scan = service.scan().await?;
            info!(summary = %scan.summary(), critical = scan.has_critical_issues(), "Scan finished");
            print_json(&scan)
        }

        Commands::Rebalance { structural } => {
            let report = match structural {
                Some(mode) => {
                    let planner = rebalance.planner_for(mode.into());
                    service.with_structural(planner).trigger_rebalance().await?
                }
                None => service.trigger_rebalance().await?,
            };
            print_json(&report)
        }

        Commands::CreateChunk {
            name,
            size_mb,
            priority,
            drive,
            checksum,
            no_replicate,
        } => {
            let mut new = NewChunk::new(name, size_mb);
            new.priority = priority;
            new.drive_id = drive;
            new.checksum = checksum;
            new.replicate = !no_replicate;

            let placement = service.create_chunk(new).await?;
            if let Some(warning) = &placement.warning {
                warn!(chunk_id = %placement.chunk.id, %warning, "Chunk placed with a warning");
            }
            print_json(&placement)
        }

        Commands::DeleteChunk { chunk_id } => {
            let freed = service.delete_chunk(&chunk_id).await?;
            print_json(&serde_json::json!({ "chunk_id": chunk_id, "size_freed_mb": freed }))
        }

        Commands::Replicate { chunk_id, count } => {
            print_json(&service.create_limited_replicas(&chunk_id, count).await?)
        }

        Commands::Relocate {
            chunk_id,
            target_drive_id,
            reason,
        } => print_json(
            &service
                .relocate_chunk(&chunk_id, &target_drive_id, reason.as_deref())
                .await?,
        ),

        Commands::FailDrive { drive_id, kind } => {
            let kind: FailureKind = kind.parse()?;
            print_json(&service.simulate_drive_failure(&drive_id, kind).await?)
        }

        Commands::CorruptChunk { chunk_id } => {
            print_json(&service.simulate_chunk_corruption(&chunk_id).await?)
        }

        Commands::Recover { chunk_id } => print_json(&service.recover_chunk(&chunk_id).await?),

        Commands::Metric {
            drive_id,
            error_rate,
            temperature,
        } => {
            let metric = NewMetric::new(drive_id)
                .with_error_rate(error_rate)
                .with_temperature(temperature);
            print_json(&service.ingest_metric(metric).await?)
        }

        Commands::HighLoad { drives, load } => {
            print_json(&service.simulate_high_load(drives, load).await?)
        }

        Commands::RandomChunks {
            count,
            min_size_mb,
            max_size_mb,
            priority,
        } => print_json(
            &service
                .generate_random_chunks(RandomChunkRequest {
                    count,
                    min_size_mb,
                    max_size_mb,
                    priority,
                })
                .await?,
        ),

        Commands::Reset => print_json(&service.reset_simulation().await?),

        Commands::UpdateChunk {
            chunk_id,
            name,
            priority,
            checksum,
            status,
        } => {
            let update = ChunkUpdate {
                name,
                priority,
                checksum,
                status: status.map(|s| s.parse::<ChunkStatus>()).transpose()?,
            };
            print_json(&service.update_chunk(&chunk_id, update).await?)
        }

        Commands::Drive { action } => execute_drive(service, action).await,

        Commands::Policy { action } => execute_policy(service, action).await,

        Commands::Analysis => print_json(&service.allocation_analysis().await?),

        Commands::Timeline { limit } => print_json(&service.event_timeline(limit).await?),

        Commands::Recommend => {
            let report = service.recommendations().await?;
            info!(summary = %report.summary(), "Recommendations ready");
            print_json(&report)
        }

        Commands::Performance { hours } => {
            print_json(&service.performance_metrics(hours).await?)
        }
    }
}

async fn execute_drive<S: RecordStore>(
    service: &FleetService<S>,
    action: DriveCommand,
) -> Result<()> {
    match action {
        DriveCommand::Add {
            name,
            location,
            capacity_mb,
            available_mb,
            drive_type,
            backup,
        } => {
            let mut new = NewDrive::new(name, location, capacity_mb)
                .with_type(drive_type.parse::<DriveType>()?);
            new.available_mb = available_mb;
            new.is_backup = backup;
            print_json(&service.register_drive(new).await?)
        }

        DriveCommand::Update {
            drive_id,
            name,
            location,
            capacity_mb,
            available_mb,
            status,
            drive_type,
            backup,
        } => {
            let update = DriveUpdate {
                name,
                location,
                capacity_mb,
                available_mb,
                status: status.map(|s| s.parse::<DriveStatus>()).transpose()?,
                drive_type: drive_type.map(|t| t.parse::<DriveType>()).transpose()?,
                is_backup: backup,
            };
            print_json(&service.update_drive(&drive_id, update).await?)
        }

        DriveCommand::Delete { drive_id, force } => {
            let deletion = service.delete_drive(&drive_id, force).await?;
            if force {
                warn!(drive_id = %deletion.drive.id, "Drive force-deleted with its dependents");
            }
            print_json(&deletion)
        }

        DriveCommand::List => print_json(&service.list_drives().await?),

        DriveCommand::Stats { drive_id } => print_json(&service.drive_statistics(&drive_id).await?),
    }
}

async fn execute_policy<S: RecordStore>(
    service: &FleetService<S>,
    action: PolicyCommand,
) -> Result<()> {
    match action {
        PolicyCommand::Create {
            name,
            min_replicas,
            threshold,
            priority_based,
            locality_aware,
            activate,
        } => {
            let new = NewPolicy {
                name,
                min_replicas,
                rebalance_threshold: threshold,
                priority_based_placement: priority_based,
                locality_aware,
            };
            let policy = service.create_policy(new).await?;
            let policy = if activate {
                service.activate_policy(&policy.id).await?
            } else {
                policy
            };
            print_json(&policy)
        }

        PolicyCommand::Update {
            policy_id,
            name,
            min_replicas,
            threshold,
            priority_based,
            locality_aware,
        } => {
            let update = PolicyUpdate {
                name,
                min_replicas,
                rebalance_threshold: threshold,
                priority_based_placement: priority_based,
                locality_aware,
                is_active: None,
            };
            print_json(&service.update_policy(&policy_id, update).await?)
        }

        PolicyCommand::Activate { policy_id } => {
            print_json(&service.activate_policy(&policy_id).await?)
        }

        PolicyCommand::Delete { policy_id } => print_json(&service.delete_policy(&policy_id).await?),

        PolicyCommand::List => print_json(&service.list_policies().await?),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
