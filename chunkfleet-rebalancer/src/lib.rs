//! ChunkFleet Rebalancer Library
//!
//! Placement, replication and rebalancing for the ChunkFleet catalog.
//!
//! The service keeps the fleet healthy by:
//! - Placing chunks on the least utilized drives (scorer)
//! - Keeping replica counts at the active policy's minimum (replication)
//! - Detecting under-replicated chunks and overloaded drives (detector)
//! - Relocating chunks with rollback, draining failing drives (rebalancer)
//! - Simulating failures, corruption and load (simulation)
//! - Suggesting operator actions from a fleet snapshot (advisor)

pub mod advisor;
pub mod config;
pub mod detector;
pub mod metrics;
pub mod rebalancer;
pub mod replication;
pub mod scorer;
pub mod service;
pub mod simulation;
pub mod structural;

// Re-export main types
pub use advisor::{
    AffectedItem, OptimizationReport, Recommendation, RecommendationKind, RecommendationPriority,
};
pub use config::{ConfigError, FleetManifest, ManifestPolicy, RebalancerConfig, StructuralMode};
pub use detector::{Detector, DriveAtRisk, ScanResult, UnderReplicatedChunk};
pub use rebalancer::{
    ItemFailure, RebalanceReport, Rebalancer, RedistributionReport, ReplicaShortfall,
    StructuralOutcome, MANUAL_RELOCATION_REASON, RECOVERY_REASON,
};
pub use replication::{
    ChunkPlacement, LimitedReplicas, ReplicaOutcome, ReplicationManager, ReplicationWarning,
};
pub use scorer::PlacementScorer;
pub use service::{FleetService, MetricIngest, SeedReport, ServiceOptions, METRIC_FAILURE_REASON};
pub use simulation::{
    CorruptionOutcome, DriveFailureOutcome, FailureKind, HighLoadOutcome, LoadedDrive,
    RandomChunkRequest, RandomChunksOutcome, ResetOutcome, Simulator,
};
pub use structural::{
    FleetSnapshot, NoStructuralRebalance, RelocationSuggestion, StructuralRebalance,
    UtilizationRebalance,
};
