//! ChunkFleet Metadata
//!
//! The fleet catalog on top of a `RecordStore`:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        FleetCatalog                       │
//! │                                                           │
//! │  ┌───────────────┐  ┌───────────────┐  ┌──────────────┐  │
//! │  │ DriveRegistry │  │ ChunkCatalog  │  │ PolicyManager│  │
//! │  │ (space, admin)│  │(chunks, logs) │  │ (one active) │  │
//! │  └───────────────┘  └───────────────┘  └──────────────┘  │
//! │          │                  │                  │          │
//! │  ┌─────────────────────────────────────────────────────┐ │
//! │  │                   HealthMonitor                      │ │
//! │  │      (metric thresholds, system health, summary)     │ │
//! │  └─────────────────────────────────────────────────────┘ │
//! │  ┌─────────────────────────────────────────────────────┐ │
//! │  │                    FleetAnalyzer                     │ │
//! │  │      (allocation, timeline, per-drive statistics)    │ │
//! │  └─────────────────────────────────────────────────────┘ │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use chunkfleet_metadata::{FleetCatalog, NewDrive};
//! use chunkfleet_storage::MemoryStore;
//!
//! let catalog = FleetCatalog::new(Arc::new(MemoryStore::new()));
//! let drive = catalog.registry.register_drive(NewDrive::new("d1", "rack-a", 500_000)).await?;
//! ```

pub mod analysis;
pub mod catalog;
pub mod health;
pub mod models;
pub mod policy;
pub mod registry;

pub use analysis::{
    AllocationAnalysis, DriveAllocation, DrivePerformance, DriveStatistics, DriveTypeBucket,
    EventKind, FleetAnalyzer, FleetEvent, LocationBucket, PriorityBucket,
};
pub use catalog::ChunkCatalog;
pub use health::{
    AtRiskChunk, FleetSummary, HealthMonitor, MetricOutcome, MetricThresholds, OverallHealth,
    SystemHealth,
};
pub use models::*;
pub use policy::PolicyManager;
pub use registry::{compare_utilization, DriveDeletion, DriveFilter, DriveRegistry, StatusChange};

use chunkfleet_storage::RecordStore;
use std::sync::Arc;

/// All catalog components sharing one store
pub struct FleetCatalog<S> {
    pub store: Arc<S>,
    pub registry: DriveRegistry<S>,
    pub chunks: ChunkCatalog<S>,
    pub policies: PolicyManager<S>,
    pub health: HealthMonitor<S>,
    pub analysis: FleetAnalyzer<S>,
}

impl<S> Clone for FleetCatalog<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            registry: self.registry.clone(),
            chunks: self.chunks.clone(),
            policies: self.policies.clone(),
            health: self.health.clone(),
            analysis: self.analysis.clone(),
        }
    }
}

impl<S: RecordStore> FleetCatalog<S> {
    pub fn new(store: Arc<S>) -> Self {
        let registry = DriveRegistry::new(store.clone());
        let chunks = ChunkCatalog::new(store.clone());
        let policies = PolicyManager::new(store.clone());
        let health = HealthMonitor::new(
            store.clone(),
            registry.clone(),
            chunks.clone(),
            policies.clone(),
        );
        let analysis = FleetAnalyzer::new(store.clone(), registry.clone(), chunks.clone());

        Self {
            store,
            registry,
            chunks,
            policies,
            health,
            analysis,
        }
    }

    /// Replace the metric thresholds
    pub fn with_thresholds(mut self, thresholds: MetricThresholds) -> Self {
        self.health = self.health.with_thresholds(thresholds);
        self.analysis = self.analysis.with_thresholds(thresholds);
        self
    }
}
