//! Fleet service
//!
//! One entry point over the catalog, placement, rebalancing and simulation
//! components, all sharing a single record store.

use crate::advisor::{self, OptimizationReport};
use crate::config::{FleetManifest, RebalancerConfig};
use crate::detector::{Detector, ScanResult, UnderReplicatedChunk};
use crate::rebalancer::{RebalanceReport, Rebalancer, RedistributionReport};
use crate::replication::{ChunkPlacement, LimitedReplicas, ReplicationManager};
use crate::scorer::PlacementScorer;
use crate::simulation::{
    CorruptionOutcome, DriveFailureOutcome, FailureKind, HighLoadOutcome, RandomChunkRequest,
    RandomChunksOutcome, ResetOutcome, Simulator,
};
use crate::structural::{FleetSnapshot, NoStructuralRebalance, StructuralRebalance};
use chunkfleet_core::Result;
use chunkfleet_metadata::{
    AllocationAnalysis, ChunkUpdate, DataChunk, DistributionPolicy, Drive, DriveDeletion,
    DriveMetric, DrivePerformance, DriveStatistics, DriveStatus, DriveUpdate, FleetCatalog,
    FleetEvent, FleetSummary, MetricOutcome, MetricThresholds, NewChunk, NewDrive, NewMetric,
    NewPolicy, PolicyUpdate, RedistributionLog, Replica, StatusChange, SystemHealth,
};
use chunkfleet_storage::RecordStore;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Reason stored when a metric pushes a drive into FAILING
pub const METRIC_FAILURE_REASON: &str = "Drive failing per health metrics";

/// Knobs for assembling a service
#[derive(Clone)]
pub struct ServiceOptions {
    pub structural: Arc<dyn StructuralRebalance>,
    pub thresholds: MetricThresholds,
    pub seed: Option<u64>,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            structural: Arc::new(NoStructuralRebalance),
            thresholds: MetricThresholds::default(),
            seed: None,
        }
    }
}

impl ServiceOptions {
    pub fn from_config(config: &RebalancerConfig) -> Self {
        Self {
            structural: config.rebalance.planner(),
            thresholds: config.health.thresholds(),
            seed: config.simulation.seed,
        }
    }
}

/// Result of ingesting a drive metric
#[derive(Debug, Clone, Serialize)]
pub struct MetricIngest {
    pub outcome: MetricOutcome,

    /// Present when the metric moved the drive into FAILING
    pub redistribution: Option<RedistributionReport>,
}

/// Rows created from a fleet manifest
#[derive(Debug, Clone, Default, Serialize)]
pub struct SeedReport {
    pub drives: Vec<Drive>,
    pub policies: Vec<DistributionPolicy>,
    pub active_policy: Option<String>,
}

/// Fleet service
pub struct FleetService<S> {
    catalog: FleetCatalog<S>,
    replication: ReplicationManager<S>,
    detector: Detector<S>,
    rebalancer: Rebalancer<S>,
    simulator: Simulator<S>,
}

impl<S> Clone for FleetService<S> {
    fn clone(&self) -> Self {
        Self {
            catalog: self.catalog.clone(),
            replication: self.replication.clone(),
            detector: self.detector.clone(),
            rebalancer: self.rebalancer.clone(),
            simulator: self.simulator.clone(),
        }
    }
}

impl<S: RecordStore> FleetService<S> {
    /// Service with default options
    pub fn new(store: Arc<S>) -> Self {
        Self::with_options(store, ServiceOptions::default())
    }

    pub fn with_options(store: Arc<S>, options: ServiceOptions) -> Self {
        let catalog = FleetCatalog::new(store).with_thresholds(options.thresholds);
        let scorer = PlacementScorer::new(catalog.registry.clone());
        let replication = ReplicationManager::new(catalog.clone(), scorer.clone());
        let detector = Detector::new(catalog.clone());
        let rebalancer = Rebalancer::new(
            catalog.clone(),
            scorer,
            replication.clone(),
            detector.clone(),
        )
        .with_structural(options.structural);

        let mut simulator = Simulator::new(catalog.clone(), replication.clone(), rebalancer.clone());
        if let Some(seed) = options.seed {
            simulator = simulator.with_seed(seed);
        }

        Self {
            catalog,
            replication,
            detector,
            rebalancer,
            simulator,
        }
    }

    /// Same store and options with a different structural planner
    pub fn with_structural(&self, structural: Arc<dyn StructuralRebalance>) -> Self {
        let mut service = self.clone();
        service.rebalancer = service.rebalancer.with_structural(structural);
        service.simulator = service.simulator.with_rebalancer(service.rebalancer.clone());
        service
    }

    pub fn catalog(&self) -> &FleetCatalog<S> {
        &self.catalog
    }

    pub fn store(&self) -> &Arc<S> {
        &self.catalog.store
    }

    /// Register the manifest's drives and policies
    #[instrument(skip(self, manifest))]
    pub async fn seed(&self, manifest: &FleetManifest) -> Result<SeedReport> {
        let mut report = SeedReport::default();

        for drive in &manifest.drives {
            report.drives.push(self.register_drive(drive.clone()).await?);
        }

        for entry in &manifest.policies {
            let mut policy = self.create_policy(entry.policy.clone()).await?;
            if entry.active {
                policy = self.activate_policy(&policy.id).await?;
                report.active_policy = Some(policy.name.clone());
            }
            report.policies.push(policy);
        }

        info!(
            drives = report.drives.len(),
            policies = report.policies.len(),
            "Fleet seeded"
        );
        Ok(report)
    }

    // =========================================================================
    // CHUNKS
    // =========================================================================

    pub async fn create_chunk(&self, new: NewChunk) -> Result<ChunkPlacement> {
        self.replication.create_chunk(new).await
    }

    pub async fn create_limited_replicas(&self, chunk_id: &str, requested: u32) -> Result<LimitedReplicas> {
        self.replication.create_limited_replicas(chunk_id, requested).await
    }

    /// Delete a chunk; returns the MB freed per copy
    pub async fn delete_chunk(&self, chunk_id: &str) -> Result<u64> {
        self.replication.delete_chunk(chunk_id).await
    }

    /// Rename, reprioritize or mark a chunk; placement is left alone
    pub async fn update_chunk(&self, chunk_id: &str, update: ChunkUpdate) -> Result<DataChunk> {
        self.catalog.chunks.update_chunk(chunk_id, update).await
    }

    pub async fn get_chunk(&self, chunk_id: &str) -> Result<DataChunk> {
        self.catalog.chunks.get_chunk(chunk_id).await
    }

    pub async fn list_chunks(&self) -> Result<Vec<DataChunk>> {
        self.catalog.chunks.list_chunks().await
    }

    pub async fn replicas_of(&self, chunk_id: &str) -> Result<Vec<Replica>> {
        self.catalog.chunks.get_chunk(chunk_id).await?;
        self.catalog.chunks.replicas_of(chunk_id).await
    }

    /// Redistribution history, newest first
    pub async fn list_logs(&self) -> Result<Vec<RedistributionLog>> {
        self.catalog.chunks.list_logs().await
    }

    // =========================================================================
    // REBALANCING
    // =========================================================================

    pub async fn relocate_chunk(
        &self,
        chunk_id: &str,
        target_drive_id: &str,
        reason: Option<&str>,
    ) -> Result<RedistributionLog> {
        self.rebalancer
            .relocate_chunk(chunk_id, target_drive_id, reason)
            .await
    }

    pub async fn trigger_rebalance(&self) -> Result<RebalanceReport> {
        self.rebalancer.trigger_rebalance().await
    }

    pub async fn redistribute_from_failing_drive(
        &self,
        drive_id: &str,
        reason: &str,
    ) -> Result<RedistributionReport> {
        self.rebalancer
            .redistribute_from_failing_drive(drive_id, reason)
            .await
    }

    pub async fn recover_chunk(&self, chunk_id: &str) -> Result<RedistributionLog> {
        self.rebalancer.recover_chunk(chunk_id).await
    }

    /// Under-replicated chunks, ordered per the active policy
    pub async fn find_under_replicated_chunks(&self, min_replicas: u32) -> Result<Vec<UnderReplicatedChunk>> {
        let priority_based = self
            .catalog
            .policies
            .active_policy()
            .await?
            .map_or(false, |p| p.priority_based_placement);
        self.detector
            .find_under_replicated_chunks(min_replicas, priority_based)
            .await
    }

    /// Scan the fleet against the active policy
    pub async fn scan(&self) -> Result<ScanResult> {
        let policy = self.catalog.policies.active_policy().await?;
        self.detector.scan(policy.as_ref()).await
    }

    // =========================================================================
    // HEALTH
    // =========================================================================

    /// Record a metric; a drive pushed into FAILING is drained right away
    #[instrument(skip(self, metric), fields(drive_id = %metric.drive_id))]
    pub async fn ingest_metric(&self, metric: NewMetric) -> Result<MetricIngest> {
        let outcome = self.catalog.health.record_metric(metric).await?;

        let redistribution = if outcome.became_failing() {
            let drive_id = outcome.metric.drive_id.clone();
            warn!(drive_id = %drive_id, "Drive failing, starting redistribution");
            Some(
                self.rebalancer
                    .redistribute_from_failing_drive(&drive_id, METRIC_FAILURE_REASON)
                    .await?,
            )
        } else {
            None
        };

        Ok(MetricIngest {
            outcome,
            redistribution,
        })
    }

    pub async fn recent_metrics(&self, drive_id: &str, limit: usize) -> Result<Vec<DriveMetric>> {
        self.catalog.health.recent_metrics(drive_id, limit).await
    }

    pub async fn system_health(&self) -> Result<SystemHealth> {
        self.catalog.health.system_health().await
    }

    pub async fn fleet_summary(&self) -> Result<FleetSummary> {
        self.catalog.health.fleet_summary().await
    }

    // =========================================================================
    // ANALYSIS
    // =========================================================================

    pub async fn allocation_analysis(&self) -> Result<AllocationAnalysis> {
        self.catalog.analysis.allocation_analysis().await
    }

    /// Recent events, newest first; zero means the default limit
    pub async fn event_timeline(&self, limit: usize) -> Result<Vec<FleetEvent>> {
        self.catalog.analysis.event_timeline(limit).await
    }

    pub async fn drive_statistics(&self, drive_id: &str) -> Result<DriveStatistics> {
        self.catalog.analysis.drive_statistics(drive_id).await
    }

    /// Metrics of the last `hours` hours per drive; zero means the default window
    pub async fn performance_metrics(&self, hours: u32) -> Result<Vec<DrivePerformance>> {
        self.catalog.analysis.performance_metrics(hours).await
    }

    /// Optimization recommendations against the active policy
    pub async fn recommendations(&self) -> Result<OptimizationReport> {
        let policy = self.catalog.policies.active_policy().await?;
        let snapshot = FleetSnapshot::capture(&self.catalog).await?;
        Ok(advisor::recommend(&snapshot, policy.as_ref()))
    }

    // =========================================================================
    // DRIVES
    // =========================================================================

    pub async fn register_drive(&self, new: NewDrive) -> Result<Drive> {
        self.catalog.registry.register_drive(new).await
    }

    pub async fn update_drive(&self, drive_id: &str, update: DriveUpdate) -> Result<Drive> {
        self.catalog.registry.update_drive(drive_id, update).await
    }

    pub async fn set_drive_status(&self, drive_id: &str, status: DriveStatus) -> Result<StatusChange> {
        self.catalog.registry.set_status(drive_id, status).await
    }

    pub async fn get_drive(&self, drive_id: &str) -> Result<Drive> {
        self.catalog.registry.get_drive(drive_id).await
    }

    pub async fn list_drives(&self) -> Result<Vec<Drive>> {
        self.catalog.registry.list_drives().await
    }

    pub async fn delete_drive(&self, drive_id: &str, force: bool) -> Result<DriveDeletion> {
        self.catalog.registry.delete_drive(drive_id, force).await
    }

    // =========================================================================
    // POLICIES
    // =========================================================================

    pub async fn create_policy(&self, new: NewPolicy) -> Result<DistributionPolicy> {
        self.catalog.policies.create_policy(new).await
    }

    pub async fn update_policy(&self, policy_id: &str, update: PolicyUpdate) -> Result<DistributionPolicy> {
        self.catalog.policies.update_policy(policy_id, update).await
    }

    pub async fn activate_policy(&self, policy_id: &str) -> Result<DistributionPolicy> {
        self.catalog.policies.activate_policy(policy_id).await
    }

    pub async fn delete_policy(&self, policy_id: &str) -> Result<DistributionPolicy> {
        self.catalog.policies.delete_policy(policy_id).await
    }

    pub async fn list_policies(&self) -> Result<Vec<DistributionPolicy>> {
        self.catalog.policies.list_policies().await
    }

    pub async fn active_policy(&self) -> Result<Option<DistributionPolicy>> {
        self.catalog.policies.active_policy().await
    }

    // =========================================================================
    // SIMULATION
    // =========================================================================

    pub async fn simulate_drive_failure(&self, drive_id: &str, kind: FailureKind) -> Result<DriveFailureOutcome> {
        self.simulator.simulate_drive_failure(drive_id, kind).await
    }

    pub async fn simulate_chunk_corruption(&self, chunk_id: &str) -> Result<CorruptionOutcome> {
        self.simulator.simulate_chunk_corruption(chunk_id).await
    }

    pub async fn simulate_high_load(
        &self,
        drive_count: Option<usize>,
        load_percent: Option<u8>,
    ) -> Result<HighLoadOutcome> {
        self.simulator.simulate_high_load(drive_count, load_percent).await
    }

    pub async fn generate_random_chunks(&self, request: RandomChunkRequest) -> Result<RandomChunksOutcome> {
        self.simulator.generate_random_chunks(request).await
    }

    pub async fn reset_simulation(&self) -> Result<ResetOutcome> {
        let outcome = self.simulator.reset_simulation().await?;
        info!(chunks_deleted = outcome.chunks_deleted, "Simulation data cleared");
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkfleet_metadata::LogStatus;
    use chunkfleet_storage::MemoryStore;

    #[tokio::test]
    async fn test_metric_failure_triggers_redistribution() {
        let service = FleetService::new(Arc::new(MemoryStore::new()));
        let sick = service
            .register_drive(NewDrive::new("sick", "dc1", 1000))
            .await
            .unwrap();
        let spare = service
            .register_drive(NewDrive::new("spare", "dc1", 1000))
            .await
            .unwrap();
        let placed = service
            .create_chunk(NewChunk::new("c", 100).on_drive(&sick.id).without_replication())
            .await
            .unwrap();

        let ingest = service
            .ingest_metric(NewMetric::new(&sick.id).with_error_rate(0.07))
            .await
            .unwrap();
        let transition = ingest.outcome.transition.unwrap();
        assert_eq!(transition.current, DriveStatus::Degraded);
        assert!(ingest.redistribution.is_none());

        let ingest = service
            .ingest_metric(NewMetric::new(&sick.id).with_temperature(91.0))
            .await
            .unwrap();
        assert!(ingest.outcome.became_failing());
        let report = ingest.redistribution.unwrap();
        assert_eq!(report.relocated.len(), 1);
        assert_eq!(report.relocated[0].reason, METRIC_FAILURE_REASON);
        assert_eq!(report.relocated[0].status, LogStatus::Completed);

        let chunk = service.get_chunk(&placed.chunk.id).await.unwrap();
        assert_eq!(chunk.drive_id, spare.id);
    }

    #[tokio::test]
    async fn test_options_from_config() {
        let mut config = RebalancerConfig::default();
        config.rebalance.structural = crate::config::StructuralMode::Utilization;
        config.simulation.seed = Some(1);

        let options = ServiceOptions::from_config(&config);
        assert_eq!(options.structural.name(), "utilization");
        assert_eq!(options.seed, Some(1));

        let service = FleetService::with_options(Arc::new(MemoryStore::new()), options);
        let report = service.trigger_rebalance().await.unwrap();
        assert_eq!(report.structural.planner, "utilization");

        let plain = service.with_structural(Arc::new(NoStructuralRebalance));
        assert_eq!(plain.trigger_rebalance().await.unwrap().structural.planner, "none");
    }

    #[tokio::test]
    async fn test_seed_from_manifest() {
        let manifest = FleetManifest::from_toml(
            r#"
            [[drives]]
            name = "primary"
            location = "rack-1"
            capacity_mb = 1000

            [[drives]]
            name = "backup"
            location = "rack-2"
            capacity_mb = 1000
            is_backup = true

            [[policies]]
            name = "standard"
            min_replicas = 1
            active = true
            "#,
        )
        .unwrap();

        let service = FleetService::new(Arc::new(MemoryStore::new()));
        let report = service.seed(&manifest).await.unwrap();
        assert_eq!(report.drives.len(), 2);
        assert_eq!(report.active_policy.as_deref(), Some("standard"));

        let placed = service.create_chunk(NewChunk::new("c", 10)).await.unwrap();
        assert_eq!(placed.replicas.len(), 1);
        assert!(placed.warning.is_none());
    }

    #[tokio::test]
    async fn test_policy_and_drive_pass_through() {
        let service = FleetService::new(Arc::new(MemoryStore::new()));
        let policy = service.create_policy(NewPolicy::new("p")).await.unwrap();
        assert!(service.active_policy().await.unwrap().is_none());

        service.activate_policy(&policy.id).await.unwrap();
        assert_eq!(service.active_policy().await.unwrap().unwrap().id, policy.id);

        let drive = service
            .register_drive(NewDrive::new("d", "dc1", 100))
            .await
            .unwrap();
        let change = service
            .set_drive_status(&drive.id, DriveStatus::Maintenance)
            .await
            .unwrap();
        assert!(change.changed());

        let deletion = service.delete_drive(&drive.id, false).await.unwrap();
        assert_eq!(deletion.drive.id, drive.id);
        assert!(service.list_drives().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recommendations_follow_chunk_updates() {
        use crate::advisor::RecommendationKind;

        let service = FleetService::new(Arc::new(MemoryStore::new()));
        let primary = service
            .register_drive(NewDrive::new("primary", "dc1", 1000))
            .await
            .unwrap();
        service
            .register_drive(NewDrive::new("backup", "dc1", 1000).backup())
            .await
            .unwrap();
        let placed = service
            .create_chunk(NewChunk::new("c", 100).with_priority(5).without_replication())
            .await
            .unwrap();

        let report = service.recommendations().await.unwrap();
        let kinds: Vec<_> = report.recommendations.iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            vec![
                RecommendationKind::Protect,
                RecommendationKind::Consolidate,
                RecommendationKind::LocationBalance,
            ]
        );

        let updated = service
            .update_chunk(
                &placed.chunk.id,
                ChunkUpdate {
                    priority: Some(2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.priority, 2);
        let report = service.recommendations().await.unwrap();
        assert!(report
            .recommendations
            .iter()
            .all(|r| r.kind != RecommendationKind::Protect));

        let analysis = service.allocation_analysis().await.unwrap();
        assert_eq!(analysis.drives.len(), 2);
        assert_eq!(analysis.priority_distribution[0].priority, 2);

        let stats = service.drive_statistics(&primary.id).await.unwrap();
        assert_eq!(stats.chunk_count, 1);
        assert_eq!(stats.chunk_size_mb, 100);

        assert!(service.event_timeline(0).await.unwrap().is_empty());
        assert!(service.performance_metrics(0).await.unwrap().is_empty());
    }
}
