//! Rebalancer
//!
//! Restores replica counts, moves chunks between drives and recovers
//! corrupted chunks. Every chunk move goes through [`Rebalancer::relocate_chunk`],
//! which either commits fully or rolls back to the state it found.

use crate::detector::Detector;
use crate::metrics;
use crate::replication::ReplicationManager;
use crate::scorer::PlacementScorer;
use crate::structural::{FleetSnapshot, NoStructuralRebalance, StructuralRebalance};
use chunkfleet_core::{FleetError, Result};
use chunkfleet_metadata::{
    ChunkStatus, DataChunk, DistributionPolicy, Drive, DriveStatus, FleetCatalog, RedistributionLog,
    ReplicaStatus,
};
use chunkfleet_storage::RecordStore;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

/// Reason stored when a caller relocates without giving one
pub const MANUAL_RELOCATION_REASON: &str = "Manual relocation";

/// Reason stored on recovery logs
pub const RECOVERY_REASON: &str = "Recovering corrupted chunk from replica";

// =============================================================================
// REPORTS
// =============================================================================

/// Replicas still missing after a rebalance pass
#[derive(Debug, Clone, Serialize)]
pub struct ReplicaShortfall {
    pub chunk_id: String,
    pub needed: usize,
    pub created: usize,
}

/// Per-item failure recorded instead of aborting the pass
#[derive(Debug, Clone, Serialize)]
pub struct ItemFailure {
    pub chunk_id: String,
    pub error: String,
}

/// What the structural step planned and executed
#[derive(Debug, Clone, Default, Serialize)]
pub struct StructuralOutcome {
    pub planner: String,
    pub planned: usize,
    pub relocated: Vec<RedistributionLog>,
    pub failures: Vec<ItemFailure>,
}

/// Result of a rebalance pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct RebalanceReport {
    /// Active policy name; `None` skips the replication pass
    pub policy: Option<String>,
    pub chunks_examined: usize,
    pub replicas_created: usize,
    pub shortfalls: Vec<ReplicaShortfall>,
    pub errors: Vec<ItemFailure>,
    pub structural: StructuralOutcome,
    pub duration: Duration,
}

impl RebalanceReport {
    pub fn summary(&self) -> String {
        format!(
            "Rebalance ({}) in {:?}: {} chunks examined, {} replicas created, {} short, {} errors, {}/{} structural moves",
            self.policy.as_deref().unwrap_or("no active policy"),
            self.duration,
            self.chunks_examined,
            self.replicas_created,
            self.shortfalls.len(),
            self.errors.len(),
            self.structural.relocated.len(),
            self.structural.planned
        )
    }
}

/// Result of draining a failing drive
#[derive(Debug, Clone, Default, Serialize)]
pub struct RedistributionReport {
    pub drive_id: String,
    pub relocated: Vec<RedistributionLog>,

    /// Chunks with no eligible target; each has a FAILED log
    pub stranded: Vec<String>,

    /// Chunks not ACTIVE at the time of the pass
    pub skipped: Vec<String>,
    pub failures: Vec<ItemFailure>,
}

impl RedistributionReport {
    pub fn summary(&self) -> String {
        format!(
            "Drive {}: {} relocated, {} stranded, {} skipped, {} failed",
            self.drive_id,
            self.relocated.len(),
            self.stranded.len(),
            self.skipped.len(),
            self.failures.len()
        )
    }
}

// =============================================================================
// RELOCATION SAGA
// =============================================================================

/// Steps of a relocation that have been applied
#[derive(Debug, Default)]
struct SagaProgress {
    reserved: bool,
    log_id: Option<String>,
    marked: bool,
    moved: bool,
    source_released: bool,
}

/// Rebalancer service
pub struct Rebalancer<S> {
    catalog: FleetCatalog<S>,
    scorer: PlacementScorer<S>,
    replication: ReplicationManager<S>,
    detector: Detector<S>,
    structural: Arc<dyn StructuralRebalance>,
}

impl<S> Clone for Rebalancer<S> {
    fn clone(&self) -> Self {
        Self {
            catalog: self.catalog.clone(),
            scorer: self.scorer.clone(),
            replication: self.replication.clone(),
            detector: self.detector.clone(),
            structural: self.structural.clone(),
        }
    }
}

impl<S: RecordStore> Rebalancer<S> {
    /// Create a rebalancer with no structural step
    pub fn new(
        catalog: FleetCatalog<S>,
        scorer: PlacementScorer<S>,
        replication: ReplicationManager<S>,
        detector: Detector<S>,
    ) -> Self {
        Self {
            catalog,
            scorer,
            replication,
            detector,
            structural: Arc::new(NoStructuralRebalance),
        }
    }

    /// Replace the structural rebalance planner
    pub fn with_structural(mut self, structural: Arc<dyn StructuralRebalance>) -> Self {
        self.structural = structural;
        self
    }

    pub fn structural_name(&self) -> &'static str {
        self.structural.name()
    }

    /// Restore replica counts, then run the structural step
    #[instrument(skip(self))]
    pub async fn trigger_rebalance(&self) -> Result<RebalanceReport> {
        let start = Instant::now();
        let policy = self.catalog.policies.active_policy().await?;

        let mut report = RebalanceReport {
            policy: policy.as_ref().map(|p| p.name.clone()),
            ..Default::default()
        };

        match &policy {
            Some(p) => {
                let candidates = self
                    .detector
                    .find_under_replicated_chunks(p.min_replicas, p.priority_based_placement)
                    .await?;
                report.chunks_examined = candidates.len();

                for candidate in candidates {
                    let chunk_id = candidate.chunk.id.clone();
                    match self.replication.add_replicas(&candidate.chunk, candidate.needed).await {
                        Ok(outcome) => {
                            report.replicas_created += outcome.replicas.len();
                            if outcome.shortfall > 0 {
                                report.shortfalls.push(ReplicaShortfall {
                                    chunk_id,
                                    needed: candidate.needed,
                                    created: outcome.replicas.len(),
                                });
                            }
                        }
                        Err(e) => {
                            warn!(chunk_id = %chunk_id, error = %e, "Replica placement failed");
                            report.errors.push(ItemFailure {
                                chunk_id,
                                error: e.to_string(),
                            });
                        }
                    }
                }
            }
            None => info!("No active policy, skipping replication pass"),
        }

        report.structural = self.run_structural(policy.as_ref()).await?;
        report.duration = start.elapsed();

        metrics::record_rebalance(self.structural.name());
        info!(summary = %report.summary(), "Rebalance complete");
        Ok(report)
    }

    async fn run_structural(
        &self,
        policy: Option<&DistributionPolicy>,
    ) -> Result<StructuralOutcome> {
        let snapshot = FleetSnapshot::capture(&self.catalog).await?;

        let plan = self.structural.plan(&snapshot, policy);
        let mut outcome = StructuralOutcome {
            planner: self.structural.name().to_string(),
            planned: plan.len(),
            ..Default::default()
        };

        for suggestion in plan {
            debug!(
                chunk_id = %suggestion.chunk_id,
                source = %suggestion.source_drive_id,
                target = %suggestion.target_drive_id,
                "Executing structural move"
            );
            match self
                .relocate_chunk(
                    &suggestion.chunk_id,
                    &suggestion.target_drive_id,
                    Some(&suggestion.reason),
                )
                .await
            {
                Ok(log) => outcome.relocated.push(log),
                Err(e) => outcome.failures.push(ItemFailure {
                    chunk_id: suggestion.chunk_id,
                    error: e.to_string(),
                }),
            }
        }

        Ok(outcome)
    }

    /// Move a chunk's primary to `target_drive_id`
    ///
    /// Returns the COMPLETED log. On failure after space was reserved, the
    /// reservation is released, the chunk is ACTIVE on its original drive and
    /// the log is FAILED.
    #[instrument(skip(self, reason))]
    pub async fn relocate_chunk(
        &self,
        chunk_id: &str,
        target_drive_id: &str,
        reason: Option<&str>,
    ) -> Result<RedistributionLog> {
        let reason = reason.unwrap_or(MANUAL_RELOCATION_REASON);
        let chunk = self.catalog.chunks.get_chunk(chunk_id).await?;
        if chunk.status != ChunkStatus::Active {
            return Err(FleetError::InvalidState(format!(
                "chunk {} is {} and cannot be relocated",
                chunk.id, chunk.status
            )));
        }
        let size = chunk.size()?;

        if chunk.drive_id == target_drive_id {
            return Err(FleetError::InvalidRequest(format!(
                "chunk {} already lives on drive {}",
                chunk.id, target_drive_id
            )));
        }

        let target = self.catalog.registry.get_drive(target_drive_id).await?;
        if target.status.is_failure() {
            return Err(FleetError::InvalidState(format!(
                "target drive {} is {}",
                target.id, target.status
            )));
        }

        let replicas = self.catalog.chunks.replicas_of(&chunk.id).await?;
        if replicas.iter().any(|r| r.drive_id == target.id) {
            return Err(FleetError::InvalidRequest(format!(
                "drive {} already holds a replica of chunk {}",
                target.id, chunk.id
            )));
        }

        let mut progress = SagaProgress::default();
        match self
            .apply_relocation(&chunk, &target, size, reason, &mut progress)
            .await
        {
            Ok(log) => {
                metrics::record_relocation(true);
                info!(
                    chunk_id = %chunk.id,
                    source = %chunk.drive_id,
                    target = %target.id,
                    size_mb = size,
                    "Chunk relocated"
                );
                Ok(log)
            }
            Err(e) => {
                error!(chunk_id = %chunk.id, target = %target.id, error = %e, "Relocation failed, rolling back");
                self.roll_back(&chunk, &target, size, &progress).await;
                metrics::record_relocation(false);
                Err(e)
            }
        }
    }

    async fn apply_relocation(
        &self,
        chunk: &DataChunk,
        target: &Drive,
        size: u64,
        reason: &str,
        progress: &mut SagaProgress,
    ) -> Result<RedistributionLog> {
        // Prepare
        self.catalog.registry.reserve_space(&target.id, size).await?;
        progress.reserved = true;

        let log = self
            .catalog
            .chunks
            .open_log(&chunk.id, &chunk.drive_id, Some(&target.id), reason)
            .await?;
        progress.log_id = Some(log.id.clone());

        self.catalog
            .chunks
            .compare_and_set_status(&chunk.id, ChunkStatus::Active, ChunkStatus::Redistributing)
            .await?;
        progress.marked = true;

        // Commit
        self.catalog
            .chunks
            .move_chunk(&chunk.id, &chunk.drive_id, &target.id)
            .await?;
        progress.moved = true;

        match self.catalog.registry.release_space(&chunk.drive_id, size).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                warn!(drive_id = %chunk.drive_id, "Source drive gone, nothing to release");
            }
            Err(e) => return Err(e),
        }
        progress.source_released = true;

        self.catalog.chunks.complete_log(&log.id).await
    }

    async fn roll_back(&self, chunk: &DataChunk, target: &Drive, size: u64, progress: &SagaProgress) {
        if progress.source_released {
            if let Err(e) = self.catalog.registry.reserve_space(&chunk.drive_id, size).await {
                warn!(drive_id = %chunk.drive_id, error = %e, "Rollback could not re-reserve source space");
            }
        }

        if progress.moved {
            if let Err(e) = self
                .catalog
                .chunks
                .move_chunk(&chunk.id, &target.id, &chunk.drive_id)
                .await
            {
                warn!(chunk_id = %chunk.id, error = %e, "Rollback could not restore primary drive");
            }
        } else if progress.marked {
            if let Err(e) = self
                .catalog
                .chunks
                .compare_and_set_status(&chunk.id, ChunkStatus::Redistributing, ChunkStatus::Active)
                .await
            {
                warn!(chunk_id = %chunk.id, error = %e, "Rollback could not restore chunk status");
            }
        }

        if progress.reserved {
            if let Err(e) = self.catalog.registry.release_space(&target.id, size).await {
                warn!(drive_id = %target.id, error = %e, "Rollback could not release target space");
            }
        }

        if let Some(log_id) = &progress.log_id {
            if let Err(e) = self.catalog.chunks.fail_log(log_id).await {
                warn!(log_id = %log_id, error = %e, "Rollback could not fail the log");
            }
        }
    }

    /// Move every ACTIVE primary chunk off a failing drive
    ///
    /// Chunks with no eligible target get a FAILED log and are reported as
    /// stranded. Individual failures are recorded, not raised.
    #[instrument(skip(self, reason))]
    pub async fn redistribute_from_failing_drive(
        &self,
        drive_id: &str,
        reason: &str,
    ) -> Result<RedistributionReport> {
        let drive = self.catalog.registry.get_drive(drive_id).await?;
        if !matches!(
            drive.status,
            DriveStatus::Failing | DriveStatus::Failed | DriveStatus::Maintenance
        ) {
            return Err(FleetError::InvalidState(format!(
                "drive {} is {}; only FAILING, FAILED or MAINTENANCE drives are drained",
                drive.id, drive.status
            )));
        }

        let mut report = RedistributionReport {
            drive_id: drive.id.clone(),
            ..Default::default()
        };

        let mut chunks = self.catalog.chunks.chunks_on_drive(&drive.id).await?;
        chunks.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));

        for chunk in chunks {
            if chunk.status != ChunkStatus::Active {
                debug!(chunk_id = %chunk.id, status = %chunk.status, "Skipping non-active chunk");
                report.skipped.push(chunk.id);
                continue;
            }

            match self.relocate_off(&chunk, reason).await {
                Ok(Some(log)) => report.relocated.push(log),
                Ok(None) => report.stranded.push(chunk.id),
                Err(e) => {
                    warn!(chunk_id = %chunk.id, error = %e, "Redistribution failed for chunk");
                    report.failures.push(ItemFailure {
                        chunk_id: chunk.id,
                        error: e.to_string(),
                    });
                }
            }
        }

        metrics::record_stranded(report.stranded.len());
        info!(summary = %report.summary(), "Redistribution complete");
        Ok(report)
    }

    /// Relocate one chunk to the best unused primary drive, or record it as stranded
    async fn relocate_off(&self, chunk: &DataChunk, reason: &str) -> Result<Option<RedistributionLog>> {
        let size = chunk.size()?;
        let used = self.catalog.chunks.used_drives(chunk).await?;

        for target in self.scorer.primary_candidates(size, &used).await? {
            match self.relocate_chunk(&chunk.id, &target.id, Some(reason)).await {
                Ok(log) => return Ok(Some(log)),
                Err(e) if e.is_insufficient_space() => continue,
                Err(e) => return Err(e),
            }
        }

        warn!(chunk_id = %chunk.id, drive_id = %chunk.drive_id, "No eligible target, chunk stranded");
        self.catalog
            .chunks
            .record_failure(&chunk.id, &chunk.drive_id, None, reason)
            .await?;
        Ok(None)
    }

    /// Bring a CORRUPTED chunk back from a healthy replica
    #[instrument(skip(self))]
    pub async fn recover_chunk(&self, chunk_id: &str) -> Result<RedistributionLog> {
        let chunk = self.catalog.chunks.get_chunk(chunk_id).await?;
        if chunk.status != ChunkStatus::Corrupted {
            return Err(FleetError::InvalidState(format!(
                "chunk {} is {}, only CORRUPTED chunks are recovered",
                chunk.id, chunk.status
            )));
        }

        let source = self
            .healthy_replica_drive(&chunk)
            .await?
            .ok_or_else(|| FleetError::NoHealthyReplica(chunk.id.clone()))?;

        let log = self
            .catalog
            .chunks
            .open_log(&chunk.id, &source, Some(&chunk.drive_id), RECOVERY_REASON)
            .await?;

        if let Err(e) = self
            .catalog
            .chunks
            .compare_and_set_status(&chunk.id, ChunkStatus::Corrupted, ChunkStatus::Active)
            .await
        {
            if let Err(fail) = self.catalog.chunks.fail_log(&log.id).await {
                warn!(log_id = %log.id, error = %fail, "Could not fail recovery log");
            }
            return Err(e);
        }

        let log = self.catalog.chunks.complete_log(&log.id).await?;
        metrics::record_recovery();
        info!(chunk_id, source = %source, "Chunk recovered from replica");
        Ok(log)
    }

    /// Drive id of a HEALTHY replica on a HEALTHY drive
    pub async fn healthy_replica_drive(&self, chunk: &DataChunk) -> Result<Option<String>> {
        let mut replicas = self.catalog.chunks.replicas_of(&chunk.id).await?;
        replicas.sort_by(|a, b| a.id.cmp(&b.id));

        for replica in replicas {
            if replica.status != ReplicaStatus::Healthy {
                continue;
            }
            match self.catalog.registry.find_drive(&replica.drive_id).await? {
                Some(drive) if drive.status == DriveStatus::Healthy => {
                    return Ok(Some(drive.id))
                }
                _ => continue,
            }
        }
        Ok(None)
    }
}
