//! Chunk Detector
//!
//! Scans the catalog for:
//! - Under-replicated chunks (fewer replicas than the active policy wants)
//! - Drives above the policy's rebalance threshold
//! - Failing or failed drives still holding primary chunks
//! - Corrupted chunks

use crate::metrics;
use chunkfleet_core::{Result, DEFAULT_REBALANCE_THRESHOLD};
use chunkfleet_metadata::{ChunkStatus, DataChunk, DistributionPolicy, Drive, DriveStatus, FleetCatalog};
use chunkfleet_storage::RecordStore;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument};

/// An ACTIVE chunk below the replica target
#[derive(Debug, Clone, Serialize)]
pub struct UnderReplicatedChunk {
    pub chunk: DataChunk,
    pub replica_count: usize,

    /// Replicas missing to reach the target
    pub needed: usize,
}

/// Drive with primary chunks that should move off it
#[derive(Debug, Clone, Serialize)]
pub struct DriveAtRisk {
    pub drive: Drive,
    pub chunk_count: usize,
}

/// Scan results
#[derive(Debug, Default, Serialize)]
pub struct ScanResult {
    /// Total chunks scanned
    pub total_chunks: usize,
    pub under_replicated: Vec<UnderReplicatedChunk>,
    /// Healthy drives above the rebalance threshold
    pub over_threshold_drives: Vec<Drive>,
    pub failing_drives_with_chunks: Vec<DriveAtRisk>,
    pub corrupted_chunks: Vec<DataChunk>,
    /// Scan duration
    pub duration: Duration,
}

impl ScanResult {
    /// Check if there are any critical issues
    pub fn has_critical_issues(&self) -> bool {
        !self.failing_drives_with_chunks.is_empty()
            || !self.corrupted_chunks.is_empty()
            || self.under_replicated.iter().any(|u| u.replica_count == 0)
    }

    /// Get summary statistics
    pub fn summary(&self) -> String {
        format!(
            "Scanned {} chunks in {:?}: {} under-replicated, {} drives over threshold, {} failing drives with chunks, {} corrupted",
            self.total_chunks,
            self.duration,
            self.under_replicated.len(),
            self.over_threshold_drives.len(),
            self.failing_drives_with_chunks.len(),
            self.corrupted_chunks.len()
        )
    }
}

/// Chunk detector service
pub struct Detector<S> {
    catalog: FleetCatalog<S>,
}

impl<S> Clone for Detector<S> {
    fn clone(&self) -> Self {
        Self {
            catalog: self.catalog.clone(),
        }
    }
}

impl<S: RecordStore> Detector<S> {
    /// Create a new detector
    pub fn new(catalog: FleetCatalog<S>) -> Self {
        Self { catalog }
    }

    /// ACTIVE chunks with fewer than `min_replicas` replicas
    ///
    /// Ordered by priority descending then id when `priority_based` is set,
    /// by id otherwise.
    pub async fn find_under_replicated_chunks(
        &self,
        min_replicas: u32,
        priority_based: bool,
    ) -> Result<Vec<UnderReplicatedChunk>> {
        let counts = self.replica_counts().await?;
        let chunks = self.catalog.chunks.chunks_with_status(ChunkStatus::Active).await?;

        let mut found: Vec<UnderReplicatedChunk> = chunks
            .into_iter()
            .filter_map(|chunk| {
                let replica_count = counts.get(chunk.id.as_str()).copied().unwrap_or(0);
                let target = min_replicas as usize;
                (replica_count < target).then(|| UnderReplicatedChunk {
                    needed: target - replica_count,
                    replica_count,
                    chunk,
                })
            })
            .collect();

        found.sort_by(|a, b| a.chunk.id.cmp(&b.chunk.id));
        if priority_based {
            found.sort_by(|a, b| b.chunk.priority.cmp(&a.chunk.priority));
        }

        debug!(min_replicas, found = found.len(), "Under-replicated chunks");
        Ok(found)
    }

    /// Scan the fleet against `policy`
    ///
    /// Without a policy the fallback replica target and the default
    /// rebalance threshold apply.
    #[instrument(skip(self, policy))]
    pub async fn scan(&self, policy: Option<&DistributionPolicy>) -> Result<ScanResult> {
        let start = Instant::now();
        info!("Starting chunk scan");

        let (min_replicas, threshold, priority_based) = match policy {
            Some(p) => (p.min_replicas, p.rebalance_threshold, p.priority_based_placement),
            None => (
                chunkfleet_core::FALLBACK_MIN_REPLICAS,
                DEFAULT_REBALANCE_THRESHOLD,
                false,
            ),
        };

        let mut result = ScanResult {
            under_replicated: self
                .find_under_replicated_chunks(min_replicas, priority_based)
                .await?,
            ..Default::default()
        };

        let chunks = self.catalog.chunks.list_chunks().await?;
        result.total_chunks = chunks.len();

        let mut per_drive: HashMap<&str, usize> = HashMap::new();
        for chunk in &chunks {
            *per_drive.entry(chunk.drive_id.as_str()).or_default() += 1;
        }

        for drive in self.catalog.registry.list_drives().await? {
            let on_drive = per_drive.get(drive.id.as_str()).copied().unwrap_or(0);
            if drive.status.is_failure() && on_drive > 0 {
                result.failing_drives_with_chunks.push(DriveAtRisk {
                    drive,
                    chunk_count: on_drive,
                });
            } else if drive.status == DriveStatus::Healthy
                && drive.utilization_percent() > threshold as f64
            {
                result.over_threshold_drives.push(drive);
            }
        }

        result.corrupted_chunks = chunks
            .into_iter()
            .filter(|c| c.status == ChunkStatus::Corrupted)
            .collect();

        result.duration = start.elapsed();
        metrics::set_under_replicated(result.under_replicated.len());

        info!(
            under_replicated = result.under_replicated.len(),
            corrupted = result.corrupted_chunks.len(),
            duration = ?result.duration,
            "Scan complete"
        );
        Ok(result)
    }

    async fn replica_counts(&self) -> Result<HashMap<String, usize>> {
        let mut counts = HashMap::new();
        for replica in self.catalog.chunks.list_replicas().await? {
            *counts.entry(replica.chunk_id).or_default() += 1;
        }
        Ok(counts)
    }
}
