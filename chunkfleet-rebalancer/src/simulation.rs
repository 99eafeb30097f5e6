//! Fault and load simulation
//!
//! Drives the catalog into failure, corruption and high-load states so the
//! rebalancer can be exercised. Generated chunks carry `LoadTest` or
//! `RandomData` name prefixes and are removed again by `reset_simulation`.
//! Randomness comes from a seedable RNG.

use crate::rebalancer::{RebalanceReport, Rebalancer, RedistributionReport};
use crate::replication::ReplicationManager;
use chrono::Utc;
use chunkfleet_core::{FleetError, Result, MAX_CHUNK_PRIORITY, MIN_CHUNK_PRIORITY};
use chunkfleet_metadata::{
    ChunkStatus, DataChunk, DriveStatus, FleetCatalog, NewChunk, NewMetric, Replica, ReplicaStatus,
    StatusChange,
};
use chunkfleet_storage::RecordStore;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Name prefix of high-load chunks
pub const LOAD_TEST_PREFIX: &str = "LoadTest";

/// Name prefix of generated chunks
pub const RANDOM_DATA_PREFIX: &str = "RandomData";

const DEFAULT_LOAD_DRIVES: usize = 2;
const MAX_LOAD_DRIVES: usize = 5;
const DEFAULT_LOAD_PERCENT: u8 = 80;
const MIN_LOAD_PERCENT: u8 = 50;
const MAX_LOAD_PERCENT: u8 = 95;
const LOAD_TEST_PRIORITY: u8 = 2;

/// Load above which a high-load run triggers a rebalance
const REBALANCE_LOAD_PERCENT: u8 = 85;

const DEFAULT_RANDOM_COUNT: usize = 5;
const MAX_RANDOM_COUNT: usize = 20;
const DEFAULT_MIN_SIZE_MB: u64 = 10_000;
const DEFAULT_MAX_SIZE_MB: u64 = 50_000;

/// Kind of simulated drive failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// Drive is gone
    Complete,
    Degraded,
    /// Drive is failing but still readable
    Partial,
}

impl FailureKind {
    pub fn target_status(&self) -> DriveStatus {
        match self {
            Self::Complete => DriveStatus::Failed,
            Self::Degraded => DriveStatus::Degraded,
            Self::Partial => DriveStatus::Failing,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Degraded => "degraded",
            Self::Partial => "partial",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureKind {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "complete" => Ok(Self::Complete),
            "degraded" => Ok(Self::Degraded),
            "partial" => Ok(Self::Partial),
            other => Err(FleetError::InvalidRequest(format!(
                "unknown failure kind '{}', expected complete, degraded or partial",
                other
            ))),
        }
    }
}

// =============================================================================
// OUTCOMES
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct DriveFailureOutcome {
    pub drive_id: String,
    pub kind: FailureKind,
    pub change: StatusChange,
    pub recovery_started: bool,
    pub redistribution: Option<RedistributionReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CorruptionOutcome {
    pub chunk: DataChunk,
    pub recovery_possible: bool,

    /// Healthy replica a recovery would read from
    pub replica: Option<Replica>,
}

/// One drive filled by a high-load run
#[derive(Debug, Clone, Serialize)]
pub struct LoadedDrive {
    pub drive_id: String,
    pub chunk_id: String,
    pub space_used_mb: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HighLoadOutcome {
    pub load_percent: u8,
    pub drives: Vec<LoadedDrive>,
    pub rebalance: Option<RebalanceReport>,
}

impl HighLoadOutcome {
    pub fn rebalancing_triggered(&self) -> bool {
        self.rebalance.is_some()
    }
}

/// Parameters for `generate_random_chunks`; absent fields take defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RandomChunkRequest {
    pub count: Option<usize>,
    pub min_size_mb: Option<u64>,
    pub max_size_mb: Option<u64>,
    pub priority: Option<u8>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RandomChunksOutcome {
    pub requested: usize,
    pub chunks: Vec<DataChunk>,
    pub replicated: usize,

    /// Set when no drive could take the next chunk
    pub stopped_early: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResetOutcome {
    pub chunks_deleted: usize,
    pub space_freed_mb: u64,
    pub drives_reset: usize,
}

// =============================================================================
// SIMULATOR
// =============================================================================

/// Fault and load simulator
pub struct Simulator<S> {
    catalog: FleetCatalog<S>,
    replication: ReplicationManager<S>,
    rebalancer: Rebalancer<S>,
    rng: Arc<Mutex<StdRng>>,
}

impl<S> Clone for Simulator<S> {
    fn clone(&self) -> Self {
        Self {
            catalog: self.catalog.clone(),
            replication: self.replication.clone(),
            rebalancer: self.rebalancer.clone(),
            rng: self.rng.clone(),
        }
    }
}

impl<S: RecordStore> Simulator<S> {
    pub fn new(
        catalog: FleetCatalog<S>,
        replication: ReplicationManager<S>,
        rebalancer: Rebalancer<S>,
    ) -> Self {
        Self {
            catalog,
            replication,
            rebalancer,
            rng: Arc::new(Mutex::new(StdRng::from_entropy())),
        }
    }

    /// Use a fixed seed for reproducible runs
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Arc::new(Mutex::new(StdRng::seed_from_u64(seed)));
        self
    }

    /// Rebalancer used after failures and high load; the RNG is kept
    pub fn with_rebalancer(mut self, rebalancer: Rebalancer<S>) -> Self {
        self.rebalancer = rebalancer;
        self
    }

    /// Put a drive into the failure state for `kind`
    ///
    /// FAILED and FAILING drives are drained right away.
    #[instrument(skip(self))]
    pub async fn simulate_drive_failure(
        &self,
        drive_id: &str,
        kind: FailureKind,
    ) -> Result<DriveFailureOutcome> {
        let target = kind.target_status();
        let already_failed = Arc::new(Mutex::new(false));
        let seen = already_failed.clone();

        let change = self
            .catalog
            .registry
            .transition(drive_id, move |current| {
                if current == DriveStatus::Failed {
                    *seen.lock() = true;
                    return None;
                }
                Some(target)
            })
            .await?;

        if *already_failed.lock() {
            return Err(FleetError::InvalidState(format!(
                "drive {} is already FAILED",
                drive_id
            )));
        }

        let recovery_started = target.is_failure();
        let redistribution = if recovery_started {
            let reason = format!("Simulated {} failure", kind);
            Some(
                self.rebalancer
                    .redistribute_from_failing_drive(drive_id, &reason)
                    .await?,
            )
        } else {
            None
        };

        info!(drive_id, %kind, recovery_started, "Drive failure simulated");
        Ok(DriveFailureOutcome {
            drive_id: drive_id.to_string(),
            kind,
            change,
            recovery_started,
            redistribution,
        })
    }

    /// Mark a chunk CORRUPTED
    #[instrument(skip(self))]
    pub async fn simulate_chunk_corruption(&self, chunk_id: &str) -> Result<CorruptionOutcome> {
        let chunk = self
            .catalog
            .store
            .update::<DataChunk, _>(chunk_id, |c| {
                if c.status == ChunkStatus::Corrupted {
                    return Err(FleetError::InvalidState(format!(
                        "chunk {} is already corrupted",
                        c.id
                    )));
                }
                c.status = ChunkStatus::Corrupted;
                c.updated_at = Utc::now();
                Ok(())
            })
            .await?;

        let mut replicas = self.catalog.chunks.replicas_of(chunk_id).await?;
        replicas.sort_by(|a, b| a.id.cmp(&b.id));
        let replica = replicas
            .into_iter()
            .find(|r| r.status == ReplicaStatus::Healthy);

        info!(chunk_id, recovery_possible = replica.is_some(), "Chunk corruption simulated");
        Ok(CorruptionOutcome {
            chunk,
            recovery_possible: replica.is_some(),
            replica,
        })
    }

    /// Fill the emptiest healthy primary drives up to `load_percent`
    #[instrument(skip(self))]
    pub async fn simulate_high_load(
        &self,
        drive_count: Option<usize>,
        load_percent: Option<u8>,
    ) -> Result<HighLoadOutcome> {
        let count = drive_count
            .unwrap_or(DEFAULT_LOAD_DRIVES)
            .clamp(1, MAX_LOAD_DRIVES);
        let load = load_percent
            .unwrap_or(DEFAULT_LOAD_PERCENT)
            .clamp(MIN_LOAD_PERCENT, MAX_LOAD_PERCENT);

        let mut drives: Vec<_> = self
            .catalog
            .registry
            .drives_with_status(&[DriveStatus::Healthy])
            .await?
            .into_iter()
            .filter(|d| !d.is_backup)
            .collect();
        drives.sort_by(|a, b| b.available_mb.cmp(&a.available_mb).then_with(|| a.id.cmp(&b.id)));
        drives.truncate(count);

        if drives.is_empty() {
            return Err(FleetError::InvalidRequest(
                "No suitable drives found for load simulation".into(),
            ));
        }

        let date = today();
        let mut loaded = Vec::new();

        for drive in drives {
            let space = drive.available_mb * load as u64 / 100;
            if space == 0 {
                continue;
            }

            let new = NewChunk::new(format!("{}-{}-{}", LOAD_TEST_PREFIX, date, drive.id), space)
                .with_priority(LOAD_TEST_PRIORITY)
                .on_drive(drive.id.clone())
                .without_replication();
            let placement = match self.replication.create_chunk(new).await {
                Ok(p) => p,
                Err(e) if e.is_insufficient_space() => {
                    warn!(drive_id = %drive.id, error = %e, "Drive filled concurrently, skipping");
                    continue;
                }
                Err(e) => return Err(e),
            };

            let metric = {
                let mut rng = self.rng.lock();
                NewMetric {
                    drive_id: drive.id.clone(),
                    cpu_usage: rng.gen_range(70.0..95.0_f64).floor(),
                    io_throughput: rng.gen_range(150.0..200.0_f64).floor(),
                    response_time_ms: rng.gen_range(15.0..25.0_f64).floor(),
                    error_rate: rng.gen_range(0.01..0.03),
                    temperature_c: rng.gen_range(50.0..60.0_f64).floor(),
                    utilization_percent: Some(load as f64),
                }
            };
            self.catalog.health.record_metric(metric).await?;

            loaded.push(LoadedDrive {
                drive_id: drive.id,
                chunk_id: placement.chunk.id,
                space_used_mb: space,
            });
        }

        let rebalance = if load > REBALANCE_LOAD_PERCENT {
            Some(self.rebalancer.trigger_rebalance().await?)
        } else {
            None
        };

        info!(
            load_percent = load,
            drives = loaded.len(),
            rebalanced = rebalance.is_some(),
            "High load simulated"
        );
        Ok(HighLoadOutcome {
            load_percent: load,
            drives: loaded,
            rebalance,
        })
    }

    /// Create randomly sized chunks, half of them with one replica
    #[instrument(skip(self))]
    pub async fn generate_random_chunks(&self, request: RandomChunkRequest) -> Result<RandomChunksOutcome> {
        let count = request
            .count
            .filter(|c| *c > 0)
            .unwrap_or(DEFAULT_RANDOM_COUNT)
            .min(MAX_RANDOM_COUNT);
        let min = request.min_size_mb.filter(|m| *m > 0).unwrap_or(DEFAULT_MIN_SIZE_MB);
        let max = request.max_size_mb.filter(|m| *m > 0).unwrap_or(DEFAULT_MAX_SIZE_MB);
        if max < min {
            return Err(FleetError::InvalidRequest(format!(
                "max size {} MB is below min size {} MB",
                max, min
            )));
        }
        let priority = request
            .priority
            .unwrap_or(chunkfleet_core::DEFAULT_CHUNK_PRIORITY)
            .clamp(MIN_CHUNK_PRIORITY, MAX_CHUNK_PRIORITY);

        let date = today();
        let mut outcome = RandomChunksOutcome {
            requested: count,
            chunks: Vec::new(),
            replicated: 0,
            stopped_early: false,
        };

        for i in 0..count {
            let (size, replicate) = {
                let mut rng = self.rng.lock();
                let size = if max > min { rng.gen_range(min..max) } else { min };
                (size, rng.gen_bool(0.5))
            };

            let new = NewChunk::new(format!("{}-{}-{}", RANDOM_DATA_PREFIX, i + 1, date), size)
                .with_priority(priority)
                .without_replication();
            let placement = match self.replication.create_chunk(new).await {
                Ok(p) => p,
                Err(FleetError::NoSuitableDrive { size_mb }) => {
                    warn!(size_mb, generated = outcome.chunks.len(), "No drive for next chunk, stopping");
                    outcome.stopped_early = true;
                    break;
                }
                Err(e) => return Err(e),
            };

            let mut chunk = placement.chunk;
            if replicate {
                let replicas = self.replication.add_replicas(&chunk, 1).await?;
                if !replicas.replicas.is_empty() {
                    outcome.replicated += 1;
                    chunk = self.catalog.chunks.get_chunk(&chunk.id).await?;
                }
            }
            outcome.chunks.push(chunk);
        }

        info!(
            requested = count,
            created = outcome.chunks.len(),
            replicated = outcome.replicated,
            "Random chunks generated"
        );
        Ok(outcome)
    }

    /// Remove generated chunks and return degraded drives to HEALTHY
    #[instrument(skip(self))]
    pub async fn reset_simulation(&self) -> Result<ResetOutcome> {
        let mut outcome = ResetOutcome::default();

        let chunks = self
            .catalog
            .chunks
            .chunks_named(&[LOAD_TEST_PREFIX, RANDOM_DATA_PREFIX])
            .await?;
        for chunk in chunks {
            match self.replication.delete_chunk(&chunk.id).await {
                Ok(freed) => {
                    outcome.chunks_deleted += 1;
                    outcome.space_freed_mb += freed;
                }
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }

        let drives = self
            .catalog
            .registry
            .drives_with_status(&[DriveStatus::Degraded, DriveStatus::Failing])
            .await?;
        for drive in drives {
            let change = self
                .catalog
                .registry
                .transition(&drive.id, |current| {
                    matches!(current, DriveStatus::Degraded | DriveStatus::Failing)
                        .then_some(DriveStatus::Healthy)
                })
                .await?;
            if change.changed() {
                outcome.drives_reset += 1;
            }
        }

        info!(
            chunks_deleted = outcome.chunks_deleted,
            space_freed_mb = outcome.space_freed_mb,
            drives_reset = outcome.drives_reset,
            "Simulation reset"
        );
        Ok(outcome)
    }
}

fn today() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::Detector;
    use crate::scorer::PlacementScorer;
    use chunkfleet_metadata::{Drive, NewDrive};
    use chunkfleet_storage::MemoryStore;

    struct Fixture {
        catalog: FleetCatalog<MemoryStore>,
        replication: ReplicationManager<MemoryStore>,
        simulator: Simulator<MemoryStore>,
    }

    fn fixture() -> Fixture {
        let catalog = FleetCatalog::new(Arc::new(MemoryStore::new()));
        let scorer = PlacementScorer::new(catalog.registry.clone());
        let replication = ReplicationManager::new(catalog.clone(), scorer.clone());
        let rebalancer = Rebalancer::new(
            catalog.clone(),
            scorer,
            replication.clone(),
            Detector::new(catalog.clone()),
        );
        let simulator = Simulator::new(catalog.clone(), replication.clone(), rebalancer).with_seed(7);
        Fixture {
            catalog,
            replication,
            simulator,
        }
    }

    async fn drive(f: &Fixture, name: &str, capacity: u64, backup: bool) -> Drive {
        let mut new = NewDrive::new(name, "dc1", capacity);
        if backup {
            new = new.backup();
        }
        f.catalog.registry.register_drive(new).await.unwrap()
    }

    #[test]
    fn test_failure_kind_parsing() {
        assert_eq!("Complete".parse::<FailureKind>().unwrap(), FailureKind::Complete);
        assert_eq!("partial".parse::<FailureKind>().unwrap().target_status(), DriveStatus::Failing);
        assert!("melted".parse::<FailureKind>().is_err());
    }

    #[tokio::test]
    async fn test_drive_failure_kinds() {
        let f = fixture();
        let a = drive(&f, "A", 1000, false).await;
        let b = drive(&f, "B", 1000, false).await;
        f.replication
            .create_chunk(NewChunk::new("c", 100).on_drive(&a.id).without_replication())
            .await
            .unwrap();

        let degraded = f
            .simulator
            .simulate_drive_failure(&b.id, FailureKind::Degraded)
            .await
            .unwrap();
        assert!(!degraded.recovery_started);
        assert_eq!(degraded.change.current, DriveStatus::Degraded);

        let failed = f
            .simulator
            .simulate_drive_failure(&a.id, FailureKind::Complete)
            .await
            .unwrap();
        assert!(failed.recovery_started);
        let report = failed.redistribution.unwrap();
        // B is DEGRADED, so nothing can take the chunk
        assert_eq!(report.stranded.len(), 1);

        let err = f
            .simulator
            .simulate_drive_failure(&a.id, FailureKind::Partial)
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_chunk_corruption() {
        let f = fixture();
        let a = drive(&f, "A", 1000, false).await;
        drive(&f, "R", 1000, true).await;
        let placed = f
            .replication
            .create_chunk(NewChunk::new("c", 100).on_drive(&a.id).without_replication())
            .await
            .unwrap();

        let outcome = f
            .simulator
            .simulate_chunk_corruption(&placed.chunk.id)
            .await
            .unwrap();
        assert_eq!(outcome.chunk.status, ChunkStatus::Corrupted);
        assert!(!outcome.recovery_possible);

        let err = f
            .simulator
            .simulate_chunk_corruption(&placed.chunk.id)
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::InvalidState(_)));

        let other = f
            .replication
            .create_chunk(NewChunk::new("d", 100).on_drive(&a.id).without_replication())
            .await
            .unwrap();
        f.replication
            .create_limited_replicas(&other.chunk.id, 1)
            .await
            .unwrap();
        let outcome = f
            .simulator
            .simulate_chunk_corruption(&other.chunk.id)
            .await
            .unwrap();
        assert!(outcome.recovery_possible);
        assert!(outcome.replica.is_some());
    }

    #[tokio::test]
    async fn test_high_load_fills_emptiest_drives() {
        let f = fixture();
        let big = drive(&f, "big", 10_000, false).await;
        let mid = drive(&f, "mid", 5_000, false).await;
        drive(&f, "small", 1_000, false).await;
        drive(&f, "backup", 50_000, true).await;

        let outcome = f.simulator.simulate_high_load(None, Some(120)).await.unwrap();
        assert_eq!(outcome.load_percent, 95);
        assert_eq!(outcome.drives.len(), 2);
        assert_eq!(outcome.drives[0].drive_id, big.id);
        assert_eq!(outcome.drives[0].space_used_mb, 9_500);
        assert_eq!(outcome.drives[1].drive_id, mid.id);
        assert!(outcome.rebalancing_triggered());

        let big_now = f.catalog.registry.get_drive(&big.id).await.unwrap();
        assert_eq!(big_now.available_mb, 500);
        assert_eq!(big_now.status, DriveStatus::Healthy);

        let metrics = f.catalog.health.recent_metrics(&big.id, 5).await.unwrap();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].utilization_percent, 95.0);
        assert!(metrics[0].cpu_usage >= 70.0 && metrics[0].cpu_usage < 95.0);

        let outcome = f.simulator.simulate_high_load(Some(1), None).await.unwrap();
        assert_eq!(outcome.load_percent, 80);
        assert!(!outcome.rebalancing_triggered());
    }

    #[tokio::test]
    async fn test_high_load_without_drives() {
        let f = fixture();
        drive(&f, "backup", 1_000, true).await;
        let err = f.simulator.simulate_high_load(None, None).await.unwrap_err();
        assert!(matches!(err, FleetError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_random_chunks_and_reset() {
        let f = fixture();
        let a = drive(&f, "A", 100_000, false).await;
        let r = drive(&f, "R", 100_000, true).await;

        let outcome = f
            .simulator
            .generate_random_chunks(RandomChunkRequest {
                count: Some(50),
                min_size_mb: Some(1_000),
                max_size_mb: Some(2_000),
                priority: Some(9),
            })
            .await
            .unwrap();
        assert_eq!(outcome.requested, 20);
        assert!(!outcome.stopped_early);
        assert_eq!(outcome.chunks.len(), 20);
        for chunk in &outcome.chunks {
            assert!(chunk.name.starts_with("RandomData-"));
            assert_eq!(chunk.priority, 5);
            assert!((1_000..2_000).contains(&chunk.size_mb));
        }

        let manual = f
            .replication
            .create_chunk(NewChunk::new("keep-me", 10).on_drive(&a.id).without_replication())
            .await
            .unwrap();
        f.catalog
            .registry
            .set_status(&r.id, DriveStatus::Degraded)
            .await
            .unwrap();

        let reset = f.simulator.reset_simulation().await.unwrap();
        assert_eq!(reset.chunks_deleted, 20);
        assert_eq!(reset.drives_reset, 1);

        assert_eq!(f.catalog.registry.get_drive(&a.id).await.unwrap().available_mb, 99_990);
        let r_now = f.catalog.registry.get_drive(&r.id).await.unwrap();
        assert_eq!(r_now.available_mb, 100_000);
        assert_eq!(r_now.status, DriveStatus::Healthy);

        let remaining = f.catalog.chunks.list_chunks().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, manual.chunk.id);
    }

    #[tokio::test]
    async fn test_random_chunks_stop_when_full() {
        let f = fixture();
        drive(&f, "A", 2_500, false).await;

        let outcome = f
            .simulator
            .generate_random_chunks(RandomChunkRequest {
                count: Some(5),
                min_size_mb: Some(1_000),
                max_size_mb: Some(1_000),
                priority: None,
            })
            .await
            .unwrap();
        assert_eq!(outcome.chunks.len(), 2);
        assert!(outcome.stopped_early);
        assert_eq!(outcome.chunks[0].priority, 3);
    }
}
