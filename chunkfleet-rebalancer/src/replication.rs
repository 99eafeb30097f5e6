//! Replication manager
//!
//! Creates chunks with their replicas and deletes them again, keeping drive
//! space in step with every row it writes or removes.

use crate::metrics;
use crate::scorer::PlacementScorer;
use chrono::Utc;
use chunkfleet_core::{EntityKind, FleetError, Result};
use chunkfleet_metadata::{
    validate_priority, ChunkStatus, DataChunk, Drive, FleetCatalog, NewChunk, Replica,
};
use chunkfleet_storage::RecordStore;
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, info, instrument, warn};

/// Non-fatal condition attached to a placement
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum ReplicationWarning {
    /// Fewer eligible backup drives than the policy requires
    InsufficientBackupDrives { available: usize, required: u32 },
}

impl ReplicationWarning {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InsufficientBackupDrives { .. } => "insufficient_backup_drives",
        }
    }
}

impl std::fmt::Display for ReplicationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InsufficientBackupDrives {
                available,
                required,
            } => write!(
                f,
                "{}: {} backup drives available, {} required",
                self.code(),
                available,
                required
            ),
        }
    }
}

/// Result of creating a chunk
#[derive(Debug, Clone, Serialize)]
pub struct ChunkPlacement {
    pub chunk: DataChunk,
    pub replicas: Vec<Replica>,
    pub warning: Option<ReplicationWarning>,
}

/// Result of a bounded replica request
#[derive(Debug, Clone, Serialize)]
pub struct LimitedReplicas {
    pub chunk_id: String,
    pub requested: u32,
    pub created: usize,
    pub replicas: Vec<Replica>,
}

/// Replicas placed by one `add_replicas` call
#[derive(Debug, Clone, Default)]
pub struct ReplicaOutcome {
    pub replicas: Vec<Replica>,

    /// Replicas asked for but not placed
    pub shortfall: usize,
}

/// Replication manager
pub struct ReplicationManager<S> {
    catalog: FleetCatalog<S>,
    scorer: PlacementScorer<S>,
}

impl<S> Clone for ReplicationManager<S> {
    fn clone(&self) -> Self {
        Self {
            catalog: self.catalog.clone(),
            scorer: self.scorer.clone(),
        }
    }
}

impl<S: RecordStore> ReplicationManager<S> {
    pub fn new(catalog: FleetCatalog<S>, scorer: PlacementScorer<S>) -> Self {
        Self { catalog, scorer }
    }

    /// Place a new chunk and, if requested, its replicas
    #[instrument(skip(self, new), fields(name = %new.name, size_mb = new.size_mb))]
    pub async fn create_chunk(&self, new: NewChunk) -> Result<ChunkPlacement> {
        validate_new_chunk(&new)?;
        let size = new.size_mb;

        let primary = self.reserve_primary(&new).await?;

        let now = Utc::now();
        let chunk = DataChunk {
            id: EntityKind::Chunk.new_id(),
            name: new.name.clone(),
            size_mb: size as i64,
            drive_id: primary.id.clone(),
            priority: new.effective_priority(),
            is_replicated: false,
            checksum: new.checksum.clone(),
            status: ChunkStatus::Active,
            created_at: now,
            updated_at: now,
        };

        if let Err(e) = self.catalog.chunks.insert_chunk(chunk.clone()).await {
            self.release_quietly(&primary.id, size).await;
            return Err(e);
        }
        info!(chunk_id = %chunk.id, drive_id = %primary.id, "Chunk placed");

        if !new.replicate {
            metrics::record_chunk_created(false);
            return Ok(ChunkPlacement {
                chunk,
                replicas: Vec::new(),
                warning: None,
            });
        }

        let required = self.catalog.policies.active_min_replicas().await?;
        let exclude: HashSet<String> = [primary.id.clone()].into();
        let available = self.scorer.count_replica_candidates(size, &exclude).await?;

        if available < required as usize {
            warn!(
                chunk_id = %chunk.id,
                available,
                required,
                "Not enough backup drives, chunk left unreplicated"
            );
            metrics::record_chunk_created(false);
            return Ok(ChunkPlacement {
                chunk,
                replicas: Vec::new(),
                warning: Some(ReplicationWarning::InsufficientBackupDrives {
                    available,
                    required,
                }),
            });
        }

        let outcome = self.add_replicas(&chunk, required as usize).await?;

        // Candidates can vanish between the count and the reservations
        let warning = (outcome.shortfall > 0).then(|| ReplicationWarning::InsufficientBackupDrives {
            available: outcome.replicas.len(),
            required,
        });

        let chunk = self.catalog.chunks.get_chunk(&chunk.id).await?;
        metrics::record_chunk_created(chunk.is_replicated);
        Ok(ChunkPlacement {
            chunk,
            replicas: outcome.replicas,
            warning,
        })
    }

    /// Add up to `requested` replicas, as many as eligible drives allow
    #[instrument(skip(self))]
    pub async fn create_limited_replicas(&self, chunk_id: &str, requested: u32) -> Result<LimitedReplicas> {
        if requested < 1 {
            return Err(FleetError::InvalidRequest(
                "requested replicas must be at least 1".into(),
            ));
        }

        let chunk = self.catalog.chunks.get_chunk(chunk_id).await?;
        let outcome = self.add_replicas(&chunk, requested as usize).await?;

        info!(
            chunk_id,
            requested,
            created = outcome.replicas.len(),
            "Limited replicas created"
        );
        Ok(LimitedReplicas {
            chunk_id: chunk.id,
            requested,
            created: outcome.replicas.len(),
            replicas: outcome.replicas,
        })
    }

    /// Place up to `count` replicas on distinct unused backup drives
    ///
    /// Takes the top-ranked picks from the scorer and, when a reservation
    /// loses a race, asks again with every tried drive excluded. Sets the
    /// replicated flag once at least one replica exists.
    pub async fn add_replicas(&self, chunk: &DataChunk, count: usize) -> Result<ReplicaOutcome> {
        let size = chunk.size()?;
        if count == 0 {
            return Ok(ReplicaOutcome::default());
        }

        let mut tried = self.catalog.chunks.used_drives(chunk).await?;
        let mut placed = Vec::new();
        let mut failure = None;

        'rounds: while placed.len() < count {
            let picks = self
                .scorer
                .select_replica_drives(size, &tried, count - placed.len())
                .await?;
            if picks.is_empty() {
                break;
            }

            for candidate in picks {
                tried.insert(candidate.id.clone());

                match self.catalog.registry.reserve_space(&candidate.id, size).await {
                    Ok(_) => {}
                    Err(e) if e.is_insufficient_space() || e.is_not_found() => {
                        debug!(drive_id = %candidate.id, error = %e, "Candidate lost, trying next");
                        continue;
                    }
                    Err(e) => {
                        failure = Some(e);
                        break 'rounds;
                    }
                }

                match self.catalog.chunks.add_replica(&chunk.id, &candidate.id).await {
                    Ok(replica) => placed.push(replica),
                    Err(e) => {
                        self.release_quietly(&candidate.id, size).await;
                        failure = Some(e);
                        break 'rounds;
                    }
                }
            }
        }

        if !placed.is_empty() {
            self.catalog.chunks.set_replicated(&chunk.id, true).await?;
        }
        metrics::record_replicas_placed(placed.len());

        if let Some(e) = failure {
            return Err(e);
        }

        let shortfall = count - placed.len();
        metrics::record_replica_shortfall(shortfall);
        Ok(ReplicaOutcome {
            replicas: placed,
            shortfall,
        })
    }

    /// Delete a chunk with its replicas and logs; returns the chunk size freed
    #[instrument(skip(self))]
    pub async fn delete_chunk(&self, chunk_id: &str) -> Result<u64> {
        let chunk = self.catalog.chunks.get_chunk(chunk_id).await?;
        let size = chunk.size()?;

        self.catalog.chunks.delete_logs_of(chunk_id).await?;

        let replicas = self.catalog.chunks.delete_replicas_of(chunk_id).await?;
        for replica in &replicas {
            self.release_or_warn(&replica.drive_id, size).await?;
        }

        self.catalog.chunks.delete_chunk_row(chunk_id).await?;
        self.release_or_warn(&chunk.drive_id, size).await?;

        metrics::record_chunk_deleted();
        info!(
            chunk_id,
            size_mb = size,
            replicas = replicas.len(),
            "Chunk deleted"
        );
        Ok(size)
    }

    async fn reserve_primary(&self, new: &NewChunk) -> Result<Drive> {
        let size = new.size_mb;

        if let Some(drive_id) = &new.drive_id {
            let drive = self.catalog.registry.get_drive(drive_id).await?;
            if drive.status.is_failure() {
                return Err(FleetError::InvalidState(format!(
                    "drive {} is {} and cannot take new chunks",
                    drive.id, drive.status
                )));
            }
            return self.catalog.registry.reserve_space(&drive.id, size).await;
        }

        let candidates = self.scorer.primary_candidates(size, &HashSet::new()).await?;
        for candidate in candidates {
            match self.catalog.registry.reserve_space(&candidate.id, size).await {
                Ok(drive) => return Ok(drive),
                Err(e) if e.is_insufficient_space() || e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(FleetError::NoSuitableDrive { size_mb: size })
    }

    async fn release_or_warn(&self, drive_id: &str, size: u64) -> Result<()> {
        match self.catalog.registry.release_space(drive_id, size).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                warn!(drive_id, "Drive gone, nothing to release");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn release_quietly(&self, drive_id: &str, size: u64) {
        if let Err(e) = self.catalog.registry.release_space(drive_id, size).await {
            warn!(drive_id, size_mb = size, error = %e, "Failed to release reservation");
        }
    }
}

fn validate_new_chunk(new: &NewChunk) -> Result<()> {
    if new.name.trim().is_empty() {
        return Err(FleetError::InvalidRequest("chunk name is required".into()));
    }
    if new.size_mb == 0 {
        return Err(FleetError::InvalidRequest(
            "chunk size must be a positive number".into(),
        ));
    }
    if new.size_mb > i64::MAX as u64 {
        return Err(FleetError::InvalidRequest("chunk size is too large".into()));
    }
    validate_priority(new.effective_priority())
}
