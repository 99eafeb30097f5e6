//! Chunk, replica and redistribution-log catalog
//!
//! Row-level operations on the chunk side of the fleet. Space accounting is
//! not done here; callers pair these with `DriveRegistry` reservations.

use crate::models::{
    validate_priority, ChunkStatus, ChunkUpdate, DataChunk, LogStatus, RedistributionLog, Replica,
    ReplicaStatus,
};
use chrono::Utc;
use chunkfleet_core::{EntityKind, FleetError, Result};
use chunkfleet_storage::{Query, RecordStore};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Chunk catalog
pub struct ChunkCatalog<S> {
    store: Arc<S>,
}

impl<S> Clone for ChunkCatalog<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: RecordStore> ChunkCatalog<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    // =========================================================================
    // CHUNKS
    // =========================================================================

    pub async fn find_chunk(&self, chunk_id: &str) -> Result<Option<DataChunk>> {
        self.store.get(chunk_id).await
    }

    pub async fn get_chunk(&self, chunk_id: &str) -> Result<DataChunk> {
        self.find_chunk(chunk_id)
            .await?
            .ok_or_else(|| FleetError::not_found(EntityKind::Chunk, chunk_id))
    }

    /// All chunks ordered by id
    pub async fn list_chunks(&self) -> Result<Vec<DataChunk>> {
        self.store.query(Query::<DataChunk>::all()).await
    }

    pub async fn chunks_with_status(&self, status: ChunkStatus) -> Result<Vec<DataChunk>> {
        self.store
            .query(Query::<DataChunk>::all().filter(move |c| c.status == status))
            .await
    }

    /// Chunks whose primary is the given drive
    pub async fn chunks_on_drive(&self, drive_id: &str) -> Result<Vec<DataChunk>> {
        let id = drive_id.to_string();
        self.store
            .query(Query::<DataChunk>::all().filter(move |c| c.drive_id == id))
            .await
    }

    /// Chunks whose name starts with any of the prefixes
    pub async fn chunks_named(&self, prefixes: &[&str]) -> Result<Vec<DataChunk>> {
        let prefixes: Vec<String> = prefixes.iter().map(|p| p.to_string()).collect();
        self.store
            .query(
                Query::<DataChunk>::all()
                    .filter(move |c| prefixes.iter().any(|p| c.name.starts_with(p.as_str()))),
            )
            .await
    }

    pub async fn insert_chunk(&self, chunk: DataChunk) -> Result<()> {
        self.store.insert(chunk).await
    }

    /// Set the chunk status unconditionally
    pub async fn set_status(&self, chunk_id: &str, status: ChunkStatus) -> Result<DataChunk> {
        self.store
            .update::<DataChunk, _>(chunk_id, move |c| {
                c.status = status;
                c.updated_at = Utc::now();
                Ok(())
            })
            .await
    }

    /// Edit name, priority, checksum or status
    ///
    /// REDISTRIBUTING belongs to an in-flight relocation: it cannot be set
    /// here, and a chunk in that state cannot be edited.
    pub async fn update_chunk(&self, chunk_id: &str, update: ChunkUpdate) -> Result<DataChunk> {
        if let Some(name) = &update.name {
            if name.trim().is_empty() {
                return Err(FleetError::InvalidRequest("chunk name cannot be empty".into()));
            }
        }
        if let Some(priority) = update.priority {
            validate_priority(priority)?;
        }
        if update.status == Some(ChunkStatus::Redistributing) {
            return Err(FleetError::InvalidRequest(
                "REDISTRIBUTING is set by relocation only".into(),
            ));
        }

        let chunk = self
            .store
            .update::<DataChunk, _>(chunk_id, move |c| {
                if c.status == ChunkStatus::Redistributing {
                    return Err(FleetError::InvalidState(format!(
                        "chunk {} is being relocated",
                        c.id
                    )));
                }
                if let Some(name) = &update.name {
                    c.name = name.trim().to_string();
                }
                if let Some(priority) = update.priority {
                    c.priority = priority;
                }
                if let Some(checksum) = &update.checksum {
                    c.checksum = Some(checksum.clone());
                }
                if let Some(status) = update.status {
                    c.status = status;
                }
                c.updated_at = Utc::now();
                Ok(())
            })
            .await?;

        debug!(chunk_id, status = %chunk.status, priority = chunk.priority, "Chunk updated");
        Ok(chunk)
    }

    /// Move the chunk from `expected` to `status`, failing if it is elsewhere
    pub async fn compare_and_set_status(
        &self,
        chunk_id: &str,
        expected: ChunkStatus,
        status: ChunkStatus,
    ) -> Result<DataChunk> {
        self.store
            .update::<DataChunk, _>(chunk_id, move |c| {
                if c.status != expected {
                    return Err(FleetError::InvalidState(format!(
                        "chunk {} is {}, expected {}",
                        c.id, c.status, expected
                    )));
                }
                c.status = status;
                c.updated_at = Utc::now();
                Ok(())
            })
            .await
    }

    /// Point the chunk at a new primary drive and mark it ACTIVE
    pub async fn move_chunk(&self, chunk_id: &str, from: &str, to: &str) -> Result<DataChunk> {
        let from = from.to_string();
        let to = to.to_string();
        self.store
            .update::<DataChunk, _>(chunk_id, move |c| {
                if c.drive_id != from {
                    return Err(FleetError::InvalidState(format!(
                        "chunk {} moved off {} concurrently",
                        c.id, from
                    )));
                }
                c.drive_id = to.clone();
                c.status = ChunkStatus::Active;
                c.updated_at = Utc::now();
                Ok(())
            })
            .await
    }

    pub async fn set_replicated(&self, chunk_id: &str, replicated: bool) -> Result<DataChunk> {
        self.store
            .update::<DataChunk, _>(chunk_id, move |c| {
                c.is_replicated = replicated;
                c.updated_at = Utc::now();
                Ok(())
            })
            .await
    }

    /// Recompute the replicated flag from the replica table
    pub async fn refresh_replicated_flag(&self, chunk_id: &str) -> Result<DataChunk> {
        let replicated = self.count_replicas(chunk_id).await? > 0;
        self.set_replicated(chunk_id, replicated).await
    }

    pub async fn delete_chunk_row(&self, chunk_id: &str) -> Result<DataChunk> {
        self.store.delete(chunk_id).await
    }

    // =========================================================================
    // REPLICAS
    // =========================================================================

    pub async fn replicas_of(&self, chunk_id: &str) -> Result<Vec<Replica>> {
        let id = chunk_id.to_string();
        self.store
            .query(Query::<Replica>::all().filter(move |r| r.chunk_id == id))
            .await
    }

    pub async fn count_replicas(&self, chunk_id: &str) -> Result<usize> {
        let id = chunk_id.to_string();
        self.store
            .count(Query::<Replica>::all().filter(move |r| r.chunk_id == id))
            .await
    }

    pub async fn replicas_on_drive(&self, drive_id: &str) -> Result<Vec<Replica>> {
        let id = drive_id.to_string();
        self.store
            .query(Query::<Replica>::all().filter(move |r| r.drive_id == id))
            .await
    }

    /// Every replica, for bulk counting
    pub async fn list_replicas(&self) -> Result<Vec<Replica>> {
        self.store.query(Query::<Replica>::all()).await
    }

    /// Primary drive plus every replica drive of the chunk
    pub async fn used_drives(&self, chunk: &DataChunk) -> Result<HashSet<String>> {
        let mut used: HashSet<String> = self
            .replicas_of(&chunk.id)
            .await?
            .into_iter()
            .map(|r| r.drive_id)
            .collect();
        used.insert(chunk.drive_id.clone());
        Ok(used)
    }

    pub async fn add_replica(&self, chunk_id: &str, drive_id: &str) -> Result<Replica> {
        let replica = Replica {
            id: EntityKind::Replica.new_id(),
            chunk_id: chunk_id.to_string(),
            drive_id: drive_id.to_string(),
            status: ReplicaStatus::Healthy,
            created_at: Utc::now(),
        };
        self.store.insert(replica.clone()).await?;
        debug!(chunk_id, drive_id, replica_id = %replica.id, "Replica recorded");
        Ok(replica)
    }

    pub async fn delete_replica(&self, replica_id: &str) -> Result<Replica> {
        self.store.delete(replica_id).await
    }

    pub async fn delete_replicas_of(&self, chunk_id: &str) -> Result<Vec<Replica>> {
        let id = chunk_id.to_string();
        self.store
            .delete_where(Query::<Replica>::all().filter(move |r| r.chunk_id == id))
            .await
    }

    // =========================================================================
    // REDISTRIBUTION LOGS
    // =========================================================================

    /// Append an IN_PROGRESS log
    pub async fn open_log(
        &self,
        chunk_id: &str,
        source_drive_id: &str,
        target_drive_id: Option<&str>,
        reason: &str,
    ) -> Result<RedistributionLog> {
        self.append_log(chunk_id, source_drive_id, target_drive_id, reason, LogStatus::InProgress)
            .await
    }

    /// Append a log that is already FAILED
    pub async fn record_failure(
        &self,
        chunk_id: &str,
        source_drive_id: &str,
        target_drive_id: Option<&str>,
        reason: &str,
    ) -> Result<RedistributionLog> {
        self.append_log(chunk_id, source_drive_id, target_drive_id, reason, LogStatus::Failed)
            .await
    }

    async fn append_log(
        &self,
        chunk_id: &str,
        source_drive_id: &str,
        target_drive_id: Option<&str>,
        reason: &str,
        status: LogStatus,
    ) -> Result<RedistributionLog> {
        let now = Utc::now();
        let log = RedistributionLog {
            id: EntityKind::RedistributionLog.new_id(),
            chunk_id: chunk_id.to_string(),
            source_drive_id: source_drive_id.to_string(),
            target_drive_id: target_drive_id.map(str::to_string),
            reason: reason.to_string(),
            status,
            started_at: now,
            completed_at: (status != LogStatus::InProgress).then_some(now),
        };
        self.store.insert(log.clone()).await?;
        Ok(log)
    }

    pub async fn complete_log(&self, log_id: &str) -> Result<RedistributionLog> {
        self.finish_log(log_id, LogStatus::Completed).await
    }

    pub async fn fail_log(&self, log_id: &str) -> Result<RedistributionLog> {
        self.finish_log(log_id, LogStatus::Failed).await
    }

    async fn finish_log(&self, log_id: &str, status: LogStatus) -> Result<RedistributionLog> {
        self.store
            .update::<RedistributionLog, _>(log_id, move |l| {
                if l.status != LogStatus::InProgress {
                    return Err(FleetError::InvalidState(format!(
                        "redistribution log {} is already {}",
                        l.id, l.status
                    )));
                }
                l.status = status;
                l.completed_at = Some(Utc::now());
                Ok(())
            })
            .await
    }

    pub async fn logs_for_chunk(&self, chunk_id: &str) -> Result<Vec<RedistributionLog>> {
        let id = chunk_id.to_string();
        self.store
            .query(
                Query::<RedistributionLog>::all()
                    .filter(move |l| l.chunk_id == id)
                    .order_by(|a, b| a.started_at.cmp(&b.started_at)),
            )
            .await
    }

    /// All logs, newest first
    pub async fn list_logs(&self) -> Result<Vec<RedistributionLog>> {
        self.store
            .query(Query::<RedistributionLog>::all().order_by(|a, b| b.started_at.cmp(&a.started_at)))
            .await
    }

    pub async fn delete_logs_of(&self, chunk_id: &str) -> Result<Vec<RedistributionLog>> {
        let id = chunk_id.to_string();
        self.store
            .delete_where(Query::<RedistributionLog>::all().filter(move |l| l.chunk_id == id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkfleet_storage::MemoryStore;

    fn chunk(id: &str, drive: &str) -> DataChunk {
        let now = Utc::now();
        DataChunk {
            id: id.into(),
            name: format!("chunk-{}", id),
            size_mb: 10,
            drive_id: drive.into(),
            priority: 3,
            is_replicated: false,
            checksum: None,
            status: ChunkStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_replicated_flag_follows_replicas() {
        let catalog = ChunkCatalog::new(Arc::new(MemoryStore::new()));
        catalog.insert_chunk(chunk("CHUNK-1", "D1")).await.unwrap();

        let replica = catalog.add_replica("CHUNK-1", "D2").await.unwrap();
        assert!(catalog.refresh_replicated_flag("CHUNK-1").await.unwrap().is_replicated);

        let used = catalog
            .used_drives(&catalog.get_chunk("CHUNK-1").await.unwrap())
            .await
            .unwrap();
        assert!(used.contains("D1") && used.contains("D2"));

        catalog.delete_replica(&replica.id).await.unwrap();
        assert!(!catalog.refresh_replicated_flag("CHUNK-1").await.unwrap().is_replicated);
    }

    #[tokio::test]
    async fn test_compare_and_set_status() {
        let catalog = ChunkCatalog::new(Arc::new(MemoryStore::new()));
        catalog.insert_chunk(chunk("CHUNK-1", "D1")).await.unwrap();

        catalog
            .compare_and_set_status("CHUNK-1", ChunkStatus::Active, ChunkStatus::Redistributing)
            .await
            .unwrap();
        let err = catalog
            .compare_and_set_status("CHUNK-1", ChunkStatus::Active, ChunkStatus::Redistributing)
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_move_chunk_checks_source() {
        let catalog = ChunkCatalog::new(Arc::new(MemoryStore::new()));
        catalog.insert_chunk(chunk("CHUNK-1", "D1")).await.unwrap();

        assert!(catalog.move_chunk("CHUNK-1", "D9", "D2").await.is_err());
        let moved = catalog.move_chunk("CHUNK-1", "D1", "D2").await.unwrap();
        assert_eq!(moved.drive_id, "D2");
    }

    #[tokio::test]
    async fn test_log_lifecycle() {
        let catalog = ChunkCatalog::new(Arc::new(MemoryStore::new()));
        let log = catalog
            .open_log("CHUNK-1", "D1", Some("D2"), "Manual relocation")
            .await
            .unwrap();
        assert_eq!(log.status, LogStatus::InProgress);
        assert!(log.completed_at.is_none());

        let done = catalog.complete_log(&log.id).await.unwrap();
        assert_eq!(done.status, LogStatus::Completed);
        assert!(done.completed_at.is_some());

        // Terminal logs stay terminal
        assert!(catalog.fail_log(&log.id).await.is_err());

        let failed = catalog
            .record_failure("CHUNK-1", "D1", None, "No target")
            .await
            .unwrap();
        assert_eq!(failed.status, LogStatus::Failed);
        assert_eq!(catalog.logs_for_chunk("CHUNK-1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_update_chunk() {
        let catalog = ChunkCatalog::new(Arc::new(MemoryStore::new()));
        catalog.insert_chunk(chunk("CHUNK-1", "D1")).await.unwrap();

        let updated = catalog
            .update_chunk(
                "CHUNK-1",
                ChunkUpdate {
                    name: Some(" renamed ".into()),
                    priority: Some(5),
                    checksum: Some("abc".into()),
                    status: Some(ChunkStatus::Corrupted),
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.name, "renamed");
        assert_eq!(updated.priority, 5);
        assert_eq!(updated.checksum.as_deref(), Some("abc"));
        assert_eq!(updated.status, ChunkStatus::Corrupted);
        assert_eq!(updated.drive_id, "D1");
        assert_eq!(updated.size_mb, 10);

        // Fields left out stay as they were
        let updated = catalog
            .update_chunk("CHUNK-1", ChunkUpdate { priority: Some(1), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(updated.name, "renamed");
        assert_eq!(updated.status, ChunkStatus::Corrupted);
    }

    #[tokio::test]
    async fn test_update_chunk_validation() {
        let catalog = ChunkCatalog::new(Arc::new(MemoryStore::new()));
        catalog.insert_chunk(chunk("CHUNK-1", "D1")).await.unwrap();

        for update in [
            ChunkUpdate { priority: Some(0), ..Default::default() },
            ChunkUpdate { priority: Some(6), ..Default::default() },
            ChunkUpdate { name: Some("  ".into()), ..Default::default() },
            ChunkUpdate { status: Some(ChunkStatus::Redistributing), ..Default::default() },
        ] {
            assert!(matches!(
                catalog.update_chunk("CHUNK-1", update).await,
                Err(FleetError::InvalidRequest(_))
            ));
        }
        assert_eq!(catalog.get_chunk("CHUNK-1").await.unwrap().priority, 3);

        catalog
            .set_status("CHUNK-1", ChunkStatus::Redistributing)
            .await
            .unwrap();
        assert!(matches!(
            catalog
                .update_chunk("CHUNK-1", ChunkUpdate { priority: Some(4), ..Default::default() })
                .await,
            Err(FleetError::InvalidState(_))
        ));

        assert!(catalog
            .update_chunk("CHUNK-404", ChunkUpdate::default())
            .await
            .unwrap_err()
            .is_not_found());
    }
}
