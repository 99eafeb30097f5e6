//! Drive registry
//!
//! Owns the drive table:
//! - Eligibility queries ranked by utilization
//! - Atomic space reservation and release
//! - Drive administration (register, update, status, delete with cascade)

use crate::models::{
    DataChunk, Drive, DriveMetric, DriveStatus, DriveUpdate, NewDrive, RedistributionLog, Replica,
};
use chrono::Utc;
use chunkfleet_core::{DependencyCounts, EntityKind, FleetError, Result};
use chunkfleet_storage::{Query, RecordStore};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Ranking used everywhere a drive is chosen: least utilized first
pub fn compare_utilization(a: &Drive, b: &Drive) -> Ordering {
    a.utilization()
        .partial_cmp(&b.utilization())
        .unwrap_or(Ordering::Equal)
}

/// Filter for eligible drive queries
#[derive(Debug, Clone)]
pub struct DriveFilter {
    /// Required value of the backup flag (`None` = either)
    pub backup: Option<bool>,

    /// Drives that must not be returned
    pub exclude: HashSet<String>,

    /// Only HEALTHY drives
    pub healthy_only: bool,
}

impl Default for DriveFilter {
    fn default() -> Self {
        Self {
            backup: None,
            exclude: HashSet::new(),
            healthy_only: true,
        }
    }
}

impl DriveFilter {
    /// Non-backup drives (primary placement)
    pub fn primary() -> Self {
        Self {
            backup: Some(false),
            ..Default::default()
        }
    }

    /// Backup drives (replica placement)
    pub fn backup() -> Self {
        Self {
            backup: Some(true),
            ..Default::default()
        }
    }

    pub fn excluding<I, T>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.exclude.extend(ids.into_iter().map(Into::into));
        self
    }
}

/// Result of a status change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusChange {
    pub previous: DriveStatus,
    pub current: DriveStatus,
}

impl StatusChange {
    pub fn changed(&self) -> bool {
        self.previous != self.current
    }
}

/// Result of a drive deletion
#[derive(Debug, Clone, Serialize)]
pub struct DriveDeletion {
    pub drive: Drive,

    /// Rows removed along with the drive
    pub removed: DependencyCounts,
}

/// Drive registry
pub struct DriveRegistry<S> {
    store: Arc<S>,
}

impl<S> Clone for DriveRegistry<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: RecordStore> DriveRegistry<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    // =========================================================================
    // PLACEMENT QUERIES
    // =========================================================================

    /// Drives able to take `size_mb`, least utilized first (ties by id)
    pub async fn list_eligible_drives(&self, size_mb: u64, filter: &DriveFilter) -> Result<Vec<Drive>> {
        let backup = filter.backup;
        let healthy_only = filter.healthy_only;

        let query = Query::<Drive>::all()
            .filter(move |d| {
                (!healthy_only || d.status == DriveStatus::Healthy)
                    && backup.map_or(true, |b| d.is_backup == b)
                    && d.available_mb >= size_mb
            })
            .exclude_ids(filter.exclude.iter().cloned())
            .order_by(compare_utilization);

        self.store.query(query).await
    }

    /// Count drives able to take `size_mb`
    pub async fn count_eligible_drives(&self, size_mb: u64, filter: &DriveFilter) -> Result<usize> {
        Ok(self.list_eligible_drives(size_mb, filter).await?.len())
    }

    /// Atomically take `mb` from the drive's available space
    #[instrument(skip(self))]
    pub async fn reserve_space(&self, drive_id: &str, mb: u64) -> Result<Drive> {
        let id = drive_id.to_string();
        let drive = self
            .store
            .update::<Drive, _>(drive_id, move |d| {
                if mb > d.available_mb {
                    return Err(FleetError::InsufficientSpace {
                        drive_id: id.clone(),
                        requested_mb: mb,
                        available_mb: d.available_mb,
                    });
                }
                d.available_mb -= mb;
                d.updated_at = Utc::now();
                Ok(())
            })
            .await?;

        debug!(drive_id, mb, available_mb = drive.available_mb, "Reserved space");
        Ok(drive)
    }

    /// Atomically return `mb` to the drive, capped at capacity
    #[instrument(skip(self))]
    pub async fn release_space(&self, drive_id: &str, mb: u64) -> Result<Drive> {
        let drive = self
            .store
            .update::<Drive, _>(drive_id, move |d| {
                d.available_mb = d.available_mb.saturating_add(mb).min(d.capacity_mb);
                d.updated_at = Utc::now();
                Ok(())
            })
            .await?;

        debug!(drive_id, mb, available_mb = drive.available_mb, "Released space");
        Ok(drive)
    }

    // =========================================================================
    // ADMINISTRATION
    // =========================================================================

    /// Register a new drive
    pub async fn register_drive(&self, new: NewDrive) -> Result<Drive> {
        let now = Utc::now();
        let drive = Drive {
            id: EntityKind::Drive.new_id(),
            name: new.name,
            location: new.location,
            capacity_mb: new.capacity_mb,
            available_mb: new.available_mb.unwrap_or(new.capacity_mb),
            status: new.status,
            drive_type: new.drive_type,
            is_backup: new.is_backup,
            created_at: now,
            updated_at: now,
        };
        validate_drive(&drive)?;

        self.store.insert(drive.clone()).await?;
        info!(
            drive_id = %drive.id,
            name = %drive.name,
            capacity_mb = drive.capacity_mb,
            is_backup = drive.is_backup,
            "Drive registered"
        );
        Ok(drive)
    }

    /// Apply a partial update; the merged drive must stay valid
    pub async fn update_drive(&self, drive_id: &str, update: DriveUpdate) -> Result<Drive> {
        let drive = self
            .store
            .update::<Drive, _>(drive_id, move |d| {
                if let Some(name) = &update.name {
                    d.name = name.clone();
                }
                if let Some(location) = &update.location {
                    d.location = location.clone();
                }
                if let Some(capacity) = update.capacity_mb {
                    d.capacity_mb = capacity;
                }
                if let Some(available) = update.available_mb {
                    d.available_mb = available;
                }
                if let Some(status) = update.status {
                    d.status = status;
                }
                if let Some(drive_type) = update.drive_type {
                    d.drive_type = drive_type;
                }
                if let Some(is_backup) = update.is_backup {
                    d.is_backup = is_backup;
                }
                d.updated_at = Utc::now();
                validate_drive(d)
            })
            .await?;

        info!(drive_id, "Drive updated");
        Ok(drive)
    }

    pub async fn find_drive(&self, drive_id: &str) -> Result<Option<Drive>> {
        self.store.get(drive_id).await
    }

    pub async fn get_drive(&self, drive_id: &str) -> Result<Drive> {
        self.find_drive(drive_id)
            .await?
            .ok_or_else(|| FleetError::not_found(EntityKind::Drive, drive_id))
    }

    /// All drives ordered by name
    pub async fn list_drives(&self) -> Result<Vec<Drive>> {
        self.store
            .query(Query::<Drive>::all().order_by(|a, b| a.name.cmp(&b.name)))
            .await
    }

    /// Drives currently in one of the given states
    pub async fn drives_with_status(&self, statuses: &[DriveStatus]) -> Result<Vec<Drive>> {
        let statuses = statuses.to_vec();
        self.store
            .query(Query::<Drive>::all().filter(move |d| statuses.contains(&d.status)))
            .await
    }

    /// Set the drive status unconditionally
    #[instrument(skip(self))]
    pub async fn set_status(&self, drive_id: &str, status: DriveStatus) -> Result<StatusChange> {
        self.transition(drive_id, move |_| Some(status)).await
    }

    /// Atomically move the drive to the state chosen by `decide`
    ///
    /// `decide` sees the stored status; returning `None` leaves it as is.
    pub async fn transition<F>(&self, drive_id: &str, decide: F) -> Result<StatusChange>
    where
        F: Fn(DriveStatus) -> Option<DriveStatus> + Send + Sync + 'static,
    {
        let previous = Arc::new(parking_lot::Mutex::new(None));
        let seen = previous.clone();

        let drive = self
            .store
            .update::<Drive, _>(drive_id, move |d| {
                *seen.lock() = Some(d.status);
                if let Some(next) = decide(d.status) {
                    if next != d.status {
                        d.status = next;
                        d.updated_at = Utc::now();
                    }
                }
                Ok(())
            })
            .await?;

        let previous = (*previous.lock()).unwrap_or(drive.status);
        let change = StatusChange {
            previous,
            current: drive.status,
        };
        if change.changed() {
            info!(
                drive_id,
                previous = %change.previous,
                current = %change.current,
                "Drive status changed"
            );
        }
        Ok(change)
    }

    /// Rows that still reference the drive
    pub async fn dependencies(&self, drive_id: &str) -> Result<DependencyCounts> {
        self.get_drive(drive_id).await?;

        let id = drive_id.to_string();
        let chunks = {
            let id = id.clone();
            self.store
                .count(Query::<DataChunk>::all().filter(move |c| c.drive_id == id))
                .await?
        };
        let replicas = {
            let id = id.clone();
            self.store
                .count(Query::<Replica>::all().filter(move |r| r.drive_id == id))
                .await?
        };
        let metrics = {
            let id = id.clone();
            self.store
                .count(Query::<DriveMetric>::all().filter(move |m| m.drive_id == id))
                .await?
        };
        let logs = self
            .store
            .count(Query::<RedistributionLog>::all().filter(move |l| l.touches(&id)))
            .await?;

        Ok(DependencyCounts {
            chunks,
            replicas,
            metrics,
            logs,
        })
    }

    /// Delete a drive
    ///
    /// Refuses with `DependencyConflict` while anything references the drive,
    /// unless `force` is set, in which case dependent rows are removed first.
    #[instrument(skip(self))]
    pub async fn delete_drive(&self, drive_id: &str, force: bool) -> Result<DriveDeletion> {
        let dependencies = self.dependencies(drive_id).await?;
        if dependencies.has_any() && !force {
            return Err(FleetError::DependencyConflict {
                drive_id: drive_id.to_string(),
                dependencies,
            });
        }

        let mut removed = DependencyCounts::default();
        if dependencies.has_any() {
            removed = self.cascade(drive_id).await?;
        }

        let drive: Drive = self.store.delete(drive_id).await?;
        info!(
            drive_id,
            force,
            chunks = removed.chunks,
            replicas = removed.replicas,
            "Drive deleted"
        );
        Ok(DriveDeletion { drive, removed })
    }

    async fn cascade(&self, drive_id: &str) -> Result<DependencyCounts> {
        let mut removed = DependencyCounts::default();
        let id = drive_id.to_string();

        // Chunks whose primary is this drive go with it, along with their
        // replicas and logs
        let chunks = {
            let id = id.clone();
            self.store
                .delete_where(Query::<DataChunk>::all().filter(move |c| c.drive_id == id))
                .await?
        };
        for chunk in &chunks {
            let chunk_id = chunk.id.clone();
            let replicas = self
                .store
                .delete_where(Query::<Replica>::all().filter(move |r| r.chunk_id == chunk_id))
                .await?;

            match chunk.size() {
                Ok(size) => {
                    for replica in replicas.iter().filter(|r| r.drive_id != drive_id) {
                        self.release_space(&replica.drive_id, size).await?;
                    }
                }
                Err(e) => warn!(chunk_id = %chunk.id, error = %e, "Skipping replica space release"),
            }
            removed.replicas += replicas.len();

            let chunk_id = chunk.id.clone();
            removed.logs += self
                .store
                .delete_where(
                    Query::<RedistributionLog>::all().filter(move |l| l.chunk_id == chunk_id),
                )
                .await?
                .len();
        }
        removed.chunks = chunks.len();

        // Replicas hosted here belong to chunks that live on
        let hosted = {
            let id = id.clone();
            self.store
                .delete_where(Query::<Replica>::all().filter(move |r| r.drive_id == id))
                .await?
        };
        removed.replicas += hosted.len();

        let affected: HashSet<String> = hosted.into_iter().map(|r| r.chunk_id).collect();
        for chunk_id in affected {
            let lookup = chunk_id.clone();
            let remaining = self
                .store
                .count(Query::<Replica>::all().filter(move |r| r.chunk_id == lookup))
                .await?;
            match self
                .store
                .update::<DataChunk, _>(&chunk_id, move |c| {
                    c.is_replicated = remaining > 0;
                    c.updated_at = Utc::now();
                    Ok(())
                })
                .await
            {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        removed.metrics = {
            let id = id.clone();
            self.store
                .delete_where(Query::<DriveMetric>::all().filter(move |m| m.drive_id == id))
                .await?
                .len()
        };
        removed.logs += self
            .store
            .delete_where(Query::<RedistributionLog>::all().filter(move |l| l.touches(&id)))
            .await?
            .len();

        Ok(removed)
    }
}

fn validate_drive(drive: &Drive) -> Result<()> {
    if drive.name.trim().is_empty() {
        return Err(FleetError::InvalidRequest("drive name is required".into()));
    }
    if drive.location.trim().is_empty() {
        return Err(FleetError::InvalidRequest("drive location is required".into()));
    }
    if drive.capacity_mb == 0 {
        return Err(FleetError::InvalidRequest(
            "capacity must be a positive number".into(),
        ));
    }
    if drive.available_mb > drive.capacity_mb {
        return Err(FleetError::InvalidRequest(format!(
            "available space ({} MB) cannot exceed capacity ({} MB)",
            drive.available_mb, drive.capacity_mb
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChunkStatus, ReplicaStatus};
    use chunkfleet_storage::MemoryStore;

    fn registry() -> DriveRegistry<MemoryStore> {
        DriveRegistry::new(Arc::new(MemoryStore::new()))
    }

    async fn add(registry: &DriveRegistry<MemoryStore>, name: &str, capacity: u64, available: u64) -> Drive {
        registry
            .register_drive(NewDrive::new(name, "rack-a", capacity).with_available(available))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_eligible_drives_ranked_by_utilization() {
        let registry = registry();
        add(&registry, "a", 1000, 200).await; // 80%
        let b = add(&registry, "b", 1000, 800).await; // 20%
        add(&registry, "c", 1000, 500).await; // 50%

        let drives = registry
            .list_eligible_drives(100, &DriveFilter::primary())
            .await
            .unwrap();
        let names: Vec<_> = drives.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["b", "c", "a"]);

        let drives = registry
            .list_eligible_drives(100, &DriveFilter::primary().excluding([b.id.clone()]))
            .await
            .unwrap();
        assert_eq!(drives[0].name, "c");

        // Too big for "a"
        let drives = registry
            .list_eligible_drives(300, &DriveFilter::primary())
            .await
            .unwrap();
        assert_eq!(drives.len(), 2);
    }

    #[tokio::test]
    async fn test_eligible_drives_skip_unhealthy_and_backup() {
        let registry = registry();
        let sick = add(&registry, "sick", 1000, 1000).await;
        registry.set_status(&sick.id, DriveStatus::Degraded).await.unwrap();
        registry
            .register_drive(NewDrive::new("spare", "rack-b", 1000).backup())
            .await
            .unwrap();

        let primary = registry
            .list_eligible_drives(1, &DriveFilter::primary())
            .await
            .unwrap();
        assert!(primary.is_empty());

        let backup = registry
            .list_eligible_drives(1, &DriveFilter::backup())
            .await
            .unwrap();
        assert_eq!(backup.len(), 1);
    }

    #[tokio::test]
    async fn test_reserve_and_release() {
        let registry = registry();
        let drive = add(&registry, "a", 1000, 300).await;

        let after = registry.reserve_space(&drive.id, 300).await.unwrap();
        assert_eq!(after.available_mb, 0);

        let err = registry.reserve_space(&drive.id, 1).await.unwrap_err();
        assert!(err.is_insufficient_space());

        let after = registry.release_space(&drive.id, 5000).await.unwrap();
        assert_eq!(after.available_mb, 1000);

        assert!(registry.reserve_space("DRIVE-NOPE", 1).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_register_validation() {
        let registry = registry();
        assert!(registry
            .register_drive(NewDrive::new("x", "rack", 0))
            .await
            .is_err());
        assert!(registry
            .register_drive(NewDrive::new("x", "rack", 10).with_available(11))
            .await
            .is_err());
        assert!(registry
            .register_drive(NewDrive::new(" ", "rack", 10))
            .await
            .is_err());

        let drive = add(&registry, "x", 10, 10).await;
        let update = DriveUpdate {
            capacity_mb: Some(5),
            ..Default::default()
        };
        assert!(registry.update_drive(&drive.id, update).await.is_err());
        assert_eq!(registry.get_drive(&drive.id).await.unwrap().capacity_mb, 10);
    }

    #[tokio::test]
    async fn test_set_status_reports_previous() {
        let registry = registry();
        let drive = add(&registry, "a", 100, 100).await;

        let change = registry.set_status(&drive.id, DriveStatus::Failing).await.unwrap();
        assert_eq!(change.previous, DriveStatus::Healthy);
        assert_eq!(change.current, DriveStatus::Failing);
        assert!(change.changed());
    }

    #[tokio::test]
    async fn test_delete_drive_with_dependencies() {
        let store = Arc::new(MemoryStore::new());
        let registry = DriveRegistry::new(store.clone());
        let primary = registry
            .register_drive(NewDrive::new("p", "rack", 1000).with_available(900))
            .await
            .unwrap();
        let backup = registry
            .register_drive(NewDrive::new("b", "rack", 1000).with_available(900).backup())
            .await
            .unwrap();

        let now = Utc::now();
        store
            .insert(DataChunk {
                id: "CHUNK-1".into(),
                name: "c".into(),
                size_mb: 100,
                drive_id: primary.id.clone(),
                priority: 3,
                is_replicated: true,
                checksum: None,
                status: ChunkStatus::Active,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
        store
            .insert(Replica {
                id: "REPLICA-1".into(),
                chunk_id: "CHUNK-1".into(),
                drive_id: backup.id.clone(),
                status: ReplicaStatus::Healthy,
                created_at: now,
            })
            .await
            .unwrap();

        let err = registry.delete_drive(&primary.id, false).await.unwrap_err();
        match err {
            FleetError::DependencyConflict { dependencies, .. } => {
                assert_eq!(dependencies.chunks, 1);
                assert_eq!(dependencies.replicas, 0);
            }
            other => panic!("unexpected error: {other}"),
        }

        let deletion = registry.delete_drive(&primary.id, true).await.unwrap();
        assert_eq!(deletion.removed.chunks, 1);
        assert_eq!(deletion.removed.replicas, 1);

        // Replica space on the backup drive came back
        assert_eq!(registry.get_drive(&backup.id).await.unwrap().available_mb, 1000);
        assert!(registry.get_drive(&primary.id).await.unwrap_err().is_not_found());

        // Backup drive is now free of dependencies
        assert!(registry.delete_drive(&backup.id, false).await.is_ok());
    }
}
