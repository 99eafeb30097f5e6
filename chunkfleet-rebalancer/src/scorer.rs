//! Placement scorer
//!
//! Chooses drives for primaries and replicas. Candidates are ranked by
//! ascending utilization with ties broken by drive id, so the choice is
//! deterministic for a given catalog state.

use chunkfleet_core::{FleetError, Result};
use chunkfleet_metadata::{Drive, DriveFilter, DriveRegistry};
use chunkfleet_storage::RecordStore;
use std::collections::HashSet;

/// Placement scorer
pub struct PlacementScorer<S> {
    registry: DriveRegistry<S>,
}

impl<S> Clone for PlacementScorer<S> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
        }
    }
}

impl<S: RecordStore> PlacementScorer<S> {
    pub fn new(registry: DriveRegistry<S>) -> Self {
        Self { registry }
    }

    /// Best non-backup drive for a new chunk
    pub async fn select_primary_drive(&self, size_mb: u64) -> Result<Drive> {
        self.select_primary_drive_excluding(size_mb, &HashSet::new())
            .await
    }

    /// Best non-backup drive outside `exclude`
    pub async fn select_primary_drive_excluding(
        &self,
        size_mb: u64,
        exclude: &HashSet<String>,
    ) -> Result<Drive> {
        self.primary_candidates(size_mb, exclude)
            .await?
            .into_iter()
            .next()
            .ok_or(FleetError::NoSuitableDrive { size_mb })
    }

    /// Ranked non-backup drives outside `exclude`
    pub async fn primary_candidates(
        &self,
        size_mb: u64,
        exclude: &HashSet<String>,
    ) -> Result<Vec<Drive>> {
        let filter = DriveFilter::primary().excluding(exclude.iter().cloned());
        self.registry.list_eligible_drives(size_mb, &filter).await
    }

    /// Ranked backup drives outside `exclude`
    pub async fn replica_candidates(
        &self,
        size_mb: u64,
        exclude: &HashSet<String>,
    ) -> Result<Vec<Drive>> {
        let filter = DriveFilter::backup().excluding(exclude.iter().cloned());
        self.registry.list_eligible_drives(size_mb, &filter).await
    }

    pub async fn count_replica_candidates(
        &self,
        size_mb: u64,
        exclude: &HashSet<String>,
    ) -> Result<usize> {
        Ok(self.replica_candidates(size_mb, exclude).await?.len())
    }

    /// Up to `count` backup drives; fewer is not an error
    pub async fn select_replica_drives(
        &self,
        size_mb: u64,
        exclude: &HashSet<String>,
        count: usize,
    ) -> Result<Vec<Drive>> {
        let mut drives = self.replica_candidates(size_mb, exclude).await?;
        drives.truncate(count);
        Ok(drives)
    }
}
