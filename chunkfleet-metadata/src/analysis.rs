//! Read-side fleet analysis
//!
//! - Allocation analysis: per-drive load plus priority, location and
//!   drive-type distributions
//! - Event timeline merging redistribution logs, drive states and corrupted
//!   chunks
//! - Per-drive statistics and recent performance metrics

use crate::catalog::ChunkCatalog;
use crate::health::{round2, MetricThresholds};
use crate::models::{
    ChunkStatus, DataChunk, Drive, DriveMetric, DriveStatus, DriveType, LogStatus,
    RedistributionLog,
};
use crate::registry::DriveRegistry;
use chrono::{DateTime, Duration, Utc};
use chunkfleet_core::{Result, NEARLY_FULL_PERCENT};
use chunkfleet_storage::{Query, RecordStore};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Events returned when no limit is given
pub const DEFAULT_TIMELINE_LIMIT: usize = 20;

/// Metric window used when no window is given
pub const DEFAULT_PERFORMANCE_HOURS: u32 = 24;

// =========================================================================
// ALLOCATION
// =========================================================================

/// Load carried by one drive
#[derive(Debug, Clone, Serialize)]
pub struct DriveAllocation {
    pub drive_id: String,
    pub name: String,
    pub location: String,
    pub drive_type: DriveType,
    pub status: DriveStatus,
    pub is_backup: bool,
    pub capacity_mb: u64,
    pub available_mb: u64,
    pub utilization_percent: f64,

    /// Primary chunks on the drive
    pub chunk_count: usize,
    pub data_size_mb: u64,
    pub replica_count: usize,
}

/// Chunks sharing one priority
#[derive(Debug, Clone, Serialize)]
pub struct PriorityBucket {
    pub priority: u8,
    pub chunk_count: usize,
    pub total_size_mb: u64,

    /// Share of the bucket's data that is replicated; `None` for empty data
    pub protection_percent: Option<f64>,
}

/// Drives sharing one location
#[derive(Debug, Clone, Serialize)]
pub struct LocationBucket {
    pub location: String,
    pub drive_count: usize,
    pub capacity_mb: u64,
    pub available_mb: u64,
    pub used_mb: u64,
    pub utilization_percent: Option<f64>,
}

/// Drives sharing one hardware type
#[derive(Debug, Clone, Serialize)]
pub struct DriveTypeBucket {
    pub drive_type: DriveType,
    pub drive_count: usize,
    pub capacity_mb: u64,
    pub utilization_percent: Option<f64>,

    /// Share of total fleet capacity
    pub capacity_share_percent: Option<f64>,
}

/// Full allocation breakdown
#[derive(Debug, Clone, Serialize)]
pub struct AllocationAnalysis {
    /// Most utilized first
    pub drives: Vec<DriveAllocation>,
    /// Highest priority first
    pub priority_distribution: Vec<PriorityBucket>,
    /// Most utilized first
    pub location_distribution: Vec<LocationBucket>,
    pub drive_type_distribution: Vec<DriveTypeBucket>,
}

// =========================================================================
// TIMELINE
// =========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Redistribution,
    DriveStatus,
    ChunkStatus,
}

/// One entry of the fleet timeline
#[derive(Debug, Clone, Serialize)]
pub struct FleetEvent {
    pub event_id: String,
    pub kind: EventKind,
    pub description: String,
    pub reason: String,
    pub at: DateTime<Utc>,
    pub status: String,

    /// Chunk or drive the event is about
    pub related_id: String,
    pub details: String,
}

// =========================================================================
// PER-DRIVE VIEWS
// =========================================================================

/// Everything stored about one drive
#[derive(Debug, Clone, Serialize)]
pub struct DriveStatistics {
    pub drive: Drive,

    /// Newest first
    pub metrics: Vec<DriveMetric>,
    pub chunk_count: usize,
    pub chunk_size_mb: u64,
    pub replica_count: usize,
}

/// Recent metrics of one drive
#[derive(Debug, Clone, Serialize)]
pub struct DrivePerformance {
    pub drive_id: String,
    pub name: String,
    pub status: DriveStatus,

    /// Newest first
    pub metrics: Vec<DriveMetric>,
}

/// Read-only analysis over the catalog
pub struct FleetAnalyzer<S> {
    store: Arc<S>,
    registry: DriveRegistry<S>,
    catalog: ChunkCatalog<S>,
    thresholds: MetricThresholds,
}

impl<S> Clone for FleetAnalyzer<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            registry: self.registry.clone(),
            catalog: self.catalog.clone(),
            thresholds: self.thresholds,
        }
    }
}

impl<S: RecordStore> FleetAnalyzer<S> {
    pub fn new(store: Arc<S>, registry: DriveRegistry<S>, catalog: ChunkCatalog<S>) -> Self {
        Self {
            store,
            registry,
            catalog,
            thresholds: MetricThresholds::default(),
        }
    }

    /// Thresholds used to label drive events
    pub fn with_thresholds(mut self, thresholds: MetricThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Per-drive load and fleet distributions
    pub async fn allocation_analysis(&self) -> Result<AllocationAnalysis> {
        let drives = self.registry.list_drives().await?;
        let chunks = self.catalog.list_chunks().await?;
        let replicas = self.catalog.list_replicas().await?;

        let mut primary: HashMap<&str, (usize, u64)> = HashMap::new();
        for chunk in &chunks {
            let entry = primary.entry(chunk.drive_id.as_str()).or_default();
            entry.0 += 1;
            entry.1 += accounted_size(chunk);
        }
        let mut replica_counts: HashMap<&str, usize> = HashMap::new();
        for replica in &replicas {
            *replica_counts.entry(replica.drive_id.as_str()).or_default() += 1;
        }

        let mut allocations: Vec<DriveAllocation> = drives
            .iter()
            .map(|d| {
                let (chunk_count, data_size_mb) =
                    primary.get(d.id.as_str()).copied().unwrap_or_default();
                DriveAllocation {
                    drive_id: d.id.clone(),
                    name: d.name.clone(),
                    location: d.location.clone(),
                    drive_type: d.drive_type,
                    status: d.status,
                    is_backup: d.is_backup,
                    capacity_mb: d.capacity_mb,
                    available_mb: d.available_mb,
                    utilization_percent: round2(d.utilization_percent()),
                    chunk_count,
                    data_size_mb,
                    replica_count: replica_counts.get(d.id.as_str()).copied().unwrap_or(0),
                }
            })
            .collect();
        allocations.sort_by(|a, b| {
            b.utilization_percent
                .total_cmp(&a.utilization_percent)
                .then_with(|| a.drive_id.cmp(&b.drive_id))
        });

        Ok(AllocationAnalysis {
            drives: allocations,
            priority_distribution: priority_distribution(&chunks),
            location_distribution: location_distribution(&drives),
            drive_type_distribution: drive_type_distribution(&drives),
        })
    }

    /// Recent fleet events, newest first
    ///
    /// A `limit` of zero means [`DEFAULT_TIMELINE_LIMIT`].
    pub async fn event_timeline(&self, limit: usize) -> Result<Vec<FleetEvent>> {
        let limit = if limit == 0 { DEFAULT_TIMELINE_LIMIT } else { limit };

        let drives = self.registry.list_drives().await?;
        let names: HashMap<&str, &str> = drives
            .iter()
            .map(|d| (d.id.as_str(), d.name.as_str()))
            .collect();

        let mut events: Vec<FleetEvent> = self
            .catalog
            .list_logs()
            .await?
            .iter()
            .map(|log| redistribution_event(log, &names))
            .collect();

        for drive in drives.iter().filter(|d| {
            matches!(
                d.status,
                DriveStatus::Degraded
                    | DriveStatus::Failing
                    | DriveStatus::Failed
                    | DriveStatus::Maintenance
            )
        }) {
            let latest = self.latest_metric(&drive.id).await?;
            events.push(self.drive_event(drive, latest.as_ref()));
        }

        for chunk in self.catalog.chunks_with_status(ChunkStatus::Corrupted).await? {
            events.push(FleetEvent {
                event_id: format!("CHUNK-STATUS-{}", chunk.id),
                kind: EventKind::ChunkStatus,
                description: format!("Chunk {} status: {}", chunk.name, chunk.status),
                reason: "Data integrity check".to_string(),
                at: chunk.updated_at,
                status: chunk.status.to_string(),
                related_id: chunk.id.clone(),
                details: format!("Size: {} MB, Priority: {}", chunk.size_mb, chunk.priority),
            });
        }

        events.sort_by(|a, b| b.at.cmp(&a.at).then_with(|| a.event_id.cmp(&b.event_id)));
        events.truncate(limit);
        Ok(events)
    }

    /// Metrics, chunk and replica totals of one drive
    pub async fn drive_statistics(&self, drive_id: &str) -> Result<DriveStatistics> {
        let drive = self.registry.get_drive(drive_id).await?;

        let id = drive.id.clone();
        let metrics = self
            .store
            .query(
                Query::<DriveMetric>::all()
                    .filter(move |m| m.drive_id == id)
                    .order_by(|a, b| b.recorded_at.cmp(&a.recorded_at)),
            )
            .await?;

        let chunks = self.catalog.chunks_on_drive(&drive.id).await?;
        let replica_count = self.catalog.replicas_on_drive(&drive.id).await?.len();

        Ok(DriveStatistics {
            chunk_count: chunks.len(),
            chunk_size_mb: chunks.iter().map(accounted_size).sum(),
            replica_count,
            metrics,
            drive,
        })
    }

    /// Metrics of the last `hours` hours grouped by drive
    ///
    /// Zero hours means [`DEFAULT_PERFORMANCE_HOURS`]. Drives without recent
    /// metrics are left out.
    pub async fn performance_metrics(&self, hours: u32) -> Result<Vec<DrivePerformance>> {
        let hours = if hours == 0 { DEFAULT_PERFORMANCE_HOURS } else { hours };
        let since = Utc::now() - Duration::hours(i64::from(hours));

        let recent = self
            .store
            .query(
                Query::<DriveMetric>::all()
                    .filter(move |m| m.recorded_at >= since)
                    .order_by(|a, b| b.recorded_at.cmp(&a.recorded_at)),
            )
            .await?;

        let mut grouped: BTreeMap<String, Vec<DriveMetric>> = BTreeMap::new();
        for metric in recent {
            grouped.entry(metric.drive_id.clone()).or_default().push(metric);
        }

        let mut performance = Vec::with_capacity(grouped.len());
        for (drive_id, metrics) in grouped {
            // Metrics of a deleted drive have nothing to attach to
            let Some(drive) = self.registry.find_drive(&drive_id).await? else {
                continue;
            };
            performance.push(DrivePerformance {
                drive_id,
                name: drive.name,
                status: drive.status,
                metrics,
            });
        }
        performance.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.drive_id.cmp(&b.drive_id)));
        Ok(performance)
    }

    async fn latest_metric(&self, drive_id: &str) -> Result<Option<DriveMetric>> {
        let id = drive_id.to_string();
        Ok(self
            .store
            .query(
                Query::<DriveMetric>::all()
                    .filter(move |m| m.drive_id == id)
                    .order_by(|a, b| b.recorded_at.cmp(&a.recorded_at))
                    .limit(1),
            )
            .await?
            .into_iter()
            .next())
    }

    fn drive_event(&self, drive: &Drive, metric: Option<&DriveMetric>) -> FleetEvent {
        let (at, reason, details) = match metric {
            Some(m) => {
                let reason = if m.error_rate > self.thresholds.failing_error_rate {
                    format!("High error rate: {}", m.error_rate)
                } else if m.temperature_c > self.thresholds.degraded_temperature {
                    format!("High temperature: {}°C", m.temperature_c)
                } else if m.utilization_percent > NEARLY_FULL_PERCENT {
                    format!("High utilization: {}%", round2(m.utilization_percent))
                } else {
                    "Status update".to_string()
                };
                let details = format!(
                    "CPU: {}%, IO: {}, Temp: {}",
                    m.cpu_usage, m.io_throughput, m.temperature_c
                );
                (m.recorded_at, reason, details)
            }
            None => (
                drive.updated_at,
                "Status update".to_string(),
                "No metrics recorded".to_string(),
            ),
        };

        FleetEvent {
            event_id: format!("DRIVE-STATUS-{}-{}", at.format("%Y%m%d%H%M%S"), drive.id),
            kind: EventKind::DriveStatus,
            description: format!("Drive {} status: {}", drive.name, drive.status),
            reason,
            at,
            status: drive.status.to_string(),
            related_id: drive.id.clone(),
            details,
        }
    }
}

fn redistribution_event(log: &RedistributionLog, names: &HashMap<&str, &str>) -> FleetEvent {
    let description = match log.status {
        LogStatus::Completed => format!("Chunk {} redistributed", log.chunk_id),
        LogStatus::Failed => format!("Redistribution failed for chunk {}", log.chunk_id),
        LogStatus::InProgress => format!("Redistributing chunk {}", log.chunk_id),
    };
    let name = |id: &str| names.get(id).copied().unwrap_or(id).to_string();
    let target = log
        .target_drive_id
        .as_deref()
        .map(name)
        .unwrap_or_else(|| "no target".to_string());

    FleetEvent {
        event_id: log.id.clone(),
        kind: EventKind::Redistribution,
        description,
        reason: log.reason.clone(),
        at: log.started_at,
        status: log.status.to_string(),
        related_id: log.chunk_id.clone(),
        details: format!("{} -> {}", name(&log.source_drive_id), target),
    }
}

/// Size counted in totals; rows with a non-positive size count as zero
fn accounted_size(chunk: &DataChunk) -> u64 {
    u64::try_from(chunk.size_mb).unwrap_or(0)
}

fn percent(part: u64, whole: u64) -> Option<f64> {
    (whole > 0).then(|| round2(part as f64 * 100.0 / whole as f64))
}

fn priority_distribution(chunks: &[DataChunk]) -> Vec<PriorityBucket> {
    // priority -> (count, total, replicated)
    let mut buckets: BTreeMap<u8, (usize, u64, u64)> = BTreeMap::new();
    for chunk in chunks {
        let size = accounted_size(chunk);
        let entry = buckets.entry(chunk.priority).or_default();
        entry.0 += 1;
        entry.1 += size;
        if chunk.is_replicated {
            entry.2 += size;
        }
    }

    buckets
        .into_iter()
        .rev()
        .map(|(priority, (chunk_count, total, replicated))| PriorityBucket {
            priority,
            chunk_count,
            total_size_mb: total,
            protection_percent: percent(replicated, total),
        })
        .collect()
}

fn location_distribution(drives: &[Drive]) -> Vec<LocationBucket> {
    let mut buckets: BTreeMap<&str, LocationBucket> = BTreeMap::new();
    for drive in drives {
        let bucket = buckets
            .entry(drive.location.as_str())
            .or_insert_with(|| LocationBucket {
                location: drive.location.clone(),
                drive_count: 0,
                capacity_mb: 0,
                available_mb: 0,
                used_mb: 0,
                utilization_percent: None,
            });
        bucket.drive_count += 1;
        bucket.capacity_mb += drive.capacity_mb;
        bucket.available_mb += drive.available_mb;
        bucket.used_mb += drive.used_mb();
    }

    let mut locations: Vec<LocationBucket> = buckets
        .into_values()
        .map(|mut b| {
            b.utilization_percent = percent(b.used_mb, b.capacity_mb);
            b
        })
        .collect();
    locations.sort_by(|a, b| {
        b.utilization_percent
            .unwrap_or(0.0)
            .total_cmp(&a.utilization_percent.unwrap_or(0.0))
            .then_with(|| a.location.cmp(&b.location))
    });
    locations
}

fn drive_type_distribution(drives: &[Drive]) -> Vec<DriveTypeBucket> {
    let fleet_capacity: u64 = drives.iter().map(|d| d.capacity_mb).sum();

    // type -> (count, capacity, used)
    let mut buckets: BTreeMap<&'static str, (DriveType, usize, u64, u64)> = BTreeMap::new();
    for drive in drives {
        let entry = buckets
            .entry(drive.drive_type.as_str())
            .or_insert((drive.drive_type, 0, 0, 0));
        entry.1 += 1;
        entry.2 += drive.capacity_mb;
        entry.3 += drive.used_mb();
    }

    buckets
        .into_values()
        .map(|(drive_type, drive_count, capacity, used)| DriveTypeBucket {
            drive_type,
            drive_count,
            capacity_mb: capacity,
            utilization_percent: percent(used, capacity),
            capacity_share_percent: percent(capacity, fleet_capacity),
        })
        .collect()
}
