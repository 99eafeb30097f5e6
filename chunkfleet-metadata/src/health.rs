//! Drive health for ChunkFleet
//!
//! - Metric ingestion with threshold-driven status transitions
//! - System health roll-up (overall state, risk counts, at-risk chunks)
//! - Fleet summary (capacity, counts by status)

use crate::catalog::ChunkCatalog;
use crate::models::{
    ChunkStatus, DataChunk, Drive, DriveMetric, DriveStatus, LogStatus, NewMetric,
};
use crate::policy::PolicyManager;
use crate::registry::{DriveRegistry, StatusChange};
use chrono::Utc;
use chunkfleet_core::{EntityKind, Result, NEARLY_FULL_PERCENT};
use chunkfleet_storage::{Query, RecordStore};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{info, warn};

/// Maximum number of at-risk chunks reported
pub const AT_RISK_LIMIT: usize = 10;

/// Chunks at or above this priority are reported when unreplicated
pub const CRITICAL_PRIORITY: u8 = 4;

/// Metric thresholds for status transitions
#[derive(Debug, Clone, Copy)]
pub struct MetricThresholds {
    /// Error rate above which a healthy drive degrades
    pub degraded_error_rate: f64,
    /// Temperature (°C) above which a healthy drive degrades
    pub degraded_temperature: f64,
    /// Error rate above which a drive is failing
    pub failing_error_rate: f64,
    /// Temperature (°C) above which a drive is failing
    pub failing_temperature: f64,
}

impl Default for MetricThresholds {
    fn default() -> Self {
        Self {
            degraded_error_rate: 0.05,
            degraded_temperature: 75.0,
            failing_error_rate: 0.10,
            failing_temperature: 85.0,
        }
    }
}

impl MetricThresholds {
    /// Status a metric points to, if any; the stronger condition wins
    pub fn classify(&self, error_rate: f64, temperature: f64) -> Option<DriveStatus> {
        if error_rate > self.failing_error_rate || temperature > self.failing_temperature {
            Some(DriveStatus::Failing)
        } else if error_rate > self.degraded_error_rate || temperature > self.degraded_temperature {
            Some(DriveStatus::Degraded)
        } else {
            None
        }
    }

    /// Next status for a drive currently in `current`
    pub fn next_status(&self, current: DriveStatus, error_rate: f64, temperature: f64) -> Option<DriveStatus> {
        match (self.classify(error_rate, temperature)?, current) {
            (
                DriveStatus::Failing,
                DriveStatus::Healthy | DriveStatus::Warning | DriveStatus::Degraded,
            ) => Some(DriveStatus::Failing),
            (DriveStatus::Degraded, DriveStatus::Healthy) => Some(DriveStatus::Degraded),
            _ => None,
        }
    }
}

/// Outcome of recording a metric
#[derive(Debug, Clone, Serialize)]
pub struct MetricOutcome {
    pub metric: DriveMetric,

    /// Status change caused by the metric
    pub transition: Option<StatusChange>,
}

impl MetricOutcome {
    /// True if the metric pushed the drive into FAILING
    pub fn became_failing(&self) -> bool {
        self.transition
            .map(|t| t.current == DriveStatus::Failing)
            .unwrap_or(false)
    }
}

/// Overall fleet state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverallHealth {
    Healthy,
    Warning,
    Critical,
}

impl std::fmt::Display for OverallHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "HEALTHY"),
            Self::Warning => write!(f, "WARNING"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Chunk whose data is at risk
#[derive(Debug, Clone, Serialize)]
pub struct AtRiskChunk {
    pub chunk_id: String,
    pub name: String,
    pub size_mb: i64,
    pub status: ChunkStatus,
    pub drive_id: String,
    pub drive_name: Option<String>,
    pub drive_status: Option<DriveStatus>,
}

/// System health roll-up
#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    pub overall: OverallHealth,
    pub failing_drives: usize,
    pub degraded_drives: usize,
    pub corrupted_chunks: usize,

    /// Over 90 % utilization and not FAILED
    pub nearly_full_drives: usize,

    /// IN_PROGRESS redistribution logs
    pub ongoing_operations: usize,

    /// Replicated / total chunks; `None` without chunks
    pub data_protection_percent: Option<f64>,

    pub at_risk_chunks: Vec<AtRiskChunk>,
}

impl SystemHealth {
    pub fn summary(&self) -> String {
        format!(
            "{}: {} failing drives, {} degraded drives, {} corrupted chunks, {} nearly full drives, {} at-risk chunks",
            self.overall,
            self.failing_drives,
            self.degraded_drives,
            self.corrupted_chunks,
            self.nearly_full_drives,
            self.at_risk_chunks.len()
        )
    }
}

/// Fleet-wide totals
#[derive(Debug, Clone, Default, Serialize)]
pub struct FleetSummary {
    pub total_capacity_mb: u64,
    pub total_available_mb: u64,
    pub total_used_mb: u64,
    pub utilization_percent: f64,

    pub drive_count: usize,
    pub backup_drive_count: usize,
    pub drives_by_status: BTreeMap<String, usize>,

    pub chunk_count: usize,
    pub replicated_chunks: usize,
    pub chunks_by_status: BTreeMap<String, usize>,
    pub replica_count: usize,

    /// Priority ≥ 4 and not replicated
    pub unprotected_critical_chunks: usize,

    /// HEALTHY drives above 90 % utilization
    pub drives_at_capacity_risk: usize,

    pub logs_by_status: BTreeMap<String, usize>,
    pub active_policy: Option<String>,
}

/// Drive health monitor
pub struct HealthMonitor<S> {
    store: Arc<S>,
    registry: DriveRegistry<S>,
    catalog: ChunkCatalog<S>,
    policies: PolicyManager<S>,
    thresholds: MetricThresholds,
}

impl<S> Clone for HealthMonitor<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            registry: self.registry.clone(),
            catalog: self.catalog.clone(),
            policies: self.policies.clone(),
            thresholds: self.thresholds,
        }
    }
}

impl<S: RecordStore> HealthMonitor<S> {
    pub fn new(
        store: Arc<S>,
        registry: DriveRegistry<S>,
        catalog: ChunkCatalog<S>,
        policies: PolicyManager<S>,
    ) -> Self {
        Self {
            store,
            registry,
            catalog,
            policies,
            thresholds: MetricThresholds::default(),
        }
    }

    pub fn with_thresholds(mut self, thresholds: MetricThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn thresholds(&self) -> &MetricThresholds {
        &self.thresholds
    }

    /// Store a metric and apply threshold transitions
    pub async fn record_metric(&self, new: NewMetric) -> Result<MetricOutcome> {
        let drive = self.registry.get_drive(&new.drive_id).await?;

        let metric = DriveMetric {
            id: EntityKind::Metric.new_id(),
            drive_id: drive.id.clone(),
            cpu_usage: new.cpu_usage,
            io_throughput: new.io_throughput,
            response_time_ms: new.response_time_ms,
            error_rate: new.error_rate,
            temperature_c: new.temperature_c,
            utilization_percent: new
                .utilization_percent
                .unwrap_or_else(|| drive.utilization_percent()),
            recorded_at: Utc::now(),
        };
        self.store.insert(metric.clone()).await?;

        let thresholds = self.thresholds;
        let (error_rate, temperature) = (metric.error_rate, metric.temperature_c);
        let change = self
            .registry
            .transition(&drive.id, move |current| {
                thresholds.next_status(current, error_rate, temperature)
            })
            .await?;

        let transition = change.changed().then_some(change);
        if let Some(t) = transition {
            warn!(
                drive_id = %drive.id,
                error_rate,
                temperature,
                previous = %t.previous,
                current = %t.current,
                "Metric thresholds exceeded"
            );
        }

        Ok(MetricOutcome { metric, transition })
    }

    /// Most recent metrics of a drive, newest first
    pub async fn recent_metrics(&self, drive_id: &str, limit: usize) -> Result<Vec<DriveMetric>> {
        let id = drive_id.to_string();
        self.store
            .query(
                Query::<DriveMetric>::all()
                    .filter(move |m| m.drive_id == id)
                    .order_by(|a, b| b.recorded_at.cmp(&a.recorded_at))
                    .limit(limit),
            )
            .await
    }

    /// Roll the fleet up into a single health view
    pub async fn system_health(&self) -> Result<SystemHealth> {
        let drives = self.registry.list_drives().await?;
        let chunks = self.catalog.list_chunks().await?;
        let logs = self.catalog.list_logs().await?;

        let count_status = |status: DriveStatus| drives.iter().filter(|d| d.status == status).count();
        let failing_drives = drives.iter().filter(|d| d.status.is_failure()).count();
        let degraded_drives = count_status(DriveStatus::Degraded);
        let corrupted_chunks = chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Corrupted)
            .count();

        let overall = if failing_drives > 0 {
            OverallHealth::Critical
        } else if degraded_drives > 0 || corrupted_chunks > 0 {
            OverallHealth::Warning
        } else {
            OverallHealth::Healthy
        };

        let nearly_full_drives = drives
            .iter()
            .filter(|d| d.status != DriveStatus::Failed && d.utilization_percent() > NEARLY_FULL_PERCENT)
            .count();
        let ongoing_operations = logs
            .iter()
            .filter(|l| l.status == LogStatus::InProgress)
            .count();

        let data_protection_percent = if chunks.is_empty() {
            None
        } else {
            let replicated = chunks.iter().filter(|c| c.is_replicated).count();
            Some(round2(replicated as f64 * 100.0 / chunks.len() as f64))
        };

        let by_id: HashMap<&str, &Drive> = drives.iter().map(|d| (d.id.as_str(), d)).collect();
        let at_risk_chunks = chunks
            .iter()
            .filter(|c| is_at_risk(c, by_id.get(c.drive_id.as_str()).copied()))
            .take(AT_RISK_LIMIT)
            .map(|c| {
                let drive = by_id.get(c.drive_id.as_str());
                AtRiskChunk {
                    chunk_id: c.id.clone(),
                    name: c.name.clone(),
                    size_mb: c.size_mb,
                    status: c.status,
                    drive_id: c.drive_id.clone(),
                    drive_name: drive.map(|d| d.name.clone()),
                    drive_status: drive.map(|d| d.status),
                }
            })
            .collect();

        let health = SystemHealth {
            overall,
            failing_drives,
            degraded_drives,
            corrupted_chunks,
            nearly_full_drives,
            ongoing_operations,
            data_protection_percent,
            at_risk_chunks,
        };
        info!(summary = %health.summary(), "System health computed");
        Ok(health)
    }

    /// Fleet-wide totals and counts
    pub async fn fleet_summary(&self) -> Result<FleetSummary> {
        let drives = self.registry.list_drives().await?;
        let chunks = self.catalog.list_chunks().await?;
        let replicas = self.catalog.list_replicas().await?;
        let logs = self.catalog.list_logs().await?;

        let mut summary = FleetSummary {
            drive_count: drives.len(),
            chunk_count: chunks.len(),
            replica_count: replicas.len(),
            ..Default::default()
        };

        for drive in &drives {
            summary.total_capacity_mb += drive.capacity_mb;
            summary.total_available_mb += drive.available_mb;
            summary.total_used_mb += drive.used_mb();
            if drive.is_backup {
                summary.backup_drive_count += 1;
            }
            if drive.status == DriveStatus::Healthy && drive.utilization_percent() > NEARLY_FULL_PERCENT {
                summary.drives_at_capacity_risk += 1;
            }
            *summary
                .drives_by_status
                .entry(drive.status.to_string())
                .or_default() += 1;
        }
        if summary.total_capacity_mb > 0 {
            summary.utilization_percent = round2(
                summary.total_used_mb as f64 * 100.0 / summary.total_capacity_mb as f64,
            );
        }

        for chunk in &chunks {
            if chunk.is_replicated {
                summary.replicated_chunks += 1;
            } else if chunk.priority >= CRITICAL_PRIORITY {
                summary.unprotected_critical_chunks += 1;
            }
            *summary
                .chunks_by_status
                .entry(chunk.status.to_string())
                .or_default() += 1;
        }

        for log in &logs {
            *summary.logs_by_status.entry(log.status.to_string()).or_default() += 1;
        }

        summary.active_policy = self.policies.active_policy().await?.map(|p| p.name);
        Ok(summary)
    }
}

fn is_at_risk(chunk: &DataChunk, drive: Option<&Drive>) -> bool {
    chunk.status == ChunkStatus::Corrupted
        || drive
            .map(|d| matches!(d.status, DriveStatus::Failing | DriveStatus::Degraded))
            .unwrap_or(false)
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
