//! Catalog models for ChunkFleet
//!
//! These structs are the rows of the fleet catalog tables.

use chrono::{DateTime, Utc};
use chunkfleet_core::{
    FleetError, Result, DEFAULT_CHUNK_PRIORITY, MAX_CHUNK_PRIORITY, MIN_CHUNK_PRIORITY,
};
use chunkfleet_storage::{Record, Table};
use serde::{Deserialize, Serialize};

// =========================================================================
// STATUS ENUMERATIONS
// =========================================================================

/// Drive status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriveStatus {
    Healthy,
    Warning,
    Degraded,
    Critical,
    Failing,
    Failed,
    Maintenance,
}

impl Default for DriveStatus {
    fn default() -> Self {
        Self::Healthy
    }
}

impl DriveStatus {
    pub const ALL: [DriveStatus; 7] = [
        Self::Healthy,
        Self::Warning,
        Self::Degraded,
        Self::Critical,
        Self::Failing,
        Self::Failed,
        Self::Maintenance,
    ];

    /// Ordering of states by how close the drive is to losing data
    pub fn severity(&self) -> u8 {
        match self {
            Self::Healthy => 0,
            Self::Maintenance => 1,
            Self::Warning => 2,
            Self::Degraded => 3,
            Self::Critical => 4,
            Self::Failing => 5,
            Self::Failed => 6,
        }
    }

    /// FAILING or FAILED
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failing | Self::Failed)
    }

    /// Only healthy drives receive new chunks or replicas
    pub fn accepts_placements(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "HEALTHY",
            Self::Warning => "WARNING",
            Self::Degraded => "DEGRADED",
            Self::Critical => "CRITICAL",
            Self::Failing => "FAILING",
            Self::Failed => "FAILED",
            Self::Maintenance => "MAINTENANCE",
        }
    }
}

impl std::fmt::Display for DriveStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DriveStatus {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| FleetError::InvalidRequest(format!("invalid drive status: {}", s)))
    }
}

/// Drive hardware type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DriveType {
    #[serde(rename = "SSD")]
    Ssd,
    #[serde(rename = "HDD")]
    Hdd,
    #[serde(rename = "NVMe")]
    Nvme,
    #[serde(rename = "SATA")]
    Sata,
    #[serde(rename = "SAS")]
    Sas,
}

impl Default for DriveType {
    fn default() -> Self {
        Self::Ssd
    }
}

impl DriveType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ssd => "SSD",
            Self::Hdd => "HDD",
            Self::Nvme => "NVMe",
            Self::Sata => "SATA",
            Self::Sas => "SAS",
        }
    }
}

impl std::fmt::Display for DriveType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DriveType {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self> {
        [Self::Ssd, Self::Hdd, Self::Nvme, Self::Sata, Self::Sas]
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| FleetError::InvalidRequest(format!("invalid drive type: {}", s)))
    }
}

/// Chunk status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChunkStatus {
    Active,
    Redistributing,
    Corrupted,
}

impl Default for ChunkStatus {
    fn default() -> Self {
        Self::Active
    }
}

impl std::fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "ACTIVE"),
            Self::Redistributing => write!(f, "REDISTRIBUTING"),
            Self::Corrupted => write!(f, "CORRUPTED"),
        }
    }
}

impl std::str::FromStr for ChunkStatus {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self> {
        [Self::Active, Self::Redistributing, Self::Corrupted]
            .into_iter()
            .find(|status| status.to_string().eq_ignore_ascii_case(s))
            .ok_or_else(|| FleetError::InvalidRequest(format!("invalid chunk status: {}", s)))
    }
}

/// Replica status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicaStatus {
    Healthy,
    Degraded,
    Failed,
}

impl Default for ReplicaStatus {
    fn default() -> Self {
        Self::Healthy
    }
}

impl std::fmt::Display for ReplicaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "HEALTHY"),
            Self::Degraded => write!(f, "DEGRADED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Redistribution log status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogStatus {
    InProgress,
    Completed,
    Failed,
}

impl std::fmt::Display for LogStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InProgress => write!(f, "IN_PROGRESS"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

// =========================================================================
// RECORDS
// =========================================================================

/// Storage drive in the fleet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Drive {
    pub id: String,
    pub name: String,
    pub location: String,

    // Capacity (MB)
    pub capacity_mb: u64,
    pub available_mb: u64,

    pub status: DriveStatus,
    pub drive_type: DriveType,

    /// Backup drives only host replicas
    pub is_backup: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Drive {
    pub fn used_mb(&self) -> u64 {
        self.capacity_mb.saturating_sub(self.available_mb)
    }

    /// Used fraction in [0, 1]; a zero-capacity drive counts as full
    pub fn utilization(&self) -> f64 {
        if self.capacity_mb == 0 {
            return 1.0;
        }
        self.used_mb() as f64 / self.capacity_mb as f64
    }

    pub fn utilization_percent(&self) -> f64 {
        self.utilization() * 100.0
    }

    /// True if the drive can take a placement of `size_mb` right now
    pub fn can_host(&self, size_mb: u64) -> bool {
        self.status.accepts_placements() && self.available_mb >= size_mb
    }
}

impl Record for Drive {
    const TABLE: Table = Table::Drives;

    fn id(&self) -> &str {
        &self.id
    }
}

/// Logical unit of data with a primary drive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataChunk {
    pub id: String,
    pub name: String,

    /// Size in MB; signed so that corrupt rows can be represented
    pub size_mb: i64,

    /// Primary drive
    pub drive_id: String,

    /// 1 (lowest) to 5 (highest)
    pub priority: u8,

    pub is_replicated: bool,
    pub checksum: Option<String>,
    pub status: ChunkStatus,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DataChunk {
    /// Size usable for space accounting
    pub fn size(&self) -> Result<u64> {
        if self.size_mb <= 0 {
            return Err(FleetError::DataIntegrity(format!(
                "chunk {} has invalid size {} MB",
                self.id, self.size_mb
            )));
        }
        Ok(self.size_mb as u64)
    }
}

impl Record for DataChunk {
    const TABLE: Table = Table::Chunks;

    fn id(&self) -> &str {
        &self.id
    }
}

/// Copy of a chunk on a drive other than its primary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Replica {
    pub id: String,
    pub chunk_id: String,
    pub drive_id: String,
    pub status: ReplicaStatus,
    pub created_at: DateTime<Utc>,
}

impl Record for Replica {
    const TABLE: Table = Table::Replicas;

    fn id(&self) -> &str {
        &self.id
    }
}

/// Replication and rebalancing rules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributionPolicy {
    pub id: String,
    pub name: String,
    pub min_replicas: u32,

    /// Utilization percent above which a drive should shed chunks
    pub rebalance_threshold: u8,

    /// Serve higher-priority chunks first during rebalancing
    pub priority_based_placement: bool,

    /// Stored only; placement does not consult it
    pub locality_aware: bool,

    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Record for DistributionPolicy {
    const TABLE: Table = Table::Policies;

    fn id(&self) -> &str {
        &self.id
    }
}

/// Audit record of a chunk movement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedistributionLog {
    pub id: String,
    pub chunk_id: String,
    pub source_drive_id: String,

    /// Absent when no target could be found
    pub target_drive_id: Option<String>,

    pub reason: String,
    pub status: LogStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RedistributionLog {
    /// True if the log references the drive as source or target
    pub fn touches(&self, drive_id: &str) -> bool {
        self.source_drive_id == drive_id || self.target_drive_id.as_deref() == Some(drive_id)
    }
}

impl Record for RedistributionLog {
    const TABLE: Table = Table::RedistributionLogs;

    fn id(&self) -> &str {
        &self.id
    }
}

/// Point-in-time drive telemetry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriveMetric {
    pub id: String,
    pub drive_id: String,
    pub cpu_usage: f64,
    pub io_throughput: f64,
    pub response_time_ms: f64,
    pub error_rate: f64,
    pub temperature_c: f64,
    pub utilization_percent: f64,
    pub recorded_at: DateTime<Utc>,
}

impl Record for DriveMetric {
    const TABLE: Table = Table::DriveMetrics;

    fn id(&self) -> &str {
        &self.id
    }
}

// =========================================================================
// INPUT PARAMETERS
// =========================================================================

/// Parameters for registering a drive
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDrive {
    pub name: String,
    pub location: String,
    pub capacity_mb: u64,

    /// Defaults to the full capacity
    #[serde(default)]
    pub available_mb: Option<u64>,

    #[serde(default)]
    pub status: DriveStatus,

    #[serde(default)]
    pub drive_type: DriveType,

    #[serde(default)]
    pub is_backup: bool,
}

impl NewDrive {
    pub fn new(name: impl Into<String>, location: impl Into<String>, capacity_mb: u64) -> Self {
        Self {
            name: name.into(),
            location: location.into(),
            capacity_mb,
            available_mb: None,
            status: DriveStatus::Healthy,
            drive_type: DriveType::Ssd,
            is_backup: false,
        }
    }

    pub fn backup(mut self) -> Self {
        self.is_backup = true;
        self
    }

    pub fn with_available(mut self, available_mb: u64) -> Self {
        self.available_mb = Some(available_mb);
        self
    }

    pub fn with_type(mut self, drive_type: DriveType) -> Self {
        self.drive_type = drive_type;
        self
    }

    pub fn with_status(mut self, status: DriveStatus) -> Self {
        self.status = status;
        self
    }
}

/// Partial drive update
#[derive(Debug, Clone, Default)]
pub struct DriveUpdate {
    pub name: Option<String>,
    pub location: Option<String>,
    pub capacity_mb: Option<u64>,
    pub available_mb: Option<u64>,
    pub status: Option<DriveStatus>,
    pub drive_type: Option<DriveType>,
    pub is_backup: Option<bool>,
}

/// Parameters for creating a chunk
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub name: String,
    pub size_mb: u64,

    /// Defaults to 3
    pub priority: Option<u8>,
    pub checksum: Option<String>,

    /// Place replicas per the active policy
    pub replicate: bool,

    /// Explicit primary drive; chosen by the scorer when absent
    pub drive_id: Option<String>,
}

impl NewChunk {
    pub fn new(name: impl Into<String>, size_mb: u64) -> Self {
        Self {
            name: name.into(),
            size_mb,
            priority: None,
            checksum: None,
            replicate: true,
            drive_id: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn on_drive(mut self, drive_id: impl Into<String>) -> Self {
        self.drive_id = Some(drive_id.into());
        self
    }

    pub fn without_replication(mut self) -> Self {
        self.replicate = false;
        self
    }

    pub fn effective_priority(&self) -> u8 {
        self.priority.unwrap_or(DEFAULT_CHUNK_PRIORITY)
    }
}

/// Partial chunk update; size and placement are not editable
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkUpdate {
    pub name: Option<String>,
    pub priority: Option<u8>,
    pub checksum: Option<String>,
    pub status: Option<ChunkStatus>,
}

/// Reject priorities outside 1-5
pub fn validate_priority(priority: u8) -> Result<()> {
    if !(MIN_CHUNK_PRIORITY..=MAX_CHUNK_PRIORITY).contains(&priority) {
        return Err(FleetError::InvalidRequest(format!(
            "priority must be between {} and {}",
            MIN_CHUNK_PRIORITY, MAX_CHUNK_PRIORITY
        )));
    }
    Ok(())
}

/// Parameters for creating a policy
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewPolicy {
    pub name: String,

    /// Defaults to 2
    #[serde(default)]
    pub min_replicas: Option<u32>,

    /// Defaults to 75
    #[serde(default)]
    pub rebalance_threshold: Option<u8>,

    #[serde(default)]
    pub priority_based_placement: bool,

    #[serde(default)]
    pub locality_aware: bool,
}

impl NewPolicy {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_min_replicas(mut self, n: u32) -> Self {
        self.min_replicas = Some(n);
        self
    }

    pub fn with_threshold(mut self, percent: u8) -> Self {
        self.rebalance_threshold = Some(percent);
        self
    }

    pub fn priority_based(mut self) -> Self {
        self.priority_based_placement = true;
        self
    }
}

/// Partial policy update
#[derive(Debug, Clone, Default)]
pub struct PolicyUpdate {
    pub name: Option<String>,
    pub min_replicas: Option<u32>,
    pub rebalance_threshold: Option<u8>,
    pub priority_based_placement: Option<bool>,
    pub locality_aware: Option<bool>,
    pub is_active: Option<bool>,
}

/// Parameters for recording a drive metric
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewMetric {
    pub drive_id: String,
    pub cpu_usage: f64,
    pub io_throughput: f64,
    pub response_time_ms: f64,
    pub error_rate: f64,
    pub temperature_c: f64,

    /// Computed from the drive when absent
    #[serde(default)]
    pub utilization_percent: Option<f64>,
}

impl NewMetric {
    pub fn new(drive_id: impl Into<String>) -> Self {
        Self {
            drive_id: drive_id.into(),
            ..Default::default()
        }
    }

    pub fn with_error_rate(mut self, rate: f64) -> Self {
        self.error_rate = rate;
        self
    }

    pub fn with_temperature(mut self, celsius: f64) -> Self {
        self.temperature_c = celsius;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive(capacity: u64, available: u64) -> Drive {
        let now = Utc::now();
        Drive {
            id: "DRIVE-1".into(),
            name: "d1".into(),
            location: "rack-a".into(),
            capacity_mb: capacity,
            available_mb: available,
            status: DriveStatus::Healthy,
            drive_type: DriveType::Ssd,
            is_backup: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_utilization() {
        assert_eq!(drive(1000, 250).utilization(), 0.75);
        assert_eq!(drive(0, 0).utilization(), 1.0);
        assert_eq!(drive(1000, 250).used_mb(), 750);
    }

    #[test]
    fn test_can_host() {
        let mut d = drive(1000, 100);
        assert!(d.can_host(100));
        assert!(!d.can_host(101));
        d.status = DriveStatus::Degraded;
        assert!(!d.can_host(1));
    }

    #[test]
    fn test_status_parse_and_severity() {
        assert_eq!("failing".parse::<DriveStatus>().unwrap(), DriveStatus::Failing);
        assert!("broken".parse::<DriveStatus>().is_err());
        assert!(DriveStatus::Failed.severity() > DriveStatus::Degraded.severity());
        assert!(DriveStatus::Failing.is_failure());
        assert!(!DriveStatus::Maintenance.is_failure());
        assert_eq!("nvme".parse::<DriveType>().unwrap(), DriveType::Nvme);
    }

    #[test]
    fn test_chunk_size_integrity() {
        let now = Utc::now();
        let mut chunk = DataChunk {
            id: "CHUNK-1".into(),
            name: "c".into(),
            size_mb: 100,
            drive_id: "DRIVE-1".into(),
            priority: 3,
            is_replicated: false,
            checksum: None,
            status: ChunkStatus::Active,
            created_at: now,
            updated_at: now,
        };
        assert_eq!(chunk.size().unwrap(), 100);

        chunk.size_mb = 0;
        assert!(matches!(chunk.size(), Err(FleetError::DataIntegrity(_))));
    }

    #[test]
    fn test_status_serde_names() {
        let json = serde_json::to_string(&LogStatus::InProgress).unwrap();
        assert_eq!(json, "\"IN_PROGRESS\"");
        let json = serde_json::to_string(&DriveType::Nvme).unwrap();
        assert_eq!(json, "\"NVMe\"");
    }
}
