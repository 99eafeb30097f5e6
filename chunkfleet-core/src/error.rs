//! Error types for ChunkFleet
//!
//! Provides a unified error type for all ChunkFleet operations.

use crate::id::EntityKind;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for ChunkFleet operations
pub type Result<T> = std::result::Result<T, FleetError>;

/// Records that still reference a drive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyCounts {
    pub chunks: usize,
    pub replicas: usize,
    pub metrics: usize,
    pub logs: usize,
}

impl DependencyCounts {
    /// True if anything still references the drive
    pub fn has_any(&self) -> bool {
        self.chunks > 0 || self.replicas > 0 || self.metrics > 0 || self.logs > 0
    }
}

impl std::fmt::Display for DependencyCounts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} chunks, {} replicas, {} metrics, {} logs",
            self.chunks, self.replicas, self.metrics, self.logs
        )
    }
}

/// Unified error type for ChunkFleet
#[derive(Error, Debug)]
pub enum FleetError {
    // ===== Lookup Errors =====
    #[error("{entity} not found: {id}")]
    NotFound { entity: EntityKind, id: String },

    // ===== Placement Errors =====
    #[error("Insufficient space on drive {drive_id}: requested {requested_mb} MB, available {available_mb} MB")]
    InsufficientSpace {
        drive_id: String,
        requested_mb: u64,
        available_mb: u64,
    },

    #[error("No suitable drive with {size_mb} MB available")]
    NoSuitableDrive { size_mb: u64 },

    #[error("No healthy replica available to recover chunk {0}")]
    NoHealthyReplica(String),

    // ===== State Errors =====
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Drive {drive_id} has dependencies: {dependencies}")]
    DependencyConflict {
        drive_id: String,
        dependencies: DependencyCounts,
    },

    #[error("Data integrity error: {0}")]
    DataIntegrity(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // ===== Storage Errors =====
    #[error("Storage error: {0}")]
    Storage(String),

    // ===== Serialization Errors =====
    #[error("Serialization error: {0}")]
    Serialization(String),

    // ===== Configuration Errors =====
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl FleetError {
    /// Shorthand for a missing record
    pub fn not_found(entity: EntityKind, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_insufficient_space(&self) -> bool {
        matches!(self, Self::InsufficientSpace { .. })
    }
}

impl From<bincode::Error> for FleetError {
    fn from(err: bincode::Error) -> Self {
        FleetError::Serialization(err.to_string())
    }
}
