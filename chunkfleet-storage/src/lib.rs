//! ChunkFleet Storage
//!
//! Persistence for the fleet catalog:
//! - `RecordStore` trait with structured queries and atomic conditional updates
//! - `MemoryStore` for tests and simulation runs
//! - `SledStore` for on-disk persistence

pub mod backend;
pub mod memory;
pub mod sled_backend;

pub use backend::{Query, Record, RecordStore, StoreStats, Table};
pub use memory::MemoryStore;
pub use sled_backend::SledStore;

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Path to the catalog directory (`None` = in-memory store)
    pub path: Option<std::path::PathBuf>,

    /// Flush to disk after every mutating CLI command
    pub flush_on_write: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: None,
            flush_on_write: true,
        }
    }
}

impl StorageConfig {
    /// Create a config persisting under the given path
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Default::default()
        }
    }

    /// Enable/disable flushing after writes
    pub fn with_flush_on_write(mut self, enabled: bool) -> Self {
        self.flush_on_write = enabled;
        self
    }

    /// True if the catalog lives only in memory
    pub fn is_ephemeral(&self) -> bool {
        self.path.is_none()
    }
}
