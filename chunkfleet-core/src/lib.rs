//! ChunkFleet Core Library
//!
//! Core abstractions shared by the ChunkFleet crates:
//! - Unified error taxonomy (`FleetError`)
//! - Entity kinds and collision-free identifiers
//! - Fleet-wide placement constants

pub mod error;
pub mod id;

pub use error::{DependencyCounts, FleetError, Result};
pub use id::EntityKind;

/// Replica count used when no distribution policy is active
pub const FALLBACK_MIN_REPLICAS: u32 = 1;

/// Defaults applied to newly created distribution policies
pub const DEFAULT_POLICY_MIN_REPLICAS: u32 = 2;
pub const DEFAULT_REBALANCE_THRESHOLD: u8 = 75;

/// Chunk priority range (higher = more critical)
pub const MIN_CHUNK_PRIORITY: u8 = 1;
pub const MAX_CHUNK_PRIORITY: u8 = 5;
pub const DEFAULT_CHUNK_PRIORITY: u8 = 3;

/// Utilization above which a drive is reported as nearly full
pub const NEARLY_FULL_PERCENT: f64 = 90.0;
