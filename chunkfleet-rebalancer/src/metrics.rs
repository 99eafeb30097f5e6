//! Prometheus counters for placement and rebalancing
//!
//! Recording is a no-op until a recorder is installed; the CLI installs the
//! Prometheus recorder when asked to print a snapshot.

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Metric names as constants
pub mod names {
    // Placement
    pub const CHUNKS_CREATED: &str = "chunkfleet_chunks_created_total";
    pub const CHUNKS_DELETED: &str = "chunkfleet_chunks_deleted_total";
    pub const REPLICAS_PLACED: &str = "chunkfleet_replicas_placed_total";
    pub const REPLICA_SHORTFALL: &str = "chunkfleet_replica_shortfall_total";

    // Movement
    pub const RELOCATIONS: &str = "chunkfleet_relocations_total";
    pub const RECOVERIES: &str = "chunkfleet_recoveries_total";
    pub const STRANDED_CHUNKS: &str = "chunkfleet_stranded_chunks_total";

    // Rebalancing
    pub const REBALANCES: &str = "chunkfleet_rebalances_total";
    pub const UNDER_REPLICATED: &str = "chunkfleet_under_replicated_chunks";
}

/// Initialize metric descriptions
pub fn init_metrics() {
    describe_counter!(names::CHUNKS_CREATED, "Chunks placed on a primary drive");
    describe_counter!(names::CHUNKS_DELETED, "Chunks deleted with their replicas");
    describe_counter!(names::REPLICAS_PLACED, "Replicas placed on backup drives");
    describe_counter!(
        names::REPLICA_SHORTFALL,
        "Replicas requested but not placed for lack of eligible drives"
    );
    describe_counter!(names::RELOCATIONS, "Chunk relocations by outcome");
    describe_counter!(names::RECOVERIES, "Corrupted chunks recovered from a replica");
    describe_counter!(
        names::STRANDED_CHUNKS,
        "Chunks left on a failing drive with no target"
    );
    describe_counter!(names::REBALANCES, "Rebalance passes executed");
    describe_gauge!(
        names::UNDER_REPLICATED,
        "Under-replicated chunks seen by the last scan"
    );
}

/// Install the Prometheus recorder and return its render handle
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    init_metrics();
    Ok(handle)
}

pub fn record_chunk_created(replicated: bool) {
    counter!(names::CHUNKS_CREATED, "replicated" => replicated.to_string()).increment(1);
}

pub fn record_chunk_deleted() {
    counter!(names::CHUNKS_DELETED).increment(1);
}

pub fn record_replicas_placed(count: usize) {
    if count > 0 {
        counter!(names::REPLICAS_PLACED).increment(count as u64);
    }
}

pub fn record_replica_shortfall(missing: usize) {
    if missing > 0 {
        counter!(names::REPLICA_SHORTFALL).increment(missing as u64);
    }
}

pub fn record_relocation(success: bool) {
    let outcome = if success { "completed" } else { "rolled_back" };
    counter!(names::RELOCATIONS, "outcome" => outcome).increment(1);
}

pub fn record_recovery() {
    counter!(names::RECOVERIES).increment(1);
}

pub fn record_stranded(count: usize) {
    if count > 0 {
        counter!(names::STRANDED_CHUNKS).increment(count as u64);
    }
}

pub fn record_rebalance(structural: &str) {
    counter!(names::REBALANCES, "structural" => structural.to_string()).increment(1);
}

pub fn set_under_replicated(count: usize) {
    gauge!(names::UNDER_REPLICATED).set(count as f64);
}
