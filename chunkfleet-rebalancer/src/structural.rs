//! Structural rebalance planners
//!
//! A planner looks at a snapshot of the fleet and proposes chunk moves.
//! Planners never touch the store; the rebalancer executes what they
//! propose through the relocation saga.

use chunkfleet_core::{Result, DEFAULT_REBALANCE_THRESHOLD};
use chunkfleet_metadata::{
    compare_utilization, ChunkStatus, DataChunk, DistributionPolicy, Drive, DriveStatus,
    FleetCatalog, Replica,
};
use chunkfleet_storage::RecordStore;
use serde::Serialize;
use std::collections::{HashMap, HashSet};

/// Point-in-time view of the fleet handed to planners
#[derive(Debug, Clone, Default)]
pub struct FleetSnapshot {
    pub drives: Vec<Drive>,
    pub chunks: Vec<DataChunk>,
    pub replicas: Vec<Replica>,
}

impl FleetSnapshot {
    /// Read drives, chunks and replicas from the catalog
    pub async fn capture<S: RecordStore>(catalog: &FleetCatalog<S>) -> Result<Self> {
        Ok(Self {
            drives: catalog.registry.list_drives().await?,
            chunks: catalog.chunks.list_chunks().await?,
            replicas: catalog.chunks.list_replicas().await?,
        })
    }

    /// Primary and replica drives per chunk
    pub fn used_drives(&self) -> HashMap<&str, HashSet<&str>> {
        let mut used: HashMap<&str, HashSet<&str>> = HashMap::new();
        for chunk in &self.chunks {
            used.entry(chunk.id.as_str())
                .or_default()
                .insert(chunk.drive_id.as_str());
        }
        for replica in &self.replicas {
            used.entry(replica.chunk_id.as_str())
                .or_default()
                .insert(replica.drive_id.as_str());
        }
        used
    }
}

/// A proposed chunk move
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelocationSuggestion {
    pub chunk_id: String,
    pub source_drive_id: String,
    pub target_drive_id: String,
    pub reason: String,
}

/// Pluggable structural rebalance step
pub trait StructuralRebalance: Send + Sync {
    /// Short name used in logs and reports
    fn name(&self) -> &'static str;

    /// Propose relocations for the snapshot
    fn plan(
        &self,
        snapshot: &FleetSnapshot,
        policy: Option<&DistributionPolicy>,
    ) -> Vec<RelocationSuggestion>;
}

/// Planner that never proposes anything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoStructuralRebalance;

impl StructuralRebalance for NoStructuralRebalance {
    fn name(&self) -> &'static str {
        "none"
    }

    fn plan(&self, _: &FleetSnapshot, _: Option<&DistributionPolicy>) -> Vec<RelocationSuggestion> {
        Vec::new()
    }
}

/// Moves chunks off drives above the policy's rebalance threshold
///
/// Only HEALTHY non-backup drives take part. Overloaded drives are drained
/// most-utilized first, largest chunk first, onto the least-utilized drive
/// that stays at or below the threshold after the move.
#[derive(Debug, Clone, Copy)]
pub struct UtilizationRebalance {
    /// Upper bound on moves per plan
    pub max_moves: usize,
}

impl Default for UtilizationRebalance {
    fn default() -> Self {
        Self { max_moves: 10 }
    }
}

#[derive(Debug, Clone)]
struct Load {
    id: String,
    capacity: u64,
    available: u64,
}

impl Load {
    fn percent_after(&self, delta_used: i128) -> f64 {
        let used = self.capacity.saturating_sub(self.available) as i128 + delta_used;
        used as f64 * 100.0 / self.capacity as f64
    }

    fn percent(&self) -> f64 {
        self.percent_after(0)
    }
}

impl StructuralRebalance for UtilizationRebalance {
    fn name(&self) -> &'static str {
        "utilization"
    }

    fn plan(
        &self,
        snapshot: &FleetSnapshot,
        policy: Option<&DistributionPolicy>,
    ) -> Vec<RelocationSuggestion> {
        let threshold = policy
            .map(|p| p.rebalance_threshold)
            .unwrap_or(DEFAULT_REBALANCE_THRESHOLD) as f64;

        let mut pool: Vec<&Drive> = snapshot
            .drives
            .iter()
            .filter(|d| d.status == DriveStatus::Healthy && !d.is_backup && d.capacity_mb > 0)
            .collect();
        pool.sort_by(|a, b| a.id.cmp(&b.id));
        pool.sort_by(|a, b| compare_utilization(a, b));

        let mut loads: Vec<Load> = pool
            .iter()
            .map(|d| Load {
                id: d.id.clone(),
                capacity: d.capacity_mb,
                available: d.available_mb,
            })
            .collect();

        let mut used = snapshot.used_drives();
        let mut moves = Vec::new();

        // Most utilized first
        let mut sources: Vec<usize> = (0..loads.len())
            .filter(|i| loads[*i].percent() > threshold)
            .collect();
        sources.sort_by(|a, b| {
            loads[*b]
                .percent()
                .partial_cmp(&loads[*a].percent())
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        for source in sources {
            let mut chunks: Vec<&DataChunk> = snapshot
                .chunks
                .iter()
                .filter(|c| {
                    c.drive_id == loads[source].id && c.status == ChunkStatus::Active && c.size_mb > 0
                })
                .collect();
            chunks.sort_by(|a, b| b.size_mb.cmp(&a.size_mb).then_with(|| a.id.cmp(&b.id)));

            for chunk in chunks {
                if moves.len() >= self.max_moves {
                    return moves;
                }
                if loads[source].percent() <= threshold {
                    break;
                }

                let size = chunk.size_mb as u64;
                let taken = used.get(chunk.id.as_str()).cloned().unwrap_or_default();

                let target = (0..loads.len())
                    .filter(|t| *t != source)
                    .filter(|t| !taken.contains(loads[*t].id.as_str()))
                    .filter(|t| loads[*t].available >= size)
                    .filter(|t| loads[*t].percent_after(size as i128) <= threshold)
                    .min_by(|a, b| {
                        loads[*a]
                            .percent()
                            .partial_cmp(&loads[*b].percent())
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then_with(|| loads[*a].id.cmp(&loads[*b].id))
                    });

                let Some(target) = target else {
                    continue;
                };

                loads[target].available -= size;
                loads[source].available += size;

                let entry = used.entry(chunk.id.as_str()).or_default();
                entry.remove(chunk.drive_id.as_str());
                // `loads` and `pool` share positions
                entry.insert(pool[target].id.as_str());

                moves.push(RelocationSuggestion {
                    chunk_id: chunk.id.clone(),
                    source_drive_id: loads[source].id.clone(),
                    target_drive_id: loads[target].id.clone(),
                    reason: format!(
                        "Structural rebalance: drive above {}% utilization",
                        threshold
                    ),
                });
            }
        }

        moves
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use chunkfleet_metadata::DriveType;

    fn drive(id: &str, capacity: u64, available: u64) -> Drive {
        let now = Utc::now();
        Drive {
            id: id.into(),
            name: id.into(),
            location: "dc1".into(),
            capacity_mb: capacity,
            available_mb: available,
            status: DriveStatus::Healthy,
            drive_type: DriveType::Ssd,
            is_backup: false,
            created_at: now,
            updated_at: now,
        }
    }

    fn chunk(id: &str, drive: &str, size: i64) -> DataChunk {
        let now = Utc::now();
        DataChunk {
            id: id.into(),
            name: id.into(),
            size_mb: size,
            drive_id: drive.into(),
            priority: 3,
            is_replicated: false,
            checksum: None,
            status: ChunkStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_noop_planner() {
        let snapshot = FleetSnapshot {
            drives: vec![drive("D1", 100, 0)],
            chunks: vec![chunk("C1", "D1", 100)],
            replicas: Vec::new(),
        };
        assert!(NoStructuralRebalance.plan(&snapshot, None).is_empty());
    }

    #[test]
    fn test_drains_overloaded_drive() {
        // D1 at 90%, D2 at 10%, threshold 75
        let snapshot = FleetSnapshot {
            drives: vec![drive("D1", 1000, 100), drive("D2", 1000, 900)],
            chunks: vec![
                chunk("C1", "D1", 500),
                chunk("C2", "D1", 300),
                chunk("C3", "D1", 100),
                chunk("C4", "D2", 100),
            ],
            replicas: Vec::new(),
        };

        let moves = UtilizationRebalance::default().plan(&snapshot, None);
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].chunk_id, "C1");
        assert_eq!(moves[0].target_drive_id, "D2");
    }

    #[test]
    fn test_skips_targets_holding_a_replica() {
        let snapshot = FleetSnapshot {
            drives: vec![drive("D1", 1000, 100), drive("D2", 1000, 900)],
            chunks: vec![chunk("C1", "D1", 200)],
            replicas: vec![Replica {
                id: "R1".into(),
                chunk_id: "C1".into(),
                drive_id: "D2".into(),
                status: chunkfleet_metadata::ReplicaStatus::Healthy,
                created_at: Utc::now(),
            }],
        };
        assert!(UtilizationRebalance::default().plan(&snapshot, None).is_empty());
    }

    #[test]
    fn test_respects_max_moves_and_target_threshold() {
        let snapshot = FleetSnapshot {
            drives: vec![drive("D1", 1000, 0), drive("D2", 1000, 1000)],
            chunks: (0..10).map(|i| chunk(&format!("C{}", i), "D1", 100)).collect(),
            replicas: Vec::new(),
        };

        let moves = UtilizationRebalance { max_moves: 2 }.plan(&snapshot, None);
        assert_eq!(moves.len(), 2);

        let moves = UtilizationRebalance { max_moves: 100 }.plan(&snapshot, None);
        // D1 needs to drop to 70%; three 100 MB moves get it there
        assert_eq!(moves.len(), 3);
    }
}
