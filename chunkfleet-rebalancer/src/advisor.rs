//! Optimization recommendations
//!
//! Reads a [`FleetSnapshot`] and suggests operator actions. Nothing here
//! changes the catalog.

use crate::structural::FleetSnapshot;
use chrono::{DateTime, Utc};
use chunkfleet_core::DEFAULT_REBALANCE_THRESHOLD;
use chunkfleet_metadata::health::CRITICAL_PRIORITY;
use chunkfleet_metadata::{ChunkStatus, DistributionPolicy, Drive, DriveStatus};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

/// Healthy primaries below this utilization are consolidation candidates
pub const UNDERUTILIZED_PERCENT: f64 = 30.0;

/// Location utilization above this is imbalanced
pub const LOCATION_HIGH_PERCENT: f64 = 75.0;

/// Location utilization below this is imbalanced
pub const LOCATION_LOW_PERCENT: f64 = 25.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecommendationKind {
    Rebalance,
    Protect,
    Consolidate,
    LocationBalance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecommendationPriority {
    Medium,
    High,
}

/// Drive, chunk or location a recommendation points at
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AffectedItem {
    Drive {
        drive_id: String,
        name: String,
        utilization_percent: f64,
        chunk_count: usize,
    },
    Chunk {
        chunk_id: String,
        name: String,
        size_mb: i64,
        priority: u8,
        drive_id: String,
        drive_status: Option<DriveStatus>,
    },
    Location {
        location: String,
        utilization_percent: f64,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct Recommendation {
    pub kind: RecommendationKind,
    pub priority: RecommendationPriority,
    pub description: String,
    pub reason: String,
    pub affected_items: Vec<AffectedItem>,
}

/// Recommendations with the time they were computed
#[derive(Debug, Clone, Serialize)]
pub struct OptimizationReport {
    pub recommendations: Vec<Recommendation>,
    pub generated_at: DateTime<Utc>,
}

impl OptimizationReport {
    pub fn is_empty(&self) -> bool {
        self.recommendations.is_empty()
    }

    pub fn summary(&self) -> String {
        if self.is_empty() {
            return "no recommendations".to_string();
        }
        self.recommendations
            .iter()
            .map(|r| format!("{:?}({})", r.kind, r.affected_items.len()))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Build recommendations for a snapshot
///
/// Order is fixed: REBALANCE, PROTECT, CONSOLIDATE, LOCATION_BALANCE. A kind
/// with no affected items is left out.
pub fn recommend(
    snapshot: &FleetSnapshot,
    policy: Option<&DistributionPolicy>,
) -> OptimizationReport {
    let threshold = policy
        .map(|p| p.rebalance_threshold)
        .unwrap_or(DEFAULT_REBALANCE_THRESHOLD) as f64;

    let mut chunk_counts: HashMap<&str, usize> = HashMap::new();
    for chunk in &snapshot.chunks {
        *chunk_counts.entry(chunk.drive_id.as_str()).or_default() += 1;
    }
    let drive_item = |d: &Drive| AffectedItem::Drive {
        drive_id: d.id.clone(),
        name: d.name.clone(),
        utilization_percent: round2(d.utilization_percent()),
        chunk_count: chunk_counts.get(d.id.as_str()).copied().unwrap_or(0),
    };

    let healthy: Vec<&Drive> = snapshot
        .drives
        .iter()
        .filter(|d| d.status == DriveStatus::Healthy && d.capacity_mb > 0)
        .collect();

    let mut recommendations = Vec::new();

    let mut overloaded: Vec<&Drive> = healthy
        .iter()
        .copied()
        .filter(|d| d.utilization_percent() > threshold)
        .collect();
    overloaded.sort_by(|a, b| b.utilization().total_cmp(&a.utilization()).then_with(|| a.id.cmp(&b.id)));
    if !overloaded.is_empty() {
        recommendations.push(Recommendation {
            kind: RecommendationKind::Rebalance,
            priority: RecommendationPriority::High,
            description: "Rebalance data from overloaded drives".to_string(),
            reason: format!(
                "{} drives are over the {}% utilization threshold",
                overloaded.len(),
                threshold
            ),
            affected_items: overloaded.into_iter().map(drive_item).collect(),
        });
    }

    let statuses: HashMap<&str, DriveStatus> = snapshot
        .drives
        .iter()
        .map(|d| (d.id.as_str(), d.status))
        .collect();
    let mut unprotected: Vec<_> = snapshot
        .chunks
        .iter()
        .filter(|c| {
            c.priority >= CRITICAL_PRIORITY && !c.is_replicated && c.status == ChunkStatus::Active
        })
        .collect();
    unprotected.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| b.size_mb.cmp(&a.size_mb))
            .then_with(|| a.id.cmp(&b.id))
    });
    if !unprotected.is_empty() {
        recommendations.push(Recommendation {
            kind: RecommendationKind::Protect,
            priority: RecommendationPriority::High,
            description: "Create replicas for high-priority unprotected data".to_string(),
            reason: format!("{} high-priority chunks have no replicas", unprotected.len()),
            affected_items: unprotected
                .into_iter()
                .map(|c| AffectedItem::Chunk {
                    chunk_id: c.id.clone(),
                    name: c.name.clone(),
                    size_mb: c.size_mb,
                    priority: c.priority,
                    drive_id: c.drive_id.clone(),
                    drive_status: statuses.get(c.drive_id.as_str()).copied(),
                })
                .collect(),
        });
    }

    let mut underutilized: Vec<&Drive> = healthy
        .iter()
        .copied()
        .filter(|d| !d.is_backup && d.utilization_percent() < UNDERUTILIZED_PERCENT)
        .collect();
    underutilized.sort_by(|a, b| a.utilization().total_cmp(&b.utilization()).then_with(|| a.id.cmp(&b.id)));
    if !underutilized.is_empty() {
        recommendations.push(Recommendation {
            kind: RecommendationKind::Consolidate,
            priority: RecommendationPriority::Medium,
            description: "Consolidate data to reduce underutilized drives".to_string(),
            reason: format!(
                "{} drives are significantly underutilized",
                underutilized.len()
            ),
            affected_items: underutilized.into_iter().map(drive_item).collect(),
        });
    }

    let imbalanced = imbalanced_locations(&snapshot.drives);
    if !imbalanced.is_empty() {
        recommendations.push(Recommendation {
            kind: RecommendationKind::LocationBalance,
            priority: RecommendationPriority::Medium,
            description: "Balance data across different locations".to_string(),
            reason: "Data distribution across locations is imbalanced".to_string(),
            affected_items: imbalanced,
        });
    }

    OptimizationReport {
        recommendations,
        generated_at: Utc::now(),
    }
}

fn imbalanced_locations(drives: &[Drive]) -> Vec<AffectedItem> {
    // location -> (capacity, used)
    let mut totals: BTreeMap<&str, (u64, u64)> = BTreeMap::new();
    for drive in drives {
        let entry = totals.entry(drive.location.as_str()).or_default();
        entry.0 += drive.capacity_mb;
        entry.1 += drive.used_mb();
    }

    totals
        .into_iter()
        .filter(|(_, (capacity, _))| *capacity > 0)
        .map(|(location, (capacity, used))| {
            (location, round2(used as f64 * 100.0 / capacity as f64))
        })
        .filter(|(_, percent)| *percent > LOCATION_HIGH_PERCENT || *percent < LOCATION_LOW_PERCENT)
        .map(|(location, utilization_percent)| AffectedItem::Location {
            location: location.to_string(),
            utilization_percent,
        })
        .collect()
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
