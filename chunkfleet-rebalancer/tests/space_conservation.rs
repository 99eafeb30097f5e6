//! Property tests: drive space always matches the bytes placed on it, and
//! no chunk keeps two copies on one drive
//!
//! Run with: cargo test -p chunkfleet-rebalancer --test space_conservation

use chunkfleet_metadata::{NewChunk, NewDrive, NewPolicy};
use chunkfleet_rebalancer::FleetService;
use chunkfleet_storage::MemoryStore;
use proptest::prelude::*;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Clone)]
enum Op {
    Create { size_mb: u64, replicate: bool },
    Delete { index: usize },
    Relocate { index: usize, target: usize },
    Replicate { index: usize, count: u32 },
    Rebalance,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (1u64..400, any::<bool>()).prop_map(|(size_mb, replicate)| Op::Create { size_mb, replicate }),
        1 => any::<usize>().prop_map(|index| Op::Delete { index }),
        1 => (any::<usize>(), any::<usize>()).prop_map(|(index, target)| Op::Relocate { index, target }),
        1 => (any::<usize>(), 1u32..4).prop_map(|(index, count)| Op::Replicate { index, count }),
        1 => Just(Op::Rebalance),
    ]
}

/// Apply `ops` and check used space per drive after every step
async fn run_ops(ops: Vec<Op>, min_replicas: u32) -> Result<(), TestCaseError> {
    let service = FleetService::new(Arc::new(MemoryStore::new()));

    let mut primaries = Vec::new();
    for i in 0..3 {
        let drive = service
            .register_drive(NewDrive::new(format!("P{}", i), "rack-1", 1000))
            .await
            .map_err(|e| TestCaseError::fail(e.to_string()))?;
        primaries.push(drive.id);
    }
    for i in 0..2 {
        service
            .register_drive(NewDrive::new(format!("R{}", i), "rack-2", 800).backup())
            .await
            .map_err(|e| TestCaseError::fail(e.to_string()))?;
    }
    let policy = service
        .create_policy(NewPolicy::new("p").with_min_replicas(min_replicas))
        .await
        .map_err(|e| TestCaseError::fail(e.to_string()))?;
    service
        .activate_policy(&policy.id)
        .await
        .map_err(|e| TestCaseError::fail(e.to_string()))?;

    let mut live: Vec<String> = Vec::new();

    for op in ops {
        match op {
            Op::Create { size_mb, replicate } => {
                let mut new = NewChunk::new("prop", size_mb);
                new.replicate = replicate;
                // Running out of space is an expected outcome
                if let Ok(placement) = service.create_chunk(new).await {
                    live.push(placement.chunk.id);
                }
            }
            Op::Delete { index } => {
                if !live.is_empty() {
                    let id = live.remove(index % live.len());
                    service
                        .delete_chunk(&id)
                        .await
                        .map_err(|e| TestCaseError::fail(e.to_string()))?;
                }
            }
            Op::Relocate { index, target } => {
                if !live.is_empty() {
                    let id = &live[index % live.len()];
                    let target = &primaries[target % primaries.len()];
                    let _ = service.relocate_chunk(id, target, None).await;
                }
            }
            Op::Replicate { index, count } => {
                if !live.is_empty() {
                    let id = &live[index % live.len()];
                    service
                        .create_limited_replicas(id, count)
                        .await
                        .map_err(|e| TestCaseError::fail(e.to_string()))?;
                }
            }
            Op::Rebalance => {
                service
                    .trigger_rebalance()
                    .await
                    .map_err(|e| TestCaseError::fail(e.to_string()))?;
            }
        }

        check_conservation(&service).await?;
    }

    Ok(())
}

async fn check_conservation(service: &FleetService<MemoryStore>) -> Result<(), TestCaseError> {
    let fail = |e: chunkfleet_core::FleetError| TestCaseError::fail(e.to_string());

    let mut placed: HashMap<String, u64> = HashMap::new();
    for chunk in service.list_chunks().await.map_err(fail)? {
        let size = chunk.size_mb as u64;
        *placed.entry(chunk.drive_id.clone()).or_default() += size;

        let replicas = service.replicas_of(&chunk.id).await.map_err(fail)?;
        let distinct: HashSet<&str> = replicas.iter().map(|r| r.drive_id.as_str()).collect();
        prop_assert_eq!(distinct.len(), replicas.len(), "chunk {} shares a replica drive", chunk.id);

        for replica in replicas {
            prop_assert_ne!(&replica.drive_id, &chunk.drive_id);
            *placed.entry(replica.drive_id).or_default() += size;
        }
    }

    for drive in service.list_drives().await.map_err(fail)? {
        prop_assert!(drive.available_mb <= drive.capacity_mb);
        let expected = placed.get(&drive.id).copied().unwrap_or(0);
        prop_assert_eq!(drive.capacity_mb - drive.available_mb, expected, "drive {}", drive.name);
    }

    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_space_is_conserved(
        ops in prop::collection::vec(op_strategy(), 1..40),
        min_replicas in 1u32..3,
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(run_ops(ops, min_replicas))?;
    }
}
