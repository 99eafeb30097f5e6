//! Fleet scenarios through the public service API
//!
//! Run with: cargo test -p chunkfleet-rebalancer --test fleet_scenarios

use chunkfleet_core::FleetError;
use chunkfleet_metadata::{
    ChunkStatus, Drive, DriveStatus, LogStatus, NewChunk, NewDrive, NewMetric, NewPolicy,
};
use chunkfleet_rebalancer::{
    FailureKind, FleetService, ReplicationWarning, MANUAL_RELOCATION_REASON, RECOVERY_REASON,
};
use chunkfleet_storage::{MemoryStore, RecordStore, SledStore};
use std::collections::HashSet;
use std::sync::Arc;
use tempfile::TempDir;

fn memory_service() -> FleetService<MemoryStore> {
    FleetService::new(Arc::new(MemoryStore::new()))
}

async fn add_drive<S: RecordStore>(
    service: &FleetService<S>,
    name: &str,
    capacity_mb: u64,
    available_mb: u64,
    backup: bool,
) -> Drive {
    let mut new = NewDrive::new(name, "rack-1", capacity_mb).with_available(available_mb);
    if backup {
        new = new.backup();
    }
    service.register_drive(new).await.unwrap()
}

async fn activate<S: RecordStore>(service: &FleetService<S>, min_replicas: u32) {
    let policy = service
        .create_policy(NewPolicy::new("default").with_min_replicas(min_replicas))
        .await
        .unwrap();
    service.activate_policy(&policy.id).await.unwrap();
}

async fn available<S: RecordStore>(service: &FleetService<S>, drive: &Drive) -> u64 {
    service.get_drive(&drive.id).await.unwrap().available_mb
}

#[tokio::test]
async fn test_primary_goes_to_least_utilized_drive() {
    let service = memory_service();
    add_drive(&service, "A", 1000, 200, false).await;
    let b = add_drive(&service, "B", 1000, 800, false).await;
    add_drive(&service, "C", 1000, 500, false).await;

    let placement = service
        .create_chunk(NewChunk::new("c", 10).without_replication())
        .await
        .unwrap();

    assert_eq!(placement.chunk.drive_id, b.id);
    assert_eq!(available(&service, &b).await, 790);
}

#[tokio::test]
async fn test_replicas_never_share_a_drive() {
    let service = memory_service();
    let primary = add_drive(&service, "P", 1000, 1000, false).await;
    for name in ["R1", "R2", "R3"] {
        add_drive(&service, name, 1000, 1000, true).await;
    }
    activate(&service, 2).await;

    let placement = service
        .create_chunk(NewChunk::new("c", 50).on_drive(&primary.id))
        .await
        .unwrap();
    assert_eq!(placement.replicas.len(), 2);
    assert!(placement.chunk.is_replicated);

    let extra = service
        .create_limited_replicas(&placement.chunk.id, 5)
        .await
        .unwrap();
    assert_eq!(extra.requested, 5);
    assert_eq!(extra.created, 1);

    let replicas = service.replicas_of(&placement.chunk.id).await.unwrap();
    let drives: HashSet<_> = replicas.iter().map(|r| r.drive_id.clone()).collect();
    assert_eq!(drives.len(), 3);
    assert!(!drives.contains(&primary.id));
}

#[tokio::test]
async fn test_only_one_policy_is_active() {
    let service = memory_service();
    let mut ids = Vec::new();
    for name in ["p1", "p2", "p3"] {
        ids.push(service.create_policy(NewPolicy::new(name)).await.unwrap().id);
    }
    for id in &ids {
        service.activate_policy(id).await.unwrap();
    }

    let active: Vec<_> = service
        .list_policies()
        .await
        .unwrap()
        .into_iter()
        .filter(|p| p.is_active)
        .collect();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, ids[2]);
    assert_eq!(service.active_policy().await.unwrap().unwrap().id, ids[2]);
}

#[tokio::test]
async fn test_partial_replication_in_two_steps() {
    let service = memory_service();
    add_drive(&service, "P", 1000, 1000, false).await;
    let backup = add_drive(&service, "R", 1000, 1000, true).await;
    activate(&service, 3).await;

    let placement = service.create_chunk(NewChunk::new("c", 100)).await.unwrap();
    assert!(placement.replicas.is_empty());
    assert!(!placement.chunk.is_replicated);
    assert_eq!(
        placement.warning,
        Some(ReplicationWarning::InsufficientBackupDrives {
            available: 1,
            required: 3
        })
    );
    assert_eq!(available(&service, &backup).await, 1000);

    let limited = service
        .create_limited_replicas(&placement.chunk.id, 3)
        .await
        .unwrap();
    assert_eq!(limited.requested, 3);
    assert_eq!(limited.created, 1);
    assert_eq!(limited.replicas[0].drive_id, backup.id);
    assert_eq!(available(&service, &backup).await, 900);

    let chunk = service.get_chunk(&placement.chunk.id).await.unwrap();
    assert!(chunk.is_replicated);
}

#[tokio::test]
async fn test_manual_relocation() {
    let service = memory_service();
    let a = add_drive(&service, "A", 1000, 1000, false).await;
    let b = add_drive(&service, "B", 1000, 1000, false).await;

    let placement = service
        .create_chunk(NewChunk::new("c", 100).on_drive(&a.id).without_replication())
        .await
        .unwrap();

    let log = service
        .relocate_chunk(&placement.chunk.id, &b.id, None)
        .await
        .unwrap();
    assert_eq!(log.status, LogStatus::Completed);
    assert_eq!(log.reason, MANUAL_RELOCATION_REASON);
    assert_eq!(log.source_drive_id, a.id);

    assert_eq!(available(&service, &a).await, 1000);
    assert_eq!(available(&service, &b).await, 900);
    let chunk = service.get_chunk(&placement.chunk.id).await.unwrap();
    assert_eq!(chunk.drive_id, b.id);
    assert_eq!(chunk.status, ChunkStatus::Active);
}

#[tokio::test]
async fn test_corruption_and_recovery() {
    let service = memory_service();
    let primary = add_drive(&service, "P", 1000, 1000, false).await;
    let backup = add_drive(&service, "R", 1000, 1000, true).await;
    activate(&service, 1).await;

    let placement = service
        .create_chunk(NewChunk::new("c", 100).on_drive(&primary.id))
        .await
        .unwrap();
    let chunk_id = placement.chunk.id.clone();

    let corruption = service.simulate_chunk_corruption(&chunk_id).await.unwrap();
    assert_eq!(corruption.chunk.status, ChunkStatus::Corrupted);
    assert!(corruption.recovery_possible);

    let log = service.recover_chunk(&chunk_id).await.unwrap();
    assert_eq!(log.reason, RECOVERY_REASON);
    assert_eq!(log.status, LogStatus::Completed);
    assert_eq!(log.source_drive_id, backup.id);
    assert_eq!(log.target_drive_id.as_deref(), Some(primary.id.as_str()));
    assert_eq!(
        service.get_chunk(&chunk_id).await.unwrap().status,
        ChunkStatus::Active
    );

    // An ACTIVE chunk is not recoverable
    assert!(matches!(
        service.recover_chunk(&chunk_id).await,
        Err(FleetError::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_recovery_needs_a_healthy_replica_drive() {
    let service = memory_service();
    let primary = add_drive(&service, "P", 1000, 1000, false).await;
    let backup = add_drive(&service, "R", 1000, 1000, true).await;
    activate(&service, 1).await;

    let placement = service
        .create_chunk(NewChunk::new("c", 100).on_drive(&primary.id))
        .await
        .unwrap();
    service
        .set_drive_status(&backup.id, DriveStatus::Failed)
        .await
        .unwrap();
    service
        .simulate_chunk_corruption(&placement.chunk.id)
        .await
        .unwrap();

    assert!(matches!(
        service.recover_chunk(&placement.chunk.id).await,
        Err(FleetError::NoHealthyReplica(_))
    ));
}

#[tokio::test]
async fn test_delete_twice_leaves_space_alone() {
    let service = memory_service();
    let primary = add_drive(&service, "P", 1000, 1000, false).await;
    let backup = add_drive(&service, "R", 1000, 1000, true).await;
    activate(&service, 1).await;

    let placement = service
        .create_chunk(NewChunk::new("c", 100).on_drive(&primary.id))
        .await
        .unwrap();
    assert_eq!(available(&service, &backup).await, 900);

    assert_eq!(service.delete_chunk(&placement.chunk.id).await.unwrap(), 100);
    assert_eq!(available(&service, &primary).await, 1000);
    assert_eq!(available(&service, &backup).await, 1000);

    assert!(matches!(
        service.delete_chunk(&placement.chunk.id).await,
        Err(FleetError::NotFound { .. })
    ));
    assert_eq!(available(&service, &primary).await, 1000);
    assert_eq!(available(&service, &backup).await, 1000);
}

#[tokio::test]
async fn test_failed_drive_is_drained() {
    let service = memory_service();
    let a = add_drive(&service, "A", 1000, 1000, false).await;
    add_drive(&service, "B", 1000, 1000, false).await;
    add_drive(&service, "C", 1000, 1000, false).await;

    for i in 0..3 {
        service
            .create_chunk(
                NewChunk::new(format!("c{}", i), 100)
                    .on_drive(&a.id)
                    .without_replication(),
            )
            .await
            .unwrap();
    }

    let outcome = service
        .simulate_drive_failure(&a.id, FailureKind::Complete)
        .await
        .unwrap();
    assert!(outcome.recovery_started);
    assert_eq!(outcome.change.current, DriveStatus::Failed);

    let report = outcome.redistribution.unwrap();
    assert_eq!(report.relocated.len(), 3);
    assert!(report.stranded.is_empty());
    assert_eq!(available(&service, &a).await, 1000);

    let on_a = service
        .list_chunks()
        .await
        .unwrap()
        .into_iter()
        .filter(|c| c.drive_id == a.id)
        .count();
    assert_eq!(on_a, 0);

    // Failing an already failed drive is rejected
    assert!(matches!(
        service.simulate_drive_failure(&a.id, FailureKind::Complete).await,
        Err(FleetError::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_stranded_chunk_gets_failed_log() {
    let service = memory_service();
    let a = add_drive(&service, "A", 1000, 1000, false).await;
    add_drive(&service, "B", 500, 500, false).await;

    let placement = service
        .create_chunk(NewChunk::new("big", 600).on_drive(&a.id).without_replication())
        .await
        .unwrap();

    let outcome = service
        .simulate_drive_failure(&a.id, FailureKind::Partial)
        .await
        .unwrap();
    let report = outcome.redistribution.unwrap();
    assert_eq!(report.stranded, vec![placement.chunk.id.clone()]);
    assert!(report.relocated.is_empty());

    let logs = service.list_logs().await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, LogStatus::Failed);
    assert_eq!(logs[0].target_drive_id, None);

    let chunk = service.get_chunk(&placement.chunk.id).await.unwrap();
    assert_eq!(chunk.drive_id, a.id);
    assert_eq!(chunk.status, ChunkStatus::Active);
}

#[tokio::test]
async fn test_metrics_drive_status_transitions() {
    let service = memory_service();
    let a = add_drive(&service, "A", 1000, 1000, false).await;
    let b = add_drive(&service, "B", 1000, 1000, false).await;
    let placement = service
        .create_chunk(NewChunk::new("c", 100).on_drive(&a.id).without_replication())
        .await
        .unwrap();

    let ingest = service
        .ingest_metric(NewMetric::new(&a.id).with_error_rate(0.07).with_temperature(40.0))
        .await
        .unwrap();
    assert_eq!(
        ingest.outcome.transition.map(|t| t.current),
        Some(DriveStatus::Degraded)
    );
    assert!(ingest.redistribution.is_none());

    let ingest = service
        .ingest_metric(NewMetric::new(&a.id).with_error_rate(0.01).with_temperature(90.0))
        .await
        .unwrap();
    assert!(ingest.outcome.became_failing());
    let report = ingest.redistribution.unwrap();
    assert_eq!(report.relocated.len(), 1);

    let chunk = service.get_chunk(&placement.chunk.id).await.unwrap();
    assert_eq!(chunk.drive_id, b.id);
    assert_eq!(service.get_drive(&a.id).await.unwrap().status, DriveStatus::Failing);
}

#[tokio::test]
async fn test_catalog_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let chunk_id;
    let drive_id;

    {
        let store = Arc::new(SledStore::open(dir.path()).unwrap());
        let service = FleetService::new(store.clone());
        let drive = add_drive(&service, "A", 1000, 1000, false).await;
        drive_id = drive.id.clone();
        chunk_id = service
            .create_chunk(NewChunk::new("persisted", 250).without_replication())
            .await
            .unwrap()
            .chunk
            .id;
        store.flush().unwrap();
    }

    let service = FleetService::new(Arc::new(SledStore::open(dir.path()).unwrap()));
    let chunk = service.get_chunk(&chunk_id).await.unwrap();
    assert_eq!(chunk.name, "persisted");
    assert_eq!(chunk.drive_id, drive_id);
    assert_eq!(service.get_drive(&drive_id).await.unwrap().available_mb, 750);
}
