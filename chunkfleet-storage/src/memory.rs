//! In-memory record store
//!
//! Used for testing, simulation runs and the CLI's scratch mode. Not persistent.

use crate::backend::{Query, Record, RecordStore, StoreStats, Table};
use chunkfleet_core::{FleetError, Result};
use parking_lot::RwLock;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

type Rows = BTreeMap<String, Box<dyn Any + Send + Sync>>;

/// In-memory record store
pub struct MemoryStore {
    /// Rows keyed by table, then record id
    tables: RwLock<HashMap<Table, Rows>>,

    /// Operation counters
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        }
    }

    /// Drop every row of every table
    pub fn clear(&self) {
        self.tables.write().clear();
    }

    fn downcast<R: Record>(id: &str, value: &(dyn Any + Send + Sync)) -> Result<R> {
        value.downcast_ref::<R>().cloned().ok_or_else(|| {
            FleetError::Serialization(format!(
                "record {} in table {} has an unexpected type",
                id,
                R::TABLE
            ))
        })
    }

    fn get_sync<R: Record>(&self, id: &str) -> Result<Option<R>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let tables = self.tables.read();
        match tables.get(&R::TABLE).and_then(|rows| rows.get(id)) {
            Some(value) => Ok(Some(Self::downcast(id, value.as_ref())?)),
            None => Ok(None),
        }
    }

    fn query_sync<R: Record>(&self, query: &Query<R>) -> Result<Vec<R>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let tables = self.tables.read();
        let records = match tables.get(&R::TABLE) {
            Some(rows) => rows
                .iter()
                .map(|(id, value)| Self::downcast::<R>(id, value.as_ref()))
                .collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
        };
        Ok(query.apply(records))
    }

    fn insert_sync<R: Record>(&self, record: R) -> Result<()> {
        let mut tables = self.tables.write();
        let rows = tables.entry(R::TABLE).or_default();

        if rows.contains_key(record.id()) {
            return Err(FleetError::Storage(format!(
                "duplicate id {} in table {}",
                record.id(),
                R::TABLE
            )));
        }

        rows.insert(record.id().to_string(), Box::new(record));
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn update_sync<R, F>(&self, id: &str, mut patch: F) -> Result<R>
    where
        R: Record,
        F: FnMut(&mut R) -> Result<()>,
    {
        let mut tables = self.tables.write();
        let slot = tables
            .get_mut(&R::TABLE)
            .and_then(|rows| rows.get_mut(id))
            .ok_or_else(|| FleetError::not_found(R::TABLE.entity(), id))?;

        // Patch a copy so a failed patch leaves the stored row untouched
        let mut record: R = Self::downcast(id, slot.as_ref())?;
        patch(&mut record)?;

        *slot = Box::new(record.clone());
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(record)
    }

    fn delete_sync<R: Record>(&self, id: &str) -> Result<R> {
        let mut tables = self.tables.write();
        let value = tables
            .get_mut(&R::TABLE)
            .and_then(|rows| rows.remove(id))
            .ok_or_else(|| FleetError::not_found(R::TABLE.entity(), id))?;

        self.deletes.fetch_add(1, Ordering::Relaxed);
        Self::downcast(id, value.as_ref())
    }

    fn delete_where_sync<R: Record>(&self, query: &Query<R>) -> Result<Vec<R>> {
        let mut tables = self.tables.write();
        let Some(rows) = tables.get_mut(&R::TABLE) else {
            return Ok(Vec::new());
        };

        let mut matched = Vec::new();
        for (id, value) in rows.iter() {
            let record = Self::downcast::<R>(id, value.as_ref())?;
            if query.matches(&record) {
                matched.push(record);
            }
        }

        for record in &matched {
            rows.remove(record.id());
        }
        self.deletes
            .fetch_add(matched.len() as u64, Ordering::Relaxed);

        Ok(query.apply(matched))
    }

    fn stats_sync(&self) -> StoreStats {
        let tables = self.tables.read();
        StoreStats {
            rows: Table::ALL
                .iter()
                .map(|t| (*t, tables.get(t).map(|r| r.len() as u64).unwrap_or(0)))
                .collect(),
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl RecordStore for MemoryStore {
    async fn get<R: Record>(&self, id: &str) -> Result<Option<R>> {
        self.get_sync(id)
    }

    async fn query<R: Record>(&self, query: Query<R>) -> Result<Vec<R>> {
        self.query_sync(&query)
    }

    async fn insert<R: Record>(&self, record: R) -> Result<()> {
        self.insert_sync(record)
    }

    async fn update<R, F>(&self, id: &str, patch: F) -> Result<R>
    where
        R: Record,
        F: FnMut(&mut R) -> Result<()> + Send + 'static,
    {
        self.update_sync(id, patch)
    }

    async fn delete<R: Record>(&self, id: &str) -> Result<R> {
        self.delete_sync(id)
    }

    async fn delete_where<R: Record>(&self, query: Query<R>) -> Result<Vec<R>> {
        self.delete_where_sync(&query)
    }

    async fn stats(&self) -> Result<StoreStats> {
        Ok(self.stats_sync())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Slot {
        id: String,
        free: u64,
    }

    impl Record for Slot {
        const TABLE: Table = Table::Drives;

        fn id(&self) -> &str {
            &self.id
        }
    }

    fn slot(id: &str, free: u64) -> Slot {
        Slot {
            id: id.to_string(),
            free,
        }
    }

    #[tokio::test]
    async fn test_insert_get() {
        let store = MemoryStore::new();
        store.insert(slot("a", 10)).await.unwrap();

        let found: Option<Slot> = store.get("a").await.unwrap();
        assert_eq!(found, Some(slot("a", 10)));

        let missing: Option<Slot> = store.get("b").await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let store = MemoryStore::new();
        store.insert(slot("a", 10)).await.unwrap();
        assert!(store.insert(slot("a", 20)).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_patch_leaves_row() {
        let store = MemoryStore::new();
        store.insert(slot("a", 10)).await.unwrap();

        let result = store
            .update::<Slot, _>("a", |s| {
                s.free = 0;
                Err(FleetError::InvalidState("nope".into()))
            })
            .await;
        assert!(result.is_err());

        let stored: Slot = store.get("a").await.unwrap().unwrap();
        assert_eq!(stored.free, 10);
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let store = MemoryStore::new();
        let err = store
            .update::<Slot, _>("ghost", |_| Ok(()))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_delete_where() {
        let store = MemoryStore::new();
        for (id, free) in [("a", 1), ("b", 5), ("c", 9)] {
            store.insert(slot(id, free)).await.unwrap();
        }

        let removed = store
            .delete_where(Query::<Slot>::all().filter(|s| s.free > 3))
            .await
            .unwrap();
        assert_eq!(removed.len(), 2);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.rows_in(Table::Drives), 1);
        assert_eq!(stats.deletes, 2);
    }

    #[tokio::test]
    async fn test_concurrent_updates_are_serialized() {
        let store = std::sync::Arc::new(MemoryStore::new());
        store.insert(slot("a", 100)).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..50 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .update::<Slot, _>("a", |s| {
                        if s.free < 3 {
                            return Err(FleetError::InvalidState("full".into()));
                        }
                        s.free -= 3;
                        Ok(())
                    })
                    .await
            }));
        }

        let mut ok = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                ok += 1;
            }
        }

        let stored: Slot = store.get("a").await.unwrap().unwrap();
        assert_eq!(ok, 33);
        assert_eq!(stored.free, 1);
    }
}
