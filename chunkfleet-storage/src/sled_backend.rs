//! Sled-based record store
//!
//! Persists the fleet catalog on disk. One sled tree per table, records
//! encoded with bincode. Inserts and updates go through compare-and-swap so
//! concurrent writers never lose an update.

use crate::backend::{Query, Record, RecordStore, StoreStats, Table};
use chunkfleet_core::{FleetError, Result};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

fn storage_err(e: sled::Error) -> FleetError {
    FleetError::Storage(e.to_string())
}

/// Sled-based record store
pub struct SledStore {
    db: sled::Db,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl SledStore {
    /// Open or create a store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        info!(path = ?path.as_ref(), "Opening Sled record store");

        let db = sled::open(path.as_ref())
            .map_err(|e| FleetError::Storage(format!("Failed to open Sled: {}", e)))?;

        Ok(Self::from_db(db))
    }

    /// Open an in-memory store (for testing)
    pub fn open_temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| FleetError::Storage(format!("Failed to open Sled: {}", e)))?;
        Ok(Self::from_db(db))
    }

    fn from_db(db: sled::Db) -> Self {
        Self {
            db,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        }
    }

    /// Flush pending writes to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush().map_err(storage_err)?;
        Ok(())
    }

    fn tree(&self, table: Table) -> Result<sled::Tree> {
        self.db.open_tree(table.name()).map_err(storage_err)
    }

    fn scan<R: Record>(&self, tree: &sled::Tree) -> Result<Vec<R>> {
        let mut records = Vec::new();
        for item in tree.iter() {
            let (_, bytes) = item.map_err(storage_err)?;
            records.push(bincode::deserialize::<R>(&bytes)?);
        }
        Ok(records)
    }
}

#[async_trait::async_trait]
impl RecordStore for SledStore {
    async fn get<R: Record>(&self, id: &str) -> Result<Option<R>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let tree = self.tree(R::TABLE)?;
        match tree.get(id.as_bytes()).map_err(storage_err)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn query<R: Record>(&self, query: Query<R>) -> Result<Vec<R>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let tree = self.tree(R::TABLE)?;
        Ok(query.apply(self.scan::<R>(&tree)?))
    }

    async fn insert<R: Record>(&self, record: R) -> Result<()> {
        let tree = self.tree(R::TABLE)?;
        let encoded = bincode::serialize(&record)?;

        tree.compare_and_swap(record.id().as_bytes(), None as Option<&[u8]>, Some(encoded))
            .map_err(storage_err)?
            .map_err(|_| {
                FleetError::Storage(format!(
                    "duplicate id {} in table {}",
                    record.id(),
                    R::TABLE
                ))
            })?;

        self.writes.fetch_add(1, Ordering::Relaxed);
        debug!(table = %R::TABLE, id = record.id(), "Inserted record");
        Ok(())
    }

    async fn update<R, F>(&self, id: &str, mut patch: F) -> Result<R>
    where
        R: Record,
        F: FnMut(&mut R) -> Result<()> + Send + 'static,
    {
        let tree = self.tree(R::TABLE)?;

        loop {
            let current = tree
                .get(id.as_bytes())
                .map_err(storage_err)?
                .ok_or_else(|| FleetError::not_found(R::TABLE.entity(), id))?;

            let mut record: R = bincode::deserialize(&current)?;
            patch(&mut record)?;
            let encoded = bincode::serialize(&record)?;

            let swapped = tree
                .compare_and_swap(id.as_bytes(), Some(&current), Some(encoded))
                .map_err(storage_err)?;

            match swapped {
                Ok(()) => {
                    self.writes.fetch_add(1, Ordering::Relaxed);
                    return Ok(record);
                }
                Err(_) => {
                    debug!(table = %R::TABLE, id, "Concurrent update, retrying");
                }
            }
        }
    }

    async fn delete<R: Record>(&self, id: &str) -> Result<R> {
        let tree = self.tree(R::TABLE)?;
        let bytes = tree
            .remove(id.as_bytes())
            .map_err(storage_err)?
            .ok_or_else(|| FleetError::not_found(R::TABLE.entity(), id))?;

        self.deletes.fetch_add(1, Ordering::Relaxed);
        Ok(bincode::deserialize(&bytes)?)
    }

    async fn delete_where<R: Record>(&self, query: Query<R>) -> Result<Vec<R>> {
        let tree = self.tree(R::TABLE)?;
        let mut removed = Vec::new();

        for record in self.scan::<R>(&tree)? {
            if !query.matches(&record) {
                continue;
            }
            if tree.remove(record.id().as_bytes()).map_err(storage_err)?.is_some() {
                removed.push(record);
            }
        }

        self.deletes
            .fetch_add(removed.len() as u64, Ordering::Relaxed);
        Ok(query.apply(removed))
    }

    async fn stats(&self) -> Result<StoreStats> {
        let mut rows = Vec::with_capacity(Table::ALL.len());
        for table in Table::ALL {
            rows.push((table, self.tree(table)?.len() as u64));
        }

        Ok(StoreStats {
            rows,
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        })
    }
}
