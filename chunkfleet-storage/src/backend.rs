//! Record store trait
//!
//! Defines the persistence collaborator the placement core talks to:
//! typed records grouped in tables, structured queries, and atomic
//! conditional updates.

use chunkfleet_core::{EntityKind, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;

/// Logical tables of the fleet catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Drives,
    Chunks,
    Replicas,
    Policies,
    RedistributionLogs,
    DriveMetrics,
}

impl Table {
    pub const ALL: [Table; 6] = [
        Table::Drives,
        Table::Chunks,
        Table::Replicas,
        Table::Policies,
        Table::RedistributionLogs,
        Table::DriveMetrics,
    ];

    /// Stable table name (also used as the sled tree name)
    pub fn name(&self) -> &'static str {
        match self {
            Self::Drives => "drives",
            Self::Chunks => "data_chunks",
            Self::Replicas => "chunk_replicas",
            Self::Policies => "distribution_policies",
            Self::RedistributionLogs => "redistribution_logs",
            Self::DriveMetrics => "drive_metrics",
        }
    }

    /// Entity kind stored in this table
    pub fn entity(&self) -> EntityKind {
        match self {
            Self::Drives => EntityKind::Drive,
            Self::Chunks => EntityKind::Chunk,
            Self::Replicas => EntityKind::Replica,
            Self::Policies => EntityKind::Policy,
            Self::RedistributionLogs => EntityKind::RedistributionLog,
            Self::DriveMetrics => EntityKind::Metric,
        }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A row stored in one of the fleet tables
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const TABLE: Table;

    fn id(&self) -> &str;
}

type Predicate<R> = Box<dyn Fn(&R) -> bool + Send + Sync>;
type Comparator<R> = Box<dyn Fn(&R, &R) -> Ordering + Send + Sync>;

/// Structured query over one table
///
/// Results are always ordered by id first, so a custom ordering falls back
/// to id order for ties.
pub struct Query<R> {
    predicates: Vec<Predicate<R>>,
    excluded: HashSet<String>,
    order: Option<Comparator<R>>,
    limit: Option<usize>,
}

impl<R: Record> Query<R> {
    /// Match every record of the table
    pub fn all() -> Self {
        Self {
            predicates: Vec::new(),
            excluded: HashSet::new(),
            order: None,
            limit: None,
        }
    }

    /// Add a predicate; all predicates must hold
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&R) -> bool + Send + Sync + 'static,
    {
        self.predicates.push(Box::new(predicate));
        self
    }

    /// Exclude records whose id is in the given set
    pub fn exclude_ids<I, T>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.excluded.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Order results (stable, ties keep id order)
    pub fn order_by<F>(mut self, compare: F) -> Self
    where
        F: Fn(&R, &R) -> Ordering + Send + Sync + 'static,
    {
        self.order = Some(Box::new(compare));
        self
    }

    /// Keep at most `n` results
    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// Check a single record against the filters
    pub fn matches(&self, record: &R) -> bool {
        !self.excluded.contains(record.id()) && self.predicates.iter().all(|p| p(record))
    }

    /// Filter, order and truncate a batch of records
    pub fn apply(&self, records: impl IntoIterator<Item = R>) -> Vec<R> {
        let mut matched: Vec<R> = records.into_iter().filter(|r| self.matches(r)).collect();

        matched.sort_by(|a, b| a.id().cmp(b.id()));
        if let Some(order) = &self.order {
            matched.sort_by(|a, b| order(a, b));
        }
        if let Some(limit) = self.limit {
            matched.truncate(limit);
        }

        matched
    }
}

impl<R: Record> Default for Query<R> {
    fn default() -> Self {
        Self::all()
    }
}

/// Store statistics
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    /// Row counts per table
    pub rows: Vec<(Table, u64)>,

    /// Number of read operations
    pub reads: u64,

    /// Number of write operations (inserts and updates)
    pub writes: u64,

    /// Number of delete operations
    pub deletes: u64,
}

impl StoreStats {
    /// Row count for one table
    pub fn rows_in(&self, table: Table) -> u64 {
        self.rows
            .iter()
            .find(|(t, _)| *t == table)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }
}

/// Async record store
///
/// All implementations must be Send + Sync for use in async contexts.
/// `update` is the only way to mutate a stored record and must apply the
/// patch atomically: either the patched record is committed or, when the
/// patch returns an error, the stored record is left untouched.
#[async_trait::async_trait]
pub trait RecordStore: Send + Sync {
    /// Fetch one record by id
    async fn get<R: Record>(&self, id: &str) -> Result<Option<R>>;

    /// Fetch every record matching the query
    async fn query<R: Record>(&self, query: Query<R>) -> Result<Vec<R>>;

    /// Count records matching the query
    async fn count<R: Record>(&self, query: Query<R>) -> Result<usize> {
        Ok(self.query(query).await?.len())
    }

    /// Insert a new record; fails if the id is already taken
    async fn insert<R: Record>(&self, record: R) -> Result<()>;

    /// Atomically patch a record and return the committed value
    async fn update<R, F>(&self, id: &str, patch: F) -> Result<R>
    where
        R: Record,
        F: FnMut(&mut R) -> Result<()> + Send + 'static;

    /// Delete a record, returning it
    async fn delete<R: Record>(&self, id: &str) -> Result<R>;

    /// Delete every record matching the query, returning them
    async fn delete_where<R: Record>(&self, query: Query<R>) -> Result<Vec<R>>;

    /// Get store statistics
    async fn stats(&self) -> Result<StoreStats>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Row {
        id: String,
        weight: u32,
    }

    impl Record for Row {
        const TABLE: Table = Table::Drives;

        fn id(&self) -> &str {
            &self.id
        }
    }

    fn rows() -> Vec<Row> {
        vec![
            Row { id: "c".into(), weight: 1 },
            Row { id: "a".into(), weight: 2 },
            Row { id: "b".into(), weight: 1 },
            Row { id: "d".into(), weight: 5 },
        ]
    }

    fn ids(rows: &[Row]) -> Vec<&str> {
        rows.iter().map(|r| r.id.as_str()).collect()
    }

    #[test]
    fn test_default_order_is_by_id() {
        let result = Query::<Row>::all().apply(rows());
        assert_eq!(ids(&result), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_custom_order_breaks_ties_by_id() {
        let result = Query::<Row>::all()
            .order_by(|a, b| a.weight.cmp(&b.weight))
            .apply(rows());
        assert_eq!(ids(&result), vec!["b", "c", "a", "d"]);
    }

    #[test]
    fn test_filter_exclude_and_limit() {
        let result = Query::<Row>::all()
            .filter(|r| r.weight < 5)
            .exclude_ids(["b"])
            .limit(1)
            .apply(rows());
        assert_eq!(ids(&result), vec!["a"]);
    }

    #[test]
    fn test_table_entity_mapping() {
        assert_eq!(Table::Chunks.entity(), EntityKind::Chunk);
        assert_eq!(Table::RedistributionLogs.name(), "redistribution_logs");
    }
}
