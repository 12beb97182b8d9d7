//! In-memory wide-column table store backing the reference node
//!
//! Every cell carries the nanosecond timestamp of the write that set it, and
//! replicas merge cell by cell with last-write-wins. A delete records a row
//! tombstone timestamp that shadows every cell written at or before it, so a
//! later anti-entropy merge cannot resurrect data from a replica that missed
//! the delete. Tombstones are purged once older than the grace period.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::key::{Cell, RowAddress};

/// Key column names of a table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub partition_key_names: Vec<String>,
    pub clustering_key_names: Vec<String>,
}

/// A cell value with the timestamp of the write that set it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCell {
    pub name: String,
    pub value: String,
    pub written_at: i64,
}

impl StoredCell {
    fn newer_than(&self, other: &StoredCell) -> bool {
        // Equal timestamps fall back to the value so replicas agree.
        (self.written_at, &self.value) > (other.written_at, &other.value)
    }
}

/// One row with its version timestamps (unix nanoseconds)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRow {
    pub partition_keys: Vec<String>,
    pub clustering_keys: Vec<String>,
    /// Ordered by write time
    pub cells: Vec<StoredCell>,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}

impl StoredRow {
    fn empty(address: &RowAddress, now: i64) -> Self {
        Self {
            partition_keys: address.partition_keys().to_vec(),
            clustering_keys: address.clustering_keys().to_vec(),
            cells: Vec::new(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    /// Timestamp of the latest write or delete
    pub fn version(&self) -> i64 {
        self.updated_at.max(self.deleted_at.unwrap_or(i64::MIN))
    }

    /// A row is live while some cell was written after its tombstone
    pub fn is_live(&self) -> bool {
        !self.cells.is_empty()
    }

    pub fn visible_cells(&self) -> Vec<Cell> {
        self.cells
            .iter()
            .map(|cell| Cell::new(cell.name.clone(), cell.value.clone()))
            .collect()
    }

    fn upsert(&mut self, cell: StoredCell) {
        match self.cells.iter_mut().find(|c| c.name == cell.name) {
            Some(existing) => {
                if cell.newer_than(existing) {
                    *existing = cell;
                }
            }
            None => self.cells.push(cell),
        }
    }

    /// Fold another replica's copy of this row into this one
    fn merge_from(&mut self, other: &StoredRow) {
        self.created_at = self.created_at.min(other.created_at);
        self.updated_at = self.updated_at.max(other.updated_at);
        self.deleted_at = match (self.deleted_at, other.deleted_at) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        for cell in &other.cells {
            self.upsert(cell.clone());
        }
        self.settle();
    }

    /// Drop shadowed cells and restore write-time order
    fn settle(&mut self) {
        if let Some(deleted_at) = self.deleted_at {
            self.cells.retain(|cell| cell.written_at > deleted_at);
        }
        self.cells.sort_by_key(|cell| cell.written_at);
    }
}

/// Full content of one table, exchanged between nodes during repair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSnapshot {
    pub table_name: String,
    pub schema: TableSchema,
    pub rows: Vec<StoredRow>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Table {0} does not exist.")]
    NoSuchTable(String),

    #[error("Table {0} already exists with a different schema.")]
    SchemaConflict(String),

    #[error("Table {table} expects {expected} {kind} key(s), got {actual}.")]
    KeyArity {
        table: String,
        kind: &'static str,
        expected: usize,
        actual: usize,
    },
}

/// Counters reported by the health endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub tables: usize,
    pub live_rows: usize,
    pub tombstones: usize,
}

/// What a merge changed locally
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStats {
    pub tables_created: usize,
    pub rows_updated: usize,
    pub tables_skipped: usize,
}

type RowKey = (Vec<String>, Vec<String>);

#[derive(Debug, Clone)]
struct Table {
    schema: TableSchema,
    rows: HashMap<RowKey, StoredRow>,
}

#[derive(Debug, Clone, Default)]
pub struct TableStore {
    tables: Arc<RwLock<HashMap<String, Table>>>,
}

impl TableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a table; an identical schema is accepted again
    pub async fn create_table(&self, table_name: &str, schema: TableSchema) -> Result<CreateOutcome, StoreError> {
        let mut tables = self.tables.write().await;
        match tables.get(table_name) {
            Some(existing) if existing.schema == schema => Ok(CreateOutcome::AlreadyExists),
            Some(_) => Err(StoreError::SchemaConflict(table_name.to_string())),
            None => {
                tables.insert(
                    table_name.to_string(),
                    Table {
                        schema,
                        rows: HashMap::new(),
                    },
                );
                Ok(CreateOutcome::Created)
            }
        }
    }

    /// Upsert cells into a row, reviving it if it was deleted
    pub async fn insert(&self, address: &RowAddress, cells: &[Cell], now: i64) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let table = tables
            .get_mut(address.table())
            .ok_or_else(|| StoreError::NoSuchTable(address.table().to_string()))?;
        check_arity(address, &table.schema)?;

        let row = table
            .rows
            .entry(row_key(address))
            .or_insert_with(|| StoredRow::empty(address, now));
        // Local writes always move the row forward, even if the clock did not.
        let now = if row.cells.is_empty() && row.deleted_at.is_none() {
            now
        } else {
            now.max(row.version() + 1)
        };
        if !row.is_live() {
            row.created_at = now;
        }
        for cell in cells {
            row.upsert(StoredCell {
                name: cell.name.clone(),
                value: cell.value.clone(),
                written_at: now,
            });
        }
        row.updated_at = now;
        row.settle();
        Ok(())
    }

    /// Cells of a live row in write order; empty for absent tables, rows and tombstones
    pub async fn read(&self, address: &RowAddress) -> Vec<Cell> {
        let tables = self.tables.read().await;
        tables
            .get(address.table())
            .and_then(|table| table.rows.get(&row_key(address)))
            .map(StoredRow::visible_cells)
            .unwrap_or_default()
    }

    /// Tombstone a row. Returns whether a live row was deleted.
    ///
    /// Addresses that do not fit the table's key arity are ignored.
    pub async fn delete(&self, address: &RowAddress, now: i64) -> bool {
        let mut tables = self.tables.write().await;
        let Some(table) = tables.get_mut(address.table()) else {
            return false;
        };
        if let Err(e) = check_arity(address, &table.schema) {
            tracing::debug!(row = %address, error = %e, "Ignoring delete");
            return false;
        }

        // Absent rows still get a tombstone so a stale replica cannot resurrect them on repair.
        let row = table
            .rows
            .entry(row_key(address))
            .or_insert_with(|| StoredRow::empty(address, now));
        let was_live = row.is_live();
        let now = if was_live || row.deleted_at.is_some() {
            now.max(row.version() + 1)
        } else {
            now
        };
        row.deleted_at = Some(now);
        row.updated_at = row.updated_at.max(now);
        row.settle();
        was_live
    }

    /// Drop tombstones written before `cutoff`. Returns how many rows were removed.
    pub async fn purge_tombstones(&self, cutoff: i64) -> usize {
        let mut tables = self.tables.write().await;
        let mut purged = 0;
        for table in tables.values_mut() {
            let before = table.rows.len();
            table.rows.retain(|_, row| match row.deleted_at {
                Some(deleted) if deleted < cutoff => {
                    // A revived row keeps its cells and forgets the old delete.
                    row.deleted_at = None;
                    row.is_live()
                }
                _ => true,
            });
            purged += before - table.rows.len();
        }
        purged
    }

/// Copy of every table, rows sorted by key for stable output
    pub async fn snapshot(&self) -> Vec<TableSnapshot> {
        let tables = self.tables.read().await;
        let mut snapshots: Vec<TableSnapshot> = tables
            .iter()
            .map(|(name, table)| {
                let mut rows: Vec<StoredRow> = table.rows.values().cloned().collect();
                rows.sort_by(|a, b| {
                    (&a.partition_keys, &a.clustering_keys).cmp(&(&b.partition_keys, &b.clustering_keys))
                });
                TableSnapshot {
                    table_name: name.clone(),
                    schema: table.schema.clone(),
                    rows,
                }
            })
            .collect();
        snapshots.sort_by(|a, b| a.table_name.cmp(&b.table_name));
        snapshots
    }

    /// Schema of one table without rows
    pub async fn schema_snapshot(&self, table_name: &str) -> Option<TableSnapshot> {
        let tables = self.tables.read().await;
        tables.get(table_name).map(|table| TableSnapshot {
            table_name: table_name.to_string(),
            schema: table.schema.clone(),
            rows: Vec::new(),
        })
    }

    /// One row, live or tombstoned, together with its table schema
    pub async fn row_snapshot(&self, address: &RowAddress) -> Option<TableSnapshot> {
        let tables = self.tables.read().await;
        let table = tables.get(address.table())?;
        let row = table.rows.get(&row_key(address))?;
        Some(TableSnapshot {
            table_name: address.table().to_string(),
            schema: table.schema.clone(),
            rows: vec![row.clone()],
        })
    }

    /// Cell-level last-write-wins merge of a peer snapshot, tombstones included
    pub async fn merge(&self, snapshots: Vec<TableSnapshot>) -> MergeStats {
        let mut tables = self.tables.write().await;
        let mut stats = MergeStats::default();

        for snapshot in snapshots {
            let table = tables.entry(snapshot.table_name.clone()).or_insert_with(|| {
                stats.tables_created += 1;
                Table {
                    schema: snapshot.schema.clone(),
                    rows: HashMap::new(),
                }
            });
            if table.schema != snapshot.schema {
                tracing::warn!(table = %snapshot.table_name, "Skipping table with conflicting schema during merge");
                stats.tables_skipped += 1;
                continue;
            }

            for mut row in snapshot.rows {
                let key = (row.partition_keys.clone(), row.clustering_keys.clone());
                match table.rows.get_mut(&key) {
                    Some(local) => {
                        let before = local.clone();
                        local.merge_from(&row);
                        if *local != before {
                            stats.rows_updated += 1;
                        }
                    }
                    None => {
                        row.settle();
                        table.rows.insert(key, row);
                        stats.rows_updated += 1;
                    }
                }
            }
        }
        stats
    }

    pub async fn stats(&self) -> StoreStats {
        let tables = self.tables.read().await;
        let mut stats = StoreStats {
            tables: tables.len(),
            ..StoreStats::default()
        };
        for row in tables.values().flat_map(|t| t.rows.values()) {
            if row.is_live() {
                stats.live_rows += 1;
            } else {
                stats.tombstones += 1;
            }
        }
        stats
    }
}

/// Current time in unix nanoseconds
pub fn now_nanos() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

fn row_key(address: &RowAddress) -> RowKey {
    (address.partition_keys().to_vec(), address.clustering_keys().to_vec())
}

fn check_arity(address: &RowAddress, schema: &TableSchema) -> Result<(), StoreError> {
    let checks = [
        ("partition", schema.partition_key_names.len(), address.partition_keys().len()),
        ("clustering", schema.clustering_key_names.len(), address.clustering_keys().len()),
    ];
    for (kind, expected, actual) in checks {
        if expected != actual {
            return Err(StoreError::KeyArity {
                table: address.table().to_string(),
                kind,
                expected,
                actual,
            });
        }
    }
    Ok(())
}
