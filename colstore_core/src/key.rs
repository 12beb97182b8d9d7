//! Composite key model for wide-column rows
//!
//! A row lives at a [`RowAddress`]: a table, an ordered partition key and an
//! ordered clustering key. Key components are trimmed and upper-cased so that
//! the same logical key always maps to the same physical address, whichever
//! verb produced it. Component order is significant and never changed.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{KeyKind, ValidationError};

/// Fully validated coordinate of a single row
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RowAddress {
    table: String,
    partition_keys: Vec<String>,
    clustering_keys: Vec<String>,
}

impl RowAddress {
    /// Build an address from raw caller input, see [`normalize`]
    pub fn new<P, C>(table: &str, partition: &[P], clustering: &[C]) -> Result<Self, ValidationError>
    where
        P: AsRef<str>,
        C: AsRef<str>,
    {
        normalize(table, partition, clustering)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn partition_keys(&self) -> &[String] {
        &self.partition_keys
    }

    pub fn clustering_keys(&self) -> &[String] {
        &self.clustering_keys
    }
}

impl std::fmt::Display for RowAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}[{}][{}]",
            self.table,
            self.partition_keys.join(","),
            self.clustering_keys.join(",")
        )
    }
}

/// A single named value within a row
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cell {
    pub name: String,
    pub value: String,
}

impl Cell {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Pair positional name and value lists into validated cells
    pub fn pair<N, V>(names: &[N], values: &[V]) -> Result<Vec<Cell>, ValidationError>
    where
        N: AsRef<str>,
        V: AsRef<str>,
    {
        if names.len() != values.len() {
            return Err(ValidationError::CellCountMismatch {
                names: names.len(),
                values: values.len(),
            });
        }

        let cells: Vec<Cell> = names
            .iter()
            .zip(values)
            .map(|(name, value)| Cell::new(name.as_ref().trim(), value.as_ref()))
            .collect();

        validate_cells(&cells)?;
        Ok(cells)
    }
}

/// Validate and normalize a raw row address.
///
/// Fails with [`ValidationError::EmptyTable`] for a blank table and with
/// [`ValidationError::EmptyKeySet`] when either key set is empty or holds a
/// blank component. Applying it to an already normalized address is a no-op.
pub fn normalize<P, C>(table: &str, partition: &[P], clustering: &[C]) -> Result<RowAddress, ValidationError>
where
    P: AsRef<str>,
    C: AsRef<str>,
{
    let table = normalize_table(table)?;
    let partition_keys = normalize_components(KeyKind::Partition, partition)?;
    let clustering_keys = normalize_components(KeyKind::Clustering, clustering)?;

    Ok(RowAddress {
        table,
        partition_keys,
        clustering_keys,
    })
}

/// Trim a table name, rejecting blanks. Case is preserved.
pub fn normalize_table(table: &str) -> Result<String, ValidationError> {
    let trimmed = table.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyTable);
    }
    Ok(trimmed.to_string())
}

/// Trim and upper-case every component of one key set, keeping order
pub fn normalize_components<S: AsRef<str>>(
    kind: KeyKind,
    components: &[S],
) -> Result<Vec<String>, ValidationError> {
    if components.is_empty() {
        return Err(ValidationError::EmptyKeySet(kind));
    }

    components
        .iter()
        .map(|component| {
            let trimmed = component.as_ref().trim();
            if trimmed.is_empty() {
                Err(ValidationError::EmptyKeySet(kind))
            } else {
                Ok(trimmed.to_uppercase())
            }
        })
        .collect()
}

/// Split a delimited string into raw key components.
///
/// Empty pieces are kept so that `"a,,b"` is rejected by validation rather
/// than silently becoming `["a", "b"]`.
pub fn split_components(raw: &str, delimiter: &str) -> Vec<String> {
    if raw.trim().is_empty() {
        return Vec::new();
    }
    if delimiter.is_empty() {
        return vec![raw.to_string()];
    }
    raw.split(delimiter).map(str::to_string).collect()
}

/// Check the per-row cell invariants: at least one cell, named, names unique
pub fn validate_cells(cells: &[Cell]) -> Result<(), ValidationError> {
    if cells.is_empty() {
        return Err(ValidationError::NoCells);
    }

    let mut seen = HashSet::with_capacity(cells.len());
    for cell in cells {
        if cell.name.trim().is_empty() {
            return Err(ValidationError::EmptyCellName);
        }
        if !seen.insert(cell.name.as_str()) {
            return Err(ValidationError::DuplicateCell(cell.name.clone()));
        }
    }
    Ok(())
}
