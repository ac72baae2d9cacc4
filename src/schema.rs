//! Block schema and constraint binding.
//!
//! A block is two columnar files with identical row-group layout: the labels file
//! holds one UTF-8 column per label name (`l_<name>`), the chunks file holds binary
//! chunk columns (`s_data_<n>`), each covering a fixed slice of the block time range.
//! Row `i` of both files describes the same series.

use crate::columnar::{ColumnType, ColumnarFile};
use crate::constraint::Constraint;
use crate::error::QueryError;
use crate::types::Timestamp;

use std::collections::BTreeMap;

pub const LABEL_COLUMN_PREFIX: &str = "l_";
pub const CHUNK_COLUMN_PREFIX: &str = "s_data_";

/// Labels-file metadata keys.
pub const META_MIN_TIME: &str = "blockquery.min_time";
pub const META_MAX_TIME: &str = "blockquery.max_time";
pub const META_DATA_COL_DURATION: &str = "blockquery.data_col_duration";

pub fn label_column_name(label: &str) -> String {
    format!("{}{}", LABEL_COLUMN_PREFIX, label)
}

pub fn chunk_column_name(index: usize) -> String {
    format!("{}{}", CHUNK_COLUMN_PREFIX, index)
}

/// A chunk column and the half-open time slice `[min_time, max_time)` it covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkColumn {
    /// Column index in the chunks file.
    pub column: usize,
    pub min_time: Timestamp,
    pub max_time: Timestamp,
}

impl ChunkColumn {
    #[inline]
    pub fn overlaps(&self, mint: Timestamp, maxt: Timestamp) -> bool {
        self.min_time < maxt && mint < self.max_time
    }
}

#[derive(Debug, Clone)]
pub struct BlockSchema {
    pub min_time: Timestamp,
    pub max_time: Timestamp,
    pub data_col_duration: i64,
    /// label name -> column index in the labels file
    label_columns: BTreeMap<String, usize>,
    chunk_columns: Vec<ChunkColumn>,
}

impl BlockSchema {
    /// Derives the schema of a block from its labels and chunks files.
    pub fn from_files(
        labels: &dyn ColumnarFile,
        chunks: &dyn ColumnarFile,
    ) -> Result<Self, QueryError> {
        let meta = labels
            .metadata()
            .map_err(|e| QueryError::Schema(format!("reading labels file metadata: {}", e)))?;
        let min_time = parse_meta(&meta, META_MIN_TIME)?;
        let max_time = parse_meta(&meta, META_MAX_TIME)?;
        let data_col_duration = parse_meta(&meta, META_DATA_COL_DURATION)?;
        if max_time < min_time {
            return Err(QueryError::Schema(format!(
                "block time range is inverted: [{}, {})",
                min_time, max_time
            )));
        }
        if data_col_duration <= 0 {
            return Err(QueryError::Schema(format!(
                "data column duration must be positive, got {}",
                data_col_duration
            )));
        }

        let mut label_columns = BTreeMap::new();
        let label_descriptors = labels
            .columns()
            .map_err(|e| QueryError::Schema(format!("reading labels file columns: {}", e)))?;
        for (idx, col) in label_descriptors.iter().enumerate() {
            let Some(label) = col.name.strip_prefix(LABEL_COLUMN_PREFIX) else {
                continue;
            };
            if col.column_type != ColumnType::Utf8 {
                return Err(QueryError::Schema(format!(
                    "label column {:?} has type {}, expected utf8",
                    col.name,
                    col.column_type.as_str()
                )));
            }
            if label.is_empty() || label_columns.insert(label.to_string(), idx).is_some() {
                return Err(QueryError::Schema(format!(
                    "invalid or duplicate label column {:?}",
                    col.name
                )));
            }
        }

        let mut slots: BTreeMap<usize, usize> = BTreeMap::new();
        let chunk_descriptors = chunks
            .columns()
            .map_err(|e| QueryError::Schema(format!("reading chunks file columns: {}", e)))?;
        for (idx, col) in chunk_descriptors.iter().enumerate() {
            let Some(slot) = col.name.strip_prefix(CHUNK_COLUMN_PREFIX) else {
                continue;
            };
            let slot: usize = slot.parse().map_err(|_| {
                QueryError::Schema(format!("malformed chunk column name {:?}", col.name))
            })?;
            if col.column_type != ColumnType::Binary {
                return Err(QueryError::Schema(format!(
                    "chunk column {:?} has type {}, expected binary",
                    col.name,
                    col.column_type.as_str()
                )));
            }
            if slots.insert(slot, idx).is_some() {
                return Err(QueryError::Schema(format!(
                    "duplicate chunk column {:?}",
                    col.name
                )));
            }
        }

        let slot_count = slots.len();
        let mut chunk_columns = Vec::with_capacity(slot_count);
        for (expected, (slot, column)) in slots.into_iter().enumerate() {
            if slot != expected {
                return Err(QueryError::Schema(format!(
                    "chunk columns are not contiguous: missing {}",
                    chunk_column_name(expected)
                )));
            }
            let start = min_time.saturating_add((slot as i64).saturating_mul(data_col_duration));
            let end = start.saturating_add(data_col_duration);
            chunk_columns.push(ChunkColumn {
                column,
                min_time: start,
                // The last column absorbs whatever remains of the block range.
                max_time: if expected + 1 == slot_count {
                    end.max(max_time)
                } else {
                    end
                },
            });
        }

        if labels.num_row_groups() != chunks.num_row_groups() {
            return Err(QueryError::Schema(format!(
                "labels file has {} row groups, chunks file has {}",
                labels.num_row_groups(),
                chunks.num_row_groups()
            )));
        }
        for i in 0..labels.num_row_groups() {
            let lrg = labels
                .row_group(i)
                .map_err(|e| QueryError::Schema(format!("opening labels row group {}: {}", i, e)))?;
            let crg = chunks
                .row_group(i)
                .map_err(|e| QueryError::Schema(format!("opening chunks row group {}: {}", i, e)))?;
            if lrg.num_rows() != crg.num_rows() {
                return Err(QueryError::Schema(format!(
                    "row group {} has {} label rows but {} chunk rows",
                    i,
                    lrg.num_rows(),
                    crg.num_rows()
                )));
            }
        }

        Ok(Self {
            min_time,
            max_time,
            data_col_duration,
            label_columns,
            chunk_columns,
        })
    }

    /// Column index of `label` in the labels file.
    pub fn label_column(&self, label: &str) -> Option<usize> {
        self.label_columns.get(label).copied()
    }

    /// `(label name, column index)` pairs, sorted by name.
    pub fn label_columns(&self) -> impl Iterator<Item = (&str, usize)> {
        self.label_columns.iter().map(|(k, &v)| (k.as_str(), v))
    }

    pub fn chunk_columns(&self) -> &[ChunkColumn] {
        &self.chunk_columns
    }

    /// Chunk columns whose time slice overlaps `[mint, maxt)`.
    pub fn chunk_columns_for(
        &self,
        mint: Timestamp,
        maxt: Timestamp,
    ) -> impl Iterator<Item = &ChunkColumn> {
        self.chunk_columns
            .iter()
            .filter(move |c| c.overlaps(mint, maxt))
    }

    /// True if the block's time range overlaps `[mint, maxt)`.
    pub fn overlaps(&self, mint: Timestamp, maxt: Timestamp) -> bool {
        self.min_time < maxt && mint < self.max_time
    }

    /// Resolves constraints against this schema.
    ///
    /// A constraint on a label with no column can only ever see the empty string, so it
    /// becomes the static result of evaluating it against `""`: positive matchers on
    /// non-empty values turn false, negative ones true, and `label=""` stays true.
    pub fn bind(&self, constraints: &[Constraint]) -> BoundConstraintSet {
        let mut bound: Vec<BoundConstraint> = constraints
            .iter()
            .map(|c| {
                let binding = match self.label_column(&c.label) {
                    Some(column) => Binding::Column(column),
                    None => Binding::Static(c.matches("")),
                };
                BoundConstraint {
                    constraint: c.clone(),
                    binding,
                }
            })
            .collect();
        bound.sort_by_key(BoundConstraint::cost);
        BoundConstraintSet { constraints: bound }
    }
}

fn parse_meta(meta: &BTreeMap<String, String>, key: &str) -> Result<i64, QueryError> {
    let raw = meta
        .get(key)
        .ok_or_else(|| QueryError::Schema(format!("missing metadata key {:?}", key)))?;
    raw.parse::<i64>()
        .map_err(|e| QueryError::Schema(format!("metadata {:?}={:?}: {}", key, raw, e)))
}

/// How a constraint is evaluated against a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    /// Evaluate against this labels-file column.
    Column(usize),
    /// The label has no column; the constraint is constant for every row.
    Static(bool),
}

#[derive(Debug, Clone)]
pub struct BoundConstraint {
    pub constraint: Constraint,
    pub binding: Binding,
}

impl BoundConstraint {
    fn cost(&self) -> u8 {
        match self.binding {
            Binding::Static(_) => 0,
            Binding::Column(_) => self.constraint.cost(),
        }
    }
}

/// Constraints bound to one block's schema, ordered by evaluation cost.
///
/// Immutable once built; row-group filters share it by reference and keep their
/// scan state locally.
#[derive(Debug, Clone)]
pub struct BoundConstraintSet {
    constraints: Vec<BoundConstraint>,
}

impl BoundConstraintSet {
    /// True if some constraint is statically false, so no row of the block can match.
    pub fn is_unsatisfiable(&self) -> bool {
        self.constraints
            .iter()
            .any(|b| b.binding == Binding::Static(false))
    }

    /// Constraints in evaluation order (static ones first, then by cost).
    pub fn iter(&self) -> impl Iterator<Item = &BoundConstraint> {
        self.constraints.iter()
    }

    pub fn len(&self) -> usize {
        self.constraints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }
}
