//! Read-side interface of the columnar block files.
//!
//! The engine only ever talks to a block's files through [`ColumnarFile`] and
//! [`RowGroupReader`]. Statistics and dictionaries are cheap metadata reads; the
//! `read_*` methods are the page reads the row-group filter tries to avoid.

use crate::error::ColumnarError;

use bytes::Bytes;
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Sorted set of row indices within one row group.
pub type RowSet = RoaringBitmap;

/// Physical type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    /// Nullable UTF-8 strings (label columns).
    Utf8,
    /// Nullable byte strings (chunk columns).
    Binary,
}

impl ColumnType {
    pub fn as_str(self) -> &'static str {
        match self {
            ColumnType::Utf8 => "utf8",
            ColumnType::Binary => "binary",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub column_type: ColumnType,
}

impl ColumnDescriptor {
    pub fn utf8(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            column_type: ColumnType::Utf8,
        }
    }

    pub fn binary(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            column_type: ColumnType::Binary,
        }
    }
}

/// Per-column, per-row-group statistics over non-null values.
///
/// `min`/`max` are `None` when every value is null or the writer did not record them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnStatistics {
    pub min: Option<String>,
    pub max: Option<String>,
    pub null_count: u32,
}

impl ColumnStatistics {
    /// False only when `value` is provably outside `[min, max]`.
    pub fn may_contain(&self, value: &str) -> bool {
        match (&self.min, &self.max) {
            (Some(min), Some(max)) => min.as_str() <= value && value <= max.as_str(),
            _ => true,
        }
    }
}

/// A columnar file: a schema plus horizontally partitioned row groups.
pub trait ColumnarFile: fmt::Debug + Send + Sync {
    fn columns(&self) -> Result<Vec<ColumnDescriptor>, ColumnarError>;

    /// File-level key/value metadata.
    fn metadata(&self) -> Result<BTreeMap<String, String>, ColumnarError>;

    fn num_row_groups(&self) -> usize;

    fn row_group(&self, index: usize) -> Result<Arc<dyn RowGroupReader>, ColumnarError>;
}

/// One row group of a [`ColumnarFile`].
pub trait RowGroupReader: Send + Sync {
    fn num_rows(&self) -> u32;

    /// Column statistics, if the writer recorded them.
    fn statistics(&self, column: usize) -> Result<Option<ColumnStatistics>, ColumnarError>;

    /// Distinct non-null values of a UTF-8 column, if it is dictionary encoded.
    ///
    /// The order of the values is unspecified.
    fn dictionary(&self, column: usize) -> Result<Option<Arc<[String]>>, ColumnarError>;

    /// Reads a UTF-8 column for `rows`, returning one entry per row in ascending row order.
    fn read_utf8(
        &self,
        column: usize,
        rows: &RowSet,
    ) -> Result<Vec<Option<String>>, ColumnarError>;

    /// Reads a binary column for `rows`, returning one entry per row in ascending row order.
    fn read_binary(
        &self,
        column: usize,
        rows: &RowSet,
    ) -> Result<Vec<Option<Bytes>>, ColumnarError>;
}

/// Row set containing every row of a group.
pub fn all_rows(num_rows: u32) -> RowSet {
    let mut rows = RowSet::new();
    rows.insert_range(0..num_rows);
    rows
}
