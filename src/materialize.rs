//! Materializer: turns candidate rows of a row group into series or label summaries.

use crate::columnar::{ColumnarFile, RowGroupReader, RowSet};
use crate::context::QueryContext;
use crate::encoding::ChunksDecoder;
use crate::error::{ColumnarError, QueryError};
use crate::schema::BlockSchema;
use crate::telemetry::query_metrics;
use crate::types::{ChunkSeries, Labels, Timestamp};

use std::collections::BTreeSet;
use std::sync::Arc;

pub const DEFAULT_CANCELLATION_CHECK_INTERVAL: usize = 256;

/// Reads label and chunk columns of one block. Immutable and cheap to clone.
#[derive(Debug, Clone)]
pub struct Materializer {
    schema: Arc<BlockSchema>,
    labels: Arc<dyn ColumnarFile>,
    chunks: Arc<dyn ColumnarFile>,
    decoder: Arc<dyn ChunksDecoder>,
    check_interval: usize,
}

impl Materializer {
    pub fn new(
        schema: Arc<BlockSchema>,
        labels: Arc<dyn ColumnarFile>,
        chunks: Arc<dyn ColumnarFile>,
        decoder: Arc<dyn ChunksDecoder>,
    ) -> Self {
        Self {
            schema,
            labels,
            chunks,
            decoder,
            check_interval: DEFAULT_CANCELLATION_CHECK_INTERVAL,
        }
    }

    /// Rows decoded between cancellation checks.
    pub fn with_cancellation_check_interval(mut self, rows: usize) -> Self {
        self.check_interval = rows.max(1);
        self
    }

    pub fn schema(&self) -> &BlockSchema {
        &self.schema
    }

    /// Decodes `rows` of `row_group` into series clipped to `[mint, maxt)`.
    ///
    /// Only chunk columns overlapping the window are read. Series left without chunks
    /// are not emitted. Any decode failure aborts with an error naming the series.
    pub fn materialize(
        &self,
        ctx: &QueryContext,
        row_group: usize,
        mint: Timestamp,
        maxt: Timestamp,
        rows: &RowSet,
    ) -> Result<Vec<ChunkSeries>, QueryError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        ctx.check()?;
        let wrap = |source: ColumnarError| QueryError::Column { row_group, source };

        let columns = self.read_label_columns(row_group, rows)?;

        let crg = self.chunks.row_group(row_group).map_err(wrap)?;
        let mut cells = Vec::new();
        for col in self.schema.chunk_columns_for(mint, maxt) {
            let values = crg.read_binary(col.column, rows).map_err(wrap)?;
            check_len(values.len(), rows).map_err(wrap)?;
            cells.push(values);
        }

        let mut out = Vec::with_capacity(rows.len() as usize);
        let mut chunk_count = 0u64;
        for i in 0..rows.len() as usize {
            if i % self.check_interval == 0 {
                ctx.check()?;
            }
            let labels = labels_at(&columns, i);

            let mut chunks = Vec::new();
            for column in &cells {
                let Some(data) = &column[i] else {
                    continue;
                };
                let decoded = self
                    .decoder
                    .decode(data, mint, maxt)
                    .map_err(|e| e.with_decode_context(&labels.to_string(), row_group))?;
                chunks.extend(decoded.into_iter().filter_map(|c| c.clip(mint, maxt)));
            }
            if chunks.is_empty() {
                continue;
            }
            chunks.sort_by_key(|c| c.min_time);
            chunk_count += chunks.len() as u64;
            out.push(ChunkSeries::new(labels, chunks));
        }

        query_metrics::record_materialized(out.len() as u64, chunk_count);
        Ok(out)
    }

    /// Distinct label names present on at least one of `rows`.
    pub fn label_names(
        &self,
        ctx: &QueryContext,
        row_group: usize,
        rows: &RowSet,
    ) -> Result<Vec<String>, QueryError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let wrap = |source: ColumnarError| QueryError::Column { row_group, source };
        let lrg = self.labels.row_group(row_group).map_err(wrap)?;
        let whole_group = covers_all(lrg.as_ref(), rows);

        let mut names = Vec::new();
        for (name, column) in self.schema.label_columns() {
            ctx.check()?;
            if let Some(stats) = lrg.statistics(column).map_err(wrap)? {
                if stats.null_count == lrg.num_rows() {
                    continue;
                }
                if whole_group && stats.max.as_deref().is_some_and(|m| !m.is_empty()) {
                    names.push(name.to_string());
                    continue;
                }
            }
            let values = lrg.read_utf8(column, rows).map_err(wrap)?;
            if values.iter().flatten().any(|v| !v.is_empty()) {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    /// Distinct non-empty values of `name` among `rows`.
    pub fn label_values(
        &self,
        ctx: &QueryContext,
        row_group: usize,
        name: &str,
        rows: &RowSet,
    ) -> Result<Vec<String>, QueryError> {
        let Some(column) = self.schema.label_column(name) else {
            return Ok(Vec::new());
        };
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        ctx.check()?;
        let wrap = |source: ColumnarError| QueryError::Column { row_group, source };
        let lrg = self.labels.row_group(row_group).map_err(wrap)?;

        if covers_all(lrg.as_ref(), rows) {
            if let Some(dict) = lrg.dictionary(column).map_err(wrap)? {
                return Ok(dict.iter().filter(|v| !v.is_empty()).cloned().collect());
            }
        }
        let values = lrg.read_utf8(column, rows).map_err(wrap)?;
        let distinct: BTreeSet<String> = values
            .into_iter()
            .flatten()
            .filter(|v| !v.is_empty())
            .collect();
        Ok(distinct.into_iter().collect())
    }

    fn read_label_columns(
        &self,
        row_group: usize,
        rows: &RowSet,
    ) -> Result<Vec<(&str, Vec<Option<String>>)>, QueryError> {
        let wrap = |source: ColumnarError| QueryError::Column { row_group, source };
        let lrg = self.labels.row_group(row_group).map_err(wrap)?;
        let mut columns = Vec::new();
        for (name, column) in self.schema.label_columns() {
            let values = lrg.read_utf8(column, rows).map_err(wrap)?;
            check_len(values.len(), rows).map_err(wrap)?;
            columns.push((name, values));
        }
        Ok(columns)
    }
}

fn labels_at(columns: &[(&str, Vec<Option<String>>)], i: usize) -> Labels {
    Labels::new(
        columns
            .iter()
            .filter_map(|(name, values)| values[i].as_deref().map(|v| (*name, v))),
    )
}

fn covers_all(rg: &dyn RowGroupReader, rows: &RowSet) -> bool {
    rows.len() == u64::from(rg.num_rows())
}

fn check_len(got: usize, rows: &RowSet) -> Result<(), ColumnarError> {
    if got as u64 == rows.len() {
        Ok(())
    } else {
        Err(ColumnarError::Corrupt(format!(
            "read returned {} values for {} rows",
            got,
            rows.len()
        )))
    }
}
