//! Blocks: immutable pairs of a labels file and a chunks file covering one time range.

use crate::columnar::{ColumnarFile, RowSet};
use crate::constraint::Constraint;
use crate::context::QueryContext;
use crate::encoding::ChunksDecoder;
use crate::error::QueryError;
use crate::filter::RowGroupFilter;
use crate::materialize::Materializer;
use crate::query::fan_out;
use crate::schema::{BlockSchema, BoundConstraintSet};
use crate::telemetry::QueryEventListener;
use crate::types::{ChunkSeries, Timestamp};

use std::sync::Arc;

/// Per-call execution settings for a block scan.
#[derive(Debug, Clone, Copy)]
pub struct ScanOptions<'a> {
    /// Fan row groups out over the rayon pool.
    pub parallel_row_groups: bool,
    pub listener: &'a dyn QueryEventListener,
}

/// An immutable block. Clones share the underlying files.
#[derive(Debug, Clone)]
pub struct Block {
    schema: Arc<BlockSchema>,
    labels: Arc<dyn ColumnarFile>,
    materializer: Materializer,
}

impl Block {
    /// Opens a block over a labels file and a chunks file. Fails with a schema error
    /// when the schema cannot be derived or the two files disagree on layout.
    pub fn new(
        labels: Arc<dyn ColumnarFile>,
        chunks: Arc<dyn ColumnarFile>,
        decoder: Arc<dyn ChunksDecoder>,
    ) -> Result<Self, QueryError> {
        let schema = Arc::new(BlockSchema::from_files(labels.as_ref(), chunks.as_ref())?);
        let materializer = Materializer::new(schema.clone(), labels.clone(), chunks, decoder);
        Ok(Self {
            schema,
            labels,
            materializer,
        })
    }

    /// Sets how many rows the materializer decodes between cancellation checks.
    pub fn with_cancellation_check_interval(mut self, rows: usize) -> Self {
        self.materializer = self.materializer.with_cancellation_check_interval(rows);
        self
    }

    pub fn schema(&self) -> &BlockSchema {
        &self.schema
    }

    pub fn min_time(&self) -> Timestamp {
        self.schema.min_time
    }

    pub fn max_time(&self) -> Timestamp {
        self.schema.max_time
    }

    pub fn num_row_groups(&self) -> usize {
        self.labels.num_row_groups()
    }

    /// Binds constraints to this block's schema.
    pub fn bind(&self, constraints: &[Constraint]) -> BoundConstraintSet {
        self.schema.bind(constraints)
    }

    /// Series of this block matching `bound`, clipped to `[mint, maxt)`, in row order.
    pub fn select(
        &self,
        ctx: &QueryContext,
        bound: &BoundConstraintSet,
        mint: Timestamp,
        maxt: Timestamp,
        opts: ScanOptions<'_>,
    ) -> Result<Vec<ChunkSeries>, QueryError> {
        if bound.is_unsatisfiable() || !self.schema.overlaps(mint, maxt) {
            return Ok(Vec::new());
        }
        let filter = RowGroupFilter::new(bound, opts.listener);
        let per_group = fan_out(ctx, self.num_row_groups(), opts.parallel_row_groups, |i| {
            let rows = self.filter_row_group(ctx, &filter, i)?;
            self.materializer.materialize(ctx, i, mint, maxt, &rows)
        })?;
        Ok(per_group.into_iter().flatten().collect())
    }

    /// Label names on series matching `bound`. Unsorted; may contain duplicates.
    pub fn label_names(
        &self,
        ctx: &QueryContext,
        bound: &BoundConstraintSet,
        opts: ScanOptions<'_>,
    ) -> Result<Vec<String>, QueryError> {
        if bound.is_unsatisfiable() {
            return Ok(Vec::new());
        }
        let filter = RowGroupFilter::new(bound, opts.listener);
        let per_group = fan_out(ctx, self.num_row_groups(), opts.parallel_row_groups, |i| {
            let rows = self.filter_row_group(ctx, &filter, i)?;
            self.materializer.label_names(ctx, i, &rows)
        })?;
        Ok(per_group.into_iter().flatten().collect())
    }

    /// Values of `name` on series matching `bound`. Unsorted; may contain duplicates.
    pub fn label_values(
        &self,
        ctx: &QueryContext,
        name: &str,
        bound: &BoundConstraintSet,
        opts: ScanOptions<'_>,
    ) -> Result<Vec<String>, QueryError> {
        if bound.is_unsatisfiable() || self.schema.label_column(name).is_none() {
            return Ok(Vec::new());
        }
        let filter = RowGroupFilter::new(bound, opts.listener);
        let per_group = fan_out(ctx, self.num_row_groups(), opts.parallel_row_groups, |i| {
            let rows = self.filter_row_group(ctx, &filter, i)?;
            self.materializer.label_values(ctx, i, name, &rows)
        })?;
        Ok(per_group.into_iter().flatten().collect())
    }

    fn filter_row_group(
        &self,
        ctx: &QueryContext,
        filter: &RowGroupFilter<'_>,
        row_group: usize,
    ) -> Result<RowSet, QueryError> {
        let rg = self
            .labels
            .row_group(row_group)
            .map_err(|source| QueryError::Filter { row_group, source })?;
        filter.filter(ctx, row_group, rg.as_ref())
    }
}
