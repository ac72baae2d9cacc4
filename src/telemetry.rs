use std::sync::Arc;
use std::time::Duration;

/// Structured, in-process event hook for query observability.
///
/// The engine never logs on its own. Hosts install a listener that forwards events to
/// their logging or tracing stack.
pub trait QueryEventListener: std::fmt::Debug + Send + Sync + 'static {
    fn on_event(&self, event: QueryEvent);
}

/// Structured events emitted while executing queries.
#[derive(Debug, Clone)]
pub enum QueryEvent {
    /// The block was not scanned: its time range misses the query window, or the
    /// bound constraints are statically unsatisfiable.
    BlockSkipped { block: usize, reason: SkipReason },

    /// A row group was eliminated without reading any value pages.
    RowGroupPruned {
        row_group: usize,
        label: String,
        reason: PruneReason,
    },

    SelectCompleted {
        blocks: usize,
        series: usize,
        duration: Duration,
    },

    LabelQueryCompleted {
        /// `None` for a label-names query.
        label: Option<String>,
        values: usize,
        duration: Duration,
    },

    QueryCancelled,
    QueryFailed { error: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    OutsideTimeRange,
    Unsatisfiable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneReason {
    /// Value outside the column's min/max statistics.
    Statistics,
    /// Value absent from the column dictionary.
    Dictionary,
    /// Column is entirely null.
    AllNull,
    /// Column has no nulls and the predicate only accepts the empty value.
    NoNulls,
}

#[derive(Debug)]
pub struct NoopEventListener;

impl QueryEventListener for NoopEventListener {
    #[inline]
    fn on_event(&self, _event: QueryEvent) {}
}

pub fn noop_event_listener() -> Arc<dyn QueryEventListener> {
    Arc::new(NoopEventListener)
}

/// Query metrics on top of the `metrics` facade.
///
/// Emitting is effectively a no-op until the host process installs a recorder.
pub mod query_metrics {
    use super::*;

    use ::metrics::{describe_counter, describe_histogram, Unit};

    // Counters are exposed as `<name>_total` by the Prometheus exporter.

    pub const ROW_GROUPS_SCANNED: &str = "blockquery_row_groups_scanned";
    pub const ROW_GROUPS_PRUNED: &str = "blockquery_row_groups_pruned";
    pub const BLOCKS_SKIPPED: &str = "blockquery_blocks_skipped";
    pub const SERIES_MATERIALIZED: &str = "blockquery_series_materialized";
    pub const CHUNKS_DECODED: &str = "blockquery_chunks_decoded";
    pub const QUERIES_CANCELLED: &str = "blockquery_queries_cancelled";

    pub const SELECT_DURATION_SECONDS: &str = "blockquery_select_duration_seconds";
    pub const LABEL_QUERY_DURATION_SECONDS: &str = "blockquery_label_query_duration_seconds";

    #[inline]
    pub fn record_row_group_scanned() {
        ::metrics::counter!(ROW_GROUPS_SCANNED).increment(1);
    }

    #[inline]
    pub fn record_row_group_pruned() {
        ::metrics::counter!(ROW_GROUPS_PRUNED).increment(1);
    }

    #[inline]
    pub fn record_block_skipped() {
        ::metrics::counter!(BLOCKS_SKIPPED).increment(1);
    }

    #[inline]
    pub fn record_materialized(series: u64, chunks: u64) {
        if series > 0 {
            ::metrics::counter!(SERIES_MATERIALIZED).increment(series);
        }
        if chunks > 0 {
            ::metrics::counter!(CHUNKS_DECODED).increment(chunks);
        }
    }

    #[inline]
    pub fn record_cancelled() {
        ::metrics::counter!(QUERIES_CANCELLED).increment(1);
    }

    #[inline]
    pub fn record_select(duration: Duration) {
        ::metrics::histogram!(SELECT_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    #[inline]
    pub fn record_label_query(duration: Duration) {
        ::metrics::histogram!(LABEL_QUERY_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    /// Registers descriptions for every metric; call once after installing a recorder.
    pub fn describe_all() {
        describe_counter!(
            ROW_GROUPS_SCANNED,
            Unit::Count,
            "Row groups whose label columns were read by the row-group filter."
        );
        describe_counter!(
            ROW_GROUPS_PRUNED,
            Unit::Count,
            "Row groups eliminated from statistics or dictionaries alone."
        );
        describe_counter!(
            BLOCKS_SKIPPED,
            Unit::Count,
            "Blocks skipped by time range or unsatisfiable constraints."
        );
        describe_counter!(
            SERIES_MATERIALIZED,
            Unit::Count,
            "Series produced by the materializer before cross-block merge."
        );
        describe_counter!(
            CHUNKS_DECODED,
            Unit::Count,
            "Chunks decoded and emitted by the materializer."
        );
        describe_counter!(
            QUERIES_CANCELLED,
            Unit::Count,
            "Queries aborted by cancellation or deadline."
        );

        describe_histogram!(
            SELECT_DURATION_SECONDS,
            Unit::Seconds,
            "Wall time of Querier::select, including merge."
        );
        describe_histogram!(
            LABEL_QUERY_DURATION_SECONDS,
            Unit::Seconds,
            "Wall time of label-names and label-values queries."
        );
    }
}
