//! Query engine: fans queries out over blocks, merges per-block results, and exposes
//! the select / label-names / label-values surface.

use crate::block::{Block, ScanOptions};
use crate::constraint::{Constraint, ConstraintBuilder, DEFAULT_MAX_REGEX_LEN};
use crate::context::QueryContext;
use crate::error::QueryError;
use crate::materialize::DEFAULT_CANCELLATION_CHECK_INTERVAL;
use crate::matcher::Matcher;
use crate::merge::{merge_series, merge_unsorted_slices};
use crate::query::{check_time_range, fan_out};
use crate::schema::BoundConstraintSet;
use crate::telemetry::{
    noop_event_listener, query_metrics, QueryEvent, QueryEventListener, SkipReason,
};
use crate::types::{ChunkSeries, Timestamp};

use config::{Config, Environment, File};
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

/// Configuration options for the QueryEngine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Scan blocks concurrently on the rayon pool
    pub parallel_blocks: bool,
    /// Scan row groups of a block concurrently on the rayon pool
    pub parallel_row_groups: bool,
    /// Rows materialized between cancellation checks
    pub cancellation_check_interval: usize,
    /// Initial capacity of the select result buffer
    pub initial_series_capacity: usize,
    /// Longest accepted regex pattern in bytes (0 = unlimited)
    pub max_regex_len: usize,
    /// Structured event hook for observability (no-op by default).
    pub event_listener: Arc<dyn QueryEventListener>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            parallel_blocks: true,
            parallel_row_groups: true,
            cancellation_check_interval: DEFAULT_CANCELLATION_CHECK_INTERVAL,
            initial_series_capacity: 1024,
            max_regex_len: DEFAULT_MAX_REGEX_LEN,
            event_listener: noop_event_listener(),
        }
    }
}

impl EngineConfig {
    /// Overrides every field set in `partial`.
    pub fn apply_file_config(&mut self, partial: &EngineFileConfig) {
        if let Some(b) = partial.parallel_blocks {
            self.parallel_blocks = b;
        }
        if let Some(b) = partial.parallel_row_groups {
            self.parallel_row_groups = b;
        }
        if let Some(n) = partial.cancellation_check_interval {
            self.cancellation_check_interval = n.max(1);
        }
        if let Some(n) = partial.initial_series_capacity {
            self.initial_series_capacity = n;
        }
        if let Some(n) = partial.max_regex_len {
            self.max_regex_len = n;
        }
    }
}

/// Engine section of a config file. All fields optional; serde deserializes from TOML.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
pub struct EngineFileConfig {
    pub parallel_blocks: Option<bool>,
    pub parallel_row_groups: Option<bool>,
    pub cancellation_check_interval: Option<usize>,
    pub initial_series_capacity: Option<usize>,
    pub max_regex_len: Option<usize>,
}

impl EngineFileConfig {
    /// Environment variable prefix, e.g. `BLOCKQUERY__PARALLEL_BLOCKS=false`.
    pub const ENV_PREFIX: &'static str = "BLOCKQUERY";

    /// Loads a partial config from an optional TOML file, overlaid with environment
    /// variables under [`Self::ENV_PREFIX`].
    pub fn load(path: Option<&Path>) -> Result<Self, QueryError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            if !path.exists() {
                return Err(QueryError::ConfigError(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix(Self::ENV_PREFIX)
                .separator("__")
                .try_parsing(true)
                .ignore_empty(true),
        );
        let merged = builder
            .build()
            .map_err(|e| QueryError::ConfigError(e.to_string()))?;
        merged
            .try_deserialize()
            .map_err(|e| QueryError::ConfigError(e.to_string()))
    }
}

/// Overrides the querier window for one select. `end` is exclusive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SelectHints {
    pub start: Timestamp,
    pub end: Timestamp,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LabelHints {
    /// Maximum number of entries returned; `0` = unlimited.
    pub limit: usize,
}

/// Non-fatal diagnostics attached to a label query result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Annotation {
    /// The requested label has no column in any block.
    UnknownLabel { name: String },
}

impl fmt::Display for Annotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Annotation::UnknownLabel { name } => {
                write!(f, "label {:?} does not exist in any block", name)
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelQueryResult {
    /// Sorted ascending, deduplicated.
    pub values: Vec<String>,
    pub annotations: Vec<Annotation>,
}

/// Result of a select.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeriesSet {
    series: Vec<ChunkSeries>,
    sorted: bool,
}

impl SeriesSet {
    /// True when series are ordered by label set and merged across blocks.
    pub fn is_sorted(&self) -> bool {
        self.sorted
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ChunkSeries> {
        self.series.iter()
    }

    pub fn into_vec(self) -> Vec<ChunkSeries> {
        self.series
    }
}

impl IntoIterator for SeriesSet {
    type Item = ChunkSeries;
    type IntoIter = std::vec::IntoIter<ChunkSeries>;

    fn into_iter(self) -> Self::IntoIter {
        self.series.into_iter()
    }
}

impl<'a> IntoIterator for &'a SeriesSet {
    type Item = &'a ChunkSeries;
    type IntoIter = std::slice::Iter<'a, ChunkSeries>;

    fn into_iter(self) -> Self::IntoIter {
        self.series.iter()
    }
}

/// The query engine over a fixed set of blocks. Cheap to clone; clones share blocks.
#[derive(Debug, Clone)]
pub struct QueryEngine {
    blocks: Arc<[Block]>,
    config: EngineConfig,
}

impl QueryEngine {
    pub fn new(blocks: Vec<Block>) -> Self {
        Self::with_config(blocks, EngineConfig::default())
    }

    pub fn with_config(blocks: Vec<Block>, config: EngineConfig) -> Self {
        let blocks: Vec<Block> = blocks
            .into_iter()
            .map(|b| b.with_cancellation_check_interval(config.cancellation_check_interval))
            .collect();
        Self {
            blocks: blocks.into(),
            config,
        }
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn get_config(&self) -> &EngineConfig {
        &self.config
    }

    /// A querier over the window `[mint, maxt)`.
    pub fn querier(&self, mint: Timestamp, maxt: Timestamp) -> Querier {
        Querier {
            engine: self.clone(),
            mint,
            maxt,
        }
    }

    fn constraints(&self, matchers: &[Matcher]) -> Result<Vec<Constraint>, QueryError> {
        ConstraintBuilder::new()
            .with_max_regex_len(self.config.max_regex_len)
            .build(matchers)
    }

    fn scan_options(&self) -> ScanOptions<'_> {
        ScanOptions {
            parallel_row_groups: self.config.parallel_row_groups,
            listener: self.config.event_listener.as_ref(),
        }
    }

    fn listener(&self) -> &dyn QueryEventListener {
        self.config.event_listener.as_ref()
    }

    fn skip_block(&self, block: usize, reason: SkipReason) {
        query_metrics::record_block_skipped();
        self.listener()
            .on_event(QueryEvent::BlockSkipped { block, reason });
    }

    fn observe_failure<T>(&self, result: &Result<T, QueryError>) {
        if let Err(e) = result {
            if e.is_cancellation() {
                query_metrics::record_cancelled();
                self.listener().on_event(QueryEvent::QueryCancelled);
            } else {
                self.listener().on_event(QueryEvent::QueryFailed {
                    error: e.to_string(),
                });
            }
        }
    }
}

/// Read access to the engine for one time window.
#[derive(Debug, Clone)]
pub struct Querier {
    engine: QueryEngine,
    mint: Timestamp,
    maxt: Timestamp,
}

impl Querier {
    pub fn min_time(&self) -> Timestamp {
        self.mint
    }

    pub fn max_time(&self) -> Timestamp {
        self.maxt
    }

    /// Selects series matching every matcher, with chunks clipped to the window.
    ///
    /// With `sorted`, the result is ordered by label set and series with the same label
    /// set in several blocks are merged. Otherwise series are returned in block order
    /// and duplicates across blocks are kept. Any error fails the whole call.
    pub fn select(
        &self,
        ctx: &QueryContext,
        sorted: bool,
        hints: Option<&SelectHints>,
        matchers: &[Matcher],
    ) -> Result<SeriesSet, QueryError> {
        let started = Instant::now();
        let (mint, maxt) = hints.map_or((self.mint, self.maxt), |h| (h.start, h.end));
        let result = self.run_select(ctx, sorted, mint, maxt, matchers);
        self.engine.observe_failure(&result);

        let set = result?;
        let duration = started.elapsed();
        query_metrics::record_select(duration);
        self.engine.listener().on_event(QueryEvent::SelectCompleted {
            blocks: self.engine.blocks.len(),
            series: set.len(),
            duration,
        });
        Ok(set)
    }

    fn run_select(
        &self,
        ctx: &QueryContext,
        sorted: bool,
        mint: Timestamp,
        maxt: Timestamp,
        matchers: &[Matcher],
    ) -> Result<SeriesSet, QueryError> {
        check_time_range(mint, maxt)?;
        let constraints = self.engine.constraints(matchers)?;
        let opts = self.engine.scan_options();
        let blocks = &self.engine.blocks;

        let per_block = fan_out(ctx, blocks.len(), self.engine.config.parallel_blocks, |i| {
            let block = &blocks[i];
            if !block.schema().overlaps(mint, maxt) {
                self.engine.skip_block(i, SkipReason::OutsideTimeRange);
                return Ok(Vec::new());
            }
            let bound = block.bind(&constraints);
            if bound.is_unsatisfiable() {
                self.engine.skip_block(i, SkipReason::Unsatisfiable);
                return Ok(Vec::new());
            }
            block.select(ctx, &bound, mint, maxt, opts)
        })?;

        let mut series = Vec::with_capacity(self.engine.config.initial_series_capacity);
        for s in per_block {
            series.extend(s);
        }
        ctx.check()?;

        if sorted {
            series = merge_series(series);
        }
        Ok(SeriesSet { series, sorted })
    }

    /// Distinct label names of series matching `matchers`, across all blocks.
    pub fn label_names(
        &self,
        ctx: &QueryContext,
        hints: Option<&LabelHints>,
        matchers: &[Matcher],
    ) -> Result<LabelQueryResult, QueryError> {
        let started = Instant::now();
        let limit = hints.map_or(0, |h| h.limit);
        let result = self
            .collect_labels(ctx, matchers, |block, bound, opts| {
                block.label_names(ctx, bound, opts)
            })
            .map(|lists| LabelQueryResult {
                values: merge_unsorted_slices(limit, lists),
                annotations: Vec::new(),
            });
        self.finish_label_query(None, started, result)
    }

    /// Distinct non-empty values of label `name` on series matching `matchers`.
    pub fn label_values(
        &self,
        ctx: &QueryContext,
        name: &str,
        hints: Option<&LabelHints>,
        matchers: &[Matcher],
    ) -> Result<LabelQueryResult, QueryError> {
        let started = Instant::now();
        let limit = hints.map_or(0, |h| h.limit);
        let result = self
            .collect_labels(ctx, matchers, |block, bound, opts| {
                block.label_values(ctx, name, bound, opts)
            })
            .map(|lists| {
                let mut annotations = Vec::new();
                if !self
                    .engine
                    .blocks
                    .iter()
                    .any(|b| b.schema().label_column(name).is_some())
                {
                    annotations.push(Annotation::UnknownLabel {
                        name: name.to_string(),
                    });
                }
                LabelQueryResult {
                    values: merge_unsorted_slices(limit, lists),
                    annotations,
                }
            });
        self.finish_label_query(Some(name), started, result)
    }

    /// Runs a label-only scan on every block. Label queries are not restricted to the
    /// querier window.
    fn collect_labels<F>(
        &self,
        ctx: &QueryContext,
        matchers: &[Matcher],
        scan: F,
    ) -> Result<Vec<Vec<String>>, QueryError>
    where
        F: Fn(&Block, &BoundConstraintSet, ScanOptions<'_>) -> Result<Vec<String>, QueryError>
            + Sync
            + Send,
    {
        let constraints = self.engine.constraints(matchers)?;
        let opts = self.engine.scan_options();
        let blocks = &self.engine.blocks;
        let lists = fan_out(ctx, blocks.len(), self.engine.config.parallel_blocks, |i| {
            let block = &blocks[i];
            let bound = block.bind(&constraints);
            if bound.is_unsatisfiable() {
                self.engine.skip_block(i, SkipReason::Unsatisfiable);
                return Ok(Vec::new());
            }
            scan(block, &bound, opts)
        })?;
        ctx.check()?;
        Ok(lists)
    }

    fn finish_label_query(
        &self,
        label: Option<&str>,
        started: Instant,
        result: Result<LabelQueryResult, QueryError>,
    ) -> Result<LabelQueryResult, QueryError> {
        self.engine.observe_failure(&result);
        let out = result?;
        let duration = started.elapsed();
        query_metrics::record_label_query(duration);
        self.engine
            .listener()
            .on_event(QueryEvent::LabelQueryCompleted {
                label: label.map(str::to_string),
                values: out.values.len(),
                duration,
            });
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memfile::BlockBuilder;
    use crate::types::{Labels, Sample};
    use std::io::Write;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct Recorder(Mutex<Vec<QueryEvent>>);

    impl QueryEventListener for Recorder {
        fn on_event(&self, event: QueryEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    fn block(mint: i64, maxt: i64, series: &[&[(&str, &str)]]) -> Block {
        let mut b = BlockBuilder::new(mint, maxt);
        for pairs in series {
            b.add_samples(Labels::from_pairs(pairs), vec![Sample::new(mint, 1.0)])
                .unwrap();
        }
        b.build_block().unwrap()
    }

    #[test]
    fn empty_window_is_rejected() {
        let engine = QueryEngine::new(vec![block(0, 10, &[&[("job", "a")]])]);
        let err = engine
            .querier(10, 10)
            .select(&QueryContext::new(), true, None, &[])
            .unwrap_err();
        assert!(matches!(err, QueryError::InvalidTimeRange { start: 10, end: 10 }));
    }

    #[test]
    fn hints_override_window() {
        let engine = QueryEngine::new(vec![
            block(0, 10, &[&[("job", "a")]]),
            block(10, 20, &[&[("job", "b")]]),
        ]);
        let q = engine.querier(0, 10);
        let ctx = QueryContext::new();
        let set = q.select(&ctx, true, None, &[]).unwrap();
        assert_eq!(set.len(), 1);
        let set = q
            .select(&ctx, true, Some(&SelectHints { start: 0, end: 20 }), &[])
            .unwrap();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn events_report_skips_and_completion() {
        let recorder = Arc::new(Recorder::default());
        let config = EngineConfig {
            event_listener: recorder.clone(),
            parallel_blocks: false,
            ..EngineConfig::default()
        };
        let engine = QueryEngine::with_config(
            vec![block(0, 10, &[&[("job", "a")]]), block(100, 110, &[&[("env", "p")]])],
            config,
        );
        engine
            .querier(0, 50)
            .select(&QueryContext::new(), true, None, &[Matcher::equal("job", "a")])
            .unwrap();

        let events = recorder.0.lock().unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            QueryEvent::BlockSkipped { block: 1, reason: SkipReason::OutsideTimeRange }
        )));
        assert!(events
            .iter()
            .any(|e| matches!(e, QueryEvent::SelectCompleted { series: 1, .. })));
    }

    #[test]
    fn failures_and_cancellation_are_reported() {
        let recorder = Arc::new(Recorder::default());
        let config = EngineConfig {
            event_listener: recorder.clone(),
            ..EngineConfig::default()
        };
        let engine = QueryEngine::with_config(vec![block(0, 10, &[&[("job", "a")]])], config);
        let q = engine.querier(0, 10);

        let ctx = QueryContext::new();
        ctx.cancel();
        assert!(q.select(&ctx, false, None, &[]).unwrap_err().is_cancellation());
        assert!(q
            .label_names(&QueryContext::new(), None, &[Matcher::regex("job", "(")])
            .is_err());

        let events = recorder.0.lock().unwrap();
        assert!(matches!(events[0], QueryEvent::QueryCancelled));
        assert!(matches!(events[1], QueryEvent::QueryFailed { .. }));
    }

    #[test]
    fn unknown_label_is_annotated() {
        let engine = QueryEngine::new(vec![block(0, 10, &[&[("job", "a")]])]);
        let q = engine.querier(0, 10);
        let ctx = QueryContext::new();
        let res = q.label_values(&ctx, "job", None, &[]).unwrap();
        assert_eq!(res.values, vec!["a"]);
        assert!(res.annotations.is_empty());
        let res = q.label_values(&ctx, "nope", None, &[]).unwrap();
        assert!(res.values.is_empty());
        assert_eq!(
            res.annotations,
            vec![Annotation::UnknownLabel {
                name: "nope".to_string()
            }]
        );
    }

    #[test]
    fn file_config_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "parallel_blocks = false").unwrap();
        writeln!(f, "max_regex_len = 64").unwrap();
        drop(f);

        let partial = EngineFileConfig::load(Some(&path)).unwrap();
        assert_eq!(partial.parallel_blocks, Some(false));
        assert_eq!(partial.parallel_row_groups, None);

        let mut config = EngineConfig::default();
        config.apply_file_config(&partial);
        assert!(!config.parallel_blocks);
        assert!(config.parallel_row_groups);
        assert_eq!(config.max_regex_len, 64);

        assert!(matches!(
            EngineFileConfig::load(Some(&dir.path().join("missing.toml"))),
            Err(QueryError::ConfigError(_))
        ));
    }
}
