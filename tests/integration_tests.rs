use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use blockquery::*;

// Helper: samples every `step` from `from` (inclusive) to `to` (exclusive).
fn ramp(from: Timestamp, to: Timestamp, step: usize) -> Vec<Sample> {
    (from..to)
        .step_by(step)
        .map(|t| Sample::new(t, t as f64 * 0.5))
        .collect()
}

fn labels(pairs: &[(&str, &str)]) -> Labels {
    Labels::from_pairs(pairs)
}

fn sequential() -> EngineConfig {
    EngineConfig {
        parallel_blocks: false,
        parallel_row_groups: false,
        ..EngineConfig::default()
    }
}

fn names(set: &SeriesSet) -> Vec<String> {
    set.iter().map(|s| s.labels.to_string()).collect()
}

#[test]
fn test_two_blocks_merge_into_one_series() {
    let mut a = BlockBuilder::new(0, 100);
    a.add_samples(labels(&[("job", "x")]), ramp(0, 100, 10)).unwrap();
    let mut b = BlockBuilder::new(100, 200);
    b.add_samples(labels(&[("job", "x")]), ramp(100, 200, 10)).unwrap();

    let engine = QueryEngine::new(vec![a.build_block().unwrap(), b.build_block().unwrap()]);
    let set = engine
        .querier(0, 200)
        .select(&QueryContext::new(), true, None, &[Matcher::equal("job", "x")])
        .unwrap();

    assert!(set.is_sorted());
    assert_eq!(set.len(), 1);
    let series = set.iter().next().unwrap();
    assert_eq!(series.labels, labels(&[("job", "x")]));
    let bounds: Vec<_> = series.chunks.iter().map(|c| (c.min_time, c.max_time)).collect();
    assert_eq!(bounds, vec![(0, 90), (100, 190)]);
    assert_eq!(series.samples().count(), 20);
}

#[test]
fn test_unsorted_select_keeps_cross_block_duplicates() {
    let mut a = BlockBuilder::new(0, 100);
    a.add_samples(labels(&[("job", "x")]), ramp(0, 100, 10)).unwrap();
    let mut b = BlockBuilder::new(100, 200);
    b.add_samples(labels(&[("job", "x")]), ramp(100, 200, 10)).unwrap();
    let engine = QueryEngine::new(vec![a.build_block().unwrap(), b.build_block().unwrap()]);

    let set = engine
        .querier(0, 200)
        .select(&QueryContext::new(), false, None, &[])
        .unwrap();
    assert!(!set.is_sorted());
    assert_eq!(set.len(), 2);
}

#[test]
fn test_identical_chunks_from_overlapping_blocks_are_not_duplicated() {
    let build = || {
        let mut b = BlockBuilder::new(0, 100);
        b.add_samples(labels(&[("job", "x")]), ramp(0, 100, 5)).unwrap();
        b.build_block().unwrap()
    };
    let engine = QueryEngine::new(vec![build(), build()]);
    let set = engine
        .querier(0, 100)
        .select(&QueryContext::new(), true, None, &[])
        .unwrap();
    assert_eq!(set.len(), 1);
    assert_eq!(set.iter().next().unwrap().samples().count(), 20);
}

#[test]
fn test_overlapping_blocks_merge_without_duplicate_samples() {
    let mut a = BlockBuilder::new(0, 20);
    a.add_samples(labels(&[("job", "x")]), ramp(0, 20, 1)).unwrap();
    let mut b = BlockBuilder::new(10, 30);
    b.add_samples(labels(&[("job", "x")]), ramp(10, 30, 1)).unwrap();
    let engine = QueryEngine::new(vec![a.build_block().unwrap(), b.build_block().unwrap()]);

    let set = engine
        .querier(0, 30)
        .select(&QueryContext::new(), true, None, &[Matcher::equal("job", "x")])
        .unwrap();
    assert_eq!(set.len(), 1);
    let series = set.iter().next().unwrap();
    assert!(series
        .chunks
        .windows(2)
        .all(|w| w[0].max_time < w[1].min_time));
    let ts: Vec<Timestamp> = series.samples().map(|s| s.timestamp).collect();
    assert_eq!(ts, (0..30).collect::<Vec<_>>());
}

#[test]
fn test_regex_dot_matches_newline_in_values() {
    let mut b = BlockBuilder::new(0, 100);
    b.add_samples(labels(&[("job", "a\nb")]), ramp(0, 10, 1)).unwrap();
    let engine = QueryEngine::new(vec![b.build_block().unwrap()]);
    let q = engine.querier(0, 100);
    let ctx = QueryContext::new();

    for pattern in [".*", "(.*)", ".+", "a.+", "a.b"] {
        let set = q
            .select(&ctx, true, None, &[Matcher::regex("job", pattern)])
            .unwrap();
        assert_eq!(set.len(), 1, "pattern {:?}", pattern);
    }
    let set = q
        .select(&ctx, true, None, &[Matcher::not_regex("job", "(.*)")])
        .unwrap();
    assert!(set.is_empty());
}

#[test]
fn test_empty_equality_matches_absent_label() {
    let mut b = BlockBuilder::new(0, 100);
    b.add_samples(labels(&[("job", "api"), ("instance", "1")]), ramp(0, 10, 1))
        .unwrap();
    b.add_samples(labels(&[("instance", "2")]), ramp(0, 10, 1)).unwrap();
    b.add_samples(labels(&[("instance", "3"), ("env", "prod")]), ramp(0, 10, 1))
        .unwrap();
    let engine = QueryEngine::new(vec![b.build_block().unwrap()]);
    let q = engine.querier(0, 100);
    let ctx = QueryContext::new();

    let set = q.select(&ctx, true, None, &[Matcher::equal("job", "")]).unwrap();
    assert_eq!(
        names(&set),
        vec![r#"{env="prod", instance="3"}"#, r#"{instance="2"}"#]
    );

    // A label no block has: positive matchers select nothing, negative ones everything.
    assert!(q
        .select(&ctx, true, None, &[Matcher::equal("team", "core")])
        .unwrap()
        .is_empty());
    assert_eq!(
        q.select(&ctx, true, None, &[Matcher::not_equal("team", "core")])
            .unwrap()
            .len(),
        3
    );
    assert_eq!(
        q.select(&ctx, true, None, &[Matcher::equal("team", "")]).unwrap().len(),
        3
    );
}

#[test]
fn test_select_clips_to_window() {
    let mut b = BlockBuilder::new(0, 1000).with_data_col_duration(250);
    b.add_samples(labels(&[("job", "x")]), ramp(0, 1000, 1)).unwrap();
    let engine = QueryEngine::new(vec![b.build_block().unwrap()]);
    let set = engine
        .querier(0, 1000)
        .select(
            &QueryContext::new(),
            true,
            Some(&SelectHints {
                start: 240,
                end: 510,
            }),
            &[],
        )
        .unwrap();
    let ts: Vec<Timestamp> = set
        .iter()
        .flat_map(|s| s.samples().map(|x| x.timestamp))
        .collect();
    assert_eq!(ts, (240..510).collect::<Vec<_>>());
}

#[test]
fn test_label_queries_merge_dedup_and_limit() {
    let mut a = BlockBuilder::new(0, 100);
    a.add_samples(labels(&[("job", "web"), ("zone", "a")]), ramp(0, 10, 1)).unwrap();
    a.add_samples(labels(&[("job", "api")]), ramp(0, 10, 1)).unwrap();
    let mut b = BlockBuilder::new(100, 200);
    b.add_samples(labels(&[("job", "db"), ("env", "p")]), ramp(100, 110, 1)).unwrap();
    b.add_samples(labels(&[("job", "api")]), ramp(100, 110, 1)).unwrap();

    let engine = QueryEngine::new(vec![a.build_block().unwrap(), b.build_block().unwrap()]);
    let q = engine.querier(0, 200);
    let ctx = QueryContext::new();

    let all = q.label_values(&ctx, "job", None, &[]).unwrap();
    assert_eq!(all.values, vec!["api", "db", "web"]);

    let limited = q
        .label_values(&ctx, "job", Some(&LabelHints { limit: 2 }), &[])
        .unwrap();
    assert_eq!(limited.values, vec!["api", "db"]);

    let unlimited = q
        .label_values(&ctx, "job", Some(&LabelHints { limit: 0 }), &[])
        .unwrap();
    assert_eq!(unlimited.values, all.values);

    let names = q.label_names(&ctx, None, &[]).unwrap();
    assert_eq!(names.values, vec!["env", "job", "zone"]);

    let names = q
        .label_names(&ctx, None, &[Matcher::equal("job", "api")])
        .unwrap();
    assert_eq!(names.values, vec!["job"]);

    let values = q
        .label_values(&ctx, "zone", None, &[Matcher::regex("job", "w.*")])
        .unwrap();
    assert_eq!(values.values, vec!["a"]);
    assert!(values.annotations.is_empty());
}

#[test]
fn test_statistics_pruning_avoids_page_reads() {
    let mut b = BlockBuilder::new(0, 100).with_row_group_size(2);
    for job in ["a", "b", "c", "d"] {
        b.add_samples(labels(&[("job", job)]), ramp(0, 10, 1)).unwrap();
    }
    let (l, c) = b.build().unwrap();
    let (l, c) = (Arc::new(l), Arc::new(c));
    let block = Block::new(l.clone(), c.clone(), Arc::new(XorChunksDecoder)).unwrap();
    assert_eq!(block.num_row_groups(), 2);

    let engine = QueryEngine::with_config(vec![block], sequential());
    let set = engine
        .querier(0, 100)
        .select(&QueryContext::new(), true, None, &[Matcher::equal("job", "c")])
        .unwrap();
    assert_eq!(names(&set), vec![r#"{job="c"}"#]);

    // Row group 0 is pruned from statistics; row group 1 is filtered and materialized.
    assert_eq!(l.page_reads(), 2);
    assert_eq!(c.page_reads(), 1);

    // No row group can hold "zz": nothing is read at all.
    engine
        .querier(0, 100)
        .select(&QueryContext::new(), true, None, &[Matcher::equal("job", "zz")])
        .unwrap();
    assert_eq!(l.page_reads(), 2);
    assert_eq!(c.page_reads(), 1);
}

#[test]
fn test_cancelled_before_start_returns_no_series() {
    let mut b = BlockBuilder::new(0, 100);
    b.add_samples(labels(&[("job", "x")]), ramp(0, 100, 1)).unwrap();
    let engine = QueryEngine::new(vec![b.build_block().unwrap()]);
    let q = engine.querier(0, 100);

    let ctx = QueryContext::new();
    ctx.cancel_handle().cancel();
    assert!(matches!(
        q.select(&ctx, true, None, &[]),
        Err(QueryError::Cancelled)
    ));
    assert!(q.label_names(&ctx, None, &[]).unwrap_err().is_cancellation());
    assert!(q.label_values(&ctx, "job", None, &[]).unwrap_err().is_cancellation());

    let expired = QueryContext::new().with_deadline(Instant::now());
    assert!(matches!(
        q.select(&expired, true, None, &[]),
        Err(QueryError::DeadlineExceeded)
    ));
    assert!(q
        .select(&QueryContext::new().with_timeout(Duration::from_secs(60)), true, None, &[])
        .is_ok());
}

/// Decoder that cancels the query the first time it is called.
#[derive(Debug)]
struct CancellingDecoder {
    handle: CancelHandle,
    calls: AtomicUsize,
}

impl ChunksDecoder for CancellingDecoder {
    fn decode(
        &self,
        data: &[u8],
        mint: Timestamp,
        maxt: Timestamp,
    ) -> Result<Vec<Chunk>, QueryError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.handle.cancel();
        XorChunksDecoder.decode(data, mint, maxt)
    }
}

#[test]
fn test_cancellation_mid_scan_aborts() {
    let mut b = BlockBuilder::new(0, 100);
    for i in 0..50 {
        b.add_samples(labels(&[("i", &i.to_string())]), ramp(0, 10, 1)).unwrap();
    }
    let (l, c) = b.build().unwrap();

    let ctx = QueryContext::new();
    let decoder = Arc::new(CancellingDecoder {
        handle: ctx.cancel_handle(),
        calls: AtomicUsize::new(0),
    });
    let block = Block::new(Arc::new(l), Arc::new(c), decoder.clone()).unwrap();
    let engine = QueryEngine::with_config(
        vec![block],
        EngineConfig {
            cancellation_check_interval: 1,
            ..sequential()
        },
    );

    let err = engine.querier(0, 100).select(&ctx, true, None, &[]).unwrap_err();
    assert!(err.is_cancellation());
    assert_eq!(decoder.calls.load(Ordering::Relaxed), 1);
}

#[derive(Debug)]
struct FailingDecoder;

impl ChunksDecoder for FailingDecoder {
    fn decode(&self, _: &[u8], _: Timestamp, _: Timestamp) -> Result<Vec<Chunk>, QueryError> {
        Err(QueryError::Decode {
            details: "bad chunk".to_string(),
            series: None,
            row_group: None,
        })
    }
}

#[test]
fn test_decode_error_aborts_whole_query() {
    let mut good = BlockBuilder::new(0, 100);
    good.add_samples(labels(&[("job", "ok")]), ramp(0, 10, 1)).unwrap();
    let mut bad = BlockBuilder::new(0, 100);
    bad.add_samples(labels(&[("job", "broken")]), ramp(0, 10, 1)).unwrap();
    let (l, c) = bad.build().unwrap();
    let bad = Block::new(Arc::new(l), Arc::new(c), Arc::new(FailingDecoder)).unwrap();

    let engine = QueryEngine::new(vec![good.build_block().unwrap(), bad]);
    let err = engine
        .querier(0, 100)
        .select(&QueryContext::new(), true, None, &[])
        .unwrap_err();
    match err {
        QueryError::Decode {
            series, row_group, ..
        } => {
            assert_eq!(series.as_deref(), Some(r#"{job="broken"}"#));
            assert_eq!(row_group, Some(0));
        }
        other => panic!("expected decode error, got {:?}", other),
    }

    // Label queries never touch chunks.
    let values = engine
        .querier(0, 100)
        .label_values(&QueryContext::new(), "job", None, &[])
        .unwrap();
    assert_eq!(values.values, vec!["broken", "ok"]);
}

#[test]
fn test_invalid_matcher_fails_before_io() {
    let mut b = BlockBuilder::new(0, 100);
    b.add_samples(labels(&[("job", "x")]), ramp(0, 10, 1)).unwrap();
    let (l, c) = b.build().unwrap();
    let (l, c) = (Arc::new(l), Arc::new(c));
    let engine = QueryEngine::new(vec![
        Block::new(l.clone(), c.clone(), Arc::new(XorChunksDecoder)).unwrap(),
    ]);
    let err = engine
        .querier(0, 100)
        .select(&QueryContext::new(), true, None, &[Matcher::regex("job", "[")])
        .unwrap_err();
    assert!(matches!(err, QueryError::InvalidMatcher { .. }));
    assert_eq!(l.page_reads() + c.page_reads(), 0);
}

#[test]
fn test_mismatched_files_are_a_schema_error() {
    let mut a = BlockBuilder::new(0, 100);
    a.add_samples(labels(&[("job", "x")]), ramp(0, 10, 1)).unwrap();
    let mut b = BlockBuilder::new(0, 100);
    b.add_samples(labels(&[("job", "x")]), ramp(0, 10, 1)).unwrap();
    b.add_samples(labels(&[("job", "y")]), ramp(0, 10, 1)).unwrap();
    let (la, _) = a.build().unwrap();
    let (_, cb) = b.build().unwrap();

    let err = Block::new(Arc::new(la), Arc::new(cb), Arc::new(XorChunksDecoder)).unwrap_err();
    assert!(matches!(err, QueryError::Schema(_)));

    let empty = MemColumnarFile::new(Vec::new(), Default::default());
    let err = Block::new(
        Arc::new(empty),
        Arc::new(MemColumnarFile::new(Vec::new(), Default::default())),
        Arc::new(XorChunksDecoder),
    )
    .unwrap_err();
    assert!(matches!(err, QueryError::Schema(_)));
}

#[test]
fn test_blocks_round_trip_through_disk() {
    let dir = tempfile::tempdir().unwrap();
    let mut b = BlockBuilder::new(0, 100)
        .with_row_group_size(3)
        .with_float_encoding(FloatEncoding::Raw64);
    for i in 0..10 {
        b.add_samples(
            labels(&[("job", if i % 2 == 0 { "even" } else { "odd" }), ("i", &i.to_string())]),
            ramp(0, 100, 7),
        )
        .unwrap();
    }
    let (l, c) = b.build().unwrap();
    l.write_to(dir.path().join("labels.bqc")).unwrap();
    c.write_to(dir.path().join("chunks.bqc")).unwrap();

    let in_memory = QueryEngine::new(vec![
        Block::new(Arc::new(l), Arc::new(c), Arc::new(XorChunksDecoder)).unwrap(),
    ]);
    let reopened = QueryEngine::new(vec![Block::new(
        Arc::new(MemColumnarFile::open(dir.path().join("labels.bqc")).unwrap()),
        Arc::new(MemColumnarFile::open(dir.path().join("chunks.bqc")).unwrap()),
        Arc::new(XorChunksDecoder),
    )
    .unwrap()]);

    let ctx = QueryContext::new();
    let ms = [Matcher::equal("job", "odd"), Matcher::not_regex("i", "3|5")];
    let expected = in_memory.querier(10, 60).select(&ctx, true, None, &ms).unwrap();
    let actual = reopened.querier(10, 60).select(&ctx, true, None, &ms).unwrap();
    assert_eq!(expected.len(), 3);
    assert_eq!(expected, actual);

    std::fs::write(dir.path().join("junk.bqc"), b"not a block file").unwrap();
    assert!(MemColumnarFile::open(dir.path().join("junk.bqc")).is_err());
}

#[test]
fn test_parallel_and_sequential_agree() {
    let mut blocks = Vec::new();
    for k in 0..4 {
        let mut b = BlockBuilder::new(k * 100, (k + 1) * 100).with_row_group_size(5);
        for i in 0..40 {
            b.add_samples(
                labels(&[("series", &(i % 13).to_string()), ("shard", &(i % 3).to_string())]),
                ramp(k * 100 + i, (k + 1) * 100, 9),
            )
            .unwrap();
        }
        blocks.push(b.build_block().unwrap());
    }
    let parallel = QueryEngine::new(blocks.clone());
    let serial = QueryEngine::with_config(blocks, sequential());

    let ctx = QueryContext::new();
    let ms = [Matcher::regex("series", "1.*"), Matcher::not_equal("shard", "2")];
    let a = parallel.querier(50, 350).select(&ctx, true, None, &ms).unwrap();
    let b = serial.querier(50, 350).select(&ctx, true, None, &ms).unwrap();
    assert!(!a.is_empty());
    assert_eq!(a, b);
}
