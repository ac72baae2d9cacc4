//! Cross-block merging of series and label lists.

use crate::types::{Chunk, ChunkSeries, Sample};

use std::collections::BTreeSet;

/// Sorts series by label set and merges series with identical label sets.
///
/// Every output series has time-ordered, non-overlapping chunks: overlapping chunks
/// are combined sample by sample, and a timestamp present in several inputs is kept
/// once.
pub fn merge_series(mut series: Vec<ChunkSeries>) -> Vec<ChunkSeries> {
    series.sort_by(|a, b| a.labels.cmp(&b.labels));

    let mut out: Vec<ChunkSeries> = Vec::with_capacity(series.len());
    for mut s in series {
        match out.last_mut() {
            Some(last) if last.labels == s.labels => {
                let chunks = std::mem::take(&mut last.chunks);
                last.chunks = merge_chunks(chunks, s.chunks);
            }
            _ => {
                s.chunks = compact_chunks(s.chunks);
                out.push(s);
            }
        }
    }
    out
}

/// Time-ordered union of two chunk sequences without overlap or duplicate samples.
pub fn merge_chunks(mut a: Vec<Chunk>, b: Vec<Chunk>) -> Vec<Chunk> {
    a.extend(b);
    compact_chunks(a)
}

/// Sorts chunks by time and combines every overlapping run into one chunk.
///
/// Identical chunks collapse into one. For a timestamp held by several overlapping
/// chunks, the sample of the chunk that sorts first wins.
pub fn compact_chunks(mut chunks: Vec<Chunk>) -> Vec<Chunk> {
    chunks.sort_by_key(|c| (c.min_time, c.max_time));

    let mut out: Vec<Chunk> = Vec::with_capacity(chunks.len());
    for c in chunks {
        match out.last_mut() {
            Some(last) if c.min_time <= last.max_time => {
                if last.is_identical(&c) {
                    continue;
                }
                let merged = merge_samples(std::mem::take(&mut last.samples), c.samples);
                last.max_time = merged.last().map_or(last.max_time, |s| s.timestamp);
                last.samples = merged;
            }
            _ => out.push(c),
        }
    }
    out
}

/// Two-way merge of timestamp-sorted samples; on equal timestamps `a` wins.
fn merge_samples(a: Vec<Sample>, b: Vec<Sample>) -> Vec<Sample> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let mut a = a.into_iter().peekable();
    let mut b = b.into_iter().peekable();
    loop {
        let next = match (a.peek().copied(), b.peek().copied()) {
            (Some(x), Some(y)) if x.timestamp < y.timestamp => a.next(),
            (Some(x), Some(y)) if x.timestamp > y.timestamp => b.next(),
            (Some(_), Some(_)) => {
                b.next();
                a.next()
            }
            (Some(_), None) => a.next(),
            (None, Some(_)) => b.next(),
            (None, None) => break,
        };
        out.extend(next);
    }
    out
}

/// Merges per-block label lists: deduplicates, sorts ascending and keeps the first
/// `limit` entries (`0` = unlimited).
pub fn merge_unsorted_slices<I>(limit: usize, lists: I) -> Vec<String>
where
    I: IntoIterator<Item = Vec<String>>,
{
    let all: BTreeSet<String> = lists.into_iter().flatten().collect();
    if limit > 0 {
        all.into_iter().take(limit).collect()
    } else {
        all.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Labels;

    fn chunk(from: i64, to: i64) -> Chunk {
        Chunk::from_samples((from..to).map(|t| Sample::new(t, t as f64)).collect()).unwrap()
    }

    fn series(job: &str, chunks: Vec<Chunk>) -> ChunkSeries {
        ChunkSeries::new(Labels::from_pairs(&[("job", job)]), chunks)
    }

    #[test]
    fn identical_label_sets_merge_in_time_order() {
        let merged = merge_series(vec![
            series("x", vec![chunk(100, 200)]),
            series("a", vec![chunk(0, 10)]),
            series("x", vec![chunk(0, 100)]),
        ]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].labels.get("job"), Some("a"));
        let bounds: Vec<_> = merged[1].chunks.iter().map(|c| (c.min_time, c.max_time)).collect();
        assert_eq!(bounds, vec![(0, 99), (100, 199)]);
    }

    #[test]
    fn identical_chunks_collapse() {
        let merged = merge_chunks(vec![chunk(0, 10), chunk(20, 30)], vec![chunk(0, 10)]);
        let bounds: Vec<_> = merged.iter().map(|c| (c.min_time, c.max_time)).collect();
        assert_eq!(bounds, vec![(0, 9), (20, 29)]);
        assert_eq!(merged.iter().map(Chunk::len).sum::<usize>(), 20);
    }

    #[test]
    fn overlapping_chunks_combine_without_duplicate_timestamps() {
        let mut first = chunk(0, 10);
        first.samples[7].value = -1.0;
        let merged = merge_chunks(
            vec![first, chunk(40, 50)],
            vec![chunk(0, 10), chunk(5, 20), chunk(19, 25)],
        );

        let bounds: Vec<_> = merged.iter().map(|c| (c.min_time, c.max_time)).collect();
        assert_eq!(bounds, vec![(0, 24), (40, 49)]);
        let ts: Vec<i64> = merged[0].samples.iter().map(|s| s.timestamp).collect();
        assert_eq!(ts, (0..25).collect::<Vec<_>>());
        // The chunk sorting first keeps its sample on a shared timestamp.
        assert_eq!(merged[0].samples[7].value, -1.0);
    }

    #[test]
    fn single_series_chunks_are_compacted() {
        let merged = merge_series(vec![series("x", vec![chunk(10, 30), chunk(0, 15)])]);
        let bounds: Vec<_> = merged[0].chunks.iter().map(|c| (c.min_time, c.max_time)).collect();
        assert_eq!(bounds, vec![(0, 29)]);
        assert_eq!(merged[0].chunks[0].len(), 30);
    }

    #[test]
    fn label_lists_dedup_sort_and_limit() {
        let lists = vec![
            vec!["b".to_string(), "a".to_string()],
            vec!["c".to_string(), "a".to_string()],
            vec![],
        ];
        assert_eq!(merge_unsorted_slices(0, lists.clone()), vec!["a", "b", "c"]);
        assert_eq!(merge_unsorted_slices(2, lists.clone()), vec!["a", "b"]);
        assert_eq!(merge_unsorted_slices(10, lists), vec!["a", "b", "c"]);
        assert!(merge_unsorted_slices(3, Vec::<Vec<String>>::new()).is_empty());
    }
}
