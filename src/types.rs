use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp type (milliseconds since epoch).
pub type Timestamp = i64;

/// Value type.
pub type Value = f64;

/// A single name/value label pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub value: String,
}

/// Canonical label set: names unique, sorted by name, no empty values.
///
/// The derived ordering compares label by label (name, then value) and orders a
/// strict prefix first, which is the canonical label-set comparison used for
/// sorted selects.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Labels(Vec<Label>);

impl Labels {
    /// Builds a canonical label set. Empty values are dropped (an empty label is the
    /// same as an absent one); for duplicate names the last value wins.
    pub fn new<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut labels: Vec<Label> = Vec::new();
        for (name, value) in pairs {
            let name = name.into();
            let value = value.into();
            labels.retain(|l| l.name != name);
            if !value.is_empty() {
                labels.push(Label { name, value });
            }
        }
        labels.sort_by(|a, b| a.name.cmp(&b.name));
        Labels(labels)
    }

    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        Self::new(pairs.iter().copied())
    }

    /// Returns the value of `name`, or `None` when the label is absent.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .binary_search_by(|l| l.name.as_str().cmp(name))
            .ok()
            .map(|i| self.0[i].value.as_str())
    }

    /// Value of `name` with absence mapped to the empty string.
    pub fn value_or_empty(&self, name: &str) -> &str {
        self.get(name).unwrap_or("")
    }

    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.0.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|l| l.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, l) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={:?}", l.name, l.value)?;
        }
        f.write_str("}")
    }
}

/// Represents a single decoded sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: Timestamp,
    pub value: Value,
}

impl Sample {
    pub fn new(timestamp: Timestamp, value: Value) -> Self {
        Self { timestamp, value }
    }
}

/// A decoded chunk of samples, sorted by timestamp.
///
/// `min_time` and `max_time` are the first and last sample timestamps (both inclusive).
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub min_time: Timestamp,
    pub max_time: Timestamp,
    pub samples: Vec<Sample>,
}

impl Chunk {
    /// Builds a chunk from samples sorted by timestamp. Returns `None` for an empty slice.
    pub fn from_samples(samples: Vec<Sample>) -> Option<Self> {
        let min_time = samples.first()?.timestamp;
        let max_time = samples.last()?.timestamp;
        Some(Self {
            min_time,
            max_time,
            samples,
        })
    }

    /// True if any part of the chunk falls inside the half-open window `[mint, maxt)`.
    #[inline]
    pub fn overlaps(&self, mint: Timestamp, maxt: Timestamp) -> bool {
        self.max_time >= mint && self.min_time < maxt
    }

    /// Restricts the chunk to `[mint, maxt)`.
    ///
    /// Returns `None` when no sample falls inside the window. A chunk wholly inside the
    /// window is returned unchanged.
    pub fn clip(self, mint: Timestamp, maxt: Timestamp) -> Option<Self> {
        if !self.overlaps(mint, maxt) {
            return None;
        }
        if self.min_time >= mint && self.max_time < maxt {
            return Some(self);
        }
        let start = self.samples.partition_point(|s| s.timestamp < mint);
        let end = self.samples.partition_point(|s| s.timestamp < maxt);
        if start >= end {
            return None;
        }
        Self::from_samples(self.samples[start..end].to_vec())
    }

    /// Bitwise sample equality (NaN-safe), used to drop duplicate chunks when merging.
    pub fn is_identical(&self, other: &Chunk) -> bool {
        self.min_time == other.min_time
            && self.max_time == other.max_time
            && self.samples.len() == other.samples.len()
            && self
                .samples
                .iter()
                .zip(other.samples.iter())
                .all(|(a, b)| a.timestamp == b.timestamp && a.value.to_bits() == b.value.to_bits())
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// One time series' label set plus its chunks for the queried window, ordered by time.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkSeries {
    pub labels: Labels,
    pub chunks: Vec<Chunk>,
}

impl ChunkSeries {
    pub fn new(labels: Labels, chunks: Vec<Chunk>) -> Self {
        Self { labels, chunks }
    }

    /// Iterates all samples across chunks in chunk order.
    pub fn samples(&self) -> impl Iterator<Item = &Sample> {
        self.chunks.iter().flat_map(|c| c.samples.iter())
    }
}
