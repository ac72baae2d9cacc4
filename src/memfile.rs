//! In-memory columnar files and a block builder.
//!
//! [`MemColumnarFile`] is a self-contained implementation of [`ColumnarFile`]: UTF-8
//! columns are dictionary encoded, every row group carries min/max/null-count
//! statistics, and the whole file can be persisted as a CRC-checked bincode image.
//! [`BlockBuilder`] lays series out into a labels file and a chunks file following the
//! block schema conventions.

use crate::block::Block;
use crate::columnar::{
    ColumnDescriptor, ColumnStatistics, ColumnType, ColumnarFile, RowGroupReader, RowSet,
};
use crate::encoding::{FloatEncoding, XorChunksDecoder, XorChunksEncoder};
use crate::error::{ColumnarError, QueryError};
use crate::schema::{
    chunk_column_name, label_column_name, META_DATA_COL_DURATION, META_MAX_TIME, META_MIN_TIME,
};
use crate::types::{Chunk, Labels, Sample, Timestamp};

use bytes::Bytes;
use crc32fast::Hasher as Crc32;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const COLUMNAR_MAGIC: &[u8; 8] = b"BQCOLF01";
const COLUMNAR_VERSION: u32 = 1;

pub const DEFAULT_ROW_GROUP_SIZE: usize = 1024;
pub const DEFAULT_SAMPLES_PER_CHUNK: usize = 120;

/// Which metadata a writer records for each row group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOptions {
    /// Record min/max/null-count statistics.
    pub statistics: bool,
    /// Expose the dictionary of UTF-8 columns to readers.
    pub dictionary: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            statistics: true,
            dictionary: true,
        }
    }
}

/// Column values for one row group, as handed to the writer.
#[derive(Debug, Clone)]
pub enum ColumnValues {
    Utf8(Vec<Option<String>>),
    Binary(Vec<Option<Bytes>>),
}

impl ColumnValues {
    fn len(&self) -> usize {
        match self {
            ColumnValues::Utf8(v) => v.len(),
            ColumnValues::Binary(v) => v.len(),
        }
    }

    fn column_type(&self) -> ColumnType {
        match self {
            ColumnValues::Utf8(_) => ColumnType::Utf8,
            ColumnValues::Binary(_) => ColumnType::Binary,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
enum ColumnData {
    Utf8 {
        /// Sorted distinct values.
        dictionary: Vec<String>,
        keys: Vec<Option<u32>>,
        expose_dictionary: bool,
    },
    Binary {
        values: Vec<Option<Bytes>>,
    },
}

impl ColumnData {
    fn column_type(&self) -> ColumnType {
        match self {
            ColumnData::Utf8 { .. } => ColumnType::Utf8,
            ColumnData::Binary { .. } => ColumnType::Binary,
        }
    }
}

/// A row group held in memory.
#[derive(Debug, Serialize, Deserialize)]
pub struct MemRowGroup {
    num_rows: u32,
    columns: Vec<ColumnData>,
    statistics: Vec<Option<ColumnStatistics>>,
    /// Number of `read_*` calls served (page reads).
    #[serde(skip)]
    page_reads: AtomicU64,
}

impl MemRowGroup {
    pub fn new(values: Vec<ColumnValues>, options: WriteOptions) -> Result<Self, ColumnarError> {
        let num_rows = values.first().map_or(0, |v| v.len());
        let num_rows_u32: u32 = num_rows
            .try_into()
            .map_err(|_| ColumnarError::Corrupt("row group too large".to_string()))?;

        let mut columns = Vec::with_capacity(values.len());
        let mut statistics = Vec::with_capacity(values.len());
        for (idx, col) in values.into_iter().enumerate() {
            if col.len() != num_rows {
                return Err(ColumnarError::Corrupt(format!(
                    "column {} has {} rows, expected {}",
                    idx,
                    col.len(),
                    num_rows
                )));
            }
            match col {
                ColumnValues::Utf8(vals) => {
                    let uniq: BTreeSet<&str> = vals.iter().flatten().map(String::as_str).collect();
                    let dictionary: Vec<String> = uniq.into_iter().map(str::to_string).collect();
                    let keys = vals
                        .iter()
                        .map(|v| {
                            v.as_deref().map(|s| {
                                // Present by construction.
                                dictionary
                                    .binary_search_by(|d| d.as_str().cmp(s))
                                    .unwrap_or_default() as u32
                            })
                        })
                        .collect();
                    let null_count = vals.iter().filter(|v| v.is_none()).count() as u32;
                    statistics.push(options.statistics.then(|| ColumnStatistics {
                        min: dictionary.first().cloned(),
                        max: dictionary.last().cloned(),
                        null_count,
                    }));
                    columns.push(ColumnData::Utf8 {
                        dictionary,
                        keys,
                        expose_dictionary: options.dictionary,
                    });
                }
                ColumnValues::Binary(values) => {
                    let null_count = values.iter().filter(|v| v.is_none()).count() as u32;
                    statistics.push(options.statistics.then(|| ColumnStatistics {
                        min: None,
                        max: None,
                        null_count,
                    }));
                    columns.push(ColumnData::Binary { values });
                }
            }
        }

        Ok(Self {
            num_rows: num_rows_u32,
            columns,
            statistics,
            page_reads: AtomicU64::new(0),
        })
    }

    pub fn page_reads(&self) -> u64 {
        self.page_reads.load(Ordering::Relaxed)
    }

    /// Checks that a decoded row group agrees with the file columns and its own row count.
    fn validate(&self, descriptors: &[ColumnDescriptor]) -> Result<(), ColumnarError> {
        if self.columns.len() != descriptors.len() || self.statistics.len() != descriptors.len() {
            return Err(ColumnarError::Corrupt(format!(
                "row group has {} columns and {} statistics, file has {} columns",
                self.columns.len(),
                self.statistics.len(),
                descriptors.len()
            )));
        }
        let rows = self.num_rows as usize;
        for (idx, (data, desc)) in self.columns.iter().zip(descriptors).enumerate() {
            if data.column_type() != desc.column_type {
                return Err(ColumnarError::TypeMismatch {
                    column: idx,
                    expected: desc.column_type.as_str(),
                    actual: data.column_type().as_str(),
                });
            }
            let len = match data {
                ColumnData::Utf8 {
                    dictionary, keys, ..
                } => {
                    if keys.iter().flatten().any(|&k| k as usize >= dictionary.len()) {
                        return Err(ColumnarError::Corrupt(format!(
                            "column {} has a dictionary key out of range",
                            idx
                        )));
                    }
                    keys.len()
                }
                ColumnData::Binary { values } => values.len(),
            };
            if len != rows {
                return Err(ColumnarError::Corrupt(format!(
                    "column {} has {} rows, expected {}",
                    idx, len, rows
                )));
            }
        }
        Ok(())
    }

    fn column(&self, column: usize) -> Result<&ColumnData, ColumnarError> {
        self.columns
            .get(column)
            .ok_or(ColumnarError::ColumnOutOfRange {
                column,
                columns: self.columns.len(),
            })
    }

    fn check_rows(&self, rows: &RowSet) -> Result<(), ColumnarError> {
        match rows.max() {
            Some(row) if row >= self.num_rows => Err(ColumnarError::RowOutOfRange {
                row,
                rows: self.num_rows,
            }),
            _ => Ok(()),
        }
    }
}

impl RowGroupReader for MemRowGroup {
    fn num_rows(&self) -> u32 {
        self.num_rows
    }

    fn statistics(&self, column: usize) -> Result<Option<ColumnStatistics>, ColumnarError> {
        self.column(column)?;
        Ok(self.statistics.get(column).cloned().flatten())
    }

    fn dictionary(&self, column: usize) -> Result<Option<Arc<[String]>>, ColumnarError> {
        match self.column(column)? {
            ColumnData::Utf8 {
                dictionary,
                expose_dictionary: true,
                ..
            } => Ok(Some(Arc::from(dictionary.as_slice()))),
            _ => Ok(None),
        }
    }

    fn read_utf8(
        &self,
        column: usize,
        rows: &RowSet,
    ) -> Result<Vec<Option<String>>, ColumnarError> {
        let (dictionary, keys) = match self.column(column)? {
            ColumnData::Utf8 {
                dictionary, keys, ..
            } => (dictionary, keys),
            other => {
                return Err(ColumnarError::TypeMismatch {
                    column,
                    expected: ColumnType::Utf8.as_str(),
                    actual: other.column_type().as_str(),
                })
            }
        };
        self.check_rows(rows)?;
        self.page_reads.fetch_add(1, Ordering::Relaxed);

        rows.iter()
            .map(|row| match keys[row as usize] {
                None => Ok(None),
                Some(k) => dictionary
                    .get(k as usize)
                    .cloned()
                    .map(Some)
                    .ok_or_else(|| {
                        ColumnarError::Corrupt(format!("dictionary key {} out of range", k))
                    }),
            })
            .collect()
    }

    fn read_binary(
        &self,
        column: usize,
        rows: &RowSet,
    ) -> Result<Vec<Option<Bytes>>, ColumnarError> {
        let values = match self.column(column)? {
            ColumnData::Binary { values } => values,
            other => {
                return Err(ColumnarError::TypeMismatch {
                    column,
                    expected: ColumnType::Binary.as_str(),
                    actual: other.column_type().as_str(),
                })
            }
        };
        self.check_rows(rows)?;
        self.page_reads.fetch_add(1, Ordering::Relaxed);
        Ok(rows.iter().map(|row| values[row as usize].clone()).collect())
    }
}

/// A columnar file held in memory.
#[derive(Debug, Serialize, Deserialize)]
pub struct MemColumnarFile {
    columns: Vec<ColumnDescriptor>,
    metadata: BTreeMap<String, String>,
    row_groups: Vec<Arc<MemRowGroup>>,
}

impl MemColumnarFile {
    pub fn new(columns: Vec<ColumnDescriptor>, metadata: BTreeMap<String, String>) -> Self {
        Self {
            columns,
            metadata,
            row_groups: Vec::new(),
        }
    }

    /// Appends a row group; `values` must match the file's columns in count and type.
    pub fn push_row_group(
        &mut self,
        values: Vec<ColumnValues>,
        options: WriteOptions,
    ) -> Result<(), ColumnarError> {
        if values.len() != self.columns.len() {
            return Err(ColumnarError::Corrupt(format!(
                "row group has {} columns, file has {}",
                values.len(),
                self.columns.len()
            )));
        }
        for (idx, (v, desc)) in values.iter().zip(self.columns.iter()).enumerate() {
            if v.column_type() != desc.column_type {
                return Err(ColumnarError::TypeMismatch {
                    column: idx,
                    expected: desc.column_type.as_str(),
                    actual: v.column_type().as_str(),
                });
            }
        }
        self.row_groups
            .push(Arc::new(MemRowGroup::new(values, options)?));
        Ok(())
    }

    /// Total page reads served across all row groups.
    pub fn page_reads(&self) -> u64 {
        self.row_groups.iter().map(|rg| rg.page_reads()).sum()
    }

    /// Serializes the file: magic + version + len + crc32 + bincode payload.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ColumnarError> {
        let payload = bincode::serialize(self).map_err(|e| ColumnarError::Corrupt(e.to_string()))?;
        let mut hasher = Crc32::new();
        hasher.update(&payload);
        let crc = hasher.finalize();

        let mut out = Vec::with_capacity(24 + payload.len());
        out.extend_from_slice(COLUMNAR_MAGIC);
        out.extend_from_slice(&COLUMNAR_VERSION.to_le_bytes());
        out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        out.extend_from_slice(&crc.to_le_bytes());
        out.extend_from_slice(&payload);
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ColumnarError> {
        let mut cur = std::io::Cursor::new(bytes);
        let mut magic = [0u8; 8];
        cur.read_exact(&mut magic)?;
        if &magic != COLUMNAR_MAGIC {
            return Err(ColumnarError::Corrupt("bad columnar file magic".to_string()));
        }
        let mut b4 = [0u8; 4];
        let mut b8 = [0u8; 8];
        cur.read_exact(&mut b4)?;
        let version = u32::from_le_bytes(b4);
        if version != COLUMNAR_VERSION {
            return Err(ColumnarError::Corrupt(format!(
                "unsupported columnar file version {}",
                version
            )));
        }
        cur.read_exact(&mut b8)?;
        let len = u64::from_le_bytes(b8) as usize;
        cur.read_exact(&mut b4)?;
        let crc = u32::from_le_bytes(b4);

        let start = cur.position() as usize;
        let payload = start
            .checked_add(len)
            .and_then(|end| bytes.get(start..end))
            .ok_or_else(|| ColumnarError::Corrupt("truncated columnar file".to_string()))?;
        let mut hasher = Crc32::new();
        hasher.update(payload);
        if hasher.finalize() != crc {
            return Err(ColumnarError::Corrupt(
                "columnar file CRC mismatch".to_string(),
            ));
        }
        let file: Self =
            bincode::deserialize(payload).map_err(|e| ColumnarError::Corrupt(e.to_string()))?;
        for (i, rg) in file.row_groups.iter().enumerate() {
            rg.validate(&file.columns)
                .map_err(|e| ColumnarError::Corrupt(format!("row group {}: {}", i, e)))?;
        }
        Ok(file)
    }

    /// Writes the file image to `path` via a temporary file and rename.
    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> Result<(), ColumnarError> {
        let path = path.as_ref();
        let bytes = self.to_bytes()?;
        let tmp_path = path.with_extension("tmp");
        let mut w = BufWriter::new(
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?,
        );
        w.write_all(&bytes)?;
        w.flush()?;
        w.get_ref().sync_data()?;
        drop(w);
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ColumnarError> {
        let mut f = File::open(path)?;
        let mut bytes = Vec::new();
        f.read_to_end(&mut bytes)?;
        Self::from_bytes(&bytes)
    }
}

impl ColumnarFile for MemColumnarFile {
    fn columns(&self) -> Result<Vec<ColumnDescriptor>, ColumnarError> {
        Ok(self.columns.clone())
    }

    fn metadata(&self) -> Result<BTreeMap<String, String>, ColumnarError> {
        Ok(self.metadata.clone())
    }

    fn num_row_groups(&self) -> usize {
        self.row_groups.len()
    }

    fn row_group(&self, index: usize) -> Result<Arc<dyn RowGroupReader>, ColumnarError> {
        self.row_groups
            .get(index)
            .map(|rg| Arc::clone(rg) as Arc<dyn RowGroupReader>)
            .ok_or(ColumnarError::RowGroupOutOfRange {
                row_group: index,
                row_groups: self.row_groups.len(),
            })
    }
}

/// Lays series out into a block's labels file and chunks file.
///
/// Rows are sorted by label set. The block time range is cut into chunk columns of
/// `data_col_duration`; chunks crossing a column boundary are split so every chunk
/// lies inside the slice of the column that stores it.
#[derive(Debug, Clone)]
pub struct BlockBuilder {
    min_time: Timestamp,
    max_time: Timestamp,
    data_col_duration: i64,
    row_group_size: usize,
    samples_per_chunk: usize,
    options: WriteOptions,
    encoder: XorChunksEncoder,
    series: BTreeMap<Labels, Vec<Chunk>>,
}

impl BlockBuilder {
    /// A builder for a block covering `[min_time, max_time)`, with a single chunk column.
    pub fn new(min_time: Timestamp, max_time: Timestamp) -> Self {
        Self {
            min_time,
            max_time,
            data_col_duration: max_time.saturating_sub(min_time).max(1),
            row_group_size: DEFAULT_ROW_GROUP_SIZE,
            samples_per_chunk: DEFAULT_SAMPLES_PER_CHUNK,
            options: WriteOptions::default(),
            encoder: XorChunksEncoder::default(),
            series: BTreeMap::new(),
        }
    }

    pub fn with_data_col_duration(mut self, duration: i64) -> Self {
        self.data_col_duration = duration.max(1);
        self
    }

    pub fn with_row_group_size(mut self, rows: usize) -> Self {
        self.row_group_size = rows.max(1);
        self
    }

    pub fn with_samples_per_chunk(mut self, samples: usize) -> Self {
        self.samples_per_chunk = samples.max(1);
        self
    }

    pub fn with_write_options(mut self, options: WriteOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_float_encoding(mut self, encoding: FloatEncoding) -> Self {
        self.encoder = XorChunksEncoder::new(encoding);
        self
    }

    /// Adds samples for a series, cutting them into chunks of at most
    /// `samples_per_chunk` samples.
    pub fn add_samples(
        &mut self,
        labels: Labels,
        mut samples: Vec<Sample>,
    ) -> Result<(), QueryError> {
        samples.sort_by_key(|s| s.timestamp);
        self.check_range(&samples)?;
        let mut chunks = Vec::new();
        for group in self.split_by_column(samples) {
            for piece in group.chunks(self.samples_per_chunk) {
                chunks.extend(Chunk::from_samples(piece.to_vec()));
            }
        }
        self.insert(labels, chunks);
        Ok(())
    }

    /// Adds pre-cut chunks for a series. Chunk boundaries are kept except where a chunk
    /// crosses a chunk column boundary.
    pub fn add_chunks(&mut self, labels: Labels, chunks: Vec<Chunk>) -> Result<(), QueryError> {
        let mut out = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            self.check_range(&chunk.samples)?;
            for group in self.split_by_column(chunk.samples) {
                out.extend(Chunk::from_samples(group));
            }
        }
        self.insert(labels, out);
        Ok(())
    }

    /// Number of chunk columns the block will have.
    pub fn chunk_column_count(&self) -> usize {
        let span = self.max_time.saturating_sub(self.min_time).max(1);
        let columns = span / self.data_col_duration + i64::from(span % self.data_col_duration != 0);
        columns.max(1) as usize
    }

    /// Builds `(labels file, chunks file)`.
    pub fn build(self) -> Result<(MemColumnarFile, MemColumnarFile), QueryError> {
        let label_names: BTreeSet<String> = self
            .series
            .keys()
            .flat_map(|l| l.names().map(str::to_string))
            .collect();
        let column_count = self.chunk_column_count();

        let mut metadata = BTreeMap::new();
        metadata.insert(META_MIN_TIME.to_string(), self.min_time.to_string());
        metadata.insert(META_MAX_TIME.to_string(), self.max_time.to_string());
        metadata.insert(
            META_DATA_COL_DURATION.to_string(),
            self.data_col_duration.to_string(),
        );

        let mut labels_file = MemColumnarFile::new(
            label_names
                .iter()
                .map(|n| ColumnDescriptor::utf8(label_column_name(n)))
                .collect(),
            metadata.clone(),
        );
        let mut chunks_file = MemColumnarFile::new(
            (0..column_count)
                .map(|i| ColumnDescriptor::binary(chunk_column_name(i)))
                .collect(),
            metadata,
        );

        let rows: Vec<(&Labels, &Vec<Chunk>)> = self.series.iter().collect();
        for group in rows.chunks(self.row_group_size) {
            let label_values = label_names
                .iter()
                .map(|name| {
                    ColumnValues::Utf8(
                        group
                            .iter()
                            .map(|(labels, _)| labels.get(name).map(str::to_string))
                            .collect(),
                    )
                })
                .collect();
            labels_file
                .push_row_group(label_values, self.options)
                .map_err(|e| QueryError::Internal(format!("writing labels row group: {}", e)))?;

            let mut chunk_values = Vec::with_capacity(column_count);
            for col in 0..column_count {
                let mut cells = Vec::with_capacity(group.len());
                for (_, chunks) in group {
                    let in_column: Vec<Chunk> = chunks
                        .iter()
                        .filter(|c| self.column_of(c.min_time) == col)
                        .cloned()
                        .collect();
                    if in_column.is_empty() {
                        cells.push(None);
                    } else {
                        cells.push(Some(self.encoder.encode(&in_column)?));
                    }
                }
                chunk_values.push(ColumnValues::Binary(cells));
            }
            chunks_file
                .push_row_group(chunk_values, self.options)
                .map_err(|e| QueryError::Internal(format!("writing chunks row group: {}", e)))?;
        }

        Ok((labels_file, chunks_file))
    }

    /// Builds the files and wraps them in a [`Block`] with the matching decoder.
    pub fn build_block(self) -> Result<Block, QueryError> {
        let (labels, chunks) = self.build()?;
        Block::new(
            Arc::new(labels),
            Arc::new(chunks),
            Arc::new(XorChunksDecoder),
        )
    }

    fn insert(&mut self, labels: Labels, chunks: Vec<Chunk>) {
        let entry = self.series.entry(labels).or_default();
        entry.extend(chunks);
        entry.sort_by_key(|c| (c.min_time, c.max_time));
    }

    fn column_of(&self, ts: Timestamp) -> usize {
        let idx = (ts.saturating_sub(self.min_time) / self.data_col_duration) as usize;
        idx.min(self.chunk_column_count() - 1)
    }

    fn check_range(&self, samples: &[Sample]) -> Result<(), QueryError> {
        match samples
            .iter()
            .find(|s| s.timestamp < self.min_time || s.timestamp >= self.max_time)
        {
            Some(s) => Err(QueryError::Internal(format!(
                "sample timestamp {} outside block range [{}, {})",
                s.timestamp, self.min_time, self.max_time
            ))),
            None => Ok(()),
        }
    }

    /// Splits time-sorted samples into runs that share a chunk column.
    fn split_by_column(&self, samples: Vec<Sample>) -> Vec<Vec<Sample>> {
        let mut out: Vec<Vec<Sample>> = Vec::new();
        let mut current_col = usize::MAX;
        for s in samples {
            let col = self.column_of(s.timestamp);
            if col != current_col || out.is_empty() {
                out.push(Vec::new());
                current_col = col;
            }
            if let Some(last) = out.last_mut() {
                last.push(s);
            }
        }
        out
    }
}
