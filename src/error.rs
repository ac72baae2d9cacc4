use thiserror::Error;

/// Error type for the query engine.
#[derive(Error, Debug)]
pub enum QueryError {
    /// The block schema could not be derived from its columnar sources.
    #[error("Schema error: {0}")]
    Schema(String),

    /// A matcher could not be translated into a constraint (e.g. an unparseable regex).
    #[error("Invalid matcher for label {label:?}: {details}")]
    InvalidMatcher { label: String, details: String },

    /// Reading statistics or column pages failed while filtering a row group.
    #[error("Row group filter error in row group {row_group}: {source}")]
    Filter {
        row_group: usize,
        #[source]
        source: ColumnarError,
    },

    /// Reading label or chunk columns failed while materializing a row group.
    #[error("Column read error in row group {row_group}: {source}")]
    Column {
        row_group: usize,
        #[source]
        source: ColumnarError,
    },

    #[error("Chunk decode error: {details}")]
    Decode {
        details: String,
        series: Option<String>,
        row_group: Option<usize>,
    },

    #[error("Invalid time range: start={start}, end={end}")]
    InvalidTimeRange { start: i64, end: i64 },

    #[error("Query cancelled")]
    Cancelled,

    #[error("Query deadline exceeded")]
    DeadlineExceeded,

    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization Error: {0}")]
    Serialization(String),

    #[error("Configuration Error: {0}")]
    ConfigError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl QueryError {
    /// True for caller-initiated aborts (explicit cancellation or an expired deadline).
    pub fn is_cancellation(&self) -> bool {
        matches!(self, QueryError::Cancelled | QueryError::DeadlineExceeded)
    }

    pub(crate) fn decode(details: impl Into<String>) -> Self {
        QueryError::Decode {
            details: details.into(),
            series: None,
            row_group: None,
        }
    }

    /// Attaches series/row-group context to a decode error; other variants pass through.
    pub(crate) fn with_decode_context(self, series: &str, row_group: usize) -> Self {
        match self {
            QueryError::Decode { details, .. } => QueryError::Decode {
                details,
                series: Some(series.to_string()),
                row_group: Some(row_group),
            },
            other => other,
        }
    }
}

/// Error type surfaced by [`crate::columnar::ColumnarFile`] implementations.
#[derive(Error, Debug)]
pub enum ColumnarError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Column index {column} out of range ({columns} columns)")]
    ColumnOutOfRange { column: usize, columns: usize },

    #[error("Row group index {row_group} out of range ({row_groups} row groups)")]
    RowGroupOutOfRange { row_group: usize, row_groups: usize },

    #[error("Row {row} out of range ({rows} rows)")]
    RowOutOfRange { row: u32, rows: u32 },

    #[error("Column {column} has type {actual}, expected {expected}")]
    TypeMismatch {
        column: usize,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Corruption detected: {0}")]
    Corrupt(String),
}
