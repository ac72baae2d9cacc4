//! An embedded query engine over immutable columnar time-series blocks.
//!
//! Label matchers are translated into constraints, bound to each block's schema, and
//! pushed down into row-group scans that prune on column statistics before reading any
//! values. Matching rows are materialized into series clipped to the query window and
//! merged across blocks.

// Declare modules
pub mod block;
pub mod columnar;
pub mod constraint;
pub mod context;
pub mod core;
pub mod encoding;
pub mod error;
pub mod filter;
pub mod materialize;
pub mod matcher;
pub mod memfile;
pub mod merge;
pub mod query;
pub mod schema;
pub mod telemetry;
pub mod types;

/// An immutable block: labels file + chunks file + decoder.
pub use crate::block::Block;
/// Read-side interface of block files.
pub use crate::columnar::{ColumnarFile, RowGroupReader, RowSet};
/// Matcher translation.
pub use crate::constraint::{Constraint, ConstraintBuilder, Predicate};
/// Per-query cancellation and deadline.
pub use crate::context::{CancelHandle, QueryContext};
/// Engine configuration and query surface.
pub use crate::core::{
    Annotation, EngineConfig, EngineFileConfig, LabelHints, LabelQueryResult, Querier,
    QueryEngine, SelectHints, SeriesSet,
};
/// Chunk codec.
pub use crate::encoding::{ChunksDecoder, FloatEncoding, XorChunksDecoder, XorChunksEncoder};
/// Error types.
pub use crate::error::{ColumnarError, QueryError};
/// Caller-facing label matchers.
pub use crate::matcher::{MatchType, Matcher};
/// In-memory columnar files and the block builder.
pub use crate::memfile::{BlockBuilder, MemColumnarFile, WriteOptions};
/// Structured event hook for observability.
pub use crate::telemetry::{QueryEvent, QueryEventListener};
/// Series data model.
pub use crate::types::{Chunk, ChunkSeries, Label, Labels, Sample, Timestamp, Value};
