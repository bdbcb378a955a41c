//! Error types for beamline.

use thiserror::Error;

/// Errors surfaced by index loading and query execution.
///
/// Load-time problems are fatal: the index handle is not returned. Per-sector
/// read failures during a query are recovered locally (the node is elided from
/// candidacy for that query) and never reach this type. Exhausting the query
/// io budget is not an error either; it ends traversal and is reported in
/// [`QueryStats`](crate::stats::QueryStats).
#[derive(Debug, Error)]
pub enum SearchError {
    /// On-disk metadata is inconsistent or a file fails validation.
    #[error("corrupt index: {0}")]
    CorruptIndex(String),

    /// A filter label could not be resolved and no universal label is set.
    #[error("unknown label: {0}")]
    UnknownLabel(String),

    /// An I/O operation failed outside the recoverable per-sector path.
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    /// The embedding service could not produce vectors for a batch.
    #[error("embedding fetch failed: {0}")]
    Fetch(String),

    /// A caller-supplied parameter is out of range.
    #[error("bad argument: {0}")]
    BadArgument(String),
}

/// Result type alias for beamline operations.
pub type Result<T> = std::result::Result<T, SearchError>;
