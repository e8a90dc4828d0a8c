//! Domain-specific error types for the LPX pipeline.
//!
//! All fallible operations return `Result<T, LpxError>`.
//! No panics on invalid input — every error is typed and recoverable.

use thiserror::Error;

/// The canonical error type for the LPX pipeline.
#[derive(Debug, Error)]
pub enum LpxError {
    // ── Scan-table / image errors ────────────────────────────────
    /// The scan-table file is missing, truncated, or carries header
    /// fields outside their valid range.
    #[error("invalid scan tables: {0}")]
    InvalidTables(String),

    /// A source produced an empty frame or a channel count the
    /// scanner cannot sample (only 1- and 3-channel frames accepted).
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// `lastFoveaIndex` is not strictly between 0 and `lastCellIndex`.
    #[error("invalid fovea range: last fovea {last_fovea}, last cell {last_cell}")]
    InvalidFoveaRange { last_fovea: i32, last_cell: i32 },

    // ── Wire errors ──────────────────────────────────────────────
    /// A declared frame size was out of range, or the stream ended
    /// before a complete frame arrived.
    #[error("wire framing error: {0}")]
    WireFraming(String),

    // ── Connection errors ────────────────────────────────────────
    /// `bind`/`listen`/`accept`/`connect` failed. Fatal for the
    /// server component that hit it.
    #[error("socket error: {0}")]
    Socket(#[source] std::io::Error),

    // ── Source errors ────────────────────────────────────────────
    /// A non-looping source reached its end.
    #[error("frame source ended")]
    SourceEnded,

    /// The frame source failed to produce or decode a frame.
    #[error("frame source error: {0}")]
    Source(String),

    /// The TCP/file I/O layer reported an error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
