//! Error and Result types for Vulpes database operations.

use crate::page::{PageType, SeriesId, Timestamp};
use std::io;
use thiserror::Error;

/// A convenience `Result` type for Vulpes operations.
pub type Result<T> = std::result::Result<T, TsdbError>;

/// The error type for database operations.
#[derive(Debug, Error)]
pub enum TsdbError {
    /// Underlying file operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A CRC mismatch, bad magic, or internally inconsistent decoded structure.
    #[error("corrupted database: {0}")]
    Corruption(String),

    /// Insert timestamp precedes the last record of the series.
    #[error("out-of-order insert into series {series_id}: timestamp {ts} precedes {last_ts}")]
    OutOfOrder {
        /// Series the insert targeted.
        series_id: SeriesId,
        /// Timestamp of the rejected record.
        ts: Timestamp,
        /// Last committed or buffered timestamp of the series.
        last_ts: Timestamp,
    },

    /// Record type does not match the series' type.
    #[error("type mismatch: series has type {expected:?}, got {actual:?}")]
    TypeMismatch {
        /// The series' record type.
        expected: PageType,
        /// The type supplied by the caller.
        actual: PageType,
    },

    /// Operation references a series id that does not exist.
    #[error("unknown series: {0}")]
    UnknownSeries(SeriesId),

    /// Series id or database path already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The next record would exceed the page body budget. Internal to the
    /// commit path; callers of the public API never observe it.
    #[error("page full")]
    PageFull,
}

impl TsdbError {
    /// Shorthand for building a [`TsdbError::Corruption`].
    pub(crate) fn corruption(msg: impl Into<String>) -> Self {
        TsdbError::Corruption(msg.into())
    }
}
