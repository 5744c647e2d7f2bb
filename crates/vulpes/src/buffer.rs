//! Per-series in-memory staging of uncommitted records.
//!
//! Inserts append to a per-series buffer; `commit` drains every non-empty
//! buffer into freshly allocated data pages. The buffer is where the
//! monotonic-append contract is enforced: a record is rejected before it
//! is staged, so a failed insert leaves the engine unchanged.

use crate::error::{Result, TsdbError};
use crate::page::{PageType, SeriesId, Timestamp, Value};
use std::collections::HashMap;

/// Uncommitted records of a single series, in insertion order.
#[derive(Debug)]
pub struct SeriesBuffer {
    records: Vec<(Timestamp, Value)>,
}

impl SeriesBuffer {
    fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    /// Timestamp of the most recently buffered record.
    pub fn last_ts(&self) -> Option<Timestamp> {
        self.records.last().map(|(ts, _)| *ts)
    }

    /// Buffered records in insertion order.
    pub fn records(&self) -> &[(Timestamp, Value)] {
        &self.records
    }

    /// Number of buffered records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// All write buffers of one open database.
#[derive(Debug, Default)]
pub struct WriteBuffer {
    buffers: HashMap<SeriesId, SeriesBuffer>,
}

impl WriteBuffer {
    /// Creates an empty write buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages one record for `series_id`.
    ///
    /// `page_type` is the series' record type and `last_committed` its last
    /// committed timestamp; both come from the index or the staged-series
    /// table.
    ///
    /// # Errors
    ///
    /// - `TsdbError::TypeMismatch` if the value kind differs from the
    ///   series type.
    /// - `TsdbError::OutOfOrder` if `ts` precedes the last committed or the
    ///   last buffered timestamp. Equal timestamps are permitted.
    pub fn insert(
        &mut self,
        series_id: SeriesId,
        page_type: PageType,
        last_committed: Timestamp,
        ts: Timestamp,
        value: Value,
    ) -> Result<()> {
        if value.page_type() != page_type {
            return Err(TsdbError::TypeMismatch {
                expected: page_type,
                actual: value.page_type(),
            });
        }
        let buffer = self.buffers.entry(series_id).or_insert_with(SeriesBuffer::new);
        let last_ts = buffer.last_ts().unwrap_or(last_committed).max(last_committed);
        if ts < last_ts {
            return Err(TsdbError::OutOfOrder {
                series_id,
                ts,
                last_ts,
            });
        }
        buffer.records.push((ts, value));
        Ok(())
    }

    /// Last buffered timestamp for a series, if any record is staged.
    pub fn last_ts(&self, series_id: SeriesId) -> Option<Timestamp> {
        self.buffers.get(&series_id).and_then(SeriesBuffer::last_ts)
    }

    /// Iterates the series with at least one buffered record.
    pub fn dirty(&self) -> impl Iterator<Item = (SeriesId, &SeriesBuffer)> {
        self.buffers
            .iter()
            .filter(|(_, b)| !b.is_empty())
            .map(|(&id, b)| (id, b))
    }

    /// True when no series has buffered records.
    pub fn is_clean(&self) -> bool {
        self.buffers.values().all(SeriesBuffer::is_empty)
    }

    /// Total number of buffered records across all series.
    pub fn record_count(&self) -> usize {
        self.buffers.values().map(SeriesBuffer::len).sum()
    }

    /// Discards all buffered records after a successful commit.
    pub fn clear(&mut self) {
        self.buffers.clear();
    }
}
