//! Seekable read cursor over one series' committed records.
//!
//! A cursor captures an [`Arc`] of the series' index entry at creation
//! time and never touches live mutable state afterwards, so later commits
//! cannot change what it observes. It decodes one page at a time and walks
//! the page list in timestamp order.

use crate::error::Result;
use crate::index::SeriesEntry;
use crate::page::{codec, DecodedPage, PageStore, PageType, SeriesId, Timestamp, Value};
use std::sync::Arc;

/// Forward and seekable reader over a single series snapshot.
#[derive(Debug)]
pub struct Cursor {
    store: Arc<PageStore>,
    entry: Arc<SeriesEntry>,
    /// Position of the decoded page within the snapshot's page list.
    page_idx: usize,
    /// The one page held decoded at a time; `None` when the cursor is
    /// exhausted or the series has no pages.
    current: Option<DecodedPage>,
    rec_idx: usize,
}

impl Cursor {
    /// Opens a cursor positioned at the first record of the snapshot.
    pub(crate) fn new(store: Arc<PageStore>, entry: Arc<SeriesEntry>) -> Result<Self> {
        let mut cursor = Self {
            store,
            entry,
            page_idx: 0,
            current: None,
            rec_idx: 0,
        };
        if !cursor.entry.pages.is_empty() {
            cursor.current = Some(cursor.load_page(0)?);
        }
        Ok(cursor)
    }

    /// Record type of the underlying series.
    pub fn page_type(&self) -> PageType {
        self.entry.page_type
    }

    /// Id of the underlying series.
    pub fn series_id(&self) -> SeriesId {
        self.entry.id
    }

    /// Whether the cursor currently points at a record.
    pub fn valid(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|page| self.rec_idx < page.records.len())
    }

    /// The current record, or `None` when the cursor is invalid.
    pub fn get(&self) -> Option<(Timestamp, Value)> {
        self.current
            .as_ref()
            .and_then(|page| page.records.get(self.rec_idx))
            .copied()
    }

    /// Advances one record; returns `false` at the end of the series, at
    /// which point the cursor becomes invalid.
    pub fn next(&mut self) -> Result<bool> {
        if !self.valid() {
            return Ok(false);
        }
        self.rec_idx += 1;
        if self.rec_idx < self.current.as_ref().unwrap().records.len() {
            return Ok(true);
        }
        if self.page_idx + 1 < self.entry.pages.len() {
            self.page_idx += 1;
            self.current = Some(self.load_page(self.page_idx)?);
            self.rec_idx = 0;
            Ok(true)
        } else {
            self.current = None;
            Ok(false)
        }
    }

    /// Positions at the least record whose timestamp is `>= ts`.
    ///
    /// Invalidates the cursor when `ts` exceeds the series' largest
    /// timestamp; positions at the first record when `ts` precedes the
    /// smallest. Uses the per-page min/max to binary-search the page list,
    /// then binary-searches within the selected page.
    pub fn seek_to(&mut self, ts: Timestamp) -> Result<()> {
        // First page whose max timestamp reaches ts; pages are ordered and
        // non-overlapping apart from shared boundary timestamps.
        let mut lo = 0usize;
        let mut hi = self.entry.pages.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.page_max_ts(mid)? < ts {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo == self.entry.pages.len() {
            self.current = None;
            return Ok(());
        }
        if self.current.is_none() || self.page_idx != lo {
            self.current = Some(self.load_page(lo)?);
            self.page_idx = lo;
        }
        let page = self.current.as_ref().unwrap();
        // The page's max is >= ts, so at least one record qualifies.
        self.rec_idx = page.records.partition_point(|&(t, _)| t < ts);
        debug_assert!(self.rec_idx < page.records.len());
        Ok(())
    }

    fn page_max_ts(&self, idx: usize) -> Result<Timestamp> {
        if let Some(page) = &self.current {
            if idx == self.page_idx {
                return Ok(page.header.max_ts);
            }
        }
        let buf = self.store.read_page(self.entry.pages[idx])?;
        let header = codec::decode_page_header(&buf, self.entry.id, self.entry.page_type)?;
        Ok(header.max_ts)
    }

    fn load_page(&self, idx: usize) -> Result<DecodedPage> {
        let buf = self.store.read_page(self.entry.pages[idx])?;
        codec::decode_page(&buf, self.entry.id, self.entry.page_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::codec::DataPageBuilder;
    use tempfile::TempDir;

    const PAGE_SIZE: usize = 256;

    /// Writes `records` for series 1 into as many pages as needed and
    /// returns a cursor over them.
    fn cursor_over(records: &[(u64, u64)]) -> (TempDir, Cursor) {
        let dir = TempDir::new().unwrap();
        let (store, _) = PageStore::create(&dir.path().join("t.tsdb"), PAGE_SIZE).unwrap();
        let store = Arc::new(store);

        let mut pages = Vec::new();
        let mut builder = DataPageBuilder::new(PAGE_SIZE, 1, PageType::UInt64);
        for &(ts, v) in records {
            if builder.push(ts, Value::UInt64(v)).is_err() {
                let id = store.allocate();
                store.write_page(id, &builder.seal()).unwrap();
                pages.push(id);
                builder = DataPageBuilder::new(PAGE_SIZE, 1, PageType::UInt64);
                builder.push(ts, Value::UInt64(v)).unwrap();
            }
        }
        if !builder.is_empty() {
            let id = store.allocate();
            store.write_page(id, &builder.seal()).unwrap();
            pages.push(id);
        }

        let entry = Arc::new(SeriesEntry {
            id: 1,
            page_type: PageType::UInt64,
            metadata: Vec::new(),
            last_ts: records.last().map(|&(ts, _)| ts).unwrap_or(0),
            pages,
        });
        let cursor = Cursor::new(store, entry).unwrap();
        (dir, cursor)
    }

    #[test]
    fn test_empty_series_is_invalid() {
        let (_dir, cursor) = cursor_over(&[]);
        assert!(!cursor.valid());
        assert!(cursor.get().is_none());
    }

    #[test]
    fn test_iterates_across_pages() {
        let records: Vec<(u64, u64)> = (0..200).map(|i| (i * 10, i)).collect();
        let (_dir, mut cursor) = cursor_over(&records);
        assert!(cursor.entry.pages.len() > 1, "test requires several pages");

        let mut seen = Vec::new();
        while cursor.valid() {
            let (ts, v) = cursor.get().unwrap();
            seen.push((ts, v.as_u64().unwrap()));
            cursor.next().unwrap();
        }
        assert_eq!(seen, records);
        assert!(!cursor.next().unwrap());
    }

    #[test]
    fn test_seek_within_and_across_pages() {
        let records: Vec<(u64, u64)> = (1..=200).map(|i| (i * 2, i)).collect();
        let (_dir, mut cursor) = cursor_over(&records);

        cursor.seek_to(137).unwrap();
        assert_eq!(cursor.get().unwrap().0, 138);

        cursor.seek_to(2).unwrap();
        assert_eq!(cursor.get().unwrap().0, 2);

        // Probe below the first timestamp positions at the first record.
        cursor.seek_to(0).unwrap();
        assert_eq!(cursor.get().unwrap().0, 2);

        // Exact hit on the last timestamp.
        cursor.seek_to(400).unwrap();
        assert_eq!(cursor.get().unwrap().0, 400);

        // Past the end invalidates.
        cursor.seek_to(401).unwrap();
        assert!(!cursor.valid());
    }

    #[test]
    fn test_seek_then_scan_to_end() {
        let records: Vec<(u64, u64)> = (0..100).map(|i| (i * 3, i)).collect();
        let (_dir, mut cursor) = cursor_over(&records);

        cursor.seek_to(150).unwrap();
        let mut count = 0;
        while cursor.valid() {
            count += 1;
            cursor.next().unwrap();
        }
        assert_eq!(count, 50);
    }
}
