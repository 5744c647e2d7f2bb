//! The database handle: open/create, series management, the write path
//! and the commit protocol.
//!
//! # Write path
//!
//! ```text
//! insert → write buffer (per series, in memory)
//!        → commit: pack buffers into fresh data pages
//!                  write data pages, then the new index chain
//!                  fsync
//!                  flip the inactive superblock root slot, fsync
//!                  publish the new in-memory snapshot
//! ```
//!
//! Commit is the sole durability point. The index is rewritten whole every
//! commit (copy-on-write) and the superblock's two root slots alternate,
//! so a crash at any point leaves either the previous or the new root
//! intact, never a blend.
//!
//! # Recovery
//!
//! Opening a database reads both root slots and loads the newest
//! generation whose chain validates, falling back to the other slot when
//! the newest fails. Pages written by an aborted commit are unreferenced
//! by the surviving root; the next commit derives its free list from the
//! full page array and reclaims them.

use crate::buffer::{SeriesBuffer, WriteBuffer};
use crate::cursor::Cursor;
use crate::error::{Result, TsdbError};
use crate::index::{self, IndexSnapshot, SeriesEntry};
use crate::page::store::DEFAULT_PAGE_SIZE;
use crate::page::{
    DataPageBuilder, PageId, PageStore, PageType, SeriesId, Superblock, Timestamp, Value,
};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// A series created in memory but not yet committed.
#[derive(Debug)]
struct StagedSeries {
    page_type: PageType,
    metadata: Vec<u8>,
}

/// Mutable engine state, guarded by the writer mutex.
#[derive(Debug)]
struct Inner {
    superblock: Superblock,
    /// Superblock slot the current snapshot was loaded from or written to.
    active_slot: usize,
    /// Pages of the current root's index chain.
    active_chain: Vec<PageId>,
    snapshot: Arc<IndexSnapshot>,
    staged: BTreeMap<SeriesId, StagedSeries>,
    buffer: WriteBuffer,
}

/// An open time-series database file.
///
/// The handle owns the file, the page store, the committed index snapshot
/// and the write buffers. Mutating operations (`create_series`, the
/// inserts, `commit`) serialize on an internal mutex; cursors hold shared
/// immutable snapshots and are never blocked by the writer.
#[derive(Debug)]
pub struct Database {
    store: Arc<PageStore>,
    inner: Mutex<Inner>,
}

impl Database {
    /// Creates a new database file with the default page size.
    ///
    /// # Errors
    ///
    /// Returns `TsdbError::AlreadyExists` if `path` exists.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        Self::create_with_page_size(path, DEFAULT_PAGE_SIZE)
    }

    /// Creates a new database file with an explicit page size.
    ///
    /// # Panics
    ///
    /// Panics if `page_size` is not a power of two in the supported range.
    pub fn create_with_page_size(path: impl AsRef<Path>, page_size: usize) -> Result<Self> {
        let (store, mut superblock) = PageStore::create(path.as_ref(), page_size)?;
        let store = Arc::new(store);

        // Commit an empty index as generation 1 so recovery always has a
        // valid root to select.
        let generation = 1;
        let series = BTreeMap::new();
        let mut body = index::encode_series_table(&series);
        index::encode_free_list(&mut body, &[]);
        let chain = vec![store.allocate()];
        for (id, page) in chain
            .iter()
            .zip(index::encode_chain(page_size, generation, &chain, &body))
        {
            store.write_page(*id, &page)?;
        }
        store.sync()?;
        superblock.slots[0] = crate::page::RootSlot {
            page: chain[0],
            generation,
        };
        store.write_superblock(&superblock)?;
        store.sync()?;
        debug!("created database at {}", path.as_ref().display());

        Ok(Self {
            store,
            inner: Mutex::new(Inner {
                superblock,
                active_slot: 0,
                active_chain: chain,
                snapshot: Arc::new(IndexSnapshot {
                    generation,
                    series,
                }),
                staged: BTreeMap::new(),
                buffer: WriteBuffer::new(),
            }),
        })
    }

    /// Opens an existing database file and runs root recovery.
    ///
    /// # Errors
    ///
    /// Returns `TsdbError::Corruption` when the superblock is invalid or
    /// neither root slot holds a readable index.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (store, superblock) = PageStore::open(path.as_ref())?;
        let store = Arc::new(store);

        let mut candidates: Vec<usize> = (0..2)
            .filter(|&i| superblock.slots[i].generation > 0)
            .collect();
        candidates.sort_by_key(|&i| std::cmp::Reverse(superblock.slots[i].generation));

        let mut chosen = None;
        for slot_idx in candidates {
            let slot = superblock.slots[slot_idx];
            let loaded = index::read_chain(&store, slot.page, slot.generation)
                .and_then(|(body, chain)| {
                    let (series, _stored_free) = index::decode_body(&body)?;
                    Ok((series, chain))
                });
            match loaded {
                Ok((series, chain)) => {
                    chosen = Some((slot_idx, slot.generation, series, chain));
                    break;
                }
                Err(e) => warn!(
                    "index root in slot {} (generation {}) failed validation: {}",
                    slot_idx, slot.generation, e
                ),
            }
        }
        let Some((active_slot, generation, series, active_chain)) = chosen else {
            return Err(TsdbError::corruption("no readable index root"));
        };

        let snapshot = Arc::new(IndexSnapshot { generation, series });
        // Derive the free list from the full page array rather than the
        // stored one: pages grown by an aborted commit sit past the stored
        // list and must become reusable.
        store.set_free_list(derive_free_list(
            store.page_count(),
            snapshot.data_pages().chain(active_chain.iter().copied()),
        ));
        debug!(
            "opened database at {} (generation {}, {} series)",
            path.as_ref().display(),
            generation,
            snapshot.series.len()
        );

        Ok(Self {
            store,
            inner: Mutex::new(Inner {
                superblock,
                active_slot,
                active_chain,
                snapshot,
                staged: BTreeMap::new(),
                buffer: WriteBuffer::new(),
            }),
        })
    }

    /// Creates a new series.
    ///
    /// The series is staged in memory and becomes durable and visible to
    /// cursors at the next [`Database::commit`]. The metadata blob is
    /// opaque to the engine.
    ///
    /// # Errors
    ///
    /// Returns `TsdbError::AlreadyExists` if the id is taken.
    pub fn create_series(
        &self,
        series_id: SeriesId,
        page_type: PageType,
        metadata: &[u8],
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.snapshot.series.contains_key(&series_id) || inner.staged.contains_key(&series_id)
        {
            return Err(TsdbError::AlreadyExists(format!("series {series_id}")));
        }
        inner.staged.insert(
            series_id,
            StagedSeries {
                page_type,
                metadata: metadata.to_vec(),
            },
        );
        Ok(())
    }

    /// Stages one record for a series.
    ///
    /// The record is buffered in memory; it becomes durable at the next
    /// [`Database::commit`].
    ///
    /// # Errors
    ///
    /// - `TsdbError::UnknownSeries` if the series does not exist.
    /// - `TsdbError::TypeMismatch` if the value kind differs from the
    ///   series type.
    /// - `TsdbError::OutOfOrder` if `ts` precedes the series' last
    ///   committed or last buffered timestamp.
    pub fn insert(&self, series_id: SeriesId, ts: Timestamp, value: Value) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let (page_type, last_committed) =
            if let Some(entry) = inner.snapshot.series.get(&series_id) {
                (entry.page_type, entry.last_ts)
            } else if let Some(staged) = inner.staged.get(&series_id) {
                (staged.page_type, 0)
            } else {
                return Err(TsdbError::UnknownSeries(series_id));
            };
        inner
            .buffer
            .insert(series_id, page_type, last_committed, ts, value)
    }

    /// Stages an unsigned integer record. See [`Database::insert`].
    pub fn insert_u64(&self, series_id: SeriesId, ts: Timestamp, value: u64) -> Result<()> {
        self.insert(series_id, ts, Value::UInt64(value))
    }

    /// Stages a signed integer record. See [`Database::insert`].
    pub fn insert_i64(&self, series_id: SeriesId, ts: Timestamp, value: i64) -> Result<()> {
        self.insert(series_id, ts, Value::Int64(value))
    }

    /// Stages a float record. See [`Database::insert`].
    pub fn insert_f64(&self, series_id: SeriesId, ts: Timestamp, value: f64) -> Result<()> {
        self.insert(series_id, ts, Value::Float64(value))
    }

    /// Makes all staged series and buffered records durable.
    ///
    /// Writes new data pages and a new index root, fsyncs, flips the
    /// superblock slot and publishes the new snapshot. A commit with
    /// nothing staged is a no-op.
    ///
    /// # Errors
    ///
    /// On `TsdbError::Io` the on-disk state remains the previous commit
    /// and the write buffers are preserved so the caller may retry; pages
    /// written by the failed attempt are orphaned and reclaimed later.
    pub fn commit(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.staged.is_empty() && inner.buffer.is_clean() {
            return Ok(());
        }
        match self.commit_locked(&mut inner) {
            Ok(()) => Ok(()),
            Err(e) => {
                // Restore the allocator to the committed state; the failed
                // attempt's pages drop out of the referenced set and become
                // free again.
                self.store.set_free_list(derive_free_list(
                    self.store.page_count(),
                    inner
                        .snapshot
                        .data_pages()
                        .chain(inner.active_chain.iter().copied()),
                ));
                Err(e)
            }
        }
    }

    fn commit_locked(&self, inner: &mut Inner) -> Result<()> {
        let store = &self.store;
        let page_size = store.page_size();
        let generation = inner.snapshot.generation + 1;

        // Overlay staged series onto the committed map.
        let mut series = inner.snapshot.series.clone();
        for (&id, staged) in &inner.staged {
            series.insert(
                id,
                Arc::new(SeriesEntry {
                    id,
                    page_type: staged.page_type,
                    metadata: staged.metadata.clone(),
                    last_ts: 0,
                    pages: Vec::new(),
                }),
            );
        }

        // Pack every dirty buffer into fresh data pages, in series order.
        let mut dirty: Vec<(SeriesId, &SeriesBuffer)> = inner.buffer.dirty().collect();
        dirty.sort_by_key(|&(id, _)| id);
        let mut data_pages_written = 0usize;
        for &(id, buf) in &dirty {
            let entry = series
                .get(&id)
                .expect("buffered series is present in the index")
                .clone();
            let mut pages = entry.pages.clone();
            let mut builder = DataPageBuilder::new(page_size, id, entry.page_type);
            for &(ts, value) in buf.records() {
                match builder.push(ts, value) {
                    Ok(()) => {}
                    Err(TsdbError::PageFull) => {
                        pages.push(write_sealed(store, &builder)?);
                        builder = DataPageBuilder::new(page_size, id, entry.page_type);
                        builder.push(ts, value)?;
                    }
                    Err(e) => return Err(e),
                }
            }
            if !builder.is_empty() {
                pages.push(write_sealed(store, &builder)?);
            }
            data_pages_written += pages.len() - entry.pages.len();
            series.insert(
                id,
                Arc::new(SeriesEntry {
                    id,
                    page_type: entry.page_type,
                    metadata: entry.metadata.clone(),
                    last_ts: buf.last_ts().expect("dirty buffer is non-empty"),
                    pages,
                }),
            );
        }
        let record_count = inner.buffer.record_count();

        // Size the new index chain against an upper bound of the free-list
        // length, then derive the exact free list once the chain pages are
        // allocated. The bound only shrinks when chain pages leave the free
        // set, so the body always fits.
        let table = index::encode_series_table(&series);
        let referenced_data: usize = series.values().map(|e| e.pages.len()).sum();
        let free_upper_bound = (store.page_count() as usize).saturating_sub(referenced_data);
        let chain_len = index::chain_len_for(
            page_size,
            table.len() + index::free_list_len(free_upper_bound),
        );
        let chain: Vec<PageId> = (0..chain_len).map(|_| store.allocate()).collect();

        let free = derive_free_list(
            store.page_count(),
            series
                .values()
                .flat_map(|e| e.pages.iter().copied())
                .chain(chain.iter().copied()),
        );
        let mut body = table;
        index::encode_free_list(&mut body, &free);

        // Data pages first, then index pages, one fsync for both.
        for (id, page) in chain
            .iter()
            .zip(index::encode_chain(page_size, generation, &chain, &body))
        {
            store.write_page(*id, &page)?;
        }
        store.sync()?;

        // Flip the inactive root slot, then make the flip durable.
        let slot = 1 - inner.active_slot;
        let mut superblock = inner.superblock;
        superblock.slots[slot] = crate::page::RootSlot {
            page: chain[0],
            generation,
        };
        store.write_superblock(&superblock)?;
        store.sync()?;

        // Publish. Cursors created from here on observe the new snapshot;
        // existing cursors keep theirs.
        inner.superblock = superblock;
        inner.active_slot = slot;
        inner.active_chain = chain;
        inner.snapshot = Arc::new(IndexSnapshot { generation, series });
        inner.staged.clear();
        inner.buffer.clear();
        store.set_free_list(free);

        debug!(
            "committed generation {} ({} records in {} new data pages)",
            generation, record_count, data_pages_written
        );
        Ok(())
    }

    /// Opens a cursor over the committed records of a series, positioned
    /// at the first record.
    ///
    /// The cursor observes the snapshot current at this call; later
    /// commits do not affect it. Records staged but not yet committed are
    /// not visible.
    ///
    /// # Errors
    ///
    /// - `TsdbError::UnknownSeries` if no committed series has this id.
    /// - `TsdbError::TypeMismatch` if `type_hint` differs from the series'
    ///   type.
    pub fn get_cursor(&self, series_id: SeriesId, type_hint: PageType) -> Result<Cursor> {
        let entry = {
            let inner = self.inner.lock().unwrap();
            inner
                .snapshot
                .series
                .get(&series_id)
                .cloned()
                .ok_or(TsdbError::UnknownSeries(series_id))?
        };
        if entry.page_type != type_hint {
            return Err(TsdbError::TypeMismatch {
                expected: entry.page_type,
                actual: type_hint,
            });
        }
        Cursor::new(Arc::clone(&self.store), entry)
    }

    /// Ids of all committed series.
    pub fn series_ids(&self) -> Vec<SeriesId> {
        let inner = self.inner.lock().unwrap();
        inner.snapshot.series.keys().copied().collect()
    }

    /// Metadata blob of a committed series.
    ///
    /// # Errors
    ///
    /// Returns `TsdbError::UnknownSeries` if no committed series has this
    /// id.
    pub fn series_metadata(&self, series_id: SeriesId) -> Result<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        inner
            .snapshot
            .series
            .get(&series_id)
            .map(|e| e.metadata.clone())
            .ok_or(TsdbError::UnknownSeries(series_id))
    }

    /// Last committed timestamp of a series; 0 when it has no records.
    ///
    /// # Errors
    ///
    /// Returns `TsdbError::UnknownSeries` if no committed series has this
    /// id.
    pub fn last_timestamp(&self, series_id: SeriesId) -> Result<Timestamp> {
        let inner = self.inner.lock().unwrap();
        inner
            .snapshot
            .series
            .get(&series_id)
            .map(|e| e.last_ts)
            .ok_or(TsdbError::UnknownSeries(series_id))
    }

    /// Page size of the underlying file.
    pub fn page_size(&self) -> usize {
        self.store.page_size()
    }
}

/// Seals the builder and writes it to a freshly allocated page.
fn write_sealed(store: &PageStore, builder: &DataPageBuilder) -> Result<PageId> {
    let id = store.allocate();
    store.write_page(id, &builder.seal())?;
    Ok(id)
}

/// Every page of a `page_count`-page array not in `referenced`.
fn derive_free_list(page_count: u64, referenced: impl Iterator<Item = PageId>) -> Vec<PageId> {
    let referenced: HashSet<PageId> = referenced.collect();
    (0..page_count).filter(|id| !referenced.contains(id)).collect()
}
