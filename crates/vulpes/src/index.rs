//! Series index: the committed mapping from series id to metadata and
//! ordered page list, stored as a chain of index pages.
//!
//! The index is rewritten whole on every commit (copy-on-write). Readers
//! hold an immutable [`IndexSnapshot`] behind an `Arc`; the writer builds
//! the next snapshot and publishes it only after the new root is durable.
//!
//! ## Index body
//!
//! The logical body is one byte stream, split across the chain:
//!
//! ```text
//! series count (varint)
//! per series:
//!   id (u64 LE)
//!   type (u8)
//!   metadata length (varint) + metadata bytes
//!   last timestamp (u64 LE)
//!   page-list length (varint) + page ids (u64 LE each)
//! free-list length (varint) + free page ids (u64 LE each)
//! ```
//!
//! ## Index page layout
//!
//! ```text
//! Offset  Size    Field
//! ------  ----    -----
//! 0x00    4       magic "IDX0"
//! 0x04    8       root generation (u64 LE)
//! 0x0C    8       next page id (u64 LE, u64::MAX = end of chain)
//! 0x14    4       body bytes in this page (u32 LE)
//! 0x18    -       body bytes, then zero padding
//! end-4   4       CRC32 over bytes 0..len-4
//! ```
//!
//! Every chain page embeds the root generation; recovery cross-checks it
//! against the superblock slot so a stale or partially overwritten chain
//! can never masquerade as the selected root.

use crate::error::{Result, TsdbError};
use crate::page::{PageId, PageStore, PageType, SeriesId, Timestamp, NIL_PAGE};
use crate::varint::{read_varint, varint_len, write_varint};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Magic bytes of an index page.
pub const INDEX_PAGE_MAGIC: [u8; 4] = *b"IDX0";

/// Chain page header bytes preceding the body.
const CHAIN_HEADER_LEN: usize = 4 + 8 + 8 + 4;

/// Bytes reserved for the trailing checksum.
const CRC_LEN: usize = 4;

/// Everything the index records about one series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesEntry {
    /// Caller-chosen series id.
    pub id: SeriesId,
    /// Record type, immutable after creation.
    pub page_type: PageType,
    /// Opaque user metadata blob.
    pub metadata: Vec<u8>,
    /// Timestamp of the last committed record; 0 when none exist.
    pub last_ts: Timestamp,
    /// Data pages in timestamp order.
    pub pages: Vec<PageId>,
}

/// An immutable committed index. Cursors and the accessor methods of the
/// database share it by reference count; a commit replaces the whole
/// snapshot rather than mutating it.
#[derive(Debug, Default)]
pub struct IndexSnapshot {
    /// Generation of the root this snapshot was loaded from or written as.
    pub generation: u64,
    /// Series entries keyed by id.
    pub series: BTreeMap<SeriesId, Arc<SeriesEntry>>,
}

impl IndexSnapshot {
    /// All page ids referenced by the series page lists.
    pub fn data_pages(&self) -> impl Iterator<Item = PageId> + '_ {
        self.series.values().flat_map(|e| e.pages.iter().copied())
    }
}

/// Serializes the series table portion of the index body.
pub fn encode_series_table(series: &BTreeMap<SeriesId, Arc<SeriesEntry>>) -> Vec<u8> {
    let mut buf = Vec::new();
    write_varint(&mut buf, series.len() as u64).expect("vec write");
    for entry in series.values() {
        buf.extend_from_slice(&entry.id.to_le_bytes());
        buf.push(entry.page_type as u8);
        write_varint(&mut buf, entry.metadata.len() as u64).expect("vec write");
        buf.extend_from_slice(&entry.metadata);
        buf.extend_from_slice(&entry.last_ts.to_le_bytes());
        write_varint(&mut buf, entry.pages.len() as u64).expect("vec write");
        for page in &entry.pages {
            buf.extend_from_slice(&page.to_le_bytes());
        }
    }
    buf
}

/// Serialized length of a free list of `count` entries.
pub fn free_list_len(count: usize) -> usize {
    varint_len(count as u64) + 8 * count
}

/// Appends the free list to an encoded series table, completing the body.
pub fn encode_free_list(body: &mut Vec<u8>, free: &[PageId]) {
    write_varint(body, free.len() as u64).expect("vec write");
    for page in free {
        body.extend_from_slice(&page.to_le_bytes());
    }
}

/// Decodes an index body into the series map and the stored free list.
pub fn decode_body(buf: &[u8]) -> Result<(BTreeMap<SeriesId, Arc<SeriesEntry>>, Vec<PageId>)> {
    let mut rest = buf;
    let series_count = read_varint(&mut rest)? as usize;
    let mut series = BTreeMap::new();
    for _ in 0..series_count {
        let id = read_u64(&mut rest)?;
        let tag = read_u8(&mut rest)?;
        let page_type = PageType::from_u8(tag)
            .ok_or_else(|| TsdbError::corruption(format!("unknown series type tag: {tag}")))?;
        let metadata_len = read_varint(&mut rest)? as usize;
        if rest.len() < metadata_len {
            return Err(TsdbError::corruption("series metadata truncated"));
        }
        let metadata = rest[..metadata_len].to_vec();
        rest = &rest[metadata_len..];
        let last_ts = read_u64(&mut rest)?;
        let page_count = read_varint(&mut rest)? as usize;
        let mut pages = Vec::with_capacity(page_count);
        for _ in 0..page_count {
            pages.push(read_u64(&mut rest)?);
        }
        if series
            .insert(
                id,
                Arc::new(SeriesEntry {
                    id,
                    page_type,
                    metadata,
                    last_ts,
                    pages,
                }),
            )
            .is_some()
        {
            return Err(TsdbError::corruption(format!("duplicate series id {id}")));
        }
    }
    let free_count = read_varint(&mut rest)? as usize;
    let mut free = Vec::with_capacity(free_count);
    for _ in 0..free_count {
        free.push(read_u64(&mut rest)?);
    }
    if !rest.is_empty() {
        return Err(TsdbError::corruption(format!(
            "{} trailing bytes after index body",
            rest.len()
        )));
    }
    Ok((series, free))
}

/// Body bytes one chain page can hold.
pub fn chain_page_capacity(page_size: usize) -> usize {
    page_size - CHAIN_HEADER_LEN - CRC_LEN
}

/// Number of chain pages required for a body of `body_len` bytes.
pub fn chain_len_for(page_size: usize, body_len: usize) -> usize {
    body_len.div_ceil(chain_page_capacity(page_size)).max(1)
}

/// Serializes `body` into chain pages linked through `chain`.
///
/// # Panics
///
/// Panics if `chain` has fewer pages than the body requires.
pub fn encode_chain(
    page_size: usize,
    generation: u64,
    chain: &[PageId],
    body: &[u8],
) -> Vec<Vec<u8>> {
    let capacity = chain_page_capacity(page_size);
    assert!(
        chain.len() * capacity >= body.len() && !chain.is_empty(),
        "index chain too short for body"
    );
    let mut pages = Vec::with_capacity(chain.len());
    for (i, chunk) in split_chunks(body, capacity, chain.len()).enumerate() {
        let next = chain.get(i + 1).copied().unwrap_or(NIL_PAGE);
        let mut buf = Vec::with_capacity(page_size);
        buf.extend_from_slice(&INDEX_PAGE_MAGIC);
        buf.extend_from_slice(&generation.to_le_bytes());
        buf.extend_from_slice(&next.to_le_bytes());
        buf.extend_from_slice(&(chunk.len() as u32).to_le_bytes());
        buf.extend_from_slice(chunk);
        buf.resize(page_size, 0);
        let crc = crc32fast::hash(&buf[..page_size - CRC_LEN]);
        buf[page_size - CRC_LEN..].copy_from_slice(&crc.to_le_bytes());
        pages.push(buf);
    }
    pages
}

/// Splits `body` into exactly `n` chunks of at most `capacity` bytes,
/// padding with empty chunks so every chain page is emitted.
fn split_chunks(body: &[u8], capacity: usize, n: usize) -> impl Iterator<Item = &[u8]> {
    (0..n).map(move |i| {
        let start = (i * capacity).min(body.len());
        let end = ((i + 1) * capacity).min(body.len());
        &body[start..end]
    })
}

/// Reads and validates an index chain starting at `root`, returning the
/// reassembled body and the chain page ids.
///
/// # Errors
///
/// `TsdbError::Corruption` on bad magic, checksum mismatch, a generation
/// that differs from `generation`, or a cyclic chain.
pub fn read_chain(
    store: &PageStore,
    root: PageId,
    generation: u64,
) -> Result<(Vec<u8>, Vec<PageId>)> {
    let mut body = Vec::new();
    let mut chain = Vec::new();
    let mut next = root;
    let limit = store.page_count() + 1;
    while next != NIL_PAGE {
        if chain.len() as u64 >= limit {
            return Err(TsdbError::corruption("index chain cycle"));
        }
        let buf = store.read_page(next)?;
        chain.push(next);
        next = decode_chain_page(&buf, generation, &mut body)?;
    }
    Ok((body, chain))
}

/// Validates one chain page, appends its body bytes, returns the next id.
fn decode_chain_page(buf: &[u8], generation: u64, body: &mut Vec<u8>) -> Result<PageId> {
    let crc_off = buf.len() - CRC_LEN;
    let expected = u32::from_le_bytes(buf[crc_off..].try_into().unwrap());
    let actual = crc32fast::hash(&buf[..crc_off]);
    if expected != actual {
        return Err(TsdbError::corruption(format!(
            "index page checksum mismatch: expected {expected}, got {actual}"
        )));
    }
    let magic: [u8; 4] = buf[0..4].try_into().unwrap();
    if magic != INDEX_PAGE_MAGIC {
        return Err(TsdbError::corruption(format!(
            "bad index page magic: {magic:?}"
        )));
    }
    let page_generation = u64::from_le_bytes(buf[4..12].try_into().unwrap());
    if page_generation != generation {
        return Err(TsdbError::corruption(format!(
            "index page generation {page_generation} does not match root generation {generation}"
        )));
    }
    let next = u64::from_le_bytes(buf[12..20].try_into().unwrap());
    let len = u32::from_le_bytes(buf[20..24].try_into().unwrap()) as usize;
    if len > crc_off - CHAIN_HEADER_LEN {
        return Err(TsdbError::corruption("index page body length out of range"));
    }
    body.extend_from_slice(&buf[CHAIN_HEADER_LEN..CHAIN_HEADER_LEN + len]);
    Ok(next)
}

fn read_u64(rest: &mut &[u8]) -> Result<u64> {
    if rest.len() < 8 {
        return Err(TsdbError::corruption("index body truncated"));
    }
    let v = u64::from_le_bytes(rest[..8].try_into().unwrap());
    *rest = &rest[8..];
    Ok(v)
}

fn read_u8(rest: &mut &[u8]) -> Result<u8> {
    if rest.is_empty() {
        return Err(TsdbError::corruption("index body truncated"));
    }
    let v = rest[0];
    *rest = &rest[1..];
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_series() -> BTreeMap<SeriesId, Arc<SeriesEntry>> {
        let mut series = BTreeMap::new();
        series.insert(
            1,
            Arc::new(SeriesEntry {
                id: 1,
                page_type: PageType::UInt64,
                metadata: b"cpu.load".to_vec(),
                last_ts: 12345,
                pages: vec![0, 3, 7],
            }),
        );
        series.insert(
            9,
            Arc::new(SeriesEntry {
                id: 9,
                page_type: PageType::Float64,
                metadata: Vec::new(),
                last_ts: 0,
                pages: Vec::new(),
            }),
        );
        series
    }

    #[test]
    fn test_body_roundtrip() {
        let series = sample_series();
        let mut body = encode_series_table(&series);
        encode_free_list(&mut body, &[2, 5]);

        let (decoded, free) = decode_body(&body).unwrap();
        assert_eq!(free, vec![2, 5]);
        assert_eq!(decoded.len(), 2);
        assert_eq!(*decoded[&1], *series[&1]);
        assert_eq!(*decoded[&9], *series[&9]);
    }

    #[test]
    fn test_body_rejects_trailing_garbage() {
        let mut body = encode_series_table(&BTreeMap::new());
        encode_free_list(&mut body, &[]);
        body.push(0);
        assert!(matches!(
            decode_body(&body),
            Err(TsdbError::Corruption(_))
        ));
    }

    #[test]
    fn test_free_list_len_matches_encoding() {
        let free = vec![1u64, 2, 3, 4];
        let mut buf = Vec::new();
        encode_free_list(&mut buf, &free);
        assert_eq!(buf.len(), free_list_len(free.len()));
    }

    #[test]
    fn test_chain_split_and_reassemble() {
        let page_size = 128;
        let capacity = chain_page_capacity(page_size);
        let body: Vec<u8> = (0..capacity * 2 + 10).map(|i| i as u8).collect();
        let n = chain_len_for(page_size, body.len());
        assert_eq!(n, 3);

        let chain: Vec<PageId> = vec![5, 9, 2];
        let pages = encode_chain(page_size, 42, &chain, &body);
        assert_eq!(pages.len(), 3);

        let mut reassembled = Vec::new();
        let mut next = decode_chain_page(&pages[0], 42, &mut reassembled).unwrap();
        assert_eq!(next, 9);
        next = decode_chain_page(&pages[1], 42, &mut reassembled).unwrap();
        assert_eq!(next, 2);
        next = decode_chain_page(&pages[2], 42, &mut reassembled).unwrap();
        assert_eq!(next, NIL_PAGE);
        assert_eq!(reassembled, body);
    }

    #[test]
    fn test_chain_page_rejects_wrong_generation() {
        let pages = encode_chain(128, 7, &[0], b"abc");
        let mut body = Vec::new();
        assert!(matches!(
            decode_chain_page(&pages[0], 8, &mut body),
            Err(TsdbError::Corruption(_))
        ));
    }

    #[test]
    fn test_chain_page_rejects_bit_flip() {
        let mut pages = encode_chain(128, 7, &[0], b"abc");
        pages[0][30] ^= 0x10;
        let mut body = Vec::new();
        assert!(matches!(
            decode_chain_page(&pages[0], 7, &mut body),
            Err(TsdbError::Corruption(_))
        ));
    }

    #[test]
    fn test_empty_index_fits_one_page() {
        let mut body = encode_series_table(&BTreeMap::new());
        encode_free_list(&mut body, &[]);
        assert_eq!(chain_len_for(128, body.len()), 1);
    }
}
