//! Data-page codec: a typed record stream with delta-compressed timestamps.
//!
//! Each data page belongs to exactly one series and stores records sorted
//! by non-decreasing timestamp. Timestamps are encoded as the page minimum
//! plus a varint delta per record; values are fixed-width little-endian.
//!
//! ## Page layout
//!
//! ```text
//! Offset  Size      Field
//! ------  ----      -----
//! 0x00    4         magic "DAT0"
//! 0x04    8         series id (u64 LE)
//! 0x0C    1         type tag (u8: 1=UINT64, 2=INT64, 3=FLOAT64)
//! 0x0D    varint    record count
//! -       8         min timestamp (u64 LE)
//! -       8         max timestamp (u64 LE)
//! -       -         records: delta from min (varint) + value (8 bytes LE)
//! -       -         zero padding
//! end-4   4         CRC32 over bytes 0..len-4
//! ```

use crate::error::{Result, TsdbError};
use crate::page::{PageType, SeriesId, Timestamp, Value};
use crate::varint::{read_varint, varint_len, write_varint};
use std::io::Write;

/// Magic bytes of a data page.
pub const DATA_PAGE_MAGIC: [u8; 4] = *b"DAT0";

/// Fixed header bytes preceding the record count: magic, series id, type.
const FIXED_HEADER_LEN: usize = 4 + 8 + 1;

/// Bytes reserved for the trailing checksum.
const CRC_LEN: usize = 4;

/// Decoded header of a data page; enough for the cursor to binary-search
/// a page list without materializing record vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    /// Owning series.
    pub series_id: SeriesId,
    /// Record type of the page.
    pub page_type: PageType,
    /// Number of records.
    pub count: usize,
    /// Smallest timestamp in the page.
    pub min_ts: Timestamp,
    /// Largest timestamp in the page (closed interval).
    pub max_ts: Timestamp,
}

/// A fully decoded data page.
#[derive(Debug, Clone)]
pub struct DecodedPage {
    /// The page header.
    pub header: PageHeader,
    /// Records in timestamp order.
    pub records: Vec<(Timestamp, Value)>,
}

/// Incremental encoder for one data page.
///
/// Records are pushed in timestamp order; [`DataPageBuilder::push`] fails
/// with `TsdbError::PageFull` when the next record would exceed the page
/// body budget, instructing the caller to seal this page and start another.
#[derive(Debug)]
pub struct DataPageBuilder {
    page_size: usize,
    series_id: SeriesId,
    page_type: PageType,
    count: usize,
    min_ts: Timestamp,
    max_ts: Timestamp,
    body: Vec<u8>,
}

impl DataPageBuilder {
    /// Creates an empty builder for one page of `page_size` bytes.
    pub fn new(page_size: usize, series_id: SeriesId, page_type: PageType) -> Self {
        Self {
            page_size,
            series_id,
            page_type,
            count: 0,
            min_ts: 0,
            max_ts: 0,
            body: Vec::new(),
        }
    }

    /// True if no record has been pushed yet.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Number of records pushed so far.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Appends one record.
    ///
    /// # Errors
    ///
    /// - `TsdbError::PageFull` if the record does not fit; the record is not
    ///   consumed and the caller seals the page.
    /// - `TsdbError::TypeMismatch` if the value kind differs from the page
    ///   type.
    ///
    /// # Panics
    ///
    /// Debug builds assert the timestamp is non-decreasing; the write
    /// buffer guarantees this upstream.
    pub fn push(&mut self, ts: Timestamp, value: Value) -> Result<()> {
        if value.page_type() != self.page_type {
            return Err(TsdbError::TypeMismatch {
                expected: self.page_type,
                actual: value.page_type(),
            });
        }
        debug_assert!(self.is_empty() || ts >= self.max_ts, "records out of order");

        let delta = if self.is_empty() { 0 } else { ts - self.min_ts };
        let record_len = varint_len(delta) + 8;
        let header_len = FIXED_HEADER_LEN + varint_len(self.count as u64 + 1) + 8 + 8;
        if header_len + self.body.len() + record_len + CRC_LEN > self.page_size {
            return Err(TsdbError::PageFull);
        }

        write_varint(&mut self.body, delta)?;
        self.body.write_all(&value.to_le_bytes())?;
        if self.is_empty() {
            self.min_ts = ts;
        }
        self.max_ts = ts;
        self.count += 1;
        Ok(())
    }

    /// Serializes the page, zero-padded to the page size with the trailing
    /// checksum filled in.
    ///
    /// # Panics
    ///
    /// Panics if the builder is empty; empty pages are never written.
    pub fn seal(&self) -> Vec<u8> {
        assert!(!self.is_empty(), "sealing an empty data page");
        let mut buf = Vec::with_capacity(self.page_size);
        buf.extend_from_slice(&DATA_PAGE_MAGIC);
        buf.extend_from_slice(&self.series_id.to_le_bytes());
        buf.push(self.page_type as u8);
        write_varint(&mut buf, self.count as u64).expect("vec write");
        buf.extend_from_slice(&self.min_ts.to_le_bytes());
        buf.extend_from_slice(&self.max_ts.to_le_bytes());
        buf.extend_from_slice(&self.body);
        buf.resize(self.page_size, 0);
        let crc = crc32fast::hash(&buf[..self.page_size - CRC_LEN]);
        buf[self.page_size - CRC_LEN..].copy_from_slice(&crc.to_le_bytes());
        buf
    }
}

/// Validates the checksum and decodes the fixed header fields.
fn decode_validated_header(buf: &[u8]) -> Result<(PageHeader, usize)> {
    if buf.len() < FIXED_HEADER_LEN + CRC_LEN {
        return Err(TsdbError::corruption("data page truncated"));
    }
    let crc_off = buf.len() - CRC_LEN;
    let expected = u32::from_le_bytes(buf[crc_off..].try_into().unwrap());
    let actual = crc32fast::hash(&buf[..crc_off]);
    if expected != actual {
        return Err(TsdbError::corruption(format!(
            "data page checksum mismatch: expected {expected}, got {actual}"
        )));
    }
    let magic: [u8; 4] = buf[0..4].try_into().unwrap();
    if magic != DATA_PAGE_MAGIC {
        return Err(TsdbError::corruption(format!(
            "bad data page magic: {magic:?}"
        )));
    }
    let series_id = u64::from_le_bytes(buf[4..12].try_into().unwrap());
    let page_type = PageType::from_u8(buf[12])
        .ok_or_else(|| TsdbError::corruption(format!("unknown page type tag: {}", buf[12])))?;

    let mut rest = &buf[FIXED_HEADER_LEN..crc_off];
    let before = rest.len();
    let count = read_varint(&mut rest)? as usize;
    if rest.len() < 16 {
        return Err(TsdbError::corruption("data page header truncated"));
    }
    let min_ts = u64::from_le_bytes(rest[0..8].try_into().unwrap());
    let max_ts = u64::from_le_bytes(rest[8..16].try_into().unwrap());
    if count == 0 || min_ts > max_ts {
        return Err(TsdbError::corruption(format!(
            "inconsistent data page header: count {count}, range [{min_ts}, {max_ts}]"
        )));
    }
    let body_off = FIXED_HEADER_LEN + (before - rest.len()) + 16;
    Ok((
        PageHeader {
            series_id,
            page_type,
            count,
            min_ts,
            max_ts,
        },
        body_off,
    ))
}

/// Decodes only the header of a data page, validating its checksum and
/// that it belongs to `series_id` with type `page_type`.
pub fn decode_page_header(
    buf: &[u8],
    series_id: SeriesId,
    page_type: PageType,
) -> Result<PageHeader> {
    let (header, _) = decode_validated_header(buf)?;
    check_ownership(&header, series_id, page_type)?;
    Ok(header)
}

/// Decodes a full data page.
///
/// Validates the checksum, magic, ownership, and that record count,
/// min/max and the delta stream are mutually consistent. Any mismatch
/// surfaces as `TsdbError::Corruption`.
pub fn decode_page(buf: &[u8], series_id: SeriesId, page_type: PageType) -> Result<DecodedPage> {
    let (header, body_off) = decode_validated_header(buf)?;
    check_ownership(&header, series_id, page_type)?;

    let mut rest = &buf[body_off..buf.len() - CRC_LEN];
    let mut records = Vec::with_capacity(header.count);
    let mut prev_delta = 0u64;
    for i in 0..header.count {
        let delta = read_varint(&mut rest)?;
        if delta < prev_delta {
            return Err(TsdbError::corruption(format!(
                "timestamp delta decreases at record {i}"
            )));
        }
        if rest.len() < 8 {
            return Err(TsdbError::corruption("data page record stream truncated"));
        }
        let value = Value::from_le_bytes(page_type, rest[0..8].try_into().unwrap());
        rest = &rest[8..];
        let ts = header.min_ts.checked_add(delta).ok_or_else(|| {
            TsdbError::corruption(format!("timestamp overflow at record {i}"))
        })?;
        records.push((ts, value));
        prev_delta = delta;
    }
    match (records.first(), records.last()) {
        (Some(&(first, _)), Some(&(last, _)))
            if first == header.min_ts && last == header.max_ts => {}
        _ => {
            return Err(TsdbError::corruption(
                "data page min/max inconsistent with record stream",
            ))
        }
    }
    Ok(DecodedPage { header, records })
}

fn check_ownership(header: &PageHeader, series_id: SeriesId, page_type: PageType) -> Result<()> {
    if header.series_id != series_id {
        return Err(TsdbError::corruption(format!(
            "data page owned by series {}, expected {series_id}",
            header.series_id
        )));
    }
    if header.page_type != page_type {
        return Err(TsdbError::corruption(format!(
            "data page type {:?} does not match series type {page_type:?}",
            header.page_type
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE_SIZE: usize = 256;

    fn build_page(records: &[(u64, u64)]) -> Vec<u8> {
        let mut builder = DataPageBuilder::new(PAGE_SIZE, 1, PageType::UInt64);
        for &(ts, v) in records {
            builder.push(ts, Value::UInt64(v)).unwrap();
        }
        builder.seal()
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let records = [(1000, 1), (1010, 2), (1010, 3), (1500, 4)];
        let buf = build_page(&records);
        assert_eq!(buf.len(), PAGE_SIZE);
        assert_eq!(&buf[0..4], b"DAT0");

        let page = decode_page(&buf, 1, PageType::UInt64).unwrap();
        assert_eq!(page.header.count, 4);
        assert_eq!(page.header.min_ts, 1000);
        assert_eq!(page.header.max_ts, 1500);
        let expected: Vec<(u64, Value)> =
            records.iter().map(|&(t, v)| (t, Value::UInt64(v))).collect();
        assert_eq!(page.records, expected);
    }

    #[test]
    fn test_header_only_decode() {
        let buf = build_page(&[(5, 9), (8, 10)]);
        let header = decode_page_header(&buf, 1, PageType::UInt64).unwrap();
        assert_eq!(header.count, 2);
        assert_eq!(header.min_ts, 5);
        assert_eq!(header.max_ts, 8);
    }

    #[test]
    fn test_page_full_then_new_page() {
        let mut builder = DataPageBuilder::new(PAGE_SIZE, 1, PageType::UInt64);
        let mut pushed = 0u64;
        loop {
            match builder.push(1000 + pushed, Value::UInt64(pushed)) {
                Ok(()) => pushed += 1,
                Err(TsdbError::PageFull) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(pushed > 0);
        // The rejected record still fits in a fresh page.
        let mut next = DataPageBuilder::new(PAGE_SIZE, 1, PageType::UInt64);
        next.push(1000 + pushed, Value::UInt64(pushed)).unwrap();

        // The sealed page decodes to exactly the accepted records.
        let page = decode_page(&builder.seal(), 1, PageType::UInt64).unwrap();
        assert_eq!(page.header.count as u64, pushed);
    }

    #[test]
    fn test_type_mismatch_on_push() {
        let mut builder = DataPageBuilder::new(PAGE_SIZE, 1, PageType::UInt64);
        assert!(matches!(
            builder.push(1, Value::Float64(0.5)),
            Err(TsdbError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_corrupted_byte_fails_checksum() {
        let mut buf = build_page(&[(5, 9)]);
        buf[40] ^= 0x01;
        assert!(matches!(
            decode_page(&buf, 1, PageType::UInt64),
            Err(TsdbError::Corruption(_))
        ));
    }

    #[test]
    fn test_wrong_series_or_type_is_corruption() {
        let buf = build_page(&[(5, 9)]);
        assert!(matches!(
            decode_page(&buf, 2, PageType::UInt64),
            Err(TsdbError::Corruption(_))
        ));
        assert!(matches!(
            decode_page(&buf, 1, PageType::Int64),
            Err(TsdbError::Corruption(_))
        ));
    }

    #[test]
    fn test_equal_timestamps_keep_insertion_order() {
        let buf = build_page(&[(7, 1), (7, 2), (7, 3)]);
        let page = decode_page(&buf, 1, PageType::UInt64).unwrap();
        let values: Vec<u64> = page
            .records
            .iter()
            .map(|(_, v)| v.as_u64().unwrap())
            .collect();
        assert_eq!(values, vec![1, 2, 3]);
    }

    #[test]
    fn test_float_page_roundtrip() {
        let mut builder = DataPageBuilder::new(PAGE_SIZE, 3, PageType::Float64);
        builder.push(10, Value::Float64(-2.25)).unwrap();
        builder.push(20, Value::Float64(7.5)).unwrap();
        let page = decode_page(&builder.seal(), 3, PageType::Float64).unwrap();
        assert_eq!(page.records[0].1.as_f64().unwrap(), -2.25);
        assert_eq!(page.records[1].1.as_f64().unwrap(), 7.5);
    }
}
