//! On-disk format tests: bit-exact superblock and data-page layouts, and
//! corruption handling at the file level.

use tempfile::TempDir;
use vulpes_tsdb::page::codec::{decode_page, DataPageBuilder};
use vulpes_tsdb::page::store::Superblock;
use vulpes_tsdb::{Database, PageType, TsdbError, Value};

#[test]
fn test_superblock_layout() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("layout.tsdb");
    {
        let db = Database::create(&path).unwrap();
        db.commit().unwrap();
    }

    let buf = std::fs::read(&path).unwrap();
    assert_eq!(&buf[0..4], b"TSDB");
    // Format version 1, little-endian.
    assert_eq!(buf[4..6], [1, 0]);
    // Page size log2 of the 4096 default.
    assert_eq!(buf[6..8], [12, 0]);
    // Reserved bytes stay zero.
    assert_eq!(buf[8..16], [0u8; 8]);
    // Slot 0 holds the initial root at generation 1; slot 1 is untouched.
    assert_eq!(
        u64::from_le_bytes(buf[24..32].try_into().unwrap()),
        1,
        "slot 0 generation"
    );
    assert_eq!(u64::from_le_bytes(buf[40..48].try_into().unwrap()), 0);

    // The checksum over bytes 0..47 validates via the public decoder.
    let superblock = Superblock::decode(&buf[..4096]).unwrap();
    assert_eq!(superblock.page_size(), 4096);
    assert_eq!(superblock.newest_slot(), Some(0));
}

#[test]
fn test_data_page_layout() {
    const PAGE_SIZE: usize = 4096;
    let mut builder = DataPageBuilder::new(PAGE_SIZE, 7, PageType::UInt64);
    builder.push(1000, Value::UInt64(41)).unwrap();
    builder.push(1003, Value::UInt64(42)).unwrap();
    builder.push(1010, Value::UInt64(43)).unwrap();
    let buf = builder.seal();
    assert_eq!(buf.len(), PAGE_SIZE);

    assert_eq!(&buf[0..4], b"DAT0");
    assert_eq!(u64::from_le_bytes(buf[4..12].try_into().unwrap()), 7);
    assert_eq!(buf[12], 1, "UINT64 type tag");
    assert_eq!(buf[13], 3, "record count varint");
    assert_eq!(u64::from_le_bytes(buf[14..22].try_into().unwrap()), 1000);
    assert_eq!(u64::from_le_bytes(buf[22..30].try_into().unwrap()), 1010);
    // Records: delta from min (varint) then the 8-byte LE value.
    assert_eq!(buf[30], 0);
    assert_eq!(u64::from_le_bytes(buf[31..39].try_into().unwrap()), 41);
    assert_eq!(buf[39], 3);
    assert_eq!(u64::from_le_bytes(buf[40..48].try_into().unwrap()), 42);
    assert_eq!(buf[48], 10);
    assert_eq!(u64::from_le_bytes(buf[49..57].try_into().unwrap()), 43);
    // Padding up to the trailing checksum stays zero.
    assert!(buf[57..PAGE_SIZE - 4].iter().all(|&b| b == 0));

    let page = decode_page(&buf, 7, PageType::UInt64).unwrap();
    assert_eq!(page.header.count, 3);
    assert_eq!(page.header.min_ts, 1000);
    assert_eq!(page.header.max_ts, 1010);
}

#[test]
fn test_index_root_page_magic_and_generation() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("idx.tsdb");
    let page_size = 512usize;
    {
        let db = Database::create_with_page_size(&path, page_size).unwrap();
        db.create_series(3, PageType::Float64, b"m").unwrap();
        db.insert_f64(3, 100, 0.5).unwrap();
        db.commit().unwrap();
    }

    let buf = std::fs::read(&path).unwrap();
    let superblock = Superblock::decode(&buf[..page_size]).unwrap();
    let slot = superblock.slots[superblock.newest_slot().unwrap()];
    assert_eq!(slot.generation, 2, "create writes 1, the commit writes 2");

    let off = (slot.page as usize + 1) * page_size;
    let root = &buf[off..off + page_size];
    assert_eq!(&root[0..4], b"IDX0");
    assert_eq!(
        u64::from_le_bytes(root[4..12].try_into().unwrap()),
        slot.generation
    );
}

#[test]
fn test_superblock_corruption_fails_open() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("sb.tsdb");
    {
        Database::create(&path).unwrap();
    }

    {
        use std::io::{Seek, SeekFrom, Write};
        let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(17)).unwrap();
        file.write_all(&[0xab]).unwrap();
    }
    assert!(matches!(
        Database::open(&path),
        Err(TsdbError::Corruption(_))
    ));
}

#[test]
fn test_truncated_file_fails_open() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("trunc.tsdb");
    {
        Database::create(&path).unwrap();
    }

    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(10).unwrap();
    drop(file);

    assert!(matches!(
        Database::open(&path),
        Err(TsdbError::Corruption(_))
    ));
}

#[test]
fn test_missing_file_is_io_error() {
    let dir = TempDir::new().unwrap();
    assert!(matches!(
        Database::open(dir.path().join("absent.tsdb")),
        Err(TsdbError::Io(_))
    ));
}
