//! Superblock codec and fixed-size page store.
//!
//! A database is a single regular file: one superblock page at offset 0
//! followed by a contiguous array of fixed-size pages. The store hands out
//! page ids, performs aligned page I/O and syncs the file; it never
//! interprets page contents.
//!
//! ## Superblock layout
//!
//! ```text
//! Offset  Size    Field
//! ------  ----    -----
//! 0x00    4       magic "TSDB"
//! 0x04    2       format version (u16 LE) = 1
//! 0x06    2       page size log2 (u16 LE), e.g. 12 for 4096
//! 0x08    8       reserved, zero
//! 0x10    8       index-root-0 page id (u64 LE)
//! 0x18    8       index-root-0 generation (u64 LE)
//! 0x20    8       index-root-1 page id (u64 LE)
//! 0x28    8       index-root-1 generation (u64 LE)
//! 0x30    4       CRC32 over bytes 0..47
//! 0x34    -       zero up to the page size
//! ```
//!
//! The two root slots alternate between commits; both fit inside the first
//! 512-byte sector, so a root flip is a single sector-atomic write. A slot
//! with generation 0 has never held a root.

use crate::error::{Result, TsdbError};
use crate::page::PageId;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Mutex;

/// Magic bytes at offset 0 of every database file.
pub const SUPERBLOCK_MAGIC: [u8; 4] = *b"TSDB";

/// Current database format version.
pub const FORMAT_VERSION: u16 = 1;

/// Default page size for new databases.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Smallest supported page size.
pub const MIN_PAGE_SIZE: usize = 128;

/// Largest supported page size.
pub const MAX_PAGE_SIZE: usize = 1 << 30;

/// Number of superblock bytes covered by the checksum.
const SUPERBLOCK_CRC_RANGE: usize = 48;

/// One of the two index-root slots recorded in the superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RootSlot {
    /// First page of the index chain this slot points at.
    pub page: PageId,
    /// Generation of the root; 0 means the slot was never written.
    pub generation: u64,
}

/// Decoded superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    /// Base-2 logarithm of the page size.
    pub page_size_log2: u16,
    /// The two alternating index-root slots.
    pub slots: [RootSlot; 2],
}

impl Superblock {
    /// Creates a superblock for a fresh database with both slots empty.
    pub fn new(page_size_log2: u16) -> Self {
        Self {
            page_size_log2,
            slots: [RootSlot::default(); 2],
        }
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        1usize << self.page_size_log2
    }

    /// Index of the slot holding the newest generation, or `None` when the
    /// database has never committed a root.
    pub fn newest_slot(&self) -> Option<usize> {
        match (self.slots[0].generation, self.slots[1].generation) {
            (0, 0) => None,
            (a, b) if a >= b => Some(0),
            _ => Some(1),
        }
    }

    /// Serializes the superblock into a full zero-padded page.
    pub fn encode(&self, page_size: usize) -> Vec<u8> {
        let mut buf = vec![0u8; page_size];
        buf[0..4].copy_from_slice(&SUPERBLOCK_MAGIC);
        buf[4..6].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        buf[6..8].copy_from_slice(&self.page_size_log2.to_le_bytes());
        // bytes 8..16 reserved, zero
        buf[16..24].copy_from_slice(&self.slots[0].page.to_le_bytes());
        buf[24..32].copy_from_slice(&self.slots[0].generation.to_le_bytes());
        buf[32..40].copy_from_slice(&self.slots[1].page.to_le_bytes());
        buf[40..48].copy_from_slice(&self.slots[1].generation.to_le_bytes());
        let crc = crc32fast::hash(&buf[..SUPERBLOCK_CRC_RANGE]);
        buf[48..52].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Deserializes and validates a superblock.
    ///
    /// # Errors
    ///
    /// Returns `TsdbError::Corruption` on bad magic, unsupported version,
    /// checksum mismatch or an out-of-range page size.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 52 {
            return Err(TsdbError::corruption("superblock truncated"));
        }
        let magic: [u8; 4] = buf[0..4].try_into().unwrap();
        if magic != SUPERBLOCK_MAGIC {
            return Err(TsdbError::corruption(format!(
                "bad superblock magic: {magic:?}"
            )));
        }
        let version = u16::from_le_bytes(buf[4..6].try_into().unwrap());
        if version != FORMAT_VERSION {
            return Err(TsdbError::corruption(format!(
                "unsupported format version: {version}"
            )));
        }
        let expected = u32::from_le_bytes(buf[48..52].try_into().unwrap());
        let actual = crc32fast::hash(&buf[..SUPERBLOCK_CRC_RANGE]);
        if expected != actual {
            return Err(TsdbError::corruption(format!(
                "superblock checksum mismatch: expected {expected}, got {actual}"
            )));
        }
        let page_size_log2 = u16::from_le_bytes(buf[6..8].try_into().unwrap());
        let page_size = 1usize.checked_shl(u32::from(page_size_log2)).unwrap_or(0);
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(TsdbError::corruption(format!(
                "page size out of range: 2^{page_size_log2}"
            )));
        }
        let slot = |off: usize| RootSlot {
            page: u64::from_le_bytes(buf[off..off + 8].try_into().unwrap()),
            generation: u64::from_le_bytes(buf[off + 8..off + 16].try_into().unwrap()),
        };
        Ok(Self {
            page_size_log2,
            slots: [slot(16), slot(32)],
        })
    }
}

/// Page allocation state: the free list plus the page-array length.
#[derive(Debug, Default)]
struct AllocState {
    /// Number of pages in the page array (allocated or free).
    page_count: u64,
    /// Ids available for reuse, popped newest-first.
    free: Vec<PageId>,
}

/// Fixed-size page file.
///
/// All page I/O is aligned to the page size. Reads go through
/// [`FileExt::read_at`] so concurrent cursors never contend with the writer
/// for a shared file offset. The allocator state is interior-mutable; the
/// caller serializes writers, readers only ever call [`PageStore::read_page`].
#[derive(Debug)]
pub struct PageStore {
    file: File,
    page_size: usize,
    alloc: Mutex<AllocState>,
}

impl PageStore {
    /// Creates a new database file and writes an empty superblock.
    ///
    /// # Errors
    ///
    /// Returns `TsdbError::AlreadyExists` if the path exists, or an I/O
    /// error from file creation.
    pub fn create(path: &Path, page_size: usize) -> Result<(Self, Superblock)> {
        assert!(
            page_size.is_power_of_two() && (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size),
            "page size must be a power of two in [{MIN_PAGE_SIZE}, {MAX_PAGE_SIZE}]"
        );
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    TsdbError::AlreadyExists(path.display().to_string())
                } else {
                    TsdbError::Io(e)
                }
            })?;
        let superblock = Superblock::new(page_size.trailing_zeros() as u16);
        file.write_all_at(&superblock.encode(page_size), 0)?;
        let store = Self {
            file,
            page_size,
            alloc: Mutex::new(AllocState::default()),
        };
        Ok((store, superblock))
    }

    /// Opens an existing database file and validates its superblock.
    ///
    /// The page-array length is derived from the file size, so pages written
    /// by an aborted commit past the committed index remain addressable and
    /// can be reclaimed.
    pub fn open(path: &Path) -> Result<(Self, Superblock)> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut head = [0u8; 52];
        file.read_exact_at(&mut head, 0)
            .map_err(|e| map_short_read(e, "superblock"))?;
        let superblock = Superblock::decode(&head)?;
        let page_size = superblock.page_size();
        let file_len = file.metadata()?.len();
        if file_len < page_size as u64 {
            return Err(TsdbError::corruption("file shorter than the superblock"));
        }
        let page_count = file_len / page_size as u64 - 1;
        let store = Self {
            file,
            page_size,
            alloc: Mutex::new(AllocState {
                page_count,
                free: Vec::new(),
            }),
        };
        Ok((store, superblock))
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of pages in the page array, free or allocated.
    pub fn page_count(&self) -> u64 {
        self.alloc.lock().unwrap().page_count
    }

    /// Pops a page from the free list, growing the page array by one page
    /// when the list is empty. Does not touch the disk; a grown page comes
    /// into existence when it is first written.
    pub fn allocate(&self) -> PageId {
        let mut alloc = self.alloc.lock().unwrap();
        match alloc.free.pop() {
            Some(id) => id,
            None => {
                let id = alloc.page_count;
                alloc.page_count += 1;
                id
            }
        }
    }

    /// Replaces the free list, e.g. after loading or deriving it from an
    /// index root.
    pub fn set_free_list(&self, free: Vec<PageId>) {
        self.alloc.lock().unwrap().free = free;
    }

    /// Snapshot of the current free list.
    pub fn free_list(&self) -> Vec<PageId> {
        self.alloc.lock().unwrap().free.clone()
    }

    /// Reads one full page.
    ///
    /// # Errors
    ///
    /// A short read on an allocated page surfaces as `TsdbError::Corruption`;
    /// other failures surface as `TsdbError::Io`.
    pub fn read_page(&self, id: PageId) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.page_size];
        self.file
            .read_exact_at(&mut buf, self.page_offset(id))
            .map_err(|e| map_short_read(e, &format!("page {id}")))?;
        Ok(buf)
    }

    /// Writes one full page. `buf` must be exactly one page long.
    pub fn write_page(&self, id: PageId, buf: &[u8]) -> Result<()> {
        assert_eq!(buf.len(), self.page_size, "unaligned page write");
        self.file.write_all_at(buf, self.page_offset(id))?;
        Ok(())
    }

    /// Rewrites the superblock page.
    pub fn write_superblock(&self, superblock: &Superblock) -> Result<()> {
        self.file
            .write_all_at(&superblock.encode(self.page_size), 0)?;
        Ok(())
    }

    /// Flushes file data and metadata to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn page_offset(&self, id: PageId) -> u64 {
        (id + 1) * self.page_size as u64
    }
}

fn map_short_read(e: std::io::Error, what: &str) -> TsdbError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        TsdbError::corruption(format!("short read of {what}"))
    } else {
        TsdbError::Io(e)
    }
}
