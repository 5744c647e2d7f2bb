//! Vulpes - embedded time series database file engine
//!
//! This crate persists per-series streams of `(timestamp, value)` records
//! in a single page-structured file and exposes ordered, seekable read
//! cursors over them. It is the durable substrate beneath a metric
//! collection daemon: the daemon maps user metrics onto series ids and
//! hands raw samples down to this engine.
//!
//! # Components
//!
//! - [`Database`]: open/create, series management, inserts, commit
//! - [`Cursor`]: forward and seekable reads over a committed snapshot
//! - [`PageStore`]: fixed-size page file with free-list allocation
//! - [`varint`]: LEB128 codec used throughout the page bodies
//!
//! # Example
//!
//! ```rust,ignore
//! use vulpes_tsdb::{Database, PageType};
//!
//! let db = Database::create("/var/lib/metricd/metrics.tsdb")?;
//! db.create_series(1, PageType::UInt64, b"requests_total")?;
//! db.insert_u64(1, now_micros, 42)?;
//! db.commit()?;
//!
//! let mut cursor = db.get_cursor(1, PageType::UInt64)?;
//! while cursor.valid() {
//!     let (ts, value) = cursor.get().unwrap();
//!     println!("{ts} {value:?}");
//!     cursor.next()?;
//! }
//! ```
//!
//! # Concurrency
//!
//! The engine is a passive library with no internal threads. Mutating
//! operations serialize on an internal mutex; any number of cursors may
//! read concurrently, each pinned to the committed snapshot it was
//! created against.

#![deny(missing_docs)]

pub mod buffer;
pub mod cursor;
pub mod db;
pub mod error;
pub mod index;
pub mod page;
pub mod varint;

pub use cursor::Cursor;
pub use db::Database;
pub use error::{Result, TsdbError};
pub use page::{PageId, PageStore, PageType, SeriesId, Timestamp, Value};
