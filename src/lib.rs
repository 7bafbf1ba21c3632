//! mdbfile reads and writes the on-disk format of a single-file desktop
//! database without a running server.
//!
//! The layers, bottom up:
//! * `byte_channel` — random access over a file or an in-memory buffer.
//! * `format` — per-version layout constants, selected from the header.
//! * `codec` / `page_channel` — page-sized I/O with a pluggable per-page
//!   transform and an advisory write guard.
//! * `buffers` — reusable temp buffers with hard/soft/none retention.
//! * `usage_map` — inline and reference page-ownership bitmaps.
//! * `record` / `long_value` — the data-page row format and MEMO/OLE
//!   page chains.
//! * `index` — the on-disk B-tree, entry encodings and collations.
//! * `table` / `db` — the thin table layer and the database handle.

pub mod buffers;
pub mod byte_channel;
pub mod codec;
pub mod column;
pub mod data_type;
pub mod db;
pub mod error;
pub mod format;
pub mod index;
pub mod long_value;
pub mod page_channel;
pub mod record;
pub mod relationship;
pub mod rowid;
pub mod table;
pub mod usage_map;
pub mod value;

pub use crate::db::{CreateOptions, Database, OpenOptions};
pub use crate::error::{Error, Result};
pub use crate::format::{Charset, FileFormat, SortOrder};
pub use crate::rowid::RowId;
pub use crate::table::{ColumnSpec, IndexSpec, Row, Table};
pub use crate::value::{DateTimeType, Value};
