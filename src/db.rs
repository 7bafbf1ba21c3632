//! Defines the `Database` type, one handle over one database file.
//!
//! The handle owns the page channel, resolves the format from the header
//! page, and exposes the minimal catalog: a system table mapping table
//! names to their definition pages, itself stored as a plain table.

use chrono::FixedOffset;
use log::debug;
use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

use crate::byte_channel::{ByteChannel, FileChannel, MemoryChannel, ReadOnlyChannel};
use crate::codec::{CodecProvider, IdentityCodec};
use crate::data_type::DataType;
use crate::error::{Error, Result};
use crate::format::{self, Charset, DbHeader, FileFormat, Format, SortOrder};
use crate::page_channel::{PageChannel, PageNum, INVALID_PAGE_NUMBER};
use crate::table::{ColumnSpec, IndexSpec, Row, Table};
use crate::value::{DateTimeType, Value};

const CATALOG_TABLE_NAME: &str = "sys_tables";
const CATALOG_COL_NAME: &str = "name";
const CATALOG_COL_DEF_PAGE: &str = "definition_page";

/// Options recognized when opening an existing database.
pub struct OpenOptions {
    pub read_only: bool,
    /// When true every write flushes; otherwise flushing happens at
    /// write-guard release and explicit `flush`.
    pub auto_sync: bool,
    /// Overrides the format-default text charset.
    pub charset: Option<Charset>,
    /// Shifts date-time values between storage and caller.
    pub time_zone: Option<FixedOffset>,
    /// Selects the date-value shape returned to callers.
    pub date_time_type: DateTimeType,
    /// Supplies the per-database page codec; absent means identity.
    pub codec_provider: Option<Box<dyn CodecProvider>>,
}

impl Default for OpenOptions {
    fn default() -> Self {
        OpenOptions {
            read_only: false,
            auto_sync: false,
            charset: None,
            time_zone: None,
            date_time_type: DateTimeType::Legacy,
            codec_provider: None,
        }
    }
}

/// Options recognized when creating a database.
pub struct CreateOptions {
    pub file_format: FileFormat,
    pub sort_order: SortOrder,
    pub auto_sync: bool,
    pub charset: Option<Charset>,
    pub time_zone: Option<FixedOffset>,
    pub date_time_type: DateTimeType,
    pub codec_provider: Option<Box<dyn CodecProvider>>,
}

impl Default for CreateOptions {
    fn default() -> Self {
        CreateOptions {
            file_format: FileFormat::V4,
            sort_order: SortOrder::Legacy,
            auto_sync: false,
            charset: None,
            time_zone: None,
            date_time_type: DateTimeType::Legacy,
            codec_provider: None,
        }
    }
}

pub struct Database {
    channel: Rc<RefCell<PageChannel>>,
    format: Rc<Format>,
    charset: Charset,
    sort_order: SortOrder,
    date_time_type: DateTimeType,
    time_zone: Option<FixedOffset>,
    catalog_page: PageNum,
    change_counter: u32,
    closed: bool,
}

impl Database {
    /// Creates a database file at `path`.
    pub fn create(path: &Path, options: CreateOptions) -> Result<Database> {
        let channel = FileChannel::create(path)?;
        Self::create_channel(Box::new(channel), options)
    }

    /// Creates a database on a pre-opened channel (e.g. an in-memory one).
    /// The channel is not closed by this handle.
    pub fn create_channel(
        channel: Box<dyn ByteChannel>,
        options: CreateOptions,
    ) -> Result<Database> {
        let format = Rc::new(Format::for_file_format(options.file_format));
        let codec: Box<dyn crate::codec::PageCodec> = match &options.codec_provider {
            Some(provider) => provider.create_codec(&format)?,
            None => Box::new(IdentityCodec),
        };
        let page_channel = Rc::new(RefCell::new(PageChannel::new(
            channel,
            codec,
            &format,
            options.auto_sync,
        )));
        let charset = options.charset.unwrap_or(format.default_charset);

        {
            let mut ch = page_channel.borrow_mut();
            ch.start_write();
            let header_page = ch.allocate_new_page()?;
            debug_assert_eq!(header_page, 0);
            let mut page = ch.create_page_buffer();
            format::write_header(
                &format,
                &mut page,
                &DbHeader {
                    page_count: 1,
                    catalog_page: INVALID_PAGE_NUMBER,
                    sort_order: options.sort_order,
                    change_counter: 0,
                },
            )?;
            ch.write_page(&page, header_page)?;
            ch.finish_write()?;
        }

        // Bootstrap the catalog table, then point the header at it.
        let catalog = Table::create(
            Rc::clone(&page_channel),
            Rc::clone(&format),
            charset,
            options.sort_order,
            options.date_time_type,
            options.time_zone,
            CATALOG_TABLE_NAME,
            vec![
                ColumnSpec::new(CATALOG_COL_NAME, DataType::Text).with_max_length(256),
                ColumnSpec::new(CATALOG_COL_DEF_PAGE, DataType::Long),
            ],
            Vec::new(),
        )?;
        let catalog_page = catalog.definition_page();
        drop(catalog);

        let mut db = Database {
            channel: page_channel,
            format,
            charset,
            sort_order: options.sort_order,
            date_time_type: options.date_time_type,
            time_zone: options.time_zone,
            catalog_page,
            change_counter: 0,
            closed: false,
        };
        db.write_header()?;
        debug!("created database, catalog at page {}", catalog_page);
        Ok(db)
    }

    /// Opens a database file at `path`.
    pub fn open(path: &Path, options: OpenOptions) -> Result<Database> {
        let channel = FileChannel::open(path, !options.read_only)?;
        let channel: Box<dyn ByteChannel> = if options.read_only {
            Box::new(ReadOnlyChannel::new(
                Box::new(channel) as Box<dyn ByteChannel>
            ))
        } else {
            Box::new(channel)
        };
        Self::open_channel(channel, options)
    }

    /// Opens a database over a pre-opened channel. The channel is not
    /// closed by this handle.
    pub fn open_channel(
        mut channel: Box<dyn ByteChannel>,
        options: OpenOptions,
    ) -> Result<Database> {
        // The format block at the head of the header page is stored
        // outside the codec, so the version byte is readable before the
        // codec exists.
        let mut head = [0_u8; 32];
        channel.read(0, &mut head)?;
        let version = format::read_version_byte(&head)?;
        let format = Rc::new(Format::from_version_byte(version)?);
        let codec: Box<dyn crate::codec::PageCodec> = match &options.codec_provider {
            Some(provider) => provider.create_codec(&format)?,
            None => Box::new(IdentityCodec),
        };
        let page_channel = Rc::new(RefCell::new(PageChannel::new(
            channel,
            codec,
            &format,
            options.auto_sync,
        )));

        let header = {
            let mut ch = page_channel.borrow_mut();
            let mut page = ch.create_page_buffer();
            ch.read_page(&mut page, 0)?;
            format::read_header(&format, &page)?
        };
        if header.catalog_page == INVALID_PAGE_NUMBER {
            return Err(Error::MalformedPage {
                page_number: 0,
                reason: String::from("header has no catalog page"),
            });
        }
        let charset = options.charset.unwrap_or(format.default_charset);
        Ok(Database {
            channel: page_channel,
            format,
            charset,
            sort_order: header.sort_order,
            date_time_type: options.date_time_type,
            time_zone: options.time_zone,
            catalog_page: header.catalog_page,
            change_counter: header.change_counter,
            closed: false,
        })
    }

    /// Loads a database image into a fresh in-memory channel and opens it;
    /// the backing file is untouched afterwards.
    pub fn open_bytes(data: &[u8], options: OpenOptions) -> Result<Database> {
        Self::open_channel(Box::new(MemoryChannel::from_bytes(data)), options)
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        Ok(())
    }

    pub fn file_format(&self) -> FileFormat {
        self.format.file_format
    }

    pub fn charset(&self) -> Charset {
        self.charset
    }

    pub fn sort_order(&self) -> SortOrder {
        self.sort_order
    }

    fn catalog(&self) -> Result<Table> {
        Table::open(
            Rc::clone(&self.channel),
            Rc::clone(&self.format),
            self.charset,
            self.sort_order,
            self.date_time_type,
            self.time_zone,
            self.catalog_page,
        )
    }

    /// Names of all user tables, in catalog order.
    pub fn table_names(&self) -> Result<Vec<String>> {
        self.check_open()?;
        let catalog = self.catalog()?;
        let mut names = Vec::new();
        let mut cursor = catalog.row_cursor();
        while let Some((_, row)) = catalog.next_row(&mut cursor)? {
            if let Some(Value::Text(name)) = row.get(CATALOG_COL_NAME) {
                names.push(name.clone());
            }
        }
        Ok(names)
    }

    /// Creates a table and registers it in the catalog.
    pub fn create_table(
        &mut self,
        name: &str,
        columns: Vec<ColumnSpec>,
        indexes: Vec<IndexSpec>,
    ) -> Result<Table> {
        self.check_open()?;
        if name.eq_ignore_ascii_case(CATALOG_TABLE_NAME)
            || self
                .table_names()?
                .iter()
                .any(|n| n.eq_ignore_ascii_case(name))
        {
            return Err(Error::DuplicateName(String::from(name)));
        }
        let table = Table::create(
            Rc::clone(&self.channel),
            Rc::clone(&self.format),
            self.charset,
            self.sort_order,
            self.date_time_type,
            self.time_zone,
            name,
            columns,
            indexes,
        )?;
        let mut catalog = self.catalog()?;
        catalog.add_row(
            &Row::new()
                .with(CATALOG_COL_NAME, Value::Text(String::from(name)))
                .with(CATALOG_COL_DEF_PAGE, Value::Long(table.definition_page())),
        )?;
        self.change_counter += 1;
        self.write_header()?;
        Ok(table)
    }

    /// Opens a table by name.
    pub fn open_table(&self, name: &str) -> Result<Table> {
        self.check_open()?;
        let catalog = self.catalog()?;
        let mut cursor = catalog.row_cursor();
        while let Some((_, row)) = catalog.next_row(&mut cursor)? {
            let matches = matches!(
                row.get(CATALOG_COL_NAME),
                Some(Value::Text(n)) if n.eq_ignore_ascii_case(name)
            );
            if !matches {
                continue;
            }
            let def_page = match row.get(CATALOG_COL_DEF_PAGE) {
                Some(Value::Long(p)) => *p,
                _ => {
                    return Err(Error::MalformedPage {
                        page_number: self.catalog_page,
                        reason: format!("catalog row for {:?} has no definition page", name),
                    })
                }
            };
            return Table::open(
                Rc::clone(&self.channel),
                Rc::clone(&self.format),
                self.charset,
                self.sort_order,
                self.date_time_type,
                self.time_zone,
                def_page,
            );
        }
        Err(Error::Schema(format!("table {:?} not found", name)))
    }

    fn write_header(&mut self) -> Result<()> {
        let mut ch = self.channel.borrow_mut();
        let mut page = ch.create_page_buffer();
        ch.read_page(&mut page, 0)?;
        format::write_header(
            &self.format,
            &mut page,
            &DbHeader {
                page_count: ch.page_count()?,
                catalog_page: self.catalog_page,
                sort_order: self.sort_order,
                change_counter: self.change_counter,
            },
        )?;
        ch.write_page(&page, 0)
    }

    /// Forces everything to the backing store.
    pub fn flush(&mut self) -> Result<()> {
        self.check_open()?;
        self.channel.borrow_mut().flush()
    }

    /// Flushes and marks the handle closed. A second close is an error.
    pub fn close(&mut self) -> Result<()> {
        self.check_open()?;
        self.change_counter += 1;
        if !self.channel.borrow().is_read_only() {
            self.write_header()?;
        }
        self.channel.borrow_mut().flush()?;
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::byte_channel::ByteChannel;

    fn mem_db() -> Database {
        Database::create_channel(
            Box::new(MemoryChannel::new()),
            CreateOptions::default(),
        )
        .expect("Should have created database.")
    }

    #[test]
    fn test_create_and_list_tables() {
        let mut db = mem_db();
        assert!(db.table_names().unwrap().is_empty());
        db.create_table(
            "t1",
            vec![ColumnSpec::new("a", DataType::Long)],
            Vec::new(),
        )
        .unwrap();
        db.create_table(
            "t2",
            vec![ColumnSpec::new("a", DataType::Long)],
            Vec::new(),
        )
        .unwrap();
        assert_eq!(db.table_names().unwrap(), vec!["t1", "t2"]);
    }

    #[test]
    fn test_duplicate_table_name_rejected() {
        let mut db = mem_db();
        db.create_table("t", vec![ColumnSpec::new("a", DataType::Long)], Vec::new())
            .unwrap();
        assert!(matches!(
            db.create_table("T", vec![ColumnSpec::new("a", DataType::Long)], Vec::new()),
            Err(Error::DuplicateName(_))
        ));
        assert!(matches!(
            db.create_table(
                CATALOG_TABLE_NAME,
                vec![ColumnSpec::new("a", DataType::Long)],
                Vec::new()
            ),
            Err(Error::DuplicateName(_))
        ));
    }

    #[test]
    fn test_open_missing_table_errors() {
        let db = mem_db();
        assert!(matches!(db.open_table("nope"), Err(Error::Schema(_))));
    }

    #[test]
    fn test_double_close_is_state_error() {
        let mut db = mem_db();
        db.close().unwrap();
        assert!(matches!(db.close(), Err(Error::Closed)));
        assert!(matches!(db.table_names(), Err(Error::Closed)));
    }

    #[test]
    fn test_reopen_via_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("round.db");
        {
            let mut db = Database::create(&path, CreateOptions::default()).unwrap();
            let mut t = db
                .create_table(
                    "numbers",
                    vec![ColumnSpec::new("n", DataType::Long)],
                    Vec::new(),
                )
                .unwrap();
            for i in 0..5 {
                t.add_row(&Row::new().with("n", Value::Long(i))).unwrap();
            }
            db.close().unwrap();
        }
        let db = Database::open(&path, OpenOptions::default()).unwrap();
        let t = db.open_table("numbers").unwrap();
        assert_eq!(t.get_row_count(), 5);
        let mut got = Vec::new();
        let mut cursor = t.row_cursor();
        while let Some((_, row)) = t.next_row(&mut cursor).unwrap() {
            got.push(*row.get("n").unwrap().as_long().unwrap());
        }
        assert_eq!(got, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_read_only_open_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ro.db");
        {
            let mut db = Database::create(&path, CreateOptions::default()).unwrap();
            db.create_table("t", vec![ColumnSpec::new("a", DataType::Long)], Vec::new())
                .unwrap();
            db.close().unwrap();
        }
        let db = Database::open(
            &path,
            OpenOptions {
                read_only: true,
                ..OpenOptions::default()
            },
        )
        .unwrap();
        let mut t = db.open_table("t").unwrap();
        assert!(matches!(
            t.add_row(&Row::new().with("a", Value::Long(1))),
            Err(Error::ReadOnly)
        ));
    }

    #[test]
    fn test_unrecognized_version_byte() {
        let mut raw = MemoryChannel::new();
        let format = Format::for_file_format(FileFormat::V4);
        let mut page = vec![0_u8; format.page_size];
        format::write_header(
            &format,
            &mut page,
            &DbHeader {
                page_count: 1,
                catalog_page: 1,
                sort_order: SortOrder::Legacy,
                change_counter: 0,
            },
        )
        .unwrap();
        page[1] = 0x66;
        raw.write(0, &page).unwrap();
        assert!(matches!(
            Database::open_channel(Box::new(raw), OpenOptions::default()),
            Err(Error::UnrecognizedFormatVersion(0x66))
        ));
    }
}
