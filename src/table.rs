//! Tables: the thin layer binding the row codec, usage maps, long-value
//! store and indexes behind one definition page.
//!
//! Table definition page layout:
//! Offset  Size  Description
//! 0       1     page type (0x02)
//! 1       1     unused
//! 2       4     next definition page (-1; single page in this version)
//! 6       4     logical row count
//! 10      4     next auto-number value
//! 14      2     column count
//! 16      2     index-data count
//! 18      2     logical index count
//! 20      69    owned-pages usage map declaration (reference variant)
//! 89      69    free-space usage map declaration (inline variant)
//! 158     ..    column defs, index-data defs, logical index defs, name

use byteorder::{ByteOrder, LittleEndian};
use chrono::{Duration, FixedOffset};
use log::debug;
use std::cell::RefCell;
use std::rc::Rc;
use streaming_iterator::StreamingIterator;

use crate::column::Column;
use crate::data_type::DataType;
use crate::error::{Error, Result};
use crate::format::{page_types, Charset, Format, SortOrder};
use crate::index::cursor::EntryCursor;
use crate::index::data::IndexData;
use crate::index::entry::{self, Entry, IndexColumn};
use crate::index::{Index, IndexType};
use crate::long_value;
use crate::page_channel::{PageChannel, PageNum, INVALID_PAGE_NUMBER};
use crate::record;
use crate::rowid::RowId;
use crate::usage_map::{PageCursor, UsageMap};
use crate::value::{DateTimeType, Value};

const OFFSET_NEXT_DEF_PAGE: usize = 2;
const OFFSET_ROW_COUNT: usize = 6;
const OFFSET_NEXT_AUTO_NUMBER: usize = 10;
const OFFSET_COLUMN_COUNT: usize = 14;
const OFFSET_INDEX_DATA_COUNT: usize = 16;
const OFFSET_LOGICAL_INDEX_COUNT: usize = 18;
const OFFSET_OWNED_MAP_DECL: usize = 20;
const OFFSET_FREE_MAP_DECL: usize = 89;
const OFFSET_DEFS: usize = 158;

/// A data page leaves the free-space map once its slack drops below this.
const FREE_SPACE_THRESHOLD: usize = 32;

/// One row as the host sees it: column name to value, in insertion order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row(pub Vec<(String, Value)>);

impl Row {
    pub fn new() -> Row {
        Row(Vec::new())
    }

    pub fn with(mut self, name: &str, value: Value) -> Row {
        self.0.push((String::from(name), value));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }
}

/// Column description at table-create time.
#[derive(Debug, Clone)]
pub struct ColumnSpec {
    pub name: String,
    pub data_type: DataType,
    pub max_length: Option<u16>,
    pub auto_number: bool,
    pub scale: u8,
    pub precision: u8,
}

impl ColumnSpec {
    pub fn new(name: &str, data_type: DataType) -> ColumnSpec {
        ColumnSpec {
            name: String::from(name),
            data_type,
            max_length: None,
            auto_number: false,
            scale: 0,
            precision: 0,
        }
    }

    pub fn with_max_length(mut self, max_length: u16) -> ColumnSpec {
        self.max_length = Some(max_length);
        self
    }
}

/// Index description at table-create time.
#[derive(Debug, Clone)]
pub struct IndexSpec {
    pub name: String,
    pub index_type: IndexType,
    pub unique: bool,
    pub ignore_nulls: bool,
    /// (column name, descending) pairs in key order.
    pub columns: Vec<(String, bool)>,
}

/// Hook that may replace a failed column decode with a substitute value.
pub type ColumnErrorHandler = Box<dyn Fn(&Column, &Error) -> Option<Value>>;

pub struct Table {
    channel: Rc<RefCell<PageChannel>>,
    format: Rc<Format>,
    charset: Charset,
    sort_order: SortOrder,
    date_time_type: DateTimeType,
    time_zone: Option<FixedOffset>,
    name: String,
    def_page: PageNum,
    columns: Vec<Column>,
    row_count: u32,
    next_auto_number: u32,
    owned_pages: UsageMap,
    free_space_pages: UsageMap,
    index_datas: Vec<IndexData>,
    indexes: Vec<Index>,
    error_handler: Option<ColumnErrorHandler>,
}

impl Table {
    /// Creates a table: writes its definition page, bootstraps both usage
    /// maps and one root page per index data.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        channel: Rc<RefCell<PageChannel>>,
        format: Rc<Format>,
        charset: Charset,
        sort_order: SortOrder,
        date_time_type: DateTimeType,
        time_zone: Option<FixedOffset>,
        name: &str,
        column_specs: Vec<ColumnSpec>,
        index_specs: Vec<IndexSpec>,
    ) -> Result<Table> {
        Column::validate_name(&format, name)?;
        if column_specs.len() > format.max_columns_per_table {
            return Err(Error::TooManyColumns {
                max: format.max_columns_per_table,
            });
        }
        if column_specs.is_empty() {
            return Err(Error::Schema(format!("table {:?} has no columns", name)));
        }
        let mut columns = Vec::with_capacity(column_specs.len());
        for (i, spec) in column_specs.iter().enumerate() {
            Column::validate_name(&format, &spec.name)?;
            if columns
                .iter()
                .any(|c: &Column| c.name.eq_ignore_ascii_case(&spec.name))
            {
                return Err(Error::DuplicateName(spec.name.clone()));
            }
            if spec.auto_number && spec.data_type != DataType::Long {
                return Err(Error::UnsupportedType(spec.data_type));
            }
            let max_length = match spec.max_length {
                Some(m) => m,
                None => spec.data_type.variable_widths().map(|(d, _)| d).unwrap_or(0),
            };
            columns.push(Column {
                name: spec.name.clone(),
                column_number: i as u16,
                data_type: spec.data_type,
                fixed_offset: 0,
                max_length,
                auto_number: spec.auto_number,
                scale: spec.scale,
                precision: spec.precision,
                sort_order: sort_order.to_disk_byte(),
            });
        }
        record::assign_fixed_offsets(&mut columns);

        let def_page;
        let owned_pages;
        let free_space_pages;
        let mut index_datas: Vec<IndexData> = Vec::new();
        let mut indexes: Vec<Index> = Vec::new();
        {
            let mut ch = channel.borrow_mut();
            ch.start_write();
            let built = Self::write_new_definition(
                &mut ch,
                &format,
                sort_order,
                name,
                &columns,
                &index_specs,
                &mut index_datas,
                &mut indexes,
            );
            ch.finish_write()?;
            let (dp, om, fm) = built?;
            def_page = dp;
            owned_pages = om;
            free_space_pages = fm;
        }

        Ok(Table {
            channel,
            format,
            charset,
            sort_order,
            date_time_type,
            time_zone,
            name: String::from(name),
            def_page,
            columns,
            row_count: 0,
            next_auto_number: 1,
            owned_pages,
            free_space_pages,
            index_datas,
            indexes,
            error_handler: None,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn write_new_definition(
        ch: &mut PageChannel,
        format: &Format,
        sort_order: SortOrder,
        name: &str,
        columns: &[Column],
        index_specs: &[IndexSpec],
        index_datas: &mut Vec<IndexData>,
        indexes: &mut Vec<Index>,
    ) -> Result<(PageNum, UsageMap, UsageMap)> {
        let def_page = ch.allocate_new_page()?;
        debug!("creating table {:?} at definition page {}", name, def_page);

        // Index specs sharing a column list (and flags) share one tree.
        for (i, spec) in index_specs.iter().enumerate() {
            if indexes
                .iter()
                .any(|x| x.name.eq_ignore_ascii_case(&spec.name))
            {
                return Err(Error::DuplicateName(spec.name.clone()));
            }
            let mut ics = Vec::with_capacity(spec.columns.len());
            for (col_name, descending) in &spec.columns {
                let col = columns
                    .iter()
                    .find(|c| c.name.eq_ignore_ascii_case(col_name))
                    .ok_or_else(|| {
                        Error::Schema(format!(
                            "index {:?} names unknown column {:?}",
                            spec.name, col_name
                        ))
                    })?;
                if col.data_type.is_long_value() {
                    return Err(Error::UnsupportedType(col.data_type));
                }
                ics.push(IndexColumn {
                    column_number: col.column_number,
                    descending: *descending,
                });
            }
            let existing = index_datas.iter().position(|d| {
                d.columns == ics && d.unique == spec.unique && d.ignore_nulls == spec.ignore_nulls
            });
            let data_number = match existing {
                Some(n) => n as u16,
                None => {
                    let root = IndexData::create_root(ch, format)?;
                    index_datas.push(IndexData::new(
                        index_datas.len() as u16,
                        root,
                        spec.unique,
                        spec.ignore_nulls,
                        ics,
                        sort_order,
                    ));
                    (index_datas.len() - 1) as u16
                }
            };
            indexes.push(Index {
                name: spec.name.clone(),
                index_number: i as u16,
                index_type: spec.index_type,
                index_data_number: data_number,
            });
        }

        let mut page = ch.create_page_buffer();
        page[0] = page_types::TABLE_DEF;
        LittleEndian::write_i32(&mut page[OFFSET_NEXT_DEF_PAGE..], INVALID_PAGE_NUMBER);
        LittleEndian::write_u32(&mut page[OFFSET_ROW_COUNT..], 0);
        LittleEndian::write_u32(&mut page[OFFSET_NEXT_AUTO_NUMBER..], 1);
        LittleEndian::write_u16(&mut page[OFFSET_COLUMN_COUNT..], columns.len() as u16);
        LittleEndian::write_u16(&mut page[OFFSET_INDEX_DATA_COUNT..], index_datas.len() as u16);
        LittleEndian::write_u16(&mut page[OFFSET_LOGICAL_INDEX_COUNT..], indexes.len() as u16);
        let mut defs = Vec::new();
        for col in columns {
            col.write_def(&mut defs)?;
        }
        for data in index_datas.iter() {
            data.write_def(&mut defs);
        }
        for index in indexes.iter() {
            defs.push(index.index_type.to_disk_byte());
            defs.extend_from_slice(&index.index_data_number.to_le_bytes());
            defs.extend_from_slice(&(index.name.len() as u16).to_le_bytes());
            defs.extend_from_slice(index.name.as_bytes());
        }
        defs.extend_from_slice(&(name.len() as u16).to_le_bytes());
        defs.extend_from_slice(name.as_bytes());
        if OFFSET_DEFS + defs.len() > format.page_size {
            return Err(Error::Schema(format!(
                "table {:?} definitions do not fit one page",
                name
            )));
        }
        page[OFFSET_DEFS..OFFSET_DEFS + defs.len()].copy_from_slice(&defs);
        ch.write_page(&page, def_page)?;

        // The usage maps patch their declarations into the page just
        // written, then register the table's bootstrap pages.
        let mut owned_pages =
            UsageMap::create_reference(ch, format, def_page, OFFSET_OWNED_MAP_DECL)?;
        let free_space_pages =
            UsageMap::create_inline(ch, format, def_page, OFFSET_FREE_MAP_DECL, 0)?;
        owned_pages.add_page_number(ch, format, def_page)?;
        for data in index_datas.iter() {
            owned_pages.add_page_number(ch, format, data.root_page)?;
        }
        Ok((def_page, owned_pages, free_space_pages))
    }

    /// Opens a table from its definition page.
    pub fn open(
        channel: Rc<RefCell<PageChannel>>,
        format: Rc<Format>,
        charset: Charset,
        sort_order: SortOrder,
        date_time_type: DateTimeType,
        time_zone: Option<FixedOffset>,
        def_page: PageNum,
    ) -> Result<Table> {
        let mut ch = channel.borrow_mut();
        let mut page = ch.create_page_buffer();
        ch.read_page(&mut page, def_page)?;
        if page[0] != page_types::TABLE_DEF {
            return Err(Error::UnrecognizedPageType {
                page_number: def_page,
                type_byte: page[0],
            });
        }
        let row_count = LittleEndian::read_u32(&page[OFFSET_ROW_COUNT..]);
        let next_auto_number = LittleEndian::read_u32(&page[OFFSET_NEXT_AUTO_NUMBER..]);
        let column_count = LittleEndian::read_u16(&page[OFFSET_COLUMN_COUNT..]) as usize;
        let index_data_count = LittleEndian::read_u16(&page[OFFSET_INDEX_DATA_COUNT..]) as usize;
        let logical_count = LittleEndian::read_u16(&page[OFFSET_LOGICAL_INDEX_COUNT..]) as usize;

        let mut pos = OFFSET_DEFS;
        let mut columns = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            let (col, used) = Column::read_def(&page[pos..])?;
            columns.push(col);
            pos += used;
        }
        let mut index_datas = Vec::with_capacity(index_data_count);
        for n in 0..index_data_count {
            let (data, used) = IndexData::read_def(&page[pos..], n as u16, sort_order)?;
            index_datas.push(data);
            pos += used;
        }
        let truncated = |what: &str| Error::MalformedPage {
            page_number: def_page,
            reason: format!("{} runs past the definition page", what),
        };
        let mut indexes = Vec::with_capacity(logical_count);
        for i in 0..logical_count {
            if pos + 5 > page.len() {
                return Err(truncated("index definition"));
            }
            let index_type = IndexType::from_disk_byte(page[pos])?;
            let data_number = LittleEndian::read_u16(&page[pos + 1..]);
            let name_len = LittleEndian::read_u16(&page[pos + 3..]) as usize;
            pos += 5;
            if pos + name_len > page.len() {
                return Err(truncated("index name"));
            }
            let name =
                String::from_utf8(page[pos..pos + name_len].to_vec()).map_err(|_| {
                    Error::MalformedPage {
                        page_number: def_page,
                        reason: String::from("index name is not UTF-8"),
                    }
                })?;
            pos += name_len;
            indexes.push(Index {
                name,
                index_number: i as u16,
                index_type,
                index_data_number: data_number,
            });
        }
        if pos + 2 > page.len() {
            return Err(truncated("table name"));
        }
        let name_len = LittleEndian::read_u16(&page[pos..]) as usize;
        pos += 2;
        if pos + name_len > page.len() {
            return Err(truncated("table name"));
        }
        let name = String::from_utf8(page[pos..pos + name_len].to_vec()).map_err(|_| {
            Error::MalformedPage {
                page_number: def_page,
                reason: String::from("table name is not UTF-8"),
            }
        })?;

        let owned_pages = UsageMap::open(&mut ch, &format, def_page, OFFSET_OWNED_MAP_DECL)?;
        let free_space_pages = UsageMap::open(&mut ch, &format, def_page, OFFSET_FREE_MAP_DECL)?;
        drop(ch);

        Ok(Table {
            channel,
            format,
            charset,
            sort_order,
            date_time_type,
            time_zone,
            name,
            def_page,
            columns,
            row_count,
            next_auto_number,
            owned_pages,
            free_space_pages,
            index_datas,
            indexes,
            error_handler: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn definition_page(&self) -> PageNum {
        self.def_page
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn get_row_count(&self) -> u32 {
        self.row_count
    }

    pub fn sort_order(&self) -> SortOrder {
        self.sort_order
    }

    pub fn indexes(&self) -> &[Index] {
        &self.indexes
    }

    pub fn index(&self, name: &str) -> Option<&Index> {
        self.indexes
            .iter()
            .find(|i| i.name.eq_ignore_ascii_case(name))
    }

    /// The physical tree behind a logical index.
    pub fn index_data_mut(&mut self, index_data_number: u16) -> Option<&mut IndexData> {
        self.index_datas.get_mut(index_data_number as usize)
    }

    pub fn owned_pages(&self) -> &UsageMap {
        &self.owned_pages
    }

    pub fn free_space_pages(&self) -> &UsageMap {
        &self.free_space_pages
    }

    /// Installs the column-read error handler; `None` restores the
    /// default (propagate).
    pub fn set_error_handler(&mut self, handler: Option<ColumnErrorHandler>) {
        self.error_handler = handler;
    }

    pub(crate) fn channel(&self) -> Rc<RefCell<PageChannel>> {
        Rc::clone(&self.channel)
    }

    /// Builds the index key prefix for a host row against a logical
    /// index; absent when the row misses an indexed column.
    pub fn key_prefix_for(&self, index_name: &str, row: &Row) -> Result<Option<Vec<u8>>> {
        let index = self
            .index(index_name)
            .ok_or_else(|| Error::Schema(format!("no index named {:?}", index_name)))?;
        let data = &self.index_datas[index.index_data_number as usize];
        let projected = entry::construct_index_row(&self.columns, &data.columns, &row.0);
        if projected.is_none() {
            return Ok(None);
        }
        // Re-align projected values with the table for entry encoding.
        let mut values = vec![Value::Null; self.columns.len()];
        for (ic, v) in data.columns.iter().zip(projected.unwrap()) {
            values[ic.column_number as usize] = v;
        }
        let (bytes, _) = entry::encode_entry(
            &self.columns,
            &data.columns,
            &values,
            data.sort_order(),
            RowId::FIRST,
        )?;
        Ok(Some(bytes[..bytes.len() - crate::rowid::ROW_ID_SIZE].to_vec()))
    }

    /// Aligns a host row with the table's columns; fills auto-numbers.
    fn align_values(&mut self, row: &Row) -> Result<Vec<Value>> {
        for (name, _) in &row.0 {
            if !self
                .columns
                .iter()
                .any(|c| c.name.eq_ignore_ascii_case(name))
            {
                return Err(Error::Schema(format!(
                    "table {:?} has no column named {:?}",
                    self.name, name
                )));
            }
        }
        let mut values = Vec::with_capacity(self.columns.len());
        for col in &self.columns {
            let supplied = row.get(&col.name).cloned();
            let value = match supplied {
                Some(v) => v,
                None if col.auto_number => {
                    let v = Value::Long(self.next_auto_number as i32);
                    self.next_auto_number += 1;
                    v
                }
                None => Value::Null,
            };
            let value = match (&value, self.time_zone) {
                (Value::Timestamp(ts), Some(tz)) => {
                    Value::Timestamp(*ts - Duration::seconds(tz.local_minus_utc() as i64))
                }
                _ => value,
            };
            values.push(value);
        }
        Ok(values)
    }

    /// Replaces long-value columns' contents with var-slot bytes, writing
    /// page chains as needed. Returns the pages allocated.
    fn store_long_values(
        &mut self,
        ch: &mut PageChannel,
        values: &mut [Value],
    ) -> Result<Vec<PageNum>> {
        let mut allocated = Vec::new();
        for col in &self.columns {
            if !col.is_long_value() {
                continue;
            }
            let idx = col.column_number as usize;
            let content = match (&values[idx], col.data_type) {
                (Value::Null, _) => continue,
                (Value::Text(s), DataType::Memo) => crate::value::encode_text(s, self.charset)?,
                (Value::Binary(b), DataType::OleBlob) => b.clone(),
                (v, dt) => {
                    return Err(Error::Schema(format!(
                        "value {:?} does not fit column {:?} of type {}",
                        v, col.name, dt
                    )))
                }
            };
            let (slot, pages) = long_value::write_long_value(ch, &self.format, &content)?;
            allocated.extend_from_slice(&pages);
            values[idx] = Value::Binary(slot);
        }
        Ok(allocated)
    }

    /// Uniqueness probe across all unique trees, before anything is
    /// written. `exclude` skips the check when the key equals that row's
    /// current key (updates re-keying onto themselves).
    fn check_unique(
        &mut self,
        ch: &mut PageChannel,
        values: &[Value],
        exclude: Option<&[Value]>,
    ) -> Result<()> {
        for d in 0..self.index_datas.len() {
            let data = &mut self.index_datas[d];
            if !data.unique {
                continue;
            }
            let (bytes, all_null) = entry::encode_entry(
                &self.columns,
                &data.columns,
                values,
                data.sort_order(),
                RowId::FIRST,
            )?;
            if all_null {
                continue;
            }
            let prefix = &bytes[..bytes.len() - crate::rowid::ROW_ID_SIZE];
            if let Some(old_values) = exclude {
                let (old_bytes, _) = entry::encode_entry(
                    &self.columns,
                    &data.columns,
                    old_values,
                    data.sort_order(),
                    RowId::FIRST,
                )?;
                if &old_bytes[..old_bytes.len() - crate::rowid::ROW_ID_SIZE] == prefix {
                    continue;
                }
            }
            if data.prefix_exists(ch, &self.format, prefix)? {
                let data_number = data.index_data_number;
                let name = self
                    .indexes
                    .iter()
                    .find(|i| i.index_data_number == data_number)
                    .map(|i| i.name.clone())
                    .unwrap_or_else(|| format!("index data #{}", data_number));
                return Err(Error::DuplicateKey { index_name: name });
            }
        }
        Ok(())
    }

    /// Finds a data page with at least `needed` free bytes, or allocates
    /// one (registering it with both usage maps).
    fn find_target_page(&mut self, ch: &mut PageChannel, needed: usize) -> Result<PageNum> {
        let mut cursor = self.free_space_pages.cursor();
        let mut candidates = Vec::new();
        while let Some(pn) = self.free_space_pages.next_page(&mut cursor) {
            candidates.push(pn);
        }
        let mut buf = ch.create_page_buffer();
        for pn in candidates {
            // The inline free map can advance its window and claim pages
            // that are not this table's data pages; verify before use.
            if !self.owned_pages.contains(pn) {
                continue;
            }
            ch.read_page(&mut buf, pn)?;
            if buf[0] != page_types::DATA {
                continue;
            }
            if record::free_space_on_page(&self.format, &buf, pn)? >= needed {
                return Ok(pn);
            }
        }
        let pn = ch.allocate_new_page()?;
        let mut page = ch.create_page_buffer();
        record::init_data_page(&self.format, &mut page, self.def_page);
        ch.write_page(&page, pn)?;
        self.owned_pages.add_page_number(ch, &self.format, pn)?;
        self.free_space_pages.add_page_number(ch, &self.format, pn)?;
        debug!("table {:?} grew a data page at {}", self.name, pn);
        Ok(pn)
    }

    fn persist_counters(&mut self, ch: &mut PageChannel) -> Result<()> {
        let mut page = ch.create_page_buffer();
        ch.read_page(&mut page, self.def_page)?;
        LittleEndian::write_u32(&mut page[OFFSET_ROW_COUNT..], self.row_count);
        LittleEndian::write_u32(&mut page[OFFSET_NEXT_AUTO_NUMBER..], self.next_auto_number);
        ch.write_page(&page, self.def_page)
    }

    /// Inserts a row and returns its RowId.
    pub fn add_row(&mut self, row: &Row) -> Result<RowId> {
        let channel = self.channel();
        let mut ch = channel.borrow_mut();
        ch.start_write();
        let result = self.add_row_locked(&mut ch, row);
        ch.finish_write()?;
        result
    }

    fn add_row_locked(&mut self, ch: &mut PageChannel, row: &Row) -> Result<RowId> {
        let mut values = self.align_values(row)?;
        // Uniqueness fails before any page is dirtied.
        self.check_unique(ch, &values, None)?;
        let lv_pages = self.store_long_values(ch, &mut values)?;
        let image =
            record::serialize_row(&self.format, &self.columns, &values, self.charset, None)?;

        let pn = self.find_target_page(ch, image.len())?;
        let mut page = ch.create_page_buffer();
        ch.read_page(&mut page, pn)?;
        let row_number = record::add_row_to_page(&self.format, &mut page, pn, &image)?;
        ch.write_page(&page, pn)?;
        if record::free_space_on_page(&self.format, &page, pn)? < FREE_SPACE_THRESHOLD {
            self.free_space_pages
                .remove_page_number(ch, &self.format, pn)?;
        }
        for lv_page in lv_pages {
            self.owned_pages.add_page_number(ch, &self.format, lv_page)?;
        }
        let row_id = RowId::new(pn, row_number as i32);
        for data in self.index_datas.iter_mut() {
            data.add_row(ch, &self.format, &self.columns, &values, row_id)?;
        }
        self.row_count += 1;
        self.persist_counters(ch)?;
        Ok(row_id)
    }

    /// Raw stored values for a live row, following pointer rows.
    fn read_values(&self, ch: &mut PageChannel, row_id: RowId) -> Result<(RowId, Vec<Value>)> {
        if !row_id.is_valid() {
            return Err(Error::DanglingRowId {
                page_number: row_id.page_number,
                row_number: row_id.row_number,
            });
        }
        let mut current = row_id;
        let mut page = ch.create_page_buffer();
        loop {
            ch.read_page(&mut page, current.page_number)?;
            let slice = record::find_row(
                &self.format,
                &page,
                current.page_number,
                current.row_number as u16,
            )?;
            if slice.deleted {
                return Err(Error::DanglingRowId {
                    page_number: current.page_number,
                    row_number: current.row_number,
                });
            }
            if slice.pointer {
                current = record::read_pointer_row(&page, &slice)?;
                continue;
            }
            let handler = self.error_handler.as_ref();
            let values = record::read_row_with(
                &self.format,
                &self.columns,
                &page[slice.start..slice.end],
                self.charset,
                self.date_time_type,
                &mut |col, err| match handler.and_then(|h| h(col, &err)) {
                    Some(replacement) => Ok(replacement),
                    None => Err(err),
                },
            )?;
            let values = match self.time_zone {
                None => values,
                Some(tz) => values
                    .into_iter()
                    .map(|v| match v {
                        Value::Timestamp(ts) => Value::Timestamp(
                            ts + Duration::seconds(tz.local_minus_utc() as i64),
                        ),
                        other => other,
                    })
                    .collect(),
            };
            return Ok((current, values));
        }
    }

    /// Resolves long-value slots into host-facing values.
    fn resolve_long_values(&self, ch: &mut PageChannel, values: &mut [Value]) -> Result<()> {
        for col in &self.columns {
            if !col.is_long_value() {
                continue;
            }
            let idx = col.column_number as usize;
            let slot = match &values[idx] {
                Value::Null => continue,
                Value::Binary(slot) => slot.clone(),
                v => {
                    return Err(Error::Invariant(format!(
                        "long-value column {:?} decoded to {:?}",
                        col.name, v
                    )))
                }
            };
            let content = long_value::read_long_value(ch, &self.format, &slot)?;
            values[idx] = match col.data_type {
                DataType::Memo => Value::Text(crate::value::decode_text(&content, self.charset)?),
                _ => Value::Binary(content),
            };
        }
        Ok(())
    }

    fn to_row(&self, values: Vec<Value>) -> Row {
        Row(self
            .columns
            .iter()
            .zip(values)
            .map(|(c, v)| (c.name.clone(), v))
            .collect())
    }

    /// Reads one row by id.
    pub fn get_row(&self, row_id: RowId) -> Result<Row> {
        let channel = self.channel();
        let mut ch = channel.borrow_mut();
        let (_, mut values) = self.read_values(&mut ch, row_id)?;
        self.resolve_long_values(&mut ch, &mut values)?;
        Ok(self.to_row(values))
    }

    /// Logically deletes a row. Space is not reclaimed; the row's
    /// long-value chains move to the free-space map.
    pub fn delete_row(&mut self, row_id: RowId) -> Result<()> {
        let channel = self.channel();
        let mut ch = channel.borrow_mut();
        ch.start_write();
        let result = self.delete_row_locked(&mut ch, row_id);
        ch.finish_write()?;
        result
    }

    fn delete_row_locked(&mut self, ch: &mut PageChannel, row_id: RowId) -> Result<()> {
        let (actual_id, values) = self.read_values(ch, row_id)?;
        // Long-value chains go back to the free pool.
        for col in &self.columns {
            if !col.is_long_value() {
                continue;
            }
            if let Value::Binary(slot) = &values[col.column_number as usize] {
                for pn in long_value::chain_pages(ch, &self.format, slot)? {
                    self.owned_pages.remove_page_number(ch, &self.format, pn)?;
                    self.free_space_pages.add_page_number(ch, &self.format, pn)?;
                }
            }
        }
        let mut page = ch.create_page_buffer();
        ch.read_page(&mut page, actual_id.page_number)?;
        record::mark_row_deleted(
            &self.format,
            &mut page,
            actual_id.page_number,
            actual_id.row_number as u16,
        )?;
        ch.write_page(&page, actual_id.page_number)?;
        for data in self.index_datas.iter_mut() {
            data.delete_row(ch, &self.format, &self.columns, &values, actual_id)?;
        }
        self.row_count -= 1;
        self.persist_counters(ch)?;
        Ok(())
    }

    /// Updates a row: columns present in `row` replace, others keep their
    /// stored value. Returns the row's (possibly new) RowId. A grown row
    /// migrates to another page, leaving a pointer behind; its index
    /// entries are deleted and re-inserted, never half-moved.
    pub fn update_row(&mut self, row_id: RowId, row: &Row) -> Result<RowId> {
        let channel = self.channel();
        let mut ch = channel.borrow_mut();
        ch.start_write();
        let result = self.update_row_locked(&mut ch, row_id, row);
        ch.finish_write()?;
        result
    }

    fn update_row_locked(
        &mut self,
        ch: &mut PageChannel,
        row_id: RowId,
        row: &Row,
    ) -> Result<RowId> {
        for (name, _) in &row.0 {
            if !self
                .columns
                .iter()
                .any(|c| c.name.eq_ignore_ascii_case(name))
            {
                return Err(Error::Schema(format!(
                    "table {:?} has no column named {:?}",
                    self.name, name
                )));
            }
        }
        let (actual_id, old_values) = self.read_values(ch, row_id)?;
        let mut new_values = old_values.clone();
        let mut freed_chains: Vec<PageNum> = Vec::new();
        for col in &self.columns {
            let idx = col.column_number as usize;
            if let Some(v) = row.get(&col.name) {
                if col.is_long_value() {
                    if let Value::Binary(old_slot) = &old_values[idx] {
                        freed_chains.extend(long_value::chain_pages(ch, &self.format, old_slot)?);
                    }
                }
                new_values[idx] = v.clone();
            }
        }
        self.check_unique(ch, &new_values, Some(&old_values))?;
        // Store replacement long values only after the uniqueness gate.
        let mut lv_pages = Vec::new();
        for col in &self.columns {
            let idx = col.column_number as usize;
            if !col.is_long_value() || row.get(&col.name).is_none() {
                continue;
            }
            let content = match (&new_values[idx], col.data_type) {
                (Value::Null, _) => continue,
                (Value::Text(s), DataType::Memo) => crate::value::encode_text(s, self.charset)?,
                (Value::Binary(b), DataType::OleBlob) => b.clone(),
                (v, dt) => {
                    return Err(Error::Schema(format!(
                        "value {:?} does not fit column {:?} of type {}",
                        v, col.name, dt
                    )))
                }
            };
            let (slot, pages) = long_value::write_long_value(ch, &self.format, &content)?;
            lv_pages.extend_from_slice(&pages);
            new_values[idx] = Value::Binary(slot);
        }

        let mut page = ch.create_page_buffer();
        ch.read_page(&mut page, actual_id.page_number)?;
        let slice = record::find_row(
            &self.format,
            &page,
            actual_id.page_number,
            actual_id.row_number as u16,
        )?;
        let extent = slice.end - slice.start;
        let plain =
            record::serialize_row(&self.format, &self.columns, &new_values, self.charset, None)?;

        let final_id = if plain.len() <= extent {
            // Shrink or same size: rewrite in place, padded to the extent.
            let image = record::serialize_row(
                &self.format,
                &self.columns,
                &new_values,
                self.charset,
                Some(extent),
            )?;
            record::overwrite_row(
                &self.format,
                &mut page,
                actual_id.page_number,
                actual_id.row_number as u16,
                &image,
            )?;
            ch.write_page(&page, actual_id.page_number)?;
            actual_id
        } else {
            // Grow: migrate to a page with room, leave a pointer row.
            let pn = self.find_target_page(ch, plain.len())?;
            let mut target = ch.create_page_buffer();
            ch.read_page(&mut target, pn)?;
            let row_number = record::add_row_to_page(&self.format, &mut target, pn, &plain)?;
            ch.write_page(&target, pn)?;
            if record::free_space_on_page(&self.format, &target, pn)? < FREE_SPACE_THRESHOLD {
                self.free_space_pages
                    .remove_page_number(ch, &self.format, pn)?;
            }
            let new_id = RowId::new(pn, row_number as i32);
            let mut old_page = ch.create_page_buffer();
            ch.read_page(&mut old_page, actual_id.page_number)?;
            record::write_pointer_row(
                &self.format,
                &mut old_page,
                actual_id.page_number,
                actual_id.row_number as u16,
                new_id,
            )?;
            ch.write_page(&old_page, actual_id.page_number)?;
            debug!(
                "table {:?} migrated row {} to {}",
                self.name, actual_id, new_id
            );
            new_id
        };

        for pn in lv_pages {
            self.owned_pages.add_page_number(ch, &self.format, pn)?;
        }
        for pn in freed_chains {
            self.owned_pages.remove_page_number(ch, &self.format, pn)?;
            self.free_space_pages.add_page_number(ch, &self.format, pn)?;
        }
        // The index sees delete-then-insert, even for in-place rewrites
        // whose RowId did not change.
        for data in self.index_datas.iter_mut() {
            data.delete_row(ch, &self.format, &self.columns, &old_values, actual_id)?;
            data.add_row(ch, &self.format, &self.columns, &new_values, final_id)?;
        }
        self.persist_counters(ch)?;
        Ok(final_id)
    }

    /// Opens an entry cursor over a logical index's tree. `None` bounds
    /// mean the full range; bounds are key prefixes (`key_prefix_for`).
    pub fn index_cursor(
        &self,
        index_name: &str,
        start: Option<Vec<u8>>,
        start_inclusive: bool,
        end: Option<Vec<u8>>,
        end_inclusive: bool,
    ) -> Result<EntryCursor> {
        let index = self
            .index(index_name)
            .ok_or_else(|| Error::Schema(format!("no index named {:?}", index_name)))?;
        let data = &self.index_datas[index.index_data_number as usize];
        Ok(data.cursor(start, start_inclusive, end, end_inclusive))
    }

    /// Advances an index cursor against this table's tree.
    pub fn next_index_entry(&mut self, cursor: &mut EntryCursor) -> Result<Option<Entry>> {
        let channel = self.channel();
        let mut ch = channel.borrow_mut();
        let fmt = Rc::clone(&self.format);
        let table_name = self.name.clone();
        let data_number = cursor.index_data_number() as usize;
        let data = self.index_datas.get_mut(data_number).ok_or_else(|| {
            Error::StaleCursor(format!(
                "no index data #{} in table {:?}",
                data_number, table_name
            ))
        })?;
        cursor.next(data, &mut ch, &fmt)
    }

    /// A detached scan cursor over live rows in RowId order.
    pub fn row_cursor(&self) -> RowCursor {
        RowCursor {
            map_cursor: self.owned_pages.cursor(),
            current_page: INVALID_PAGE_NUMBER,
            next_row: 0,
        }
    }

    /// Advances `cursor`, returning the next live row and its id.
    pub fn next_row(&self, cursor: &mut RowCursor) -> Result<Option<(RowId, Row)>> {
        let channel = self.channel();
        let mut ch = channel.borrow_mut();
        let mut page = ch.create_page_buffer();
        loop {
            if cursor.current_page == INVALID_PAGE_NUMBER {
                match self.owned_pages.next_page(&mut cursor.map_cursor) {
                    Some(pn) => {
                        ch.read_page(&mut page, pn)?;
                        if page[0] != page_types::DATA {
                            continue;
                        }
                        cursor.current_page = pn;
                        cursor.next_row = 0;
                    }
                    None => return Ok(None),
                }
            } else {
                ch.read_page(&mut page, cursor.current_page)?;
            }
            let hdr = record::read_data_page_header(&self.format, &page, cursor.current_page)?;
            while cursor.next_row < hdr.row_count {
                let row_number = cursor.next_row;
                cursor.next_row += 1;
                let slice =
                    record::find_row(&self.format, &page, cursor.current_page, row_number)?;
                if slice.deleted || slice.pointer {
                    continue;
                }
                let row_id = RowId::new(cursor.current_page, row_number as i32);
                drop(ch);
                let row = self.get_row(row_id)?;
                return Ok(Some((row_id, row)));
            }
            cursor.current_page = INVALID_PAGE_NUMBER;
        }
    }

    /// Buffer-reusing row scan in the streaming-iterator style.
    pub fn streaming_iterator(&self) -> TableStreamingIterator<'_> {
        TableStreamingIterator {
            table: self,
            cursor: self.row_cursor(),
            item: None,
            error: None,
        }
    }
}

/// Detached state for a table scan; holds no borrow of the table.
#[derive(Debug, Clone)]
pub struct RowCursor {
    map_cursor: PageCursor,
    current_page: PageNum,
    next_row: u16,
}

/// Streams rows without allocating a fresh collection per step. A read
/// error ends the stream; `error()` exposes it.
pub struct TableStreamingIterator<'a> {
    table: &'a Table,
    cursor: RowCursor,
    item: Option<(RowId, Row)>,
    error: Option<Error>,
}

impl<'a> TableStreamingIterator<'a> {
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    pub fn current_row_id(&self) -> Option<RowId> {
        self.item.as_ref().map(|(id, _)| *id)
    }
}

impl<'a> StreamingIterator for TableStreamingIterator<'a> {
    type Item = Row;

    #[inline]
    fn advance(&mut self) {
        if self.error.is_some() {
            self.item = None;
            return;
        }
        match self.table.next_row(&mut self.cursor) {
            Ok(next) => self.item = next,
            Err(e) => {
                self.error = Some(e);
                self.item = None;
            }
        }
    }

    #[inline]
    fn get(&self) -> Option<&Self::Item> {
        self.item.as_ref().map(|(_, row)| row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::byte_channel::MemoryChannel;
    use crate::codec::IdentityCodec;
    use crate::format::FileFormat;

    fn setup() -> (Rc<RefCell<PageChannel>>, Rc<Format>) {
        let format = Rc::new(Format::for_file_format(FileFormat::V4));
        let channel = Rc::new(RefCell::new(PageChannel::new(
            Box::new(MemoryChannel::new()),
            Box::new(IdentityCodec),
            &format,
            false,
        )));
        // Page 0 stands in for the database header.
        channel.borrow_mut().allocate_new_page().unwrap();
        (channel, format)
    }

    fn new_table(channel: &Rc<RefCell<PageChannel>>, format: &Rc<Format>) -> Table {
        Table::create(
            Rc::clone(channel),
            Rc::clone(format),
            Charset::Utf16Le,
            SortOrder::Legacy,
            DateTimeType::Legacy,
            None,
            "people",
            vec![
                ColumnSpec {
                    name: String::from("id"),
                    data_type: DataType::Long,
                    max_length: None,
                    auto_number: true,
                    scale: 0,
                    precision: 0,
                },
                ColumnSpec::new("name", DataType::Text).with_max_length(100),
            ],
            vec![IndexSpec {
                name: String::from("pk"),
                index_type: IndexType::Primary,
                unique: true,
                ignore_nulls: false,
                columns: vec![(String::from("id"), false)],
            }],
        )
        .expect("Should have created table.")
    }

    #[test]
    fn test_definition_page_roundtrip() {
        let (channel, format) = setup();
        let t = new_table(&channel, &format);
        let back = Table::open(
            Rc::clone(&channel),
            Rc::clone(&format),
            Charset::Utf16Le,
            SortOrder::Legacy,
            DateTimeType::Legacy,
            None,
            t.definition_page(),
        )
        .expect("Should have reopened table.");
        assert_eq!(back.name(), "people");
        assert_eq!(back.columns().len(), 2);
        assert_eq!(back.columns()[0].name, "id");
        assert!(back.columns()[0].auto_number);
        assert_eq!(back.indexes().len(), 1);
        assert!(back.index("pk").unwrap().is_primary_key());
        assert_eq!(back.get_row_count(), 0);
    }

    #[test]
    fn test_auto_number_fill() {
        let (channel, format) = setup();
        let mut t = new_table(&channel, &format);
        let r1 = t
            .add_row(&Row::new().with("name", Value::Text(String::from("a"))))
            .unwrap();
        let r2 = t
            .add_row(&Row::new().with("name", Value::Text(String::from("b"))))
            .unwrap();
        assert_eq!(t.get_row(r1).unwrap().get("id"), Some(&Value::Long(1)));
        assert_eq!(t.get_row(r2).unwrap().get("id"), Some(&Value::Long(2)));
    }

    #[test]
    fn test_delete_makes_rowid_dangling() {
        let (channel, format) = setup();
        let mut t = new_table(&channel, &format);
        let id = t
            .add_row(&Row::new().with("name", Value::Text(String::from("x"))))
            .unwrap();
        t.delete_row(id).unwrap();
        assert!(matches!(t.get_row(id), Err(Error::DanglingRowId { .. })));
        assert!(matches!(
            t.delete_row(id),
            Err(Error::DanglingRowId { .. })
        ));
        assert_eq!(t.get_row_count(), 0);
    }

    #[test]
    fn test_update_shrink_keeps_rowid() {
        let (channel, format) = setup();
        let mut t = new_table(&channel, &format);
        let id = t
            .add_row(&Row::new().with("name", Value::Text(String::from("longer name"))))
            .unwrap();
        let new_id = t
            .update_row(id, &Row::new().with("name", Value::Text(String::from("s"))))
            .unwrap();
        assert_eq!(id, new_id);
        assert_eq!(
            t.get_row(id).unwrap().get("name"),
            Some(&Value::Text(String::from("s")))
        );
    }

    #[test]
    fn test_unknown_column_rejected() {
        let (channel, format) = setup();
        let mut t = new_table(&channel, &format);
        assert!(matches!(
            t.add_row(&Row::new().with("bogus", Value::Long(1))),
            Err(Error::Schema(_))
        ));
    }

    #[test]
    fn test_duplicate_column_name_rejected() {
        let (channel, format) = setup();
        let result = Table::create(
            channel,
            format,
            Charset::Utf16Le,
            SortOrder::Legacy,
            DateTimeType::Legacy,
            None,
            "bad",
            vec![
                ColumnSpec::new("a", DataType::Long),
                ColumnSpec::new("A", DataType::Long),
            ],
            Vec::new(),
        );
        assert!(matches!(result, Err(Error::DuplicateName(_))));
    }

    #[test]
    fn test_key_prefix_for_bounds() {
        let (channel, format) = setup();
        let mut t = new_table(&channel, &format);
        for name in ["a", "b", "c"] {
            t.add_row(&Row::new().with("name", Value::Text(String::from(name))))
                .unwrap();
        }
        let lo = t
            .key_prefix_for("pk", &Row::new().with("id", Value::Long(2)))
            .unwrap()
            .unwrap();
        let mut cursor = t.index_cursor("pk", Some(lo), true, None, true).unwrap();
        let mut ids = Vec::new();
        while let Some(e) = t.next_index_entry(&mut cursor).unwrap() {
            ids.push(t.get_row(e.row_id()).unwrap().get("id").cloned().unwrap());
        }
        assert_eq!(ids, vec![Value::Long(2), Value::Long(3)]);

        // A row missing the indexed column projects to no prefix.
        assert!(t
            .key_prefix_for("pk", &Row::new().with("name", Value::Text(String::new())))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_column_error_handler_substitutes() {
        let (channel, format) = setup();
        let mut t = new_table(&channel, &format);
        let id = t
            .add_row(&Row::new().with("name", Value::Text(String::from("fine"))))
            .unwrap();
        // Corrupt the stored text into an odd-length UTF-16 slice by
        // nudging the var-offset table inside the row image.
        {
            let channel = t.channel();
            let mut ch = channel.borrow_mut();
            let mut page = ch.create_page_buffer();
            ch.read_page(&mut page, id.page_number).unwrap();
            let slice = record::find_row(&t.format, &page, id.page_number, 0).unwrap();
            let row_end = slice.end;
            // var end offset sits before varcount (2) and bitmap (1).
            let off_pos = row_end - 1 - 2 - 2;
            let end = LittleEndian::read_u16(&page[off_pos..]);
            LittleEndian::write_u16(&mut page[off_pos..], end + 1);
            ch.write_page(&page, id.page_number).unwrap();
        }
        assert!(t.get_row(id).is_err());

        t.set_error_handler(Some(Box::new(|col, _err| {
            (col.name == "name").then(|| Value::Text(String::from("<repaired>")))
        })));
        let row = t.get_row(id).unwrap();
        assert_eq!(row.get("name"), Some(&Value::Text(String::from("<repaired>"))));
    }
}
