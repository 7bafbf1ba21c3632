//! Per-version format descriptors and the database header page.
//!
//! The header's version byte selects one `Format` record at open time; all
//! other code reads layout constants from that record and never hard-codes
//! them. Everything on disk is little-endian.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

use crate::error::{Error, Result};

/// One-byte type tag at offset 0 of every page.
pub mod page_types {
    pub const HEADER: u8 = 0x00;
    pub const DATA: u8 = 0x01;
    pub const TABLE_DEF: u8 = 0x02;
    pub const INDEX_NODE: u8 = 0x03;
    pub const INDEX_LEAF: u8 = 0x04;
    pub const USAGE_MAP: u8 = 0x05;
    pub const LONG_VALUE: u8 = 0x06;
}

pub const MAGIC: &[u8; 16] = b"MDB-RS Database\0";

/// Format version chosen at create time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    /// 2048-byte pages, Latin-1 text.
    V3,
    /// 4096-byte pages, UTF-16LE text.
    V4,
}

/// How text is stored on disk. The format supplies a default; the open
/// options may override it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Charset {
    Latin1,
    Utf16Le,
}

/// Which collation table the database's text sort keys use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Legacy,
    General,
}

impl SortOrder {
    pub fn to_disk_byte(self) -> u8 {
        match self {
            SortOrder::Legacy => 0x00,
            SortOrder::General => 0x01,
        }
    }

    pub fn from_disk_byte(b: u8) -> Result<SortOrder> {
        match b {
            0x00 => Ok(SortOrder::Legacy),
            0x01 => Ok(SortOrder::General),
            _ => Err(Error::Schema(format!("unrecognized sort order byte {:#04x}", b))),
        }
    }
}

/// Read-only record of per-version constants.
#[derive(Debug)]
pub struct Format {
    pub file_format: FileFormat,
    pub version_byte: u8,
    pub page_size: usize,
    pub default_charset: Charset,

    // Header page layout.
    pub offset_version: usize,
    pub offset_magic: usize,
    pub offset_page_count: usize,
    pub offset_catalog_page: usize,
    pub offset_sort_order: usize,
    pub offset_change_counter: usize,

    // Data page layout.
    pub offset_free_space: usize,
    pub offset_owning_table: usize,
    pub offset_row_count: usize,
    pub offset_data_page_content: usize,

    // Usage maps.
    pub offset_usage_map_start_page: usize,
    pub offset_usage_map_inline_bitmap: usize,
    pub usage_map_inline_bitmap_len: usize,
    pub offset_reference_map_page_numbers: usize,
    pub max_reference_map_segments: usize,
    pub usage_map_decl_length: usize,
    pub offset_usage_map_page_data: usize,
    pub pages_per_usage_map_page: usize,

    // Index pages.
    pub offset_index_entry_count: usize,
    pub offset_index_prev_leaf: usize,
    pub offset_index_next_leaf: usize,
    pub offset_index_entries: usize,

    // Long value pages.
    pub offset_long_value_len: usize,
    pub offset_long_value_next: usize,
    pub offset_long_value_content: usize,
    pub max_inline_long_value_size: usize,

    // Limits.
    pub max_table_name_length: usize,
    pub max_columns_per_table: usize,
    pub text_field_max_length: usize,
}

const OFFSET_USAGE_MAP_PAGE_DATA: usize = 4;
const USAGE_MAP_INLINE_BITMAP_LEN: usize = 64;
// 1 type byte + 17 four-byte segment pointers = 69 bytes, the same length
// as the inline layout (1 + 4 + 64), so the two variants are
// interchangeable in a declaration slot.
const USAGE_MAP_DECL_LENGTH: usize = 69;

fn format_for(file_format: FileFormat) -> Format {
    let (version_byte, page_size, default_charset) = match file_format {
        FileFormat::V3 => (0x00, 2048, Charset::Latin1),
        FileFormat::V4 => (0x01, 4096, Charset::Utf16Le),
    };
    Format {
        file_format,
        version_byte,
        page_size,
        default_charset,

        offset_version: 1,
        offset_magic: 2,
        offset_page_count: 18,
        offset_catalog_page: 22,
        offset_sort_order: 26,
        offset_change_counter: 27,

        offset_free_space: 2,
        offset_owning_table: 4,
        offset_row_count: 8,
        offset_data_page_content: 10,

        offset_usage_map_start_page: 1,
        offset_usage_map_inline_bitmap: 5,
        usage_map_inline_bitmap_len: USAGE_MAP_INLINE_BITMAP_LEN,
        offset_reference_map_page_numbers: 1,
        max_reference_map_segments: 16,
        usage_map_decl_length: USAGE_MAP_DECL_LENGTH,
        offset_usage_map_page_data: OFFSET_USAGE_MAP_PAGE_DATA,
        pages_per_usage_map_page: (page_size - OFFSET_USAGE_MAP_PAGE_DATA) * 8,

        offset_index_entry_count: 2,
        offset_index_prev_leaf: 4,
        offset_index_next_leaf: 8,
        offset_index_entries: 12,

        offset_long_value_len: 2,
        offset_long_value_next: 4,
        offset_long_value_content: 8,
        max_inline_long_value_size: 64,

        max_table_name_length: 64,
        max_columns_per_table: 255,
        text_field_max_length: 510,
    }
}

impl Format {
    pub fn for_file_format(file_format: FileFormat) -> Format {
        format_for(file_format)
    }

    pub fn from_version_byte(b: u8) -> Result<Format> {
        match b {
            0x00 => Ok(format_for(FileFormat::V3)),
            0x01 => Ok(format_for(FileFormat::V4)),
            _ => Err(Error::UnrecognizedFormatVersion(b)),
        }
    }

    /// Capacity of one reference usage map, write side: 16 segments.
    pub fn max_reference_map_pages(&self) -> usize {
        self.max_reference_map_segments * self.pages_per_usage_map_page
    }
}

/// Parsed database header (page 0).
#[derive(Debug, Clone)]
pub struct DbHeader {
    pub page_count: u32,
    pub catalog_page: i32,
    pub sort_order: SortOrder,
    pub change_counter: u32,
}

/// Peeks the version byte of a header page without a full parse, so the
/// caller can build the right `Format` before decoding the rest.
pub fn read_version_byte(header_page: &[u8]) -> Result<u8> {
    if header_page.len() < 18 {
        return Err(Error::WrongMagic);
    }
    if header_page[0] != page_types::HEADER {
        return Err(Error::UnrecognizedPageType {
            page_number: 0,
            type_byte: header_page[0],
        });
    }
    if &header_page[2..18] != MAGIC {
        return Err(Error::WrongMagic);
    }
    Ok(header_page[1])
}

pub fn read_header(format: &Format, page: &[u8]) -> Result<DbHeader> {
    // read_version_byte validated the type tag and magic already.
    let version = read_version_byte(page)?;
    if version != format.version_byte {
        return Err(Error::UnrecognizedFormatVersion(version));
    }
    let mut c = Cursor::new(&page[format.offset_page_count..]);
    let page_count = c.read_u32::<LittleEndian>()?;
    let catalog_page = c.read_i32::<LittleEndian>()?;
    let sort_order = SortOrder::from_disk_byte(page[format.offset_sort_order])?;
    let mut c = Cursor::new(&page[format.offset_change_counter..]);
    let change_counter = c.read_u32::<LittleEndian>()?;
    Ok(DbHeader {
        page_count,
        catalog_page,
        sort_order,
        change_counter,
    })
}

pub fn write_header(format: &Format, page: &mut [u8], hdr: &DbHeader) -> Result<()> {
    page[0] = page_types::HEADER;
    page[format.offset_version] = format.version_byte;
    page[format.offset_magic..format.offset_magic + MAGIC.len()].copy_from_slice(MAGIC);
    let mut c = Cursor::new(&mut page[format.offset_page_count..]);
    c.write_u32::<LittleEndian>(hdr.page_count)?;
    c.write_i32::<LittleEndian>(hdr.catalog_page)?;
    page[format.offset_sort_order] = hdr.sort_order.to_disk_byte();
    let mut c = Cursor::new(&mut page[format.offset_change_counter..]);
    c.write_u32::<LittleEndian>(hdr.change_counter)?;
    Ok(())
}

#[test]
fn test_format_constants_per_version() {
    let f3 = Format::for_file_format(FileFormat::V3);
    assert_eq!(f3.page_size, 2048);
    assert_eq!(f3.pages_per_usage_map_page, (2048 - 4) * 8);
    assert_eq!(f3.default_charset, Charset::Latin1);

    let f4 = Format::for_file_format(FileFormat::V4);
    assert_eq!(f4.page_size, 4096);
    assert_eq!(f4.pages_per_usage_map_page, 32736);
    assert_eq!(f4.max_reference_map_pages(), 523_776);
    assert_eq!(f4.default_charset, Charset::Utf16Le);
}

#[test]
fn test_header_roundtrip() {
    let format = Format::for_file_format(FileFormat::V4);
    let mut page = vec![0_u8; format.page_size];
    let hdr = DbHeader {
        page_count: 12,
        catalog_page: 1,
        sort_order: SortOrder::General,
        change_counter: 99,
    };
    write_header(&format, &mut page, &hdr).unwrap();
    assert_eq!(read_version_byte(&page).unwrap(), 0x01);
    let back = read_header(&format, &page).unwrap();
    assert_eq!(back.page_count, 12);
    assert_eq!(back.catalog_page, 1);
    assert_eq!(back.sort_order, SortOrder::General);
    assert_eq!(back.change_counter, 99);
}

#[test]
fn test_header_wrong_magic() {
    let format = Format::for_file_format(FileFormat::V4);
    let mut page = vec![0_u8; format.page_size];
    page[2..18].copy_from_slice(b"SQLite format 3\0");
    assert!(matches!(read_version_byte(&page), Err(Error::WrongMagic)));
}

#[test]
fn test_header_unrecognized_version() {
    let format = Format::for_file_format(FileFormat::V4);
    let mut page = vec![0_u8; format.page_size];
    let hdr = DbHeader {
        page_count: 1,
        catalog_page: -1,
        sort_order: SortOrder::Legacy,
        change_counter: 0,
    };
    write_header(&format, &mut page, &hdr).unwrap();
    page[1] = 0x7e;
    assert!(matches!(
        Format::from_version_byte(page[1]),
        Err(Error::UnrecognizedFormatVersion(0x7e))
    ));
}
