//! The data-page record format.
//!
//! A data page carries a header, row content growing up from the content
//! start, and a table of 16-bit row offsets growing down from the page
//! end. Within a row: the column count, the fixed-length area, the
//! variable-length values, and a trailer holding the variable-offset
//! table, the variable-column count and the null bitmap.
//!
//! Data page layout:
//! Offset  Size  Description
//! 0       1     page type (0x01)
//! 1       1     unused
//! 2       2     free-space start offset
//! 4       4     owning table-definition page
//! 8       2     row count
//! 10      ..    row content
//! tail    2*n   row offsets, entry i at PAGE_SIZE - 2*(i+1)
//!
//! A row offset's high bits flag the slot: 0x8000 deleted, 0x4000 pointer
//! row (the content is a 5-byte RowId of the migrated row).

use byteorder::{ByteOrder, LittleEndian};

use crate::column::Column;
use crate::error::{Error, Result};
use crate::format::{page_types, Charset, Format};
use crate::page_channel::PageNum;
use crate::rowid::{RowId, ROW_ID_SIZE};
use crate::value::{DateTimeType, Value};

pub const ROW_FLAG_DELETED: u16 = 0x8000;
pub const ROW_FLAG_POINTER: u16 = 0x4000;
pub const ROW_OFFSET_MASK: u16 = 0x1fff;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataPageHeader {
    pub free_space_offset: u16,
    pub owning_table: PageNum,
    pub row_count: u16,
}

pub fn init_data_page(format: &Format, page: &mut [u8], owning_table: PageNum) {
    page.fill(0);
    page[0] = page_types::DATA;
    write_data_page_header(
        format,
        page,
        &DataPageHeader {
            free_space_offset: format.offset_data_page_content as u16,
            owning_table,
            row_count: 0,
        },
    );
}

pub fn read_data_page_header(format: &Format, page: &[u8], page_number: PageNum) -> Result<DataPageHeader> {
    if page[0] != page_types::DATA {
        return Err(Error::UnrecognizedPageType {
            page_number,
            type_byte: page[0],
        });
    }
    Ok(DataPageHeader {
        free_space_offset: LittleEndian::read_u16(&page[format.offset_free_space..]),
        owning_table: LittleEndian::read_i32(&page[format.offset_owning_table..]),
        row_count: LittleEndian::read_u16(&page[format.offset_row_count..]),
    })
}

fn write_data_page_header(format: &Format, page: &mut [u8], hdr: &DataPageHeader) {
    LittleEndian::write_u16(&mut page[format.offset_free_space..], hdr.free_space_offset);
    LittleEndian::write_i32(&mut page[format.offset_owning_table..], hdr.owning_table);
    LittleEndian::write_u16(&mut page[format.offset_row_count..], hdr.row_count);
}

fn row_offset_entry_pos(page_len: usize, row_number: u16) -> usize {
    page_len - 2 * (row_number as usize + 1)
}

fn read_row_offset_entry(page: &[u8], row_number: u16) -> u16 {
    LittleEndian::read_u16(&page[row_offset_entry_pos(page.len(), row_number)..])
}

fn write_row_offset_entry(page: &mut [u8], row_number: u16, entry: u16) {
    let pos = row_offset_entry_pos(page.len(), row_number);
    LittleEndian::write_u16(&mut page[pos..], entry);
}

/// Free bytes left for row content, accounting for the offset-table entry
/// a new row would need.
pub fn free_space_on_page(format: &Format, page: &[u8], page_number: PageNum) -> Result<usize> {
    let hdr = read_data_page_header(format, page, page_number)?;
    let tail_start = page.len() - 2 * hdr.row_count as usize;
    Ok(tail_start
        .saturating_sub(hdr.free_space_offset as usize)
        .saturating_sub(2))
}

/// Location of one row on a page.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RowSlice {
    pub start: usize,
    pub end: usize,
    pub deleted: bool,
    pub pointer: bool,
}

/// Resolves the extent of row `row_number`: from its offset to the next
/// row's offset, or to the free-space mark for the last row.
pub fn find_row(
    format: &Format,
    page: &[u8],
    page_number: PageNum,
    row_number: u16,
) -> Result<RowSlice> {
    let hdr = read_data_page_header(format, page, page_number)?;
    if row_number >= hdr.row_count {
        return Err(Error::DanglingRowId {
            page_number,
            row_number: row_number as i32,
        });
    }
    let entry = read_row_offset_entry(page, row_number);
    let start = (entry & ROW_OFFSET_MASK) as usize;
    let end = if row_number + 1 < hdr.row_count {
        (read_row_offset_entry(page, row_number + 1) & ROW_OFFSET_MASK) as usize
    } else {
        hdr.free_space_offset as usize
    };
    if start < format.offset_data_page_content || end < start || end > page.len() {
        return Err(Error::MalformedPage {
            page_number,
            reason: format!("row {} has impossible extent {}..{}", row_number, start, end),
        });
    }
    Ok(RowSlice {
        start,
        end,
        deleted: entry & ROW_FLAG_DELETED != 0,
        pointer: entry & ROW_FLAG_POINTER != 0,
    })
}

/// Appends `row` to the page. The caller must have checked free space;
/// not fitting here is an invariant breach, not a recoverable condition.
pub fn add_row_to_page(
    format: &Format,
    page: &mut [u8],
    page_number: PageNum,
    row: &[u8],
) -> Result<u16> {
    if free_space_on_page(format, page, page_number)? < row.len() {
        return Err(Error::Invariant(format!(
            "row of {} bytes added to page {} with insufficient space",
            row.len(),
            page_number
        )));
    }
    let mut hdr = read_data_page_header(format, page, page_number)?;
    let start = hdr.free_space_offset as usize;
    page[start..start + row.len()].copy_from_slice(row);
    let row_number = hdr.row_count;
    write_row_offset_entry(page, row_number, start as u16);
    hdr.row_count += 1;
    hdr.free_space_offset = (start + row.len()) as u16;
    write_data_page_header(format, page, &hdr);
    Ok(row_number)
}

/// Rewrites a live row in place. The new image must fill the old extent;
/// slack inside the image is tolerated by the trailer offsets.
pub fn overwrite_row(
    format: &Format,
    page: &mut [u8],
    page_number: PageNum,
    row_number: u16,
    row: &[u8],
) -> Result<()> {
    let slice = find_row(format, page, page_number, row_number)?;
    if slice.deleted || slice.pointer {
        return Err(Error::DanglingRowId {
            page_number,
            row_number: row_number as i32,
        });
    }
    if row.len() != slice.end - slice.start {
        return Err(Error::Invariant(format!(
            "in-place rewrite of row {} changed its extent",
            row_number
        )));
    }
    page[slice.start..slice.end].copy_from_slice(row);
    Ok(())
}

/// Flags a row slot as deleted. The extent is not reclaimed.
pub fn mark_row_deleted(
    format: &Format,
    page: &mut [u8],
    page_number: PageNum,
    row_number: u16,
) -> Result<()> {
    let _ = find_row(format, page, page_number, row_number)?;
    let entry = read_row_offset_entry(page, row_number);
    write_row_offset_entry(page, row_number, entry | ROW_FLAG_DELETED);
    Ok(())
}

/// Turns a row slot into a pointer to its migrated location.
pub fn write_pointer_row(
    format: &Format,
    page: &mut [u8],
    page_number: PageNum,
    row_number: u16,
    target: RowId,
) -> Result<()> {
    let slice = find_row(format, page, page_number, row_number)?;
    if slice.end - slice.start < ROW_ID_SIZE {
        return Err(Error::Invariant(format!(
            "row {} extent too small for a pointer row",
            row_number
        )));
    }
    let mut suffix = Vec::with_capacity(ROW_ID_SIZE);
    target.write_suffix(&mut suffix);
    page[slice.start..slice.start + ROW_ID_SIZE].copy_from_slice(&suffix);
    let entry = read_row_offset_entry(page, row_number);
    write_row_offset_entry(page, row_number, entry | ROW_FLAG_POINTER);
    Ok(())
}

/// Reads the target of a pointer row.
pub fn read_pointer_row(page: &[u8], slice: &RowSlice) -> Result<RowId> {
    RowId::read_suffix(&page[slice.start..slice.start + ROW_ID_SIZE])
}

fn null_bitmap_len(ncols: usize) -> usize {
    (ncols + 7) / 8
}

fn trailer_len(ncols: usize, var_count: usize) -> usize {
    2 * (var_count + 1) + 2 + null_bitmap_len(ncols)
}

/// Length of the fixed-data area implied by the column layout.
pub fn fixed_area_len(columns: &[Column]) -> usize {
    columns
        .iter()
        .filter_map(|c| c.data_type.fixed_size().map(|sz| c.fixed_offset as usize + sz))
        .max()
        .unwrap_or(0)
}

/// Assigns fixed-area offsets in declaration order; returns the area length.
pub fn assign_fixed_offsets(columns: &mut [Column]) -> usize {
    let mut offset = 0_usize;
    for col in columns.iter_mut() {
        if let Some(sz) = col.data_type.fixed_size() {
            col.fixed_offset = offset as u16;
            offset += sz;
        }
    }
    offset
}

/// Serializes one row. `values` aligns with `columns`; long-value columns
/// must already carry their var-slot bytes as `Value::Binary` (the table
/// layer runs the long-value store first). `target_len`, when given, pads
/// the image to exactly that many bytes (in-place updates keep their
/// extent); the slack sits between the var data and the trailer.
pub fn serialize_row(
    format: &Format,
    columns: &[Column],
    values: &[Value],
    charset: Charset,
    target_len: Option<usize>,
) -> Result<Vec<u8>> {
    debug_assert_eq!(columns.len(), values.len());
    let ncols = columns.len();
    let fixed_len = fixed_area_len(columns);
    let var_cols: Vec<usize> = (0..ncols)
        .filter(|i| columns[*i].is_variable_length())
        .collect();

    let mut buf = Vec::with_capacity(2 + fixed_len + 64);
    buf.extend_from_slice(&(ncols as u16).to_le_bytes());
    buf.resize(2 + fixed_len, 0);

    let mut null_bits = vec![0_u8; null_bitmap_len(ncols)];
    for (i, (col, value)) in columns.iter().zip(values.iter()).enumerate() {
        if matches!(value, Value::Null) {
            continue;
        }
        // Bit set means NOT null.
        null_bits[i / 8] |= 1 << (i % 8);
        if let Some(sz) = col.data_type.fixed_size() {
            let start = 2 + col.fixed_offset as usize;
            col.write_fixed_value(value, &mut buf[start..start + sz])?;
        }
    }

    let mut var_offsets: Vec<u16> = Vec::with_capacity(var_cols.len() + 1);
    for &i in &var_cols {
        var_offsets.push(buf.len() as u16);
        match &values[i] {
            Value::Null => {}
            v if columns[i].is_long_value() => match v {
                Value::Binary(slot) => buf.extend_from_slice(slot),
                _ => {
                    return Err(Error::Invariant(format!(
                        "long-value column {:?} reached the row codec unresolved",
                        columns[i].name
                    )))
                }
            },
            v => {
                let bytes = columns[i].encode_var_value(format, v, charset)?;
                buf.extend_from_slice(&bytes);
            }
        }
    }
    var_offsets.push(buf.len() as u16);

    let body_len = buf.len();
    let total = body_len + trailer_len(ncols, var_cols.len());
    let total = match target_len {
        Some(t) => {
            if t < total {
                return Err(Error::Invariant(format!(
                    "row image of {} bytes cannot shrink into {} bytes",
                    total, t
                )));
            }
            t
        }
        None => total,
    };
    if total > format.page_size - format.offset_data_page_content - 2 {
        return Err(Error::Schema(format!(
            "row of {} bytes cannot fit any data page",
            total
        )));
    }
    buf.resize(total, 0);

    let bitmap_start = total - null_bits.len();
    buf[bitmap_start..].copy_from_slice(&null_bits);
    let var_count_pos = bitmap_start - 2;
    LittleEndian::write_u16(&mut buf[var_count_pos..], var_cols.len() as u16);
    let mut pos = var_count_pos - 2 * var_offsets.len();
    for off in &var_offsets {
        LittleEndian::write_u16(&mut buf[pos..], *off);
        pos += 2;
    }
    Ok(buf)
}

/// Decodes one row image back into values aligned with `columns`.
/// Long-value columns come back as `Value::Binary` of the raw var slot;
/// the table layer resolves them through the long-value store.
pub fn read_row(
    format: &Format,
    columns: &[Column],
    row: &[u8],
    charset: Charset,
    date_time_type: DateTimeType,
) -> Result<Vec<Value>> {
    read_row_with(format, columns, row, charset, date_time_type, &mut |_, e| {
        Err(e)
    })
}

/// Like `read_row`, but a failed column decode is offered to `on_error`,
/// which may substitute a value instead of propagating.
pub fn read_row_with(
    format: &Format,
    columns: &[Column],
    row: &[u8],
    charset: Charset,
    date_time_type: DateTimeType,
    on_error: &mut dyn FnMut(&Column, Error) -> Result<Value>,
) -> Result<Vec<Value>> {
    let ncols = columns.len();
    let min_len = 2 + trailer_len(ncols, 0);
    if row.len() < min_len {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("row image of {} bytes is too short", row.len()),
        )));
    }
    let stored_cols = LittleEndian::read_u16(&row[0..]) as usize;
    if stored_cols != ncols {
        return Err(Error::Schema(format!(
            "row stores {} columns but the table defines {}",
            stored_cols, ncols
        )));
    }
    let bml = null_bitmap_len(ncols);
    let null_bits = &row[row.len() - bml..];
    let var_count = LittleEndian::read_u16(&row[row.len() - bml - 2..]) as usize;
    if 2 + trailer_len(ncols, var_count) > row.len() {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("row trailer claims {} variable columns", var_count),
        )));
    }
    let offsets_pos = row.len() - bml - 2 - 2 * (var_count + 1);
    let mut var_offsets = Vec::with_capacity(var_count + 1);
    for j in 0..=var_count {
        var_offsets.push(LittleEndian::read_u16(&row[offsets_pos + 2 * j..]) as usize);
    }

    let mut values = Vec::with_capacity(ncols);
    let mut var_idx = 0_usize;
    for (i, col) in columns.iter().enumerate() {
        let not_null = null_bits[i / 8] & (1 << (i % 8)) != 0;
        if col.is_variable_length() {
            let start = var_offsets[var_idx];
            let end = var_offsets[var_idx + 1];
            var_idx += 1;
            if !not_null {
                values.push(Value::Null);
                continue;
            }
            if end < start || end > row.len() {
                let err = Error::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("variable column {:?} has impossible offsets", col.name),
                ));
                values.push(on_error(col, err)?);
                continue;
            }
            let bytes = &row[start..end];
            if col.is_long_value() {
                values.push(Value::Binary(bytes.to_vec()));
            } else {
                match col.decode_var_value(bytes, charset) {
                    Ok(v) => values.push(v),
                    Err(e) => values.push(on_error(col, e)?),
                }
            }
        } else if not_null {
            let sz = col.data_type.fixed_size().expect("fixed type has a size");
            let start = 2 + col.fixed_offset as usize;
            match col.read_fixed_value(&row[start..start + sz], date_time_type) {
                Ok(v) => values.push(v),
                Err(e) => values.push(on_error(col, e)?),
            }
        } else {
            values.push(Value::Null);
        }
    }
    Ok(values)
}
