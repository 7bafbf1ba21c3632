//! Encodes column tuples into the order-preserving byte strings stored in
//! index leaves.
//!
//! An entry is the concatenation of per-column sort keys, each followed by
//! a separator byte, then the 5-byte RowId suffix. Ascending encodings:
//! a null is the single byte 0x00; a boolean is `[0x80, 0x00|0xff]`; fixed
//! numerics are `0x80` plus big-endian bytes put through the sign-flip
//! (integers) or IEEE-754 (floats) order transform; text is the collation
//! encoding. A descending column has every byte complemented (text
//! modifier bytes excepted, handled by the text encoder); the RowId suffix
//! is never complemented.

use crate::column::Column;
use crate::data_type::DataType;
use crate::error::{Error, Result};
use crate::format::SortOrder;
use crate::index::text_key;
use crate::rowid::{RowId, ROW_ID_SIZE};
use crate::value::{self, Value};

/// Byte appended after each column's sort key. Strictly greater than the
/// text trailer marker (0x00), so a key whose text carries an unprintable
/// trailer always orders against its trailer-less twin at this byte,
/// before the RowId suffix can interfere.
pub const COLUMN_SEPARATOR: u8 = 0x01;
/// Ascending null flag; descending is its complement.
pub const NULL_FLAG_ASC: u8 = 0x00;
/// Ascending non-null flag for fixed-type columns.
pub const VALUE_FLAG_ASC: u8 = 0x80;

/// One column's membership in an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexColumn {
    pub column_number: u16,
    pub descending: bool,
}

/// A decoded leaf entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    bytes: Vec<u8>,
}

impl Entry {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Entry> {
        if bytes.len() < ROW_ID_SIZE {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "index entry shorter than its RowId suffix",
            )));
        }
        Ok(Entry { bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The key prefix: everything before the RowId suffix. Uniqueness is
    /// judged on these bytes.
    pub fn key(&self) -> &[u8] {
        &self.bytes[..self.bytes.len() - ROW_ID_SIZE]
    }

    pub fn row_id(&self) -> RowId {
        RowId::read_suffix(&self.bytes[self.bytes.len() - ROW_ID_SIZE..])
            .expect("suffix length checked at construction")
    }
}

fn flip_sign_be(bytes: &mut [u8]) {
    bytes[0] ^= 0x80;
}

fn f64_order_bytes(v: f64) -> [u8; 8] {
    let bits = v.to_bits();
    // Positive values get the sign bit flipped; negative values get every
    // bit flipped. Total order then matches numeric order.
    let ordered = if bits & 0x8000_0000_0000_0000 == 0 {
        bits ^ 0x8000_0000_0000_0000
    } else {
        !bits
    };
    ordered.to_be_bytes()
}

fn f32_order_bytes(v: f32) -> [u8; 4] {
    let bits = v.to_bits();
    let ordered = if bits & 0x8000_0000 == 0 {
        bits ^ 0x8000_0000
    } else {
        !bits
    };
    ordered.to_be_bytes()
}

/// Ascending sort key for one column value, without the separator.
fn encode_column_key(col: &Column, value: &Value, sort_order: SortOrder) -> Result<Vec<u8>> {
    if matches!(value, Value::Null) {
        return Ok(vec![NULL_FLAG_ASC]);
    }
    let mut out = Vec::new();
    match (col.data_type, value) {
        (DataType::Bool, Value::Bool(b)) => {
            out.push(VALUE_FLAG_ASC);
            out.push(if *b { 0xff } else { 0x00 });
        }
        (DataType::Byte, Value::Byte(v)) => {
            out.push(VALUE_FLAG_ASC);
            out.push(*v);
        }
        (DataType::Int, Value::Int(v)) => {
            out.push(VALUE_FLAG_ASC);
            let mut b = v.to_be_bytes();
            flip_sign_be(&mut b);
            out.extend_from_slice(&b);
        }
        (DataType::Long, Value::Long(v)) => {
            out.push(VALUE_FLAG_ASC);
            let mut b = v.to_be_bytes();
            flip_sign_be(&mut b);
            out.extend_from_slice(&b);
        }
        (DataType::Money, Value::Money(v)) => {
            out.push(VALUE_FLAG_ASC);
            let mut b = v.to_be_bytes();
            flip_sign_be(&mut b);
            out.extend_from_slice(&b);
        }
        (DataType::Float, Value::Float(v)) => {
            out.push(VALUE_FLAG_ASC);
            out.extend_from_slice(&f32_order_bytes(*v));
        }
        (DataType::Double, Value::Double(v)) => {
            out.push(VALUE_FLAG_ASC);
            out.extend_from_slice(&f64_order_bytes(*v));
        }
        (DataType::DateTime, Value::DateTime(days)) => {
            out.push(VALUE_FLAG_ASC);
            out.extend_from_slice(&f64_order_bytes(*days));
        }
        (DataType::DateTime, Value::Timestamp(ts)) => {
            out.push(VALUE_FLAG_ASC);
            out.extend_from_slice(&f64_order_bytes(value::date_time_to_days(*ts)));
        }
        (DataType::Guid, Value::Guid(g)) => {
            out.push(VALUE_FLAG_ASC);
            out.extend_from_slice(g);
        }
        (DataType::Binary, Value::Binary(b)) => {
            out.push(VALUE_FLAG_ASC);
            out.extend_from_slice(b);
        }
        (DataType::Text, Value::Text(s)) => {
            // The text encoder produces the full flagged form itself.
            return text_key::encode_text_key(s, sort_order, false);
        }
        (DataType::Memo | DataType::OleBlob | DataType::Numeric, _) => {
            return Err(Error::UnsupportedType(col.data_type));
        }
        (dt, v) => {
            return Err(Error::Schema(format!(
                "value {:?} does not fit indexed column {:?} of type {}",
                v, col.name, dt
            )));
        }
    }
    Ok(out)
}

/// Builds a full entry's bytes for `values` (aligned with `table_columns`)
/// plus `row_id`. Returns the bytes and whether every indexed column was
/// null.
pub fn encode_entry(
    table_columns: &[Column],
    index_columns: &[IndexColumn],
    values: &[Value],
    sort_order: SortOrder,
    row_id: RowId,
) -> Result<(Vec<u8>, bool)> {
    let mut out = Vec::new();
    let mut all_null = true;
    for ic in index_columns {
        let col = table_columns
            .iter()
            .find(|c| c.column_number == ic.column_number)
            .ok_or_else(|| {
                Error::Invariant(format!(
                    "index references unknown column number {}",
                    ic.column_number
                ))
            })?;
        let value = values.get(col.column_number as usize).ok_or_else(|| {
            Error::Invariant(format!(
                "no value supplied for indexed column {:?}",
                col.name
            ))
        })?;
        if !matches!(value, Value::Null) {
            all_null = false;
        }
        let mut key = if col.data_type == DataType::Text && !matches!(value, Value::Null) {
            match value {
                Value::Text(s) => text_key::encode_text_key(s, sort_order, ic.descending)?,
                v => {
                    return Err(Error::Schema(format!(
                        "value {:?} does not fit indexed column {:?} of type TEXT",
                        v, col.name
                    )))
                }
            }
        } else {
            let mut key = encode_column_key(col, value, sort_order)?;
            if ic.descending {
                for b in key.iter_mut() {
                    *b ^= 0xff;
                }
            }
            key
        };
        out.append(&mut key);
        out.push(COLUMN_SEPARATOR);
    }
    row_id.write_suffix(&mut out);
    Ok((out, all_null))
}

/// Projects a (column name, value) row onto the index's columns, aligned
/// with `index_columns`; absent if any indexed column is missing.
pub fn construct_index_row(
    table_columns: &[Column],
    index_columns: &[IndexColumn],
    row: &[(String, Value)],
) -> Option<Vec<Value>> {
    let mut out = Vec::with_capacity(index_columns.len());
    for ic in index_columns {
        let col = table_columns
            .iter()
            .find(|c| c.column_number == ic.column_number)?;
        let value = row
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(&col.name))?;
        out.push(value.1.clone());
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::assign_fixed_offsets;

    fn col(name: &str, number: u16, dt: DataType) -> Column {
        Column {
            name: String::from(name),
            column_number: number,
            data_type: dt,
            fixed_offset: 0,
            max_length: dt.variable_widths().map(|(d, _)| d).unwrap_or(0),
            auto_number: false,
            scale: 0,
            precision: 0,
            sort_order: 0,
        }
    }

    fn one_col_entry(dt: DataType, v: &Value, descending: bool) -> Vec<u8> {
        let mut cols = vec![col("k", 0, dt)];
        assign_fixed_offsets(&mut cols);
        let ics = [IndexColumn {
            column_number: 0,
            descending,
        }];
        encode_entry(&cols, &ics, &[v.clone()], SortOrder::Legacy, RowId::new(0, 0))
            .unwrap()
            .0
    }

    #[test]
    fn test_long_keys_order() {
        let cases: Vec<(i32, i32)> = vec![
            (-5, -1),
            (-1, 0),
            (0, 1),
            (1, 1000),
            (i32::MIN, i32::MAX),
        ];
        for (lo, hi) in cases {
            let a = one_col_entry(DataType::Long, &Value::Long(lo), false);
            let b = one_col_entry(DataType::Long, &Value::Long(hi), false);
            assert!(a < b, "{} should sort before {}", lo, hi);
        }
    }

    #[test]
    fn test_double_keys_order() {
        let seq = [-1000.5, -1.0, -0.25, 0.0, 0.25, 1.0, 9.75e10];
        for w in seq.windows(2) {
            let a = one_col_entry(DataType::Double, &Value::Double(w[0]), false);
            let b = one_col_entry(DataType::Double, &Value::Double(w[1]), false);
            assert!(a < b, "{} should sort before {}", w[0], w[1]);
        }
    }

    #[test]
    fn test_bool_two_byte_encoding() {
        let f = one_col_entry(DataType::Bool, &Value::Bool(false), false);
        let t = one_col_entry(DataType::Bool, &Value::Bool(true), false);
        // flag, value, separator, 5-byte suffix
        assert_eq!(f.len(), 2 + 1 + 5);
        assert_eq!(&f[..2], &[VALUE_FLAG_ASC, 0x00]);
        assert_eq!(&t[..2], &[VALUE_FLAG_ASC, 0xff]);
        assert!(f < t);
    }

    #[test]
    fn test_null_sorts_before_values_ascending() {
        let n = one_col_entry(DataType::Long, &Value::Null, false);
        let v = one_col_entry(DataType::Long, &Value::Long(i32::MIN), false);
        assert_eq!(n[0], NULL_FLAG_ASC);
        assert!(n < v);
    }

    #[test]
    fn test_descending_complements_and_reverses() {
        let a = one_col_entry(DataType::Long, &Value::Long(1), true);
        let b = one_col_entry(DataType::Long, &Value::Long(2), true);
        assert!(b < a);
        // Null flag complements to 0xff and sorts last under descending.
        let n = one_col_entry(DataType::Long, &Value::Null, true);
        assert!(a < n && b < n);
    }

    #[test]
    fn test_rowid_suffix_not_complemented() {
        let e = one_col_entry(DataType::Long, &Value::Long(1), true);
        let entry = Entry::from_bytes(e).unwrap();
        assert_eq!(entry.row_id(), RowId::new(0, 0));
    }

    #[test]
    fn test_entry_rowid_breaks_ties() {
        let mut cols = vec![col("k", 0, DataType::Long)];
        assign_fixed_offsets(&mut cols);
        let ics = [IndexColumn {
            column_number: 0,
            descending: false,
        }];
        let (a, _) = encode_entry(
            &cols,
            &ics,
            &[Value::Long(5)],
            SortOrder::Legacy,
            RowId::new(1, 0),
        )
        .unwrap();
        let (b, _) = encode_entry(
            &cols,
            &ics,
            &[Value::Long(5)],
            SortOrder::Legacy,
            RowId::new(2, 0),
        )
        .unwrap();
        assert!(a < b);
        let ea = Entry::from_bytes(a).unwrap();
        let eb = Entry::from_bytes(b).unwrap();
        assert_eq!(ea.key(), eb.key());
    }

    #[test]
    fn test_all_null_flag() {
        let mut cols = vec![col("a", 0, DataType::Long), col("b", 1, DataType::Text)];
        assign_fixed_offsets(&mut cols);
        let ics = [
            IndexColumn {
                column_number: 0,
                descending: false,
            },
            IndexColumn {
                column_number: 1,
                descending: false,
            },
        ];
        let (_, all_null) = encode_entry(
            &cols,
            &ics,
            &[Value::Null, Value::Null],
            SortOrder::Legacy,
            RowId::new(0, 0),
        )
        .unwrap();
        assert!(all_null);
        let (_, all_null) = encode_entry(
            &cols,
            &ics,
            &[Value::Long(1), Value::Null],
            SortOrder::Legacy,
            RowId::new(0, 0),
        )
        .unwrap();
        assert!(!all_null);
    }

    #[test]
    fn test_trailered_text_orders_independently_of_rowid() {
        let mut cols = vec![col("k", 0, DataType::Text)];
        assign_fixed_offsets(&mut cols);
        let ics = [IndexColumn {
            column_number: 0,
            descending: false,
        }];
        // A large RowId on the plain key must not let it slip below the
        // trailered key: the separator settles the comparison first.
        let (plain, _) = encode_entry(
            &cols,
            &ics,
            &[Value::Text(String::from("abc"))],
            SortOrder::Legacy,
            RowId::new(0x7f00_0000, 200),
        )
        .unwrap();
        let (trailered, _) = encode_entry(
            &cols,
            &ics,
            &[Value::Text(String::from("abc-"))],
            SortOrder::Legacy,
            RowId::new(0, 0),
        )
        .unwrap();
        assert!(trailered < plain);
    }

    #[test]
    fn test_text_collation_collapses_case_in_entries() {
        let a = one_col_entry(DataType::Text, &Value::Text(String::from("Apple")), false);
        let b = one_col_entry(DataType::Text, &Value::Text(String::from("apple")), false);
        assert_eq!(a, b);
    }

    #[test]
    fn test_long_value_types_rejected() {
        let mut cols = vec![col("m", 0, DataType::Memo)];
        assign_fixed_offsets(&mut cols);
        let ics = [IndexColumn {
            column_number: 0,
            descending: false,
        }];
        assert!(matches!(
            encode_entry(
                &cols,
                &ics,
                &[Value::Text(String::from("x"))],
                SortOrder::Legacy,
                RowId::new(0, 0)
            ),
            Err(Error::UnsupportedType(DataType::Memo))
        ));
    }

    #[test]
    fn test_construct_index_row() {
        let mut cols = vec![col("a", 0, DataType::Long), col("b", 1, DataType::Text)];
        assign_fixed_offsets(&mut cols);
        let ics = [IndexColumn {
            column_number: 1,
            descending: false,
        }];
        let row = vec![
            (String::from("a"), Value::Long(1)),
            (String::from("B"), Value::Text(String::from("x"))),
        ];
        let projected = construct_index_row(&cols, &ics, &row).unwrap();
        assert_eq!(projected, vec![Value::Text(String::from("x"))]);

        let partial = vec![(String::from("a"), Value::Long(1))];
        assert!(construct_index_row(&cols, &ics, &partial).is_none());
    }
}
