//! Column metadata and the per-type value codecs.
//!
//! A column knows how to read its value from the exact byte slice the row
//! codec hands it, and how to produce those bytes. Scalar codecs here are
//! the concrete coders behind the row layer; the row codec decides where
//! the slices live.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

use crate::data_type::DataType;
use crate::error::{Error, Result};
use crate::format::{Charset, Format};
use crate::value::{self, DateTimeType, Value};

const FLAG_FIXED_LENGTH: u8 = 0x01;
const FLAG_AUTO_NUMBER: u8 = 0x02;

/// Static metadata for one column.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub column_number: u16,
    pub data_type: DataType,
    /// Offset of this column's slot in the row's fixed-data area
    /// (fixed-size types only).
    pub fixed_offset: u16,
    /// Maximum stored bytes (variable types only).
    pub max_length: u16,
    pub auto_number: bool,
    pub scale: u8,
    pub precision: u8,
    /// Text sort order byte, mirroring the database default unless a
    /// column overrides it.
    pub sort_order: u8,
}

impl Column {
    pub fn is_variable_length(&self) -> bool {
        self.data_type.is_variable_length()
    }

    pub fn is_long_value(&self) -> bool {
        self.data_type.is_long_value()
    }

    /// Validates a column name against format limits.
    pub fn validate_name(format: &Format, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::InvalidIdentifier(
                name.to_string(),
                String::from("empty name"),
            ));
        }
        if name.len() > format.max_table_name_length {
            return Err(Error::InvalidIdentifier(
                name.to_string(),
                format!("longer than {} bytes", format.max_table_name_length),
            ));
        }
        if name.chars().any(|c| c.is_control()) {
            return Err(Error::InvalidIdentifier(
                name.to_string(),
                String::from("contains control characters"),
            ));
        }
        Ok(())
    }

    /// Writes a fixed-size value into its slot. `slot` is exactly
    /// `fixed_size()` bytes.
    pub fn write_fixed_value(&self, value: &Value, slot: &mut [u8]) -> Result<()> {
        debug_assert_eq!(Some(slot.len()), self.data_type.fixed_size());
        let mut c = Cursor::new(slot);
        match (self.data_type, value) {
            (DataType::Bool, Value::Bool(b)) => c.write_u8(if *b { 1 } else { 0 })?,
            (DataType::Byte, Value::Byte(v)) => c.write_u8(*v)?,
            (DataType::Int, Value::Int(v)) => c.write_i16::<LittleEndian>(*v)?,
            (DataType::Long, Value::Long(v)) => c.write_i32::<LittleEndian>(*v)?,
            (DataType::Money, Value::Money(v)) => c.write_i64::<LittleEndian>(*v)?,
            (DataType::Float, Value::Float(v)) => c.write_f32::<LittleEndian>(*v)?,
            (DataType::Double, Value::Double(v)) => c.write_f64::<LittleEndian>(*v)?,
            (DataType::DateTime, Value::DateTime(days)) => {
                c.write_f64::<LittleEndian>(*days)?
            }
            (DataType::DateTime, Value::Timestamp(ts)) => {
                c.write_f64::<LittleEndian>(value::date_time_to_days(*ts))?
            }
            (DataType::Guid, Value::Guid(g)) => c.write_all(g).map_err(Error::Io)?,
            (DataType::Numeric, _) => return Err(Error::UnsupportedType(self.data_type)),
            (dt, v) => {
                return Err(Error::Schema(format!(
                    "value {:?} does not fit column {:?} of type {}",
                    v, self.name, dt
                )))
            }
        }
        Ok(())
    }

    /// Reads a fixed-size value from its slot.
    pub fn read_fixed_value(&self, slot: &[u8], date_time_type: DateTimeType) -> Result<Value> {
        debug_assert_eq!(Some(slot.len()), self.data_type.fixed_size());
        let mut c = Cursor::new(slot);
        Ok(match self.data_type {
            DataType::Bool => Value::Bool(c.read_u8()? != 0),
            DataType::Byte => Value::Byte(c.read_u8()?),
            DataType::Int => Value::Int(c.read_i16::<LittleEndian>()?),
            DataType::Long => Value::Long(c.read_i32::<LittleEndian>()?),
            DataType::Money => Value::Money(c.read_i64::<LittleEndian>()?),
            DataType::Float => Value::Float(c.read_f32::<LittleEndian>()?),
            DataType::Double => Value::Double(c.read_f64::<LittleEndian>()?),
            DataType::DateTime => {
                let days = c.read_f64::<LittleEndian>()?;
                match date_time_type {
                    DateTimeType::Legacy => Value::DateTime(days),
                    DateTimeType::LocalDateTime => {
                        Value::Timestamp(value::date_time_from_days(days))
                    }
                }
            }
            DataType::Guid => {
                let mut g = [0_u8; 16];
                c.read_exact(&mut g)?;
                Value::Guid(g)
            }
            DataType::Numeric => return Err(Error::UnsupportedType(self.data_type)),
            _ => {
                return Err(Error::Invariant(format!(
                    "variable type {} read through the fixed path",
                    self.data_type
                )))
            }
        })
    }

    /// Encodes a variable-length value (TEXT, BINARY). Long-value columns
    /// go through the long-value store instead.
    pub fn encode_var_value(
        &self,
        format: &Format,
        value: &Value,
        charset: Charset,
    ) -> Result<Vec<u8>> {
        let bytes = match (self.data_type, value) {
            (DataType::Text, Value::Text(s)) => value::encode_text(s, charset)?,
            (DataType::Binary, Value::Binary(b)) => b.clone(),
            (dt, v) => {
                return Err(Error::Schema(format!(
                    "value {:?} does not fit column {:?} of type {}",
                    v, self.name, dt
                )))
            }
        };
        let limit = (self.max_length as usize).min(format.text_field_max_length);
        if self.data_type == DataType::Text && bytes.len() > limit {
            return Err(Error::Schema(format!(
                "text value of {} bytes exceeds column {:?} limit {}",
                bytes.len(),
                self.name,
                limit
            )));
        }
        if self.data_type == DataType::Binary && bytes.len() > self.max_length as usize {
            return Err(Error::Schema(format!(
                "binary value of {} bytes exceeds column {:?} limit {}",
                bytes.len(),
                self.name,
                self.max_length
            )));
        }
        Ok(bytes)
    }

    /// Decodes a variable-length value slice.
    pub fn decode_var_value(&self, bytes: &[u8], charset: Charset) -> Result<Value> {
        match self.data_type {
            DataType::Text => Ok(Value::Text(value::decode_text(bytes, charset)?)),
            DataType::Binary => Ok(Value::Binary(bytes.to_vec())),
            dt => Err(Error::Invariant(format!(
                "type {} decoded through the plain variable path",
                dt
            ))),
        }
    }

    // On-disk column definition:
    // Offset  Size  Description
    // 0       1     data type code
    // 1       2     column number
    // 3       2     fixed-data offset
    // 5       2     max length
    // 7       1     flags (bit0 fixed-length, bit1 auto-number)
    // 8       1     scale
    // 9       1     precision
    // 10      1     sort order
    // 11      2     name length
    // 13      n     name bytes (UTF-8)

    pub fn write_def(&self, out: &mut Vec<u8>) -> Result<()> {
        out.push(self.data_type.to_disk_code());
        out.write_u16::<LittleEndian>(self.column_number)?;
        out.write_u16::<LittleEndian>(self.fixed_offset)?;
        out.write_u16::<LittleEndian>(self.max_length)?;
        let mut flags = 0_u8;
        if !self.is_variable_length() {
            flags |= FLAG_FIXED_LENGTH;
        }
        if self.auto_number {
            flags |= FLAG_AUTO_NUMBER;
        }
        out.push(flags);
        out.push(self.scale);
        out.push(self.precision);
        out.push(self.sort_order);
        out.write_u16::<LittleEndian>(self.name.len() as u16)?;
        out.extend_from_slice(self.name.as_bytes());
        Ok(())
    }

    /// Reads one definition, returning the column and the bytes consumed.
    pub fn read_def(bytes: &[u8]) -> Result<(Column, usize)> {
        let mut c = Cursor::new(bytes);
        let data_type = DataType::from_disk_code(c.read_u8()?)?;
        let column_number = c.read_u16::<LittleEndian>()?;
        let fixed_offset = c.read_u16::<LittleEndian>()?;
        let max_length = c.read_u16::<LittleEndian>()?;
        let flags = c.read_u8()?;
        let scale = c.read_u8()?;
        let precision = c.read_u8()?;
        let sort_order = c.read_u8()?;
        let name_len = c.read_u16::<LittleEndian>()? as usize;
        let start = c.position() as usize;
        if start + name_len > bytes.len() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "column name runs past the definition area",
            )));
        }
        let name = String::from_utf8(bytes[start..start + name_len].to_vec()).map_err(|_| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "column name is not UTF-8",
            ))
        })?;
        let col = Column {
            name,
            column_number,
            data_type,
            fixed_offset,
            max_length,
            auto_number: flags & FLAG_AUTO_NUMBER != 0,
            scale,
            precision,
            sort_order,
        };
        Ok((col, start + name_len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::FileFormat;

    fn col(name: &str, dt: DataType) -> Column {
        Column {
            name: String::from(name),
            column_number: 0,
            data_type: dt,
            fixed_offset: 0,
            max_length: dt.variable_widths().map(|(d, _)| d).unwrap_or(0),
            auto_number: false,
            scale: 0,
            precision: 0,
            sort_order: 0,
        }
    }

    #[test]
    fn test_fixed_value_roundtrip() {
        let cases: Vec<(DataType, Value)> = vec![
            (DataType::Bool, Value::Bool(true)),
            (DataType::Byte, Value::Byte(200)),
            (DataType::Int, Value::Int(-12345)),
            (DataType::Long, Value::Long(7_000_000)),
            (DataType::Money, Value::Money(98_7654)),
            (DataType::Float, Value::Float(1.5)),
            (DataType::Double, Value::Double(-2.25)),
            (DataType::DateTime, Value::DateTime(44_000.5)),
            (DataType::Guid, Value::Guid([0xab; 16])),
        ];
        for (i, (dt, v)) in cases.iter().enumerate() {
            let c = col("c", *dt);
            let mut slot = vec![0_u8; dt.fixed_size().unwrap()];
            c.write_fixed_value(v, &mut slot)
                .unwrap_or_else(|e| panic!("case {}: write failed: {}", i, e));
            let back = c.read_fixed_value(&slot, DateTimeType::Legacy).unwrap();
            assert_eq!(&back, v, "case {}", i);
        }
    }

    #[test]
    fn test_fixed_value_little_endian_layout() {
        let c = col("n", DataType::Long);
        let mut slot = [0_u8; 4];
        c.write_fixed_value(&Value::Long(0x0403_0201), &mut slot)
            .unwrap();
        assert_eq!(slot, [0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let c = col("n", DataType::Long);
        let mut slot = [0_u8; 4];
        assert!(matches!(
            c.write_fixed_value(&Value::Text(String::from("x")), &mut slot),
            Err(Error::Schema(_))
        ));
    }

    #[test]
    fn test_date_time_read_shapes() {
        let c = col("d", DataType::DateTime);
        let mut slot = [0_u8; 8];
        c.write_fixed_value(&Value::DateTime(1.0), &mut slot).unwrap();
        let legacy = c.read_fixed_value(&slot, DateTimeType::Legacy).unwrap();
        assert_eq!(legacy, Value::DateTime(1.0));
        let local = c
            .read_fixed_value(&slot, DateTimeType::LocalDateTime)
            .unwrap();
        assert_eq!(
            local,
            Value::Timestamp(crate::value::date_time_from_days(1.0))
        );
    }

    #[test]
    fn test_var_value_limits() {
        let format = Format::for_file_format(FileFormat::V3);
        let mut c = col("t", DataType::Text);
        c.max_length = 4;
        assert!(c
            .encode_var_value(&format, &Value::Text(String::from("abcde")), Charset::Latin1)
            .is_err());
        let bytes = c
            .encode_var_value(&format, &Value::Text(String::from("abcd")), Charset::Latin1)
            .unwrap();
        assert_eq!(
            c.decode_var_value(&bytes, Charset::Latin1).unwrap(),
            Value::Text(String::from("abcd"))
        );
    }

    #[test]
    fn test_def_roundtrip() {
        let mut c = col("customer_name", DataType::Text);
        c.column_number = 3;
        c.max_length = 120;
        c.sort_order = 1;
        let mut out = Vec::new();
        c.write_def(&mut out).unwrap();
        let (back, used) = Column::read_def(&out).unwrap();
        assert_eq!(used, out.len());
        assert_eq!(back, c);
    }

    #[test]
    fn test_validate_name() {
        let format = Format::for_file_format(FileFormat::V4);
        assert!(Column::validate_name(&format, "ok_name").is_ok());
        assert!(Column::validate_name(&format, "").is_err());
        assert!(Column::validate_name(&format, "bad\nname").is_err());
        let long = "x".repeat(100);
        assert!(Column::validate_name(&format, &long).is_err());
    }
}
