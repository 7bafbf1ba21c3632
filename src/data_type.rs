//! Defines the column data types the file format stores, and conversion
//! to and from their on-disk codes and external SQL type numbers.

use std::str::FromStr;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Bool,
    Byte,
    Int,
    Long,
    Money,
    Float,
    Double,
    DateTime,
    Binary,
    Text,
    OleBlob,
    Memo,
    Guid,
    Numeric,
}

impl DataType {
    /// On-disk numeric code stored in a column definition.
    pub fn to_disk_code(self) -> u8 {
        match self {
            DataType::Bool => 0x01,
            DataType::Byte => 0x02,
            DataType::Int => 0x03,
            DataType::Long => 0x04,
            DataType::Money => 0x05,
            DataType::Float => 0x06,
            DataType::Double => 0x07,
            DataType::DateTime => 0x08,
            DataType::Binary => 0x09,
            DataType::Text => 0x0a,
            DataType::OleBlob => 0x0b,
            DataType::Memo => 0x0c,
            DataType::Guid => 0x0f,
            DataType::Numeric => 0x10,
        }
    }

    pub fn from_disk_code(code: u8) -> Result<DataType> {
        match code {
            0x01 => Ok(DataType::Bool),
            0x02 => Ok(DataType::Byte),
            0x03 => Ok(DataType::Int),
            0x04 => Ok(DataType::Long),
            0x05 => Ok(DataType::Money),
            0x06 => Ok(DataType::Float),
            0x07 => Ok(DataType::Double),
            0x08 => Ok(DataType::DateTime),
            0x09 => Ok(DataType::Binary),
            0x0a => Ok(DataType::Text),
            0x0b => Ok(DataType::OleBlob),
            0x0c => Ok(DataType::Memo),
            0x0f => Ok(DataType::Guid),
            0x10 => Ok(DataType::Numeric),
            _ => Err(Error::UnrecognizedTypeCode(code)),
        }
    }

    /// Byte width of a fixed-size type; `None` for variable types.
    pub fn fixed_size(self) -> Option<usize> {
        match self {
            DataType::Bool => Some(1),
            DataType::Byte => Some(1),
            DataType::Int => Some(2),
            DataType::Long => Some(4),
            DataType::Money => Some(8),
            DataType::Float => Some(4),
            DataType::Double => Some(8),
            DataType::DateTime => Some(8),
            DataType::Guid => Some(16),
            DataType::Numeric => Some(17),
            DataType::Binary | DataType::Text | DataType::OleBlob | DataType::Memo => None,
        }
    }

    pub fn is_variable_length(self) -> bool {
        self.fixed_size().is_none()
    }

    /// (default, maximum) byte widths for variable types.
    pub fn variable_widths(self) -> Option<(u16, u16)> {
        match self {
            DataType::Binary => Some((255, 255)),
            DataType::Text => Some((100, 510)),
            // Long values store a 12-byte descriptor in the row; content
            // capacity is bounded by the page chain, not the row.
            DataType::OleBlob | DataType::Memo => Some((12, u16::MAX)),
            _ => None,
        }
    }

    /// True when content lives on separate LONG_VALUE pages.
    pub fn is_long_value(self) -> bool {
        matches!(self, DataType::OleBlob | DataType::Memo)
    }

    pub fn is_text(self) -> bool {
        matches!(self, DataType::Text | DataType::Memo)
    }

    /// (max scale, max precision) for scaled types.
    pub fn scale_precision_bounds(self) -> Option<(u8, u8)> {
        match self {
            DataType::Money => Some((4, 19)),
            DataType::Numeric => Some((28, 28)),
            _ => None,
        }
    }

    /// External SQL type number (java.sql.Types values), where one exists.
    pub fn to_sql_type(self) -> Option<i32> {
        match self {
            DataType::Bool => Some(-7),      // BIT
            DataType::Byte => Some(-6),      // TINYINT
            DataType::Int => Some(5),        // SMALLINT
            DataType::Long => Some(4),       // INTEGER
            DataType::Money => Some(3),      // DECIMAL
            DataType::Float => Some(7),      // REAL
            DataType::Double => Some(8),     // DOUBLE
            DataType::DateTime => Some(93),  // TIMESTAMP
            DataType::Binary => Some(-3),    // VARBINARY
            DataType::Text => Some(12),      // VARCHAR
            DataType::OleBlob => Some(-4),   // LONGVARBINARY
            DataType::Memo => Some(-1),      // LONGVARCHAR
            DataType::Numeric => Some(2),    // NUMERIC
            DataType::Guid => None,
        }
    }

    pub fn from_sql_type(sql_type: i32) -> Result<DataType> {
        match sql_type {
            -7 => Ok(DataType::Bool),
            -6 => Ok(DataType::Byte),
            5 => Ok(DataType::Int),
            4 => Ok(DataType::Long),
            3 => Ok(DataType::Money),
            7 => Ok(DataType::Float),
            8 | 6 => Ok(DataType::Double),
            93 | 91 | 92 => Ok(DataType::DateTime),
            -3 | -2 => Ok(DataType::Binary),
            12 | 1 => Ok(DataType::Text),
            -4 => Ok(DataType::OleBlob),
            -1 => Ok(DataType::Memo),
            2 => Ok(DataType::Numeric),
            _ => Err(Error::UnsupportedSqlType(sql_type)),
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DataType::Bool => "BOOL",
            DataType::Byte => "BYTE",
            DataType::Int => "INT",
            DataType::Long => "LONG",
            DataType::Money => "MONEY",
            DataType::Float => "FLOAT",
            DataType::Double => "DOUBLE",
            DataType::DateTime => "DATETIME",
            DataType::Binary => "BINARY",
            DataType::Text => "TEXT",
            DataType::OleBlob => "OLE",
            DataType::Memo => "MEMO",
            DataType::Guid => "GUID",
            DataType::Numeric => "NUMERIC",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseDataTypeError;

impl FromStr for DataType {
    type Err = ParseDataTypeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "BOOL" => Ok(DataType::Bool),
            "BYTE" => Ok(DataType::Byte),
            "INT" => Ok(DataType::Int),
            "LONG" => Ok(DataType::Long),
            "MONEY" => Ok(DataType::Money),
            "FLOAT" => Ok(DataType::Float),
            "DOUBLE" => Ok(DataType::Double),
            "DATETIME" => Ok(DataType::DateTime),
            "BINARY" => Ok(DataType::Binary),
            "TEXT" => Ok(DataType::Text),
            "OLE" => Ok(DataType::OleBlob),
            "MEMO" => Ok(DataType::Memo),
            "GUID" => Ok(DataType::Guid),
            "NUMERIC" => Ok(DataType::Numeric),
            _ => Err(ParseDataTypeError),
        }
    }
}

#[test]
fn test_disk_code_roundtrip() {
    let all = [
        DataType::Bool,
        DataType::Byte,
        DataType::Int,
        DataType::Long,
        DataType::Money,
        DataType::Float,
        DataType::Double,
        DataType::DateTime,
        DataType::Binary,
        DataType::Text,
        DataType::OleBlob,
        DataType::Memo,
        DataType::Guid,
        DataType::Numeric,
    ];
    for dt in all {
        assert_eq!(DataType::from_disk_code(dt.to_disk_code()).unwrap(), dt);
    }
    assert!(matches!(
        DataType::from_disk_code(0x7f),
        Err(Error::UnrecognizedTypeCode(0x7f))
    ));
}

#[test]
fn test_sql_type_map_is_bidirectional_where_mapped() {
    for dt in [DataType::Long, DataType::Text, DataType::Memo, DataType::Bool] {
        let sql = dt.to_sql_type().unwrap();
        assert_eq!(DataType::from_sql_type(sql).unwrap(), dt);
    }
    assert!(DataType::Guid.to_sql_type().is_none());
    assert!(matches!(
        DataType::from_sql_type(9999),
        Err(Error::UnsupportedSqlType(9999))
    ));
}

#[test]
fn test_fixed_and_variable_widths() {
    assert_eq!(DataType::Long.fixed_size(), Some(4));
    assert_eq!(DataType::Guid.fixed_size(), Some(16));
    assert!(DataType::Text.is_variable_length());
    assert_eq!(DataType::Text.variable_widths(), Some((100, 510)));
    assert!(DataType::Memo.is_long_value());
    assert!(!DataType::Binary.is_long_value());
}

#[test]
fn test_from_str() {
    assert_eq!(DataType::from_str("text").unwrap(), DataType::Text);
    assert_eq!(DataType::from_str("LONG").unwrap(), DataType::Long);
    assert!(DataType::from_str("bogus").is_err());
}
