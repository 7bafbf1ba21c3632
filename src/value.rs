//! Defines the runtime value enum and the text / date-time codecs.

use chrono::{Duration, NaiveDate, NaiveDateTime};
use enum_as_inner::EnumAsInner;

use crate::error::{Error, Result};
use crate::format::Charset;

/// Which shape date-time values take when read back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateTimeType {
    /// `Value::DateTime` carrying the raw fractional-day number.
    Legacy,
    /// `Value::Timestamp` carrying a calendar value.
    LocalDateTime,
}

/// Any value a column can hold.
#[derive(Debug, Clone, PartialEq, EnumAsInner)]
pub enum Value {
    Null,
    Bool(bool),
    Byte(u8),
    Int(i16),
    Long(i32),
    /// Fixed-point currency, stored as the scaled integer (4 implied
    /// decimal places).
    Money(i64),
    Float(f32),
    Double(f64),
    /// Days since 1899-12-30, the legacy date shape.
    DateTime(f64),
    /// The same instant as a calendar value, produced when the database
    /// was opened with `DateTimeType::LocalDateTime`.
    Timestamp(NaiveDateTime),
    Text(String),
    Binary(Vec<u8>),
    Guid([u8; 16]),
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(x) => write!(f, "{}", x),
            Value::Byte(x) => write!(f, "{}", x),
            Value::Int(x) => write!(f, "{}", x),
            Value::Long(x) => write!(f, "{}", x),
            Value::Money(x) => write!(f, "{}.{:04}", x / 10_000, (x % 10_000).abs()),
            Value::Float(x) => write!(f, "{}", x),
            Value::Double(x) => write!(f, "{}", x),
            Value::DateTime(x) => write!(f, "{}", x),
            Value::Timestamp(x) => write!(f, "{}", x),
            Value::Text(x) => write!(f, "{}", x),
            Value::Binary(_) => write!(f, "<BINARY>"),
            Value::Guid(g) => write!(f, "{}", hex::encode(g)),
        }
    }
}

/// Encodes text for storage under the given charset.
pub fn encode_text(s: &str, charset: Charset) -> Result<Vec<u8>> {
    match charset {
        Charset::Latin1 => {
            let mut out = Vec::with_capacity(s.len());
            for ch in s.chars() {
                let cp = ch as u32;
                if cp > 0xff {
                    return Err(Error::Schema(format!(
                        "character {:?} is not representable in Latin-1",
                        ch
                    )));
                }
                out.push(cp as u8);
            }
            Ok(out)
        }
        Charset::Utf16Le => {
            let mut out = Vec::with_capacity(s.len() * 2);
            for unit in s.encode_utf16() {
                out.extend_from_slice(&unit.to_le_bytes());
            }
            Ok(out)
        }
    }
}

/// Decodes stored text bytes under the given charset.
pub fn decode_text(bytes: &[u8], charset: Charset) -> Result<String> {
    match charset {
        Charset::Latin1 => Ok(bytes.iter().map(|b| *b as char).collect()),
        Charset::Utf16Le => {
            if bytes.len() % 2 != 0 {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "odd byte count in UTF-16LE text",
                )));
            }
            let units: Vec<u16> = bytes
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect();
            String::from_utf16(&units).map_err(|_| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "invalid UTF-16LE text",
                ))
            })
        }
    }
}

// The stored date value counts days (fractional) from this epoch.
fn date_epoch() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(1899, 12, 30)
        .expect("epoch date is valid")
        .and_hms_opt(0, 0, 0)
        .expect("epoch time is valid")
}

/// Converts the on-disk fractional-day value to a calendar timestamp.
pub fn date_time_from_days(days: f64) -> NaiveDateTime {
    let millis = (days * 86_400_000.0).round() as i64;
    date_epoch() + Duration::milliseconds(millis)
}

/// Converts a calendar timestamp to the on-disk fractional-day value.
pub fn date_time_to_days(ts: NaiveDateTime) -> f64 {
    let delta = ts - date_epoch();
    delta.num_milliseconds() as f64 / 86_400_000.0
}

#[test]
fn test_as_inner_accessors() {
    let v = Value::Long(42);
    assert_eq!(v.as_long(), Some(&42));
    assert!(v.as_text().is_none());
    let v = Value::Text(String::from("x"));
    assert_eq!(v.as_text().map(|s| s.as_str()), Some("x"));
    assert!(Value::Null.is_null());
}

#[test]
fn test_text_codec_latin1() {
    let bytes = encode_text("caf\u{e9}", Charset::Latin1).unwrap();
    assert_eq!(bytes, vec![b'c', b'a', b'f', 0xe9]);
    assert_eq!(decode_text(&bytes, Charset::Latin1).unwrap(), "caf\u{e9}");
    assert!(encode_text("\u{4e00}", Charset::Latin1).is_err());
}

#[test]
fn test_text_codec_utf16le() {
    let cases = vec!["", "alpha", "caf\u{e9}", "\u{4e00}\u{4e8c}"];
    for s in cases {
        let bytes = encode_text(s, Charset::Utf16Le).unwrap();
        assert_eq!(bytes.len(), s.encode_utf16().count() * 2);
        assert_eq!(decode_text(&bytes, Charset::Utf16Le).unwrap(), s);
    }
    assert!(decode_text(&[0x41], Charset::Utf16Le).is_err());
}

#[test]
fn test_date_time_days_roundtrip() {
    let ts = NaiveDate::from_ymd_opt(2020, 6, 15)
        .unwrap()
        .and_hms_opt(12, 30, 45)
        .unwrap();
    let days = date_time_to_days(ts);
    assert_eq!(date_time_from_days(days), ts);
    // Day zero is the epoch itself.
    assert_eq!(date_time_from_days(0.0), date_epoch());
    // One day past the epoch.
    assert_eq!(
        date_time_from_days(1.0),
        date_epoch() + Duration::days(1)
    );
}

#[test]
fn test_money_display() {
    assert_eq!(format!("{}", Value::Money(1_2345)), "1.2345");
    assert_eq!(format!("{}", Value::Money(50_000)), "5.0000");
}
