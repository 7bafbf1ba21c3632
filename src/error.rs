//! Defines the error taxonomy surfaced at the crate boundary.
//!
//! Internal layers construct these directly; I/O failures convert via `From`.

use crate::data_type::DataType;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Error accessing database file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed page {page_number}: {reason}")]
    MalformedPage { page_number: i32, reason: String },
    #[error("Unrecognized page type byte {type_byte:#04x} on page {page_number}.")]
    UnrecognizedPageType { page_number: i32, type_byte: u8 },
    #[error("The magic bytes for this file are wrong.")]
    WrongMagic,
    #[error("Unrecognized format version byte {0:#04x}.")]
    UnrecognizedFormatVersion(u8),

    #[error("Schema error: {0}")]
    Schema(String),
    #[error("Duplicate name {0:?}.")]
    DuplicateName(String),
    #[error("Invalid identifier {0:?}: {1}")]
    InvalidIdentifier(String, String),
    #[error("Too many columns; the format allows at most {max}.")]
    TooManyColumns { max: usize },

    #[error("Data type {0} is not usable here.")]
    UnsupportedType(DataType),
    #[error("No data type is mapped to SQL type {0}.")]
    UnsupportedSqlType(i32),
    #[error("Unrecognized data type code {0:#04x}.")]
    UnrecognizedTypeCode(u8),

    #[error("Duplicate key on unique index {index_name:?}.")]
    DuplicateKey { index_name: String },
    #[error("Row id (page {page_number}, row {row_number}) does not address a live row.")]
    DanglingRowId { page_number: i32, row_number: i32 },

    #[error("Database handle is closed.")]
    Closed,
    #[error("finish_write called without a matching start_write.")]
    UnbalancedWriteGuard,
    #[error("Write attempted on a read-only channel.")]
    ReadOnly,
    #[error("Cursor is no longer valid and cannot recover: {0}")]
    StaleCursor(String),
    #[error("Internal invariant violated: {0}")]
    Invariant(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for the fatal class of errors after which the handle refuses
    /// further writes (spec'd invariant breakage mid-write).
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Invariant(_))
    }
}

#[test]
fn test_error_display() {
    let e = Error::UnrecognizedPageType {
        page_number: 7,
        type_byte: 0x9c,
    };
    assert_eq!(
        format!("{}", e),
        "Unrecognized page type byte 0x9c on page 7."
    );
    let e = Error::DuplicateKey {
        index_name: String::from("PrimaryKey"),
    };
    assert!(format!("{}", e).contains("PrimaryKey"));
}

#[test]
fn test_io_error_converts() {
    fn fails() -> Result<()> {
        let r: std::result::Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof"));
        r?;
        Ok(())
    }
    assert!(matches!(fails(), Err(Error::Io(_))));
}
