//! Row identifiers: a (page number, row number) pair with a total order.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::cmp::Ordering;
use std::io::Cursor;

use crate::error::Result;
use crate::page_channel::PageNum;

/// Identifies one row. Two sentinels, `FIRST` and `LAST`, sort strictly
/// before/after every valid RowId. A valid RowId has both fields >= 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RowId {
    pub page_number: PageNum,
    pub row_number: i32,
}

/// On-disk size of a RowId inside an index entry.
pub const ROW_ID_SIZE: usize = 5;

impl RowId {
    /// Sorts before every valid RowId.
    pub const FIRST: RowId = RowId {
        page_number: -1,
        row_number: 0,
    };
    /// Sorts after every valid RowId.
    pub const LAST: RowId = RowId {
        page_number: -2,
        row_number: 0,
    };

    pub fn new(page_number: PageNum, row_number: i32) -> RowId {
        RowId {
            page_number,
            row_number,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.page_number >= 0 && self.row_number >= 0
    }

    /// Maps the sentinels onto fixed extrema so lexicographic comparison
    /// on (comparable page, row) realizes the documented order.
    fn comparable_page_number(&self) -> i64 {
        match self.page_number {
            -1 => i64::MIN,
            -2 => i64::MAX,
            n => n as i64,
        }
    }

    /// Index-entry suffix: big-endian page then row byte, so byte order
    /// equals (page, row) order.
    pub fn write_suffix(&self, out: &mut Vec<u8>) {
        out.write_u32::<BigEndian>(self.page_number as u32)
            .expect("vec write cannot fail");
        out.push(self.row_number as u8);
    }

    pub fn read_suffix(bytes: &[u8]) -> Result<RowId> {
        let mut c = Cursor::new(bytes);
        let page_number = c.read_u32::<BigEndian>()? as PageNum;
        let row_number = c.read_u8()? as i32;
        Ok(RowId::new(page_number, row_number))
    }
}

impl Ord for RowId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.comparable_page_number()
            .cmp(&other.comparable_page_number())
            .then(self.row_number.cmp(&other.row_number))
    }
}

impl PartialOrd for RowId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for RowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(page {}, row {})", self.page_number, self.row_number)
    }
}

#[test]
fn test_sentinels_bracket_all_valid_rowids() {
    let cases = vec![
        RowId::new(0, 0),
        RowId::new(0, 255),
        RowId::new(17, 3),
        RowId::new(i32::MAX, i32::MAX),
    ];
    for r in cases {
        assert!(RowId::FIRST < r, "FIRST should sort before {}", r);
        assert!(r < RowId::LAST, "{} should sort before LAST", r);
    }
    assert!(RowId::FIRST < RowId::LAST);
}

#[test]
fn test_ordering_lexicographic() {
    assert!(RowId::new(1, 9) < RowId::new(2, 0));
    assert!(RowId::new(2, 0) < RowId::new(2, 1));
    assert_eq!(RowId::new(3, 3).cmp(&RowId::new(3, 3)), Ordering::Equal);
}

#[test]
fn test_ordering_antisymmetric_transitive() {
    let a = RowId::new(1, 1);
    let b = RowId::new(1, 2);
    let c = RowId::new(2, 0);
    assert_eq!(a.cmp(&b), b.cmp(&a).reverse());
    assert!(a < b && b < c && a < c);
}

#[test]
fn test_suffix_roundtrip_and_byte_order() {
    let a = RowId::new(1, 200);
    let b = RowId::new(2, 0);
    let mut ab = Vec::new();
    a.write_suffix(&mut ab);
    let mut bb = Vec::new();
    b.write_suffix(&mut bb);
    assert_eq!(ab.len(), ROW_ID_SIZE);
    // Byte-lexicographic order matches RowId order.
    assert!(ab < bb);
    assert_eq!(RowId::read_suffix(&ab).unwrap(), a);
    assert_eq!(RowId::read_suffix(&bb).unwrap(), b);
}
