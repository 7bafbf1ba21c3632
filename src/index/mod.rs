//! The index subsystem.
//!
//! A physical B-tree (`data::IndexData`) stores order-preserving encoded
//! keys; any number of logical indexes (`Index`) share one tree, differing
//! only in name and type tag. Submodules:
//! * `entry` encodes column tuples into sort keys,
//! * `text_key` encodes text under the legacy/general collations,
//! * `data` is the B-tree itself,
//! * `cursor` walks entry ranges with mod-count validation.

pub mod cursor;
pub mod data;
pub mod entry;
pub mod text_key;

/// Logical index type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexType {
    Plain,
    Primary,
    Foreign,
}

impl IndexType {
    pub fn to_disk_byte(self) -> u8 {
        match self {
            IndexType::Plain => 0,
            IndexType::Primary => 1,
            IndexType::Foreign => 2,
        }
    }

    pub fn from_disk_byte(b: u8) -> crate::error::Result<IndexType> {
        match b {
            0 => Ok(IndexType::Plain),
            1 => Ok(IndexType::Primary),
            2 => Ok(IndexType::Foreign),
            _ => Err(crate::error::Error::Schema(format!(
                "unrecognized index type byte {:#04x}",
                b
            ))),
        }
    }
}

/// A named view over a shared index-data tree. The `index_data_number`
/// keys into the table's arena of `IndexData` instances; several logical
/// indexes may carry the same number.
#[derive(Debug, Clone)]
pub struct Index {
    pub name: String,
    /// 0-based sequence within the owning table; identity for equality.
    pub index_number: u16,
    pub index_type: IndexType,
    pub index_data_number: u16,
}

impl Index {
    pub fn is_primary_key(&self) -> bool {
        self.index_type == IndexType::Primary
    }

    pub fn is_foreign_key(&self) -> bool {
        self.index_type == IndexType::Foreign
    }
}

impl PartialEq for Index {
    fn eq(&self, other: &Self) -> bool {
        self.index_number == other.index_number
    }
}

impl Eq for Index {}

impl std::fmt::Display for Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Index[#{} {:?} {:?} -> data {}]",
            self.index_number, self.name, self.index_type, self.index_data_number
        )
    }
}

#[test]
fn test_index_type_roundtrip() {
    for t in [IndexType::Plain, IndexType::Primary, IndexType::Foreign] {
        assert_eq!(IndexType::from_disk_byte(t.to_disk_byte()).unwrap(), t);
    }
    assert!(IndexType::from_disk_byte(9).is_err());
}

#[test]
fn test_logical_index_equality_is_by_number() {
    let a = Index {
        name: String::from("one"),
        index_number: 0,
        index_type: IndexType::Plain,
        index_data_number: 0,
    };
    let b = Index {
        name: String::from("other"),
        index_number: 0,
        index_type: IndexType::Primary,
        index_data_number: 1,
    };
    let c = Index {
        name: String::from("one"),
        index_number: 1,
        index_type: IndexType::Plain,
        index_data_number: 0,
    };
    assert_eq!(a, b);
    assert_ne!(a, c);
    assert!(a.to_string().contains("\"one\""));
}
