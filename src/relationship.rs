//! Relationships between two tables: aligned column lists plus a flag
//! word. Immutable after construction.

pub mod flags {
    pub const ONE_TO_ONE: u32 = 0x0000_0001;
    pub const NO_REFERENTIAL_INTEGRITY: u32 = 0x0000_0002;
    pub const CASCADE_UPDATES: u32 = 0x0000_0100;
    pub const CASCADE_DELETES: u32 = 0x0000_1000;
    pub const LEFT_OUTER_JOIN: u32 = 0x0100_0000;
    pub const RIGHT_OUTER_JOIN: u32 = 0x0200_0000;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relationship {
    name: String,
    from_table: String,
    to_table: String,
    from_columns: Vec<String>,
    to_columns: Vec<String>,
    flag_word: u32,
}

impl Relationship {
    pub fn new(
        name: String,
        from_table: String,
        to_table: String,
        from_columns: Vec<String>,
        to_columns: Vec<String>,
        flag_word: u32,
    ) -> Relationship {
        assert_eq!(
            from_columns.len(),
            to_columns.len(),
            "relationship column lists must align"
        );
        Relationship {
            name,
            from_table,
            to_table,
            from_columns,
            to_columns,
            flag_word,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn from_table(&self) -> &str {
        &self.from_table
    }

    pub fn to_table(&self) -> &str {
        &self.to_table
    }

    pub fn from_columns(&self) -> &[String] {
        &self.from_columns
    }

    pub fn to_columns(&self) -> &[String] {
        &self.to_columns
    }

    pub fn flag_word(&self) -> u32 {
        self.flag_word
    }

    pub fn is_one_to_one(&self) -> bool {
        self.flag_word & flags::ONE_TO_ONE != 0
    }

    /// Referential integrity is on unless the flag word opts out.
    pub fn has_referential_integrity(&self) -> bool {
        self.flag_word & flags::NO_REFERENTIAL_INTEGRITY == 0
    }

    pub fn cascades_updates(&self) -> bool {
        self.flag_word & flags::CASCADE_UPDATES != 0
    }

    pub fn cascades_deletes(&self) -> bool {
        self.flag_word & flags::CASCADE_DELETES != 0
    }

    pub fn is_left_outer_join(&self) -> bool {
        self.flag_word & flags::LEFT_OUTER_JOIN != 0
    }

    pub fn is_right_outer_join(&self) -> bool {
        self.flag_word & flags::RIGHT_OUTER_JOIN != 0
    }
}

#[test]
fn test_flag_accessors() {
    let rel = Relationship::new(
        String::from("OrdersCustomers"),
        String::from("Customers"),
        String::from("Orders"),
        vec![String::from("id")],
        vec![String::from("customer_id")],
        flags::CASCADE_DELETES | flags::LEFT_OUTER_JOIN,
    );
    assert!(rel.has_referential_integrity());
    assert!(rel.cascades_deletes());
    assert!(!rel.cascades_updates());
    assert!(rel.is_left_outer_join());
    assert!(!rel.is_right_outer_join());
    assert!(!rel.is_one_to_one());
}

#[test]
fn test_no_integrity_flag_inverts() {
    let rel = Relationship::new(
        String::from("r"),
        String::from("a"),
        String::from("b"),
        vec![],
        vec![],
        flags::NO_REFERENTIAL_INTEGRITY,
    );
    assert!(!rel.has_referential_integrity());
}

#[test]
#[should_panic(expected = "column lists must align")]
fn test_misaligned_columns_panic() {
    let _ = Relationship::new(
        String::from("r"),
        String::from("a"),
        String::from("b"),
        vec![String::from("x")],
        vec![],
        0,
    );
}
