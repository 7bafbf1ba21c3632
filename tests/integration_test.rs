use anyhow::Result;
use streaming_iterator::StreamingIterator;

use mdbfile::data_type::DataType;
use mdbfile::index::IndexType;
use mdbfile::{ColumnSpec, CreateOptions, Database, IndexSpec, OpenOptions, Row, Value};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn collect_rows(table: &mdbfile::Table) -> Result<Vec<Row>> {
    let mut rows = Vec::new();
    let mut cursor = table.row_cursor();
    while let Some((_, row)) = table.next_row(&mut cursor)? {
        rows.push(row);
    }
    Ok(rows)
}

#[test]
fn test_create_insert_readback_numeric() -> Result<()> {
    init_logging();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("scenario1.db");
    {
        let mut db = Database::create(&path, CreateOptions::default())?;
        let mut t = db.create_table(
            "T",
            vec![
                ColumnSpec::new("a", DataType::Long),
                ColumnSpec::new("b", DataType::Text).with_max_length(50),
            ],
            Vec::new(),
        )?;
        t.add_row(&Row::new().with("a", Value::Long(1)).with("b", Value::Text("alpha".into())))?;
        t.add_row(&Row::new().with("a", Value::Long(2)).with("b", Value::Text("Beta".into())))?;
        t.add_row(&Row::new().with("a", Value::Long(3)).with("b", Value::Text("gamma".into())))?;
        db.close()?;
    }

    let db = Database::open(&path, OpenOptions::default())?;
    let t = db.open_table("T")?;
    assert_eq!(t.get_row_count(), 3);
    let rows = collect_rows(&t)?;
    let expected = vec![(1, "alpha"), (2, "Beta"), (3, "gamma")];
    assert_eq!(rows.len(), expected.len());
    for (row, (a, b)) in rows.iter().zip(expected) {
        assert_eq!(row.get("a"), Some(&Value::Long(a)));
        assert_eq!(row.get("b"), Some(&Value::Text(b.to_string())));
    }
    Ok(())
}

#[test]
fn test_streaming_iterator_matches_cursor_scan() -> Result<()> {
    let mut db = Database::create_channel(
        Box::new(mdbfile::byte_channel::MemoryChannel::new()),
        CreateOptions::default(),
    )?;
    let mut t = db.create_table(
        "s",
        vec![ColumnSpec::new("n", DataType::Long)],
        Vec::new(),
    )?;
    for i in 0..10 {
        t.add_row(&Row::new().with("n", Value::Long(i)))?;
    }
    let mut it = t.streaming_iterator();
    let mut seen = Vec::new();
    loop {
        it.advance();
        match it.get() {
            Some(row) => seen.push(*row.get("n").unwrap().as_long().unwrap()),
            None => break,
        }
    }
    assert!(it.error().is_none());
    assert_eq!(seen, (0..10).collect::<Vec<i32>>());
    Ok(())
}

#[test]
fn test_text_index_ordering_under_legacy_collation() -> Result<()> {
    init_logging();
    let mut db = Database::create_channel(
        Box::new(mdbfile::byte_channel::MemoryChannel::new()),
        CreateOptions::default(),
    )?;
    let mut t = db.create_table(
        "words",
        vec![ColumnSpec::new("w", DataType::Text).with_max_length(50)],
        vec![IndexSpec {
            name: "by_word".into(),
            index_type: IndexType::Plain,
            unique: true,
            ignore_nulls: false,
            columns: vec![("w".into(), false)],
        }],
    )?;
    t.add_row(&Row::new().with("w", Value::Text("banana".into())))?;
    t.add_row(&Row::new().with("w", Value::Text("Apple".into())))?;
    t.add_row(&Row::new().with("w", Value::Text("cherry".into())))?;

    // Uniqueness collapses case: "apple" duplicates "Apple".
    let err = t
        .add_row(&Row::new().with("w", Value::Text("apple".into())))
        .unwrap_err();
    assert!(
        matches!(err, mdbfile::Error::DuplicateKey { ref index_name } if index_name.as_str() == "by_word")
    );
    assert_eq!(t.get_row_count(), 3);

    // The full-range cursor walks the collation order.
    let mut cursor = t.index_cursor("by_word", None, true, None, true)?;
    let mut row_ids = Vec::new();
    while let Some(entry) = t.next_index_entry(&mut cursor)? {
        row_ids.push(entry.row_id());
    }
    let mut ordered = Vec::new();
    for id in row_ids {
        let row = t.get_row(id)?;
        ordered.push(row.get("w").unwrap().as_text().unwrap().clone());
    }
    assert_eq!(ordered, vec!["Apple", "banana", "cherry"]);
    Ok(())
}

#[test]
fn test_long_value_roundtrip_and_free_map() -> Result<()> {
    init_logging();
    let mut db = Database::create_channel(
        Box::new(mdbfile::byte_channel::MemoryChannel::new()),
        CreateOptions::default(),
    )?;
    let mut t = db.create_table(
        "notes",
        vec![
            ColumnSpec::new("id", DataType::Long),
            ColumnSpec::new("body", DataType::Memo),
        ],
        Vec::new(),
    )?;
    // 20,000 bytes of ASCII so both charsets store one byte per char.
    let body: String = (0..20_000).map(|i| (b'a' + (i % 26) as u8) as char).collect();
    let id = t.add_row(
        &Row::new()
            .with("id", Value::Long(7))
            .with("body", Value::Text(body.clone())),
    )?;

    let row = t.get_row(id)?;
    assert_eq!(row.get("body"), Some(&Value::Text(body)));

    // The content pages belong to the table while the row is live.
    let owned_before: Vec<i32> = t.owned_pages().page_numbers();
    t.delete_row(id)?;
    let owned_after: Vec<i32> = t.owned_pages().page_numbers();
    let freed: Vec<i32> = owned_before
        .iter()
        .copied()
        .filter(|p| !owned_after.contains(p))
        .collect();
    assert!(!freed.is_empty(), "long value pages should leave the owned map");
    for p in &freed {
        assert!(t.free_space_pages().contains(*p));
    }
    assert_eq!(t.get_row_count(), 0);
    Ok(())
}

#[test]
fn test_update_grow_migrates_and_keeps_index_consistent() -> Result<()> {
    let mut db = Database::create_channel(
        Box::new(mdbfile::byte_channel::MemoryChannel::new()),
        CreateOptions::default(),
    )?;
    let mut t = db.create_table(
        "docs",
        vec![
            ColumnSpec::new("id", DataType::Long),
            ColumnSpec::new("title", DataType::Text).with_max_length(400),
        ],
        vec![IndexSpec {
            name: "pk".into(),
            index_type: IndexType::Primary,
            unique: true,
            ignore_nulls: false,
            columns: vec![("id".into(), false)],
        }],
    )?;
    let id = t.add_row(&Row::new().with("id", Value::Long(1)).with("title", Value::Text("x".into())))?;
    // Fill the rest of the page so growth cannot stay in place.
    for i in 2..40 {
        t.add_row(
            &Row::new()
                .with("id", Value::Long(i))
                .with("title", Value::Text("y".repeat(90))),
        )?;
    }
    let grown = "z".repeat(150);
    let new_id = t.update_row(id, &Row::new().with("title", Value::Text(grown.clone())))?;

    // The old id still resolves through the pointer row.
    let via_old = t.get_row(id)?;
    assert_eq!(via_old.get("title"), Some(&Value::Text(grown.clone())));
    let via_new = t.get_row(new_id)?;
    assert_eq!(via_new.get("id"), Some(&Value::Long(1)));

    // A second insert with id 1 still violates the primary key.
    assert!(matches!(
        t.add_row(&Row::new().with("id", Value::Long(1))),
        Err(mdbfile::Error::DuplicateKey { .. })
    ));
    Ok(())
}

#[test]
fn test_in_memory_channel_mirrors_on_disk_channel() -> Result<()> {
    init_logging();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("golden.db");
    {
        let mut db = Database::create(&path, CreateOptions::default())?;
        let mut t1 = db.create_table(
            "alpha",
            vec![
                ColumnSpec::new("n", DataType::Long),
                ColumnSpec::new("s", DataType::Text).with_max_length(80),
            ],
            Vec::new(),
        )?;
        for i in 0..200 {
            t1.add_row(
                &Row::new()
                    .with("n", Value::Long(i))
                    .with("s", Value::Text(format!("row number {}", i))),
            )?;
        }
        let mut t2 = db.create_table(
            "beta",
            vec![
                ColumnSpec::new("flag", DataType::Bool),
                ColumnSpec::new("score", DataType::Double),
            ],
            Vec::new(),
        )?;
        for i in 0..50 {
            t2.add_row(
                &Row::new()
                    .with("flag", Value::Bool(i % 3 == 0))
                    .with("score", Value::Double(i as f64 / 4.0)),
            )?;
        }
        db.close()?;
    }

    let bytes = std::fs::read(&path)?;
    let disk_db = Database::open(&path, OpenOptions::default())?;
    let mem_db = Database::open_bytes(&bytes, OpenOptions::default())?;

    assert_eq!(disk_db.table_names()?, mem_db.table_names()?);
    for name in disk_db.table_names()? {
        let dt = disk_db.open_table(&name)?;
        let mt = mem_db.open_table(&name)?;
        let disk_rows = collect_rows(&dt)?;
        let mem_rows = collect_rows(&mt)?;
        assert_eq!(disk_rows, mem_rows, "table {:?} differs between channels", name);
    }
    Ok(())
}

#[test]
fn test_shared_index_data_between_logical_indexes() -> Result<()> {
    let mut db = Database::create_channel(
        Box::new(mdbfile::byte_channel::MemoryChannel::new()),
        CreateOptions::default(),
    )?;
    let t = db.create_table(
        "orders",
        vec![ColumnSpec::new("customer", DataType::Long)],
        vec![
            IndexSpec {
                name: "by_customer".into(),
                index_type: IndexType::Plain,
                unique: false,
                ignore_nulls: false,
                columns: vec![("customer".into(), false)],
            },
            IndexSpec {
                name: "fk_customer".into(),
                index_type: IndexType::Foreign,
                unique: false,
                ignore_nulls: false,
                columns: vec![("customer".into(), false)],
            },
        ],
    )?;
    let a = t.index("by_customer").unwrap();
    let b = t.index("fk_customer").unwrap();
    assert_eq!(a.index_data_number, b.index_data_number);
    assert_ne!(a.index_number, b.index_number);
    assert!(b.is_foreign_key());
    Ok(())
}
