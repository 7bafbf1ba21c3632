//! Cursors over index entry ranges.
//!
//! A cursor is detached state: a leaf position, bound keys and a mod-count
//! snapshot. It holds no borrow of the tree, so callers may interleave
//! mutation with iteration; each advance compares mod counts and, when the
//! tree changed, re-seeks to just past the last entry returned.

use crate::error::{Error, Result};
use crate::format::Format;
use crate::index::data::{IndexData, Position};
use crate::index::entry::Entry;
use crate::page_channel::PageChannel;

#[derive(Debug, Clone, PartialEq, Eq)]
enum CursorState {
    NotStarted,
    At(Position),
    Finished,
}

/// Iterates entries in `[start, end]` (each bound optional, each
/// inclusive or exclusive, compared on the key prefix).
pub struct EntryCursor {
    index_data_number: u16,
    start_key: Option<Vec<u8>>,
    start_inclusive: bool,
    end_key: Option<Vec<u8>>,
    end_inclusive: bool,
    state: CursorState,
    mod_snapshot: u64,
    last_entry: Option<Vec<u8>>,
}

impl IndexData {
    /// Opens a cursor over a key range; `None` bounds mean unbounded.
    pub fn cursor(
        &self,
        start: Option<Vec<u8>>,
        start_inclusive: bool,
        end: Option<Vec<u8>>,
        end_inclusive: bool,
    ) -> EntryCursor {
        EntryCursor {
            index_data_number: self.index_data_number,
            start_key: start,
            start_inclusive,
            end_key: end,
            end_inclusive,
            state: CursorState::NotStarted,
            mod_snapshot: self.mod_count(),
            last_entry: None,
        }
    }
}

impl EntryCursor {
    /// Which physical tree this cursor belongs to.
    pub fn index_data_number(&self) -> u16 {
        self.index_data_number
    }

    /// Returns the next in-range entry, or `None` once the range is done.
    pub fn next(
        &mut self,
        index: &mut IndexData,
        channel: &mut PageChannel,
        format: &Format,
    ) -> Result<Option<Entry>> {
        if index.index_data_number != self.index_data_number {
            return Err(Error::StaleCursor(format!(
                "cursor belongs to index data #{}, not #{}",
                self.index_data_number, index.index_data_number
            )));
        }
        if self.state == CursorState::Finished {
            return Ok(None);
        }
        if self.mod_snapshot != index.mod_count() {
            self.recover(index, channel, format)?;
        }
        if self.state == CursorState::NotStarted {
            self.seek_start(index, channel, format)?;
        }

        loop {
            let pos = match self.state {
                CursorState::At(p) => p,
                _ => {
                    self.state = CursorState::Finished;
                    return Ok(None);
                }
            };
            let entry = match index.entry_at(channel, format, pos)? {
                Some(e) => e,
                None => {
                    // The position fell off its leaf; hop forward.
                    match index.position_after(channel, format, pos)? {
                        Some(next) => {
                            self.state = CursorState::At(next);
                            continue;
                        }
                        None => {
                            self.state = CursorState::Finished;
                            return Ok(None);
                        }
                    }
                }
            };
            if self.past_end(&entry) {
                self.state = CursorState::Finished;
                return Ok(None);
            }
            self.state = match index.position_after(channel, format, pos)? {
                Some(next) => CursorState::At(next),
                None => CursorState::Finished,
            };
            self.last_entry = Some(entry.as_bytes().to_vec());
            return Ok(Some(entry));
        }
    }

    /// Drains the remaining range; convenience for scans and tests.
    pub fn collect_remaining(
        &mut self,
        index: &mut IndexData,
        channel: &mut PageChannel,
        format: &Format,
    ) -> Result<Vec<Entry>> {
        let mut out = Vec::new();
        while let Some(e) = self.next(index, channel, format)? {
            out.push(e);
        }
        Ok(out)
    }

    fn past_end(&self, entry: &Entry) -> bool {
        match &self.end_key {
            None => false,
            Some(end) => {
                let key = entry.key();
                key > end.as_slice() || (key == end.as_slice() && !self.end_inclusive)
            }
        }
    }

    fn seek_start(
        &mut self,
        index: &mut IndexData,
        channel: &mut PageChannel,
        format: &Format,
    ) -> Result<()> {
        let mut pos = index.position_at_or_after(channel, format, self.start_key.as_deref())?;
        if let (Some(start), false) = (&self.start_key, self.start_inclusive) {
            // Exclusive start: step over entries that carry the bound key.
            while let Some(p) = pos {
                match index.entry_at(channel, format, p)? {
                    Some(e) if e.key() == start.as_slice() => {
                        pos = index.position_after(channel, format, p)?;
                    }
                    _ => break,
                }
            }
        }
        self.state = match pos {
            Some(p) => CursorState::At(p),
            None => CursorState::Finished,
        };
        Ok(())
    }

    /// The tree changed since our snapshot: re-seek to the first entry
    /// strictly past the last one handed out, then resync the snapshot.
    fn recover(
        &mut self,
        index: &mut IndexData,
        channel: &mut PageChannel,
        format: &Format,
    ) -> Result<()> {
        self.mod_snapshot = index.mod_count();
        match &self.last_entry {
            None => {
                if self.state != CursorState::Finished {
                    self.state = CursorState::NotStarted;
                }
            }
            Some(last) => {
                let last = last.clone();
                let mut pos = index.position_at_or_after(channel, format, Some(&last))?;
                while let Some(p) = pos {
                    match index.entry_at(channel, format, p)? {
                        Some(e) if e.as_bytes() == last.as_slice() => {
                            pos = index.position_after(channel, format, p)?;
                        }
                        _ => break,
                    }
                }
                self.state = match pos {
                    Some(p) => CursorState::At(p),
                    None => CursorState::Finished,
                };
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::byte_channel::MemoryChannel;
    use crate::codec::IdentityCodec;
    use crate::column::Column;
    use crate::data_type::DataType;
    use crate::format::{FileFormat, SortOrder};
    use crate::index::entry::{encode_entry, IndexColumn};
    use crate::record::assign_fixed_offsets;
    use crate::rowid::RowId;
    use crate::value::Value;

    fn setup() -> (PageChannel, Format, Vec<Column>, IndexData) {
        let format = Format::for_file_format(FileFormat::V4);
        let mut pc = PageChannel::new(
            Box::new(MemoryChannel::new()),
            Box::new(IdentityCodec),
            &format,
            false,
        );
        let mut cols = vec![Column {
            name: String::from("k"),
            column_number: 0,
            data_type: DataType::Long,
            fixed_offset: 0,
            max_length: 0,
            auto_number: false,
            scale: 0,
            precision: 0,
            sort_order: 0,
        }];
        assign_fixed_offsets(&mut cols);
        let root = IndexData::create_root(&mut pc, &format).unwrap();
        let idx = IndexData::new(
            0,
            root,
            false,
            false,
            vec![IndexColumn {
                column_number: 0,
                descending: false,
            }],
            SortOrder::Legacy,
        );
        (pc, format, cols, idx)
    }

    fn key_for(cols: &[Column], idx: &IndexData, v: i32) -> Vec<u8> {
        let (bytes, _) = encode_entry(
            cols,
            &idx.columns,
            &[Value::Long(v)],
            SortOrder::Legacy,
            RowId::new(0, 0),
        )
        .unwrap();
        bytes[..bytes.len() - crate::rowid::ROW_ID_SIZE].to_vec()
    }

    fn values_of(entries: &[Entry]) -> Vec<i32> {
        entries.iter().map(|e| e.row_id().row_number).collect()
    }

    fn fill(pc: &mut PageChannel, format: &Format, cols: &[Column], idx: &mut IndexData) {
        // Row number mirrors the key so tests can read results easily.
        for v in [10, 20, 30, 40, 50] {
            idx.add_row(pc, format, cols, &[Value::Long(v)], RowId::new(1, v))
                .unwrap();
        }
    }

    #[test]
    fn test_unbounded_cursor_full_scan() {
        let (mut pc, format, cols, mut idx) = setup();
        fill(&mut pc, &format, &cols, &mut idx);
        let mut cur = idx.cursor(None, true, None, true);
        let all = cur.collect_remaining(&mut idx, &mut pc, &format).unwrap();
        assert_eq!(values_of(&all), vec![10, 20, 30, 40, 50]);
        // A finished cursor stays finished.
        assert!(cur.next(&mut idx, &mut pc, &format).unwrap().is_none());
    }

    #[test]
    fn test_bounded_ranges() {
        let (mut pc, format, cols, mut idx) = setup();
        fill(&mut pc, &format, &cols, &mut idx);
        let k20 = key_for(&cols, &idx, 20);
        let k40 = key_for(&cols, &idx, 40);

        let cases: Vec<(bool, bool, Vec<i32>)> = vec![
            (true, true, vec![20, 30, 40]),
            (false, true, vec![30, 40]),
            (true, false, vec![20, 30]),
            (false, false, vec![30]),
        ];
        for (si, ei, expect) in cases {
            let mut cur = idx.cursor(Some(k20.clone()), si, Some(k40.clone()), ei);
            let got = cur.collect_remaining(&mut idx, &mut pc, &format).unwrap();
            assert_eq!(values_of(&got), expect, "inclusive=({},{})", si, ei);
        }
    }

    #[test]
    fn test_bounds_between_keys() {
        let (mut pc, format, cols, mut idx) = setup();
        fill(&mut pc, &format, &cols, &mut idx);
        let k25 = key_for(&cols, &idx, 25);
        let k45 = key_for(&cols, &idx, 45);
        let mut cur = idx.cursor(Some(k25), true, Some(k45), true);
        let got = cur.collect_remaining(&mut idx, &mut pc, &format).unwrap();
        assert_eq!(values_of(&got), vec![30, 40]);
    }

    #[test]
    fn test_cursor_survives_mutation_between_advances() {
        let (mut pc, format, cols, mut idx) = setup();
        fill(&mut pc, &format, &cols, &mut idx);
        let mut cur = idx.cursor(None, true, None, true);
        let first = cur.next(&mut idx, &mut pc, &format).unwrap().unwrap();
        assert_eq!(first.row_id().row_number, 10);

        // Mutate: remove the entry the cursor would return next, add one
        // further along.
        idx.delete_row(&mut pc, &format, &cols, &[Value::Long(20)], RowId::new(1, 20))
            .unwrap();
        idx.add_row(&mut pc, &format, &cols, &[Value::Long(35)], RowId::new(1, 35))
            .unwrap();

        let rest = cur.collect_remaining(&mut idx, &mut pc, &format).unwrap();
        assert_eq!(values_of(&rest), vec![30, 35, 40, 50]);
    }

    #[test]
    fn test_cursor_rejects_foreign_index() {
        let (mut pc, format, _cols, mut idx) = setup();
        let root = IndexData::create_root(&mut pc, &format).unwrap();
        let mut other = IndexData::new(
            7,
            root,
            false,
            false,
            idx.columns.clone(),
            SortOrder::Legacy,
        );
        let mut cur = idx.cursor(None, true, None, true);
        assert!(matches!(
            cur.next(&mut other, &mut pc, &format),
            Err(Error::StaleCursor(_))
        ));
        // Still fine against its own index.
        assert!(cur.next(&mut idx, &mut pc, &format).unwrap().is_none());
    }
}
