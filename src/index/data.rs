//! The physical index tree.
//!
//! Nodes are INDEX_NODE/INDEX_LEAF pages. Leaves hold sorted entries
//! (encoded key plus RowId suffix) and are linked left-to-right; interior
//! nodes hold a leftmost child plus (separator key, child) pairs where the
//! separator is the smallest key of that child's subtree. The root stays
//! on its original page across splits so the table definition never moves.
//!
//! Page layouts:
//! leaf (0x04):  [type][0][u16 entry count][i32 prev leaf][i32 next leaf]
//!               entries from offset 12, each [u16 len][entry bytes]
//! node (0x03):  [type][0][u16 entry count][i32 leftmost child][i32 -1]
//!               entries from offset 12, each [u16 len][key bytes][i32 child]

use byteorder::{ByteOrder, LittleEndian};
use itertools::Itertools;
use log::debug;

use crate::column::Column;
use crate::error::{Error, Result};
use crate::format::{page_types, Format, SortOrder};
use crate::index::entry::{self, Entry, IndexColumn};
use crate::page_channel::{PageChannel, PageNum, INVALID_PAGE_NUMBER};
use crate::rowid::RowId;

const DATA_FLAG_UNIQUE: u8 = 0x01;
const DATA_FLAG_IGNORE_NULLS: u8 = 0x02;

/// One entry inside a loaded node.
#[derive(Debug, Clone, PartialEq)]
struct NodeEntry {
    bytes: Vec<u8>,
    /// Child page (interior nodes only).
    child: PageNum,
}

/// A node parsed into memory; mutated there and written back whole.
#[derive(Debug, Clone)]
struct Node {
    page_number: PageNum,
    leaf: bool,
    /// Previous leaf, or the leftmost child for interior nodes.
    prev: PageNum,
    /// Next leaf; unused (-1) for interior nodes.
    next: PageNum,
    entries: Vec<NodeEntry>,
}

impl Node {
    fn new_leaf(page_number: PageNum) -> Node {
        Node {
            page_number,
            leaf: true,
            prev: INVALID_PAGE_NUMBER,
            next: INVALID_PAGE_NUMBER,
            entries: Vec::new(),
        }
    }

    fn serialized_len(&self, format: &Format) -> usize {
        let per_entry_overhead = if self.leaf { 2 } else { 6 };
        format.offset_index_entries
            + self
                .entries
                .iter()
                .map(|e| e.bytes.len() + per_entry_overhead)
                .sum::<usize>()
    }

    fn fits(&self, format: &Format) -> bool {
        self.serialized_len(format) <= format.page_size
    }
}

fn read_node(channel: &mut PageChannel, format: &Format, page_number: PageNum) -> Result<Node> {
    let mut page = channel.create_page_buffer();
    channel.read_page(&mut page, page_number)?;
    let leaf = match page[0] {
        page_types::INDEX_LEAF => true,
        page_types::INDEX_NODE => false,
        b => {
            return Err(Error::UnrecognizedPageType {
                page_number,
                type_byte: b,
            })
        }
    };
    let count = LittleEndian::read_u16(&page[format.offset_index_entry_count..]) as usize;
    let prev = LittleEndian::read_i32(&page[format.offset_index_prev_leaf..]);
    let next = LittleEndian::read_i32(&page[format.offset_index_next_leaf..]);
    let mut entries = Vec::with_capacity(count);
    let mut pos = format.offset_index_entries;
    for _ in 0..count {
        if pos + 2 > format.page_size {
            return Err(Error::MalformedPage {
                page_number,
                reason: String::from("index entry table overruns the page"),
            });
        }
        let len = LittleEndian::read_u16(&page[pos..]) as usize;
        pos += 2;
        let child_len = if leaf { 0 } else { 4 };
        if pos + len + child_len > format.page_size {
            return Err(Error::MalformedPage {
                page_number,
                reason: String::from("index entry overruns the page"),
            });
        }
        let bytes = page[pos..pos + len].to_vec();
        pos += len;
        let child = if leaf {
            INVALID_PAGE_NUMBER
        } else {
            let c = LittleEndian::read_i32(&page[pos..]);
            pos += 4;
            c
        };
        entries.push(NodeEntry { bytes, child });
    }
    Ok(Node {
        page_number,
        leaf,
        prev,
        next,
        entries,
    })
}

fn write_node(channel: &mut PageChannel, format: &Format, node: &Node) -> Result<()> {
    if !node.fits(format) {
        // A node that cannot be serialized onto an empty page means the
        // split logic lost an invariant mid-write; the handle must stop.
        return Err(Error::Invariant(format!(
            "index node {} needs {} bytes but a page holds {}",
            node.page_number,
            node.serialized_len(format),
            format.page_size
        )));
    }
    let mut page = channel.create_page_buffer();
    page[0] = if node.leaf {
        page_types::INDEX_LEAF
    } else {
        page_types::INDEX_NODE
    };
    LittleEndian::write_u16(
        &mut page[format.offset_index_entry_count..],
        node.entries.len() as u16,
    );
    LittleEndian::write_i32(&mut page[format.offset_index_prev_leaf..], node.prev);
    LittleEndian::write_i32(&mut page[format.offset_index_next_leaf..], node.next);
    let mut pos = format.offset_index_entries;
    for e in &node.entries {
        LittleEndian::write_u16(&mut page[pos..], e.bytes.len() as u16);
        pos += 2;
        page[pos..pos + e.bytes.len()].copy_from_slice(&e.bytes);
        pos += e.bytes.len();
        if !node.leaf {
            LittleEndian::write_i32(&mut page[pos..], e.child);
            pos += 4;
        }
    }
    channel.write_page(&page, node.page_number)
}

/// A stable reference into the tree: which leaf, which slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub leaf_page: PageNum,
    pub idx: usize,
}

/// The shared physical tree behind one or more logical indexes.
pub struct IndexData {
    pub index_data_number: u16,
    pub root_page: PageNum,
    pub unique: bool,
    pub ignore_nulls: bool,
    pub columns: Vec<IndexColumn>,
    sort_order: SortOrder,
    initialized: bool,
    mod_count: u64,
}

impl IndexData {
    pub fn new(
        index_data_number: u16,
        root_page: PageNum,
        unique: bool,
        ignore_nulls: bool,
        columns: Vec<IndexColumn>,
        sort_order: SortOrder,
    ) -> IndexData {
        IndexData {
            index_data_number,
            root_page,
            unique,
            ignore_nulls,
            columns,
            sort_order,
            initialized: false,
            mod_count: 0,
        }
    }

    /// Allocates and writes an empty root leaf; returns its page number.
    pub fn create_root(channel: &mut PageChannel, format: &Format) -> Result<PageNum> {
        let page_number = channel.allocate_new_page()?;
        write_node(channel, format, &Node::new_leaf(page_number))?;
        Ok(page_number)
    }

    pub fn sort_order(&self) -> SortOrder {
        self.sort_order
    }

    /// Mutation counter compared by cursors on each advance.
    pub fn mod_count(&self) -> u64 {
        self.mod_count
    }

    /// A newly opened index defers reading its pages until first use.
    pub fn initialize(&mut self, channel: &mut PageChannel, format: &Format) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        // Validates the root; interior pages fault in as traversal needs them.
        let _ = read_node(channel, format, self.root_page)?;
        self.initialized = true;
        Ok(())
    }

    /// Adds the index entry for one row. Returns quietly without touching
    /// the tree when the row is all-null and the index ignores nulls.
    pub fn add_row(
        &mut self,
        channel: &mut PageChannel,
        format: &Format,
        table_columns: &[Column],
        values: &[crate::value::Value],
        row_id: RowId,
    ) -> Result<()> {
        let (bytes, all_null) =
            entry::encode_entry(table_columns, &self.columns, values, self.sort_order, row_id)?;
        self.add_entry(channel, format, bytes, all_null)
    }

    /// Removes the index entry for one row.
    pub fn delete_row(
        &mut self,
        channel: &mut PageChannel,
        format: &Format,
        table_columns: &[Column],
        values: &[crate::value::Value],
        row_id: RowId,
    ) -> Result<()> {
        let (bytes, all_null) =
            entry::encode_entry(table_columns, &self.columns, values, self.sort_order, row_id)?;
        if all_null && self.ignore_nulls {
            return Ok(());
        }
        self.delete_entry(channel, format, &bytes)
    }

    /// Checks whether an entry with exactly this key prefix exists.
    pub fn prefix_exists(
        &mut self,
        channel: &mut PageChannel,
        format: &Format,
        prefix: &[u8],
    ) -> Result<bool> {
        self.initialize(channel, format)?;
        match self.position_at_or_after(channel, format, Some(prefix))? {
            None => Ok(false),
            Some(pos) => match self.entry_at(channel, format, pos)? {
                None => Ok(false),
                Some(e) => Ok(e.key() == prefix),
            },
        }
    }

    pub(crate) fn add_entry(
        &mut self,
        channel: &mut PageChannel,
        format: &Format,
        bytes: Vec<u8>,
        all_null: bool,
    ) -> Result<()> {
        if all_null && self.ignore_nulls {
            return Ok(());
        }
        self.initialize(channel, format)?;
        if self.unique && !all_null {
            let entry = Entry::from_bytes(bytes.clone())?;
            if self.prefix_exists(channel, format, entry.key())? {
                return Err(Error::DuplicateKey {
                    index_name: format!("index data #{}", self.index_data_number),
                });
            }
        }

        // Descend, remembering the interior path.
        let mut path: Vec<PageNum> = Vec::new();
        let mut node = read_node(channel, format, self.root_page)?;
        while !node.leaf {
            path.push(node.page_number);
            let pos = node
                .entries
                .partition_point(|e| e.bytes.as_slice() <= bytes.as_slice());
            let child = if pos == 0 {
                node.prev
            } else {
                node.entries[pos - 1].child
            };
            node = read_node(channel, format, child)?;
        }

        let pos = node.entries.partition_point(|e| e.bytes < bytes);
        if node
            .entries
            .get(pos)
            .map(|e| e.bytes == bytes)
            .unwrap_or(false)
        {
            return Err(Error::Invariant(format!(
                "entry for {} already present in index data #{}",
                Entry::from_bytes(bytes)?.row_id(),
                self.index_data_number
            )));
        }
        node.entries.insert(
            pos,
            NodeEntry {
                bytes,
                child: INVALID_PAGE_NUMBER,
            },
        );
        self.mod_count += 1;

        if node.fits(format) {
            return write_node(channel, format, &node);
        }
        let mut promotion = self.split(channel, format, node, path.is_empty())?;
        // Propagate the promoted separator up the recorded path.
        while let Some((sep, right_page)) = promotion {
            let parent_page = match path.pop() {
                Some(p) => p,
                None => {
                    return Err(Error::Invariant(String::from(
                        "index split promoted past the root",
                    )))
                }
            };
            let mut parent = read_node(channel, format, parent_page)?;
            let pos = parent
                .entries
                .partition_point(|e| e.bytes.as_slice() < sep.as_slice());
            parent.entries.insert(
                pos,
                NodeEntry {
                    bytes: sep,
                    child: right_page,
                },
            );
            if parent.fits(format) {
                write_node(channel, format, &parent)?;
                promotion = None;
            } else {
                promotion = self.split(channel, format, parent, path.is_empty())?;
            }
        }
        Ok(())
    }

    /// Splits an over-full node at its median. For a non-root node the
    /// upper half moves to a fresh page and the separator is returned for
    /// the parent. The root splits into two fresh children instead, so its
    /// page number never changes.
    fn split(
        &mut self,
        channel: &mut PageChannel,
        format: &Format,
        mut node: Node,
        is_root: bool,
    ) -> Result<Option<(Vec<u8>, PageNum)>> {
        if node.entries.len() < 2 {
            return Err(Error::Invariant(format!(
                "index node {} cannot split {} entries",
                node.page_number,
                node.entries.len()
            )));
        }
        let mid = node.entries.len() / 2;
        debug!(
            "splitting index page {} ({} entries, leaf: {})",
            node.page_number,
            node.entries.len(),
            node.leaf
        );

        if !is_root {
            let right_page = channel.allocate_new_page()?;
            let mut right = Node {
                page_number: right_page,
                leaf: node.leaf,
                prev: INVALID_PAGE_NUMBER,
                next: INVALID_PAGE_NUMBER,
                entries: node.entries.split_off(mid),
            };
            let sep;
            if node.leaf {
                sep = right.entries[0].bytes.clone();
                right.prev = node.page_number;
                right.next = node.next;
                if node.next != INVALID_PAGE_NUMBER {
                    let mut after = read_node(channel, format, node.next)?;
                    after.prev = right_page;
                    write_node(channel, format, &after)?;
                }
                node.next = right_page;
            } else {
                // The median entry moves up; its child becomes the right
                // node's leftmost child.
                let median = right.entries.remove(0);
                sep = median.bytes;
                right.prev = median.child;
            }
            write_node(channel, format, &node)?;
            write_node(channel, format, &right)?;
            return Ok(Some((sep, right_page)));
        }

        // Root split: both halves land on fresh pages, the root becomes an
        // interior node over them.
        let left_page = channel.allocate_new_page()?;
        let right_page = channel.allocate_new_page()?;
        let right_entries = node.entries.split_off(mid);
        let mut left = Node {
            page_number: left_page,
            leaf: node.leaf,
            prev: node.prev,
            next: INVALID_PAGE_NUMBER,
            entries: std::mem::take(&mut node.entries),
        };
        let mut right = Node {
            page_number: right_page,
            leaf: node.leaf,
            prev: INVALID_PAGE_NUMBER,
            next: node.next,
            entries: right_entries,
        };
        let sep;
        if node.leaf {
            sep = right.entries[0].bytes.clone();
            left.next = right_page;
            right.prev = left_page;
        } else {
            left.next = INVALID_PAGE_NUMBER;
            let median = right.entries.remove(0);
            sep = median.bytes;
            // Interior: prev is the leftmost child pointer.
            right.prev = median.child;
        }
        write_node(channel, format, &left)?;
        write_node(channel, format, &right)?;
        let root = Node {
            page_number: node.page_number,
            leaf: false,
            prev: left_page,
            next: INVALID_PAGE_NUMBER,
            entries: vec![NodeEntry {
                bytes: sep,
                child: right_page,
            }],
        };
        write_node(channel, format, &root)?;
        Ok(None)
    }

    /// Removes the exact entry. Underflow does not merge: empty leaves
    /// stay linked and get reused by later inserts.
    // TODO: a rebalance pass would hook in here once the on-disk format
    // grows a free-node list to return merged pages to.
    pub(crate) fn delete_entry(
        &mut self,
        channel: &mut PageChannel,
        format: &Format,
        bytes: &[u8],
    ) -> Result<()> {
        self.initialize(channel, format)?;
        let mut node = read_node(channel, format, self.root_page)?;
        while !node.leaf {
            let pos = node.entries.partition_point(|e| e.bytes.as_slice() <= bytes);
            let child = if pos == 0 {
                node.prev
            } else {
                node.entries[pos - 1].child
            };
            node = read_node(channel, format, child)?;
        }
        match node.entries.iter().position(|e| e.bytes == bytes) {
            Some(idx) => {
                node.entries.remove(idx);
                self.mod_count += 1;
                write_node(channel, format, &node)
            }
            None => {
                let e = Entry::from_bytes(bytes.to_vec())?;
                Err(Error::DanglingRowId {
                    page_number: e.row_id().page_number,
                    row_number: e.row_id().row_number,
                })
            }
        }
    }

    /// First entry position in key order, skipping empty leaves.
    pub(crate) fn first_position(
        &mut self,
        channel: &mut PageChannel,
        format: &Format,
    ) -> Result<Option<Position>> {
        self.initialize(channel, format)?;
        let mut node = read_node(channel, format, self.root_page)?;
        while !node.leaf {
            node = read_node(channel, format, node.prev)?;
        }
        self.normalize(channel, format, node, 0)
    }

    /// First position whose entry bytes are >= `target`; `None` target
    /// means the very first entry.
    pub(crate) fn position_at_or_after(
        &mut self,
        channel: &mut PageChannel,
        format: &Format,
        target: Option<&[u8]>,
    ) -> Result<Option<Position>> {
        let target = match target {
            None => return self.first_position(channel, format),
            Some(t) => t,
        };
        self.initialize(channel, format)?;
        let mut node = read_node(channel, format, self.root_page)?;
        while !node.leaf {
            let pos = node.entries.partition_point(|e| e.bytes.as_slice() <= target);
            let child = if pos == 0 {
                node.prev
            } else {
                node.entries[pos - 1].child
            };
            node = read_node(channel, format, child)?;
        }
        let idx = node.entries.partition_point(|e| e.bytes.as_slice() < target);
        self.normalize(channel, format, node, idx)
    }

    /// Entry at a position, if the position is still in range.
    pub(crate) fn entry_at(
        &mut self,
        channel: &mut PageChannel,
        format: &Format,
        pos: Position,
    ) -> Result<Option<Entry>> {
        let node = read_node(channel, format, pos.leaf_page)?;
        match node.entries.get(pos.idx) {
            Some(e) => Ok(Some(Entry::from_bytes(e.bytes.clone())?)),
            None => Ok(None),
        }
    }

    /// The position following `pos`, hopping leaves as needed.
    pub(crate) fn position_after(
        &mut self,
        channel: &mut PageChannel,
        format: &Format,
        pos: Position,
    ) -> Result<Option<Position>> {
        let node = read_node(channel, format, pos.leaf_page)?;
        self.normalize(channel, format, node, pos.idx + 1)
    }

    /// Walks forward from (node, idx) to the first real entry, following
    /// next-leaf links past exhausted or empty leaves.
    fn normalize(
        &mut self,
        channel: &mut PageChannel,
        format: &Format,
        mut node: Node,
        mut idx: usize,
    ) -> Result<Option<Position>> {
        loop {
            if idx < node.entries.len() {
                return Ok(Some(Position {
                    leaf_page: node.page_number,
                    idx,
                }));
            }
            if node.next == INVALID_PAGE_NUMBER {
                return Ok(None);
            }
            node = read_node(channel, format, node.next)?;
            idx = 0;
        }
    }

    /// Every entry in key order; test and scan helper.
    pub fn all_entries(
        &mut self,
        channel: &mut PageChannel,
        format: &Format,
    ) -> Result<Vec<Entry>> {
        let mut out = Vec::new();
        let mut pos = self.first_position(channel, format)?;
        while let Some(p) = pos {
            if let Some(e) = self.entry_at(channel, format, p)? {
                out.push(e);
            }
            pos = self.position_after(channel, format, p)?;
        }
        Ok(out)
    }

    // On-disk index-data definition (inside the table definition page):
    // Offset  Size  Description
    // 0       4     root page
    // 4       1     flags (bit0 unique, bit1 ignore-nulls)
    // 5       2     column count
    // 7       3*n   per column: column number (2) + flags (1, bit0 desc)

    pub fn write_def(&self, out: &mut Vec<u8>) {
        let mut root = [0_u8; 4];
        LittleEndian::write_i32(&mut root, self.root_page);
        out.extend_from_slice(&root);
        let mut flags = 0_u8;
        if self.unique {
            flags |= DATA_FLAG_UNIQUE;
        }
        if self.ignore_nulls {
            flags |= DATA_FLAG_IGNORE_NULLS;
        }
        out.push(flags);
        out.extend_from_slice(&(self.columns.len() as u16).to_le_bytes());
        for ic in &self.columns {
            out.extend_from_slice(&ic.column_number.to_le_bytes());
            out.push(if ic.descending { 0x01 } else { 0x00 });
        }
    }

    /// Reads one definition; returns the instance and the bytes consumed.
    pub fn read_def(
        bytes: &[u8],
        index_data_number: u16,
        sort_order: SortOrder,
    ) -> Result<(IndexData, usize)> {
        if bytes.len() < 7 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "index data definition is truncated",
            )));
        }
        let root_page = LittleEndian::read_i32(&bytes[0..]);
        let flags = bytes[4];
        let count = LittleEndian::read_u16(&bytes[5..]) as usize;
        let mut pos = 7;
        let mut columns = Vec::with_capacity(count);
        for _ in 0..count {
            if pos + 3 > bytes.len() {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "index column list is truncated",
                )));
            }
            columns.push(IndexColumn {
                column_number: LittleEndian::read_u16(&bytes[pos..]),
                descending: bytes[pos + 2] & 0x01 != 0,
            });
            pos += 3;
        }
        Ok((
            IndexData::new(
                index_data_number,
                root_page,
                flags & DATA_FLAG_UNIQUE != 0,
                flags & DATA_FLAG_IGNORE_NULLS != 0,
                columns,
                sort_order,
            ),
            pos,
        ))
    }

    /// Diagnostic description of the column list.
    pub fn describe_columns(&self) -> String {
        self.columns
            .iter()
            .map(|c| {
                format!(
                    "{}{}",
                    c.column_number,
                    if c.descending { " desc" } else { "" }
                )
            })
            .join(", ")
    }
}
