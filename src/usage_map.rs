//! Usage maps: compact bitmaps tracking which pages a table owns.
//!
//! A map is declared inside some page (a table definition, here) as a
//! 69-byte region whose first byte selects the physical variant: `0x00`
//! inline (the bitmap lives in the declaration, 512-page window) or `0x01`
//! reference (the declaration holds pointers to dedicated USAGE_MAP pages).
//! Mutations write the touched page back immediately; an in-memory bit-set
//! mirrors the disk state for queries and iteration.

use byteorder::{ByteOrder, LittleEndian};
use log::debug;

use crate::buffers::{Retention, TempPageHolder};
use crate::error::{Error, Result};
use crate::format::{page_types, Format};
use crate::page_channel::{PageChannel, PageNum, INVALID_PAGE_NUMBER};

const MAP_TYPE_INLINE: u8 = 0x00;
const MAP_TYPE_REFERENCE: u8 = 0x01;

/// Plain bit-set over absolute bit indexes.
#[derive(Debug, Clone, PartialEq)]
struct BitSet {
    words: Vec<u64>,
}

impl BitSet {
    fn new() -> BitSet {
        BitSet { words: Vec::new() }
    }

    fn set(&mut self, bit: usize) {
        let word = bit / 64;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1 << (bit % 64);
    }

    fn clear(&mut self, bit: usize) {
        let word = bit / 64;
        if word < self.words.len() {
            self.words[word] &= !(1 << (bit % 64));
        }
    }

    fn get(&self, bit: usize) -> bool {
        let word = bit / 64;
        word < self.words.len() && self.words[word] & (1 << (bit % 64)) != 0
    }

    fn clear_all(&mut self) {
        self.words.clear();
    }

    /// Sets bits `0..n`.
    fn set_range(&mut self, n: usize) {
        self.clear_all();
        if n == 0 {
            return;
        }
        self.words = vec![u64::MAX; (n + 63) / 64];
        let tail = n % 64;
        if tail != 0 {
            let last = self.words.len() - 1;
            self.words[last] = (1 << tail) - 1;
        }
    }

    fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Smallest set bit >= `from`, if any.
    fn next_set_bit(&self, from: usize) -> Option<usize> {
        let mut word = from / 64;
        if word >= self.words.len() {
            return None;
        }
        let mut w = self.words[word] & (u64::MAX << (from % 64));
        loop {
            if w != 0 {
                return Some(word * 64 + w.trailing_zeros() as usize);
            }
            word += 1;
            if word >= self.words.len() {
                return None;
            }
            w = self.words[word];
        }
    }

    /// Largest set bit <= `from`, if any.
    fn prev_set_bit(&self, from: usize) -> Option<usize> {
        let mut word = (from / 64).min(self.words.len().saturating_sub(1));
        if self.words.is_empty() {
            return None;
        }
        let mut w = self.words[word];
        if from / 64 < self.words.len() {
            let shift = 63 - (from % 64);
            w = (w << shift) >> shift;
        }
        loop {
            if w != 0 {
                return Some(word * 64 + 63 - w.leading_zeros() as usize);
            }
            if word == 0 {
                return None;
            }
            word -= 1;
            w = self.words[word];
        }
    }
}

enum Variant {
    Inline {
        start_page: PageNum,
        /// Bits relative to `start_page`, capacity 512.
        bits: BitSet,
    },
    Reference {
        /// One slot per declaration pointer; -1 = unallocated segment.
        segment_pages: Vec<PageNum>,
        /// Absolute page-number bits.
        bits: BitSet,
    },
}

/// One usage map, bound to its declaration region.
pub struct UsageMap {
    decl_page: PageNum,
    decl_offset: usize,
    variant: Variant,
    mod_count: u64,
    holder: TempPageHolder,
}

/// Detached iteration state for a usage map; holds integers only, so the
/// map can be mutated between calls. See `UsageMap::next_page`.
#[derive(Debug, Clone)]
pub struct PageCursor {
    reverse: bool,
    /// Next candidate page (absolute).
    position: i64,
    /// Last page returned, or None before the first hit.
    last_returned: Option<PageNum>,
    mod_snapshot: u64,
}

impl UsageMap {
    /// Writes a fresh inline declaration and returns the map.
    pub fn create_inline(
        channel: &mut PageChannel,
        format: &Format,
        decl_page: PageNum,
        decl_offset: usize,
        start_page: PageNum,
    ) -> Result<UsageMap> {
        let mut map = UsageMap {
            decl_page,
            decl_offset,
            variant: Variant::Inline {
                start_page,
                bits: BitSet::new(),
            },
            mod_count: 0,
            holder: TempPageHolder::new(Retention::Soft, format.page_size),
        };
        map.write_declaration(channel, format)?;
        Ok(map)
    }

    /// Writes a fresh reference declaration (all segment slots empty).
    pub fn create_reference(
        channel: &mut PageChannel,
        format: &Format,
        decl_page: PageNum,
        decl_offset: usize,
    ) -> Result<UsageMap> {
        let mut map = UsageMap {
            decl_page,
            decl_offset,
            variant: Variant::Reference {
                segment_pages: vec![INVALID_PAGE_NUMBER; reference_slot_count(format)],
                bits: BitSet::new(),
            },
            mod_count: 0,
            holder: TempPageHolder::new(Retention::Soft, format.page_size),
        };
        map.write_declaration(channel, format)?;
        Ok(map)
    }

    /// Opens a map by dispatching on the type byte at the declaration.
    pub fn open(
        channel: &mut PageChannel,
        format: &Format,
        decl_page: PageNum,
        decl_offset: usize,
    ) -> Result<UsageMap> {
        let mut holder = TempPageHolder::new(Retention::Soft, format.page_size);
        let decl = {
            let buf = holder.set_page(channel, decl_page)?;
            let page = buf.borrow();
            page[decl_offset..decl_offset + format.usage_map_decl_length].to_vec()
        };
        let variant = match decl[0] {
            MAP_TYPE_INLINE => {
                let start_page = LittleEndian::read_i32(&decl[format.offset_usage_map_start_page..]);
                let mut bits = BitSet::new();
                read_bitmap(
                    &decl[format.offset_usage_map_inline_bitmap
                        ..format.offset_usage_map_inline_bitmap + format.usage_map_inline_bitmap_len],
                    0,
                    &mut bits,
                );
                Variant::Inline { start_page, bits }
            }
            MAP_TYPE_REFERENCE => {
                // The read path sizes its slots from the declaration: 17
                // pointers fit, though we never write the 17th.
                let mut segment_pages = Vec::with_capacity(reference_slot_count(format));
                for slot in 0..reference_slot_count(format) {
                    let off = format.offset_reference_map_page_numbers + slot * 4;
                    segment_pages.push(LittleEndian::read_i32(&decl[off..]));
                }
                let mut bits = BitSet::new();
                for (slot, &seg_page) in segment_pages.iter().enumerate() {
                    if seg_page == INVALID_PAGE_NUMBER {
                        continue;
                    }
                    let buf = holder.set_page(channel, seg_page)?;
                    let page = buf.borrow();
                    if page[0] != page_types::USAGE_MAP {
                        return Err(Error::UnrecognizedPageType {
                            page_number: seg_page,
                            type_byte: page[0],
                        });
                    }
                    read_bitmap(
                        &page[format.offset_usage_map_page_data..],
                        slot * format.pages_per_usage_map_page,
                        &mut bits,
                    );
                }
                Variant::Reference {
                    segment_pages,
                    bits,
                }
            }
            b => {
                return Err(Error::MalformedPage {
                    page_number: decl_page,
                    reason: format!("unrecognized usage map type byte {:#04x}", b),
                })
            }
        };
        Ok(UsageMap {
            decl_page,
            decl_offset,
            variant,
            mod_count: 0,
            holder,
        })
    }

    pub fn contains(&self, page_number: PageNum) -> bool {
        match &self.variant {
            Variant::Inline { start_page, bits } => {
                page_number >= *start_page
                    && ((page_number - start_page) as usize) < inline_capacity()
                    && bits.get((page_number - start_page) as usize)
            }
            Variant::Reference { bits, .. } => {
                page_number >= 0 && bits.get(page_number as usize)
            }
        }
    }

    pub fn page_count(&self) -> usize {
        match &self.variant {
            Variant::Inline { bits, .. } => bits.count(),
            Variant::Reference { bits, .. } => bits.count(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.page_count() == 0
    }

    /// Monotonic counter advanced by every mutation; cursors compare it.
    pub fn mod_count(&self) -> u64 {
        self.mod_count
    }

    pub fn add_page_number(
        &mut self,
        channel: &mut PageChannel,
        format: &Format,
        page_number: PageNum,
    ) -> Result<()> {
        self.update(channel, format, page_number, true)
    }

    pub fn remove_page_number(
        &mut self,
        channel: &mut PageChannel,
        format: &Format,
        page_number: PageNum,
    ) -> Result<()> {
        self.update(channel, format, page_number, false)
    }

    fn update(
        &mut self,
        channel: &mut PageChannel,
        format: &Format,
        page_number: PageNum,
        add: bool,
    ) -> Result<()> {
        if page_number < 0 {
            return Err(Error::Invariant(format!(
                "usage map cannot track page {}",
                page_number
            )));
        }
        self.mod_count += 1;
        match &mut self.variant {
            Variant::Inline { start_page, bits } => {
                if page_number < *start_page {
                    return Err(Error::Invariant(format!(
                        "page {} is before the inline map window start {}",
                        page_number, start_page
                    )));
                }
                let rel = (page_number - *start_page) as usize;
                if rel >= inline_capacity() {
                    // Advance the window to the new page and start over.
                    debug!(
                        "inline usage map window advances from {} to {}",
                        start_page, page_number
                    );
                    *start_page = page_number;
                    if add {
                        bits.clear_all();
                        bits.set(0);
                    } else {
                        // A remove past the window models a free-page map
                        // wrapping: everything in the new window is "on".
                        bits.set_range(inline_capacity());
                    }
                } else if add {
                    bits.set(rel);
                } else {
                    bits.clear(rel);
                }
                self.write_declaration(channel, format)
            }
            Variant::Reference {
                segment_pages,
                bits,
            } => {
                let slot = page_number as usize / format.pages_per_usage_map_page;
                if slot >= segment_pages.len() {
                    return Err(Error::Invariant(format!(
                        "page {} is beyond the reference map capacity",
                        page_number
                    )));
                }
                if segment_pages[slot] == INVALID_PAGE_NUMBER {
                    if !add {
                        // Removing from a never-allocated segment is a no-op.
                        return Ok(());
                    }
                    if slot >= format.max_reference_map_segments {
                        return Err(Error::Schema(format!(
                            "reference usage map will not allocate segment {} on write",
                            slot
                        )));
                    }
                    let seg_page = allocate_map_page(channel, format)?;
                    debug!("usage map segment {} allocated at page {}", slot, seg_page);
                    segment_pages[slot] = seg_page;
                    // Patch the pointer slot in the declaration.
                    let buf = self.holder.set_page(channel, self.decl_page)?;
                    {
                        let mut page = buf.borrow_mut();
                        let off = self.decl_offset
                            + format.offset_reference_map_page_numbers
                            + slot * 4;
                        LittleEndian::write_i32(&mut page[off..], seg_page);
                    }
                    channel.write_page(&buf.borrow(), self.decl_page)?;
                }
                let seg_page = segment_pages[slot];
                let bit_in_seg = page_number as usize % format.pages_per_usage_map_page;
                let buf = self.holder.set_page(channel, seg_page)?;
                {
                    let mut page = buf.borrow_mut();
                    let byte = format.offset_usage_map_page_data + bit_in_seg / 8;
                    let mask = 1_u8 << (bit_in_seg % 8);
                    if add {
                        page[byte] |= mask;
                    } else {
                        page[byte] &= !mask;
                    }
                }
                channel.write_page(&buf.borrow(), seg_page)?;
                if add {
                    bits.set(page_number as usize);
                } else {
                    bits.clear(page_number as usize);
                }
                Ok(())
            }
        }
    }

    /// Serializes the declaration region back into its page.
    fn write_declaration(&mut self, channel: &mut PageChannel, format: &Format) -> Result<()> {
        let buf = self.holder.set_page(channel, self.decl_page)?;
        {
            let mut page = buf.borrow_mut();
            let decl = &mut page[self.decl_offset..self.decl_offset + format.usage_map_decl_length];
            match &self.variant {
                Variant::Inline { start_page, bits } => {
                    decl[0] = MAP_TYPE_INLINE;
                    LittleEndian::write_i32(
                        &mut decl[format.offset_usage_map_start_page..],
                        *start_page,
                    );
                    write_bitmap(
                        bits,
                        0,
                        &mut decl[format.offset_usage_map_inline_bitmap
                            ..format.offset_usage_map_inline_bitmap
                                + format.usage_map_inline_bitmap_len],
                    );
                }
                Variant::Reference { segment_pages, .. } => {
                    decl[0] = MAP_TYPE_REFERENCE;
                    for (slot, seg_page) in segment_pages.iter().enumerate() {
                        let off = format.offset_reference_map_page_numbers + slot * 4;
                        LittleEndian::write_i32(&mut decl[off..], *seg_page);
                    }
                }
            }
        }
        let borrowed = buf.borrow();
        channel.write_page(&borrowed, self.decl_page)
    }

    /// Smallest owned page >= `from`.
    fn next_owned_page(&self, from: i64) -> Option<PageNum> {
        match &self.variant {
            Variant::Inline { start_page, bits } => {
                let rel_from = (from - *start_page as i64).max(0);
                if rel_from >= inline_capacity() as i64 {
                    return None;
                }
                bits.next_set_bit(rel_from as usize)
                    .map(|b| *start_page + b as PageNum)
            }
            Variant::Reference { bits, .. } => {
                if from < 0 {
                    bits.next_set_bit(0).map(|b| b as PageNum)
                } else {
                    bits.next_set_bit(from as usize).map(|b| b as PageNum)
                }
            }
        }
    }

    /// Largest owned page <= `from`.
    fn prev_owned_page(&self, from: i64) -> Option<PageNum> {
        if from < 0 {
            return None;
        }
        match &self.variant {
            Variant::Inline { start_page, bits } => {
                let rel_from = from - *start_page as i64;
                if rel_from < 0 {
                    return None;
                }
                let rel_from = rel_from.min(inline_capacity() as i64 - 1);
                bits.prev_set_bit(rel_from as usize)
                    .map(|b| *start_page + b as PageNum)
            }
            Variant::Reference { bits, .. } => {
                bits.prev_set_bit(from as usize).map(|b| b as PageNum)
            }
        }
    }

    /// A fresh forward cursor positioned before the first owned page.
    pub fn cursor(&self) -> PageCursor {
        PageCursor {
            reverse: false,
            position: 0,
            last_returned: None,
            mod_snapshot: self.mod_count,
        }
    }

    /// A fresh reverse cursor positioned after the last owned page.
    pub fn cursor_reverse(&self) -> PageCursor {
        PageCursor {
            reverse: true,
            position: i64::MAX,
            last_returned: None,
            mod_snapshot: self.mod_count,
        }
    }

    /// Advances `cursor` and returns the next owned page.
    ///
    /// When a scan comes up empty the cursor re-checks the map's mod
    /// count; if the map changed since the snapshot, the scan resumes
    /// just past the last returned page, so pages set after exhaustion
    /// are picked up while nothing already returned repeats.
    pub fn next_page(&self, cursor: &mut PageCursor) -> Option<PageNum> {
        loop {
            let hit = if cursor.reverse {
                self.prev_owned_page(cursor.position)
            } else {
                self.next_owned_page(cursor.position)
            };
            match hit {
                Some(pn) => {
                    cursor.last_returned = Some(pn);
                    cursor.position = if cursor.reverse {
                        pn as i64 - 1
                    } else {
                        pn as i64 + 1
                    };
                    return Some(pn);
                }
                None => {
                    if cursor.mod_snapshot == self.mod_count {
                        return None;
                    }
                    // The map changed underneath us: resync and rescan
                    // from just past the last page we handed out. If the
                    // rescan finds nothing, the snapshot now matches and
                    // the next pass returns None.
                    cursor.mod_snapshot = self.mod_count;
                    cursor.position = match (cursor.reverse, cursor.last_returned) {
                        (false, Some(pn)) => pn as i64 + 1,
                        (false, None) => 0,
                        (true, Some(pn)) => pn as i64 - 1,
                        (true, None) => i64::MAX,
                    };
                }
            }
        }
    }

    /// Collects every owned page in forward order; handy for scans that
    /// do not interleave with mutation.
    pub fn page_numbers(&self) -> Vec<PageNum> {
        let mut out = Vec::with_capacity(self.page_count());
        let mut cursor = self.cursor();
        while let Some(pn) = self.next_page(&mut cursor) {
            out.push(pn);
        }
        out
    }
}

fn inline_capacity() -> usize {
    // 64-byte bitmap.
    512
}

fn reference_slot_count(format: &Format) -> usize {
    // 16 written + the tolerated 17th on read.
    format.max_reference_map_segments + 1
}

fn read_bitmap(bytes: &[u8], bit_base: usize, bits: &mut BitSet) {
    for (i, b) in bytes.iter().enumerate() {
        let mut b = *b;
        while b != 0 {
            let bit = b.trailing_zeros() as usize;
            bits.set(bit_base + i * 8 + bit);
            b &= b - 1;
        }
    }
}

fn write_bitmap(bits: &BitSet, bit_base: usize, bytes: &mut [u8]) {
    for (i, out) in bytes.iter_mut().enumerate() {
        let mut b = 0_u8;
        for bit in 0..8 {
            if bits.get(bit_base + i * 8 + bit) {
                b |= 1 << bit;
            }
        }
        *out = b;
    }
}

fn allocate_map_page(channel: &mut PageChannel, format: &Format) -> Result<PageNum> {
    let page_number = channel.allocate_new_page()?;
    let mut buf = channel.create_page_buffer();
    buf[0] = page_types::USAGE_MAP;
    buf[1] = 0x01;
    // Bytes 2..4 are format fields of unknown meaning; always zero here.
    channel.write_page(&buf, page_number)?;
    Ok(page_number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::byte_channel::MemoryChannel;
    use crate::codec::IdentityCodec;
    use crate::format::FileFormat;

    fn setup() -> (PageChannel, Format, PageNum) {
        let format = Format::for_file_format(FileFormat::V4);
        let mut pc = PageChannel::new(
            Box::new(MemoryChannel::new()),
            Box::new(IdentityCodec),
            &format,
            false,
        );
        let decl_page = pc.allocate_new_page().unwrap();
        (pc, format, decl_page)
    }

    #[test]
    fn test_bitset_basics() {
        let mut bs = BitSet::new();
        bs.set(3);
        bs.set(64);
        bs.set(200);
        assert!(bs.get(3) && bs.get(64) && bs.get(200));
        assert!(!bs.get(4));
        assert_eq!(bs.count(), 3);
        assert_eq!(bs.next_set_bit(0), Some(3));
        assert_eq!(bs.next_set_bit(4), Some(64));
        assert_eq!(bs.next_set_bit(201), None);
        assert_eq!(bs.prev_set_bit(250), Some(200));
        assert_eq!(bs.prev_set_bit(199), Some(64));
        assert_eq!(bs.prev_set_bit(2), None);
        bs.clear(64);
        assert_eq!(bs.next_set_bit(4), Some(200));
    }

    #[test]
    fn test_bitset_set_range() {
        let mut bs = BitSet::new();
        bs.set_range(512);
        assert_eq!(bs.count(), 512);
        assert!(bs.get(0) && bs.get(511));
        assert!(!bs.get(512));
        bs.set_range(70);
        assert_eq!(bs.count(), 70);
        assert!(bs.get(69) && !bs.get(70));
    }

    #[test]
    fn test_inline_add_remove_roundtrip() {
        let (mut pc, format, decl_page) = setup();
        let mut map = UsageMap::create_inline(&mut pc, &format, decl_page, 100, 0).unwrap();
        map.add_page_number(&mut pc, &format, 5).unwrap();
        map.add_page_number(&mut pc, &format, 17).unwrap();
        assert!(map.contains(5) && map.contains(17));
        map.remove_page_number(&mut pc, &format, 5).unwrap();
        assert!(!map.contains(5));
        assert_eq!(map.page_numbers(), vec![17]);

        // Round trip through the declaration on disk.
        let back = UsageMap::open(&mut pc, &format, decl_page, 100).unwrap();
        assert_eq!(back.page_numbers(), vec![17]);
    }

    #[test]
    fn test_inline_add_below_window_is_error() {
        let (mut pc, format, decl_page) = setup();
        let mut map = UsageMap::create_inline(&mut pc, &format, decl_page, 0, 100).unwrap();
        assert!(map.add_page_number(&mut pc, &format, 99).is_err());
    }

    #[test]
    fn test_inline_window_advance_on_add() {
        // Spec scenario: start at 100, add 100 and 200, then add 612.
        let (mut pc, format, decl_page) = setup();
        let mut map = UsageMap::create_inline(&mut pc, &format, decl_page, 0, 100).unwrap();
        map.add_page_number(&mut pc, &format, 100).unwrap();
        map.add_page_number(&mut pc, &format, 200).unwrap();
        map.add_page_number(&mut pc, &format, 100 + 512).unwrap();
        assert_eq!(map.page_numbers(), vec![612]);
        assert!(!map.contains(100) && !map.contains(200));

        // The advance was persisted.
        let back = UsageMap::open(&mut pc, &format, decl_page, 0).unwrap();
        assert_eq!(back.page_numbers(), vec![612]);
    }

    #[test]
    fn test_inline_window_advance_on_remove_fills() {
        let (mut pc, format, decl_page) = setup();
        let mut map = UsageMap::create_inline(&mut pc, &format, decl_page, 0, 0).unwrap();
        map.add_page_number(&mut pc, &format, 3).unwrap();
        map.remove_page_number(&mut pc, &format, 600).unwrap();
        // The window advanced to 600 and everything in it reads as set.
        assert_eq!(map.page_count(), 512);
        assert!(map.contains(600) && map.contains(600 + 511));
        assert!(!map.contains(3));
        let back = UsageMap::open(&mut pc, &format, decl_page, 0).unwrap();
        assert_eq!(back.page_count(), 512);
    }

    #[test]
    fn test_reference_lazy_segment_allocation() {
        let (mut pc, format, decl_page) = setup();
        let mut map = UsageMap::create_reference(&mut pc, &format, decl_page, 40).unwrap();
        let before = pc.page_count().unwrap();
        map.add_page_number(&mut pc, &format, 40_000).unwrap();
        // One USAGE_MAP page was allocated for the segment.
        assert_eq!(pc.page_count().unwrap(), before + 1);
        assert_eq!(map.page_numbers(), vec![40_000]);

        // The declaration's pointer slot for that segment was patched.
        let slot = 40_000 / format.pages_per_usage_map_page;
        assert_eq!(slot, 1);
        let mut page = pc.create_page_buffer();
        pc.read_page(&mut page, decl_page).unwrap();
        let off = 40 + format.offset_reference_map_page_numbers + slot * 4;
        let seg_page = LittleEndian::read_i32(&page[off..]);
        assert_eq!(seg_page, before as PageNum);
        let mut seg = pc.create_page_buffer();
        pc.read_page(&mut seg, seg_page).unwrap();
        assert_eq!(&seg[0..4], &[page_types::USAGE_MAP, 0x01, 0x00, 0x00]);

        // Reopen from disk and observe the same contents.
        let back = UsageMap::open(&mut pc, &format, decl_page, 40).unwrap();
        assert_eq!(back.page_numbers(), vec![40_000]);
    }

    #[test]
    fn test_reference_remove_from_unallocated_segment_is_noop() {
        let (mut pc, format, decl_page) = setup();
        let mut map = UsageMap::create_reference(&mut pc, &format, decl_page, 0).unwrap();
        let before = pc.page_count().unwrap();
        map.remove_page_number(&mut pc, &format, 70_000).unwrap();
        assert_eq!(pc.page_count().unwrap(), before);
        assert!(map.is_empty());
    }

    #[test]
    fn test_reference_never_writes_seventeenth_segment() {
        let (mut pc, format, decl_page) = setup();
        let mut map = UsageMap::create_reference(&mut pc, &format, decl_page, 0).unwrap();
        let beyond = (format.max_reference_map_segments * format.pages_per_usage_map_page) as PageNum;
        assert!(matches!(
            map.add_page_number(&mut pc, &format, beyond),
            Err(Error::Schema(_))
        ));
    }

    #[test]
    fn test_forward_and_reverse_iteration_order() {
        let (mut pc, format, decl_page) = setup();
        let mut map = UsageMap::create_reference(&mut pc, &format, decl_page, 0).unwrap();
        for pn in [9, 2, 40_000, 77] {
            map.add_page_number(&mut pc, &format, pn).unwrap();
        }
        assert_eq!(map.page_numbers(), vec![2, 9, 77, 40_000]);
        let mut cursor = map.cursor_reverse();
        let mut rev = Vec::new();
        while let Some(pn) = map.next_page(&mut cursor) {
            rev.push(pn);
        }
        assert_eq!(rev, vec![40_000, 77, 9, 2]);
    }

    #[test]
    fn test_cursor_observes_pages_added_after_exhaustion() {
        let (mut pc, format, decl_page) = setup();
        let mut map = UsageMap::create_reference(&mut pc, &format, decl_page, 0).unwrap();
        map.add_page_number(&mut pc, &format, 10).unwrap();
        let mut cursor = map.cursor();
        assert_eq!(map.next_page(&mut cursor), Some(10));
        assert_eq!(map.next_page(&mut cursor), None);

        // New bits past the last returned position show up on re-check;
        // bits before it do not.
        map.add_page_number(&mut pc, &format, 5).unwrap();
        map.add_page_number(&mut pc, &format, 20).unwrap();
        assert_eq!(map.next_page(&mut cursor), Some(20));
        assert_eq!(map.next_page(&mut cursor), None);
    }

    #[test]
    fn test_cursor_unchanged_map_stays_exhausted() {
        let (mut pc, format, decl_page) = setup();
        let mut map = UsageMap::create_reference(&mut pc, &format, decl_page, 0).unwrap();
        map.add_page_number(&mut pc, &format, 1).unwrap();
        let mut cursor = map.cursor();
        assert_eq!(map.next_page(&mut cursor), Some(1));
        assert_eq!(map.next_page(&mut cursor), None);
        assert_eq!(map.next_page(&mut cursor), None);
    }
}
