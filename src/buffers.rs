//! Scoped reusable temporary buffers.
//!
//! Components keep page-sized scratch buffers in holders instead of
//! allocating per call. Retention picks what happens between uses: `Hard`
//! keeps the buffer alive, `Soft` lets it be collected once no caller
//! holds it, `None` hands out a fresh buffer every time. A holder's
//! mod-count increments whenever a new underlying buffer is allocated, so
//! consumers can detect re-allocation.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::error::Result;
use crate::page_channel::{PageChannel, PageNum, INVALID_PAGE_NUMBER};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    Hard,
    Soft,
    None,
}

pub struct TempBufferHolder {
    retention: Retention,
    size: usize,
    hard: Option<Rc<RefCell<Vec<u8>>>>,
    soft: Weak<RefCell<Vec<u8>>>,
    mod_count: u64,
}

impl TempBufferHolder {
    pub fn new(retention: Retention, size: usize) -> TempBufferHolder {
        TempBufferHolder {
            retention,
            size,
            hard: None,
            soft: Weak::new(),
            mod_count: 0,
        }
    }

    /// Monotonically increasing count of underlying buffer allocations.
    pub fn mod_count(&self) -> u64 {
        self.mod_count
    }

    /// Returns the held buffer, allocating one if this holder retains
    /// nothing (never allocated, cleared, or collected).
    pub fn get_buffer(&mut self) -> Rc<RefCell<Vec<u8>>> {
        match self.retention {
            Retention::Hard => {
                if let Some(buf) = &self.hard {
                    return Rc::clone(buf);
                }
                let buf = self.alloc();
                self.hard = Some(Rc::clone(&buf));
                buf
            }
            Retention::Soft => {
                if let Some(buf) = self.soft.upgrade() {
                    return buf;
                }
                let buf = self.alloc();
                self.soft = Rc::downgrade(&buf);
                buf
            }
            Retention::None => self.alloc(),
        }
    }

    fn alloc(&mut self) -> Rc<RefCell<Vec<u8>>> {
        self.mod_count += 1;
        Rc::new(RefCell::new(vec![0_u8; self.size]))
    }

    /// Drops the retained buffer. The next `get_buffer` allocates.
    pub fn clear(&mut self) {
        self.hard = None;
        self.soft = Weak::new();
    }
}

/// A page-sized holder that also remembers which page is loaded.
pub struct TempPageHolder {
    holder: TempBufferHolder,
    page_number: PageNum,
}

impl TempPageHolder {
    pub fn new(retention: Retention, page_size: usize) -> TempPageHolder {
        TempPageHolder {
            holder: TempBufferHolder::new(retention, page_size),
            page_number: INVALID_PAGE_NUMBER,
        }
    }

    pub fn current_page_number(&self) -> PageNum {
        self.page_number
    }

    pub fn mod_count(&self) -> u64 {
        self.holder.mod_count()
    }

    /// Buffer for the currently loaded page; re-reads if the buffer was
    /// collected out from under us.
    pub fn get_page(&mut self, channel: &mut PageChannel) -> Result<Rc<RefCell<Vec<u8>>>> {
        let page_number = self.page_number;
        self.set_page_internal(channel, page_number, true)
    }

    /// Loads `page_number` if it differs from the current page (or the
    /// buffer went away) and returns the buffer.
    pub fn set_page(
        &mut self,
        channel: &mut PageChannel,
        page_number: PageNum,
    ) -> Result<Rc<RefCell<Vec<u8>>>> {
        self.set_page_internal(channel, page_number, false)
    }

    fn set_page_internal(
        &mut self,
        channel: &mut PageChannel,
        page_number: PageNum,
        require_current: bool,
    ) -> Result<Rc<RefCell<Vec<u8>>>> {
        if require_current {
            debug_assert_ne!(page_number, INVALID_PAGE_NUMBER, "no current page");
        }
        let count_before = self.holder.mod_count();
        let buf = self.holder.get_buffer();
        if page_number != self.page_number || self.holder.mod_count() != count_before {
            channel.read_page(&mut buf.borrow_mut(), page_number)?;
            self.page_number = page_number;
        }
        Ok(buf)
    }

    /// Begins an allocate-then-name sequence: hands out a zeroed buffer
    /// with no page number attached.
    pub fn start_new_page(&mut self, _channel: &PageChannel) -> Rc<RefCell<Vec<u8>>> {
        self.page_number = INVALID_PAGE_NUMBER;
        let buf = self.holder.get_buffer();
        buf.borrow_mut().fill(0);
        buf
    }

    /// Completes the sequence begun by `start_new_page`.
    pub fn finish_new_page(&mut self, page_number: PageNum) {
        self.page_number = page_number;
    }

    /// Cooperates with a writer that may have dirtied the held page: if
    /// `page_number` is what we hold, adopt the writer's bytes (when
    /// given) or forget the page entirely.
    pub fn possibly_invalidate(&mut self, page_number: PageNum, new_contents: Option<&[u8]>) {
        if page_number != self.page_number {
            return;
        }
        match new_contents {
            Some(bytes) => {
                let buf = self.holder.get_buffer();
                buf.borrow_mut().copy_from_slice(bytes);
            }
            None => self.invalidate(),
        }
    }

    pub fn invalidate(&mut self) {
        self.page_number = INVALID_PAGE_NUMBER;
    }

    pub fn clear(&mut self) {
        self.page_number = INVALID_PAGE_NUMBER;
        self.holder.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::byte_channel::MemoryChannel;
    use crate::codec::IdentityCodec;
    use crate::format::{FileFormat, Format};

    #[test]
    fn test_hard_retention_reuses_buffer() {
        let mut h = TempBufferHolder::new(Retention::Hard, 16);
        let b1 = h.get_buffer();
        b1.borrow_mut()[0] = 0x55;
        drop(b1);
        let b2 = h.get_buffer();
        assert_eq!(b2.borrow()[0], 0x55);
        assert_eq!(h.mod_count(), 1);
    }

    #[test]
    fn test_soft_retention_collected_when_unused() {
        let mut h = TempBufferHolder::new(Retention::Soft, 16);
        let b1 = h.get_buffer();
        let b1_again = h.get_buffer();
        assert!(Rc::ptr_eq(&b1, &b1_again));
        assert_eq!(h.mod_count(), 1);
        drop(b1);
        drop(b1_again);
        // Nothing holds the buffer now; the next get allocates afresh.
        let _b2 = h.get_buffer();
        assert_eq!(h.mod_count(), 2);
    }

    #[test]
    fn test_none_retention_always_fresh() {
        let mut h = TempBufferHolder::new(Retention::None, 16);
        let b1 = h.get_buffer();
        let b2 = h.get_buffer();
        assert!(!Rc::ptr_eq(&b1, &b2));
        assert_eq!(h.mod_count(), 2);
    }

    #[test]
    fn test_clear_forces_reallocation() {
        let mut h = TempBufferHolder::new(Retention::Hard, 16);
        let _ = h.get_buffer();
        h.clear();
        let _ = h.get_buffer();
        assert_eq!(h.mod_count(), 2);
    }

    fn new_channel() -> PageChannel {
        let format = Format::for_file_format(FileFormat::V4);
        PageChannel::new(
            Box::new(MemoryChannel::new()),
            Box::new(IdentityCodec),
            &format,
            false,
        )
    }

    #[test]
    fn test_page_holder_set_page_caches() {
        let mut pc = new_channel();
        let p0 = pc.allocate_new_page().unwrap();
        let mut buf = pc.create_page_buffer();
        buf[7] = 0x77;
        pc.write_page(&buf, p0).unwrap();

        let mut holder = TempPageHolder::new(Retention::Hard, pc.page_size());
        let b = holder.set_page(&mut pc, p0).unwrap();
        assert_eq!(b.borrow()[7], 0x77);
        assert_eq!(holder.current_page_number(), p0);

        // Same page: no re-read; a scribble in the buffer survives.
        b.borrow_mut()[7] = 0x00;
        drop(b);
        let b = holder.set_page(&mut pc, p0).unwrap();
        assert_eq!(b.borrow()[7], 0x00);
    }

    #[test]
    fn test_page_holder_start_finish_new_page() {
        let mut pc = new_channel();
        let mut holder = TempPageHolder::new(Retention::Hard, pc.page_size());
        let buf = holder.start_new_page(&pc);
        assert_eq!(holder.current_page_number(), INVALID_PAGE_NUMBER);
        buf.borrow_mut()[0] = 0x05;
        let pn = pc.allocate_new_page().unwrap();
        pc.write_page(&buf.borrow(), pn).unwrap();
        holder.finish_new_page(pn);
        assert_eq!(holder.current_page_number(), pn);
    }

    #[test]
    fn test_page_holder_possibly_invalidate() {
        let mut pc = new_channel();
        let p0 = pc.allocate_new_page().unwrap();
        let mut holder = TempPageHolder::new(Retention::Hard, pc.page_size());
        holder.set_page(&mut pc, p0).unwrap();

        // A writer dirtied some other page: nothing happens.
        holder.possibly_invalidate(p0 + 1, None);
        assert_eq!(holder.current_page_number(), p0);

        // A writer dirtied our page and gave us the bytes: adopt them.
        let mut dirty = pc.create_page_buffer();
        dirty[3] = 0x33;
        holder.possibly_invalidate(p0, Some(&dirty));
        let b = holder.get_page(&mut pc).unwrap();
        assert_eq!(b.borrow()[3], 0x33);
        drop(b);

        // A writer dirtied our page without bytes: forget it.
        holder.possibly_invalidate(p0, None);
        assert_eq!(holder.current_page_number(), INVALID_PAGE_NUMBER);
    }
}
