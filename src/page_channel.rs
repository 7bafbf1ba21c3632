//! Page-sized buffered I/O over a byte channel, through the page codec.
//!
//! Components share one `PageChannel` per database handle. Writers wrap
//! multi-page mutations in `start_write`/`finish_write`; the channel defers
//! durability to the final `finish_write` unless `auto_sync` is on.

use log::debug;

use crate::byte_channel::ByteChannel;
use crate::codec::PageCodec;
use crate::error::{Error, Result};
use crate::format::Format;

pub type PageNum = i32;

/// Sentinel meaning "no page".
pub const INVALID_PAGE_NUMBER: PageNum = -1;

pub struct PageChannel {
    channel: Box<dyn ByteChannel>,
    codec: Box<dyn PageCodec>,
    page_size: usize,
    auto_sync: bool,
    write_count: u32,
}

impl PageChannel {
    pub fn new(
        channel: Box<dyn ByteChannel>,
        codec: Box<dyn PageCodec>,
        format: &Format,
        auto_sync: bool,
    ) -> PageChannel {
        PageChannel {
            channel,
            codec,
            page_size: format.page_size,
            auto_sync,
            write_count: 0,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn is_read_only(&self) -> bool {
        self.channel.is_read_only()
    }

    /// Number of whole pages in the channel.
    pub fn page_count(&self) -> Result<u32> {
        Ok((self.channel.size()? / self.page_size as u64) as u32)
    }

    fn check_page_number(&self, page_number: PageNum) -> Result<()> {
        if page_number < 0 {
            return Err(Error::MalformedPage {
                page_number,
                reason: String::from("negative page number"),
            });
        }
        Ok(())
    }

    /// Fills `buf` (which must be page-sized) with the decoded contents of
    /// `page_number`.
    pub fn read_page(&mut self, buf: &mut [u8], page_number: PageNum) -> Result<()> {
        self.check_page_number(page_number)?;
        debug_assert_eq!(buf.len(), self.page_size);
        self.channel
            .read(page_number as u64 * self.page_size as u64, buf)?;
        self.codec.decode(buf, page_number)?;
        Ok(())
    }

    /// Encodes and writes a whole page. The input buffer is not mutated;
    /// the codec's output buffer is written and discarded.
    pub fn write_page(&mut self, buf: &[u8], page_number: PageNum) -> Result<()> {
        self.write_page_part(buf, page_number, 0)
    }

    /// Writes the tail of a page starting at `page_offset`.
    pub fn write_page_part(&mut self, buf: &[u8], page_number: PageNum, page_offset: usize) -> Result<()> {
        self.check_page_number(page_number)?;
        debug_assert_eq!(buf.len(), self.page_size);
        let encoded = self.codec.encode(buf, page_number, page_offset)?;
        if encoded.len() != self.page_size - page_offset {
            return Err(Error::Invariant(format!(
                "codec produced {} bytes for a {}-byte page region",
                encoded.len(),
                self.page_size - page_offset
            )));
        }
        self.channel.write(
            page_number as u64 * self.page_size as u64 + page_offset as u64,
            &encoded,
        )?;
        if self.auto_sync && self.write_count == 0 {
            self.channel.flush()?;
        }
        Ok(())
    }

    /// Extends the channel by one zero page and returns its number. The
    /// length change and the zero fill become observable together: the
    /// write of the zero page is what grows the channel.
    pub fn allocate_new_page(&mut self) -> Result<PageNum> {
        let page_number = self.page_count()? as PageNum;
        let zeros = vec![0_u8; self.page_size];
        self.channel
            .write(page_number as u64 * self.page_size as u64, &zeros)?;
        debug!("allocated page {}", page_number);
        Ok(page_number)
    }

    /// A page-sized zero buffer; layout code fills it in.
    pub fn create_page_buffer(&self) -> Vec<u8> {
        vec![0_u8; self.page_size]
    }

    /// A little-endian scratch buffer of arbitrary size.
    pub fn create_buffer(&self, size: usize) -> Vec<u8> {
        vec![0_u8; size]
    }

    /// Acquires the advisory write guard. Nesting is reference-counted.
    pub fn start_write(&mut self) {
        self.write_count += 1;
    }

    /// Releases the write guard; the outermost release flushes. An
    /// unbalanced release is a programming error.
    pub fn finish_write(&mut self) -> Result<()> {
        if self.write_count == 0 {
            return Err(Error::UnbalancedWriteGuard);
        }
        self.write_count -= 1;
        if self.write_count == 0 {
            self.channel.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.channel.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::byte_channel::MemoryChannel;
    use crate::codec::IdentityCodec;
    use crate::format::{FileFormat, Format};

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
    fn test_allocate_and_rw_page() {
        let mut pc = new_channel();
        let p0 = pc.allocate_new_page().unwrap();
        let p1 = pc.allocate_new_page().unwrap();
        assert_eq!((p0, p1), (0, 1));
        assert_eq!(pc.page_count().unwrap(), 2);

        let mut buf = pc.create_page_buffer();
        buf[0] = 0x42;
        buf[4095] = 0x99;
        pc.write_page(&buf, 1).unwrap();

        let mut back = pc.create_page_buffer();
        pc.read_page(&mut back, 1).unwrap();
        assert_eq!(back, buf);

        // Page 0 is still all zeros.
        pc.read_page(&mut back, 0).unwrap();
        assert!(back.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_negative_page_number_rejected() {
        let mut pc = new_channel();
        let mut buf = pc.create_page_buffer();
        assert!(pc.read_page(&mut buf, -1).is_err());
    }

    #[test]
    fn test_write_guard_balance() {
        let mut pc = new_channel();
        pc.start_write();
        pc.start_write();
        pc.finish_write().unwrap();
        pc.finish_write().unwrap();
        assert!(matches!(
            pc.finish_write(),
            Err(Error::UnbalancedWriteGuard)
        ));
    }

    #[test]
    fn test_write_page_part() {
        let mut pc = new_channel();
        pc.allocate_new_page().unwrap();
        let mut buf = pc.create_page_buffer();
        buf.fill(0xaa);
        pc.write_page(&buf, 0).unwrap();

        buf[4000] = 0x01;
        pc.write_page_part(&buf, 0, 4000).unwrap();
        let mut back = pc.create_page_buffer();
        pc.read_page(&mut back, 0).unwrap();
        assert_eq!(back[3999], 0xaa);
        assert_eq!(back[4000], 0x01);
        assert_eq!(back[4095], 0xaa);
    }
}
