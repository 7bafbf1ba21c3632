//! Long-value storage: MEMO and OLE content on its own page chain.
//!
//! The row holds a 12-byte descriptor; content at or below the inline
//! threshold follows the descriptor in the row itself, anything larger
//! goes to a chain of LONG_VALUE pages.
//!
//! Descriptor layout:
//! Offset  Size  Description
//! 0       4     content length
//! 4       1     storage flag (0x01 inline, 0x02 paged)
//! 5       1     first-page row number (zero for chained storage)
//! 6       2     reserved, zero
//! 8       4     first LONG_VALUE page (-1 when inline)
//!
//! LONG_VALUE page layout:
//! Offset  Size  Description
//! 0       1     page type (0x06)
//! 1       1     unused
//! 2       2     content bytes on this page
//! 4       4     next page in chain (-1 ends it)
//! 8       ..    content

use byteorder::{ByteOrder, LittleEndian};
use log::debug;

use crate::error::{Error, Result};
use crate::format::{page_types, Format};
use crate::page_channel::{PageChannel, PageNum, INVALID_PAGE_NUMBER};

pub const DESCRIPTOR_SIZE: usize = 12;

const STORAGE_INLINE: u8 = 0x01;
const STORAGE_PAGED: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LongValueRef {
    pub length: u32,
    pub inline: bool,
    pub first_page: PageNum,
}

fn write_descriptor(out: &mut Vec<u8>, lv: &LongValueRef) {
    let mut d = [0_u8; DESCRIPTOR_SIZE];
    LittleEndian::write_u32(&mut d[0..], lv.length);
    d[4] = if lv.inline { STORAGE_INLINE } else { STORAGE_PAGED };
    d[5] = 0;
    LittleEndian::write_i32(&mut d[8..], lv.first_page);
    out.extend_from_slice(&d);
}

pub fn read_descriptor(slot: &[u8]) -> Result<LongValueRef> {
    if slot.len() < DESCRIPTOR_SIZE {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("long value slot of {} bytes is too short", slot.len()),
        )));
    }
    let length = LittleEndian::read_u32(&slot[0..]);
    let inline = match slot[4] {
        STORAGE_INLINE => true,
        STORAGE_PAGED => false,
        b => {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unrecognized long value storage flag {:#04x}", b),
            )))
        }
    };
    let first_page = LittleEndian::read_i32(&slot[8..]);
    Ok(LongValueRef {
        length,
        inline,
        first_page,
    })
}

/// Stores `content`, returning the var-slot bytes for the row and the
/// LONG_VALUE pages allocated (the caller adds them to the table's
/// owned-pages map).
pub fn write_long_value(
    channel: &mut PageChannel,
    format: &Format,
    content: &[u8],
) -> Result<(Vec<u8>, Vec<PageNum>)> {
    let mut slot = Vec::with_capacity(DESCRIPTOR_SIZE + content.len().min(64));
    if content.len() <= format.max_inline_long_value_size {
        write_descriptor(
            &mut slot,
            &LongValueRef {
                length: content.len() as u32,
                inline: true,
                first_page: INVALID_PAGE_NUMBER,
            },
        );
        slot.extend_from_slice(content);
        return Ok((slot, Vec::new()));
    }

    let capacity = format.page_size - format.offset_long_value_content;
    let mut pages = Vec::new();
    for _ in content.chunks(capacity) {
        pages.push(channel.allocate_new_page()?);
    }
    debug!(
        "long value of {} bytes spans {} pages",
        content.len(),
        pages.len()
    );
    for (i, chunk) in content.chunks(capacity).enumerate() {
        let mut page = channel.create_page_buffer();
        page[0] = page_types::LONG_VALUE;
        LittleEndian::write_u16(&mut page[format.offset_long_value_len..], chunk.len() as u16);
        let next = pages.get(i + 1).copied().unwrap_or(INVALID_PAGE_NUMBER);
        LittleEndian::write_i32(&mut page[format.offset_long_value_next..], next);
        page[format.offset_long_value_content..format.offset_long_value_content + chunk.len()]
            .copy_from_slice(chunk);
        channel.write_page(&page, pages[i])?;
    }
    write_descriptor(
        &mut slot,
        &LongValueRef {
            length: content.len() as u32,
            inline: false,
            first_page: pages[0],
        },
    );
    Ok((slot, pages))
}

/// Reads the full content addressed by a var slot written by
/// `write_long_value`.
pub fn read_long_value(
    channel: &mut PageChannel,
    format: &Format,
    slot: &[u8],
) -> Result<Vec<u8>> {
    let lv = read_descriptor(slot)?;
    if lv.inline {
        let content = &slot[DESCRIPTOR_SIZE..];
        if content.len() < lv.length as usize {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "inline long value shorter than its declared length",
            )));
        }
        return Ok(content[..lv.length as usize].to_vec());
    }

    let mut out = Vec::with_capacity(lv.length as usize);
    let mut page_number = lv.first_page;
    let mut buf = channel.create_page_buffer();
    while page_number != INVALID_PAGE_NUMBER {
        if out.len() > lv.length as usize {
            return Err(Error::MalformedPage {
                page_number,
                reason: String::from("long value chain longer than its declared length"),
            });
        }
        channel.read_page(&mut buf, page_number)?;
        if buf[0] != page_types::LONG_VALUE {
            return Err(Error::UnrecognizedPageType {
                page_number,
                type_byte: buf[0],
            });
        }
        let len = LittleEndian::read_u16(&buf[format.offset_long_value_len..]) as usize;
        if format.offset_long_value_content + len > format.page_size {
            return Err(Error::MalformedPage {
                page_number,
                reason: String::from("long value chunk overruns its page"),
            });
        }
        out.extend_from_slice(
            &buf[format.offset_long_value_content..format.offset_long_value_content + len],
        );
        page_number = LittleEndian::read_i32(&buf[format.offset_long_value_next..]);
    }
    if out.len() != lv.length as usize {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!(
                "long value chain yielded {} bytes, descriptor says {}",
                out.len(),
                lv.length
            ),
        )));
    }
    Ok(out)
}

/// Pages owned by the value a var slot points at; empty for inline
/// storage. Used when a row is deleted to move its chain to the free map.
pub fn chain_pages(
    channel: &mut PageChannel,
    format: &Format,
    slot: &[u8],
) -> Result<Vec<PageNum>> {
    let lv = read_descriptor(slot)?;
    if lv.inline {
        return Ok(Vec::new());
    }
    let mut pages = Vec::new();
    let mut page_number = lv.first_page;
    let mut buf = channel.create_page_buffer();
    while page_number != INVALID_PAGE_NUMBER {
        pages.push(page_number);
        if pages.len() > (lv.length as usize / (format.page_size - format.offset_long_value_content)) + 2 {
            return Err(Error::MalformedPage {
                page_number,
                reason: String::from("long value chain does not terminate"),
            });
        }
        channel.read_page(&mut buf, page_number)?;
        page_number = LittleEndian::read_i32(&buf[format.offset_long_value_next..]);
    }
    Ok(pages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::byte_channel::MemoryChannel;
    use crate::codec::IdentityCodec;
    use crate::format::FileFormat;

    fn setup() -> (PageChannel, Format) {
        let format = Format::for_file_format(FileFormat::V4);
        let pc = PageChannel::new(
            Box::new(MemoryChannel::new()),
            Box::new(IdentityCodec),
            &format,
            false,
        );
        (pc, format)
    }

    #[test]
    fn test_inline_roundtrip() {
        let (mut pc, format) = setup();
        let content = b"short memo";
        let (slot, pages) = write_long_value(&mut pc, &format, content).unwrap();
        assert!(pages.is_empty());
        assert_eq!(slot.len(), DESCRIPTOR_SIZE + content.len());
        assert_eq!(read_long_value(&mut pc, &format, &slot).unwrap(), content);
        assert!(chain_pages(&mut pc, &format, &slot).unwrap().is_empty());
    }

    #[test]
    fn test_paged_roundtrip_20k() {
        let (mut pc, format) = setup();
        let content: Vec<u8> = (0..20_000_u32).map(|i| (i % 253) as u8).collect();
        let (slot, pages) = write_long_value(&mut pc, &format, &content).unwrap();
        assert_eq!(slot.len(), DESCRIPTOR_SIZE);
        // 4088 content bytes per page.
        assert_eq!(pages.len(), 5);
        assert_eq!(read_long_value(&mut pc, &format, &slot).unwrap(), content);
        assert_eq!(chain_pages(&mut pc, &format, &slot).unwrap(), pages);

        // The first chained page is typed LONG_VALUE.
        let mut buf = pc.create_page_buffer();
        pc.read_page(&mut buf, pages[0]).unwrap();
        assert_eq!(buf[0], page_types::LONG_VALUE);
    }

    #[test]
    fn test_exact_page_boundary() {
        let (mut pc, format) = setup();
        let capacity = format.page_size - format.offset_long_value_content;
        let content = vec![0x5c_u8; capacity];
        let (slot, pages) = write_long_value(&mut pc, &format, &content).unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(read_long_value(&mut pc, &format, &slot).unwrap(), content);
    }

    #[test]
    fn test_descriptor_rejects_garbage() {
        assert!(read_descriptor(&[0; 4]).is_err());
        let mut slot = vec![0_u8; DESCRIPTOR_SIZE];
        slot[4] = 0x7f;
        assert!(read_descriptor(&slot).is_err());
    }
}
