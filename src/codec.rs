//! Pluggable per-page transforms for encoded/encrypted files.
//!
//! A codec is a pure capability: `decode` reverses whatever `encode`
//! produced for the same page number. Key material and IVs are the
//! provider's business; the core never interprets them.

use crate::error::Result;
use crate::format::Format;

/// Symmetric per-page transform. For all pages `p` and numbers `n`,
/// `decode(encode(p, n, 0), n)` must equal `p` byte for byte.
pub trait PageCodec {
    /// Decodes `page` in place. `page_number` keys page-dependent schemes.
    fn decode(&mut self, page: &mut [u8], page_number: i32) -> Result<()>;

    /// Encodes `page` into a transient output buffer which the caller
    /// writes and discards. `page` itself is not mutated. `page_offset`
    /// is nonzero when only the tail of a page is re-encoded.
    fn encode(&mut self, page: &[u8], page_number: i32, page_offset: usize) -> Result<Vec<u8>>;
}

/// Builds a codec for a newly opened database.
pub trait CodecProvider {
    fn create_codec(&self, format: &Format) -> Result<Box<dyn PageCodec>>;
}

/// The default codec: pages pass through untouched.
pub struct IdentityCodec;

impl PageCodec for IdentityCodec {
    fn decode(&mut self, _page: &mut [u8], _page_number: i32) -> Result<()> {
        Ok(())
    }

    fn encode(&mut self, page: &[u8], _page_number: i32, page_offset: usize) -> Result<Vec<u8>> {
        Ok(page[page_offset..].to_vec())
    }
}

pub struct IdentityCodecProvider;

impl CodecProvider for IdentityCodecProvider {
    fn create_codec(&self, _format: &Format) -> Result<Box<dyn PageCodec>> {
        Ok(Box::new(IdentityCodec))
    }
}
