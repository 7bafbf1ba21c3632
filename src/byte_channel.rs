//! Random-access byte channels backing a database.
//!
//! A database reads and writes through a `ByteChannel`, which is either a
//! disk file or an in-memory chunk table. Every access made by the page
//! channel is page-aligned and page-sized, and the page size divides the
//! chunk size, so a single access never straddles a chunk boundary.

use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::{Error, Result};

/// Random-access read/write over the bytes of a database file.
pub trait ByteChannel {
    /// Fills `buf` from the channel starting at `pos`.
    fn read(&mut self, pos: u64, buf: &mut [u8]) -> Result<()>;
    /// Writes all of `buf` to the channel starting at `pos`, growing it if needed.
    fn write(&mut self, pos: u64, buf: &[u8]) -> Result<()>;
    /// Current channel length in bytes.
    fn size(&self) -> Result<u64>;
    /// Shrinks (or grows) the channel to exactly `new_size` bytes.
    fn truncate(&mut self, new_size: u64) -> Result<()>;
    /// Forces buffered bytes to the backing store.
    fn flush(&mut self) -> Result<()>;
    /// True when writes are rejected.
    fn is_read_only(&self) -> bool {
        false
    }
}

impl ByteChannel for Box<dyn ByteChannel> {
    fn read(&mut self, pos: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read(pos, buf)
    }

    fn write(&mut self, pos: u64, buf: &[u8]) -> Result<()> {
        (**self).write(pos, buf)
    }

    fn size(&self) -> Result<u64> {
        (**self).size()
    }

    fn truncate(&mut self, new_size: u64) -> Result<()> {
        (**self).truncate(new_size)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }

    fn is_read_only(&self) -> bool {
        (**self).is_read_only()
    }
}

const CHUNK_SIZE: usize = 4096;
const INITIAL_CHUNK_TABLE_LEN: usize = 128;

/// Keeps the whole "file" as an expanding table of fixed-size chunks.
///
/// Chunks are allocated on first touch. The chunk table starts with room
/// for 128 entries and doubles when it runs out, so repeated appends do
/// not re-copy chunk contents, only the table of pointers.
pub struct MemoryChannel {
    chunks: Vec<Option<Box<[u8; CHUNK_SIZE]>>>,
    size: u64,
}

impl MemoryChannel {
    pub fn new() -> MemoryChannel {
        MemoryChannel {
            chunks: Vec::with_capacity(INITIAL_CHUNK_TABLE_LEN),
            size: 0,
        }
    }

    /// Builds a channel holding a copy of `data`, e.g. a database file
    /// slurped from elsewhere.
    pub fn from_bytes(data: &[u8]) -> MemoryChannel {
        let mut ch = MemoryChannel::new();
        let mut pos = 0_u64;
        for chunk in data.chunks(CHUNK_SIZE) {
            ch.write(pos, chunk).expect("memory write cannot fail");
            pos += chunk.len() as u64;
        }
        ch
    }

    /// Number of chunks currently resident. Exposed so tests can observe
    /// `truncate` releasing memory.
    pub fn resident_chunks(&self) -> usize {
        self.chunks.iter().filter(|c| c.is_some()).count()
    }

    fn ensure_chunk_table(&mut self, chunk_idx: usize) {
        if chunk_idx >= self.chunks.len() {
            if chunk_idx >= self.chunks.capacity() {
                let mut new_cap = self.chunks.capacity().max(INITIAL_CHUNK_TABLE_LEN);
                while new_cap <= chunk_idx {
                    new_cap *= 2;
                }
                self.chunks.reserve_exact(new_cap - self.chunks.len());
            }
            self.chunks.resize_with(chunk_idx + 1, || None);
        }
    }

    fn chunk_mut(&mut self, chunk_idx: usize) -> &mut [u8; CHUNK_SIZE] {
        self.ensure_chunk_table(chunk_idx);
        self.chunks[chunk_idx].get_or_insert_with(|| Box::new([0_u8; CHUNK_SIZE]))
    }
}

impl Default for MemoryChannel {
    fn default() -> Self {
        MemoryChannel::new()
    }
}

impl ByteChannel for MemoryChannel {
    fn read(&mut self, pos: u64, buf: &mut [u8]) -> Result<()> {
        if pos + buf.len() as u64 > self.size {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("read of {} bytes at {} past channel size {}", buf.len(), pos, self.size),
            )));
        }
        let chunk_idx = (pos / CHUNK_SIZE as u64) as usize;
        let offset = (pos % CHUNK_SIZE as u64) as usize;
        debug_assert!(offset + buf.len() <= CHUNK_SIZE);
        match self.chunks.get(chunk_idx).and_then(|c| c.as_ref()) {
            Some(chunk) => buf.copy_from_slice(&chunk[offset..offset + buf.len()]),
            // A chunk inside the channel size that was never written reads as zeros.
            None => buf.fill(0),
        }
        Ok(())
    }

    fn write(&mut self, pos: u64, buf: &[u8]) -> Result<()> {
        let chunk_idx = (pos / CHUNK_SIZE as u64) as usize;
        let offset = (pos % CHUNK_SIZE as u64) as usize;
        debug_assert!(offset + buf.len() <= CHUNK_SIZE);
        let chunk = self.chunk_mut(chunk_idx);
        chunk[offset..offset + buf.len()].copy_from_slice(buf);
        self.size = self.size.max(pos + buf.len() as u64);
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.size)
    }

    fn truncate(&mut self, new_size: u64) -> Result<()> {
        // Drop every chunk that lies entirely above the new size, eagerly.
        let keep_chunks = ((new_size + CHUNK_SIZE as u64 - 1) / CHUNK_SIZE as u64) as usize;
        if keep_chunks < self.chunks.len() {
            self.chunks.truncate(keep_chunks);
        }
        // Zero the tail of the last kept chunk so re-growth reads zeros.
        let tail = (new_size % CHUNK_SIZE as u64) as usize;
        if tail > 0 && new_size < self.size {
            if let Some(Some(chunk)) = self.chunks.last_mut().map(|c| c.as_mut()) {
                chunk[tail..].fill(0);
            }
        }
        self.size = new_size;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

impl MemoryChannel {
    /// Streams the whole channel contents into `w`.
    pub fn transfer_to<W: Write>(&self, w: &mut W) -> Result<u64> {
        let mut written = 0_u64;
        let mut remaining = self.size;
        for chunk in &self.chunks {
            if remaining == 0 {
                break;
            }
            let take = remaining.min(CHUNK_SIZE as u64) as usize;
            match chunk {
                Some(c) => w.write_all(&c[..take])?,
                None => w.write_all(&vec![0_u8; take])?,
            }
            written += take as u64;
            remaining -= take as u64;
        }
        Ok(written)
    }

    /// Replaces the channel contents by draining `r` to its end.
    pub fn transfer_from<R: Read>(&mut self, r: &mut R) -> Result<u64> {
        self.truncate(0)?;
        let mut pos = 0_u64;
        let mut buf = [0_u8; CHUNK_SIZE];
        loop {
            let n = r.read(&mut buf)?;
            if n == 0 {
                break;
            }
            self.write(pos, &buf[..n])?;
            pos += n as u64;
        }
        Ok(pos)
    }
}

/// Disk-backed channel; positioning and durability delegate to the host OS.
pub struct FileChannel {
    f: std::fs::File,
}

impl FileChannel {
    pub fn open(path: &std::path::Path, writable: bool) -> Result<FileChannel> {
        let f = std::fs::OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)?;
        Ok(FileChannel { f })
    }

    pub fn create(path: &std::path::Path) -> Result<FileChannel> {
        let f = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(FileChannel { f })
    }
}

impl ByteChannel for FileChannel {
    fn read(&mut self, pos: u64, buf: &mut [u8]) -> Result<()> {
        self.f.seek(SeekFrom::Start(pos))?;
        self.f.read_exact(buf)?;
        Ok(())
    }

    fn write(&mut self, pos: u64, buf: &[u8]) -> Result<()> {
        self.f.seek(SeekFrom::Start(pos))?;
        self.f.write_all(buf)?;
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.f.metadata()?.len())
    }

    fn truncate(&mut self, new_size: u64) -> Result<()> {
        self.f.set_len(new_size)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.f.sync_data()?;
        Ok(())
    }
}

/// Converts every mutation into a hard failure; used for `read_only` opens.
pub struct ReadOnlyChannel<C: ByteChannel> {
    inner: C,
}

impl<C: ByteChannel> ReadOnlyChannel<C> {
    pub fn new(inner: C) -> ReadOnlyChannel<C> {
        ReadOnlyChannel { inner }
    }
}

impl<C: ByteChannel> ByteChannel for ReadOnlyChannel<C> {
    fn read(&mut self, pos: u64, buf: &mut [u8]) -> Result<()> {
        self.inner.read(pos, buf)
    }

    fn write(&mut self, _pos: u64, _buf: &[u8]) -> Result<()> {
        Err(Error::ReadOnly)
    }

    fn size(&self) -> Result<u64> {
        self.inner.size()
    }

    fn truncate(&mut self, _new_size: u64) -> Result<()> {
        Err(Error::ReadOnly)
    }

    fn flush(&mut self) -> Result<()> {
        // Nothing buffered; nothing to do.
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        true
    }
}

#[test]
fn test_memory_channel_read_write_roundtrip() {
    let mut ch = MemoryChannel::new();
    ch.write(0, &[1, 2, 3, 4]).unwrap();
    ch.write(4096, &[9; 16]).unwrap();
    assert_eq!(ch.size().unwrap(), 4096 + 16);

    let mut buf = [0_u8; 4];
    ch.read(0, &mut buf).unwrap();
    assert_eq!(buf, [1, 2, 3, 4]);
    let mut buf = [0_u8; 16];
    ch.read(4096, &mut buf).unwrap();
    assert_eq!(buf, [9; 16]);
}

#[test]
fn test_memory_channel_unwritten_gap_reads_zero() {
    let mut ch = MemoryChannel::new();
    ch.write(2 * 4096, &[7; 8]).unwrap();
    let mut buf = [0xff_u8; 8];
    ch.read(4096, &mut buf).unwrap();
    assert_eq!(buf, [0; 8]);
}

#[test]
fn test_memory_channel_read_past_end_fails() {
    let mut ch = MemoryChannel::new();
    ch.write(0, &[1; 8]).unwrap();
    let mut buf = [0_u8; 8];
    assert!(ch.read(4, &mut buf).is_err());
}

#[test]
fn test_memory_channel_truncate_releases_chunks() {
    let mut ch = MemoryChannel::new();
    for i in 0..10 {
        ch.write(i * 4096, &[i as u8 + 1; 4096]).unwrap();
    }
    assert_eq!(ch.resident_chunks(), 10);
    ch.truncate(3 * 4096).unwrap();
    assert_eq!(ch.size().unwrap(), 3 * 4096);
    assert_eq!(ch.resident_chunks(), 3);

    // Regrown region reads as zeros.
    ch.write(5 * 4096, &[1; 1]).unwrap();
    let mut buf = [0xff_u8; 16];
    ch.read(3 * 4096, &mut buf).unwrap();
    assert_eq!(buf, [0; 16]);
}

#[test]
fn test_memory_channel_truncate_zeroes_partial_chunk_tail() {
    let mut ch = MemoryChannel::new();
    ch.write(0, &[0xaa; 4096]).unwrap();
    ch.truncate(100).unwrap();
    ch.write(200, &[1; 1]).unwrap();
    let mut buf = [0_u8; 1];
    ch.read(150, &mut buf).unwrap();
    assert_eq!(buf[0], 0);
}

#[test]
fn test_memory_channel_transfer_roundtrip() {
    let mut ch = MemoryChannel::new();
    let data: Vec<u8> = (0..10_000_u32).map(|i| (i % 251) as u8).collect();
    ch.transfer_from(&mut std::io::Cursor::new(&data)).unwrap();
    assert_eq!(ch.size().unwrap(), data.len() as u64);

    let mut out = Vec::new();
    ch.transfer_to(&mut out).unwrap();
    assert_eq!(out, data);
}

#[test]
fn test_read_only_channel_rejects_writes() {
    let mut inner = MemoryChannel::new();
    inner.write(0, &[1, 2, 3]).unwrap();
    let mut ro = ReadOnlyChannel::new(inner);
    let mut buf = [0_u8; 3];
    ro.read(0, &mut buf).unwrap();
    assert_eq!(buf, [1, 2, 3]);
    assert!(matches!(ro.write(0, &[9]), Err(Error::ReadOnly)));
    assert!(matches!(ro.truncate(0), Err(Error::ReadOnly)));
    assert!(ro.is_read_only());
}

#[test]
fn test_file_channel_roundtrip() {
    let dir = tempfile::tempdir().expect("Should have created temp dir.");
    let path = dir.path().join("channel.bin");
    let mut ch = FileChannel::create(&path).expect("Should have created file channel.");
    ch.write(0, &[5; 64]).unwrap();
    ch.write(4096, &[6; 64]).unwrap();
    ch.flush().unwrap();
    assert_eq!(ch.size().unwrap(), 4096 + 64);

    let mut ch = FileChannel::open(&path, false).expect("Should have reopened file channel.");
    let mut buf = [0_u8; 64];
    ch.read(4096, &mut buf).unwrap();
    assert_eq!(buf, [6; 64]);
}
