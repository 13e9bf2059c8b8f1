//! The DAT/FAT layer: a 512-byte block store with linked-list allocation.

use std::collections::HashSet;
use std::io::{Read, Seek, SeekFrom, Write};
use thiserror::Error;

pub const BLOCK_SIZE: u64 = 512;
pub const END_OF_CHAIN: u32 = 0xFFFF_FFFF;

/// Coalesces small writes up to this many bytes before issuing a syscall.
pub const FLUSH_THRESHOLD: usize = 8 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum DatFatError {
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },
    #[error("block chain ended unexpectedly while {remaining} bytes remained")]
    UnexpectedEndOfChain { remaining: u64 },
    #[error("invalid start block {0}")]
    InvalidStartBlock(u32),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A loaded channel-3 buffer of 32-bit little-endian successor pointers.
pub struct Fat(Vec<u32>);

impl Fat {
    pub fn from_bytes(data: Vec<u8>) -> Self {
        let entries = data
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Self(entries)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, block: u32) -> Option<u32> {
        self.0.get(block as usize).copied()
    }
}

/// Reads the payload for a meta record whose wrapped bytes start at
/// `start_block` and total `size` bytes.
pub fn read_payload<R: Read + Seek>(
    dat: &mut R,
    fat: &Fat,
    start_block: u32,
    size: u32,
) -> Result<Vec<u8>, DatFatError> {
    if start_block == 0 {
        return Err(DatFatError::InvalidStartBlock(start_block));
    }

    let mut remaining = size as u64;
    let mut out = Vec::with_capacity(size as usize);
    let mut block = start_block;
    let mut visited = HashSet::new();

    while remaining > 0 {
        if !visited.insert(block) {
            return Err(DatFatError::UnexpectedEndOfChain { remaining });
        }
        let to_read = remaining.min(BLOCK_SIZE);
        dat.seek(SeekFrom::Start(block as u64 * BLOCK_SIZE))?;
        let mut buf = vec![0u8; to_read as usize];
        dat.read_exact(&mut buf).map_err(|_| DatFatError::ShortRead {
            expected: to_read as usize,
            actual: 0,
        })?;
        out.extend_from_slice(&buf);
        remaining -= to_read;

        if remaining > 0 {
            let next = fat
                .get(block)
                .ok_or(DatFatError::UnexpectedEndOfChain { remaining })?;
            if next == END_OF_CHAIN {
                return Err(DatFatError::UnexpectedEndOfChain { remaining });
            }
            block = next;
        }
    }

    Ok(out)
}

/// A small buffered writer that batches appended bytes and flushes once it
/// crosses [`FLUSH_THRESHOLD`], mirroring the teacher's coalesced-write
/// pattern for the data file's block-granularity appends.
pub struct WriteBuffer<W: Write> {
    inner: W,
    buf: Vec<u8>,
}

impl<W: Write> WriteBuffer<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(FLUSH_THRESHOLD),
        }
    }

    pub fn write_bytes(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.buf.extend_from_slice(data);
        if self.buf.len() >= FLUSH_THRESHOLD {
            self.flush_now()?;
        }
        Ok(())
    }

    pub fn flush_now(&mut self) -> std::io::Result<()> {
        if !self.buf.is_empty() {
            self.inner.write_all(&self.buf)?;
            self.buf.clear();
        }
        Ok(())
    }

    pub fn into_inner(mut self) -> std::io::Result<W> {
        self.flush_now()?;
        Ok(self.inner)
    }
}

/// Appends `wrapped` as its own block-aligned chain to `buf` (an in-memory
/// staging area for a fresh DAT file built by repack), returning the first
/// block index, the block count, and the FAT words the chain occupies.
pub fn append_chain(
    buf: &mut Vec<u8>,
    next_block: u32,
    wrapped: &[u8],
) -> (u32, u32, Vec<u32>) {
    let block_count = (wrapped.len() as u64).div_ceil(BLOCK_SIZE).max(1) as u32;
    let start_block = next_block;

    let mut padded = wrapped.to_vec();
    padded.resize(block_count as usize * BLOCK_SIZE as usize, 0);
    buf.extend_from_slice(&padded);

    let mut fat_words = Vec::with_capacity(block_count as usize);
    for i in 0..block_count {
        fat_words.push(if i + 1 == block_count {
            END_OF_CHAIN
        } else {
            start_block + i + 1
        });
    }

    (start_block, block_count, fat_words)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn reads_single_block_payload() {
        let mut dat = Cursor::new(vec![0u8; 1024]);
        dat.get_mut()[512..512 + 5].copy_from_slice(b"hello");
        let fat = Fat::from_bytes({
            let mut b = Vec::new();
            b.extend_from_slice(&0u32.to_le_bytes());
            b.extend_from_slice(&END_OF_CHAIN.to_le_bytes());
            b
        });
        let out = read_payload(&mut dat, &fat, 1, 5).unwrap();
        assert_eq!(out, b"hello");
    }

    #[test]
    fn reads_multi_block_payload() {
        let mut dat = Cursor::new(vec![0u8; 512 * 3]);
        let payload = vec![7u8; 700];
        dat.get_mut()[512..512 + 512].copy_from_slice(&payload[..512]);
        dat.get_mut()[1024..1024 + 188].copy_from_slice(&payload[512..]);
        let fat = Fat::from_bytes({
            let mut b = Vec::new();
            b.extend_from_slice(&0u32.to_le_bytes());
            b.extend_from_slice(&2u32.to_le_bytes());
            b.extend_from_slice(&END_OF_CHAIN.to_le_bytes());
            b
        });
        let out = read_payload(&mut dat, &fat, 1, 700).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn chain_ending_early_is_an_error() {
        let mut dat = Cursor::new(vec![0u8; 512 * 2]);
        let fat = Fat::from_bytes({
            let mut b = Vec::new();
            b.extend_from_slice(&0u32.to_le_bytes());
            b.extend_from_slice(&END_OF_CHAIN.to_le_bytes());
            b
        });
        let err = read_payload(&mut dat, &fat, 1, 700).unwrap_err();
        assert!(matches!(err, DatFatError::UnexpectedEndOfChain { .. }));
    }

    #[test]
    fn append_chain_produces_expected_fat_words() {
        let mut buf = Vec::new();
        let (start, count, words) = append_chain(&mut buf, 1, &vec![0u8; 1500]);
        assert_eq!(start, 1);
        assert_eq!(count, 3);
        assert_eq!(words, vec![2, 3, END_OF_CHAIN]);
        assert_eq!(buf.len(), 3 * 512);
    }
}
