//! The striped multi-channel page layout of the index file.
//!
//! The header page declares four channels; each channel's logical bytes are
//! scattered across physical pages by a fixed interleave so that related
//! structures (trie, strings, meta, FAT) stay close together on disk even as
//! they grow at different rates.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use thiserror::Error;

pub const MAGIC: &[u8; 4] = b"ABCD";
pub const CHANNEL_COUNT: usize = 4;
pub const HEADER_FIELD_SIZE: usize = 4 + 4 + CHANNEL_COUNT * 8;

pub const CANDIDATE_PAGE_SIZES: &[u32] = &[512, 1024, 2048, 4096, 8192, 16384, 32768];
pub const DEFAULT_PAGE_SIZE: u32 = 4096;
pub const DEFAULT_PAGES_PER_STRIPE: [u32; CHANNEL_COUNT] = [4, 8, 1, 4];

pub const CHANNEL_TRIE: usize = 0;
pub const CHANNEL_STRINGS: usize = 1;
pub const CHANNEL_META: usize = 2;
pub const CHANNEL_FAT: usize = 3;

#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("unrecognized layout: {0}")]
    UnrecognizedLayout(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct ChannelHeader {
    pub pages_per_stripe: u32,
    pub size_bytes: u32,
}

/// The parsed 4096-byte (or whatever the inferred page size is) header page,
/// plus the page size inferred from the file length.
#[derive(Debug, Clone)]
pub struct Header {
    pub channels: [ChannelHeader; CHANNEL_COUNT],
    pub page_size: u32,
    pub stripes: u64,
}

impl Header {
    fn pages_per_stripe(&self) -> [u32; CHANNEL_COUNT] {
        let mut out = [0u32; CHANNEL_COUNT];
        for c in 0..CHANNEL_COUNT {
            out[c] = self.channels[c].pages_per_stripe;
        }
        out
    }

    fn stripe_total(&self) -> u64 {
        self.pages_per_stripe().iter().map(|&p| p as u64).sum()
    }

    fn prefix(&self, channel: usize) -> u64 {
        self.channels[..channel]
            .iter()
            .map(|c| c.pages_per_stripe as u64)
            .sum()
    }

    /// Maps a logical byte offset within `channel` to its physical file
    /// offset, for a header already fixed at `page_size`/`pages_per_stripe`.
    pub fn channel_logical_to_file_offset(&self, channel: usize, logical_offset: u64) -> u64 {
        let page_size = self.page_size as u64;
        let pps = self.channels[channel].pages_per_stripe as u64;
        let p = logical_offset / page_size;
        let within = logical_offset % page_size;
        let stripe = p / pps;
        let physical_page = stripe * self.stripe_total() + self.prefix(channel) + (p % pps);
        (1 + physical_page) * page_size + within
    }

    /// Total byte capacity of `channel` at the current page size/stripe count.
    pub fn channel_capacity_bytes(&self, channel: usize) -> u64 {
        self.stripes * self.channels[channel].pages_per_stripe as u64 * self.page_size as u64
    }

    /// Reads the raw header-field bytes (magic + channel table), independent
    /// of page size: they always live at file offset 0.
    fn encode_fields(&self) -> [u8; HEADER_FIELD_SIZE] {
        let mut buf = [0u8; HEADER_FIELD_SIZE];
        buf[0..4].copy_from_slice(MAGIC);
        (&mut buf[4..8])
            .write_u32::<LittleEndian>(CHANNEL_COUNT as u32)
            .unwrap();
        for (c, chan) in self.channels.iter().enumerate() {
            let off = 8 + c * 8;
            (&mut buf[off..off + 4])
                .write_u32::<LittleEndian>(chan.pages_per_stripe)
                .unwrap();
            (&mut buf[off + 4..off + 8])
                .write_u32::<LittleEndian>(chan.size_bytes)
                .unwrap();
        }
        buf
    }

    /// Byte offset of channel `c`'s `size_bytes` header word, for in-place
    /// patching (used by the patch pipeline to grow the FAT channel).
    pub fn size_bytes_field_offset(channel: usize) -> u64 {
        (8 + channel * 8 + 4) as u64
    }

    fn parse_fields(buf: &[u8]) -> Result<[ChannelHeader; CHANNEL_COUNT], LayoutError> {
        if buf.len() < HEADER_FIELD_SIZE {
            return Err(LayoutError::UnrecognizedLayout("header truncated".into()));
        }
        if &buf[0..4] != MAGIC {
            return Err(LayoutError::UnrecognizedLayout("bad magic".into()));
        }
        let channel_count = (&buf[4..8]).read_u32::<LittleEndian>()?;
        if channel_count as usize != CHANNEL_COUNT {
            return Err(LayoutError::UnrecognizedLayout(format!(
                "unsupported channel count {channel_count}"
            )));
        }
        let mut channels = [ChannelHeader {
            pages_per_stripe: 0,
            size_bytes: 0,
        }; CHANNEL_COUNT];
        for c in 0..CHANNEL_COUNT {
            let off = 8 + c * 8;
            channels[c] = ChannelHeader {
                pages_per_stripe: (&buf[off..off + 4]).read_u32::<LittleEndian>()?,
                size_bytes: (&buf[off + 4..off + 8]).read_u32::<LittleEndian>()?,
            };
        }
        Ok(channels)
    }

    /// Infers the page size for an already-written index file of `file_len`
    /// bytes carrying `channels`. See spec §4.2.
    fn infer_page_size(
        channels: &[ChannelHeader; CHANNEL_COUNT],
        file_len: u64,
    ) -> Result<(u32, u64), LayoutError> {
        let stripe_total: u64 = channels.iter().map(|c| c.pages_per_stripe as u64).sum();
        if stripe_total == 0 {
            return Err(LayoutError::UnrecognizedLayout(
                "pages_per_stripe sums to zero".into(),
            ));
        }

        let mut survivors: Vec<u32> = Vec::new();
        for &page_size in CANDIDATE_PAGE_SIZES {
            let page_size_u64 = page_size as u64;
            if file_len % page_size_u64 != 0 {
                continue;
            }
            let total_pages = file_len / page_size_u64;
            if total_pages < 2 {
                continue;
            }
            if (total_pages - 1) % stripe_total != 0 {
                continue;
            }
            let stripes = (total_pages - 1) / stripe_total;
            let fits = channels.iter().enumerate().all(|(c, chan)| {
                let capacity = stripes * chan.pages_per_stripe as u64 * page_size_u64;
                chan.size_bytes as u64 <= capacity
            });
            if fits {
                survivors.push(page_size);
            }
        }

        if survivors.contains(&DEFAULT_PAGE_SIZE) {
            let stripes =
                (file_len / DEFAULT_PAGE_SIZE as u64 - 1) / stripe_total;
            return Ok((DEFAULT_PAGE_SIZE, stripes));
        }
        if let Some(&smallest) = survivors.iter().min() {
            let stripes = (file_len / smallest as u64 - 1) / stripe_total;
            return Ok((smallest, stripes));
        }
        Err(LayoutError::UnrecognizedLayout(format!(
            "no candidate page size divides file length {file_len} and satisfies channel capacities"
        )))
    }

    pub fn open(idx: &mut File) -> Result<Self, LayoutError> {
        let file_len = idx.metadata()?.len();
        idx.seek(SeekFrom::Start(0))?;
        let mut field_buf = [0u8; HEADER_FIELD_SIZE];
        idx.read_exact(&mut field_buf)?;
        let channels = Self::parse_fields(&field_buf)?;
        let (page_size, stripes) = Self::infer_page_size(&channels, file_len)?;
        Ok(Self {
            channels,
            page_size,
            stripes,
        })
    }

    /// Builds a fresh header for a repack output, choosing the default page
    /// size and stripe count large enough to hold every channel.
    pub fn for_fresh_archive(channel_sizes: [u32; CHANNEL_COUNT]) -> Self {
        let pps = DEFAULT_PAGES_PER_STRIPE;
        let page_size = DEFAULT_PAGE_SIZE as u64;
        let stripes = (0..CHANNEL_COUNT)
            .map(|c| {
                let pages = (channel_sizes[c] as u64).div_ceil(page_size).max(1);
                pages.div_ceil(pps[c] as u64)
            })
            .max()
            .unwrap_or(1)
            .max(1);
        let channels = std::array::from_fn(|c| ChannelHeader {
            pages_per_stripe: pps[c],
            size_bytes: channel_sizes[c],
        });
        Self {
            channels,
            page_size: page_size as u32,
            stripes,
        }
    }

    pub fn total_file_size(&self) -> u64 {
        (1 + self.stripes * self.stripe_total()) * self.page_size as u64
    }

    /// Writes the header page and every channel's data to `out`, which must
    /// already be truncated/allocated to `total_file_size()`.
    pub fn write_archive<W: Write + Seek>(
        &self,
        out: &mut W,
        channel_bytes: &[Vec<u8>; CHANNEL_COUNT],
    ) -> Result<(), LayoutError> {
        out.seek(SeekFrom::Start(0))?;
        let mut header_page = vec![0u8; self.page_size as usize];
        header_page[..HEADER_FIELD_SIZE].copy_from_slice(&self.encode_fields());
        out.write_all(&header_page)?;

        for (c, data) in channel_bytes.iter().enumerate() {
            self.write_channel_bytes(out, c, 0, data)?;
        }
        Ok(())
    }

    /// Reads the full logical channel `c`'s `size_bytes` bytes.
    pub fn read_channel<R: Read + Seek>(
        &self,
        fd: &mut R,
        channel: usize,
    ) -> Result<Vec<u8>, LayoutError> {
        let size_bytes = self.channels[channel].size_bytes as u64;
        let page_size = self.page_size as u64;
        let mut out = Vec::with_capacity(size_bytes as usize);
        let mut logical = 0u64;
        while logical < size_bytes {
            let file_off = self.channel_logical_to_file_offset(channel, logical);
            let to_read = page_size.min(size_bytes - logical);
            let mut buf = vec![0u8; to_read as usize];
            fd.seek(SeekFrom::Start(file_off))?;
            fd.read_exact(&mut buf)?;
            out.extend_from_slice(&buf);
            logical += to_read;
        }
        Ok(out)
    }

    /// Writes `data` at logical offset `off` in channel `c`, splitting it at
    /// logical page boundaries so no single write crosses one.
    pub fn write_channel_bytes<W: Write + Seek>(
        &self,
        fd: &mut W,
        channel: usize,
        off: u64,
        data: &[u8],
    ) -> Result<(), LayoutError> {
        let page_size = self.page_size as u64;
        let mut written = 0u64;
        while written < data.len() as u64 {
            let logical = off + written;
            let page_start = (logical / page_size) * page_size;
            let page_end = page_start + page_size;
            let chunk_len = (page_end - logical).min(data.len() as u64 - written);
            let file_off = self.channel_logical_to_file_offset(channel, logical);
            fd.seek(SeekFrom::Start(file_off))?;
            fd.write_all(&data[written as usize..(written + chunk_len) as usize])?;
            written += chunk_len;
        }
        Ok(())
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    proptest! {
        #[test]
        fn channel_write_then_read_recovers_arbitrary_bytes(
            channel in 0..CHANNEL_COUNT,
            offset in 0u64..3000,
            data in proptest::collection::vec(any::<u8>(), 0..500),
        ) {
            let mut sizes = [4096u32 * 3; CHANNEL_COUNT];
            sizes[channel] = (offset + data.len() as u64).max(sizes[channel] as u64) as u32;
            let header = Header::for_fresh_archive(sizes);

            let mut buf = Cursor::new(vec![0u8; header.total_file_size() as usize]);
            let channel_sizes: Vec<u64> = (0..CHANNEL_COUNT)
                .map(|c| header.channels[c].size_bytes as u64)
                .collect();
            let full_channels: [Vec<u8>; CHANNEL_COUNT] =
                std::array::from_fn(|c| vec![0u8; channel_sizes[c] as usize]);
            header.write_archive(&mut buf, &full_channels).unwrap();

            header.write_channel_bytes(&mut buf, channel, offset, &data).unwrap();
            let readback = header.read_channel(&mut buf, channel).unwrap();
            prop_assert_eq!(&readback[offset as usize..offset as usize + data.len()], data.as_slice());
        }
    }
}
