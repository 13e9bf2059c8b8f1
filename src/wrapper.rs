//! The 32-byte payload wrapper that precedes every file's bytes in the data
//! file, and the deflate codec behind it.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};
use thiserror::Error;

pub const WRAPPER_HEADER_SIZE: usize = 32;

/// The writer emits this into all three timestamp fields. The reader never
/// validates it; preserved only for compatibility with whatever reads these
/// archives downstream.
pub const TIMESTAMP_SENTINEL: u64 = 0x01CA_8B14_A4E0_0000;

#[derive(Debug, Error)]
pub enum WrapperError {
    #[error("wrapper header is truncated: got {0} bytes, need {WRAPPER_HEADER_SIZE}")]
    ShortHeader(usize),
    #[error("deflate stream is corrupt: {0}")]
    Inflate(String),
    #[error("decompressed size mismatch: header declares {declared}, got {actual}")]
    SizeMismatch { declared: u32, actual: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WrapperHeader {
    pub payload_type: u32,
    pub decompressed_size: u32,
    pub ts1: u64,
    pub ts2: u64,
    pub ts3: u64,
}

impl WrapperHeader {
    pub fn new(payload_type: u32, decompressed_size: u32) -> Self {
        Self {
            payload_type,
            decompressed_size,
            ts1: TIMESTAMP_SENTINEL,
            ts2: TIMESTAMP_SENTINEL,
            ts3: TIMESTAMP_SENTINEL,
        }
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.write_u32::<LittleEndian>(self.payload_type).unwrap();
        out.write_u32::<LittleEndian>(self.decompressed_size).unwrap();
        out.write_u64::<LittleEndian>(self.ts1).unwrap();
        out.write_u64::<LittleEndian>(self.ts2).unwrap();
        out.write_u64::<LittleEndian>(self.ts3).unwrap();
    }

    pub fn read(buf: &[u8]) -> Result<Self, WrapperError> {
        if buf.len() < WRAPPER_HEADER_SIZE {
            return Err(WrapperError::ShortHeader(buf.len()));
        }
        let mut c = Cursor::new(buf);
        Ok(Self {
            payload_type: c.read_u32::<LittleEndian>()?,
            decompressed_size: c.read_u32::<LittleEndian>()?,
            ts1: c.read_u64::<LittleEndian>()?,
            ts2: c.read_u64::<LittleEndian>()?,
            ts3: c.read_u64::<LittleEndian>()?,
        })
    }
}

/// `type` field value for deflate-compressed payloads.
pub const PAYLOAD_DEFLATE: u32 = 1;

/// Encodes `raw` as `header || deflate(raw, level)`. `level` is clamped into
/// `0..=9` by the caller (CLI validates `1..=9`).
pub fn encode(raw: &[u8], level: u32) -> Result<Vec<u8>, WrapperError> {
    let header = WrapperHeader::new(PAYLOAD_DEFLATE, raw.len() as u32);
    let mut out = Vec::with_capacity(WRAPPER_HEADER_SIZE + raw.len() / 2);
    header.write(&mut out);

    let mut encoder = flate2::write::DeflateEncoder::new(
        Vec::with_capacity(raw.len() / 2),
        flate2::Compression::new(level),
    );
    encoder.write_all(raw)?;
    let compressed = encoder.finish()?;
    out.extend_from_slice(&compressed);
    Ok(out)
}

/// Decodes a wrapped buffer back into the original bytes.
pub fn decode(buf: &[u8]) -> Result<Vec<u8>, WrapperError> {
    let header = WrapperHeader::read(buf)?;
    let body = &buf[WRAPPER_HEADER_SIZE..];

    if header.payload_type == PAYLOAD_DEFLATE {
        let mut decoder = flate2::read::DeflateDecoder::new(body);
        let mut out = Vec::with_capacity(header.decompressed_size as usize);
        decoder
            .read_to_end(&mut out)
            .map_err(|e| WrapperError::Inflate(e.to_string()))?;
        if header.decompressed_size != 0 && out.len() != header.decompressed_size as usize {
            return Err(WrapperError::SizeMismatch {
                declared: header.decompressed_size,
                actual: out.len(),
            });
        }
        Ok(out)
    } else if body.len() == header.decompressed_size as usize {
        Ok(body.to_vec())
    } else {
        Err(WrapperError::SizeMismatch {
            declared: header.decompressed_size,
            actual: body.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_arbitrary_bytes() {
        let raw = b"texture\\a.dds payload bytes, repeated repeated repeated".to_vec();
        let wrapped = encode(&raw, 6).unwrap();
        let decoded = decode(&wrapped).unwrap();
        assert_eq!(decoded, raw);
    }

    #[test]
    fn round_trips_empty_input() {
        let wrapped = encode(&[], 6).unwrap();
        let decoded = decode(&wrapped).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn rejects_short_header() {
        let err = WrapperHeader::read(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, WrapperError::ShortHeader(10)));
    }

    #[test]
    fn rejects_declared_size_mismatch_on_raw_payload() {
        let mut buf = Vec::new();
        WrapperHeader::new(7, 3).write(&mut buf);
        buf.extend_from_slice(b"nope"); // 4 bytes, declared 3
        let err = decode(&buf).unwrap_err();
        assert!(matches!(err, WrapperError::SizeMismatch { .. }));
    }
}
