//! Chained string table (channel 1): every key the repack pipeline emits is
//! split into 60-byte payload chunks threaded through 64-byte records.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use thiserror::Error;

pub const RECORD_SIZE: usize = 64;
pub const PAYLOAD_SIZE: usize = 60;
const IN_USE_BIT: u32 = 0x8000_0000;
const NEXT_MASK: u32 = 0x7FFF_FFFF;

#[derive(Debug, Error)]
pub enum StringTableError {
    #[error("string record index {0} is out of range")]
    OutOfRange(u32),
    #[error("string chain forms a cycle starting at record {0}")]
    CycleInStringChain(u32),
}

/// Reads chains of 64-byte records out of a loaded channel-1 buffer.
pub struct StringReader {
    data: Vec<u8>,
    cache: RefCell<HashMap<u32, Rc<[u8]>>>,
}

impl StringReader {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            cache: RefCell::new(HashMap::new()),
        }
    }

    pub fn record_count(&self) -> usize {
        self.data.len() / RECORD_SIZE
    }

    fn record(&self, index: u32) -> Result<(bool, u32, &[u8]), StringTableError> {
        let off = index as usize * RECORD_SIZE;
        if off + RECORD_SIZE > self.data.len() {
            return Err(StringTableError::OutOfRange(index));
        }
        let header = (&self.data[off..off + 4])
            .read_u32::<LittleEndian>()
            .unwrap();
        let in_use = header & IN_USE_BIT != 0;
        let next = header & NEXT_MASK;
        let payload = &self.data[off + 4..off + RECORD_SIZE];
        Ok((in_use, next, payload))
    }

    /// Reconstructs the string starting at record `start`, following `next`
    /// pointers until a NUL byte or `next == 0`.
    pub fn read_string(&self, start: u32) -> Result<Rc<[u8]>, StringTableError> {
        if let Some(cached) = self.cache.borrow().get(&start) {
            return Ok(cached.clone());
        }

        let mut visited = HashSet::new();
        let mut out = Vec::new();
        let mut idx = start;
        loop {
            if !visited.insert(idx) {
                return Err(StringTableError::CycleInStringChain(start));
            }
            let (_, next, payload) = self.record(idx)?;
            match payload.iter().position(|&b| b == 0) {
                Some(nul_pos) => {
                    out.extend_from_slice(&payload[..nul_pos]);
                    break;
                }
                None => {
                    out.extend_from_slice(payload);
                    if next == 0 {
                        break;
                    }
                    idx = next;
                }
            }
        }

        let rc: Rc<[u8]> = out.into();
        self.cache.borrow_mut().insert(start, rc.clone());
        Ok(rc)
    }

    /// Every record index touched while walking the chain starting at
    /// `start`, for orphan-detection sweeps that need to mark continuation
    /// records as reachable without re-decoding their payload bytes.
    pub fn chain_indices(&self, start: u32) -> Result<Vec<u32>, StringTableError> {
        let mut visited = Vec::new();
        let mut seen = HashSet::new();
        let mut idx = start;
        loop {
            if !seen.insert(idx) {
                return Err(StringTableError::CycleInStringChain(start));
            }
            visited.push(idx);
            let (_, next, payload) = self.record(idx)?;
            if payload.contains(&0) || next == 0 {
                break;
            }
            idx = next;
        }
        Ok(visited)
    }
}

/// Builds a fresh channel-1 buffer, starting with the sentinel record at
/// index 0 (a single `.` byte).
pub struct StringBuilder {
    records: Vec<u8>,
    cache: HashMap<Vec<u8>, u32>,
}

impl Default for StringBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl StringBuilder {
    pub fn new() -> Self {
        let mut records = Vec::new();
        push_record(&mut records, 0, b".");
        Self {
            records,
            cache: HashMap::new(),
        }
    }

    /// Adds `key` (its raw bytes), returning the index of its first record.
    /// Repeated adds of the same bytes return the cached index.
    pub fn add(&mut self, key: &[u8]) -> u32 {
        if let Some(&idx) = self.cache.get(key) {
            return idx;
        }

        let chunks: Vec<&[u8]> = if key.is_empty() {
            vec![&[][..]]
        } else {
            key.chunks(PAYLOAD_SIZE).collect()
        };
        let first_index = (self.records.len() / RECORD_SIZE) as u32;
        let chunk_count = chunks.len();
        for (i, chunk) in chunks.into_iter().enumerate() {
            let this_index = first_index + i as u32;
            let next_index = if i + 1 < chunk_count {
                this_index + 1
            } else {
                0
            };
            push_record(&mut self.records, next_index, chunk);
        }

        self.cache.insert(key.to_vec(), first_index);
        first_index
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.records
    }
}

fn push_record(buf: &mut Vec<u8>, next_index: u32, payload: &[u8]) {
    debug_assert!(payload.len() <= PAYLOAD_SIZE);
    let header = IN_USE_BIT | (next_index & NEXT_MASK);
    buf.write_u32::<LittleEndian>(header).unwrap();
    let mut padded = [0u8; PAYLOAD_SIZE];
    padded[..payload.len()].copy_from_slice(payload);
    buf.extend_from_slice(&padded);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_record_reads_as_dot() {
        let builder = StringBuilder::new();
        let reader = StringReader::new(builder.into_bytes());
        assert_eq!(&*reader.read_string(0).unwrap(), b".");
    }

    #[test]
    fn short_key_round_trips() {
        let mut builder = StringBuilder::new();
        let idx = builder.add(b"texture\\a.dds");
        let reader = StringReader::new(builder.into_bytes());
        assert_eq!(&*reader.read_string(idx).unwrap(), b"texture\\a.dds");
    }

    #[test]
    fn long_key_spans_multiple_records() {
        let key = vec![b'x'; 130];
        let mut builder = StringBuilder::new();
        let idx = builder.add(&key);
        assert_eq!(idx, 1);
        let reader = StringReader::new(builder.into_bytes());
        assert_eq!(&*reader.read_string(idx).unwrap(), key.as_slice());
        assert_eq!(reader.record_count(), 1 + 3); // 130 / 60 -> 3 chunks
    }

    #[test]
    fn repeated_add_returns_cached_index() {
        let mut builder = StringBuilder::new();
        let a = builder.add(b"dup");
        let b = builder.add(b"dup");
        assert_eq!(a, b);
    }

    #[test]
    fn cycle_is_detected() {
        // Records 1 and 2 (index 0 can't be a cycle target: 0 means
        // "terminate") point at each other; neither payload has a NUL.
        let mut data = vec![0u8; RECORD_SIZE * 3];
        let rec1_header = IN_USE_BIT | 2u32;
        let rec2_header = IN_USE_BIT | 1u32;
        data[RECORD_SIZE..RECORD_SIZE + 4].copy_from_slice(&rec1_header.to_le_bytes());
        data[RECORD_SIZE * 2..RECORD_SIZE * 2 + 4].copy_from_slice(&rec2_header.to_le_bytes());
        for rec in 1..3 {
            let payload_start = rec * RECORD_SIZE + 4;
            for b in data[payload_start..payload_start + PAYLOAD_SIZE].iter_mut() {
                *b = b'a';
            }
        }
        let reader = StringReader::new(data);
        let err = reader.read_string(1).unwrap_err();
        assert!(matches!(err, StringTableError::CycleInStringChain(1)));
    }
}
