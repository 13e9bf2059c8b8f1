//! The Patricia (radix) trie over raw path-byte keys that forms the
//! directory index (channel 0).
//!
//! Nodes are fixed 20-byte records. The tree never shrinks and is never
//! rebalanced; insertion order fully determines its shape, which is what
//! makes trie bytes reproducible across repacks of the same key set.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

pub const NODE_SIZE: usize = 20;
const NAME_TOP_BIT: u32 = 0x8000_0000;
const NAME_MASK: u32 = 0x7FFF_FFFF;

#[derive(Debug, Error)]
pub enum TrieError {
    #[error("key is a duplicate of an already-inserted key")]
    DuplicateKey,
    #[error("node index {0} is out of range")]
    OutOfRange(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrieNode {
    pub meta_index: u32,
    pub bit_index: i32,
    pub name_raw: u32,
    pub left: u32,
    pub right: u32,
}

impl TrieNode {
    pub fn string_index(&self) -> u32 {
        self.name_raw & NAME_MASK
    }

    pub fn read(buf: &[u8]) -> Self {
        Self {
            meta_index: (&buf[0..4]).read_u32::<LittleEndian>().unwrap(),
            bit_index: (&buf[4..8]).read_i32::<LittleEndian>().unwrap(),
            name_raw: (&buf[8..12]).read_u32::<LittleEndian>().unwrap(),
            left: (&buf[12..16]).read_u32::<LittleEndian>().unwrap(),
            right: (&buf[16..20]).read_u32::<LittleEndian>().unwrap(),
        }
    }

    pub fn write(&self, buf: &mut [u8]) {
        (&mut buf[0..4]).write_u32::<LittleEndian>(self.meta_index).unwrap();
        (&mut buf[4..8]).write_i32::<LittleEndian>(self.bit_index).unwrap();
        (&mut buf[8..12]).write_u32::<LittleEndian>(self.name_raw).unwrap();
        (&mut buf[12..16]).write_u32::<LittleEndian>(self.left).unwrap();
        (&mut buf[16..20]).write_u32::<LittleEndian>(self.right).unwrap();
    }
}

/// Bit `b` of `key`, LSB-first within each byte; out-of-range bits read 0.
pub fn key_bit(key: &[u8], b: i32) -> u8 {
    if b < 0 {
        return 0;
    }
    let byte_idx = (b as usize) / 8;
    match key.get(byte_idx) {
        Some(&byte) => (byte >> (b as usize % 8)) & 1,
        None => 0,
    }
}

/// First bit at which `a` and `b` differ, scanning byte-by-byte and then
/// least-significant-bit-first within the differing byte. Returns
/// `max(a.len(), b.len()) * 8` when the keys are identical over their common
/// length (i.e. one is a prefix of the other up to trailing zero bytes, or
/// they are equal).
pub fn first_differing_bit(a: &[u8], b: &[u8]) -> usize {
    let max_len = a.len().max(b.len());
    for byte_i in 0..max_len {
        let ab = *a.get(byte_i).unwrap_or(&0);
        let bb = *b.get(byte_i).unwrap_or(&0);
        let x = ab ^ bb;
        if x != 0 {
            for bit in 0..8 {
                if (x >> bit) & 1 == 1 {
                    return byte_i * 8 + bit;
                }
            }
        }
    }
    max_len * 8
}

/// A loaded channel-0 buffer. Index 0 is always the sentinel root.
pub struct Trie {
    nodes: Vec<TrieNode>,
}

impl Trie {
    pub fn from_bytes(data: &[u8]) -> Self {
        let nodes = data.chunks_exact(NODE_SIZE).map(TrieNode::read).collect();
        Self { nodes }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, index: u32) -> Option<&TrieNode> {
        self.nodes.get(index as usize)
    }

    /// All real nodes (indices `1..node_count`), in on-disk order. The
    /// facade pairs these with string lookups to produce `(path, node)`.
    pub fn iter_nodes(&self) -> impl Iterator<Item = (u32, &TrieNode)> {
        self.nodes
            .iter()
            .enumerate()
            .skip(1)
            .map(|(i, n)| (i as u32, n))
    }

    /// Structural lookup: walks bit-indexed edges from the root until the
    /// first back-edge, returning the candidate leaf node index. Callers
    /// must still compare the leaf's referenced string against the query key
    /// (the trie has no access to the string table).
    pub fn lookup_candidate(&self, key: &[u8]) -> Option<u32> {
        if self.nodes.len() <= 1 {
            return None;
        }
        let mut parent = 0u32;
        let mut node = self.nodes[0].right;
        loop {
            let parent_bit = self.nodes[parent as usize].bit_index;
            let node_bit = self.nodes[node as usize].bit_index;
            if parent_bit < node_bit {
                parent = node;
                node = if key_bit(key, node_bit) == 1 {
                    self.nodes[node as usize].right
                } else {
                    self.nodes[node as usize].left
                };
            } else {
                break;
            }
        }
        Some(node)
    }
}

/// Builds a fresh channel-0 buffer in key-insertion order.
pub struct TrieBuilder {
    nodes: Vec<TrieNode>,
}

impl Default for TrieBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TrieBuilder {
    pub fn new() -> Self {
        let root = TrieNode {
            meta_index: 0,
            bit_index: -1,
            name_raw: NAME_TOP_BIT, // points at string record 0, the "." sentinel
            left: 0,
            right: 0,
        };
        Self { nodes: vec![root] }
    }

    fn lookup_candidate(&self, key: &[u8]) -> u32 {
        let mut parent = 0u32;
        let mut node = self.nodes[0].right;
        loop {
            let parent_bit = self.nodes[parent as usize].bit_index;
            let node_bit = self.nodes[node as usize].bit_index;
            if parent_bit < node_bit {
                parent = node;
                node = if key_bit(key, node_bit) == 1 {
                    self.nodes[node as usize].right
                } else {
                    self.nodes[node as usize].left
                };
            } else {
                break;
            }
        }
        node
    }

    /// Inserts `key`, whose string bytes live at `string_index` and whose
    /// meta slot is `meta_index`. `prior_keys` must hold every key already
    /// inserted in this builder, indexed by the `meta_index` it was inserted
    /// with (so leaf nodes can be compared against without the builder
    /// owning the string table itself).
    pub fn insert(
        &mut self,
        key: &[u8],
        meta_index: u32,
        string_index: u32,
        prior_keys: &[Vec<u8>],
    ) -> Result<u32, TrieError> {
        let name_raw = NAME_TOP_BIT | (string_index & NAME_MASK);

        if self.nodes.len() == 1 {
            let diff_bit = first_differing_bit(key, &[]);
            if diff_bit == key.len() * 8 {
                return Err(TrieError::DuplicateKey);
            }
            let new_index = 1u32;
            let mut node = TrieNode {
                meta_index,
                bit_index: diff_bit as i32,
                name_raw,
                left: 0,
                right: 0,
            };
            if key_bit(key, diff_bit as i32) == 1 {
                node.right = new_index;
            } else {
                node.left = new_index;
            }
            self.nodes.push(node);
            self.nodes[0].right = new_index;
            return Ok(new_index);
        }

        let candidate = self.lookup_candidate(key);
        let leaf_key = prior_keys
            .get(self.nodes[candidate as usize].meta_index as usize)
            .ok_or(TrieError::OutOfRange(candidate))?;
        let diff_bit = first_differing_bit(key, leaf_key);
        if diff_bit == key.len().max(leaf_key.len()) * 8 {
            return Err(TrieError::DuplicateKey);
        }
        let diff_bit = diff_bit as i32;

        let mut parent = 0u32;
        let mut node = self.nodes[0].right;
        loop {
            let parent_bit = self.nodes[parent as usize].bit_index;
            let node_bit = self.nodes[node as usize].bit_index;
            if parent_bit < node_bit && node_bit < diff_bit {
                parent = node;
                node = if key_bit(key, node_bit) == 1 {
                    self.nodes[node as usize].right
                } else {
                    self.nodes[node as usize].left
                };
            } else {
                break;
            }
        }

        let new_index = self.nodes.len() as u32;
        let mut new_node = TrieNode {
            meta_index,
            bit_index: diff_bit,
            name_raw,
            left: 0,
            right: 0,
        };
        if key_bit(key, diff_bit) == 1 {
            new_node.right = new_index;
            new_node.left = node;
        } else {
            new_node.left = new_index;
            new_node.right = node;
        }
        self.nodes.push(new_node);

        let parent_bit = self.nodes[parent as usize].bit_index;
        let go_right = parent_bit < 0 || key_bit(key, parent_bit) == 1;
        if go_right {
            self.nodes[parent as usize].right = new_index;
        } else {
            self.nodes[parent as usize].left = new_index;
        }

        Ok(new_index)
    }

    pub fn into_bytes(self) -> Vec<u8> {
        let mut out = vec![0u8; self.nodes.len() * NODE_SIZE];
        for (i, node) in self.nodes.iter().enumerate() {
            node.write(&mut out[i * NODE_SIZE..(i + 1) * NODE_SIZE]);
        }
        out
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(keys: &[&[u8]]) -> (TrieBuilder, Vec<Vec<u8>>) {
        let mut builder = TrieBuilder::new();
        let mut stored = Vec::new();
        for (i, &k) in keys.iter().enumerate() {
            builder.insert(k, i as u32, i as u32 + 1, &stored).unwrap();
            stored.push(k.to_vec());
        }
        (builder, stored)
    }

    #[test]
    fn single_key_reachable_via_lookup() {
        let (builder, _) = build(&[b"a"]);
        let bytes = builder.into_bytes();
        let trie = Trie::from_bytes(&bytes);
        let candidate = trie.lookup_candidate(b"a").unwrap();
        assert_eq!(trie.node(candidate).unwrap().meta_index, 0);
    }

    #[test]
    fn rejects_duplicate_key() {
        let mut builder = TrieBuilder::new();
        builder.insert(b"same", 0, 1, &[]).unwrap();
        let err = builder
            .insert(b"same", 1, 2, &[b"same".to_vec()])
            .unwrap_err();
        assert!(matches!(err, TrieError::DuplicateKey));
    }

    #[test]
    fn many_keys_all_reachable() {
        let keys: Vec<&[u8]> = vec![
            b"a\\b.txt",
            b"a\\c.txt",
            b"dir\\sub\\file.dat",
            b"zz",
            b"a",
            b"a\\b",
        ];
        let (builder, stored) = build(&keys);
        assert_eq!(builder.node_count(), keys.len() + 1);
        let bytes = builder.into_bytes();
        let trie = Trie::from_bytes(&bytes);
        for key in &keys {
            let candidate = trie.lookup_candidate(key).unwrap();
            let node = trie.node(candidate).unwrap();
            assert_eq!(&stored[node.meta_index as usize], key);
        }
    }

    #[test]
    fn insertion_order_determines_bytes_deterministically() {
        let keys: Vec<&[u8]> = vec![b"one", b"two", b"three", b"four"];
        let (b1, _) = build(&keys);
        let (b2, _) = build(&keys);
        assert_eq!(b1.into_bytes(), b2.into_bytes());
    }

    #[test]
    fn key_bit_out_of_range_is_zero() {
        assert_eq!(key_bit(b"a", -1), 0);
        assert_eq!(key_bit(b"a", 64), 0);
    }

    #[test]
    fn first_differing_bit_detects_identical_keys() {
        assert_eq!(first_differing_bit(b"abc", b"abc"), 3 * 8);
    }
}
