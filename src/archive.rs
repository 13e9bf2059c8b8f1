//! Read-only facade combining the layout, string table, trie, meta table,
//! and FAT into entry iteration and payload reads. Writing an archive is
//! the repack and patch pipelines' job, not this facade's.

use crate::datfat::{self, Fat};
use crate::layout::{self, Header};
use crate::meta::MetaTable;
use crate::strtab::StringReader;
use crate::trie::Trie;
use std::fs::File;
use std::path::Path;
use std::rc::Rc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error(transparent)]
    Layout(#[from] layout::LayoutError),
    #[error(transparent)]
    DatFat(#[from] datfat::DatFatError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub struct Archive {
    header: Header,
    strings: StringReader,
    trie: Trie,
    meta: MetaTable,
    fat: Fat,
    dat: File,
}

/// One indexed entry: the path string, its trie node index, and the meta
/// record it points to (if any — directory placeholder nodes have none).
pub struct Entry {
    pub node_index: u32,
    pub path: Rc<[u8]>,
    pub meta_index: u32,
    pub meta: Option<crate::meta::MetaRecord>,
    pub string_index: u32,
}

impl Archive {
    pub fn open(idx_path: &Path, dat_path: &Path) -> Result<Self, ArchiveError> {
        let mut idx = File::open(idx_path)?;
        let header = Header::open(&mut idx)?;

        let trie_bytes = header.read_channel(&mut idx, layout::CHANNEL_TRIE)?;
        let string_bytes = header.read_channel(&mut idx, layout::CHANNEL_STRINGS)?;
        let meta_bytes = header.read_channel(&mut idx, layout::CHANNEL_META)?;
        let fat_bytes = header.read_channel(&mut idx, layout::CHANNEL_FAT)?;

        let dat = File::open(dat_path)?;

        Ok(Self {
            header,
            strings: StringReader::new(string_bytes),
            trie: Trie::from_bytes(&trie_bytes),
            meta: MetaTable::from_bytes(meta_bytes),
            fat: Fat::from_bytes(fat_bytes),
            dat,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn fat(&self) -> &Fat {
        &self.fat
    }

    pub fn meta(&self) -> &MetaTable {
        &self.meta
    }

    pub fn strings(&self) -> &StringReader {
        &self.strings
    }

    /// Yields every node `>= 1` regardless of reachability from a real file;
    /// callers filter by `meta.has_payload()` when they only want files.
    pub fn iter_entries(&self) -> impl Iterator<Item = Entry> + '_ {
        self.trie.iter_nodes().map(|(node_index, node)| {
            let path = self
                .strings
                .read_string(node.string_index())
                .unwrap_or_else(|_| Rc::from(&b""[..]));
            Entry {
                node_index,
                path,
                meta_index: node.meta_index,
                meta: self.meta.get(node.meta_index),
                string_index: node.string_index(),
            }
        })
    }

    /// Looks `key` up exactly; if that misses, retries with the key
    /// ASCII-lowercased (the convention repack writes keys under).
    pub fn find_meta(&self, key: &[u8]) -> Option<(u32, crate::meta::MetaRecord)> {
        self.find_meta_exact(key).or_else(|| {
            let lower = key.to_ascii_lowercase();
            if lower == key {
                None
            } else {
                self.find_meta_exact(&lower)
            }
        })
    }

    fn find_meta_exact(&self, key: &[u8]) -> Option<(u32, crate::meta::MetaRecord)> {
        let candidate = self.trie.lookup_candidate(key)?;
        let node = self.trie.node(candidate)?;
        let leaf = self.strings.read_string(node.string_index()).ok()?;
        if &*leaf != key {
            return None;
        }
        let meta = self.meta.get(node.meta_index)?;
        Some((node.meta_index, meta))
    }

    pub fn read_file_bytes(&mut self, meta_index: u32) -> Result<Vec<u8>, ArchiveError> {
        let meta = self
            .meta
            .get(meta_index)
            .ok_or(datfat::DatFatError::InvalidStartBlock(0))?;
        if !meta.has_payload() {
            return Ok(Vec::new());
        }
        let wrapped = datfat::read_payload(&mut self.dat, &self.fat, meta.start_block, meta.size)?;
        crate::wrapper::decode(&wrapped)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strtab::StringBuilder;
    use crate::trie::TrieBuilder;
    use std::io::{Seek, SeekFrom, Write};
    use tempfile::NamedTempFile;

    fn write_single_entry_archive(content: &[u8]) -> (NamedTempFile, NamedTempFile) {
        let key = b"texture\\a.dds".to_vec();

        let mut strtab = StringBuilder::new();
        let string_index = strtab.add(&key);
        let mut trie = TrieBuilder::new();
        trie.insert(&key, 0, string_index, &[]).unwrap();

        let wrapped = crate::wrapper::encode(content, 6).unwrap();
        let block_count = wrapped.len().div_ceil(512).max(1) as u32;

        let dat_file = NamedTempFile::new().unwrap();
        {
            let mut dat = dat_file.reopen().unwrap();
            dat.write_all(&[0u8; 512]).unwrap(); // reserved block 0
            let mut padded = wrapped.clone();
            padded.resize(block_count as usize * 512, 0);
            dat.write_all(&padded).unwrap();
        }

        let mut fat_entries = vec![0u32]; // block 0 reserved
        for b in 0..block_count {
            fat_entries.push(if b + 1 == block_count {
                0xFFFF_FFFF
            } else {
                b + 2
            });
        }
        let mut fat_bytes = Vec::new();
        for e in &fat_entries {
            fat_bytes.extend_from_slice(&e.to_le_bytes());
        }

        let meta_rec = crate::meta::MetaRecord::compressed(wrapped.len() as u32, 1);
        let meta_bytes = meta_rec.to_bytes().to_vec();

        let trie_bytes = trie.into_bytes();
        let string_bytes = strtab.into_bytes();

        let header = crate::layout::Header::for_fresh_archive([
            trie_bytes.len() as u32,
            string_bytes.len() as u32,
            meta_bytes.len() as u32,
            fat_bytes.len() as u32,
        ]);

        let idx_file = NamedTempFile::new().unwrap();
        {
            let mut idx = idx_file.reopen().unwrap();
            idx.set_len(header.total_file_size()).unwrap();
            idx.seek(SeekFrom::Start(0)).unwrap();
            header
                .write_archive(&mut idx, &[trie_bytes, string_bytes, meta_bytes, fat_bytes])
                .unwrap();
        }

        (idx_file, dat_file)
    }

    #[test]
    fn round_trips_single_entry() {
        let content = b"0x41 payload bytes for the archive round trip test".as_slice();
        let (idx_file, dat_file) = write_single_entry_archive(content);
        let mut archive = Archive::open(idx_file.path(), dat_file.path()).unwrap();

        let (meta_index, meta) = archive.find_meta(b"texture\\a.dds").unwrap();
        assert!(meta.has_payload());
        let bytes = archive.read_file_bytes(meta_index).unwrap();
        assert_eq!(bytes, content);

        let entries: Vec<_> = archive.iter_entries().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(&*entries[0].path, b"texture\\a.dds");
    }
}
