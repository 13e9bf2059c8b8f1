//! Crate-level error aggregation: every component keeps its own `thiserror`
//! enum (see `layout`, `wrapper`, `datfat`, `trie`, `strtab`, `patch`); this
//! wraps them for callers at the CLI boundary that don't care which layer
//! failed.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Layout(#[from] crate::layout::LayoutError),
    #[error(transparent)]
    Wrapper(#[from] crate::wrapper::WrapperError),
    #[error(transparent)]
    DatFat(#[from] crate::datfat::DatFatError),
    #[error(transparent)]
    Trie(#[from] crate::trie::TrieError),
    #[error(transparent)]
    StringTable(#[from] crate::strtab::StringTableError),
    #[error(transparent)]
    Archive(#[from] crate::archive::ArchiveError),
    #[error(transparent)]
    Patch(#[from] crate::patch::PatchError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
