//! # pakforge — striped-index game archive format
//!
//! Format guarantees:
//! - All numeric fields are little-endian; never negotiated
//! - The index file's four channels (directory trie, string table, meta
//!   table, FAT) are interleaved across a fixed page grid; the page size is
//!   inferred from the file length, never stored explicitly
//! - Every file's bytes in the data file are preceded by a 32-byte wrapper
//!   header; the wrapper never validates its timestamp fields on read
//! - The directory trie is a Patricia tree over raw path bytes; its shape is
//!   fully determined by insertion order, making repack output reproducible
//! - Patch is transactional: the data file only ever grows by appending, and
//!   any post-write verification failure rolls the index and data files back
//!   to their pre-patch state

pub mod archive;
pub mod datfat;
pub mod error;
pub mod layout;
pub mod meta;
pub mod patch;
pub mod repack;
pub mod report;
pub mod strtab;
pub mod trie;
pub mod wrapper;

// Flat re-exports for the most common types.
pub use archive::{Archive, ArchiveError, Entry};
pub use error::Error;
pub use layout::{Header, LayoutError};
pub use meta::{MetaRecord, MetaTable};
pub use patch::{patch, PatchError, PatchOptions, PatchOutcome, PatchRequest, PatchState};
pub use repack::{repack, RepackError, RepackOptions, RepackReport, RepackSource};
pub use report::{write_tsv, ReportRow};
pub use wrapper::{decode as decode_payload, encode as encode_payload, WrapperError};
