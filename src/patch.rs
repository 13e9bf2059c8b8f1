//! Transactional in-place patch pipeline: append-only DAT growth, FAT and
//! meta rewrites, preflight consistency checks, and verify-then-rollback.

use crate::{archive, datfat, layout, meta, wrapper};
use sha1::{Digest, Sha1};
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("archive is internally inconsistent: {0}")]
    InconsistentArchive(String),
    #[error("patch would exceed channel capacity: {0}")]
    CapacityExceeded(String),
    #[error("verification failed for {0}")]
    VerificationFailed(String),
    #[error(transparent)]
    Wrapper(#[from] wrapper::WrapperError),
    #[error(transparent)]
    Archive(#[from] archive::ArchiveError),
    #[error(transparent)]
    Layout(#[from] layout::LayoutError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchState {
    Resolved,
    Prepared,
    DatAppended,
    IdxUpdated,
    Verified,
    RolledBack,
    Failed,
}

pub struct PatchRequest {
    pub archive_key: String,
    pub local_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct PatchOptions {
    pub level: u32,
    pub dry_run: bool,
    pub jobs: Option<usize>,
}

impl Default for PatchOptions {
    fn default() -> Self {
        Self {
            level: 6,
            dry_run: false,
            jobs: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct PatchOutcome {
    pub state: Option<PatchState>,
    pub patched: Vec<String>,
    pub skipped: Vec<String>,
    pub rolled_back: bool,
    pub rollback_reason: Option<String>,
    pub dry_run_plan: Vec<(String, u32, PathBuf)>,
}

struct ResolvedPatch {
    meta_index: u32,
    archive_key: String,
    local_path: PathBuf,
}

fn normalize_query(raw: &str) -> Vec<u8> {
    raw.replace('/', "\\").into_bytes()
}

fn resolve(
    archive: &archive::Archive,
    requests: Vec<PatchRequest>,
    skipped: &mut Vec<String>,
) -> Vec<ResolvedPatch> {
    let mut seen_meta = HashSet::new();
    let mut out = Vec::new();
    for req in requests {
        let normalized = normalize_query(&req.archive_key);
        let hit = archive
            .find_meta(&normalized)
            .or_else(|| archive.find_meta(&normalized.to_ascii_lowercase()));
        match hit {
            Some((meta_index, _)) if seen_meta.insert(meta_index) => out.push(ResolvedPatch {
                meta_index,
                archive_key: req.archive_key,
                local_path: req.local_path,
            }),
            Some(_) => skipped.push(format!("{} (duplicate target)", req.archive_key)),
            None => skipped.push(format!("{} (not found)", req.archive_key)),
        }
    }
    out
}

fn compress_one(path: &Path, level: u32) -> Result<(Vec<u8>, u64, [u8; 20]), PatchError> {
    let raw = std::fs::read(path)?;
    let wrapped = wrapper::encode(&raw, level)?;
    let mut hasher = Sha1::new();
    hasher.update(&raw);
    let digest: [u8; 20] = hasher.finalize().into();
    Ok((wrapped, raw.len() as u64, digest))
}

#[cfg(feature = "parallel")]
fn compress_many(
    resolved: &[ResolvedPatch],
    level: u32,
    jobs: Option<usize>,
) -> Result<Vec<(Vec<u8>, u64, [u8; 20])>, PatchError> {
    use rayon::prelude::*;
    let work = |r: &ResolvedPatch| compress_one(&r.local_path, level);
    match jobs {
        Some(n) => {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(n)
                .build()
                .map_err(std::io::Error::other)?;
            pool.install(|| resolved.par_iter().map(work).collect())
        }
        None => resolved.par_iter().map(work).collect(),
    }
}

#[cfg(not(feature = "parallel"))]
fn compress_many(
    resolved: &[ResolvedPatch],
    level: u32,
    _jobs: Option<usize>,
) -> Result<Vec<(Vec<u8>, u64, [u8; 20])>, PatchError> {
    resolved.iter().map(|r| compress_one(&r.local_path, level)).collect()
}

/// Runs the full resolve → preflight → prepare → commit → verify pipeline.
/// On any post-write failure, rolls back and returns `Ok` with
/// `rolled_back = true` rather than leaving the archive half-written.
pub fn patch(
    idx_path: &Path,
    dat_path: &Path,
    requests: Vec<PatchRequest>,
    opts: &PatchOptions,
) -> Result<PatchOutcome, PatchError> {
    let mut outcome = PatchOutcome::default();

    let reader = archive::Archive::open(idx_path, dat_path)?;
    let mut skipped = Vec::new();
    let resolved = resolve(&reader, requests, &mut skipped);
    outcome.skipped = skipped;
    outcome.state = Some(PatchState::Resolved);

    if opts.dry_run {
        outcome.dry_run_plan = resolved
            .iter()
            .map(|r| (r.archive_key.clone(), r.meta_index, r.local_path.clone()))
            .collect();
        return Ok(outcome);
    }
    if resolved.is_empty() {
        return Ok(outcome);
    }

    // Preflight.
    let header = reader.header().clone();
    let original_dat_size = std::fs::metadata(dat_path)?.len();
    let fat_entry_count = reader.fat().len() as u64;
    if original_dat_size % datfat::BLOCK_SIZE != 0 {
        return Err(PatchError::InconsistentArchive(
            "data file size is not a multiple of the block size".into(),
        ));
    }
    if original_dat_size / datfat::BLOCK_SIZE != fat_entry_count {
        return Err(PatchError::InconsistentArchive(
            "data file block count disagrees with the FAT entry count".into(),
        ));
    }
    if header.channels[layout::CHANNEL_FAT].size_bytes as u64 != fat_entry_count * 4 {
        return Err(PatchError::InconsistentArchive(
            "FAT channel size_bytes disagrees with its entry count".into(),
        ));
    }
    let meta_capacity = header.channel_capacity_bytes(layout::CHANNEL_META) / meta::RECORD_SIZE as u64;
    for r in &resolved {
        if r.meta_index as u64 >= meta_capacity {
            return Err(PatchError::CapacityExceeded(format!(
                "meta_index {} exceeds meta channel capacity {meta_capacity}",
                r.meta_index
            )));
        }
    }

    // Phase 2: prepare. Compression is dispatched to a worker pool sized by
    // opts.jobs, same as repack's phase 3.
    let level = opts.level;
    let prepared = compress_many(&resolved, level, opts.jobs)?;

    let total_new_blocks: u64 = prepared
        .iter()
        .map(|(wrapped, _, _)| (wrapped.len() as u64).div_ceil(datfat::BLOCK_SIZE).max(1))
        .sum();
    let original_fat_size = fat_entry_count * 4;
    let new_fat_size = (fat_entry_count + total_new_blocks) * 4;
    let fat_capacity = header.channel_capacity_bytes(layout::CHANNEL_FAT);
    if new_fat_size > fat_capacity {
        return Err(PatchError::CapacityExceeded(format!(
            "FAT growth to {new_fat_size} bytes exceeds channel capacity {fat_capacity}"
        )));
    }

    let mut old_meta_bytes = Vec::with_capacity(resolved.len());
    let mut new_meta_bytes = Vec::with_capacity(resolved.len());
    let mut next_block = fat_entry_count as u32;
    let mut new_fat_words: Vec<u32> = Vec::new();
    for (r, (wrapped, _, _)) in resolved.iter().zip(&prepared) {
        let old = reader.meta().get(r.meta_index).unwrap_or_default();
        old_meta_bytes.push(old.to_bytes());

        let (block, count, words) = datfat::append_chain(&mut Vec::new(), next_block, wrapped);
        new_fat_words.extend(words);
        next_block += count;

        let new_rec = meta::MetaRecord {
            flags: old.flags | 1,
            size: wrapped.len() as u32,
            start_block: block,
            extra: old.extra,
        };
        new_meta_bytes.push(new_rec.to_bytes());
    }
    outcome.state = Some(PatchState::Prepared);

    // Phase 3: commit. Grow the data file first.
    let mut dat = OpenOptions::new().write(true).open(dat_path)?;
    dat.seek(SeekFrom::End(0))?;
    let mut writer = datfat::WriteBuffer::new(&mut dat);
    for (wrapped, _, _) in &prepared {
        let block_count = (wrapped.len() as u64).div_ceil(datfat::BLOCK_SIZE).max(1);
        let mut padded = wrapped.clone();
        padded.resize(block_count as usize * datfat::BLOCK_SIZE as usize, 0);
        writer.write_bytes(&padded)?;
    }
    writer.flush_now()?;
    dat.sync_all()?;
    outcome.state = Some(PatchState::DatAppended);

    // Update the index: new FAT words, new FAT size, new meta slots.
    let mut idx = OpenOptions::new().write(true).open(idx_path)?;
    let mut new_fat_bytes = Vec::with_capacity(new_fat_words.len() * 4);
    for word in &new_fat_words {
        new_fat_bytes.extend_from_slice(&word.to_le_bytes());
    }
    header.write_channel_bytes(&mut idx, layout::CHANNEL_FAT, original_fat_size, &new_fat_bytes)?;
    idx.seek(SeekFrom::Start(layout::Header::size_bytes_field_offset(
        layout::CHANNEL_FAT,
    )))?;
    idx.write_all(&(new_fat_size as u32).to_le_bytes())?;
    for (r, new_bytes) in resolved.iter().zip(&new_meta_bytes) {
        header.write_channel_bytes(
            &mut idx,
            layout::CHANNEL_META,
            r.meta_index as u64 * meta::RECORD_SIZE as u64,
            new_bytes,
        )?;
    }
    idx.sync_all()?;
    outcome.state = Some(PatchState::IdxUpdated);

    // Phase 4: verify.
    let mut reopened = match archive::Archive::open(idx_path, dat_path) {
        Ok(a) => a,
        Err(e) => {
            return Ok(rollback(
                idx_path,
                dat_path,
                &header,
                original_dat_size,
                original_fat_size,
                &resolved,
                &old_meta_bytes,
                outcome.skipped.clone(),
                e.to_string(),
            ))
        }
    };
    for (r, (_, raw_size, raw_sha1)) in resolved.iter().zip(&prepared) {
        match reopened.read_file_bytes(r.meta_index) {
            Ok(bytes) => {
                let mut hasher = Sha1::new();
                hasher.update(&bytes);
                let digest: [u8; 20] = hasher.finalize().into();
                if bytes.len() as u64 != *raw_size || &digest != raw_sha1 {
                    return Ok(rollback(
                        idx_path,
                        dat_path,
                        &header,
                        original_dat_size,
                        original_fat_size,
                        &resolved,
                        &old_meta_bytes,
                        outcome.skipped.clone(),
                        format!("digest mismatch for {}", r.archive_key),
                    ));
                }
            }
            Err(e) => {
                return Ok(rollback(
                    idx_path,
                    dat_path,
                    &header,
                    original_dat_size,
                    original_fat_size,
                    &resolved,
                    &old_meta_bytes,
                    outcome.skipped.clone(),
                    format!("{}: {e}", r.archive_key),
                ))
            }
        }
    }

    outcome.state = Some(PatchState::Verified);
    outcome.patched = resolved.into_iter().map(|r| r.archive_key).collect();
    Ok(outcome)
}

/// Restores the data and index files to their pre-patch state. If rollback's
/// own I/O fails, the archive is left in whatever state that I/O reached and
/// the outcome carries `PatchState::Failed` rather than `RolledBack` — the
/// verify failure that triggered this call is still the root cause, but it
/// is now compounded by an unrecovered write.
#[allow(clippy::too_many_arguments)]
fn rollback(
    idx_path: &Path,
    dat_path: &Path,
    header: &layout::Header,
    original_dat_size: u64,
    original_fat_size: u64,
    resolved: &[ResolvedPatch],
    old_meta_bytes: &[[u8; meta::RECORD_SIZE]],
    skipped: Vec<String>,
    reason: String,
) -> PatchOutcome {
    let restore: Result<(), std::io::Error> = (|| {
        let mut dat = OpenOptions::new().write(true).open(dat_path)?;
        dat.set_len(original_dat_size)?;
        dat.sync_all()?;

        let mut idx = OpenOptions::new().write(true).open(idx_path)?;
        for (r, old_bytes) in resolved.iter().zip(old_meta_bytes) {
            header
                .write_channel_bytes(
                    &mut idx,
                    layout::CHANNEL_META,
                    r.meta_index as u64 * meta::RECORD_SIZE as u64,
                    old_bytes,
                )
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        }
        idx.seek(SeekFrom::Start(layout::Header::size_bytes_field_offset(
            layout::CHANNEL_FAT,
        )))?;
        idx.write_all(&(original_fat_size as u32).to_le_bytes())?;
        idx.sync_all()
    })();

    match restore {
        Ok(()) => PatchOutcome {
            state: Some(PatchState::RolledBack),
            patched: Vec::new(),
            skipped,
            rolled_back: true,
            rollback_reason: Some(reason),
            dry_run_plan: Vec::new(),
        },
        Err(e) => PatchOutcome {
            state: Some(PatchState::Failed),
            patched: Vec::new(),
            skipped,
            rolled_back: false,
            rollback_reason: Some(format!("{reason}; rollback itself failed: {e}")),
            dry_run_plan: Vec::new(),
        },
    }
}
