//! Deterministic build of a fresh archive from a directory tree or explicit
//! file list, per spec phases 1 through 6.

use crate::{archive, datfat, layout, meta, strtab, trie, wrapper};
use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum RepackError {
    #[error(transparent)]
    Trie(#[from] trie::TrieError),
    #[error(transparent)]
    Layout(#[from] layout::LayoutError),
    #[error(transparent)]
    Wrapper(#[from] wrapper::WrapperError),
    #[error(transparent)]
    Archive(#[from] archive::ArchiveError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub enum RepackSource {
    Directory(PathBuf),
    List(Vec<(String, PathBuf)>),
}

#[derive(Debug, Clone)]
pub struct RepackOptions {
    pub level: u32,
    pub jobs: Option<usize>,
    pub auto_tune_jobs: bool,
    pub size_schedule: bool,
    pub verify: bool,
}

impl Default for RepackOptions {
    fn default() -> Self {
        Self {
            level: 6,
            jobs: None,
            auto_tune_jobs: false,
            size_schedule: false,
            verify: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct RepackReport {
    pub entries_written: usize,
    pub duplicates_skipped: Vec<String>,
    pub verify_mismatches: Vec<String>,
    pub chosen_jobs: Option<usize>,
}

fn normalize_key(raw: &str) -> Vec<u8> {
    raw.replace('/', "\\").to_ascii_lowercase().into_bytes()
}

fn collect_from_directory(root: &Path) -> Result<Vec<(String, PathBuf)>, RepackError> {
    let mut out = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| std::io::Error::other(e))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(root).unwrap();
        let key = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("\\");
        out.push((key, entry.path().to_path_buf()));
    }
    Ok(out)
}

#[cfg(feature = "parallel")]
fn compress_many(
    dispatch_order: &[usize],
    local_paths: &[PathBuf],
    level: u32,
    jobs: Option<usize>,
) -> Result<Vec<Vec<u8>>, RepackError> {
    use rayon::prelude::*;
    let work = |&idx: &usize| -> Result<Vec<u8>, RepackError> {
        let raw = std::fs::read(&local_paths[idx])?;
        Ok(wrapper::encode(&raw, level)?)
    };
    match jobs {
        Some(n) => {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(n)
                .build()
                .map_err(std::io::Error::other)?;
            pool.install(|| dispatch_order.par_iter().map(work).collect())
        }
        None => dispatch_order.par_iter().map(work).collect(),
    }
}

#[cfg(not(feature = "parallel"))]
fn compress_many(
    dispatch_order: &[usize],
    local_paths: &[PathBuf],
    level: u32,
    _jobs: Option<usize>,
) -> Result<Vec<Vec<u8>>, RepackError> {
    dispatch_order
        .iter()
        .map(|&idx| {
            let raw = std::fs::read(&local_paths[idx])?;
            Ok(wrapper::encode(&raw, level)?)
        })
        .collect()
}

fn sample_compress_duration(sample: &[usize], local_paths: &[PathBuf], level: u32, jobs: usize) -> Duration {
    let start = Instant::now();
    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        if let Ok(pool) = rayon::ThreadPoolBuilder::new().num_threads(jobs).build() {
            pool.install(|| {
                let _: Vec<_> = sample
                    .par_iter()
                    .map(|&idx| {
                        std::fs::read(&local_paths[idx]).map(|raw| wrapper::encode(&raw, level))
                    })
                    .collect();
            });
        }
    }
    #[cfg(not(feature = "parallel"))]
    {
        let _ = jobs;
        for &idx in sample {
            if let Ok(raw) = std::fs::read(&local_paths[idx]) {
                let _ = wrapper::encode(&raw, level);
            }
        }
    }
    start.elapsed()
}

/// Samples up to 128 inputs at candidate worker counts and returns the
/// fastest, or `opts.jobs` unchanged when auto-tune doesn't apply.
fn resolve_jobs(opts: &RepackOptions, local_paths: &[PathBuf], dispatch_order: &[usize]) -> Option<usize> {
    if !opts.auto_tune_jobs || dispatch_order.len() < 256 {
        return opts.jobs;
    }
    let cores = num_cpus::get();
    let requested = opts.jobs.unwrap_or(cores);
    let mut candidates = vec![1, (cores / 2).max(1), cores, cores * 2, requested];
    candidates.sort_unstable();
    candidates.dedup();

    let sample: Vec<usize> = dispatch_order.iter().take(128).copied().collect();
    let mut best_jobs = requested;
    let mut best_elapsed = Duration::MAX;
    for n in candidates {
        let elapsed = sample_compress_duration(&sample, local_paths, opts.level, n);
        if elapsed < best_elapsed {
            best_elapsed = elapsed;
            best_jobs = n;
        }
    }
    Some(best_jobs)
}

pub fn repack(
    source: RepackSource,
    out_idx: &Path,
    out_dat: &Path,
    opts: &RepackOptions,
) -> Result<RepackReport, RepackError> {
    let candidates = match source {
        RepackSource::Directory(root) => collect_from_directory(&root)?,
        RepackSource::List(list) => list,
    };

    // Phase 1: keys and strings.
    let mut seen = HashSet::new();
    let mut keys: Vec<Vec<u8>> = Vec::new();
    let mut local_paths: Vec<PathBuf> = Vec::new();
    let mut string_indices: Vec<u32> = Vec::new();
    let mut strtab_builder = strtab::StringBuilder::new();
    let mut report = RepackReport::default();

    for (raw_key, local_path) in candidates {
        let normalized = normalize_key(&raw_key);
        if !seen.insert(normalized.clone()) {
            report.duplicates_skipped.push(raw_key);
            continue;
        }
        let string_index = strtab_builder.add(&normalized);
        keys.push(normalized);
        local_paths.push(local_path);
        string_indices.push(string_index);
    }

    // Phase 2: trie, fed in acceptance order.
    let mut trie_builder = trie::TrieBuilder::new();
    for (i, key) in keys.iter().enumerate() {
        trie_builder.insert(key, i as u32, string_indices[i], &keys)?;
    }

    // Phase 3: compression + DAT.
    let mut dispatch_order: Vec<usize> = (0..local_paths.len()).collect();
    if opts.size_schedule {
        let mut sized: Vec<(usize, u64)> = dispatch_order
            .iter()
            .map(|&i| {
                let len = std::fs::metadata(&local_paths[i]).map(|m| m.len()).unwrap_or(0);
                (i, len)
            })
            .collect();
        sized.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        dispatch_order = sized.into_iter().map(|(i, _)| i).collect();
    }

    let jobs = resolve_jobs(opts, &local_paths, &dispatch_order);
    report.chosen_jobs = jobs;

    let compressed = compress_many(&dispatch_order, &local_paths, opts.level, jobs)?;

    let mut dat_staging = vec![0u8; datfat::BLOCK_SIZE as usize]; // reserved block 0
    let mut start_block = vec![0u32; local_paths.len()];
    let mut wrapped_size = vec![0u32; local_paths.len()];
    let mut fat_words: Vec<u32> = vec![0]; // entry 0 reserved
    let mut next_block = 1u32;

    for (slot, &orig_idx) in dispatch_order.iter().enumerate() {
        let wrapped = &compressed[slot];
        let (block, count, words) = datfat::append_chain(&mut dat_staging, next_block, wrapped);
        start_block[orig_idx] = block;
        wrapped_size[orig_idx] = wrapped.len() as u32;
        fat_words.extend(words);
        next_block += count;
    }

    // Phase 4: meta + FAT buffers, in original key order.
    let mut meta_bytes = vec![0u8; keys.len() * meta::RECORD_SIZE];
    for i in 0..keys.len() {
        let rec = meta::MetaRecord::compressed(wrapped_size[i], start_block[i]);
        rec.write(&mut meta_bytes[i * meta::RECORD_SIZE..(i + 1) * meta::RECORD_SIZE]);
    }
    let mut fat_bytes = Vec::with_capacity(fat_words.len() * 4);
    for word in &fat_words {
        fat_bytes.extend_from_slice(&word.to_le_bytes());
    }

    // Phase 5: index file.
    let trie_bytes = trie_builder.into_bytes();
    let string_bytes = strtab_builder.into_bytes();

    let header = layout::Header::for_fresh_archive([
        trie_bytes.len() as u32,
        string_bytes.len() as u32,
        meta_bytes.len() as u32,
        fat_bytes.len() as u32,
    ]);

    let mut idx_file = File::create(out_idx)?;
    idx_file.set_len(header.total_file_size())?;
    header.write_archive(&mut idx_file, &[trie_bytes, string_bytes, meta_bytes, fat_bytes])?;
    idx_file.sync_all()?;

    let mut dat_file = File::create(out_dat)?;
    use std::io::Write as _;
    dat_file.write_all(&dat_staging)?;
    dat_file.sync_all()?;

    report.entries_written = keys.len();

    // Optional phase 6: verify.
    if opts.verify {
        let mut opened = archive::Archive::open(out_idx, out_dat)?;
        for i in 0..keys.len() {
            let original = std::fs::read(&local_paths[i])?;
            match opened.read_file_bytes(i as u32) {
                Ok(bytes) if bytes == original => {}
                _ => report
                    .verify_mismatches
                    .push(String::from_utf8_lossy(&keys[i]).into_owned()),
            }
        }
    }

    Ok(report)
}
