use clap::{Parser, Subcommand};
use pakforge::archive::Archive;
use pakforge::patch::{self, PatchOptions, PatchRequest};
use pakforge::repack::{self, RepackOptions, RepackSource};
use pakforge::report::{write_tsv, ReportRow};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "pakforge", version = "1.0.0", about = "Reader, repacker, and in-place patcher for striped-index game archives")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read-only inspection of an existing archive
    Extract {
        #[arg(long)]
        idx: PathBuf,
        #[arg(long)]
        dat: Option<PathBuf>,
        #[command(subcommand)]
        action: ExtractAction,
    },
    /// Build a fresh archive from a directory or file list
    Repack {
        #[arg(long)]
        in_dir: Option<PathBuf>,
        #[arg(long)]
        out_idx: PathBuf,
        #[arg(long)]
        out_dat: PathBuf,
        #[arg(long)]
        file_list: Option<PathBuf>,
        #[arg(long, default_value = "6")]
        compress_level: u32,
        #[arg(long)]
        jobs: Option<usize>,
        #[arg(long)]
        auto_tune_jobs: bool,
        #[arg(long)]
        size_schedule: bool,
        #[arg(long)]
        verify: bool,
    },
    /// Replace the payload of one or more existing entries in place
    Patch {
        #[arg(long)]
        idx: PathBuf,
        #[arg(long)]
        dat: PathBuf,
        /// `archive_key=local_path`, repeatable
        #[arg(long = "file")]
        files: Vec<String>,
        #[arg(long)]
        patch_dir: Option<PathBuf>,
        #[arg(long, default_value = "6")]
        compress_level: u32,
        #[arg(long)]
        jobs: Option<usize>,
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand)]
enum ExtractAction {
    /// Archive summary: page size, stripe count, channel sizes, entry count
    Info,
    /// List every directory-trie entry
    ListDt {
        #[arg(long)]
        only_files: bool,
    },
    /// List string-table records unreachable from the trie
    ListOrphans,
    /// Compare the archive's contents against a list of expected paths
    Compare {
        #[arg(long)]
        full_list: PathBuf,
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Extract every file entry to a directory
    ExtractAll {
        #[arg(long)]
        out: PathBuf,
        #[arg(long)]
        keep_going: bool,
        #[arg(long)]
        skip_existing: bool,
    },
    /// Extract the entries named in a list of paths
    ExtractList {
        #[arg(long)]
        full_list: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long)]
        keep_going: bool,
        #[arg(long)]
        skip_existing: bool,
        #[arg(long)]
        report: Option<PathBuf>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    match Cli::parse().command {
        Commands::Extract { idx, dat, action } => run_extract(&idx, dat.as_deref(), action)?,
        Commands::Repack {
            in_dir,
            out_idx,
            out_dat,
            file_list,
            compress_level,
            jobs,
            auto_tune_jobs,
            size_schedule,
            verify,
        } => run_repack(
            in_dir,
            &out_idx,
            &out_dat,
            file_list,
            compress_level,
            jobs,
            auto_tune_jobs,
            size_schedule,
            verify,
        )?,
        Commands::Patch {
            idx,
            dat,
            files,
            patch_dir,
            compress_level,
            jobs,
            dry_run,
        } => run_patch(&idx, &dat, files, patch_dir, compress_level, jobs, dry_run)?,
    }
    Ok(())
}

fn normalize_path_key(raw: &str) -> Vec<u8> {
    raw.replace('/', "\\").into_bytes()
}

fn run_extract(
    idx: &Path,
    dat: Option<&Path>,
    action: ExtractAction,
) -> Result<(), Box<dyn std::error::Error>> {
    match action {
        ExtractAction::Info => {
            let archive = open_for(idx, dat)?;
            let header = archive.header();
            let file_count = archive
                .iter_entries()
                .filter(|e| e.meta.is_some_and(|m| m.has_payload()))
                .count();
            println!("── pakforge archive ─────────────────────────────────────");
            println!("  Index          {}", idx.display());
            println!("  Page size      {} B", header.page_size);
            println!("  Stripes        {}", header.stripes);
            println!("  Files          {file_count}");
        }
        ExtractAction::ListDt { only_files } => {
            let archive = open_for(idx, dat)?;
            for entry in archive.iter_entries() {
                let has_payload = entry.meta.is_some_and(|m| m.has_payload());
                if only_files && !has_payload {
                    continue;
                }
                println!("{}", String::from_utf8_lossy(&entry.path));
            }
        }
        ExtractAction::ListOrphans => {
            let archive = open_for(idx, dat)?;
            let mut reachable = std::collections::HashSet::new();
            for entry in archive.iter_entries() {
                if let Ok(chain) = archive.strings().chain_indices(entry.string_index) {
                    reachable.extend(chain);
                }
            }
            for i in 1..archive.strings().record_count() as u32 {
                if !reachable.contains(&i) {
                    if let Ok(s) = archive.strings().read_string(i) {
                        println!("{}", String::from_utf8_lossy(&s));
                    }
                }
            }
        }
        ExtractAction::Compare { full_list, report } => {
            let archive = open_for(idx, dat)?;
            let expected = read_lines(&full_list)?;
            let mut archive_files: std::collections::HashSet<Vec<u8>> = archive
                .iter_entries()
                .filter(|e| e.meta.is_some_and(|m| m.has_payload()))
                .map(|e| e.path.to_vec())
                .collect();

            let mut rows = Vec::new();
            for raw in &expected {
                let key = normalize_path_key(raw);
                match archive.find_meta(&key) {
                    Some((_, meta)) if meta.has_payload() => {
                        archive_files.remove(&key.to_ascii_lowercase());
                        archive_files.remove(&key);
                        rows.push(ReportRow::ok(raw.clone()));
                    }
                    Some(_) => rows.push(ReportRow::dt_only(raw.clone())),
                    None => rows.push(ReportRow::absent(raw.clone())),
                }
            }
            for leftover in archive_files {
                rows.push(ReportRow::orphan(String::from_utf8_lossy(&leftover).into_owned()));
            }

            for row in &rows {
                println!("{}\t{}", row.status, row.path);
            }
            if let Some(report_path) = report {
                write_tsv(&report_path, &rows)?;
            }
        }
        ExtractAction::ExtractAll {
            out,
            keep_going,
            skip_existing,
        } => {
            let mut archive = open_for(idx, dat)?;
            let entries: Vec<(u32, Vec<u8>)> = archive
                .iter_entries()
                .filter(|e| e.meta.is_some_and(|m| m.has_payload()))
                .map(|e| (e.meta_index, e.path.to_vec()))
                .collect();
            let mut failures = 0;
            for (meta_index, path) in entries {
                if let Err(e) = extract_one(&mut archive, meta_index, &path, &out, skip_existing) {
                    failures += 1;
                    eprintln!("failed: {}: {e}", String::from_utf8_lossy(&path));
                    if !keep_going {
                        return Err(e);
                    }
                }
            }
            if failures > 0 {
                std::process::exit(1);
            }
        }
        ExtractAction::ExtractList {
            full_list,
            out,
            keep_going,
            skip_existing,
            report,
        } => {
            let mut archive = open_for(idx, dat)?;
            let wanted = read_lines(&full_list)?;
            let mut rows = Vec::new();
            for raw in wanted {
                let key = normalize_path_key(&raw);
                match archive.find_meta(&key) {
                    Some((meta_index, meta)) if meta.has_payload() => {
                        match extract_one(&mut archive, meta_index, &key, &out, skip_existing) {
                            Ok(()) => rows.push(ReportRow::ok(raw)),
                            Err(e) => {
                                rows.push(ReportRow::failed(raw.clone(), e.to_string()));
                                if !keep_going {
                                    if let Some(report_path) = report {
                                        write_tsv(&report_path, &rows)?;
                                    }
                                    return Err(e);
                                }
                            }
                        }
                    }
                    _ => rows.push(ReportRow::missing(raw)),
                }
            }
            for row in &rows {
                println!("{}\t{}", row.status, row.path);
            }
            if let Some(report_path) = report {
                write_tsv(&report_path, &rows)?;
            }
        }
    }
    Ok(())
}

fn open_for(idx: &Path, dat: Option<&Path>) -> Result<Archive, Box<dyn std::error::Error>> {
    let dat_path = dat.map(Path::to_path_buf).unwrap_or_else(|| idx.with_extension("dat"));
    Ok(Archive::open(idx, &dat_path)?)
}

fn read_lines(path: &Path) -> std::io::Result<Vec<String>> {
    Ok(std::fs::read_to_string(path)?
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

fn extract_one(
    archive: &mut Archive,
    meta_index: u32,
    key: &[u8],
    out_dir: &Path,
    skip_existing: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let rel = String::from_utf8_lossy(key).replace('\\', "/");
    let dest = out_dir.join(rel);
    if skip_existing && dest.exists() {
        return Ok(());
    }
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let bytes = archive.read_file_bytes(meta_index)?;
    std::fs::write(&dest, bytes)?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_repack(
    in_dir: Option<PathBuf>,
    out_idx: &Path,
    out_dat: &Path,
    file_list: Option<PathBuf>,
    compress_level: u32,
    jobs: Option<usize>,
    auto_tune_jobs: bool,
    size_schedule: bool,
    verify: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if !(1..=9).contains(&compress_level) {
        return Err("--compress-level must be between 1 and 9".into());
    }
    let source = match (in_dir, file_list) {
        (Some(dir), None) => RepackSource::Directory(dir),
        (None, Some(list_path)) => {
            let list = read_lines(&list_path)?
                .into_iter()
                .filter_map(|line| {
                    let (key, path) = line.split_once('=')?;
                    Some((key.to_string(), PathBuf::from(path)))
                })
                .collect();
            RepackSource::List(list)
        }
        _ => return Err("repack requires exactly one of --in-dir or --file-list".into()),
    };

    let opts = RepackOptions {
        level: compress_level,
        jobs,
        auto_tune_jobs,
        size_schedule,
        verify,
    };
    let report = repack::repack(source, out_idx, out_dat, &opts)?;
    println!("Wrote {} ({} entries)", out_idx.display(), report.entries_written);
    if !report.duplicates_skipped.is_empty() {
        println!("  {} duplicate key(s) skipped", report.duplicates_skipped.len());
    }
    if let Some(jobs) = report.chosen_jobs {
        println!("  auto-tuned to {jobs} worker(s)");
    }
    if !report.verify_mismatches.is_empty() {
        for path in &report.verify_mismatches {
            eprintln!("verify mismatch: {path}");
        }
        std::process::exit(1);
    }
    Ok(())
}

fn run_patch(
    idx: &Path,
    dat: &Path,
    files: Vec<String>,
    patch_dir: Option<PathBuf>,
    compress_level: u32,
    jobs: Option<usize>,
    dry_run: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if !(1..=9).contains(&compress_level) {
        return Err("--compress-level must be between 1 and 9".into());
    }

    let mut requests = Vec::new();
    for spec in files {
        let (key, local) = spec
            .split_once('=')
            .ok_or("--file must be of the form archive_key=local_path")?;
        requests.push(PatchRequest {
            archive_key: key.to_string(),
            local_path: PathBuf::from(local),
        });
    }
    if let Some(dir) = patch_dir {
        for entry in walkdir::WalkDir::new(&dir).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry.path().strip_prefix(&dir).unwrap();
            let key = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("\\");
            requests.push(PatchRequest {
                archive_key: key,
                local_path: entry.path().to_path_buf(),
            });
        }
    }

    let opts = PatchOptions {
        level: compress_level,
        dry_run,
        jobs,
    };
    let outcome = patch::patch(idx, dat, requests, &opts)?;

    if dry_run {
        println!("Dry run — {} entr(y/ies) would be patched:", outcome.dry_run_plan.len());
        for (key, meta_index, local) in &outcome.dry_run_plan {
            println!("  {key} (meta_index={meta_index}) <- {}", local.display());
        }
    } else {
        for key in &outcome.patched {
            println!("patched {key}");
        }
    }
    for skip in &outcome.skipped {
        eprintln!("skipped: {skip}");
    }
    if outcome.rolled_back {
        eprintln!(
            "rolled back: {}",
            outcome.rollback_reason.as_deref().unwrap_or("unknown")
        );
        return Err(patch::PatchError::VerificationFailed(
            outcome.rollback_reason.unwrap_or_default(),
        )
        .into());
    }
    Ok(())
}
