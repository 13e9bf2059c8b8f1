use pakforge::archive::Archive;
use pakforge::patch::{self, PatchOptions, PatchRequest};
use pakforge::repack::{self, RepackOptions, RepackSource};
use std::path::Path;
use tempfile::tempdir;

fn build(dir: &Path, opts: &RepackOptions) -> (std::path::PathBuf, std::path::PathBuf) {
    let idx = dir.join("out.idx");
    let dat = dir.join("out.dat");
    repack::repack(RepackSource::Directory(dir.to_path_buf()), &idx, &dat, opts).unwrap();
    (idx, dat)
}

#[test]
fn s1_single_small_file_round_trips() {
    let dir = tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("texture")).unwrap();
    std::fs::write(dir.path().join("texture/a.dds"), b"tiny").unwrap();

    let (idx, dat) = build(dir.path(), &RepackOptions::default());
    let mut archive = Archive::open(&idx, &dat).unwrap();
    let (meta_index, _) = archive.find_meta(b"texture\\a.dds").unwrap();
    assert_eq!(archive.read_file_bytes(meta_index).unwrap(), b"tiny");
}

#[test]
fn s2_multi_block_file_spans_chain() {
    let dir = tempdir().unwrap();
    let content = vec![b'q'; 10_000];
    std::fs::write(dir.path().join("big.bin"), &content).unwrap();

    let (idx, dat) = build(dir.path(), &RepackOptions::default());
    let mut archive = Archive::open(&idx, &dat).unwrap();
    let (meta_index, meta) = archive.find_meta(b"big.bin").unwrap();
    assert!(meta.size as usize > 0);
    assert_eq!(archive.read_file_bytes(meta_index).unwrap(), content);
}

#[test]
fn s3_case_collision_across_many_files_keeps_first_by_walk_order() {
    let dir = tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("a")).unwrap();
    std::fs::write(dir.path().join("a/X.TXT"), b"upper").unwrap();
    std::fs::write(dir.path().join("a/x.txt"), b"lower").unwrap();

    let (idx, dat) = build(dir.path(), &RepackOptions::default());
    let mut archive = Archive::open(&idx, &dat).unwrap();
    let (meta_index, _) = archive.find_meta(b"a\\x.txt").unwrap();
    // walkdir's sorted order visits "X.TXT" before "x.txt" (uppercase sorts first in byte order)
    assert_eq!(archive.read_file_bytes(meta_index).unwrap(), b"upper");
}

#[test]
fn s4_patch_replaces_content_and_verifies() {
    let dir = tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("texture")).unwrap();
    std::fs::write(dir.path().join("texture/a.dds"), vec![1u8; 1500]).unwrap();
    let (idx, dat) = build(dir.path(), &RepackOptions::default());

    let new_local = dir.path().join("replacement.bin");
    std::fs::write(&new_local, vec![2u8; 3000]).unwrap();

    let outcome = patch::patch(
        &idx,
        &dat,
        vec![PatchRequest {
            archive_key: "texture/a.dds".into(),
            local_path: new_local,
        }],
        &PatchOptions::default(),
    )
    .unwrap();
    assert!(!outcome.rolled_back);
    assert_eq!(outcome.patched, vec!["texture/a.dds".to_string()]);

    let mut archive = Archive::open(&idx, &dat).unwrap();
    let (meta_index, _) = archive.find_meta(b"texture\\a.dds").unwrap();
    assert_eq!(archive.read_file_bytes(meta_index).unwrap(), vec![2u8; 3000]);
}

#[test]
fn patch_skips_unresolved_target_without_rolling_back() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("only.bin"), b"data").unwrap();
    let (idx, dat) = build(dir.path(), &RepackOptions::default());

    let new_local = dir.path().join("ignored.bin");
    std::fs::write(&new_local, b"ignored").unwrap();

    let outcome = patch::patch(
        &idx,
        &dat,
        vec![PatchRequest {
            archive_key: "does-not-exist.bin".into(),
            local_path: new_local,
        }],
        &PatchOptions::default(),
    )
    .unwrap();
    assert!(outcome.patched.is_empty());
    assert_eq!(outcome.skipped.len(), 1);
    assert!(!outcome.rolled_back);
}

#[test]
fn s6_repeated_repack_of_identical_input_is_byte_identical() {
    let dir = tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("sub")).unwrap();
    std::fs::write(dir.path().join("sub/one.txt"), b"one").unwrap();
    std::fs::write(dir.path().join("sub/two.txt"), b"two").unwrap();

    let (idx_a, dat_a) = build(dir.path(), &RepackOptions::default());
    let idx_a_bytes = std::fs::read(&idx_a).unwrap();
    let dat_a_bytes = std::fs::read(&dat_a).unwrap();

    let out_dir_b = tempdir().unwrap();
    let idx_b = out_dir_b.path().join("b.idx");
    let dat_b = out_dir_b.path().join("b.dat");
    repack::repack(
        RepackSource::Directory(dir.path().to_path_buf()),
        &idx_b,
        &dat_b,
        &RepackOptions::default(),
    )
    .unwrap();

    assert_eq!(idx_a_bytes, std::fs::read(&idx_b).unwrap());
    assert_eq!(dat_a_bytes, std::fs::read(&dat_b).unwrap());
}

#[test]
fn idempotent_patch_with_no_requests_leaves_archive_untouched() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("a.bin"), b"a").unwrap();
    let (idx, dat) = build(dir.path(), &RepackOptions::default());
    let idx_before = std::fs::read(&idx).unwrap();
    let dat_before = std::fs::read(&dat).unwrap();

    let outcome = patch::patch(&idx, &dat, Vec::new(), &PatchOptions::default()).unwrap();
    assert!(outcome.patched.is_empty());
    assert_eq!(std::fs::read(&idx).unwrap(), idx_before);
    assert_eq!(std::fs::read(&dat).unwrap(), dat_before);
}

#[test]
fn repack_verify_flag_confirms_every_file_round_trips() {
    let dir = tempdir().unwrap();
    for i in 0..20 {
        std::fs::write(dir.path().join(format!("f{i}.bin")), vec![i as u8; 200 + i]).unwrap();
    }
    let report = build(
        dir.path(),
        &RepackOptions {
            verify: true,
            ..Default::default()
        },
    );
    let mut archive = Archive::open(&report.0, &report.1).unwrap();
    assert_eq!(archive.iter_entries().count(), 20);
    for i in 0..20 {
        let (meta_index, _) = archive.find_meta(format!("f{i}.bin").as_bytes()).unwrap();
        assert_eq!(archive.read_file_bytes(meta_index).unwrap(), vec![i as u8; 200 + i]);
    }
}
