//! Spool behaviour on a real (temporary) filesystem: layout, quarantine
//! with reason files, idempotent cleanup, restart enumeration and the
//! identifier sanitisation boundary.

use netrt::spool::{Slot, Spool};
use std::fs;
use tempfile::TempDir;

fn spool() -> (TempDir, Spool) {
    let dir = TempDir::new().unwrap();
    let spool = Spool::new(&dir.path().join("working"), "quarantine").unwrap();
    (dir, spool)
}

fn seed_files(spool: &Spool, key: &netrt::spool::StudyKey, images: usize, structures: usize) {
    spool.create(key).unwrap();
    for index in 0..images {
        fs::write(
            spool.path_for(key, Slot::Dcm).join(format!("img{}.dcm", index)),
            b"x",
        )
        .unwrap();
    }
    for index in 0..structures {
        fs::write(
            spool
                .path_for(key, Slot::Structure)
                .join(format!("rs{}.dcm", index)),
            b"x",
        )
        .unwrap();
    }
}

#[test]
fn create_lays_out_receiving_slots() {
    let (_dir, spool) = spool();
    let key = Spool::safe_key("1.2.3.4").unwrap();
    spool.create(&key).unwrap();

    assert!(spool.path_for(&key, Slot::Dcm).is_dir());
    assert!(spool.path_for(&key, Slot::Structure).is_dir());
    assert!(spool.study_dir(&key).ends_with("UID_1.2.3.4"));
    assert!(spool.exists(&key));
}

#[test]
fn file_count_covers_both_receiving_slots() {
    let (_dir, spool) = spool();
    let key = Spool::safe_key("1.2.3.4").unwrap();
    seed_files(&spool, &key, 3, 1);
    assert_eq!(spool.file_count(&key), 4);
}

#[test]
fn quarantine_moves_study_and_writes_reason() {
    let (dir, spool) = spool();
    let key = Spool::safe_key("1.2.3.4").unwrap();
    seed_files(&spool, &key, 2, 1);

    spool.quarantine(&key, "roi-empty: no ROI left").unwrap();

    assert!(!spool.exists(&key));
    let quarantine = dir.path().join("working").join("quarantine");
    let entries: Vec<_> = fs::read_dir(&quarantine)
        .unwrap()
        .filter_map(|e| e.ok())
        .collect();
    let moved: Vec<_> = entries
        .iter()
        .filter(|e| e.path().is_dir() && e.file_name().to_string_lossy().starts_with("UID_1.2.3.4_"))
        .collect();
    assert_eq!(moved.len(), 1);
    // Full contents preserved for inspection.
    assert!(moved[0].path().join("DCM").join("img0.dcm").is_file());

    let reason_files: Vec<_> = entries
        .iter()
        .filter(|e| e.file_name().to_string_lossy().ends_with(".reason.txt"))
        .collect();
    assert_eq!(reason_files.len(), 1);
    let reason = fs::read_to_string(reason_files[0].path()).unwrap();
    assert!(reason.contains("roi-empty"));
}

#[test]
fn requarantined_study_gets_independent_directory() {
    let (dir, spool) = spool();
    let key = Spool::safe_key("1.2.3.4").unwrap();

    seed_files(&spool, &key, 1, 0);
    spool.quarantine(&key, "first failure").unwrap();

    // Re-received study with the same key: fresh directory, fresh fate.
    seed_files(&spool, &key, 1, 0);
    spool.quarantine(&key, "second failure").unwrap();

    let quarantine = dir.path().join("working").join("quarantine");
    let moved = fs::read_dir(&quarantine)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .count();
    assert_eq!(moved, 2);
}

#[test]
fn cleanup_is_idempotent() {
    let (_dir, spool) = spool();
    let key = Spool::safe_key("1.2.3.4").unwrap();
    seed_files(&spool, &key, 2, 1);

    spool.cleanup(&key).unwrap();
    assert!(!spool.exists(&key));
    // Second cleanup after the directory is gone is a no-op.
    spool.cleanup(&key).unwrap();
}

#[test]
fn list_studies_skips_quarantine_and_foreign_entries() {
    let (dir, spool) = spool();
    let a = Spool::safe_key("1.2.3.4").unwrap();
    let b = Spool::safe_key("5.6.7.8").unwrap();
    seed_files(&spool, &a, 1, 0);
    seed_files(&spool, &b, 1, 0);
    fs::create_dir_all(dir.path().join("working").join("not-a-study")).unwrap();

    let c = Spool::safe_key("9.9.9.9").unwrap();
    seed_files(&spool, &c, 1, 0);
    spool.quarantine(&c, "failed").unwrap();

    let listed = spool.list_studies().unwrap();
    assert_eq!(listed, vec![a, b]);
}

#[test]
fn malformed_identifiers_never_touch_the_working_tree() {
    let (dir, spool) = spool();
    assert!(Spool::safe_key("../evil").is_err());
    assert!(Spool::safe_key("a/b/c").is_err());

    // Nothing was created anywhere under the temp root.
    let names: Vec<_> = fs::read_dir(dir.path().join("working"))
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(names, vec!["quarantine".to_string()]);
    drop(spool);
}
