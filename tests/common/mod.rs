#![allow(dead_code)]

use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Scratch directory for one test; removed when the guard drops.
pub fn test_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("failed to create test directory")
}

/// Write `data` as the input file for a sort.
pub fn write_input(dir: &Path, data: &[u8]) -> PathBuf {
    let path = dir.join("input.bin");
    std::fs::write(&path, data).expect("failed to write input file");
    path
}

/// Build `count` records of `record_size` bytes from a seeded generator,
/// shuffled but reproducible.
pub fn random_records(record_size: usize, count: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut data = vec![0u8; record_size * count];
    rng.fill(data.as_mut_slice());
    data
}

/// The expected output: the same records, sorted bytewise.
pub fn sorted_copy(data: &[u8], record_size: usize) -> Vec<u8> {
    let mut records: Vec<&[u8]> = data.chunks_exact(record_size).collect();
    records.sort_unstable();
    let mut out = Vec::with_capacity(data.len());
    for rec in records {
        out.extend_from_slice(rec);
    }
    out
}

pub fn assert_records_sorted(data: &[u8], record_size: usize) {
    let records: Vec<&[u8]> = data.chunks_exact(record_size).collect();
    assert!(
        records.windows(2).all(|w| w[0] <= w[1]),
        "records are not in ascending bytewise order"
    );
}

/// Every `<input>.tmp_<n>` left in the directory; empty after a clean sort.
pub fn leftover_temp_files(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .expect("failed to list test directory")
        .map(|e| e.unwrap().path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.contains(".tmp_"))
        })
        .collect()
}
