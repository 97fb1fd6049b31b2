// External merge sort for binary files of fixed-width records.
//
// The input file is a flat sequence of R-byte records, sorted in place by
// bytewise comparison: run generation partitions the file into
// memory-sized blocks and spills each as a sorted temp run, then a cascade
// of k-way merges folds the smallest runs together until one merge can
// rewrite the input directly.

pub mod diskio;
pub mod error;
pub mod sort;

// Export the main types
pub use diskio::buffer::{probe_max_buffer, AlignedBuf, SharedBuf};
pub use diskio::file::{file_size_fd, pread_fd, pwrite_fd, SharedFd};
pub use diskio::temp::TempFileManager;
pub use error::{Phase, SortError};
pub use sort::cascade::{cascade_merge, per_stream_buffer, MergePolicy};
pub use sort::merge::merge;
pub use sort::merge_stream::MergeStream;
pub use sort::run::Run;
pub use sort::run_generation::{generate_runs, RunGenConfig};
pub use sort::run_sink::RecordSink;
pub use sort::sorter::{ExternalSorter, DEFAULT_RECORD_SIZE};

/// Statistics from the run generation phase.
#[derive(Clone, Debug, Default)]
pub struct RunGenerationStats {
    pub num_runs: usize,
    pub bytes: u64,
    pub time_ms: u128,
    pub load_time_ms: u128,
    pub sort_time_ms: u128,
    pub store_time_ms: u128,
}

/// Statistics for one merge step; the last entry is the final merge into
/// the input file.
#[derive(Clone, Debug)]
pub struct MergeStats {
    pub fan_in: usize,
    pub bytes: u64,
    pub time_ms: u128,
}

/// Summary of a completed sort.
#[derive(Clone, Debug, Default)]
pub struct SortReport {
    pub record_size: usize,
    pub file_bytes: u64,
    pub run_generation: RunGenerationStats,
    pub merges: Vec<MergeStats>,
    pub total_time_ms: u128,
}

impl std::fmt::Display for SortReport {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(
            f,
            "sorted {} bytes ({} byte records) in {} ms",
            self.file_bytes, self.record_size, self.total_time_ms
        )?;
        let rg = &self.run_generation;
        writeln!(f, "  runs: {} ({} bytes)", rg.num_runs, rg.bytes)?;
        writeln!(
            f,
            "  run generation: {} ms (load={} ms, sort={} ms, store={} ms)",
            rg.time_ms, rg.load_time_ms, rg.sort_time_ms, rg.store_time_ms
        )?;
        for (i, m) in self.merges.iter().enumerate() {
            let label = if i + 1 == self.merges.len() {
                "final merge"
            } else {
                "cascade merge"
            };
            writeln!(
                f,
                "  {} {}/{}: fan-in {}, {} bytes, {} ms",
                label,
                i + 1,
                self.merges.len(),
                m.fan_in,
                m.bytes,
                m.time_ms
            )?;
        }
        Ok(())
    }
}
