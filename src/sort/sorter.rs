use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use crate::diskio::buffer::probe_max_buffer;
use crate::diskio::constants::{align_down, DIRECT_IO_ALIGNMENT};
use crate::diskio::file::{file_size_fd, SharedFd};
use crate::diskio::temp::TempFileManager;
use crate::error::{Phase, SortError};
use crate::sort::cascade::{
    cascade_merge, MergePolicy, DEFAULT_MERGE_WAYS, DEFAULT_MIN_STREAM_BUFFER,
};
use crate::sort::run_generation::{generate_runs, RunGenConfig};
use crate::SortReport;

pub const DEFAULT_RECORD_SIZE: usize = 4096;

/// Sorts a binary file of fixed-width records in place.
///
/// Phase A partitions the input into memory-sized blocks, sorts each and
/// persists it as a temp run next to the input; phase B cascades k-way
/// merges of the smallest runs until the fan-in fits the memory budget,
/// then merges straight back into the input file. The sort is complete only
/// once the final flush has returned; a failure after the final merge
/// starts leaves the input undefined.
pub struct ExternalSorter {
    record_size: usize,
    merge_ways: usize,
    min_stream_buffer: usize,
    memory_budget: Option<usize>,
    run_gen_threads: usize,
}

impl Default for ExternalSorter {
    fn default() -> Self {
        Self::new()
    }
}

impl ExternalSorter {
    pub fn new() -> Self {
        Self {
            record_size: DEFAULT_RECORD_SIZE,
            merge_ways: DEFAULT_MERGE_WAYS,
            min_stream_buffer: DEFAULT_MIN_STREAM_BUFFER,
            memory_budget: None,
            run_gen_threads: 1,
        }
    }

    pub fn set_record_size(&mut self, record_size: usize) {
        assert!(record_size > 0, "record size must be positive");
        self.record_size = record_size;
    }

    pub fn set_merge_ways(&mut self, merge_ways: usize) {
        assert!(merge_ways >= 2, "merge fan-in must be at least 2");
        self.merge_ways = merge_ways;
    }

    pub fn set_min_stream_buffer(&mut self, bytes: usize) {
        self.min_stream_buffer = bytes;
    }

    /// Fix the memory budget instead of probing for it.
    pub fn set_memory_budget(&mut self, bytes: usize) {
        self.memory_budget = Some(bytes);
    }

    pub fn set_run_gen_threads(&mut self, threads: usize) {
        assert!(threads > 0, "at least one run generation worker");
        self.run_gen_threads = threads;
    }

    /// Sort `path` in place. On success the file holds the same records in
    /// ascending bytewise order and no temp files remain.
    pub fn sort_file(&self, path: impl AsRef<Path>) -> Result<SortReport, SortError> {
        let path = path.as_ref();
        let started = Instant::now();

        // Partition offsets are record-aligned, so direct I/O on the input
        // is only possible when records cover whole DMA blocks.
        let direct = self.record_size % DIRECT_IO_ALIGNMENT == 0;
        let input = Arc::new(
            SharedFd::open_rw(path, direct)
                .map_err(|source| SortError::io(Phase::RunGenerate, source))?,
        );
        let file_size = file_size_fd(input.as_raw_fd())
            .map_err(|source| SortError::io(Phase::RunGenerate, source))?;

        if file_size == 0 {
            log::info!("{}: empty input, nothing to sort", path.display());
            return Ok(SortReport {
                record_size: self.record_size,
                file_bytes: 0,
                ..SortReport::default()
            });
        }
        if file_size % self.record_size as u64 != 0 {
            return Err(SortError::UnalignedInput {
                len: file_size,
                record_size: self.record_size,
            });
        }

        let budget = match self.memory_budget {
            Some(bytes) => bytes,
            None => probe_max_buffer(DIRECT_IO_ALIGNMENT)?,
        };
        log::info!(
            "sorting {} ({} bytes, {} byte records), memory budget {} bytes",
            path.display(),
            file_size,
            self.record_size,
            budget
        );

        let threads = self.run_gen_threads;
        let block_size = align_down((budget / threads) as u64, self.record_size as u64) as usize;
        if block_size < self.record_size {
            return Err(SortError::InsufficientMemory {
                budget,
                record_size: self.record_size,
            });
        }
        let block_size = block_size.min(file_size as usize);

        let temp = TempFileManager::new(path)?;
        let run_config = RunGenConfig {
            record_size: self.record_size,
            block_size,
            threads,
        };
        let (runs, run_generation) = generate_runs(&input, file_size, &run_config, &temp)?;

        let policy = MergePolicy {
            merge_ways: self.merge_ways,
            min_stream_buffer: self.min_stream_buffer,
            memory_budget: budget,
        };
        let merges = cascade_merge(runs, self.record_size, &policy, &temp, &input, file_size)?;

        let report = SortReport {
            record_size: self.record_size,
            file_bytes: file_size,
            run_generation,
            merges,
            total_time_ms: started.elapsed().as_millis(),
        };
        log::info!(
            "sorted {} in {} ms ({} runs, {} merges)",
            path.display(),
            report.total_time_ms,
            report.run_generation.num_runs,
            report.merges.len()
        );
        Ok(report)
    }
}
