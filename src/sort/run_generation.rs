use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::diskio::buffer::AlignedBuf;
use crate::diskio::constants::{align_down, align_up, DIRECT_IO_ALIGNMENT, MIB};
use crate::diskio::file::{pread_full, SharedFd};
use crate::diskio::temp::TempFileManager;
use crate::error::{Phase, SortError};
use crate::sort::run::Run;
use crate::sort::run_sink::RecordSink;
use crate::RunGenerationStats;

/// Upper bound on the sink staging chunk during run generation; partitions
/// smaller than this use their own (aligned) size.
const RUN_SINK_CHUNK: usize = 4 * MIB;

pub struct RunGenConfig {
    pub record_size: usize,
    /// Partition size `B`: a multiple of the record size. The last
    /// partition may be shorter.
    pub block_size: usize,
    pub threads: usize,
}

struct WorkerOutput {
    runs: Vec<Run>,
    load: Duration,
    sort: Duration,
    store: Duration,
}

/// Phase A: partition the input at offsets `0, B, 2B, …`, sort each
/// partition in memory and persist it as one temp run (several smaller
/// ones if the partition buffer cannot be allocated whole).
///
/// Workers pull partition indices from a shared counter and hold at most
/// one partition buffer each, which bounds peak memory at
/// `threads × block_size` plus the sink staging buffers.
pub fn generate_runs(
    input: &Arc<SharedFd>,
    file_size: u64,
    config: &RunGenConfig,
    temp: &TempFileManager,
) -> Result<(Vec<Run>, RunGenerationStats), SortError> {
    assert!(config.block_size >= config.record_size);
    assert_eq!(config.block_size % config.record_size, 0);

    let started = Instant::now();
    let mut partitions = Vec::new();
    let mut offset = 0;
    while offset < file_size {
        let len = (config.block_size as u64).min(file_size - offset);
        partitions.push((offset, len as usize));
        offset += len;
    }

    if partitions.is_empty() {
        return Ok((Vec::new(), RunGenerationStats::default()));
    }

    let threads = config.threads.max(1).min(partitions.len());
    log::info!(
        "run generation: {} partitions of up to {} bytes, {} worker(s)",
        partitions.len(),
        config.block_size,
        threads
    );

    let next = AtomicUsize::new(0);
    let outputs: Vec<Result<WorkerOutput, SortError>> = thread::scope(|scope| {
        let mut handles = Vec::with_capacity(threads);
        for _ in 0..threads {
            let next = &next;
            let partitions = &partitions;
            handles.push(scope.spawn(move || {
                let mut out = WorkerOutput {
                    runs: Vec::new(),
                    load: Duration::default(),
                    sort: Duration::default(),
                    store: Duration::default(),
                };
                loop {
                    let i = next.fetch_add(1, Ordering::Relaxed);
                    let Some(&(offset, len)) = partitions.get(i) else {
                        return Ok(out);
                    };
                    process_partition(input, offset, len, config, temp, &mut out)?;
                }
            }));
        }
        handles
            .into_iter()
            .map(|h| h.join().expect("run generation worker panicked"))
            .collect()
    });

    let mut runs = Vec::new();
    let mut load = Duration::default();
    let mut sort = Duration::default();
    let mut store = Duration::default();
    for output in outputs {
        let output = output?;
        runs.extend(output.runs);
        load += output.load;
        sort += output.sort;
        store += output.store;
    }
    runs.sort_by_key(Run::origin_offset);

    let stats = RunGenerationStats {
        num_runs: runs.len(),
        bytes: runs.iter().map(Run::size_bytes).sum(),
        time_ms: started.elapsed().as_millis(),
        load_time_ms: load.as_millis() / threads as u128,
        sort_time_ms: sort.as_millis() / threads as u128,
        store_time_ms: store.as_millis() / threads as u128,
    };
    log::info!(
        "generated {} runs in {} ms (load={} ms, sort={} ms, store={} ms per worker)",
        stats.num_runs,
        stats.time_ms,
        stats.load_time_ms,
        stats.sort_time_ms,
        stats.store_time_ms
    );

    Ok((runs, stats))
}

fn process_partition(
    input: &Arc<SharedFd>,
    offset: u64,
    len: usize,
    config: &RunGenConfig,
    temp: &TempFileManager,
    out: &mut WorkerOutput,
) -> Result<(), SortError> {
    // The partition buffer is bounded by what is actually allocatable right
    // now; under pressure the partition is covered by several smaller runs.
    let (mut buf, cap) = alloc_partition_buffer(len, config.record_size)?;

    let mut chunk_off = 0;
    while chunk_off < len {
        let chunk = cap.min(len - chunk_off);
        let abs_offset = offset + chunk_off as u64;

        let load_start = Instant::now();
        let io_len = if input.is_direct() {
            align_up(chunk as u64, DIRECT_IO_ALIGNMENT as u64) as usize
        } else {
            chunk
        };
        let got = pread_full(input, &mut buf.as_mut_slice()[..io_len], abs_offset)
            .map_err(|source| SortError::io(Phase::RunGenerate, source))?;
        if got < chunk {
            return Err(SortError::ShortRead {
                phase: Phase::RunGenerate,
                offset: abs_offset,
                expected: chunk,
                got,
            });
        }
        if got % config.record_size != 0 {
            return Err(SortError::TruncatedRecord {
                record_size: config.record_size,
                got: got % config.record_size,
            });
        }
        out.load += load_start.elapsed();

        let sort_start = Instant::now();
        let data = &buf.as_slice()[..chunk];
        let mut records: Vec<&[u8]> = data.chunks_exact(config.record_size).collect();
        records.sort_unstable();
        out.sort += sort_start.elapsed();

        let store_start = Instant::now();
        let fd = temp.create_temp()?;
        let sink_chunk = RUN_SINK_CHUNK.min(chunk);
        let mut sink = RecordSink::new(Arc::clone(&fd), Phase::RunGenerate, sink_chunk)?;
        for record in records {
            sink.push(record)?;
        }
        let written = sink.finish()?;
        out.store += store_start.elapsed();

        debug_assert_eq!(written, chunk as u64);
        out.runs.push(Run::new(fd, written, abs_offset));
        chunk_off += chunk;
    }

    Ok(())
}

fn alloc_partition_buffer(
    len: usize,
    record_size: usize,
) -> Result<(AlignedBuf, usize), SortError> {
    let mut cap = len;
    loop {
        let alloc_len = align_up(cap as u64, DIRECT_IO_ALIGNMENT as u64) as usize;
        match AlignedBuf::alloc(DIRECT_IO_ALIGNMENT, alloc_len) {
            Ok(buf) => return Ok((buf, cap)),
            Err(_) => {
                let halved = align_down((cap / 2) as u64, record_size as u64) as usize;
                if halved < record_size {
                    return Err(SortError::AllocationFailed { bytes: alloc_len });
                }
                log::warn!(
                    "partition buffer of {} bytes unavailable, retrying with {}",
                    cap,
                    halved
                );
                cap = halved;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diskio::file::pwrite_fd;

    const R: usize = 4;

    fn test_dir() -> std::path::PathBuf {
        let dir = std::env::temp_dir()
            .join("run_generation_test")
            .join(format!("{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_input(name: &str, records: &[[u8; R]]) -> (std::path::PathBuf, Arc<SharedFd>, u64) {
        let path = test_dir().join(format!("{}.bin", name));
        {
            let fd = SharedFd::create_rw(&path, false).unwrap();
            let total = records.len() * R;
            let alloc = align_up(total.max(1) as u64, DIRECT_IO_ALIGNMENT as u64) as usize;
            let mut buf = AlignedBuf::alloc(DIRECT_IO_ALIGNMENT, alloc).unwrap();
            for (i, rec) in records.iter().enumerate() {
                buf.as_mut_slice()[i * R..(i + 1) * R].copy_from_slice(rec);
            }
            pwrite_fd(&fd, buf.as_slice(), 0).unwrap();
            crate::diskio::file::ftruncate_fd(&fd, total as u64).unwrap();
        }

        // Reopen the way the orchestrator would: records this small cannot
        // honor direct-I/O offsets, so the input is buffered.
        let fd = Arc::new(SharedFd::open_rw(&path, false).unwrap());
        let total = (records.len() * R) as u64;
        (path, fd, total)
    }

    fn read_run(run: &Run) -> Vec<u8> {
        std::fs::read(run.fd().path()).unwrap()
    }

    #[test]
    fn test_single_partition_sorted() {
        let (path, fd, size) =
            write_input("single", &[*b"dddd", *b"aaaa", *b"cccc", *b"bbbb"]);
        let temp = TempFileManager::new(&path).unwrap();
        let config = RunGenConfig {
            record_size: R,
            block_size: 4 * R,
            threads: 1,
        };

        let (runs, stats) = generate_runs(&fd, size, &config, &temp).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(stats.num_runs, 1);
        assert_eq!(runs[0].size_bytes(), size);
        assert_eq!(runs[0].origin_offset(), 0);
        assert_eq!(read_run(&runs[0]), b"aaaabbbbccccdddd");
    }

    #[test]
    fn test_partitioning_with_short_tail() {
        // Block of two records over five records: partitions 2+2+1.
        let (path, fd, size) = write_input(
            "tail",
            &[*b"eeee", *b"dddd", *b"cccc", *b"bbbb", *b"aaaa"],
        );
        let temp = TempFileManager::new(&path).unwrap();
        let config = RunGenConfig {
            record_size: R,
            block_size: 2 * R,
            threads: 1,
        };

        let (runs, _) = generate_runs(&fd, size, &config, &temp).unwrap();
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[0].origin_offset(), 0);
        assert_eq!(runs[1].origin_offset(), 2 * R as u64);
        assert_eq!(runs[2].origin_offset(), 4 * R as u64);
        assert_eq!(read_run(&runs[0]), b"ddddeeee");
        assert_eq!(read_run(&runs[1]), b"bbbbcccc");
        assert_eq!(read_run(&runs[2]), b"aaaa");

        let total: u64 = runs.iter().map(Run::size_bytes).sum();
        assert_eq!(total, size);
    }

    #[test]
    fn test_runs_are_monotone_with_threads() {
        let mut records = Vec::new();
        for i in (0..256u32).rev() {
            records.push(i.to_be_bytes());
        }
        let (path, fd, size) = write_input("threads", &records);
        let temp = TempFileManager::new(&path).unwrap();
        let config = RunGenConfig {
            record_size: R,
            block_size: 16 * R,
            threads: 4,
        };

        let (runs, _) = generate_runs(&fd, size, &config, &temp).unwrap();
        assert_eq!(runs.len(), 16);
        for run in &runs {
            let data = read_run(run);
            let recs: Vec<&[u8]> = data.chunks_exact(R).collect();
            assert!(recs.windows(2).all(|w| w[0] <= w[1]));
        }
    }
}
