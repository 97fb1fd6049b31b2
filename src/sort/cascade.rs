use std::sync::Arc;
use std::time::Instant;

use crate::diskio::constants::{align_down, align_up, MIB, WRITE_DMA_ALIGNMENT};
use crate::diskio::file::SharedFd;
use crate::diskio::temp::TempFileManager;
use crate::error::{Phase, SortError};
use crate::sort::merge::merge;
use crate::sort::merge_stream::MergeStream;
use crate::sort::run::Run;
use crate::sort::run_sink::RecordSink;
use crate::MergeStats;

pub const DEFAULT_MERGE_WAYS: usize = 5;
pub const DEFAULT_MIN_STREAM_BUFFER: usize = 100 * MIB;

/// Input-buffer-equivalents reserved for the output sink when dividing the
/// memory budget across a merge's streams.
const SINK_RESERVE: usize = 2;

/// Policy knobs for the merge phase.
pub struct MergePolicy {
    /// Maximum fan-in `K` per merge step.
    pub merge_ways: usize,
    /// Floor on the per-stream read buffer; a fan-in whose buffers would
    /// fall below this is reduced by cascading first.
    pub min_stream_buffer: usize,
    /// Total memory budget `M` shared by stream buffers and the sink.
    pub memory_budget: usize,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self {
            merge_ways: DEFAULT_MERGE_WAYS,
            min_stream_buffer: DEFAULT_MIN_STREAM_BUFFER,
            memory_budget: DEFAULT_MIN_STREAM_BUFFER * (DEFAULT_MERGE_WAYS + SINK_RESERVE),
        }
    }
}

/// Per-stream read buffer for a merge of `num_streams` runs under `budget`
/// bytes: the budget split across the streams plus the sink reservation,
/// rounded down to the write-DMA alignment. The sink gets two buffers of
/// this size, so stream buffers plus sink never exceed the budget.
pub fn per_stream_buffer(budget: usize, num_streams: usize) -> usize {
    align_down(
        (budget / (num_streams + SINK_RESERVE)) as u64,
        WRITE_DMA_ALIGNMENT as u64,
    ) as usize
}

/// Phase B: repeatedly merge the smallest runs into new temp runs until the
/// remaining fan-in fits the policy, then merge everything into the input
/// file.
///
/// Picking the smallest runs first keeps the large runs out of intermediate
/// passes, so most bytes are read back exactly once. Consumed runs are
/// closed (and their files unlinked) as soon as their merge returns. The
/// final merge may reuse the input file as its sink because every surviving
/// byte lives in a temp run by then.
pub fn cascade_merge(
    mut runs: Vec<Run>,
    record_size: usize,
    policy: &MergePolicy,
    temp: &TempFileManager,
    input: &Arc<SharedFd>,
    input_size: u64,
) -> Result<Vec<MergeStats>, SortError> {
    assert!(policy.merge_ways >= 2, "cascade needs a fan-in of at least 2");

    let mut stats = Vec::new();
    if runs.is_empty() {
        return Ok(stats);
    }

    while runs.len() > 1
        && (runs.len() > policy.merge_ways
            || per_stream_buffer(policy.memory_budget, runs.len()) < policy.min_stream_buffer)
    {
        runs.sort_by_key(Run::size_bytes);
        // Past the fan-in cap, fold K runs. When only the buffer floor
        // forced this pass, leave a run out (two minimum) so the loop can
        // stop at the smallest fan-in whose buffers meet the floor instead
        // of collapsing everything into one run.
        let k = if runs.len() > policy.merge_ways {
            policy.merge_ways
        } else {
            (runs.len() - 1).min(policy.merge_ways).max(2)
        };
        let picks: Vec<Run> = runs.drain(..k).collect();
        let expected: u64 = picks.iter().map(Run::size_bytes).sum();

        let started = Instant::now();
        let out_fd = temp.create_temp()?;
        let written = merge_into(&picks, record_size, policy, Arc::clone(&out_fd))?;
        if written != expected {
            return Err(SortError::MergeConservation {
                expected,
                emitted: written,
            });
        }
        drop(picks);

        runs.push(Run::merged(out_fd, written));
        let step = MergeStats {
            fan_in: k,
            bytes: written,
            time_ms: started.elapsed().as_millis(),
        };
        log::info!(
            "cascade step: merged {} runs into {} bytes in {} ms, {} runs remain",
            step.fan_in,
            step.bytes,
            step.time_ms,
            runs.len()
        );
        stats.push(step);
    }

    // Every remaining byte is owned by a temp run, so the input file can
    // serve as the final sink.
    let fan_in = runs.len();
    let started = Instant::now();
    let written = merge_into(&runs, record_size, policy, Arc::clone(input))?;
    if written != input_size {
        return Err(SortError::MergeConservation {
            expected: input_size,
            emitted: written,
        });
    }
    drop(runs);

    let step = MergeStats {
        fan_in,
        bytes: written,
        time_ms: started.elapsed().as_millis(),
    };
    log::info!(
        "final merge: {} runs, {} bytes in {} ms",
        step.fan_in,
        step.bytes,
        step.time_ms
    );
    stats.push(step);

    Ok(stats)
}

fn merge_into(
    picks: &[Run],
    record_size: usize,
    policy: &MergePolicy,
    out_fd: Arc<SharedFd>,
) -> Result<u64, SortError> {
    // A fan-in of one cannot be reduced further, so the buffer floor is
    // relaxed to a single alignment unit there (a plain copy). The probe's
    // budget is a soft bound; buffers never exceed what a run can feed
    // through them.
    let per_stream =
        per_stream_buffer(policy.memory_budget, picks.len()).max(WRITE_DMA_ALIGNMENT);
    let total: u64 = picks.iter().map(Run::size_bytes).sum();
    let sink_chunk = per_stream.min(align_up(total.max(1), WRITE_DMA_ALIGNMENT as u64) as usize);

    let streams = picks
        .iter()
        .map(|run| {
            let cap = align_up(run.size_bytes().max(1), WRITE_DMA_ALIGNMENT as u64) as usize;
            MergeStream::open(run, record_size, per_stream.min(cap))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let sink = RecordSink::new(out_fd, Phase::Merge, sink_chunk)?;
    merge(streams, sink)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diskio::buffer::AlignedBuf;
    use crate::diskio::constants::DIRECT_IO_ALIGNMENT;
    use crate::diskio::file::{ftruncate_fd, pwrite_fd};

    const R: usize = 4;

    fn test_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir()
            .join("cascade_test")
            .join(format!("{}_{}", std::process::id(), name));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_file(path: &std::path::Path, data: &[u8]) -> Arc<SharedFd> {
        let fd = Arc::new(SharedFd::create_rw(path, false).unwrap());
        let alloc = crate::diskio::constants::align_up(
            data.len().max(1) as u64,
            DIRECT_IO_ALIGNMENT as u64,
        ) as usize;
        let mut buf = AlignedBuf::alloc(DIRECT_IO_ALIGNMENT, alloc).unwrap();
        buf.as_mut_slice()[..data.len()].copy_from_slice(data);
        pwrite_fd(&fd, buf.as_slice(), 0).unwrap();
        ftruncate_fd(&fd, data.len() as u64).unwrap();
        fd
    }

    fn make_run(dir: &std::path::Path, name: &str, records: &[[u8; R]]) -> Run {
        let mut data = Vec::new();
        for rec in records {
            data.extend_from_slice(rec);
        }
        let fd = write_file(&dir.join(name), &data);
        Run::new(fd, data.len() as u64, 0)
    }

    fn policy(budget: usize, ways: usize, min_buffer: usize) -> MergePolicy {
        MergePolicy {
            merge_ways: ways,
            min_stream_buffer: min_buffer,
            memory_budget: budget,
        }
    }

    #[test]
    fn test_per_stream_buffer_division() {
        // 28 MiB over 5 streams + 2 sink equivalents = 4 MiB each.
        assert_eq!(per_stream_buffer(28 * MIB, 5), 4 * MIB);
        // Rounded down to the write alignment.
        assert_eq!(per_stream_buffer(10_000, 1), 0);
        assert_eq!(per_stream_buffer(3 * 4096, 1), 4096);
    }

    #[test]
    fn test_final_merge_only_when_fanin_fits() {
        let dir = test_dir("fits");
        let a = make_run(&dir, "a.tmp", &[*b"aaaa", *b"cccc"]);
        let b = make_run(&dir, "b.tmp", &[*b"bbbb", *b"dddd"]);

        let input_path = dir.join("input.bin");
        let input = write_file(&input_path, &[0u8; 16]);
        let temp = TempFileManager::new(&input_path).unwrap();

        let stats = cascade_merge(
            vec![a, b],
            R,
            &policy(MIB, 5, 4096),
            &temp,
            &input,
            16,
        )
        .unwrap();

        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].fan_in, 2);
        assert_eq!(stats[0].bytes, 16);
        assert_eq!(std::fs::read(&input_path).unwrap(), b"aaaabbbbccccdddd");
        assert_eq!(temp.files_created(), 0);
    }

    #[test]
    fn test_cascade_reduces_fanin_before_final() {
        // Four runs with K = 2: two intermediate merges bring the fan-in
        // down, then the final merge rewrites the input.
        let dir = test_dir("cascade");
        let runs = vec![
            make_run(&dir, "r0.tmp", &[*b"0005", *b"0007"]),
            make_run(&dir, "r1.tmp", &[*b"0001", *b"0003"]),
            make_run(&dir, "r2.tmp", &[*b"0002", *b"0008"]),
            make_run(&dir, "r3.tmp", &[*b"0004", *b"0006"]),
        ];

        let input_path = dir.join("input.bin");
        let input = write_file(&input_path, &[0u8; 32]);
        let temp = TempFileManager::new(&input_path).unwrap();

        let stats =
            cascade_merge(runs, R, &policy(MIB, 2, 4096), &temp, &input, 32).unwrap();

        // Fan-in strictly decreases: 4 -> 3 -> 2 -> final.
        let fan_ins: Vec<usize> = stats.iter().map(|s| s.fan_in).collect();
        assert_eq!(fan_ins, vec![2, 2, 2]);
        assert_eq!(stats.last().unwrap().bytes, 32);
        assert_eq!(
            std::fs::read(&input_path).unwrap(),
            b"00010002000300040005000600070008"
        );
        assert_eq!(temp.files_created(), 2);
    }

    #[test]
    fn test_buffer_floor_triggers_cascade() {
        // Fan-in 3 fits merge_ways, but the budget cannot give 3 streams
        // their floor, so one pair is folded first.
        let dir = test_dir("floor");
        let runs = vec![
            make_run(&dir, "r0.tmp", &[*b"aaaa"]),
            make_run(&dir, "r1.tmp", &[*b"bbbb"]),
            make_run(&dir, "r2.tmp", &[*b"cccc"]),
        ];

        let input_path = dir.join("input.bin");
        let input = write_file(&input_path, &[0u8; 12]);
        let temp = TempFileManager::new(&input_path).unwrap();

        // budget / (3 + 2) < 2 * 4096 <= budget / (2 + 2)
        let budget = 9 * 4096;
        let stats = cascade_merge(
            runs,
            R,
            &policy(budget, 5, 2 * 4096),
            &temp,
            &input,
            12,
        )
        .unwrap();

        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].fan_in, 2);
        assert_eq!(stats[1].fan_in, 2);
        assert_eq!(std::fs::read(&input_path).unwrap(), b"aaaabbbbcccc");
    }

    #[test]
    fn test_single_run_copies_to_input() {
        let dir = test_dir("single");
        let run = make_run(&dir, "r0.tmp", &[*b"aaaa", *b"bbbb"]);
        let run_path = run.fd().path().to_path_buf();

        let input_path = dir.join("input.bin");
        let input = write_file(&input_path, &[0u8; 8]);
        let temp = TempFileManager::new(&input_path).unwrap();

        let stats =
            cascade_merge(vec![run], R, &policy(MIB, 5, 4096), &temp, &input, 8).unwrap();

        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].fan_in, 1);
        assert_eq!(std::fs::read(&input_path).unwrap(), b"aaaabbbb");
        assert!(run_path.exists(), "test-made runs are not delete-on-drop");
    }

    #[test]
    fn test_conservation_mismatch_is_fatal() {
        // Register a run as larger than its file: the merge comes up short
        // against a truncated record, or short bytes, either way fatal.
        let dir = test_dir("conservation");
        let fd = write_file(&dir.join("bad.tmp"), b"aaaabbbb");
        let bad = Run::new(fd, 12, 0);

        let input_path = dir.join("input.bin");
        let input = write_file(&input_path, &[0u8; 12]);
        let temp = TempFileManager::new(&input_path).unwrap();

        let result =
            cascade_merge(vec![bad], R, &policy(MIB, 5, 4096), &temp, &input, 12);
        assert!(result.is_err());
    }
}
