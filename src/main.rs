use std::path::PathBuf;

use anyhow::{ensure, Result};
use clap::Parser;
use env_logger::Env;
use log::info;

use recsort::{ExternalSorter, SortError, DEFAULT_RECORD_SIZE};

/// Sort a binary file of fixed-width records in place.
#[derive(Parser)]
#[command(version)]
struct Args {
    /// File to sort; rewritten in place
    input: PathBuf,

    /// Record width in bytes
    #[arg(long, default_value_t = DEFAULT_RECORD_SIZE)]
    record_size: usize,

    /// Maximum number of runs merged per cascade step
    #[arg(long, default_value_t = 5)]
    merge_ways: usize,

    /// Smallest acceptable per-stream merge buffer, in MiB
    #[arg(long, default_value_t = 100)]
    min_buffer_mib: usize,

    /// Memory budget in MiB; probed from the allocator when absent
    #[arg(long)]
    memory_mb: Option<usize>,

    /// Run generation worker threads (each holds one partition buffer)
    #[arg(long, default_value_t = 1)]
    threads: usize,
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if let Err(e) = run(&args) {
        match e.downcast_ref::<SortError>() {
            Some(sort_err) => eprintln!("recsort: {} failed: {}", sort_err.phase(), sort_err),
            None => eprintln!("recsort: {e}"),
        }
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<()> {
    ensure!(args.record_size > 0, "record size must be positive");
    ensure!(args.merge_ways >= 2, "merge fan-in must be at least 2");
    ensure!(args.threads > 0, "at least one worker thread");

    let mut sorter = ExternalSorter::new();
    sorter.set_record_size(args.record_size);
    sorter.set_merge_ways(args.merge_ways);
    sorter.set_min_stream_buffer(args.min_buffer_mib * 1024 * 1024);
    sorter.set_run_gen_threads(args.threads);
    if let Some(mb) = args.memory_mb {
        ensure!(mb > 0, "memory budget must be positive");
        sorter.set_memory_budget(mb * 1024 * 1024);
    }

    let report = sorter.sort_file(&args.input)?;
    info!("{report}");
    Ok(())
}
