//! Error types for the external sort.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// The phase a fatal error surfaced in; printed in the final diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Probe,
    RunGenerate,
    Merge,
    Flush,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Probe => write!(f, "probe"),
            Phase::RunGenerate => write!(f, "run-generate"),
            Phase::Merge => write!(f, "merge"),
            Phase::Flush => write!(f, "flush"),
        }
    }
}

/// Error type for sort operations. Everything except the resource class is
/// fatal; resource pressure is absorbed by the allocation probe and the
/// run-generation halving fallback before it becomes one of these.
#[derive(Debug, Error)]
pub enum SortError {
    /// Input length violates the fixed-record layout.
    #[error("input length {len} is not a multiple of record size {record_size}")]
    UnalignedInput {
        /// Input file length in bytes
        len: u64,
        /// Configured record width
        record_size: usize,
    },

    /// The input path has no usable file name.
    #[error("invalid input path: {path:?}")]
    InvalidPath { path: PathBuf },

    /// The probe could not obtain even its minimum aligned buffer.
    #[error("probe: no aligned buffer obtainable, cannot bound run size")]
    ProbeExhausted,

    /// An aligned allocation failed outside the probe.
    #[error("aligned allocation of {bytes} bytes failed")]
    AllocationFailed { bytes: usize },

    /// The memory budget cannot hold a single record per worker.
    #[error("memory budget {budget} bytes too small for record size {record_size}")]
    InsufficientMemory { budget: usize, record_size: usize },

    /// An I/O operation failed.
    #[error("{source}")]
    Io {
        phase: Phase,
        #[source]
        source: io::Error,
    },

    /// A read returned fewer bytes than the layout guarantees exist.
    #[error("short read at offset {offset}: got {got} bytes, expected {expected}")]
    ShortRead {
        phase: Phase,
        offset: u64,
        expected: usize,
        got: usize,
    },

    /// A write transferred fewer bytes than submitted. Silent short writes
    /// corrupt the output, so this is fatal.
    #[error("short write at offset {offset}: wrote {got} bytes, expected {expected}")]
    ShortWrite {
        phase: Phase,
        offset: u64,
        expected: usize,
        got: usize,
    },

    /// A run ended in the middle of a record.
    #[error("run truncated mid-record: {got} trailing bytes with record size {record_size}")]
    TruncatedRecord { record_size: usize, got: usize },

    /// A merge emitted a different byte count than its inputs held.
    #[error("merge emitted {emitted} bytes but inputs held {expected}")]
    MergeConservation { expected: u64, emitted: u64 },
}

impl SortError {
    pub fn io(phase: Phase, source: io::Error) -> Self {
        SortError::Io { phase, source }
    }

    /// The phase this error belongs to, for diagnostics.
    pub fn phase(&self) -> Phase {
        match self {
            SortError::ProbeExhausted => Phase::Probe,
            SortError::Io { phase, .. }
            | SortError::ShortRead { phase, .. }
            | SortError::ShortWrite { phase, .. } => *phase,
            SortError::UnalignedInput { .. }
            | SortError::InvalidPath { .. }
            | SortError::InsufficientMemory { .. }
            | SortError::AllocationFailed { .. } => Phase::RunGenerate,
            SortError::TruncatedRecord { .. } | SortError::MergeConservation { .. } => Phase::Merge,
        }
    }
}
