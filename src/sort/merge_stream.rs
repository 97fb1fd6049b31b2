use std::sync::Arc;

use crate::diskio::buffer::{AlignedBuf, SharedBuf};
use crate::diskio::constants::{align_up, DIRECT_IO_ALIGNMENT};
use crate::diskio::file::{pread_full, SharedFd};
use crate::error::{Phase, SortError};
use crate::sort::run::Run;

/// Buffered read cursor over one run.
///
/// Refills happen at offsets that are multiples of the buffer size, so every
/// direct read is aligned; the final refill is shortened to the run's
/// logical size. A refill that comes back shorter than the registered run
/// size promises is a fatal short read.
struct RunReader {
    fd: Arc<SharedFd>,
    size: u64,
    file_pos: u64,
    buf: AlignedBuf,
    buf_len: usize,
    buf_pos: usize,
}

impl RunReader {
    fn new(fd: Arc<SharedFd>, size: u64, buffer_bytes: usize) -> Result<Self, SortError> {
        let buffer_bytes = align_up(buffer_bytes.max(1) as u64, DIRECT_IO_ALIGNMENT as u64) as usize;
        let buf = AlignedBuf::alloc(DIRECT_IO_ALIGNMENT, buffer_bytes)?;
        Ok(Self {
            fd,
            size,
            file_pos: 0,
            buf,
            buf_len: 0,
            buf_pos: 0,
        })
    }

    /// Copy up to `out.len()` bytes into `out`, stopping at the end of the
    /// run. Returns the byte count delivered.
    fn read_into(&mut self, out: &mut [u8]) -> Result<usize, SortError> {
        let mut done = 0;
        while done < out.len() {
            if self.buf_pos == self.buf_len && !self.refill()? {
                break;
            }
            let avail = &self.buf.as_slice()[self.buf_pos..self.buf_len];
            let n = avail.len().min(out.len() - done);
            out[done..done + n].copy_from_slice(&avail[..n]);
            self.buf_pos += n;
            done += n;
        }
        Ok(done)
    }

    fn refill(&mut self) -> Result<bool, SortError> {
        let remaining = self.size - self.file_pos;
        if remaining == 0 {
            return Ok(false);
        }

        // Direct I/O requires aligned transfer lengths, so the tail refill
        // is issued rounded up and allowed to come back short of the
        // rounded length, never short of the logical run size.
        let want = (self.buf.len() as u64).min(remaining) as usize;
        let io_len = if self.fd.is_direct() {
            align_up(want as u64, DIRECT_IO_ALIGNMENT as u64) as usize
        } else {
            want
        };
        let got = pread_full(&self.fd, &mut self.buf.as_mut_slice()[..io_len], self.file_pos)
            .map_err(|source| SortError::io(Phase::Merge, source))?;
        if got < want {
            return Err(SortError::ShortRead {
                phase: Phase::Merge,
                offset: self.file_pos,
                expected: want,
                got,
            });
        }

        self.file_pos += want as u64;
        self.buf_len = want;
        self.buf_pos = 0;
        Ok(true)
    }
}

/// One-ahead cursor over a sorted run: the head holds the smallest record
/// not yet emitted, in an owned buffer that can be shared with the sink
/// while the stream advances into a fresh one.
pub struct MergeStream {
    reader: RunReader,
    record_size: usize,
    head: Option<SharedBuf>,
}

impl MergeStream {
    /// Attach a cursor to `run` with a read-ahead buffer of `buffer_bytes`
    /// (a multiple of the write-DMA alignment). The stream must be primed
    /// before use.
    pub fn open(run: &Run, record_size: usize, buffer_bytes: usize) -> Result<Self, SortError> {
        let reader = RunReader::new(Arc::clone(run.fd()), run.size_bytes(), buffer_bytes)?;
        Ok(Self {
            reader,
            record_size,
            head: None,
        })
    }

    /// Arm the stream by loading its first record. A run that cannot supply
    /// one full record is malformed.
    pub fn prime(&mut self) -> Result<(), SortError> {
        let mut buf = AlignedBuf::alloc(DIRECT_IO_ALIGNMENT, self.record_size)?;
        let got = self.reader.read_into(buf.as_mut_slice())?;
        if got < self.record_size {
            return Err(SortError::TruncatedRecord {
                record_size: self.record_size,
                got,
            });
        }
        self.head = Some(buf.freeze());
        Ok(())
    }

    /// Load the next record into the head. Returns false once the run is
    /// exhausted; the stream then no longer participates in selection.
    pub fn advance(&mut self) -> Result<bool, SortError> {
        // Reuse the retired head's allocation when the sink has already
        // released its snapshot, otherwise allocate a fresh record buffer.
        let mut buf = match self.head.take().map(SharedBuf::try_unfreeze) {
            Some(Ok(buf)) => buf,
            _ => AlignedBuf::alloc(DIRECT_IO_ALIGNMENT, self.record_size)?,
        };

        let got = self.reader.read_into(buf.as_mut_slice())?;
        if got == 0 {
            return Ok(false);
        }
        if got < self.record_size {
            return Err(SortError::TruncatedRecord {
                record_size: self.record_size,
                got,
            });
        }

        self.head = Some(buf.freeze());
        Ok(true)
    }

    /// The current head record. Panics if the stream is unprimed or empty;
    /// the merger removes empty streams from the active set.
    pub fn head(&self) -> &[u8] {
        self.head.as_ref().expect("stream has no head")
    }

    /// Snapshot the head for the sink while this stream advances.
    pub fn share_head(&self) -> SharedBuf {
        self.head.clone().expect("stream has no head")
    }
}
