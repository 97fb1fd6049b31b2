use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::diskio::buffer::AlignedBuf;
use crate::diskio::constants::{align_up, WRITE_DMA_ALIGNMENT};
use crate::diskio::file::{fsync_fd, ftruncate_fd, pwrite_fd, SharedFd};
use crate::error::{Phase, SortError};

/// How many staging buffers cycle between the caller and the background
/// writer; also the bound on in-flight writes.
pub const WRITE_BEHIND: usize = 2;

struct WriteJob {
    buf: AlignedBuf,
    offset: u64,
    len: usize,
}

/// Buffered output sink for sorted records.
///
/// Records are copied into an aligned staging buffer; full buffers are
/// handed to a background writer thread over a bounded channel, so the
/// `pwrite` of one chunk overlaps the production of the next. Writes land
/// in submission order (single writer, FIFO channel). `finish` drains all
/// pending writes, pads and writes the tail, truncates the file to the
/// logical length and fsyncs; a merge that returns has nothing in flight.
pub struct RecordSink {
    fd: Arc<SharedFd>,
    phase: Phase,
    jobs: Sender<WriteJob>,
    free: Receiver<AlignedBuf>,
    cur: Option<AlignedBuf>,
    fill: usize,
    chunk_bytes: usize,
    file_offset: u64,
    logical: u64,
    worker: Option<JoinHandle<Result<(), SortError>>>,
}

impl RecordSink {
    /// Create a sink over `fd` with `WRITE_BEHIND` staging buffers of
    /// `chunk_bytes` each (rounded up to the write-DMA alignment).
    pub fn new(fd: Arc<SharedFd>, phase: Phase, chunk_bytes: usize) -> Result<Self, SortError> {
        let chunk_bytes =
            align_up(chunk_bytes.max(1) as u64, WRITE_DMA_ALIGNMENT as u64) as usize;

        let (job_tx, job_rx) = bounded::<WriteJob>(WRITE_BEHIND);
        let (free_tx, free_rx) = bounded::<AlignedBuf>(WRITE_BEHIND);
        for _ in 0..WRITE_BEHIND {
            free_tx
                .send(AlignedBuf::alloc(WRITE_DMA_ALIGNMENT, chunk_bytes)?)
                .expect("free channel has capacity");
        }

        let worker_fd = Arc::clone(&fd);
        let worker = thread::spawn(move || write_loop(worker_fd, phase, job_rx, free_tx));

        let cur = free_rx.recv().expect("one staging buffer is free");
        Ok(Self {
            fd,
            phase,
            jobs: job_tx,
            free: free_rx,
            cur: Some(cur),
            fill: 0,
            chunk_bytes,
            file_offset: 0,
            logical: 0,
            worker: Some(worker),
        })
    }

    /// Append one record. The copy is synchronous; the eventual write is
    /// not.
    pub fn push(&mut self, record: &[u8]) -> Result<(), SortError> {
        let mut rest = record;
        while !rest.is_empty() {
            let cur = self.cur.as_mut().expect("sink has a staging buffer");
            let space = self.chunk_bytes - self.fill;
            let n = space.min(rest.len());
            cur.as_mut_slice()[self.fill..self.fill + n].copy_from_slice(&rest[..n]);
            self.fill += n;
            rest = &rest[n..];

            if self.fill == self.chunk_bytes {
                self.submit(self.chunk_bytes)?;
            }
        }
        self.logical += record.len() as u64;
        Ok(())
    }

    /// Total record bytes accepted so far.
    pub fn bytes_written(&self) -> u64 {
        self.logical
    }

    /// Drain pending writes, write the padded tail, restore the logical
    /// file length and fsync. Returns the logical byte count.
    pub fn finish(mut self) -> Result<u64, SortError> {
        if self.fill > 0 {
            // Staging buffers are recycled, so the pad bytes must be
            // cleared explicitly; the file is truncated back to the
            // logical length below.
            let padded = align_up(self.fill as u64, WRITE_DMA_ALIGNMENT as u64) as usize;
            let cur = self.cur.as_mut().expect("sink has a staging buffer");
            cur.as_mut_slice()[self.fill..padded].fill(0);
            self.submit(padded)?;
        }

        // Close the job channel so the writer drains and exits.
        let jobs = std::mem::replace(&mut self.jobs, bounded(0).0);
        drop(jobs);

        if let Some(worker) = self.worker.take() {
            worker.join().map_err(|_| {
                SortError::io(self.phase, std::io::Error::other("writer thread panicked"))
            })??;
        }

        ftruncate_fd(&self.fd, self.logical)
            .map_err(|source| SortError::io(Phase::Flush, source))?;
        fsync_fd(&self.fd).map_err(|source| SortError::io(Phase::Flush, source))?;

        Ok(self.logical)
    }

    fn submit(&mut self, len: usize) -> Result<(), SortError> {
        let buf = self.cur.take().expect("sink has a staging buffer");
        let job = WriteJob {
            buf,
            offset: self.file_offset,
            len,
        };
        if self.jobs.send(job).is_err() {
            // The writer died; joining surfaces its error.
            return Err(self.collect_worker_error());
        }
        self.file_offset += len as u64;

        match self.free.recv() {
            Ok(buf) => {
                self.cur = Some(buf);
                self.fill = 0;
                Ok(())
            }
            Err(_) => Err(self.collect_worker_error()),
        }
    }

    fn collect_worker_error(&mut self) -> SortError {
        match self.worker.take().map(JoinHandle::join) {
            Some(Ok(Err(e))) => e,
            _ => SortError::io(
                self.phase,
                std::io::Error::other("background writer failed"),
            ),
        }
    }
}

impl Drop for RecordSink {
    fn drop(&mut self) {
        // Abandoned sink (error path): close the channel and let the writer
        // wind down before the fd can be recycled.
        let jobs = std::mem::replace(&mut self.jobs, bounded(0).0);
        drop(jobs);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn write_loop(
    fd: Arc<SharedFd>,
    phase: Phase,
    jobs: Receiver<WriteJob>,
    free: Sender<AlignedBuf>,
) -> Result<(), SortError> {
    for job in jobs.iter() {
        let data = &job.buf.as_slice()[..job.len];
        let written =
            pwrite_fd(&fd, data, job.offset).map_err(|source| SortError::io(phase, source))?;
        if written != job.len {
            return Err(SortError::ShortWrite {
                phase,
                offset: job.offset,
                expected: job.len,
                got: written,
            });
        }
        // The producer may already be gone during teardown.
        let _ = free.send(job.buf);
    }
    Ok(())
}
