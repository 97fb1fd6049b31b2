use std::sync::Arc;

use crate::diskio::file::SharedFd;

/// A temporary file holding an internally sorted sequence of records,
/// starting at file offset 0.
///
/// `origin_offset` records where in the input the producing partition began;
/// it is diagnostic only, and runs produced by merges carry 0. Dropping the
/// last handle to the underlying fd closes and unlinks the file.
pub struct Run {
    fd: Arc<SharedFd>,
    size_bytes: u64,
    origin_offset: u64,
}

impl Run {
    pub fn new(fd: Arc<SharedFd>, size_bytes: u64, origin_offset: u64) -> Self {
        Self {
            fd,
            size_bytes,
            origin_offset,
        }
    }

    /// A run written by a cascade merge step.
    pub fn merged(fd: Arc<SharedFd>, size_bytes: u64) -> Self {
        Self::new(fd, size_bytes, 0)
    }

    pub fn fd(&self) -> &Arc<SharedFd> {
        &self.fd
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn origin_offset(&self) -> u64 {
        self.origin_offset
    }
}
