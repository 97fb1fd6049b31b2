use libc::{c_void, fstat, off_t, pread, pwrite};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::{io, os::fd::IntoRawFd};

use crate::diskio::constants::{
    create_file_with_direct_io, open_file_with_direct_io, DIRECT_IO_ALIGNMENT,
};

/// An owned file descriptor opened for direct I/O, shareable across the
/// readers and writers of one sort. The file is unlinked when the last
/// holder drops it, if requested at open time.
pub struct SharedFd {
    fd: RawFd,
    path: PathBuf,
    direct: bool,
    delete_on_drop: bool,
}

impl SharedFd {
    /// Open an existing file read/write. The file survives drop. Passing
    /// `direct = false` skips O_DIRECT entirely; callers do this when their
    /// access pattern cannot honor the DMA alignments (record sizes below
    /// one alignment unit put partition offsets off-boundary).
    pub fn open_rw(path: impl AsRef<Path>, direct: bool) -> io::Result<Self> {
        let (file, direct) = if direct {
            open_file_with_direct_io(path.as_ref())?
        } else {
            (
                std::fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(path.as_ref())?,
                false,
            )
        };
        Ok(Self {
            fd: file.into_raw_fd(),
            path: path.as_ref().to_path_buf(),
            direct,
            delete_on_drop: false,
        })
    }

    /// Create a file read/write, truncating any previous content. When
    /// `delete_on_drop` is set the file is unlinked once the last handle
    /// goes away.
    pub fn create_rw(path: impl AsRef<Path>, delete_on_drop: bool) -> io::Result<Self> {
        let (file, direct) = create_file_with_direct_io(path.as_ref())?;
        Ok(Self {
            fd: file.into_raw_fd(),
            path: path.as_ref().to_path_buf(),
            direct,
            delete_on_drop,
        })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether O_DIRECT is in effect; alignment checks apply only then.
    pub fn is_direct(&self) -> bool {
        self.direct
    }
}

impl Drop for SharedFd {
    fn drop(&mut self) {
        if self.delete_on_drop {
            unsafe {
                // Truncate before close so the blocks are freed immediately
                // even if another process still holds the path open.
                libc::ftruncate(self.fd, 0);
            }
            let _ = std::fs::remove_file(&self.path);
        }

        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Get the size of a file using its raw file descriptor.
pub fn file_size_fd(fd: RawFd) -> io::Result<u64> {
    let mut stat_buf: libc::stat = unsafe { std::mem::zeroed() };

    let result = unsafe { fstat(fd, &mut stat_buf) };

    if result < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(stat_buf.st_size as u64)
    }
}

/// Perform pread without changing the file position. Thread-safe, no
/// synchronization required.
pub fn pread_fd(fd: &SharedFd, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    if fd.is_direct() {
        check_alignment(buf.as_ptr() as usize, buf.len(), offset)?;
    }

    let result = unsafe {
        pread(
            fd.as_raw_fd(),
            buf.as_mut_ptr() as *mut c_void,
            buf.len(),
            offset as off_t,
        )
    };

    if result < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(result as usize)
    }
}

/// Perform pwrite without changing the file position.
pub fn pwrite_fd(fd: &SharedFd, buf: &[u8], offset: u64) -> io::Result<usize> {
    if fd.is_direct() {
        check_alignment(buf.as_ptr() as usize, buf.len(), offset)?;
    }

    let result = unsafe {
        pwrite(
            fd.as_raw_fd(),
            buf.as_ptr() as *const c_void,
            buf.len(),
            offset as off_t,
        )
    };

    if result < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(result as usize)
    }
}

/// Read up to `buf.len()` bytes at `offset`. A short chunk from a regular
/// file means end-of-file, so the returned count is short only there.
pub fn pread_full(fd: &SharedFd, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        let want = buf.len() - done;
        let n = pread_fd(fd, &mut buf[done..], offset + done as u64)?;
        done += n;
        if n == 0 || n < want {
            break;
        }
    }
    Ok(done)
}

pub fn fsync_fd(fd: &SharedFd) -> io::Result<()> {
    let result = unsafe { libc::fsync(fd.as_raw_fd()) };
    if result < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

pub fn ftruncate_fd(fd: &SharedFd, len: u64) -> io::Result<()> {
    let result = unsafe { libc::ftruncate(fd.as_raw_fd(), len as off_t) };
    if result < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn check_alignment(addr: usize, len: usize, offset: u64) -> io::Result<()> {
    if addr % DIRECT_IO_ALIGNMENT != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "buffer is not aligned for direct I/O",
        ));
    }
    if len % DIRECT_IO_ALIGNMENT != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "transfer length is not aligned for direct I/O",
        ));
    }
    if offset % DIRECT_IO_ALIGNMENT as u64 != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "file offset is not aligned for direct I/O",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diskio::buffer::AlignedBuf;

    #[test]
    fn test_file_deleted_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scratch.dat");

        {
            let _fd = SharedFd::create_rw(&path, true).unwrap();
            assert!(path.exists());
        }

        assert!(!path.exists(), "file should be unlinked after drop");
    }

    #[test]
    fn test_file_kept_without_delete_flag() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kept.dat");

        {
            let _fd = SharedFd::create_rw(&path, false).unwrap();
        }

        assert!(path.exists());
    }

    #[test]
    fn test_pwrite_pread_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rw.dat");
        let fd = SharedFd::create_rw(&path, true).unwrap();

        let mut buf = AlignedBuf::alloc(DIRECT_IO_ALIGNMENT, DIRECT_IO_ALIGNMENT).unwrap();
        buf.as_mut_slice().fill(0xAB);
        let written = pwrite_fd(&fd, buf.as_slice(), 0).unwrap();
        assert_eq!(written, DIRECT_IO_ALIGNMENT);

        let mut back = AlignedBuf::alloc(DIRECT_IO_ALIGNMENT, DIRECT_IO_ALIGNMENT).unwrap();
        let read = pread_full(&fd, back.as_mut_slice(), 0).unwrap();
        assert_eq!(read, DIRECT_IO_ALIGNMENT);
        assert_eq!(back.as_slice(), buf.as_slice());
    }

    #[test]
    fn test_pread_full_stops_at_eof() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.dat");
        let fd = SharedFd::create_rw(&path, true).unwrap();

        let mut buf = AlignedBuf::alloc(DIRECT_IO_ALIGNMENT, DIRECT_IO_ALIGNMENT).unwrap();
        buf.as_mut_slice().fill(7);
        pwrite_fd(&fd, buf.as_slice(), 0).unwrap();

        let mut back = AlignedBuf::alloc(DIRECT_IO_ALIGNMENT, 2 * DIRECT_IO_ALIGNMENT).unwrap();
        let read = pread_full(&fd, back.as_mut_slice(), 0).unwrap();
        assert_eq!(read, DIRECT_IO_ALIGNMENT);
    }

    #[test]
    fn test_ftruncate_shrinks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trunc.dat");
        let fd = SharedFd::create_rw(&path, true).unwrap();

        let mut buf = AlignedBuf::alloc(DIRECT_IO_ALIGNMENT, DIRECT_IO_ALIGNMENT).unwrap();
        buf.as_mut_slice().fill(1);
        pwrite_fd(&fd, buf.as_slice(), 0).unwrap();

        ftruncate_fd(&fd, 100).unwrap();
        assert_eq!(file_size_fd(fd.as_raw_fd()).unwrap(), 100);
    }
}
