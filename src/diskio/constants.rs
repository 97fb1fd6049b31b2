use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

/// Alignment required for direct I/O: buffer addresses, file offsets and
/// transfer lengths must all be multiples of this.
pub const DIRECT_IO_ALIGNMENT: usize = 4096;

/// Write-DMA alignment reported for the backing device. Stream read buffers
/// and sink staging buffers are sized in multiples of this.
pub const WRITE_DMA_ALIGNMENT: usize = DIRECT_IO_ALIGNMENT;

pub const KIB: usize = 1024;
pub const MIB: usize = 1024 * 1024;

/// Allocation probe parameters: grow in 512 MiB steps, back off in 64 MiB
/// steps after the first failure.
pub const PROBE_INCREMENT: usize = 512 * MIB;
pub const PROBE_DECREMENT: usize = 64 * MIB;

/// Hard ceiling for the probe. Overcommitting allocators never refuse an
/// untouched mapping, so the growth loop needs a stop.
pub const PROBE_CEILING: usize = 1 << 40;

pub fn align_down(value: u64, alignment: u64) -> u64 {
    value - (value % alignment)
}

pub fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

/// Open an existing file read/write with O_DIRECT.
///
/// Filesystems without direct I/O support (tmpfs, some network mounts)
/// reject the flag with EINVAL; those fall back to buffered I/O. The
/// returned bool is true when O_DIRECT is in effect.
pub fn open_file_with_direct_io(path: &Path) -> io::Result<(File, bool)> {
    open_rw(path, false)
}

/// Create (truncating) a file read/write with O_DIRECT, with the same
/// buffered fallback as [`open_file_with_direct_io`].
pub fn create_file_with_direct_io(path: &Path) -> io::Result<(File, bool)> {
    open_rw(path, true)
}

fn open_rw(path: &Path, create: bool) -> io::Result<(File, bool)> {
    let mut opts = OpenOptions::new();
    opts.read(true).write(true);
    if create {
        opts.create(true).truncate(true);
    }

    match opts.clone().custom_flags(libc::O_DIRECT).open(path) {
        Ok(file) => Ok((file, true)),
        Err(e) if e.raw_os_error() == Some(libc::EINVAL) => opts.open(path).map(|f| (f, false)),
        Err(e) => Err(e),
    }
}
