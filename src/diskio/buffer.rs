use std::alloc::{alloc, alloc_zeroed, dealloc, Layout};
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::diskio::constants::{PROBE_CEILING, PROBE_DECREMENT, PROBE_INCREMENT};
use crate::error::SortError;

/// A heap buffer whose base address satisfies a direct-I/O alignment.
///
/// The buffer has exactly one writer for its whole mutable lifetime. It may
/// be frozen into a [`SharedBuf`], a reference-counted read-only view; the
/// storage is released when the last view drops. A frozen buffer can be
/// reclaimed for writing only while it is the sole owner.
#[derive(Debug)]
pub struct AlignedBuf {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

// The buffer owns its allocation outright; views never alias a writer.
unsafe impl Send for AlignedBuf {}
unsafe impl Sync for AlignedBuf {}

impl AlignedBuf {
    /// Allocate `len` zeroed bytes aligned to `alignment`.
    pub fn alloc(alignment: usize, len: usize) -> Result<Self, SortError> {
        assert!(len > 0, "zero-length aligned buffer");
        let layout = Layout::from_size_align(len, alignment)
            .map_err(|_| SortError::AllocationFailed { bytes: len })?;

        let ptr = unsafe { alloc_zeroed(layout) };
        match NonNull::new(ptr) {
            Some(ptr) => Ok(Self { ptr, len, layout }),
            None => Err(SortError::AllocationFailed { bytes: len }),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Give up write access and turn the buffer into a shareable read-only
    /// view.
    pub fn freeze(self) -> SharedBuf {
        SharedBuf {
            inner: Arc::new(self),
        }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

/// Read-only, reference-counted view over a frozen [`AlignedBuf`].
#[derive(Clone, Debug)]
pub struct SharedBuf {
    inner: Arc<AlignedBuf>,
}

impl SharedBuf {
    /// Reclaim the underlying buffer for writing. Succeeds only when this
    /// is the last view; otherwise the view is handed back untouched.
    pub fn try_unfreeze(self) -> Result<AlignedBuf, SharedBuf> {
        Arc::try_unwrap(self.inner).map_err(|inner| SharedBuf { inner })
    }
}

impl Deref for SharedBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.inner.as_slice()
    }
}

/// Measure the largest single aligned allocation currently obtainable.
///
/// Grows from 512 MiB in 512 MiB steps until an allocation fails, then backs
/// off 64 MiB at a time until one succeeds again. Every attempt is released
/// immediately and the probed memory is never touched, so the pages stay
/// uncommitted. Partitioning must bound run size by what can actually be
/// allocated as one aligned buffer, not by what free-memory counters claim.
pub fn probe_max_buffer(alignment: usize) -> Result<usize, SortError> {
    let mut size = PROBE_INCREMENT;
    loop {
        if !try_raw_alloc(alignment, size) {
            break;
        }
        if size >= PROBE_CEILING {
            return Ok(size);
        }
        size += PROBE_INCREMENT;
    }

    while size > PROBE_DECREMENT {
        size -= PROBE_DECREMENT;
        if try_raw_alloc(alignment, size) {
            return Ok(size);
        }
    }

    Err(SortError::ProbeExhausted)
}

fn try_raw_alloc(alignment: usize, size: usize) -> bool {
    let Ok(layout) = Layout::from_size_align(size, alignment) else {
        return false;
    };
    let ptr = unsafe { alloc(layout) };
    if ptr.is_null() {
        return false;
    }
    unsafe { dealloc(ptr, layout) };
    true
}
