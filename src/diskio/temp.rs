use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::diskio::file::SharedFd;
use crate::error::{Phase, SortError};

/// Creates temporary run files next to the input file.
///
/// Names follow `<input-filename>.tmp_<n>` with a monotonic counter, so
/// concurrent run-generation workers never collide. Each file is opened
/// read/write with direct I/O and unlinked once its last handle drops.
pub struct TempFileManager {
    dir: PathBuf,
    stem: String,
    counter: AtomicU64,
}

impl TempFileManager {
    pub fn new(input_path: &Path) -> Result<Self, SortError> {
        let dir = input_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let stem = input_path
            .file_name()
            .ok_or_else(|| SortError::InvalidPath {
                path: input_path.to_path_buf(),
            })?
            .to_string_lossy()
            .into_owned();

        Ok(Self {
            dir,
            stem,
            counter: AtomicU64::new(0),
        })
    }

    /// Create the next temp file. Creation truncates any stale file of the
    /// same name left over from a previous crash.
    pub fn create_temp(&self) -> Result<Arc<SharedFd>, SortError> {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let path = self.dir.join(format!("{}.tmp_{}", self.stem, n));
        let fd = SharedFd::create_rw(&path, true)
            .map_err(|source| SortError::io(Phase::RunGenerate, source))?;
        log::debug!("created temp run file {}", path.display());
        Ok(Arc::new(fd))
    }

    pub fn files_created(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }
}
