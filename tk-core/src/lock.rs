// tk-core/src/lock.rs
// Advisory file lock on the WAL path: shared for readers, exclusive for
// writers and recovery

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::error::{Result, TkError};

/// How often a blocked acquisition retries the non-blocking lock call.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Readers; any number may coexist
    Shared,
    /// Writers and recovery; excludes everything
    Exclusive,
}

/// A held advisory lock. Released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
    mode: LockMode,
}

impl FileLock {
    /// Acquire `mode` on `path`, polling until the timeout elapses.
    /// Returns `DeadlineExceeded` when another holder never yields.
    pub fn acquire(path: &Path, mode: LockMode, timeout: Duration) -> Result<FileLock> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let start = Instant::now();
        loop {
            if try_flock(&file, mode)? {
                return Ok(FileLock {
                    file,
                    path: path.to_path_buf(),
                    mode,
                });
            }
            if start.elapsed() >= timeout {
                return Err(TkError::DeadlineExceeded {
                    waited: start.elapsed(),
                });
            }
            std::thread::sleep(LOCK_POLL_INTERVAL.min(timeout));
        }
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        unlock(&self.file);
    }
}

#[cfg(unix)]
fn try_flock(file: &File, mode: LockMode) -> Result<bool> {
    use std::os::unix::io::AsRawFd;

    let op = match mode {
        LockMode::Shared => libc::LOCK_SH,
        LockMode::Exclusive => libc::LOCK_EX,
    };
    let rc = unsafe { libc::flock(file.as_raw_fd(), op | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        Ok(false)
    } else {
        Err(err.into())
    }
}

#[cfg(unix)]
fn unlock(file: &File) {
    use std::os::unix::io::AsRawFd;
    unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
}

#[cfg(not(unix))]
fn try_flock(_file: &File, _mode: LockMode) -> Result<bool> {
    // Single-process fallback: the OS lock is a no-op off Unix
    Ok(true)
}

#[cfg(not(unix))]
fn unlock(_file: &File) {}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join(".tk").join("wal")
    }

    #[test]
    fn test_exclusive_then_exclusive_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = lock_path(&dir);

        let _held = FileLock::acquire(&path, LockMode::Exclusive, Duration::ZERO).unwrap();
        let err =
            FileLock::acquire(&path, LockMode::Exclusive, Duration::from_millis(30)).unwrap_err();
        assert!(matches!(err, TkError::DeadlineExceeded { .. }), "{}", err);
    }

    #[test]
    fn test_shared_locks_compose() {
        let dir = tempfile::tempdir().unwrap();
        let path = lock_path(&dir);

        let _a = FileLock::acquire(&path, LockMode::Shared, Duration::ZERO).unwrap();
        let _b = FileLock::acquire(&path, LockMode::Shared, Duration::ZERO).unwrap();
    }

    #[test]
    fn test_shared_blocks_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = lock_path(&dir);

        let _shared = FileLock::acquire(&path, LockMode::Shared, Duration::ZERO).unwrap();
        let err =
            FileLock::acquire(&path, LockMode::Exclusive, Duration::from_millis(30)).unwrap_err();
        assert!(matches!(err, TkError::DeadlineExceeded { .. }));
    }

    #[test]
    fn test_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = lock_path(&dir);

        {
            let _held = FileLock::acquire(&path, LockMode::Exclusive, Duration::ZERO).unwrap();
        }
        let _again = FileLock::acquire(&path, LockMode::Exclusive, Duration::ZERO).unwrap();
    }
}
