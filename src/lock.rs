//! Process Lock
//!
//! An advisory lock over the data and index roots of a store, taken before
//! anything else touches them. A second instance pointed at the same location
//! gets [`SifsError::LockConflict`] instead of corrupting files.
//!
//! On unix the lock is `flock(2)`, so the OS releases it when the process
//! dies; elsewhere an exclusively created marker file stands in for it.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use crate::error::{Result, SifsError};

/// Name of the lock file inside each locked root
pub const LOCK_FILE_NAME: &str = "sifs.lock";

const RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Held lock on one or more store roots
#[derive(Debug)]
pub struct StoreLock {
    files: Vec<LockFile>,
}

impl StoreLock {
    /// Lock every distinct root, retrying until `timeout` elapses
    pub fn acquire(roots: &[PathBuf], timeout: Duration) -> Result<Self> {
        let mut unique: Vec<&PathBuf> = Vec::new();
        for root in roots {
            if !unique.contains(&root) {
                unique.push(root);
            }
        }

        let mut files = Vec::with_capacity(unique.len());
        for root in unique {
            std::fs::create_dir_all(root)?;
            files.push(LockFile::acquire(&root.join(LOCK_FILE_NAME), timeout)?);
        }
        tracing::debug!(count = files.len(), "Acquired store lock");
        Ok(Self { files })
    }

    /// Paths of the lock files held
    pub fn paths(&self) -> Vec<&Path> {
        self.files.iter().map(|f| f.path.as_path()).collect()
    }

    /// Release the lock now instead of on drop
    pub fn release(self) {
        drop(self);
    }
}

#[derive(Debug)]
struct LockFile {
    file: File,
    path: PathBuf,
}

impl LockFile {
    fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        let deadline = Instant::now() + timeout;
        loop {
            match Self::try_lock(path) {
                Ok(file) => {
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                    })
                }
                Err(e) if Self::is_contended(&e) => {
                    if Instant::now() >= deadline {
                        return Err(SifsError::LockConflict {
                            path: path.to_path_buf(),
                        });
                    }
                    thread::sleep(RETRY_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Platform-specific lock acquisition
    #[cfg(unix)]
    fn try_lock(path: &Path) -> io::Result<File> {
        use libc::{flock, LOCK_EX, LOCK_NB};

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;

        let result = unsafe { flock(file.as_raw_fd(), LOCK_EX | LOCK_NB) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }

        // Process ID for debugging, written only once the lock is ours
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;
        Ok(file)
    }

    #[cfg(not(unix))]
    fn try_lock(path: &Path) -> io::Result<File> {
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(path)?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;
        Ok(file)
    }

    #[cfg(unix)]
    fn is_contended(err: &io::Error) -> bool {
        err.kind() == io::ErrorKind::WouldBlock
            || err.raw_os_error() == Some(libc::EWOULDBLOCK)
            || err.raw_os_error() == Some(libc::EAGAIN)
    }

    #[cfg(not(unix))]
    fn is_contended(err: &io::Error) -> bool {
        err.kind() == io::ErrorKind::AlreadyExists
    }
}

impl Drop for LockFile {
    #[cfg(unix)]
    fn drop(&mut self) {
        // Closing the descriptor releases the lock as well; unlock explicitly
        // so the release does not depend on other handles to the file
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }

    #[cfg(not(unix))]
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
