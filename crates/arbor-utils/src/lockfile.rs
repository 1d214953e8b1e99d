use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::{LockError, UtilError};
use crate::Result;

const LOCK_SUFFIX: &str = ".lock";

/// RAII guard over `<path>.lock`.
///
/// Acquiring creates the lock file with O_CREAT|O_EXCL; new content is
/// written into the lock file and atomically renamed over the target on
/// [`commit`](LockFile::commit). Dropping an uncommitted lock unlinks the
/// lock file, so every exit path releases the lock.
#[derive(Debug)]
pub struct LockFile {
    /// Target path (without the .lock suffix).
    path: PathBuf,
    /// Lock file path (with the .lock suffix).
    lock_path: PathBuf,
    file: Option<File>,
    resolved: bool,
}

impl LockFile {
    /// Take the lock on `path` by creating `path.lock` exclusively.
    ///
    /// Fails with [`LockError::AlreadyLocked`] when another holder exists.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let lock_path = PathBuf::from(format!("{}{}", path.display(), LOCK_SUFFIX));

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
            .map_err(|e| {
                if e.kind() == io::ErrorKind::AlreadyExists {
                    UtilError::Lock(LockError::AlreadyLocked {
                        path: lock_path.clone(),
                    })
                } else {
                    UtilError::Lock(LockError::Create {
                        path: lock_path.clone(),
                        source: e,
                    })
                }
            })?;

        Ok(Self {
            path,
            lock_path,
            file: Some(file),
            resolved: false,
        })
    }

    /// Target path (without .lock).
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lock file path (with .lock).
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Flush, fsync, and atomically rename the lock file over the target.
    pub fn commit(mut self) -> Result<()> {
        if let Some(ref mut file) = self.file {
            file.flush().map_err(|e| commit_err(&self.lock_path, e))?;
            file.sync_all().map_err(|e| commit_err(&self.lock_path, e))?;
        }
        self.file.take();

        fs::rename(&self.lock_path, &self.path).map_err(|e| commit_err(&self.lock_path, e))?;

        self.resolved = true;
        Ok(())
    }

    /// Release the lock without touching the target.
    pub fn rollback(mut self) -> Result<()> {
        self.file.take();
        if self.lock_path.exists() {
            fs::remove_file(&self.lock_path)?;
        }
        self.resolved = true;
        Ok(())
    }
}

fn commit_err(lock_path: &Path, source: io::Error) -> UtilError {
    UtilError::Lock(LockError::Commit {
        path: lock_path.to_path_buf(),
        source,
    })
}

impl Write for LockFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other("lock file already closed"))?
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other("lock file already closed"))?
            .flush()
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if !self.resolved {
            self.file.take();
            let _ = fs::remove_file(&self.lock_path);
        }
    }
}
