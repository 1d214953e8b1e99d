use std::fs;
use std::io::{self, Write};
use std::path::Path;

use crate::Result;

/// A temporary file with RAII cleanup.
///
/// Created in a caller-chosen directory so that an eventual rename stays on
/// one filesystem. Deleted on drop unless persisted or kept.
pub struct TempFile {
    inner: Option<::tempfile::NamedTempFile>,
}

impl TempFile {
    /// Create a uniquely-named temporary file inside `dir`.
    pub fn new_in(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let named = ::tempfile::NamedTempFile::new_in(dir)?;
        Ok(Self { inner: Some(named) })
    }

    /// Create a temporary file in the same directory as `target`.
    pub fn new_for(target: impl AsRef<Path>) -> Result<Self> {
        let target = target.as_ref();
        let dir = target.parent().unwrap_or(Path::new("."));
        Self::new_in(dir)
    }

    /// Path of the temporary file while it exists.
    pub fn path(&self) -> &Path {
        self.inner
            .as_ref()
            .map(|n| n.path())
            .unwrap_or(Path::new(""))
    }

    /// Rename into place at `target`, consuming the guard.
    pub fn persist(mut self, target: impl AsRef<Path>) -> Result<()> {
        if let Some(named) = self.inner.take() {
            named
                .persist(target.as_ref())
                .map_err(|e| crate::error::UtilError::Io(e.error))?;
        }
        Ok(())
    }

    /// Keep the file on disk and return its path; cleanup becomes the
    /// caller's responsibility.
    pub fn keep(mut self) -> Result<std::path::PathBuf> {
        match self.inner.take() {
            Some(named) => {
                let (_file, path) = named
                    .keep()
                    .map_err(|e| crate::error::UtilError::Io(e.error))?;
                Ok(path)
            }
            None => Ok(std::path::PathBuf::new()),
        }
    }
}

impl Write for TempFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner
            .as_mut()
            .ok_or_else(|| io::Error::other("temp file already closed"))?
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner
            .as_mut()
            .ok_or_else(|| io::Error::other("temp file already closed"))?
            .flush()
    }
}
