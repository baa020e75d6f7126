use std::fs;
use std::io::{self, Write};
use std::path::Path;

use crate::Result;

/// A randomly-named staging file that becomes real only when persisted.
///
/// The file is created in the directory that will hold the final path so
/// the rename stays on one filesystem. Dropping an unpersisted stage
/// deletes the file.
pub struct StagedFile {
    inner: Option<tempfile::NamedTempFile>,
}

impl StagedFile {
    /// Create a staging file inside `dir`, creating `dir` if needed.
    pub fn in_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let inner = tempfile::NamedTempFile::new_in(dir)?;
        Ok(Self { inner: Some(inner) })
    }

    /// The current (temporary) path of the staged file.
    pub fn path(&self) -> &Path {
        self.inner
            .as_ref()
            .map(|t| t.path())
            .unwrap_or_else(|| Path::new(""))
    }

    /// Mutable handle to the underlying file.
    pub fn file_mut(&mut self) -> Option<&mut fs::File> {
        self.inner.as_mut().map(|t| t.as_file_mut())
    }

    /// Fsync the staged content.
    pub fn sync(&mut self) -> Result<()> {
        if let Some(t) = self.inner.as_mut() {
            t.as_file_mut().sync_all()?;
        }
        Ok(())
    }

    /// Rename the staged file to `target`, consuming the stage.
    pub fn persist(mut self, target: impl AsRef<Path>) -> Result<()> {
        if let Some(t) = self.inner.take() {
            t.persist(target.as_ref())
                .map_err(|e| crate::UtilError::Io(e.error))?;
        }
        Ok(())
    }
}

impl Write for StagedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner
            .as_mut()
            .ok_or_else(|| io::Error::other("staged file already persisted"))?
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner
            .as_mut()
            .ok_or_else(|| io::Error::other("staged file already persisted"))?
            .flush()
    }
}
