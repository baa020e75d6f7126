use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::{LockError, UtilError};
use crate::Result;

const LOCK_SUFFIX: &str = ".lock";

/// Advisory lock on a file, following the `<path>.lock` protocol.
///
/// Acquiring creates `<path>.lock` with O_CREAT|O_EXCL; the new content is
/// written into the lock file and an atomic rename publishes it on commit.
/// Dropping an uncommitted lock removes the lock file, leaving the target
/// untouched.
pub struct LockFile {
    /// The file being locked (no `.lock` suffix).
    target: PathBuf,
    /// The `.lock` file actually created on disk.
    lock_path: PathBuf,
    handle: Option<File>,
    done: bool,
}

impl LockFile {
    /// Acquire the lock for `target`, failing immediately if another
    /// process already holds it.
    pub fn acquire(target: impl AsRef<Path>) -> Result<Self> {
        let target = target.as_ref().to_path_buf();
        let mut lock_os = target.clone().into_os_string();
        lock_os.push(LOCK_SUFFIX);
        let lock_path = PathBuf::from(lock_os);

        let handle = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
            .map_err(|e| {
                if e.kind() == io::ErrorKind::AlreadyExists {
                    UtilError::Lock(LockError::Held {
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
            target,
            lock_path,
            handle: Some(handle),
            done: false,
        })
    }

    /// Non-failing variant: `Ok(None)` when the lock is held elsewhere.
    pub fn try_acquire(target: impl AsRef<Path>) -> Result<Option<Self>> {
        match Self::acquire(target) {
            Ok(lock) => Ok(Some(lock)),
            Err(UtilError::Lock(LockError::Held { .. })) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// The file this lock protects.
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// The on-disk `.lock` path.
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Fsync the lock file and atomically rename it over the target.
    pub fn commit(self) -> Result<()> {
        self.commit_inner(false)
    }

    /// Like [`commit`](Self::commit), but additionally fsyncs the containing
    /// directory after the rename so the publication itself is durable.
    pub fn commit_and_sync_dir(self) -> Result<()> {
        self.commit_inner(true)
    }

    fn commit_inner(mut self, sync_dir: bool) -> Result<()> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| UtilError::Lock(LockError::Commit { path, source })
        };

        if let Some(mut handle) = self.handle.take() {
            handle.flush().map_err(io_err(&self.lock_path))?;
            handle.sync_all().map_err(io_err(&self.lock_path))?;
        }

        fs::rename(&self.lock_path, &self.target).map_err(io_err(&self.lock_path))?;
        self.done = true;

        if sync_dir {
            if let Some(dir) = self.target.parent() {
                File::open(dir)
                    .and_then(|d| d.sync_all())
                    .map_err(io_err(dir))?;
            }
        }
        Ok(())
    }

    /// Abort the update: remove the lock file without touching the target.
    pub fn abort(mut self) -> Result<()> {
        self.handle.take();
        match fs::remove_file(&self.lock_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.done = true;
        Ok(())
    }
}

impl Write for LockFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.handle
            .as_mut()
            .ok_or_else(|| io::Error::other("lock file already closed"))?
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.handle
            .as_mut()
            .ok_or_else(|| io::Error::other("lock file already closed"))?
            .flush()
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if !self.done {
            self.handle.take();
            let _ = fs::remove_file(&self.lock_path);
        }
    }
}
