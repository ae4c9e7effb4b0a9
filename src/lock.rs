//! Advisory file locking for the single-writer invariant.
//!
//! One exclusive lease per archive; any number of shared readers. The lock is
//! advisory (flock-style via `fs2`), paired with the in-process exclusivity of
//! holding `&mut Archive`.

use std::fs::File;

use fs2::FileExt;

use crate::error::{ArchiveError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug)]
pub struct FileLock {
    file: File,
    mode: LockMode,
}

impl FileLock {
    /// Take a lock on `file` without blocking. Contention surfaces as
    /// [`ArchiveError::WriterContention`] so callers can retry with backoff.
    pub fn acquire(file: &File, mode: LockMode) -> Result<Self> {
        let handle = file.try_clone()?;
        let locked = match mode {
            LockMode::Exclusive => handle.try_lock_exclusive(),
            LockMode::Shared => FileExt::try_lock_shared(&handle),
        };
        match locked {
            Ok(()) => Ok(Self { file: handle, mode }),
            Err(err) => Err(ArchiveError::WriterContention {
                reason: format!("{mode:?} lock unavailable: {err}"),
            }),
        }
    }

    #[must_use]
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Swap a shared lease for the exclusive one. The shared lock is released
    /// first, so a failure leaves the handle unlocked and the caller must not
    /// continue writing.
    pub fn upgrade_to_exclusive(&mut self) -> Result<()> {
        if self.mode == LockMode::Exclusive {
            return Ok(());
        }
        FileExt::unlock(&self.file)?;
        match self.file.try_lock_exclusive() {
            Ok(()) => {
                self.mode = LockMode::Exclusive;
                Ok(())
            }
            Err(err) => Err(ArchiveError::WriterContention {
                reason: format!("exclusive upgrade failed: {err}"),
            }),
        }
    }

    pub fn downgrade_to_shared(&mut self) -> Result<()> {
        if self.mode == LockMode::Shared {
            return Ok(());
        }
        FileExt::unlock(&self.file)?;
        match self.file.try_lock_shared() {
            Ok(()) => {
                self.mode = LockMode::Shared;
                Ok(())
            }
            Err(err) => Err(ArchiveError::WriterContention {
                reason: format!("shared downgrade failed: {err}"),
            }),
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use tempfile::tempdir;

    // flock is per open-file-description, so contention needs two separate opens.
    fn open_twice() -> (tempfile::TempDir, File, File) {
        let dir = tempdir().expect("tmp");
        let path = dir.path().join("lock.wv2");
        let a = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .expect("open a");
        let b = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .expect("open b");
        (dir, a, b)
    }

    #[test]
    fn exclusive_excludes_second_writer() {
        let (_dir, a, b) = open_twice();
        let _lock = FileLock::acquire(&a, LockMode::Exclusive).expect("first lock");
        let err = FileLock::acquire(&b, LockMode::Exclusive).expect_err("second lock");
        assert!(matches!(err, ArchiveError::WriterContention { .. }));
    }

    #[test]
    fn shared_readers_coexist() {
        let (_dir, a, b) = open_twice();
        let _a = FileLock::acquire(&a, LockMode::Shared).expect("reader a");
        let _b = FileLock::acquire(&b, LockMode::Shared).expect("reader b");
    }
}
