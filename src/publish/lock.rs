//! Exclusive lock over a working directory.
//!
//! The pool filter/restore protocol is not safe for two concurrent runs, so
//! every run holds this lock from before the pull until after the push.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

/// RAII guard: unlocks on drop.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating directory '{}'", parent.display()))?;
        }

        // The lock file is never unlinked: removing a file another process
        // still holds would let a third process lock a fresh inode.
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to create lock file: {}", path.display()))?;

        if file.try_lock_exclusive().is_err() {
            return Err(anyhow::anyhow!(
                "another publish run holds the working directory lock: {}",
                path.display()
            ));
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn second_acquire_fails_until_first_is_dropped() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(".publish.lock");

        let first = RunLock::acquire(&path).unwrap();
        assert!(RunLock::acquire(&path).is_err());
        drop(first);
        assert!(RunLock::acquire(&path).is_ok());
    }
}
