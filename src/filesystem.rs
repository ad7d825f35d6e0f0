//! Filesystem helpers shared by the pool, index and signing steps.
//!
//! Everything that lands in the repository tree is written to a temporary
//! sibling first and renamed into place, so a crash never leaves a
//! half-written `Packages`, `Release` or signature file behind.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256, Sha512};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Hex digests and size of a file, computed in a single pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigest {
    pub sha256: String,
    pub sha512: String,
    pub size: u64,
}

/// Hash a file with SHA256 and SHA512.
pub fn digest_file(path: &Path) -> Result<FileDigest> {
    let f = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut r = BufReader::new(f);
    let mut sha256 = Sha256::new();
    let mut sha512 = Sha512::new();
    let mut buf = [0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = r
            .read(&mut buf)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if n == 0 {
            break;
        }
        sha256.update(&buf[..n]);
        sha512.update(&buf[..n]);
        size += n as u64;
    }
    Ok(FileDigest {
        sha256: format!("{:x}", sha256.finalize()),
        sha512: format!("{:x}", sha512.finalize()),
        size,
    })
}

/// SHA256 of an in-memory buffer.
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Write `contents` to `path` through a temporary file in the same directory.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = write_temp_sibling(path, contents)?;
    let result = atomic_rename(&tmp, path);
    if result.is_err() {
        remove_file_if_exists(&tmp)?;
    }
    result
}

/// Write `contents` to a hidden temporary sibling of `path` and return it.
///
/// The caller either renames it into place with [`atomic_rename`] or removes
/// it; [`list_file_names`] never reports it.
pub fn write_temp_sibling(path: &Path, contents: &[u8]) -> Result<PathBuf> {
    let tmp = tmp_sibling(path)?;
    if let Err(e) = fs::write(&tmp, contents) {
        remove_file_if_exists(&tmp)?;
        return Err(e).with_context(|| format!("writing temp file '{}'", tmp.display()));
    }
    Ok(tmp)
}

/// Rename `src` onto `dst`, falling back to copy+remove across filesystems.
pub fn atomic_rename(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating directory '{}'", parent.display()))?;
    }
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_e) => {
            // EXDEV: the holding area may live on another mount.
            fs::copy(src, dst).with_context(|| {
                format!("Failed to copy {} to {}", src.display(), dst.display())
            })?;
            fs::remove_file(src)
                .with_context(|| format!("Failed to remove {}", src.display()))?;
            Ok(())
        }
    }
}

/// Remove a file if it exists.
pub fn remove_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("removing '{}'", path.display())),
    }
}

/// Remove a directory tree if it exists.
pub fn remove_dir_if_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    fs::remove_dir_all(path).with_context(|| format!("removing directory '{}'", path.display()))
}

/// Sorted names of the regular, non-hidden files directly inside `dir`.
///
/// A missing directory is treated as empty.
pub fn list_file_names(dir: &Path) -> Result<Vec<String>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in
        fs::read_dir(dir).with_context(|| format!("reading directory '{}'", dir.display()))?
    {
        let entry =
            entry.with_context(|| format!("iterating directory '{}'", dir.display()))?;
        let file_type = entry
            .file_type()
            .with_context(|| format!("reading file type for '{}'", entry.path().display()))?;
        if !file_type.is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        // Temporaries from interrupted writes.
        if name.starts_with('.') {
            continue;
        }
        names.push(name);
    }
    names.sort();
    Ok(names)
}

fn tmp_sibling(path: &Path) -> Result<PathBuf> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path without parent '{}'", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("creating parent directory '{}'", parent.display()))?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file");
    let n = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    Ok(parent.join(format!(".{name}.tmp-{}-{n}", std::process::id())))
}
