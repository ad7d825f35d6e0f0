//! Remote mirror synchronization.
//!
//! The remote copy of a repository is authoritative at the start of a cycle
//! and is overwritten by the local working tree at the end. Both directions
//! use delete-extraneous semantics: after a sync the destination holds
//! exactly the files of the source.

use anyhow::{bail, Context, Result};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::filesystem::{atomic_rename, digest_file};
use crate::process::Tool;

/// Where the authoritative repository tree lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteLocation {
    /// `s3://bucket/prefix`, synced with the AWS CLI.
    S3(String),
    /// `host:path` or `rsync://host/module/path`, synced with rsync.
    Rsync(String),
    /// A directory on a mounted filesystem, synced in-process.
    Local(PathBuf),
}

impl RemoteLocation {
    /// Classify a configured remote string.
    ///
    /// Relative local paths resolve against `base_dir`.
    pub fn parse(raw: &str, base_dir: &Path) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            bail!("remote location must not be empty");
        }
        if let Some(rest) = raw.strip_prefix("s3://") {
            if rest.trim_matches('/').is_empty() {
                bail!("s3 remote '{}' has no bucket", raw);
            }
            return Ok(Self::S3(raw.trim_end_matches('/').to_string()));
        }
        if raw.starts_with("rsync://") {
            return Ok(Self::Rsync(raw.trim_end_matches('/').to_string()));
        }
        if let Some(rest) = raw.strip_prefix("file://") {
            return Ok(Self::Local(resolve(base_dir, rest)));
        }
        // scp-style `host:path`, as long as the colon precedes any slash.
        if let Some(colon) = raw.find(':') {
            let slash = raw.find('/').unwrap_or(usize::MAX);
            if colon > 0 && colon < slash {
                return Ok(Self::Rsync(raw.trim_end_matches('/').to_string()));
            }
        }
        Ok(Self::Local(resolve(base_dir, raw)))
    }
}

impl std::fmt::Display for RemoteLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::S3(url) | Self::Rsync(url) => f.write_str(url),
            Self::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

fn resolve(base_dir: &Path, path: &str) -> PathBuf {
    let candidate = Path::new(path);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        base_dir.join(candidate)
    }
}

/// Bidirectional, delete-extraneous sync between a remote and a local tree.
pub trait Mirror {
    /// Human-readable remote name for logs and errors.
    fn remote(&self) -> String;

    /// Make `local` an exact copy of the remote tree.
    fn pull(&self, local: &Path) -> Result<()>;

    /// Make the remote an exact copy of `local`.
    fn push(&self, local: &Path) -> Result<()>;
}

/// Build the mirror implementation for a configured location.
pub fn mirror_for(location: &RemoteLocation) -> Box<dyn Mirror> {
    match location {
        RemoteLocation::S3(url) => Box::new(S3Mirror { url: url.clone() }),
        RemoteLocation::Rsync(url) => Box::new(RsyncMirror { url: url.clone() }),
        RemoteLocation::Local(path) => Box::new(LocalMirror::new(path.clone())),
    }
}

/// `aws s3 sync --delete` in both directions.
#[derive(Debug, Clone)]
pub struct S3Mirror {
    url: String,
}

impl Mirror for S3Mirror {
    fn remote(&self) -> String {
        self.url.clone()
    }

    fn pull(&self, local: &Path) -> Result<()> {
        fs::create_dir_all(local)
            .with_context(|| format!("creating local tree '{}'", local.display()))?;
        info!(remote = %self.url, local = %local.display(), "pulling repository");
        Tool::new("aws")
            .args(&["s3", "sync", "--delete", "--no-progress"])
            .arg(self.url.as_str())
            .arg(local)
            .run()
            .with_context(|| format!("pulling '{}'", self.url))?;
        Ok(())
    }

    fn push(&self, local: &Path) -> Result<()> {
        info!(remote = %self.url, local = %local.display(), "pushing repository");
        Tool::new("aws")
            .args(&["s3", "sync", "--delete", "--no-progress"])
            .arg(local)
            .arg(self.url.as_str())
            .run()
            .with_context(|| format!("pushing '{}'", self.url))?;
        Ok(())
    }
}

/// `rsync -a --delete` in both directions.
#[derive(Debug, Clone)]
pub struct RsyncMirror {
    url: String,
}

impl Mirror for RsyncMirror {
    fn remote(&self) -> String {
        self.url.clone()
    }

    fn pull(&self, local: &Path) -> Result<()> {
        fs::create_dir_all(local)
            .with_context(|| format!("creating local tree '{}'", local.display()))?;
        info!(remote = %self.url, local = %local.display(), "pulling repository");
        // Trailing slashes: sync directory contents, not the directory itself.
        let src = format!("{}/", self.url);
        let dst = format!("{}/", local.display());
        Tool::new("rsync")
            .args(&["-a", "--delete"])
            .arg(src.as_str())
            .arg(dst.as_str())
            .run()
            .with_context(|| format!("pulling '{}'", self.url))?;
        Ok(())
    }

    fn push(&self, local: &Path) -> Result<()> {
        info!(remote = %self.url, local = %local.display(), "pushing repository");
        let src = format!("{}/", local.display());
        let dst = format!("{}/", self.url);
        Tool::new("rsync")
            .args(&["-a", "--delete"])
            .arg(src.as_str())
            .arg(dst.as_str())
            .run()
            .with_context(|| format!("pushing '{}'", self.url))?;
        Ok(())
    }
}

/// In-process mirror of a directory on a mounted filesystem.
#[derive(Debug, Clone)]
pub struct LocalMirror {
    root: PathBuf,
}

impl LocalMirror {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

impl Mirror for LocalMirror {
    fn remote(&self) -> String {
        self.root.display().to_string()
    }

    fn pull(&self, local: &Path) -> Result<()> {
        info!(remote = %self.root.display(), local = %local.display(), "pulling repository");
        sync_tree(&self.root, local)
    }

    fn push(&self, local: &Path) -> Result<()> {
        info!(remote = %self.root.display(), local = %local.display(), "pushing repository");
        sync_tree(local, &self.root)
    }
}

/// Make `dst` an exact copy of `src`. A missing `src` counts as empty.
pub fn sync_tree(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).with_context(|| format!("creating '{}'", dst.display()))?;

    let mut wanted = BTreeSet::new();
    if src.is_dir() {
        for entry in WalkDir::new(src).follow_links(false).sort_by_file_name() {
            let entry =
                entry.with_context(|| format!("walking source tree '{}'", src.display()))?;
            let rel = entry
                .path()
                .strip_prefix(src)
                .with_context(|| format!("relativizing '{}'", entry.path().display()))?
                .to_path_buf();
            if rel.as_os_str().is_empty() {
                continue;
            }
            let target = dst.join(&rel);
            let file_type = entry.file_type();
            if file_type.is_dir() {
                if target.is_file() {
                    fs::remove_file(&target)
                        .with_context(|| format!("removing '{}'", target.display()))?;
                }
                fs::create_dir_all(&target)
                    .with_context(|| format!("creating '{}'", target.display()))?;
            } else if file_type.is_file() {
                if target.is_dir() {
                    fs::remove_dir_all(&target)
                        .with_context(|| format!("removing '{}'", target.display()))?;
                }
                copy_if_changed(entry.path(), &target)?;
            } else {
                continue;
            }
            wanted.insert(rel);
        }
    }

    // Deepest entries first so directories are empty by the time we reach them.
    for entry in WalkDir::new(dst).follow_links(false).contents_first(true) {
        let entry =
            entry.with_context(|| format!("walking destination tree '{}'", dst.display()))?;
        let rel = entry
            .path()
            .strip_prefix(dst)
            .with_context(|| format!("relativizing '{}'", entry.path().display()))?;
        if rel.as_os_str().is_empty() || wanted.contains(rel) {
            continue;
        }
        debug!(path = %entry.path().display(), "removing extraneous entry");
        if entry.file_type().is_dir() {
            fs::remove_dir_all(entry.path())
                .with_context(|| format!("removing '{}'", entry.path().display()))?;
        } else {
            fs::remove_file(entry.path())
                .with_context(|| format!("removing '{}'", entry.path().display()))?;
        }
    }
    Ok(())
}

fn copy_if_changed(src: &Path, dst: &Path) -> Result<()> {
    if dst.is_file() {
        let src_len = fs::metadata(src)
            .with_context(|| format!("reading metadata '{}'", src.display()))?
            .len();
        let dst_len = fs::metadata(dst)
            .with_context(|| format!("reading metadata '{}'", dst.display()))?
            .len();
        if src_len == dst_len && digest_file(src)?.sha256 == digest_file(dst)?.sha256 {
            return Ok(());
        }
    }
    let tmp = dst.with_file_name(format!(
        ".{}.sync-tmp",
        dst.file_name().and_then(|n| n.to_str()).unwrap_or("file")
    ));
    fs::copy(src, &tmp)
        .with_context(|| format!("copying '{}' to '{}'", src.display(), tmp.display()))?;
    atomic_rename(&tmp, dst)
}
