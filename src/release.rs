//! Release descriptor composition.
//!
//! The `Release` file is what package managers trust first: it names the
//! suite, lists the architectures that have an index and carries the size
//! and checksums of every index file. A codename's previous `Release` and
//! its signatures are removed before the new one is written, so a newer
//! unsigned descriptor never sits next to an older signature.

use anyhow::Result;
use std::path::{Path, PathBuf};
use time::{OffsetDateTime, UtcOffset};
use tracing::{info, warn};

use crate::config::RepositoryInfo;
use crate::filesystem::{digest_file, remove_file_if_exists, write_atomic};
use crate::index::{dist_dir, CodenameIndex};

pub const RELEASE_FILE: &str = "Release";
pub const RELEASE_SIGNATURE_FILE: &str = "Release.pgp";
pub const IN_RELEASE_FILE: &str = "InRelease";

/// Checksum line for one index file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumEntry {
    pub rel_path: String,
    pub size: u64,
    pub sha256: String,
    pub sha512: String,
}

/// A freshly written, not yet signed `Release` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseDescriptor {
    pub codename: String,
    pub path: PathBuf,
    pub architectures: Vec<String>,
    pub entries: Vec<ChecksumEntry>,
}

impl ReleaseDescriptor {
    pub fn dist_dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }
}

/// Composes `dists/<codename>/Release` from the indices built this cycle.
#[derive(Debug, Clone)]
pub struct ReleaseComposer {
    info: RepositoryInfo,
    released_at: OffsetDateTime,
}

impl ReleaseComposer {
    pub fn new(info: RepositoryInfo, released_at: OffsetDateTime) -> Self {
        Self { info, released_at }
    }

    pub fn compose(
        &self,
        tree_root: &Path,
        codename: &str,
        indices: &[CodenameIndex],
    ) -> Result<ReleaseDescriptor> {
        let dist = dist_dir(tree_root, codename);
        for stale in [RELEASE_FILE, RELEASE_SIGNATURE_FILE, IN_RELEASE_FILE] {
            remove_file_if_exists(&dist.join(stale))?;
        }

        let mut architectures: Vec<String> = indices.iter().map(|i| i.arch.clone()).collect();
        architectures.sort();
        architectures.dedup();
        if architectures.is_empty() {
            warn!(codename, "no architecture has packages; Release lists none");
        }

        let mut entries = Vec::new();
        for file in indices.iter().flat_map(|i| i.files.iter()) {
            let digest = digest_file(&file.path)?;
            entries.push(ChecksumEntry {
                rel_path: file.rel_path.clone(),
                size: digest.size,
                sha256: digest.sha256,
                sha512: digest.sha512,
            });
        }
        entries.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));

        let text = render_release(
            &self.info,
            codename,
            &format_release_date(self.released_at),
            &architectures,
            &entries,
        );
        let path = dist.join(RELEASE_FILE);
        write_atomic(&path, text.as_bytes())?;
        info!(codename, architectures = %architectures.join(","), "wrote Release");

        Ok(ReleaseDescriptor {
            codename: codename.to_string(),
            path,
            architectures,
            entries,
        })
    }
}

/// Render the descriptor text. Pure.
pub fn render_release(
    info: &RepositoryInfo,
    codename: &str,
    date: &str,
    architectures: &[String],
    entries: &[ChecksumEntry],
) -> String {
    let mut out = String::new();
    let mut field = |key: &str, value: &str| {
        out.push_str(key);
        out.push(':');
        if !value.is_empty() {
            out.push(' ');
            out.push_str(value);
        }
        out.push('\n');
    };
    field("Origin", &info.origin);
    field("Label", &info.label);
    field("Suite", codename);
    field("Codename", codename);
    field("Version", &info.version);
    field("Date", date);
    field("Architectures", &architectures.join(","));
    field("Components", &info.component);
    field("Description", &info.description);

    if !entries.is_empty() {
        out.push_str("SHA256:\n");
        for e in entries {
            out.push_str(&format!(" {} {:>16} {}\n", e.sha256, e.size, e.rel_path));
        }
        out.push_str("SHA512:\n");
        for e in entries {
            out.push_str(&format!(" {} {:>16} {}\n", e.sha512, e.size, e.rel_path));
        }
    }
    out
}

/// `Sun, 18 Oct 2026 09:05:00 UTC`, the form apt-ftparchive writes.
pub fn format_release_date(at: OffsetDateTime) -> String {
    let at = at.to_offset(UtcOffset::UTC);
    let weekday = at.weekday().to_string();
    let month = at.month().to_string();
    format!(
        "{}, {:02} {} {:04} {:02}:{:02}:{:02} UTC",
        &weekday[..3],
        at.day(),
        &month[..3],
        at.year(),
        at.hour(),
        at.minute(),
        at.second()
    )
}
