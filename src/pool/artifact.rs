//! Pool artifact naming.
//!
//! Artifacts are named `{codename}-{package}_{version}_{arch}.{ext}`. The
//! codename prefix is the pool tag; the remainder is the usual Debian
//! `package_version_arch` triple.

use anyhow::{bail, Result};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use crate::filesystem::{digest_file, FileDigest};

/// Package file extensions accepted into the pool.
pub const PACKAGE_EXTENSIONS: &[&str] = &["deb", "udeb", "ddeb"];

/// Does `file_name` end in one of [`PACKAGE_EXTENSIONS`]?
pub fn is_package_file(file_name: &str) -> bool {
    file_name
        .rsplit_once('.')
        .is_some_and(|(_, ext)| PACKAGE_EXTENSIONS.contains(&ext))
}

/// Does `file_name` carry the pool tag for `codename`?
pub fn has_codename_tag(file_name: &str, codename: &str) -> bool {
    file_name
        .strip_prefix(codename)
        .is_some_and(|rest| rest.starts_with('-'))
}

/// Parsed fields of an artifact filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactName {
    pub codename: String,
    pub package: String,
    pub version: String,
    pub arch: String,
    pub extension: String,
}

impl ArtifactName {
    /// Parse a filename known to belong to `codename`.
    pub fn parse(file_name: &str, codename: &str) -> Result<Self> {
        if !has_codename_tag(file_name, codename) {
            bail!(
                "artifact '{}' is not tagged for codename '{}'",
                file_name,
                codename
            );
        }
        let rest = &file_name[codename.len() + 1..];
        let (stem, extension) = rest
            .rsplit_once('.')
            .ok_or_else(|| anyhow::anyhow!("artifact '{}' has no extension", file_name))?;
        if !PACKAGE_EXTENSIONS.contains(&extension) {
            bail!(
                "artifact '{}' has unsupported extension '.{}' (expected one of {:?})",
                file_name,
                extension,
                PACKAGE_EXTENSIONS
            );
        }
        let mut fields = stem.splitn(3, '_');
        let (Some(package), Some(version), Some(arch)) =
            (fields.next(), fields.next(), fields.next())
        else {
            bail!(
                "artifact '{}' does not follow '{{codename}}-{{package}}_{{version}}_{{arch}}'",
                file_name
            );
        };
        if package.is_empty() || version.is_empty() || arch.is_empty() || arch.contains('_') {
            bail!(
                "artifact '{}' does not follow '{{codename}}-{{package}}_{{version}}_{{arch}}'",
                file_name
            );
        }
        Ok(Self {
            codename: codename.to_string(),
            package: package.to_string(),
            version: version.to_string(),
            arch: arch.to_string(),
            extension: extension.to_string(),
        })
    }

    /// Parse against whichever configured codename tags the file.
    pub fn parse_any(file_name: &str, codenames: &[String]) -> Result<Self> {
        let codename = codenames
            .iter()
            .find(|c| has_codename_tag(file_name, c))
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "artifact '{}' is not tagged with any configured codename ({})",
                    file_name,
                    codenames.join(", ")
                )
            })?;
        Self::parse(file_name, codename)
    }

    /// Installable on `arch`: exact match or architecture-independent.
    pub fn is_compatible_with(&self, arch: &str) -> bool {
        self.arch == arch || self.arch == crate::config::ARCH_INDEPENDENT
    }
}

/// A file in the pool. Content is immutable once placed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub file_name: String,
    pub path: PathBuf,
}

impl Artifact {
    pub fn new(dir: &Path, file_name: &str) -> Self {
        Self {
            file_name: file_name.to_string(),
            path: dir.join(file_name),
        }
    }

    /// Checksums and size, computed on demand.
    pub fn digest(&self) -> Result<FileDigest> {
        digest_file(&self.path)
    }
}

/// Debian-style version ordering.
///
/// Alternating non-digit and digit runs; digit runs compare numerically,
/// non-digit runs compare with letters before punctuation and `~` before
/// everything, including the end of the string.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let (mut a, mut b) = (a.as_bytes(), b.as_bytes());
    while !a.is_empty() || !b.is_empty() {
        let (a_text, a_rest) = split_run(a, |c| !c.is_ascii_digit());
        let (b_text, b_rest) = split_run(b, |c| !c.is_ascii_digit());
        let ord = compare_text(a_text, b_text);
        if ord != Ordering::Equal {
            return ord;
        }
        let (a_num, a_rest) = split_run(a_rest, |c| c.is_ascii_digit());
        let (b_num, b_rest) = split_run(b_rest, |c| c.is_ascii_digit());
        let ord = compare_numeric(a_num, b_num);
        if ord != Ordering::Equal {
            return ord;
        }
        a = a_rest;
        b = b_rest;
    }
    Ordering::Equal
}

fn split_run(s: &[u8], pred: impl Fn(u8) -> bool) -> (&[u8], &[u8]) {
    let end = s.iter().position(|&c| !pred(c)).unwrap_or(s.len());
    s.split_at(end)
}

fn char_weight(c: Option<u8>) -> i32 {
    match c {
        Some(b'~') => -1,
        None => 0,
        Some(c) if c.is_ascii_alphabetic() => i32::from(c),
        Some(c) => i32::from(c) + 256,
    }
}

fn compare_text(a: &[u8], b: &[u8]) -> Ordering {
    let len = a.len().max(b.len());
    for i in 0..len {
        let ord = char_weight(a.get(i).copied()).cmp(&char_weight(b.get(i).copied()));
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn compare_numeric(a: &[u8], b: &[u8]) -> Ordering {
    let trim = |s: &[u8]| -> Vec<u8> {
        let start = s.iter().position(|&c| c != b'0').unwrap_or(s.len());
        s[start..].to_vec()
    };
    let (a, b) = (trim(a), trim(b));
    a.len().cmp(&b.len()).then_with(|| a.cmp(&b))
}
