//! Listing generators for `Packages` indices.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::warn;

use super::stanza::Stanza;
use crate::config::IndexToolKind;
use crate::pool::{is_package_file, Artifact, ArtifactName, POOL_SUBDIR};
use crate::process::Tool;

/// What an index tool sees: the tree, the codename being processed, the
/// visible artifacts and the target architecture.
#[derive(Debug, Clone, Copy)]
pub struct ListingRequest<'a> {
    pub tree_root: &'a Path,
    pub codename: &'a str,
    pub arch: &'a str,
    pub artifacts: &'a [Artifact],
}

/// Produces the package stanzas compatible with one architecture.
pub trait IndexTool {
    fn name(&self) -> &'static str;

    fn listing(&self, request: &ListingRequest<'_>) -> Result<Vec<Stanza>>;
}

pub fn index_tool_for(kind: IndexToolKind) -> Box<dyn IndexTool> {
    match kind {
        IndexToolKind::Native => Box::new(NativeIndexer),
        IndexToolKind::AptFtparchive => Box::new(AptFtparchive),
    }
}

/// Derives stanzas from pool filenames and content digests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeIndexer;

impl IndexTool for NativeIndexer {
    fn name(&self) -> &'static str {
        "native"
    }

    fn listing(&self, request: &ListingRequest<'_>) -> Result<Vec<Stanza>> {
        let mut stanzas = Vec::new();
        for artifact in request.artifacts {
            // Build byproducts (.buildinfo, .changes) may share the pool.
            if !is_package_file(&artifact.file_name) {
                warn!(
                    artifact = %artifact.file_name,
                    codename = request.codename,
                    "skipping non-package file in pool"
                );
                continue;
            }
            let name = ArtifactName::parse(&artifact.file_name, request.codename)?;
            if !name.is_compatible_with(request.arch) {
                continue;
            }
            let digest = artifact
                .digest()
                .with_context(|| format!("hashing artifact '{}'", artifact.file_name))?;
            let mut stanza = Stanza::default();
            stanza.push("Package", &name.package);
            stanza.push("Version", &name.version);
            stanza.push("Architecture", &name.arch);
            stanza.push("Filename", &format!("{POOL_SUBDIR}/{}", artifact.file_name));
            stanza.push("Size", &digest.size.to_string());
            stanza.push("SHA256", &digest.sha256);
            stanza.push("SHA512", &digest.sha512);
            stanzas.push(stanza);
        }
        Ok(stanzas)
    }
}

/// `apt-ftparchive --arch <arch> packages pool`, run from the tree root.
///
/// Reads control data from inside each `.deb`, so the listing carries the
/// full package metadata rather than what the filename encodes.
#[derive(Debug, Clone, Copy, Default)]
pub struct AptFtparchive;

impl IndexTool for AptFtparchive {
    fn name(&self) -> &'static str {
        "apt-ftparchive"
    }

    fn listing(&self, request: &ListingRequest<'_>) -> Result<Vec<Stanza>> {
        let stdout = Tool::new("apt-ftparchive")
            .arg("--arch")
            .arg(request.arch)
            .args(&["packages", "pool"])
            .current_dir(request.tree_root)
            .run()
            .with_context(|| {
                format!(
                    "generating '{}' listing for '{}'",
                    request.arch, request.codename
                )
            })?;
        let text = String::from_utf8(stdout).context("apt-ftparchive emitted non-UTF-8 output")?;
        Ok(Stanza::parse_all(&text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn native_listing_filters_by_arch_and_keeps_all() {
        let tmp = TempDir::new().unwrap();
        let pool = tmp.path().join(POOL_SUBDIR);
        fs::create_dir_all(&pool).unwrap();
        let files = [
            "focal-foo_1.1_amd64.deb",
            "focal-foo_1.1_arm64.deb",
            "focal-docs_1.0_all.deb",
        ];
        for f in files {
            fs::write(pool.join(f), f.as_bytes()).unwrap();
        }
        let artifacts: Vec<_> = files.iter().map(|f| Artifact::new(&pool, f)).collect();

        let stanzas = NativeIndexer
            .listing(&ListingRequest {
                tree_root: tmp.path(),
                codename: "focal",
                arch: "amd64",
                artifacts: &artifacts,
            })
            .unwrap();

        let filenames: Vec<_> = stanzas.iter().filter_map(|s| s.get("Filename")).collect();
        assert_eq!(
            filenames,
            vec!["pool/main/focal-foo_1.1_amd64.deb", "pool/main/focal-docs_1.0_all.deb"]
        );
        assert_eq!(stanzas[0].get("Size"), Some("23"));
    }

    fn native_listing(pool_files: &[&str]) -> (TempDir, Result<Vec<Stanza>>) {
        let tmp = TempDir::new().unwrap();
        let pool = tmp.path().join(POOL_SUBDIR);
        fs::create_dir_all(&pool).unwrap();
        for f in pool_files {
            fs::write(pool.join(f), b"x").unwrap();
        }
        let artifacts: Vec<_> = pool_files.iter().map(|f| Artifact::new(&pool, f)).collect();
        let result = NativeIndexer.listing(&ListingRequest {
            tree_root: tmp.path(),
            codename: "focal",
            arch: "amd64",
            artifacts: &artifacts,
        });
        (tmp, result)
    }

    #[test]
    fn native_listing_skips_non_package_files() {
        let (_tmp, result) = native_listing(&[
            "focal-foo_1.1_amd64.buildinfo",
            "focal-foo_1.1_amd64.deb",
            "focal-readme.txt",
        ]);
        let stanzas = result.unwrap();
        let filenames: Vec<_> = stanzas.iter().filter_map(|s| s.get("Filename")).collect();
        assert_eq!(filenames, vec!["pool/main/focal-foo_1.1_amd64.deb"]);
    }

    #[test]
    fn native_listing_rejects_malformed_package_names() {
        let (_tmp, result) = native_listing(&["focal-foo_1.0.deb"]);
        assert!(result.is_err());
    }
}
