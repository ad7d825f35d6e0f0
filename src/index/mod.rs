//! Per-codename, per-architecture `Packages` indices.
//!
//! For each architecture the builder asks an [`IndexTool`] for the stanzas
//! compatible with it, sorts them, and writes
//! `dists/<codename>/<component>/binary-<arch>/Packages` plus `Packages.gz`.
//! An architecture with nothing to list has its whole `binary-<arch>`
//! directory removed so package managers see no index at all.

pub mod stanza;
pub mod tool;

use anyhow::{Context, Result};
use flate2::{Compression, GzBuilder};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::filesystem::{remove_dir_if_exists, write_atomic};
use crate::pool::Selection;
pub use stanza::Stanza;
pub use tool::{index_tool_for, AptFtparchive, IndexTool, ListingRequest, NativeIndexer};

pub const PACKAGES_FILE: &str = "Packages";
pub const PACKAGES_GZ_FILE: &str = "Packages.gz";

/// `dists/<codename>` under the tree root.
pub fn dist_dir(tree_root: &Path, codename: &str) -> PathBuf {
    tree_root.join("dists").join(codename)
}

/// One generated index file, addressed relative to `dists/<codename>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexFile {
    pub rel_path: String,
    pub path: PathBuf,
}

/// The generated listing for one (codename, architecture).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodenameIndex {
    pub codename: String,
    pub arch: String,
    pub package_count: usize,
    /// Uncompressed and compressed listing.
    pub files: Vec<IndexFile>,
}

/// Writes `Packages`/`Packages.gz` for a filtered pool view.
pub struct IndexBuilder {
    component: String,
    tool: Box<dyn IndexTool>,
}

impl std::fmt::Debug for IndexBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexBuilder")
            .field("component", &self.component)
            .field("tool", &self.tool.name())
            .finish()
    }
}

impl IndexBuilder {
    pub fn new(component: &str, tool: Box<dyn IndexTool>) -> Self {
        Self {
            component: component.to_string(),
            tool,
        }
    }

    fn arch_rel_dir(&self, arch: &str) -> String {
        format!("{}/binary-{}", self.component, arch)
    }

    /// Build the index for `arch`, or remove its directory and return `None`
    /// when no visible artifact is compatible.
    pub fn build(
        &self,
        tree_root: &Path,
        selection: &Selection<'_>,
        arch: &str,
    ) -> Result<Option<CodenameIndex>> {
        let codename = selection.codename();
        let dist = dist_dir(tree_root, codename);
        let rel_dir = self.arch_rel_dir(arch);
        let arch_dir = dist.join(&rel_dir);

        let artifacts = selection.artifacts();
        let mut stanzas = self
            .tool
            .listing(&ListingRequest {
                tree_root,
                codename,
                arch,
                artifacts: &artifacts,
            })
            .with_context(|| format!("{} listing for {}/{}", self.tool.name(), codename, arch))?;

        if stanzas.is_empty() {
            debug!(codename, arch, "no packages; removing architecture index");
            remove_dir_if_exists(&arch_dir)?;
            return Ok(None);
        }

        let listing = stanza::render_listing(&mut stanzas);
        let packages = arch_dir.join(PACKAGES_FILE);
        write_atomic(&packages, listing.as_bytes())?;
        let packages_gz = arch_dir.join(PACKAGES_GZ_FILE);
        write_atomic(&packages_gz, &gzip(listing.as_bytes())?)?;

        info!(codename, arch, packages = stanzas.len(), "wrote index");
        Ok(Some(CodenameIndex {
            codename: codename.to_string(),
            arch: arch.to_string(),
            package_count: stanzas.len(),
            files: vec![
                IndexFile {
                    rel_path: format!("{rel_dir}/{PACKAGES_FILE}"),
                    path: packages,
                },
                IndexFile {
                    rel_path: format!("{rel_dir}/{PACKAGES_GZ_FILE}"),
                    path: packages_gz,
                },
            ],
        }))
    }
}

/// Gzip with a zeroed header timestamp so identical input yields identical bytes.
pub fn gzip(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzBuilder::new()
        .mtime(0)
        .write(Vec::new(), Compression::best());
    encoder.write_all(bytes).context("compressing index")?;
    encoder.finish().context("finishing gzip stream")
}
