//! The shared artifact pool and its codename filter/restore protocol.
//!
//! All codenames share one flat `pool/main` directory. Index generation must
//! only see the artifacts tagged for the codename being processed, so before
//! each codename the other artifacts are moved into a holding area outside
//! the repository tree and moved back afterwards.
//!
//! The holding area must be empty whenever a new filter starts. A run that
//! crashed between select and restore leaves it populated; [`Pool::open`]
//! merges such leftovers back before anything else touches the pool. The
//! publisher opens the pool only after pulling, so the pull can never
//! delete an artifact that was held at the time of the crash.
//!
//! ```text
//! <tree>/pool/main/      visible artifacts
//! <holding>/             artifacts hidden for the current codename
//! ```

pub mod artifact;

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::filesystem::{atomic_rename, digest_file, list_file_names};
pub use artifact::{compare_versions, has_codename_tag, is_package_file, Artifact, ArtifactName};

/// Pool path relative to the repository tree root.
pub const POOL_SUBDIR: &str = "pool/main";

/// Which pool files stay visible for a codename and which are held back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolPartition {
    pub keep: Vec<String>,
    pub hold: Vec<String>,
}

/// Split `names` by the codename tag. Pure; order of `names` is preserved.
pub fn partition(names: &[String], codename: &str) -> PoolPartition {
    let mut out = PoolPartition::default();
    for name in names {
        if has_codename_tag(name, codename) {
            out.keep.push(name.clone());
        } else {
            out.hold.push(name.clone());
        }
    }
    out
}

/// Outcome of admitting an artifact into the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Added,
    AlreadyPresent,
}

/// Leftovers of an interrupted run, compared against the local pool copy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HoldingReport {
    /// Held files with no same-named file in the pool.
    pub pending: Vec<String>,
    /// Held files byte-identical to the pool copy.
    pub duplicates: Vec<String>,
    /// Held files whose bytes differ from the pool copy.
    pub conflicts: Vec<String>,
}

impl HoldingReport {
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.duplicates.is_empty() && self.conflicts.is_empty()
    }
}

/// Classify the holding area without moving anything.
///
/// The local tree is replaced by the next pull, so held files must stay in
/// the holding area until [`Pool::open`] runs after that pull.
pub fn inspect_holding(tree_root: &Path, holding: &Path) -> Result<HoldingReport> {
    let dir = tree_root.join(POOL_SUBDIR);
    let mut report = HoldingReport::default();
    for name in list_file_names(holding)? {
        let pooled = dir.join(&name);
        if !pooled.is_file() {
            report.pending.push(name);
        } else if digest_file(&pooled)?.sha256 == digest_file(&holding.join(&name))?.sha256 {
            report.duplicates.push(name);
        } else {
            report.conflicts.push(name);
        }
    }
    Ok(report)
}

/// The flat artifact directory plus its holding area.
#[derive(Debug)]
pub struct Pool {
    dir: PathBuf,
    holding: PathBuf,
}

impl Pool {
    /// Open the pool inside `tree_root`, merging any stale holding area.
    pub fn open(tree_root: &Path, holding: &Path) -> Result<Self> {
        let dir = tree_root.join(POOL_SUBDIR);
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating pool directory '{}'", dir.display()))?;
        fs::create_dir_all(holding)
            .with_context(|| format!("creating holding area '{}'", holding.display()))?;
        let pool = Self {
            dir,
            holding: holding.to_path_buf(),
        };
        let merged = pool.restore_full()?;
        if merged > 0 {
            warn!(
                merged,
                holding = %pool.holding.display(),
                "merged stale holding area left by an interrupted run"
            );
        }
        Ok(pool)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn holding_dir(&self) -> &Path {
        &self.holding
    }

    /// Artifacts currently visible in the pool, sorted by filename.
    pub fn artifacts(&self) -> Result<Vec<Artifact>> {
        Ok(list_file_names(&self.dir)?
            .iter()
            .map(|name| Artifact::new(&self.dir, name))
            .collect())
    }

    /// Filenames currently in the holding area.
    pub fn held(&self) -> Result<Vec<String>> {
        list_file_names(&self.holding)
    }

    /// Filename -> SHA256 of every visible artifact.
    pub fn fingerprint(&self) -> Result<BTreeMap<String, String>> {
        let mut out = BTreeMap::new();
        for artifact in self.artifacts()? {
            out.insert(artifact.file_name.clone(), artifact.digest()?.sha256);
        }
        Ok(out)
    }

    /// Copy a built package into the pool.
    ///
    /// Pool content is immutable: a same-named file with different bytes is
    /// rejected, an identical one is a no-op.
    pub fn admit(&self, source: &Path) -> Result<Admission> {
        let file_name = source
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow::anyhow!("artifact path '{}' has no file name", source.display()))?;
        let dest = self.dir.join(file_name);
        if dest.exists() {
            if digest_file(&dest)?.sha256 == digest_file(source)?.sha256 {
                debug!(artifact = file_name, "artifact already in pool");
                return Ok(Admission::AlreadyPresent);
            }
            bail!(
                "pool already contains '{}' with different content; published artifacts are immutable",
                file_name
            );
        }
        let tmp = self.dir.join(format!(".{file_name}.admit-tmp"));
        fs::copy(source, &tmp).with_context(|| {
            format!("copying '{}' into pool '{}'", source.display(), tmp.display())
        })?;
        atomic_rename(&tmp, &dest)?;
        info!(artifact = file_name, "admitted artifact into pool");
        Ok(Admission::Added)
    }

    /// Hide every artifact not tagged for `codename`.
    ///
    /// Returns a guard; dropping it without calling
    /// [`Selection::restore_full`] still restores the pool.
    pub fn select_for_codename<'p>(&'p self, codename: &str) -> Result<Selection<'p>> {
        let stale = self.held()?;
        if !stale.is_empty() {
            bail!(
                "holding area '{}' is not empty ({} files); refusing to filter for '{}'",
                self.holding.display(),
                stale.len(),
                codename
            );
        }

        let names = list_file_names(&self.dir)?;
        let plan = partition(&names, codename);
        let selection = Selection {
            pool: self,
            codename: codename.to_string(),
            visible: plan.keep,
            restored: false,
        };
        for name in &plan.hold {
            let from = self.dir.join(name);
            let to = self.holding.join(name);
            // On error the guard drops and moves back whatever was already held.
            atomic_rename(&from, &to)
                .with_context(|| format!("holding '{}' for '{}'", name, codename))?;
        }
        debug!(
            codename,
            visible = selection.visible.len(),
            held = plan.hold.len(),
            "pool filtered"
        );
        Ok(selection)
    }

    /// Move every held file back into the pool. Returns how many were moved.
    ///
    /// A held file whose name already exists in the pool (possible only after
    /// a crash followed by a fresh pull) is dropped if identical and is an
    /// error if the bytes differ.
    pub fn restore_full(&self) -> Result<usize> {
        let mut moved = 0;
        for name in self.held()? {
            let from = self.holding.join(&name);
            let to = self.dir.join(&name);
            if to.exists() {
                if digest_file(&from)?.sha256 != digest_file(&to)?.sha256 {
                    bail!(
                        "held artifact '{}' conflicts with pool copy '{}'; resolve manually",
                        from.display(),
                        to.display()
                    );
                }
                fs::remove_file(&from)
                    .with_context(|| format!("removing duplicate '{}'", from.display()))?;
                continue;
            }
            atomic_rename(&from, &to)?;
            moved += 1;
        }
        Ok(moved)
    }
}

/// A codename-filtered view of the pool. Restores full membership on drop.
#[derive(Debug)]
pub struct Selection<'p> {
    pool: &'p Pool,
    codename: String,
    visible: Vec<String>,
    restored: bool,
}

impl Selection<'_> {
    pub fn codename(&self) -> &str {
        &self.codename
    }

    /// Directory containing exactly the visible artifacts.
    pub fn dir(&self) -> &Path {
        self.pool.dir()
    }

    /// Visible artifacts, sorted by filename.
    pub fn artifacts(&self) -> Vec<Artifact> {
        self.visible
            .iter()
            .map(|name| Artifact::new(self.pool.dir(), name))
            .collect()
    }

    /// Restore full pool membership, reporting failures.
    pub fn restore_full(mut self) -> Result<()> {
        self.restored = true;
        self.pool
            .restore_full()
            .with_context(|| format!("restoring pool after codename '{}'", self.codename))?;
        Ok(())
    }
}

impl Drop for Selection<'_> {
    fn drop(&mut self) {
        if self.restored {
            return;
        }
        if let Err(e) = self.pool.restore_full() {
            warn!(
                codename = %self.codename,
                error = %format!("{e:#}"),
                "failed to restore pool; next run will merge the holding area"
            );
        }
    }
}
