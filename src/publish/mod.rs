//! Publish cycle orchestration.
//!
//! One run walks a fixed state machine:
//!
//! ```text
//! Idle -> Pulled -> Processing(codename)* -> Pushed -> Idle
//! ```
//!
//! Codenames are processed strictly in configured order against the single
//! shared pool. Any failure aborts the run immediately: remaining codenames
//! are skipped and the mirror is not pushed. The error names the step and,
//! when there is one, the codename.

pub mod lock;
pub mod manifest;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::config::{PublishConfig, RepositoryInfo};
use crate::index::{index_tool_for, IndexBuilder, IndexTool};
use crate::mirror::{mirror_for, Mirror};
use crate::pool::{inspect_holding, Admission, ArtifactName, HoldingReport, Pool};
use crate::preflight::{apt_tools, check_required_tools};
use crate::release::ReleaseComposer;
use crate::signer::{sign_release, GpgSigner, SignedRelease, Signer, SigningIdentity};
use lock::RunLock;
use manifest::{load_run_manifest, write_run_manifest, RunManifest};

pub const APT_TREE_DIR: &str = "apt-repo";
pub const APT_HOLDING_DIR: &str = "apt-pool-holding";
pub const APT_MANIFEST_FILE: &str = "apt-publish-run.json";
pub const LOCK_FILE: &str = ".publish.lock";

/// Pipeline step, used to report where a run failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Preflight,
    Credentials,
    Lock,
    Pull,
    Recover,
    Admit,
    Select,
    Index,
    Release,
    Sign,
    Restore,
    Push,
    Manifest,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Preflight => "preflight",
            Self::Credentials => "signing credentials",
            Self::Lock => "working directory lock",
            Self::Pull => "remote pull",
            Self::Recover => "pool recovery",
            Self::Admit => "artifact admission",
            Self::Select => "pool selection",
            Self::Index => "index generation",
            Self::Release => "release composition",
            Self::Sign => "release signing",
            Self::Restore => "pool restore",
            Self::Push => "remote push",
            Self::Manifest => "run manifest",
        };
        f.write_str(name)
    }
}

/// A fatal publish failure.
#[derive(Debug, Error)]
#[error("{step} failed{}", for_codename(.codename))]
pub struct PublishError {
    pub step: Step,
    pub codename: Option<String>,
    #[source]
    pub source: anyhow::Error,
}

fn for_codename(codename: &Option<String>) -> String {
    codename
        .as_ref()
        .map(|c| format!(" for codename '{c}'"))
        .unwrap_or_default()
}

/// Attach a [`Step`] to an `anyhow` result.
pub(crate) trait StepExt<T> {
    fn step(self, step: Step) -> Result<T, PublishError>;
    fn step_for(self, step: Step, codename: &str) -> Result<T, PublishError>;
}

impl<T> StepExt<T> for anyhow::Result<T> {
    fn step(self, step: Step) -> Result<T, PublishError> {
        self.map_err(|source| PublishError {
            step,
            codename: None,
            source,
        })
    }

    fn step_for(self, step: Step, codename: &str) -> Result<T, PublishError> {
        self.map_err(|source| PublishError {
            step,
            codename: Some(codename.to_string()),
            source,
        })
    }
}

/// Where a run is in its cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishState {
    Idle,
    Pulled,
    Processing(String),
    Pushed,
}

/// Working-directory layout for the APT flavour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkLayout {
    pub tree: PathBuf,
    pub holding: PathBuf,
    pub lock: PathBuf,
    pub manifest: PathBuf,
}

impl WorkLayout {
    pub fn apt(work_dir: &Path) -> Self {
        Self {
            tree: work_dir.join(APT_TREE_DIR),
            holding: work_dir.join(APT_HOLDING_DIR),
            lock: work_dir.join(LOCK_FILE),
            manifest: work_dir.join(APT_MANIFEST_FILE),
        }
    }
}

/// Inputs threaded explicitly through a run.
#[derive(Debug, Clone)]
pub struct PublishContext {
    pub work_dir: PathBuf,
    /// Stamped into every Release `Date:` field.
    pub released_at: OffsetDateTime,
    /// Freshly built packages to add to the pool this run.
    pub incoming: Vec<PathBuf>,
}

impl PublishContext {
    pub fn new(work_dir: &Path) -> anyhow::Result<Self> {
        Ok(Self {
            work_dir: work_dir.to_path_buf(),
            released_at: release_time_from_env()?,
            incoming: Vec::new(),
        })
    }

    pub fn with_incoming(mut self, incoming: Vec<PathBuf>) -> Self {
        self.incoming = incoming;
        self
    }
}

/// `SOURCE_DATE_EPOCH` when set, for reproducible Release files; now otherwise.
pub fn release_time_from_env() -> anyhow::Result<OffsetDateTime> {
    match std::env::var("SOURCE_DATE_EPOCH") {
        Ok(raw) => {
            let secs: i64 = raw
                .trim()
                .parse()
                .with_context(|| format!("SOURCE_DATE_EPOCH is not an integer: '{raw}'"))?;
            OffsetDateTime::from_unix_timestamp(secs)
                .with_context(|| format!("SOURCE_DATE_EPOCH out of range: {secs}"))
        }
        Err(_) => Ok(OffsetDateTime::now_utc()),
    }
}

/// What one codename iteration produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodenameReport {
    pub codename: String,
    pub architectures: Vec<String>,
    pub packages: usize,
    pub signed: SignedRelease,
}

/// Summary of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReport {
    pub run_id: String,
    pub admitted: Vec<String>,
    pub codenames: Vec<CodenameReport>,
    pub remote: String,
}

/// One-line summary, printed by the binary whatever the log filter.
impl fmt::Display for PublishReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "published {} codename(s) to {} (run {}, {} admitted)",
            self.codenames.len(),
            self.remote,
            self.run_id,
            self.admitted.len()
        )?;
        for codename in &self.codenames {
            write!(
                f,
                "; {}: {} package(s) [{}]",
                codename.codename,
                codename.packages,
                codename.architectures.join(",")
            )?;
        }
        Ok(())
    }
}

/// Publishes the multi-codename APT repository.
pub struct AptPublisher {
    info: RepositoryInfo,
    codenames: Vec<String>,
    architectures: Vec<String>,
    mirror: Box<dyn Mirror>,
    index: IndexBuilder,
    signer: Box<dyn Signer>,
}

impl fmt::Debug for AptPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AptPublisher")
            .field("codenames", &self.codenames)
            .field("architectures", &self.architectures)
            .field("remote", &self.mirror.remote())
            .field("index", &self.index)
            .finish()
    }
}

impl AptPublisher {
    pub fn new(
        info: RepositoryInfo,
        codenames: Vec<String>,
        architectures: Vec<String>,
        mirror: Box<dyn Mirror>,
        index_tool: Box<dyn IndexTool>,
        signer: Box<dyn Signer>,
    ) -> Self {
        let index = IndexBuilder::new(&info.component, index_tool);
        Self {
            info,
            codenames,
            architectures,
            mirror,
            index,
            signer,
        }
    }

    /// Wire the real collaborators for `config`.
    ///
    /// Fails before anything is touched when host tools or signing
    /// credentials are missing.
    pub fn from_config(config: &PublishConfig) -> Result<Self, PublishError> {
        let apt = config.apt().step(Step::Preflight)?;
        check_required_tools(&apt_tools(apt)).step(Step::Preflight)?;
        let identity = SigningIdentity::from_env(&config.signing).step(Step::Credentials)?;
        Ok(Self::new(
            config.repository.clone(),
            apt.codenames.clone(),
            apt.architectures.clone(),
            mirror_for(&apt.remote),
            index_tool_for(apt.index_tool),
            Box::new(GpgSigner::new(identity)),
        ))
    }

    /// Run one full cycle. The run manifest records the outcome either way.
    pub fn publish(&self, ctx: &PublishContext) -> Result<PublishReport, PublishError> {
        let layout = WorkLayout::apt(&ctx.work_dir);
        let _lock = RunLock::acquire(&layout.lock).step(Step::Lock)?;

        let mut manifest = RunManifest::start("apt", OffsetDateTime::now_utc());
        write_run_manifest(&layout.manifest, &manifest).step(Step::Manifest)?;

        let result = self.run_cycle(ctx, &layout, &mut manifest);
        match &result {
            Ok(_) => manifest.succeed(OffsetDateTime::now_utc()),
            Err(e) => manifest.fail(
                e.step,
                e.codename.as_deref(),
                format!("{:#}", e.source),
                OffsetDateTime::now_utc(),
            ),
        }
        if let Err(e) = write_run_manifest(&layout.manifest, &manifest) {
            warn!(error = %format!("{e:#}"), "failed to record run manifest");
        }
        result
    }

    fn run_cycle(
        &self,
        ctx: &PublishContext,
        layout: &WorkLayout,
        manifest: &mut RunManifest,
    ) -> Result<PublishReport, PublishError> {
        let mut state = PublishState::Idle;
        info!(run_id = %manifest.run_id, remote = %self.mirror.remote(), ?state, "starting publish run");

        self.mirror.pull(&layout.tree).step(Step::Pull)?;
        state = transition(state, PublishState::Pulled);

        let pool = Pool::open(&layout.tree, &layout.holding).step(Step::Recover)?;
        let admitted = self.admit(&pool, &ctx.incoming).step(Step::Admit)?;
        let before = pool.fingerprint().step(Step::Recover)?;

        let composer = ReleaseComposer::new(self.info.clone(), ctx.released_at);
        let mut codenames = Vec::new();
        for codename in &self.codenames {
            state = transition(state, PublishState::Processing(codename.clone()));
            let report = self.process_codename(&pool, &layout.tree, &composer, codename)?;
            manifest.codenames_completed.push(codename.clone());
            codenames.push(report);
        }

        let after = pool.fingerprint().step(Step::Restore)?;
        ensure_pool_closed(&before, &after).step(Step::Restore)?;

        self.mirror.push(&layout.tree).step(Step::Push)?;
        state = transition(state, PublishState::Pushed);
        transition(state, PublishState::Idle);

        Ok(PublishReport {
            run_id: manifest.run_id.clone(),
            admitted,
            codenames,
            remote: self.mirror.remote(),
        })
    }

    fn admit(&self, pool: &Pool, incoming: &[PathBuf]) -> anyhow::Result<Vec<String>> {
        let mut admitted = Vec::new();
        for path in incoming {
            let file_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| anyhow::anyhow!("artifact path '{}' has no file name", path.display()))?;
            ArtifactName::parse_any(file_name, &self.codenames)?;
            if !path.is_file() {
                bail!("artifact '{}' does not exist", path.display());
            }
            if pool.admit(path)? == Admission::Added {
                admitted.push(file_name.to_string());
            }
        }
        Ok(admitted)
    }

    fn process_codename(
        &self,
        pool: &Pool,
        tree: &Path,
        composer: &ReleaseComposer,
        codename: &str,
    ) -> Result<CodenameReport, PublishError> {
        let selection = pool
            .select_for_codename(codename)
            .step_for(Step::Select, codename)?;

        // `selection` restores the pool on drop if anything below fails.
        let mut indices = Vec::new();
        for arch in &self.architectures {
            if let Some(index) = self
                .index
                .build(tree, &selection, arch)
                .step_for(Step::Index, codename)?
            {
                indices.push(index);
            }
        }

        let release = composer
            .compose(tree, codename, &indices)
            .step_for(Step::Release, codename)?;
        let signed = sign_release(self.signer.as_ref(), &release).step_for(Step::Sign, codename)?;

        selection.restore_full().step_for(Step::Restore, codename)?;

        Ok(CodenameReport {
            codename: codename.to_string(),
            architectures: release.architectures,
            packages: indices.iter().map(|i| i.package_count).sum(),
            signed,
        })
    }
}

fn transition(from: PublishState, to: PublishState) -> PublishState {
    info!(from = ?from, to = ?to, "publish state");
    to
}

fn ensure_pool_closed(
    before: &BTreeMap<String, String>,
    after: &BTreeMap<String, String>,
) -> anyhow::Result<()> {
    if before == after {
        return Ok(());
    }
    let missing: Vec<_> = before.keys().filter(|k| !after.contains_key(*k)).collect();
    let changed: Vec<_> = before
        .iter()
        .filter(|(k, v)| after.get(*k).is_some_and(|a| a != *v))
        .map(|(k, _)| k)
        .collect();
    let extra: Vec<_> = after.keys().filter(|k| !before.contains_key(*k)).collect();
    bail!(
        "pool changed during the cycle (missing: {:?}, changed: {:?}, unexpected: {:?})",
        missing,
        changed,
        extra
    )
}

/// Check a stale holding area without publishing.
///
/// Nothing is moved: the local tree is replaced by the next pull, so held
/// files stay put until the next [`AptPublisher::publish`] merges them after
/// pulling. Conflicting copies are reported as an error.
pub fn recover(work_dir: &Path) -> Result<HoldingReport, PublishError> {
    let layout = WorkLayout::apt(work_dir);
    let _lock = RunLock::acquire(&layout.lock).step(Step::Lock)?;
    let report = inspect_holding(&layout.tree, &layout.holding).step(Step::Recover)?;
    if !report.conflicts.is_empty() {
        return Err(PublishError {
            step: Step::Recover,
            codename: None,
            source: anyhow::anyhow!(
                "held artifacts differ from the pool copy and need manual resolution: {:?}",
                report.conflicts
            ),
        });
    }
    info!(
        pending = report.pending.len(),
        duplicates = report.duplicates.len(),
        "holding area checked; the next publish merges it after pulling"
    );
    Ok(report)
}

/// Manifest of the most recent APT run in `work_dir`.
pub fn last_run(work_dir: &Path) -> anyhow::Result<Option<RunManifest>> {
    load_run_manifest(&WorkLayout::apt(work_dir).manifest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_names_step_and_codename() {
        let failed: anyhow::Result<()> = Err(anyhow::anyhow!("gpg exited 2"));
        let err = failed.step_for(Step::Sign, "focal").unwrap_err();
        assert_eq!(err.to_string(), "release signing failed for codename 'focal'");
        assert_eq!(
            std::error::Error::source(&err).map(|s| s.to_string()),
            Some("gpg exited 2".to_string())
        );

        let failed: anyhow::Result<()> = Err(anyhow::anyhow!("no aws"));
        assert_eq!(failed.step(Step::Preflight).unwrap_err().to_string(), "preflight failed");
    }

    #[test]
    fn pool_closure_check_reports_differences() {
        let before: BTreeMap<_, _> = [("a.deb".to_string(), "1".to_string())].into();
        let mut after = before.clone();
        assert!(ensure_pool_closed(&before, &after).is_ok());

        after.insert("a.deb".into(), "2".into());
        let err = ensure_pool_closed(&before, &after).unwrap_err().to_string();
        assert!(err.contains("changed: [\"a.deb\"]"), "{err}");
    }

    #[test]
    fn layout_keeps_holding_area_outside_pushed_tree() {
        let layout = WorkLayout::apt(Path::new("/work"));
        assert_eq!(layout.tree, Path::new("/work/apt-repo"));
        assert!(!layout.holding.starts_with(&layout.tree));
    }
}
