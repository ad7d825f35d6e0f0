//! RPM repository publishing.
//!
//! Much simpler than the APT side: a single flat repository whose metadata
//! `createrepo` regenerates in place. The signature covers
//! `repodata/repomd.xml` and a `.repo` definition file is written at the
//! root so clients can add the repository with one download.

use anyhow::{Context, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tracing::info;

use crate::config::{PublishConfig, RpmConfig};
use crate::filesystem::{remove_file_if_exists, write_atomic};
use crate::mirror::{mirror_for, Mirror};
use crate::preflight::{check_required_tools, rpm_tools};
use crate::process::Tool;
use crate::publish::lock::RunLock;
use crate::publish::manifest::{write_run_manifest, RunManifest};
use crate::publish::{PublishError, Step, StepExt, LOCK_FILE};
use crate::signer::{GpgSigner, Signer, SigningIdentity};

pub const RPM_TREE_DIR: &str = "rpm-repo";
pub const RPM_MANIFEST_FILE: &str = "rpm-publish-run.json";
pub const REPOMD_FILE: &str = "repodata/repomd.xml";
pub const REPOMD_SIGNATURE_FILE: &str = "repodata/repomd.xml.asc";

/// Regenerates `repodata/` for a directory of `.rpm` files.
pub trait RepodataTool {
    fn update(&self, repo: &Path) -> Result<()>;
}

/// `createrepo --update .`
#[derive(Debug, Clone, Copy, Default)]
pub struct Createrepo;

impl RepodataTool for Createrepo {
    fn update(&self, repo: &Path) -> Result<()> {
        Tool::new("createrepo")
            .args(&["--update", "."])
            .current_dir(repo)
            .run()
            .with_context(|| format!("updating repodata in '{}'", repo.display()))?;
        Ok(())
    }
}

/// Summary of a successful RPM run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpmReport {
    pub repomd: PathBuf,
    pub signature: PathBuf,
    pub repo_file: PathBuf,
    pub remote: String,
}

pub struct RpmPublisher {
    config: RpmConfig,
    mirror: Box<dyn Mirror>,
    repodata: Box<dyn RepodataTool>,
    signer: Box<dyn Signer>,
}

impl fmt::Debug for RpmPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpmPublisher")
            .field("repo_id", &self.config.repo_id)
            .field("remote", &self.mirror.remote())
            .finish()
    }
}

impl RpmPublisher {
    pub fn new(
        config: RpmConfig,
        mirror: Box<dyn Mirror>,
        repodata: Box<dyn RepodataTool>,
        signer: Box<dyn Signer>,
    ) -> Self {
        Self {
            config,
            mirror,
            repodata,
            signer,
        }
    }

    pub fn from_config(config: &PublishConfig) -> Result<Self, PublishError> {
        let rpm = config.rpm().step(Step::Preflight)?;
        check_required_tools(&rpm_tools(rpm)).step(Step::Preflight)?;
        let identity = SigningIdentity::from_env(&config.signing).step(Step::Credentials)?;
        Ok(Self::new(
            rpm.clone(),
            mirror_for(&rpm.remote),
            Box::new(Createrepo),
            Box::new(GpgSigner::new(identity)),
        ))
    }

    pub fn publish(&self, work_dir: &Path) -> Result<RpmReport, PublishError> {
        let _lock = RunLock::acquire(&work_dir.join(LOCK_FILE)).step(Step::Lock)?;
        let manifest_path = work_dir.join(RPM_MANIFEST_FILE);
        let mut manifest = RunManifest::start("rpm", OffsetDateTime::now_utc());
        write_run_manifest(&manifest_path, &manifest).step(Step::Manifest)?;

        let result = self.run_cycle(&work_dir.join(RPM_TREE_DIR));
        match &result {
            Ok(_) => manifest.succeed(OffsetDateTime::now_utc()),
            Err(e) => manifest.fail(
                e.step,
                None,
                format!("{:#}", e.source),
                OffsetDateTime::now_utc(),
            ),
        }
        write_run_manifest(&manifest_path, &manifest).step(Step::Manifest)?;
        result
    }

    fn run_cycle(&self, repo: &Path) -> Result<RpmReport, PublishError> {
        info!(remote = %self.mirror.remote(), "starting rpm publish run");
        self.mirror.pull(repo).step(Step::Pull)?;
        self.repodata.update(repo).step(Step::Index)?;

        let repomd = repo.join(REPOMD_FILE);
        let signature = repo.join(REPOMD_SIGNATURE_FILE);
        self.sign_repomd(&repomd, &signature).step(Step::Sign)?;

        let repo_file = repo.join(format!("{}.repo", self.config.repo_id));
        write_atomic(&repo_file, render_repo_file(&self.config).as_bytes())
            .step(Step::Release)?;

        self.mirror.push(repo).step(Step::Push)?;
        info!(repo_id = %self.config.repo_id, "rpm repository published");
        Ok(RpmReport {
            repomd,
            signature,
            repo_file,
            remote: self.mirror.remote(),
        })
    }

    fn sign_repomd(&self, repomd: &Path, signature: &Path) -> Result<()> {
        remove_file_if_exists(signature)?;
        if !repomd.is_file() {
            anyhow::bail!("'{}' was not produced", repomd.display());
        }
        let result = self
            .signer
            .detach_sign(repomd)
            .and_then(|bytes| write_atomic(signature, &bytes))
            .and_then(|()| self.signer.verify_detached(repomd, signature));
        if result.is_err() {
            remove_file_if_exists(signature)?;
        }
        result.with_context(|| format!("signing '{}'", repomd.display()))
    }
}

impl fmt::Display for RpmReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "published rpm repository to {} ({})",
            self.remote,
            self.repo_file.display()
        )
    }
}

/// yum/dnf repository definition.
pub fn render_repo_file(config: &RpmConfig) -> String {
    format!(
        "[{}]\nname={}\nbaseurl={}\nenabled=1\ngpgcheck=1\ngpgkey={}\n",
        config.repo_id, config.name, config.base_url, config.gpg_key_url
    )
}
