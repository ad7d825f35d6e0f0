//! Per-run metadata written next to the working tree.
//!
//! The manifest is rewritten atomically at the start of a run and again when
//! it finishes, so after a crash it still says `running` and names the last
//! codename that completed.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use time::OffsetDateTime;

use super::Step;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub flavour: String,
    pub status: RunStatus,
    pub started_at_utc: String,
    pub finished_at_utc: Option<String>,
    #[serde(default)]
    pub codenames_completed: Vec<String>,
    pub failed_step: Option<Step>,
    pub failed_codename: Option<String>,
    pub error: Option<String>,
}

impl RunManifest {
    pub fn start(flavour: &str, now: OffsetDateTime) -> Self {
        Self {
            run_id: format!("{}-{}", compact_utc(now), std::process::id()),
            flavour: flavour.to_string(),
            status: RunStatus::Running,
            started_at_utc: compact_utc(now),
            finished_at_utc: None,
            codenames_completed: Vec::new(),
            failed_step: None,
            failed_codename: None,
            error: None,
        }
    }

    pub fn succeed(&mut self, now: OffsetDateTime) {
        self.status = RunStatus::Success;
        self.finished_at_utc = Some(compact_utc(now));
    }

    pub fn fail(
        &mut self,
        step: Step,
        codename: Option<&str>,
        error: String,
        now: OffsetDateTime,
    ) {
        self.status = RunStatus::Failed;
        self.failed_step = Some(step);
        self.failed_codename = codename.map(str::to_string);
        self.error = Some(error);
        self.finished_at_utc = Some(compact_utc(now));
    }
}

/// `20261018T090500Z`
pub fn compact_utc(at: OffsetDateTime) -> String {
    let at = at.to_offset(time::UtcOffset::UTC);
    format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}Z",
        at.year(),
        at.month() as u8,
        at.day(),
        at.hour(),
        at.minute(),
        at.second()
    )
}

pub fn write_run_manifest(path: &Path, manifest: &RunManifest) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("path without parent '{}'", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("creating parent directory '{}'", parent.display()))?;
    let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
    let payload = serde_json::to_vec_pretty(manifest).context("serializing run manifest")?;
    fs::write(&tmp, payload).with_context(|| format!("writing temp file '{}'", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| {
        format!(
            "renaming temp file '{}' to '{}'",
            tmp.display(),
            path.display()
        )
    })?;
    Ok(())
}

/// Load the last run's manifest, if any run has happened.
pub fn load_run_manifest(path: &Path) -> Result<Option<RunManifest>> {
    if !path.is_file() {
        return Ok(None);
    }
    let bytes =
        fs::read(path).with_context(|| format!("reading run manifest '{}'", path.display()))?;
    let parsed = serde_json::from_slice(&bytes)
        .with_context(|| format!("parsing run manifest '{}'", path.display()))?;
    Ok(Some(parsed))
}
