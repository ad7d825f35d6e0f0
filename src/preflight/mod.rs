//! Preflight checks for publish runs.
//!
//! Validates that the host has the external tools the configured
//! collaborators shell out to, before anything is pulled or modified.
//!
//! # Example
//!
//! ```rust
//! use repo_publisher::preflight::{command_exists, check_required_tools};
//!
//! if !command_exists("gpg") {
//!     println!("gnupg not installed");
//! }
//!
//! let tools = &[("gpg", "gnupg"), ("apt-ftparchive", "apt-utils")];
//! if let Err(e) = check_required_tools(tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use anyhow::{bail, Result};

use crate::config::{AptConfig, IndexToolKind, RpmConfig};
use crate::mirror::RemoteLocation;

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Signing tool required by every publish run.
pub const SIGNING_TOOLS: &[(&str, &str)] = &[("gpg", "gnupg")];

/// Check that specific tools are available.
///
/// Each tuple is (command, package). All missing tools are reported at once.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let mut missing = Vec::new();

    for (tool, package) in tools {
        if !command_exists(tool) {
            missing.push((*tool, *package));
        }
    }

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

/// Tools needed to publish the APT repository with this configuration.
pub fn apt_tools(config: &AptConfig) -> Vec<(&'static str, &'static str)> {
    let mut tools = SIGNING_TOOLS.to_vec();
    tools.extend(mirror_tools(&config.remote));
    if config.index_tool == IndexToolKind::AptFtparchive {
        tools.push(("apt-ftparchive", "apt-utils"));
    }
    tools
}

/// Tools needed to publish the RPM repository with this configuration.
pub fn rpm_tools(config: &RpmConfig) -> Vec<(&'static str, &'static str)> {
    let mut tools = SIGNING_TOOLS.to_vec();
    tools.extend(mirror_tools(&config.remote));
    tools.push(("createrepo", "createrepo_c"));
    tools
}

fn mirror_tools(remote: &RemoteLocation) -> Option<(&'static str, &'static str)> {
    match remote {
        RemoteLocation::S3(_) => Some(("aws", "awscli")),
        RemoteLocation::Rsync(_) => Some(("rsync", "rsync")),
        RemoteLocation::Local(_) => None,
    }
}
