//! Publish configuration loaded from a TOML file.
//!
//! The file names the repository identity, the ordered codename list, the
//! supported architectures, the remote locations and which environment
//! variables hold the signing credentials. Everything is validated once here
//! so the pipeline can treat the loaded values as trusted.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use crate::mirror::RemoteLocation;

pub const DEFAULT_COMPONENT: &str = "main";
pub const DEFAULT_KEY_ENV: &str = "PGP_KEY_NAME";
pub const DEFAULT_PASSPHRASE_ENV: &str = "PGP_KEY_PASSWD";

/// Architecture name used by packages that install on any CPU.
pub const ARCH_INDEPENDENT: &str = "all";

/// Static fields written into every Release descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryInfo {
    pub origin: String,
    pub label: String,
    pub version: String,
    pub description: String,
    pub component: String,
}

/// Which collaborator produces the `Packages` listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IndexToolKind {
    /// In-process listing derived from pool filenames and content digests.
    /// Omits `Depends`, `Maintainer` and the rest of the control data, so
    /// clients cannot resolve dependencies. Opt-in only.
    Native,
    /// `apt-ftparchive packages`, reading control data from each `.deb`.
    #[default]
    AptFtparchive,
}

#[derive(Debug, Clone)]
pub struct AptConfig {
    pub remote: RemoteLocation,
    pub codenames: Vec<String>,
    pub architectures: Vec<String>,
    pub index_tool: IndexToolKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningConfig {
    pub key_env: String,
    pub passphrase_env: String,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            key_env: DEFAULT_KEY_ENV.to_string(),
            passphrase_env: DEFAULT_PASSPHRASE_ENV.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RpmConfig {
    pub remote: RemoteLocation,
    pub name: String,
    pub repo_id: String,
    pub base_url: String,
    pub gpg_key_url: String,
}

/// Fully validated configuration.
#[derive(Debug, Clone)]
pub struct PublishConfig {
    pub repository: RepositoryInfo,
    pub apt: Option<AptConfig>,
    pub rpm: Option<RpmConfig>,
    pub signing: SigningConfig,
}

impl PublishConfig {
    pub fn apt(&self) -> Result<&AptConfig> {
        self.apt
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("configuration has no [apt] section"))
    }

    pub fn rpm(&self) -> Result<&RpmConfig> {
        self.rpm
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("configuration has no [rpm] section"))
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PublishToml {
    repository: RepositoryToml,
    apt: Option<AptToml>,
    rpm: Option<RpmToml>,
    signing: Option<SigningToml>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RepositoryToml {
    origin: String,
    label: String,
    version: String,
    description: String,
    component: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AptToml {
    remote: String,
    codenames: Vec<String>,
    architectures: Vec<String>,
    #[serde(default)]
    index_tool: IndexToolKind,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SigningToml {
    key_env: Option<String>,
    passphrase_env: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RpmToml {
    remote: String,
    name: String,
    repo_id: String,
    base_url: String,
    gpg_key_url: String,
}

/// Load and validate a configuration file.
///
/// Relative local remotes resolve against the directory holding the file.
pub fn load_config(path: &Path) -> Result<PublishConfig> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading publish config '{}'", path.display()))?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    parse_config(&text, base_dir)
        .with_context(|| format!("invalid publish config '{}'", path.display()))
}

/// Parse configuration text; `base_dir` anchors relative local remotes.
pub fn parse_config(text: &str, base_dir: &Path) -> Result<PublishConfig> {
    let parsed: PublishToml = toml::from_str(text).context("parsing TOML")?;

    let repo = parsed.repository;
    let component = repo
        .component
        .unwrap_or_else(|| DEFAULT_COMPONENT.to_string());
    validate_segment(&component, "repository.component")?;
    let repository = RepositoryInfo {
        origin: single_line(repo.origin, "repository.origin")?,
        label: single_line(repo.label, "repository.label")?,
        version: single_line(repo.version, "repository.version")?,
        description: single_line(repo.description, "repository.description")?,
        component,
    };

    let apt = parsed
        .apt
        .map(|apt| -> Result<AptConfig> {
            Ok(AptConfig {
                remote: RemoteLocation::parse(&apt.remote, base_dir)?,
                codenames: validate_codenames(apt.codenames)?,
                architectures: validate_architectures(apt.architectures)?,
                index_tool: apt.index_tool,
            })
        })
        .transpose()?;

    let rpm = parsed
        .rpm
        .map(|rpm| -> Result<RpmConfig> {
            validate_segment(&rpm.repo_id, "rpm.repo_id")?;
            Ok(RpmConfig {
                remote: RemoteLocation::parse(&rpm.remote, base_dir)?,
                name: single_line(rpm.name, "rpm.name")?,
                repo_id: rpm.repo_id,
                base_url: single_line(rpm.base_url, "rpm.base_url")?,
                gpg_key_url: single_line(rpm.gpg_key_url, "rpm.gpg_key_url")?,
            })
        })
        .transpose()?;

    if apt.is_none() && rpm.is_none() {
        bail!("at least one of [apt] or [rpm] must be configured");
    }

    let signing = match parsed.signing {
        Some(s) => SigningConfig {
            key_env: s.key_env.unwrap_or_else(|| DEFAULT_KEY_ENV.to_string()),
            passphrase_env: s
                .passphrase_env
                .unwrap_or_else(|| DEFAULT_PASSPHRASE_ENV.to_string()),
        },
        None => SigningConfig::default(),
    };

    Ok(PublishConfig {
        repository,
        apt,
        rpm,
        signing,
    })
}

fn validate_codenames(codenames: Vec<String>) -> Result<Vec<String>> {
    let codenames = validate_list(codenames, "apt.codenames")?;
    // Pool membership is decided by the `{codename}-` filename prefix, so one
    // codename must never be a tag prefix of another.
    for a in &codenames {
        for b in &codenames {
            if a != b && b.starts_with(&format!("{a}-")) {
                bail!(
                    "apt.codenames: '{}' is ambiguous with '{}' (pool tags use the '{}-' prefix)",
                    b,
                    a,
                    a
                );
            }
        }
    }
    Ok(codenames)
}

fn validate_architectures(architectures: Vec<String>) -> Result<Vec<String>> {
    let architectures = validate_list(architectures, "apt.architectures")?;
    if architectures.iter().any(|a| a == ARCH_INDEPENDENT) {
        bail!(
            "apt.architectures: '{}' is not a target architecture; such packages are listed under every architecture",
            ARCH_INDEPENDENT
        );
    }
    Ok(architectures)
}

/// Trim, reject empties/duplicates, keep configured order.
fn validate_list(values: Vec<String>, field: &str) -> Result<Vec<String>> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::with_capacity(values.len());
    for raw in values {
        let value = raw.trim().to_string();
        validate_segment(&value, field)?;
        if !seen.insert(value.clone()) {
            bail!("{field}: duplicate entry '{}'", value);
        }
        out.push(value);
    }
    if out.is_empty() {
        bail!("{field} must not be empty");
    }
    Ok(out)
}

fn validate_segment(value: &str, field: &str) -> Result<()> {
    if value.is_empty() {
        bail!("{field}: empty value");
    }
    if value.contains('/') || value.contains('\\') || value.contains("..") {
        bail!("{field}: '{}' must be a safe path segment", value);
    }
    if value.chars().any(|c| c.is_whitespace() || c == '_') {
        bail!("{field}: '{}' must not contain whitespace or '_'", value);
    }
    Ok(())
}

fn single_line(value: String, field: &str) -> Result<String> {
    let value = value.trim().to_string();
    if value.is_empty() {
        bail!("{field} must not be empty");
    }
    if value.contains('\n') || value.contains('\r') {
        bail!("{field} must be a single line");
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const BASE: &str = r#"
[repository]
origin = "example.com repository"
label = "example.com"
version = "1.0"
description = "Software repository for example.com"
"#;

    fn with_apt(apt: &str) -> String {
        format!("{BASE}\n[apt]\n{apt}")
    }

    #[test]
    fn parses_minimal_apt_config_with_defaults() {
        let text = with_apt(
            r#"remote = "s3://bucket/apt-repo"
codenames = ["bullseye", "focal", "jammy"]
architectures = ["amd64", "arm64"]
"#,
        );
        let config = parse_config(&text, Path::new("/etc/publish")).unwrap();
        let apt = config.apt().unwrap();
        assert_eq!(apt.codenames, vec!["bullseye", "focal", "jammy"]);
        assert_eq!(apt.architectures, vec!["amd64", "arm64"]);
        assert_eq!(apt.index_tool, IndexToolKind::AptFtparchive);
        assert_eq!(apt.remote, RemoteLocation::S3("s3://bucket/apt-repo".into()));
        assert_eq!(config.repository.component, "main");
        assert_eq!(config.signing, SigningConfig::default());
        assert!(config.rpm().is_err());
    }

    #[test]
    fn local_remote_resolves_against_config_dir() {
        let text = with_apt(
            r#"remote = "mirror/apt"
codenames = ["focal"]
architectures = ["amd64"]
index_tool = "native"
"#,
        );
        let config = parse_config(&text, Path::new("/etc/publish")).unwrap();
        let apt = config.apt().unwrap();
        assert_eq!(
            apt.remote,
            RemoteLocation::Local(PathBuf::from("/etc/publish/mirror/apt"))
        );
        assert_eq!(apt.index_tool, IndexToolKind::Native);
    }

    #[test]
    fn rejects_unknown_fields() {
        let text = with_apt(
            r#"remote = "s3://bucket/apt"
codenames = ["focal"]
architectures = ["amd64"]
flavour = "extra"
"#,
        );
        assert!(parse_config(&text, Path::new(".")).is_err());
    }

    #[test]
    fn rejects_duplicate_and_ambiguous_codenames() {
        let dup = with_apt(
            r#"remote = "s3://b/a"
codenames = ["focal", "focal"]
architectures = ["amd64"]
"#,
        );
        assert!(parse_config(&dup, Path::new(".")).is_err());

        let ambiguous = with_apt(
            r#"remote = "s3://b/a"
codenames = ["bookworm", "bookworm-backports"]
architectures = ["amd64"]
"#,
        );
        let err = format!("{:#}", parse_config(&ambiguous, Path::new(".")).unwrap_err());
        assert!(err.contains("ambiguous"), "{err}");
    }

    #[test]
    fn rejects_all_as_target_architecture() {
        let text = with_apt(
            r#"remote = "s3://b/a"
codenames = ["focal"]
architectures = ["amd64", "all"]
"#,
        );
        assert!(parse_config(&text, Path::new(".")).is_err());
    }

    #[test]
    fn rejects_empty_lists() {
        let text = with_apt(
            r#"remote = "s3://b/a"
codenames = []
architectures = ["amd64"]
"#,
        );
        assert!(parse_config(&text, Path::new(".")).is_err());
    }

    #[test]
    fn requires_some_repository_flavour() {
        assert!(parse_config(BASE, Path::new(".")).is_err());
    }

    #[test]
    fn parses_rpm_section_and_signing_overrides() {
        let text = format!(
            r#"{BASE}
[signing]
key_env = "RELEASE_KEY"

[rpm]
remote = "s3://bucket/rpm-repo"
name = "example.com repository"
repo_id = "example-repo"
base_url = "https://www.example.com/rpm-repo"
gpg_key_url = "https://www.example.com/rpm-repo/pgp-key.public"
"#
        );
        let config = parse_config(&text, Path::new(".")).unwrap();
        assert_eq!(config.signing.key_env, "RELEASE_KEY");
        assert_eq!(config.signing.passphrase_env, DEFAULT_PASSPHRASE_ENV);
        assert_eq!(config.rpm().unwrap().repo_id, "example-repo");
        assert!(config.apt().is_err());
    }
}
