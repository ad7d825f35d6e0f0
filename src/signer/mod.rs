//! Release signing.
//!
//! Every `Release` gets two companions: a detached ASCII-armored signature
//! (`Release.pgp`) and a clear-signed copy (`InRelease`). Both are produced
//! from the same byte snapshot of `Release`, staged as hidden temporaries,
//! verified, and only then renamed into place one right after the other. If
//! anything fails, neither file exists afterwards.

pub mod gpg;

use anyhow::{bail, Context, Result};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::SigningConfig;
use crate::filesystem::{atomic_rename, remove_file_if_exists, write_temp_sibling};
use crate::release::{ReleaseDescriptor, IN_RELEASE_FILE, RELEASE_SIGNATURE_FILE};
pub use gpg::GpgSigner;

/// Key identity and passphrase used for non-interactive signing.
#[derive(Clone, PartialEq, Eq)]
pub struct SigningIdentity {
    pub key_id: String,
    pub passphrase: String,
}

impl fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningIdentity")
            .field("key_id", &self.key_id)
            .field("passphrase", &"<redacted>")
            .finish()
    }
}

impl SigningIdentity {
    /// Read the identity from the environment variables named in `config`.
    pub fn from_env(config: &SigningConfig) -> Result<Self> {
        Self::from_lookup(config, |name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable lookup.
    pub fn from_lookup(
        config: &SigningConfig,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let key_id = lookup(&config.key_env)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        let passphrase = lookup(&config.passphrase_env).filter(|v| !v.is_empty());
        match (key_id, passphrase) {
            (Some(key_id), Some(passphrase)) => Ok(Self { key_id, passphrase }),
            (None, _) => bail!(
                "signing key identity not set: export {} before publishing",
                config.key_env
            ),
            (_, None) => bail!(
                "signing passphrase not set: export {} before publishing",
                config.passphrase_env
            ),
        }
    }
}

/// Produces OpenPGP signatures over a file's exact bytes.
pub trait Signer {
    /// ASCII-armored detached signature of `file`.
    fn detach_sign(&self, file: &Path) -> Result<Vec<u8>>;

    /// Clear-signed document embedding the text of `file`.
    fn clear_sign(&self, file: &Path) -> Result<Vec<u8>>;

    /// Check a detached signature against `file`.
    fn verify_detached(&self, file: &Path, signature: &Path) -> Result<()>;
}

/// Paths of a signed release and its two signature documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedRelease {
    pub release: PathBuf,
    pub detached: PathBuf,
    pub inline: PathBuf,
}

/// Sign `descriptor` and write `Release.pgp` and `InRelease` next to it.
pub fn sign_release(signer: &dyn Signer, descriptor: &ReleaseDescriptor) -> Result<SignedRelease> {
    let dist = descriptor.dist_dir();
    let detached = dist.join(RELEASE_SIGNATURE_FILE);
    let inline = dist.join(IN_RELEASE_FILE);

    let result = sign_both(signer, &descriptor.path, &detached, &inline);
    if result.is_err() {
        for path in [&detached, &inline] {
            if let Err(e) = remove_file_if_exists(path) {
                warn!(path = %path.display(), error = %format!("{e:#}"), "failed to remove signature");
            }
        }
    }
    result.with_context(|| format!("signing Release for '{}'", descriptor.codename))?;

    info!(codename = %descriptor.codename, "signed Release");
    Ok(SignedRelease {
        release: descriptor.path.clone(),
        detached,
        inline,
    })
}

fn sign_both(signer: &dyn Signer, release: &Path, detached: &Path, inline: &Path) -> Result<()> {
    let before = fs::read(release).with_context(|| format!("reading '{}'", release.display()))?;
    let signature = signer.detach_sign(release)?;
    let clear = signer.clear_sign(release)?;
    let after = fs::read(release).with_context(|| format!("reading '{}'", release.display()))?;
    if before != after {
        bail!("'{}' changed while it was being signed", release.display());
    }

    let staged_detached = Staged::write(detached, &signature)?;
    let staged_inline = Staged::write(inline, &clear)?;
    signer
        .verify_detached(release, &staged_detached.0)
        .context("freshly written signature does not verify")?;

    atomic_rename(&staged_detached.0, detached)?;
    atomic_rename(&staged_inline.0, inline)?;
    Ok(())
}

/// Hidden temporary next to its final path, removed on drop if still there.
struct Staged(PathBuf);

impl Staged {
    fn write(path: &Path, contents: &[u8]) -> Result<Self> {
        write_temp_sibling(path, contents).map(Self)
    }
}

impl Drop for Staged {
    fn drop(&mut self) {
        if let Err(e) = remove_file_if_exists(&self.0) {
            warn!(path = %self.0.display(), error = %format!("{e:#}"), "failed to remove staged signature");
        }
    }
}
