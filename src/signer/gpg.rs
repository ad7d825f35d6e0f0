//! GnuPG-backed signer.
//!
//! Runs `gpg --batch --pinentry-mode loopback` with the passphrase fed on
//! stdin (`--passphrase-fd 0`) so it never appears in the process list.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use super::{Signer, SigningIdentity};
use crate::process::Tool;

#[derive(Debug, Clone)]
pub struct GpgSigner {
    identity: SigningIdentity,
    homedir: Option<PathBuf>,
}

impl GpgSigner {
    pub fn new(identity: SigningIdentity) -> Self {
        Self {
            identity,
            homedir: None,
        }
    }

    /// Use a keyring other than the default `~/.gnupg`.
    pub fn with_homedir(mut self, homedir: PathBuf) -> Self {
        self.homedir = Some(homedir);
        self
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(home) = &self.homedir {
            args.push("--homedir".to_string());
            args.push(home.display().to_string());
        }
        args.extend(
            [
                "--batch",
                "--yes",
                "--pinentry-mode",
                "loopback",
                "--passphrase-fd",
                "0",
                "--default-key",
            ]
            .map(str::to_string),
        );
        args.push(self.identity.key_id.clone());
        args
    }

    fn sign(&self, mode: &[&str], file: &Path) -> Result<Vec<u8>> {
        let mut args = self.base_args();
        args.extend(mode.iter().map(|s| s.to_string()));
        args.push("--output".to_string());
        args.push("-".to_string());
        let passphrase = format!("{}\n", self.identity.passphrase);
        Tool::new("gpg")
            .args(&args)
            .arg(file)
            .stdin(passphrase.as_bytes())
            .run()
            .with_context(|| {
                format!(
                    "gpg {} of '{}' with key '{}'",
                    mode.join(" "),
                    file.display(),
                    self.identity.key_id
                )
            })
    }
}

impl Signer for GpgSigner {
    fn detach_sign(&self, file: &Path) -> Result<Vec<u8>> {
        self.sign(&["--armor", "--detach-sign"], file)
    }

    fn clear_sign(&self, file: &Path) -> Result<Vec<u8>> {
        self.sign(&["--clearsign"], file)
    }

    fn verify_detached(&self, file: &Path, signature: &Path) -> Result<()> {
        let mut args = Vec::new();
        if let Some(home) = &self.homedir {
            args.push("--homedir".to_string());
            args.push(home.display().to_string());
        }
        args.push("--batch".to_string());
        args.push("--verify".to_string());
        Tool::new("gpg")
            .args(&args)
            .arg(signature)
            .arg(file)
            .run()
            .with_context(|| format!("verifying '{}'", signature.display()))?;
        Ok(())
    }
}
