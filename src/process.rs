//! Blocking invocation of external tools.
//!
//! Every collaborator (sync, index generation, signing, createrepo) runs as a
//! synchronous child process. Non-zero exit is always an error carrying the
//! command line plus trimmed stdout/stderr.

use anyhow::{bail, Context, Result};
use std::ffi::OsStr;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Output, Stdio};
use tracing::debug;

/// A command to run, with optional working directory and stdin payload.
#[derive(Debug)]
pub struct Tool<'a> {
    program: &'a str,
    args: Vec<&'a OsStr>,
    cwd: Option<&'a Path>,
    stdin: Option<&'a [u8]>,
}

impl<'a> Tool<'a> {
    pub fn new(program: &'a str) -> Self {
        Self {
            program,
            args: Vec::new(),
            cwd: None,
            stdin: None,
        }
    }

    pub fn arg<S: AsRef<OsStr> + ?Sized>(mut self, arg: &'a S) -> Self {
        self.args.push(arg.as_ref());
        self
    }

    pub fn args<S: AsRef<OsStr> + 'a>(mut self, args: &'a [S]) -> Self {
        self.args.extend(args.iter().map(|a| a.as_ref()));
        self
    }

    pub fn current_dir(mut self, dir: &'a Path) -> Self {
        self.cwd = Some(dir);
        self
    }

    /// Bytes written to the child's stdin, which is then closed.
    pub fn stdin(mut self, bytes: &'a [u8]) -> Self {
        self.stdin = Some(bytes);
        self
    }

    fn describe(&self) -> String {
        let mut line = self.program.to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        line
    }

    /// Run to completion and return captured stdout on success.
    pub fn run(self) -> Result<Vec<u8>> {
        let line = self.describe();
        debug!(command = %line, "running external tool");

        let mut cmd = Command::new(self.program);
        cmd.args(&self.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = self.cwd {
            cmd.current_dir(dir);
        }
        cmd.stdin(if self.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning '{}'", line))?;
        // The pipe closes at the end of the match arm. A child that exits
        // early breaks it; its exit status and stderr explain why.
        let fed = match (self.stdin, child.stdin.take()) {
            (Some(bytes), Some(mut pipe)) => pipe.write_all(bytes),
            _ => Ok(()),
        };
        let output = child
            .wait_with_output()
            .with_context(|| format!("waiting for '{}'", line))?;
        check_output(self.program, &output)?;
        fed.with_context(|| format!("writing stdin of '{}'", self.program))?;
        Ok(output.stdout)
    }
}

fn check_output(program: &str, output: &Output) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let code = output
        .status
        .code()
        .map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string());
    bail!(
        "{} failed (exit {}): {}\n{}",
        program,
        code,
        stdout.trim(),
        stderr.trim()
    )
}
