//! Narrow interfaces to the host: running commands, finding binaries and
//! identifying the operating system.
pub mod os;

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, anyhow};
use tracing::debug;

/// Runs a program to completion and returns its stdout.
///
/// A non-zero exit status is an error carrying the trimmed stderr.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[&str]) -> anyhow::Result<String>;
}

pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run(&self, program: &str, args: &[&str]) -> anyhow::Result<String> {
        debug!("running {program} {}", args.join(" "));
        let output = Command::new(program)
            .args(args)
            .output()
            .with_context(|| format!("could not spawn `{program}`"))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "`{program} {}` exited with {}: {}",
                args.join(" "),
                output.status,
                stderr.trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Looks executables up on `PATH`.
pub trait BinaryLookup: Send + Sync {
    fn find(&self, name: &str) -> Option<PathBuf>;
}

pub struct PathLookup;

impl BinaryLookup for PathLookup {
    fn find(&self, name: &str) -> Option<PathBuf> {
        let path = std::env::var_os("PATH")?;
        std::env::split_paths(&path)
            .map(|dir| dir.join(name))
            .find(|candidate| {
                candidate
                    .metadata()
                    .is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            })
    }
}

pub fn is_root() -> bool {
    nix::unistd::Uid::effective().is_root()
}

/// Maps the kernel architecture onto the names used by release artifacts.
pub fn artifact_arch() -> anyhow::Result<&'static str> {
    match std::env::consts::ARCH {
        "x86_64" => Ok("amd64"),
        "aarch64" => Ok("arm64"),
        other => Err(anyhow!("unsupported architecture {other}")),
    }
}
