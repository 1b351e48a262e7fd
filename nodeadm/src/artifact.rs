//! The install primitive shared by every component.
//!
//! Binary artifacts are downloaded together with their SHA-256 checksum file,
//! written to their final path and verified by re-hashing the file on disk.
//! Whether an upgrade is needed is decided purely on content: a file whose
//! digest differs from the expected one is replaced, whatever its version.
//!
//! OS packages are modelled as an install/upgrade/uninstall command triple run
//! through the package manager under a fixed-delay retry.
use std::fs::{self, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::info;
use utils::backoff::{self, RetryPolicy};
use utils::fs_ext::ignore_not_found;

use crate::system::CommandRunner;

/// A downloaded artifact and the digest it is expected to have.
#[derive(Clone, Debug)]
pub struct Artifact {
    pub name: String,
    pub data: Vec<u8>,
    pub checksum: Vec<u8>,
}

impl Artifact {
    pub fn new(name: impl Into<String>, data: Vec<u8>, checksum: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            data,
            checksum,
        }
    }

    pub fn reader(&self) -> impl Read + '_ {
        io::Cursor::new(self.data.as_slice())
    }

    /// Checks the in-memory bytes, used for archives that are unpacked
    /// rather than installed as a single file.
    pub fn verify_data(&self) -> Result<(), ChecksumError> {
        let actual = Sha256::digest(&self.data).to_vec();
        if actual != self.checksum {
            return Err(ChecksumError::Mismatch {
                name: self.name.clone(),
                expected: hex::encode(&self.checksum),
                actual: hex::encode(actual),
            });
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChecksumError {
    #[error("checksum mismatch for {name}: expected {expected}, got {actual}")]
    Mismatch {
        name: String,
        expected: String,
        actual: String,
    },
    #[error("invalid checksum {0:?}")]
    Invalid(String),
}

/// Replaces `dest` with the contents of `src`: any existing file is removed,
/// parent directories are created and `mode` is applied.
pub fn install_file(dest: &Path, mut src: impl Read, mode: u32) -> anyhow::Result<()> {
    fs::remove_file(dest)
        .or_else(ignore_not_found)
        .with_context(|| format!("removing existing {}", dest.display()))?;
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(mode)
        .open(dest)
        .with_context(|| format!("creating {}", dest.display()))?;
    io::copy(&mut src, &mut file).with_context(|| format!("writing {}", dest.display()))?;
    file.sync_all()
        .with_context(|| format!("syncing {}", dest.display()))?;

    // the create mode is subject to umask
    fs::set_permissions(dest, fs::Permissions::from_mode(mode))
        .with_context(|| format!("setting permissions on {}", dest.display()))?;
    Ok(())
}

/// Streams the file through SHA-256.
pub fn sha256_file(path: &Path) -> anyhow::Result<Vec<u8>> {
    let mut file =
        fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).with_context(|| format!("reading {}", path.display()))?;
    Ok(hasher.finalize().to_vec())
}

pub fn verify_checksum(path: &Path, expected: &[u8]) -> anyhow::Result<()> {
    let actual = sha256_file(path)?;
    if actual != expected {
        return Err(ChecksumError::Mismatch {
            name: path.display().to_string(),
            expected: hex::encode(expected),
            actual: hex::encode(actual),
        }
        .into());
    }
    Ok(())
}

/// True iff the installed file's digest differs from `expected`. Errors if
/// nothing is installed at `installed_path`.
pub fn upgrade_available(installed_path: &Path, expected: &[u8]) -> anyhow::Result<bool> {
    Ok(sha256_file(installed_path)? != expected)
}

/// Installs `artifact` at `dest` and verifies what landed on disk. A file
/// that fails verification is removed again.
pub fn install_verified(dest: &Path, artifact: &Artifact, mode: u32) -> anyhow::Result<()> {
    install_file(dest, artifact.reader(), mode)?;
    if let Err(e) = verify_checksum(dest, &artifact.checksum) {
        fs::remove_file(dest).or_else(ignore_not_found)?;
        return Err(e.context(format!("verifying {}", artifact.name)));
    }
    Ok(())
}

/// Parses a checksum file, `<hex digest>  <file name>` or just the digest.
pub fn parse_checksum(text: &str) -> Result<Vec<u8>, ChecksumError> {
    let digest = text
        .split_whitespace()
        .next()
        .ok_or_else(|| ChecksumError::Invalid(text.to_string()))?;
    let bytes = hex::decode(digest).map_err(|_| ChecksumError::Invalid(digest.to_string()))?;
    if bytes.len() != 32 {
        return Err(ChecksumError::Invalid(digest.to_string()));
    }
    Ok(bytes)
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, uri: &str) -> anyhow::Result<Vec<u8>>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl HttpFetcher {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(30))
            .build()
            .context("building http client")?;
        Ok(Self {
            client,
            policy: RetryPolicy::download(),
        })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, uri: &str) -> anyhow::Result<Vec<u8>> {
        backoff::retry(&self.policy, &format!("download {uri}"), || async {
            let response = self.client.get(uri).send().await?.error_for_status()?;
            anyhow::Ok(response.bytes().await?.to_vec())
        })
        .await
    }
}

/// Downloads an artifact and its checksum file and checks they agree.
pub async fn fetch_artifact(
    fetcher: &dyn Fetcher,
    name: &str,
    uri: &str,
    checksum_uri: &str,
) -> anyhow::Result<Artifact> {
    info!("downloading {name} from {uri}");
    let checksum = fetcher.fetch(checksum_uri).await?;
    let checksum = String::from_utf8(checksum).context("checksum file is not UTF-8")?;
    let checksum = parse_checksum(&checksum)?;
    let data = fetcher.fetch(uri).await?;
    let artifact = Artifact::new(name, data, checksum);
    artifact.verify_data()?;
    Ok(artifact)
}

/// An OS package, installed and removed through the package manager.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Package {
    pub name: String,
    pub install: Vec<String>,
    pub upgrade: Vec<String>,
    pub uninstall: Vec<String>,
}

impl Package {
    pub fn install(&self, runner: &dyn CommandRunner, policy: &RetryPolicy) -> anyhow::Result<()> {
        info!("installing package {}", self.name);
        run_with_retry(runner, policy, &self.install, &format!("install {}", self.name))
    }

    pub fn upgrade(&self, runner: &dyn CommandRunner, policy: &RetryPolicy) -> anyhow::Result<()> {
        info!("upgrading package {}", self.name);
        run_with_retry(runner, policy, &self.upgrade, &format!("upgrade {}", self.name))
    }

    pub fn uninstall(&self, runner: &dyn CommandRunner, policy: &RetryPolicy) -> anyhow::Result<()> {
        info!("uninstalling package {}", self.name);
        run_with_retry(
            runner,
            policy,
            &self.uninstall,
            &format!("uninstall {}", self.name),
        )
    }
}

pub fn run_with_retry(
    runner: &dyn CommandRunner,
    policy: &RetryPolicy,
    command: &[String],
    description: &str,
) -> anyhow::Result<()> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| anyhow!("empty command for {description}"))?;
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    backoff::retry_blocking(policy, description, || runner.run(program, &args))?;
    Ok(())
}
