//! Release sources backing the component source traits.
//!
//! Kubernetes artifacts and the IAM Roles Anywhere signing helper come from
//! the hybrid release manifest; the SSM setup CLI comes from the regional
//! SSM bucket.
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use hybrid_api::manifest::{IamRolesAnywhereRelease, Manifest, PatchRelease, find_artifact};
use sha2::{Digest, Sha256};
use tracing::info;

use super::cni_plugins::CniPluginsSource;
use super::iam_authenticator::IamAuthenticatorSource;
use super::iam_roles_anywhere::SigningHelperSource;
use super::image_credential_provider::ImageCredentialProviderSource;
use super::kubectl::KubectlSource;
use super::kubelet::KubeletSource;
use super::ssm::SsmSource;
use crate::artifact::{Artifact, Fetcher, fetch_artifact};

pub const MANIFEST_URL: &str = "https://hybrid-assets.eks.amazonaws.com/manifest.yaml";

const ARTIFACT_OS: &str = "linux";

/// Everything the lifecycle flows download from a Kubernetes release.
pub trait EksSource:
    KubeletSource
    + KubectlSource
    + CniPluginsSource
    + ImageCredentialProviderSource
    + IamAuthenticatorSource
    + SigningHelperSource
{
}

impl<T> EksSource for T where
    T: KubeletSource
        + KubectlSource
        + CniPluginsSource
        + ImageCredentialProviderSource
        + IamAuthenticatorSource
        + SigningHelperSource
{
}

/// Artifacts of one Kubernetes patch release.
pub struct EksReleaseSource {
    fetcher: Arc<dyn Fetcher>,
    release: PatchRelease,
    iam_roles_anywhere: Option<IamRolesAnywhereRelease>,
    arch: String,
}

impl EksReleaseSource {
    pub async fn load(
        fetcher: Arc<dyn Fetcher>,
        manifest_url: &str,
        kubernetes_version: &str,
        arch: &str,
    ) -> anyhow::Result<Self> {
        let data = fetcher
            .fetch(manifest_url)
            .await
            .context("downloading release manifest")?;
        let manifest =
            Manifest::from_yaml(std::str::from_utf8(&data).context("manifest is not UTF-8")?)?;
        let release = manifest.patch_release(kubernetes_version)?.clone();
        info!("using kubernetes release {}", release.version);
        Ok(Self {
            fetcher,
            iam_roles_anywhere: manifest.latest_iam_roles_anywhere_release().ok().cloned(),
            release,
            arch: arch.to_string(),
        })
    }

    pub fn version(&self) -> &str {
        &self.release.version
    }

    async fn artifact(&self, name: &str) -> anyhow::Result<Artifact> {
        let entry = find_artifact(&self.release.artifacts, name, ARTIFACT_OS, &self.arch)?;
        fetch_artifact(self.fetcher.as_ref(), name, &entry.uri, &entry.checksum_uri).await
    }
}

#[async_trait]
impl KubeletSource for EksReleaseSource {
    async fn get_kubelet(&self) -> anyhow::Result<Artifact> {
        self.artifact("kubelet").await
    }
}

#[async_trait]
impl KubectlSource for EksReleaseSource {
    async fn get_kubectl(&self) -> anyhow::Result<Artifact> {
        self.artifact("kubectl").await
    }
}

#[async_trait]
impl CniPluginsSource for EksReleaseSource {
    async fn get_cni_plugins(&self) -> anyhow::Result<Artifact> {
        self.artifact("cni-plugins").await
    }
}

#[async_trait]
impl ImageCredentialProviderSource for EksReleaseSource {
    async fn get_image_credential_provider(&self) -> anyhow::Result<Artifact> {
        self.artifact("image-credential-provider").await
    }
}

#[async_trait]
impl IamAuthenticatorSource for EksReleaseSource {
    async fn get_iam_authenticator(&self) -> anyhow::Result<Artifact> {
        self.artifact("aws-iam-authenticator").await
    }
}

#[async_trait]
impl SigningHelperSource for EksReleaseSource {
    async fn get_signing_helper(&self) -> anyhow::Result<Artifact> {
        let release = self
            .iam_roles_anywhere
            .as_ref()
            .context("no IAM Roles Anywhere release found in manifest")?;
        let entry = find_artifact(&release.artifacts, "aws_signing_helper", ARTIFACT_OS, &self.arch)?;
        fetch_artifact(
            self.fetcher.as_ref(),
            "aws_signing_helper",
            &entry.uri,
            &entry.checksum_uri,
        )
        .await
    }
}

/// The SSM setup CLI for a region.
pub struct SsmReleaseSource {
    fetcher: Arc<dyn Fetcher>,
    region: String,
    arch: String,
}

impl SsmReleaseSource {
    pub fn new(fetcher: Arc<dyn Fetcher>, region: &str, arch: &str) -> Self {
        Self {
            fetcher,
            region: region.to_string(),
            arch: arch.to_string(),
        }
    }

    pub fn setup_cli_url(&self) -> String {
        let region = &self.region;
        format!(
            "https://amazon-ssm-{region}.s3.{region}.amazonaws.com/latest/linux_{}/ssm-setup-cli",
            self.arch
        )
    }
}

#[async_trait]
impl SsmSource for SsmReleaseSource {
    // The bucket publishes no checksum file; the digest of what was fetched
    // over TLS is recorded so the install is still verified on disk.
    async fn get_setup_cli(&self) -> anyhow::Result<Artifact> {
        let url = self.setup_cli_url();
        info!("downloading ssm-setup-cli from {url}");
        let data = self.fetcher.fetch(&url).await?;
        let checksum = Sha256::digest(&data).to_vec();
        Ok(Artifact::new("ssm-setup-cli", data, checksum))
    }
}
