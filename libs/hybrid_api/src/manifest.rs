//! The hybrid release manifest.
//!
//! The manifest lists every Kubernetes version supported for hybrid nodes,
//! and for each patch release the URIs of the node artifacts together with
//! the URIs of their SHA-256 checksum files. IAM Roles Anywhere signing
//! helper releases are listed separately since they are versioned
//! independently from Kubernetes.
use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Manifest {
    #[serde(default)]
    pub supported_eks_releases: Vec<SupportedEksRelease>,
    #[serde(default)]
    pub iam_roles_anywhere_releases: Vec<IamRolesAnywhereRelease>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct SupportedEksRelease {
    /// `major.minor`
    pub kubernetes_version: String,
    /// `major.minor.patch`
    pub latest_patch_version: String,
    #[serde(default)]
    pub patch_releases: Vec<PatchRelease>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct PatchRelease {
    pub version: String,
    #[serde(default)]
    pub artifacts: Vec<ManifestArtifact>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct IamRolesAnywhereRelease {
    pub version: String,
    #[serde(default)]
    pub artifacts: Vec<ManifestArtifact>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ManifestArtifact {
    pub name: String,
    pub os: String,
    pub arch: String,
    pub uri: String,
    pub checksum_uri: String,
}

impl Manifest {
    pub fn from_yaml(data: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(data).context("parsing release manifest")
    }

    /// Finds the patch release for `version`. `major.minor` selects the
    /// latest patch of that minor version, `major.minor.patch` selects that
    /// exact release.
    pub fn patch_release(&self, version: &str) -> anyhow::Result<&PatchRelease> {
        let version = version.trim_start_matches('v');
        let minor = match version.split('.').collect::<Vec<_>>().as_slice() {
            [major, minor] | [major, minor, _] => format!("{major}.{minor}"),
            _ => bail!("invalid kubernetes version {version:?}, expected major.minor"),
        };

        let release = self
            .supported_eks_releases
            .iter()
            .find(|r| r.kubernetes_version == minor)
            .with_context(|| format!("kubernetes version {minor} is not supported"))?;

        let wanted = if version == minor {
            release.latest_patch_version.as_str()
        } else {
            version
        };
        release
            .patch_releases
            .iter()
            .find(|p| p.version == wanted)
            .with_context(|| format!("kubernetes patch release {wanted} not found in manifest"))
    }

    /// The newest IAM Roles Anywhere release listed in the manifest.
    pub fn latest_iam_roles_anywhere_release(&self) -> anyhow::Result<&IamRolesAnywhereRelease> {
        self.iam_roles_anywhere_releases
            .last()
            .context("no IAM Roles Anywhere release found in manifest")
    }
}

/// Looks up an artifact by name for the given platform.
pub fn find_artifact<'a>(
    artifacts: &'a [ManifestArtifact],
    name: &str,
    os: &str,
    arch: &str,
) -> anyhow::Result<&'a ManifestArtifact> {
    artifacts
        .iter()
        .find(|a| a.name == name && a.os == os && a.arch == arch)
        .with_context(|| format!("artifact {name} for {os}/{arch} not found in manifest"))
}
