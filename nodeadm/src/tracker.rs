//! Record of the components installed by this tool.
//!
//! The tracker is what makes uninstall and upgrade precise: a component is
//! marked only when nodeadm itself installed it, so anything that was already
//! on the host is never upgraded or removed. The record is a small YAML file
//! rewritten after every successful install or upgrade and deleted, together
//! with its directory, at the end of a successful uninstall.
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::Context;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::info;

pub const TRACKER_DIR: &str = "/opt/nodeadm";
pub const TRACKER_FILE: &str = "/opt/nodeadm/tracker";

pub const CNI_PLUGINS: &str = "cni-plugins";
pub const IAM_AUTHENTICATOR: &str = "iam-authenticator";
pub const IAM_ROLES_ANYWHERE: &str = "iam-roles-anywhere";
pub const IMAGE_CREDENTIAL_PROVIDER: &str = "image-credential-provider";
pub const KUBECTL: &str = "kubectl";
pub const KUBELET: &str = "kubelet";
pub const SSM: &str = "ssm";
pub const IPTABLES: &str = "iptables";

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("invalid artifact {0:?}")]
    InvalidArtifact(String),
    #[error("invalid containerd source {0:?}, expected one of none, distro, docker")]
    InvalidContainerdSource(String),
}

/// Where containerd came from. `None` covers both "not installed" and
/// "already present on the host", the two cases in which nodeadm must leave
/// it alone.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerdSource {
    #[default]
    None,
    Distro,
    Docker,
}

impl FromStr for ContainerdSource {
    type Err = TrackerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "none" => Ok(ContainerdSource::None),
            "distro" => Ok(ContainerdSource::Distro),
            "docker" => Ok(ContainerdSource::Docker),
            other => Err(TrackerError::InvalidContainerdSource(other.to_string())),
        }
    }
}

impl<'de> Deserialize<'de> for ContainerdSource {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        raw.parse().map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for ContainerdSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ContainerdSource::None => "none",
            ContainerdSource::Distro => "distro",
            ContainerdSource::Docker => "docker",
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledArtifacts {
    #[serde(default)]
    pub containerd: ContainerdSource,
    #[serde(default)]
    pub cni_plugins: bool,
    #[serde(default)]
    pub iam_authenticator: bool,
    #[serde(default)]
    pub iam_roles_anywhere: bool,
    #[serde(default)]
    pub image_credential_provider: bool,
    #[serde(default)]
    pub kubectl: bool,
    #[serde(default)]
    pub kubelet: bool,
    #[serde(default)]
    pub ssm: bool,
    #[serde(default)]
    pub iptables: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tracker {
    #[serde(default)]
    pub artifacts: InstalledArtifacts,
}

impl Tracker {
    /// Marks a component as installed by nodeadm. Unknown names are rejected
    /// so that a typo can never silently turn into a no-op.
    pub fn add(&mut self, name: &str) -> Result<(), TrackerError> {
        let a = &mut self.artifacts;
        let field = match name {
            CNI_PLUGINS => &mut a.cni_plugins,
            IAM_AUTHENTICATOR => &mut a.iam_authenticator,
            IAM_ROLES_ANYWHERE => &mut a.iam_roles_anywhere,
            IMAGE_CREDENTIAL_PROVIDER => &mut a.image_credential_provider,
            KUBECTL => &mut a.kubectl,
            KUBELET => &mut a.kubelet,
            SSM => &mut a.ssm,
            IPTABLES => &mut a.iptables,
            other => return Err(TrackerError::InvalidArtifact(other.to_string())),
        };
        *field = true;
        Ok(())
    }

    pub fn mark_containerd(&mut self, source: ContainerdSource) {
        self.artifacts.containerd = source;
    }

    /// Loads the tracker at `path`. A missing file is a first install and
    /// yields an empty tracker; anything unparsable is an error.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Tracker::default()),
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        serde_yaml::from_str(&data).with_context(|| format!("parsing tracker {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        // serializing the enum is what normalizes the containerd source
        let data = serde_yaml::to_string(self).context("serializing tracker")?;
        utils::fs_ext::write_file(path, data, 0o644)?;
        info!("saved installed artifacts to {}", path.display());
        Ok(())
    }

    /// Removes the directory holding the tracker file.
    pub fn clear(path: &Path) -> anyhow::Result<()> {
        let dir: PathBuf = path
            .parent()
            .map(Path::to_path_buf)
            .with_context(|| format!("tracker path {} has no parent", path.display()))?;
        utils::fs_ext::remove_dir_all_if_exists(&dir)
    }
}
