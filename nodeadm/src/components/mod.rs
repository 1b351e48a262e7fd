//! Installers for the host components of a hybrid node.
//!
//! Every component has the same three operations: `install` downloads
//! through the component's own source trait, verifies the result and only
//! then marks the tracker; `upgrade` replaces what is on disk when its
//! content differs from the release; `uninstall` removes what `install`
//! wrote. Whether `uninstall` runs at all is decided by the caller from the
//! tracker.
use anyhow::Context;
use tracing::info;

use crate::artifact::{Artifact, install_verified, upgrade_available};
use crate::layout::HostLayout;

pub mod cni_plugins;
pub mod containerd;
pub mod iam_authenticator;
pub mod iam_roles_anywhere;
pub mod image_credential_provider;
pub mod iptables;
pub mod kubectl;
pub mod kubelet;
pub mod source;
pub mod ssm;

pub(crate) const EXECUTABLE_MODE: u32 = 0o755;

/// Installs a single-file artifact at its host path.
pub(crate) fn install_binary(layout: &HostLayout, path: &str, artifact: &Artifact) -> anyhow::Result<()> {
    let dest = layout.resolve(path);
    install_verified(&dest, artifact, EXECUTABLE_MODE)
        .with_context(|| format!("installing {}", artifact.name))?;
    info!("installed {} at {path}", artifact.name);
    Ok(())
}

/// Replaces a single-file artifact when its digest changed. Returns whether
/// anything was replaced.
pub(crate) fn upgrade_binary(layout: &HostLayout, path: &str, artifact: &Artifact) -> anyhow::Result<bool> {
    let dest = layout.resolve(path);
    if !upgrade_available(&dest, &artifact.checksum)
        .with_context(|| format!("checking installed {}", artifact.name))?
    {
        info!("{} is already up to date", artifact.name);
        return Ok(false);
    }
    install_verified(&dest, artifact, EXECUTABLE_MODE)
        .with_context(|| format!("upgrading {}", artifact.name))?;
    info!("upgraded {} at {path}", artifact.name);
    Ok(true)
}

pub(crate) fn remove_binary(layout: &HostLayout, path: &str) -> anyhow::Result<()> {
    utils::fs_ext::remove_file_if_exists(layout.resolve(path))
}
