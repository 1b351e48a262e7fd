//! The lifecycle commands, each a fixed sequence of steps that stops at the
//! first failure. Nothing is rolled back: every step is safe to repeat, so
//! the fix for a failed run is to run it again.
use std::path::PathBuf;

use anyhow::anyhow;
use tracing::info;

use crate::components::containerd;
use crate::daemon::DaemonStatus;
use crate::host::Host;
use crate::remediation::with_remediation;
use crate::tracker::TRACKER_FILE;
use crate::validation::system::check_vxlan_port_open;

pub mod debug;
pub mod init;
pub mod install;
pub mod uninstall;
pub mod upgrade;

/// Shared configuration directory of the EKS components.
pub const EKS_CONFIG_DIR: &str = "/etc/eks";
pub const KUBERNETES_CONFIG_DIR: &str = "/etc/kubernetes";

pub fn ensure_root() -> anyhow::Result<()> {
    if crate::system::is_root() {
        return Ok(());
    }
    Err(with_remediation(
        anyhow!("nodeadm must run as root"),
        "Run the command again with sudo.",
    ))
}

pub(crate) fn tracker_path(host: &Host) -> PathBuf {
    host.layout.resolve(TRACKER_FILE)
}

/// A previous `nodeadm install` left its tracker behind and a containerd
/// unit exists, whoever installed it.
pub fn check_installed(host: &Host) -> anyhow::Result<()> {
    let path = tracker_path(host);
    if !path.exists() {
        return Err(with_remediation(
            anyhow!("no nodeadm installation found at {}", path.display()),
            "Run `nodeadm install <kubernetes-version> --credential-provider <ssm|iam-ra>` before `nodeadm init`.",
        ));
    }
    if host.daemons.get_daemon_status(containerd::DAEMON_NAME)? == DaemonStatus::Unknown {
        return Err(with_remediation(
            anyhow!("containerd unit not found"),
            "Install containerd, or run `nodeadm install` with --containerd-source distro or docker.",
        ));
    }
    info!("found nodeadm installation");
    Ok(())
}

pub fn check_cni_port(host: &Host) -> anyhow::Result<()> {
    check_vxlan_port_open(host.runner.as_ref(), host.binaries.as_ref())
}
