use async_trait::async_trait;
use tracing::info;

use super::{install_binary, remove_binary, upgrade_binary};
use crate::artifact::Artifact;
use crate::layout::HostLayout;
use crate::system::CommandRunner;
use crate::tracker::{self, Tracker};

pub const BINARY_PATH: &str = "/usr/bin/kubelet";
pub const UNIT_PATH: &str = "/etc/systemd/system/kubelet.service";
pub const KUBELET_ROOT_DIR: &str = "/var/lib/kubelet";
pub const KUBECONFIG_PATH: &str = "/var/lib/kubelet/kubeconfig";
pub const CONFIG_DIR: &str = "/etc/kubernetes/kubelet";
pub const CONFIG_PATH: &str = "/etc/kubernetes/kubelet/config.json";
pub const ENV_FILE_PATH: &str = "/etc/eks/kubelet/environment";
pub const CA_CERT_PATH: &str = "/etc/kubernetes/pki/ca.crt";
pub const DAEMON_NAME: &str = "kubelet";

const UNIT: &str = include_str!("../config_template/kubelet.service");

#[async_trait]
pub trait KubeletSource: Send + Sync {
    async fn get_kubelet(&self) -> anyhow::Result<Artifact>;
}

pub async fn install(
    layout: &HostLayout,
    tracker: &mut Tracker,
    source: &dyn KubeletSource,
) -> anyhow::Result<()> {
    let artifact = source.get_kubelet().await?;
    install_binary(layout, BINARY_PATH, &artifact)?;
    utils::fs_ext::write_file(layout.resolve(UNIT_PATH), UNIT, 0o644)?;
    tracker.add(tracker::KUBELET)?;
    Ok(())
}

pub async fn upgrade(layout: &HostLayout, source: &dyn KubeletSource) -> anyhow::Result<()> {
    let artifact = source.get_kubelet().await?;
    upgrade_binary(layout, BINARY_PATH, &artifact)?;
    // the unit ships with the binary
    utils::fs_ext::write_file(layout.resolve(UNIT_PATH), UNIT, 0o644)?;
    Ok(())
}

/// Removes the binary, its unit and the configuration written at init.
/// `/var/lib/kubelet` may hold pod volume mounts and is left to the
/// mount-aware remover.
pub fn uninstall(layout: &HostLayout) -> anyhow::Result<()> {
    remove_binary(layout, BINARY_PATH)?;
    for path in [UNIT_PATH, ENV_FILE_PATH, KUBECONFIG_PATH, CA_CERT_PATH] {
        utils::fs_ext::remove_file_if_exists(layout.resolve(path))?;
    }
    utils::fs_ext::remove_dir_all_if_exists(layout.resolve(CONFIG_DIR))?;
    info!("removed kubelet");
    Ok(())
}

/// Version of the installed kubelet, `v1.31.2` for
/// `Kubernetes v1.31.2-eks-7f9249a`.
pub fn version(runner: &dyn CommandRunner, layout: &HostLayout) -> anyhow::Result<String> {
    let binary = layout.resolve(BINARY_PATH);
    let out = runner.run(&binary.to_string_lossy(), &["--version"])?;
    parse_version(&out)
}

pub fn parse_version(output: &str) -> anyhow::Result<String> {
    let raw = output
        .split_whitespace()
        .find(|w| w.starts_with('v'))
        .ok_or_else(|| anyhow::anyhow!("unexpected kubelet --version output {output:?}"))?;
    Ok(raw.split('-').next().unwrap_or(raw).to_string())
}
