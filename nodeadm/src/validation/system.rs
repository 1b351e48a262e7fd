//! Host level checks: clock synchronization, firewall ports and the kubelet
//! version skew against the control plane.
use anyhow::{Context, anyhow, bail};
use tracing::{debug, info};

use super::cni::Cni;
use crate::remediation::with_remediation;
use crate::system::{BinaryLookup, CommandRunner};

/// Oldest kubelet minor version still supported against a given API server.
pub const MAX_KUBELET_MINOR_SKEW: u32 = 3;

pub fn check_ntp_sync(runner: &dyn CommandRunner) -> anyhow::Result<()> {
    let out = runner
        .run("timedatectl", &["show", "-p", "NTPSynchronized", "--value"])
        .context("querying NTP synchronization")?;
    if out.trim() == "yes" {
        return Ok(());
    }
    Err(with_remediation(
        anyhow!("system clock is not synchronized with NTP"),
        "Enable an NTP client such as chronyd or systemd-timesyncd and make sure it can reach its servers. Certificates and AWS request signing fail on a skewed clock.",
    ))
}

/// Checks that the host firewall lets through the VXLAN port of either
/// supported CNI. A host without an active firewalld or ufw passes.
pub fn check_vxlan_port_open(
    runner: &dyn CommandRunner,
    binaries: &dyn BinaryLookup,
) -> anyhow::Result<()> {
    let open_ports = if binaries.find("firewall-cmd").is_some() && firewalld_running(runner) {
        let out = runner
            .run("firewall-cmd", &["--list-ports"])
            .context("listing firewalld ports")?;
        out.split_whitespace().map(str::to_string).collect::<Vec<_>>()
    } else if binaries.find("ufw").is_some() {
        let out = runner.run("ufw", &["status"]).context("querying ufw status")?;
        if !out.contains("Status: active") {
            debug!("ufw is inactive");
            return Ok(());
        }
        ufw_allowed_ports(&out)
    } else {
        debug!("no host firewall found");
        return Ok(());
    };

    let wanted = [Cni::Cilium, Cni::Calico].map(|cni| format!("{}/udp", cni.vxlan_port()));
    if let Some(port) = wanted.iter().find(|w| open_ports.contains(w)) {
        info!("firewall allows CNI VXLAN port {port}");
        return Ok(());
    }
    Err(with_remediation(
        anyhow!("neither CNI VXLAN port {} is open in the host firewall", wanted.join(" nor ")),
        "Open 8472/udp for Cilium or 4789/udp for Calico, for example `firewall-cmd --permanent --add-port=8472/udp && firewall-cmd --reload` or `ufw allow 8472/udp`.",
    ))
}

fn firewalld_running(runner: &dyn CommandRunner) -> bool {
    runner
        .run("firewall-cmd", &["--state"])
        .is_ok_and(|out| out.trim() == "running")
}

fn ufw_allowed_ports(status: &str) -> Vec<String> {
    status
        .lines()
        .filter(|line| line.contains("ALLOW"))
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

/// Minor component of `v1.31.2`, `1.31` or `1.31.0-eks-abc`.
pub fn minor_version(version: &str) -> anyhow::Result<u32> {
    let trimmed = version.trim().trim_start_matches('v');
    let mut parts = trimmed.split('.');
    let (Some(_major), Some(minor)) = (parts.next(), parts.next()) else {
        bail!("invalid Kubernetes version {version:?}");
    };
    let digits: String = minor.chars().take_while(char::is_ascii_digit).collect();
    digits
        .parse()
        .with_context(|| format!("invalid Kubernetes version {version:?}"))
}

/// The kubelet may not be newer than the API server, nor more than
/// `MAX_KUBELET_MINOR_SKEW` minors older.
pub fn check_version_skew(kubelet: &str, api_server: &str) -> anyhow::Result<()> {
    let kubelet_minor = minor_version(kubelet)?;
    let server_minor = minor_version(api_server)?;
    if kubelet_minor > server_minor {
        return Err(with_remediation(
            anyhow!("kubelet {kubelet} is newer than the API server {api_server}"),
            "Install a kubelet matching the cluster version with `nodeadm upgrade`, or upgrade the cluster first.",
        ));
    }
    if kubelet_minor + MAX_KUBELET_MINOR_SKEW < server_minor {
        return Err(with_remediation(
            anyhow!(
                "kubelet {kubelet} is more than {MAX_KUBELET_MINOR_SKEW} minor versions older than the API server {api_server}"
            ),
            "Upgrade the node with `nodeadm upgrade` to a version within the supported skew.",
        ));
    }
    Ok(())
}
