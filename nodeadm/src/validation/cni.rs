//! Detection of the CNI running on the node.
//!
//! Evidence is gathered from four places, most local first: plugin binaries
//! in `/opt/cni/bin`, config files in `/etc/cni/net.d`, the reason on the
//! node's `NetworkUnavailable` condition and finally the node's taints.
//! Cilium wins over Calico whenever both show up in the same place.
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Node;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::node::NodeStatusSource;
use super::poll;
use crate::components::cni_plugins::{BIN_DIR, CONF_DIR};
use crate::layout::HostLayout;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cni {
    Cilium,
    Calico,
}

impl Cni {
    /// The VXLAN port the CNI needs open between nodes.
    pub fn vxlan_port(self) -> u16 {
        match self {
            Cni::Cilium => 8472,
            Cni::Calico => 4789,
        }
    }
}

impl fmt::Display for Cni {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Cni::Cilium => "cilium",
            Cni::Calico => "calico",
        })
    }
}

fn pick(cilium: bool, calico: bool) -> Option<Cni> {
    match (cilium, calico) {
        (true, _) => Some(Cni::Cilium),
        (false, true) => Some(Cni::Calico),
        (false, false) => None,
    }
}

fn dir_entries(dir: &Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default()
}

pub fn detect_from_binaries(bin_dir: &Path) -> Option<Cni> {
    let names = dir_entries(bin_dir);
    pick(
        names.iter().any(|n| n == "cilium-cni"),
        names.iter().any(|n| n == "calico"),
    )
}

pub fn detect_from_config(conf_dir: &Path) -> Option<Cni> {
    let names = dir_entries(conf_dir);
    pick(
        names.iter().any(|n| n.contains("cilium")),
        names.iter().any(|n| n.contains("calico")),
    )
}

pub fn detect_from_node_conditions(node: &Node) -> Option<Cni> {
    let conditions = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_deref())
        .unwrap_or_default();
    let reasons: Vec<&str> = conditions
        .iter()
        .filter(|c| c.type_ == "NetworkUnavailable")
        .filter_map(|c| c.reason.as_deref())
        .collect();
    pick(
        reasons.contains(&"CiliumIsUp"),
        reasons.contains(&"CalicoIsUp"),
    )
}

pub fn detect_from_taints(node: &Node) -> Option<Cni> {
    let taints = node
        .spec
        .as_ref()
        .and_then(|s| s.taints.as_deref())
        .unwrap_or_default();
    pick(
        taints.iter().any(|t| t.key.contains("cilium")),
        taints.iter().any(|t| t.key.contains("calico")),
    )
}

/// Checks the local tiers.
pub fn detect_local(layout: &HostLayout) -> Option<Cni> {
    detect_from_binaries(&layout.resolve(BIN_DIR)).or_else(|| detect_from_config(&layout.resolve(CONF_DIR)))
}

/// Checks all four tiers with an already fetched node.
pub fn detect(layout: &HostLayout, node: Option<&Node>) -> Option<Cni> {
    detect_local(layout).or_else(|| {
        let node = node?;
        detect_from_node_conditions(node).or_else(|| detect_from_taints(node))
    })
}

/// Waits until a CNI is detected on the node.
pub async fn wait_for_cni(
    layout: &HostLayout,
    nodes: Arc<dyn NodeStatusSource>,
    node_name: &str,
    timeout: Duration,
    interval: Duration,
    cancel: &CancellationToken,
) -> anyhow::Result<Cni> {
    let layout = layout.clone();
    let node_name = node_name.to_string();
    let cni = poll("CNI detection", timeout, interval, cancel, move || {
        let layout = layout.clone();
        let nodes = nodes.clone();
        let node_name = node_name.clone();
        async move {
            if let Some(cni) = detect_local(&layout) {
                return Ok(Some(cni));
            }
            let node = nodes.get_node(&node_name).await?;
            Ok(detect(&layout, node.as_ref()))
        }
    })
    .await?;
    info!("detected {cni} CNI");
    Ok(cni)
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{NodeCondition, NodeSpec, NodeStatus, Taint};

    use super::*;

    fn touch(dir: &Path, name: &str) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join(name), b"").unwrap();
    }

    fn node(reasons: &[&str], taints: &[&str]) -> Node {
        Node {
            spec: Some(NodeSpec {
                taints: Some(
                    taints
                        .iter()
                        .map(|k| Taint {
                            key: k.to_string(),
                            effect: "NoSchedule".to_string(),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            status: Some(NodeStatus {
                conditions: Some(
                    reasons
                        .iter()
                        .map(|r| NodeCondition {
                            type_: "NetworkUnavailable".to_string(),
                            status: "False".to_string(),
                            reason: Some(r.to_string()),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn cilium_wins_every_tier() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("bin"), "calico");
        touch(&dir.path().join("bin"), "cilium-cni");
        assert_eq!(detect_from_binaries(&dir.path().join("bin")), Some(Cni::Cilium));

        touch(&dir.path().join("conf"), "10-calico.conflist");
        touch(&dir.path().join("conf"), "05-cilium.conflist");
        assert_eq!(detect_from_config(&dir.path().join("conf")), Some(Cni::Cilium));

        let both = node(&["CalicoIsUp", "CiliumIsUp"], &[]);
        assert_eq!(detect_from_node_conditions(&both), Some(Cni::Cilium));

        let both = node(&[], &["node.cilium.io/agent-not-ready", "projectcalico.org/not-ready"]);
        assert_eq!(detect_from_taints(&both), Some(Cni::Cilium));
    }

    #[test]
    fn tiers_fall_through_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let layout = HostLayout::with_root(dir.path());
        assert_eq!(detect(&layout, None), None);

        let calico_node = node(&["CalicoIsUp"], &[]);
        assert_eq!(detect(&layout, Some(&calico_node)), Some(Cni::Calico));

        touch(&layout.resolve(CONF_DIR), "05-cilium.conflist");
        assert_eq!(detect(&layout, Some(&calico_node)), Some(Cni::Cilium));

        touch(&layout.resolve(BIN_DIR), "calico");
        assert_eq!(detect(&layout, Some(&calico_node)), Some(Cni::Calico));
    }

    #[test]
    fn vxlan_ports() {
        assert_eq!(Cni::Cilium.vxlan_port(), 8472);
        assert_eq!(Cni::Calico.vxlan_port(), 4789);
    }
}
