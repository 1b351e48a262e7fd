//! Checks against the node object in the cluster.
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::ListParams;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::poll;
use crate::remediation::with_remediation;

#[async_trait]
pub trait NodeStatusSource: Send + Sync {
    /// `None` when the node is not registered.
    async fn get_node(&self, name: &str) -> anyhow::Result<Option<Node>>;
    async fn list_pods_on_node(&self, name: &str) -> anyhow::Result<Vec<Pod>>;
}

/// Talks to the API server with the kubelet's kubeconfig. The client is
/// built on first use, so this can be created before init writes the file.
pub struct KubeNodeStatus {
    kubeconfig: PathBuf,
    client: OnceCell<Client>,
}

impl KubeNodeStatus {
    pub fn new(kubeconfig: impl Into<PathBuf>) -> Self {
        Self {
            kubeconfig: kubeconfig.into(),
            client: OnceCell::new(),
        }
    }

    async fn client(&self) -> anyhow::Result<Client> {
        let client = self
            .client
            .get_or_try_init(|| connect(&self.kubeconfig))
            .await?;
        Ok(client.clone())
    }
}

async fn connect(path: &Path) -> anyhow::Result<Client> {
    let kubeconfig = Kubeconfig::read_from(path)
        .with_context(|| format!("reading kubeconfig {}", path.display()))?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .context("loading kubeconfig")?;
    Client::try_from(config).context("creating kubernetes client")
}

#[async_trait]
impl NodeStatusSource for KubeNodeStatus {
    async fn get_node(&self, name: &str) -> anyhow::Result<Option<Node>> {
        let nodes: Api<Node> = Api::all(self.client().await?);
        nodes
            .get_opt(name)
            .await
            .with_context(|| format!("getting node {name}"))
    }

    async fn list_pods_on_node(&self, name: &str) -> anyhow::Result<Vec<Pod>> {
        let pods: Api<Pod> = Api::all(self.client().await?);
        let params = ListParams::default().fields(&format!("spec.nodeName={name}"));
        let list = pods
            .list(&params)
            .await
            .with_context(|| format!("listing pods on node {name}"))?;
        Ok(list.items)
    }
}

pub fn is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

pub fn is_cordoned(node: &Node) -> bool {
    node.spec
        .as_ref()
        .and_then(|s| s.unschedulable)
        .unwrap_or(false)
}

fn is_daemonset_pod(pod: &Pod) -> bool {
    pod.metadata
        .owner_references
        .as_ref()
        .is_some_and(|owners| owners.iter().any(|o| o.kind == "DaemonSet"))
}

fn is_finished(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded" | "Failed")
    )
}

/// Waits for the node object to appear.
pub async fn wait_for_registration(
    nodes: Arc<dyn NodeStatusSource>,
    name: &str,
    timeout: Duration,
    interval: Duration,
    cancel: &CancellationToken,
) -> anyhow::Result<Node> {
    let name = name.to_string();
    let description = format!("node {name} to register");
    poll(&description, timeout, interval, cancel, move || {
        let nodes = nodes.clone();
        let name = name.clone();
        async move { nodes.get_node(&name).await }
    })
    .await
    .map_err(|e| {
        with_remediation(
            e,
            "Check the kubelet logs with `journalctl -u kubelet` and ensure the node's credentials map to a node role in the cluster's access entries.",
        )
    })
}

pub async fn wait_for_ready(
    nodes: Arc<dyn NodeStatusSource>,
    name: &str,
    timeout: Duration,
    interval: Duration,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let name = name.to_string();
    let description = format!("node {name} to be ready");
    poll(&description, timeout, interval, cancel, move || {
        let nodes = nodes.clone();
        let name = name.clone();
        async move {
            let node = nodes.get_node(&name).await?;
            Ok(node.as_ref().filter(|n| is_ready(n)).map(|_| ()))
        }
    })
    .await?;
    info!("node is ready");
    Ok(())
}

/// A registered node must be cordoned before it is uninstalled.
pub async fn check_cordoned(nodes: &dyn NodeStatusSource, name: &str) -> anyhow::Result<()> {
    match nodes.get_node(name).await? {
        None => {
            info!("node {name} is not registered with the cluster");
            Ok(())
        }
        Some(node) if is_cordoned(&node) => Ok(()),
        Some(_) => Err(with_remediation(
            anyhow!("node {name} is not cordoned"),
            format!("Drain the node first: `kubectl drain {name} --ignore-daemonsets`"),
        )),
    }
}

/// Only DaemonSet and finished pods may remain on a node being removed.
pub async fn check_no_workload_pods(nodes: &dyn NodeStatusSource, name: &str) -> anyhow::Result<()> {
    let remaining: Vec<String> = nodes
        .list_pods_on_node(name)
        .await?
        .iter()
        .filter(|p| !is_daemonset_pod(p) && !is_finished(p))
        .map(|p| {
            format!(
                "{}/{}",
                p.metadata.namespace.as_deref().unwrap_or("default"),
                p.metadata.name.as_deref().unwrap_or_default()
            )
        })
        .collect();
    if remaining.is_empty() {
        return Ok(());
    }
    Err(with_remediation(
        anyhow!(
            "{} pods are still running on node {name}: {}",
            remaining.len(),
            remaining.join(", ")
        ),
        format!("Drain the node first: `kubectl drain {name} --ignore-daemonsets`"),
    ))
}
