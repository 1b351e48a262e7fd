//! Cluster metadata from the EKS `DescribeCluster` API.
//!
//! The cluster is looked up at most once per process: [`CachedCluster`]
//! memoizes the first successful answer.
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use hybrid_api::cluster::{Cluster, RemoteNetworkConfig, RemoteNodeNetwork, RemotePodNetwork};
use tokio::sync::OnceCell;
use tracing::info;

#[async_trait]
pub trait ClusterDescriber: Send + Sync {
    async fn describe_cluster(&self, name: &str) -> anyhow::Result<Cluster>;
}

pub struct EksClusterDescriber {
    client: aws_sdk_eks::Client,
}

impl EksClusterDescriber {
    pub fn new(config: &aws_config::SdkConfig) -> Self {
        Self {
            client: aws_sdk_eks::Client::new(config),
        }
    }
}

#[async_trait]
impl ClusterDescriber for EksClusterDescriber {
    async fn describe_cluster(&self, name: &str) -> anyhow::Result<Cluster> {
        info!("describing cluster {name}");
        let output = self
            .client
            .describe_cluster()
            .name(name)
            .send()
            .await
            .with_context(|| format!("describing cluster {name}"))?;
        let cluster = output
            .cluster()
            .with_context(|| format!("cluster {name} not found"))?;

        let remote_network_config = cluster.remote_network_config().map(|c| RemoteNetworkConfig {
            remote_node_networks: c
                .remote_node_networks()
                .iter()
                .map(|n| RemoteNodeNetwork {
                    cidrs: n.cidrs().to_vec(),
                })
                .collect(),
            remote_pod_networks: c
                .remote_pod_networks()
                .iter()
                .map(|n| RemotePodNetwork {
                    cidrs: n.cidrs().to_vec(),
                })
                .collect(),
        });

        Ok(Cluster {
            name: cluster.name().unwrap_or(name).to_string(),
            endpoint: cluster.endpoint().map(str::to_string),
            certificate_authority: cluster
                .certificate_authority()
                .and_then(|ca| ca.data())
                .map(str::to_string),
            service_ipv4_cidr: cluster
                .kubernetes_network_config()
                .and_then(|c| c.service_ipv4_cidr())
                .map(str::to_string),
            version: cluster.version().map(str::to_string),
            remote_network_config,
        })
    }
}

/// A describer that answers from the first successful call.
pub struct CachedCluster {
    inner: Arc<dyn ClusterDescriber>,
    cluster: OnceCell<Cluster>,
}

impl CachedCluster {
    pub fn new(inner: Arc<dyn ClusterDescriber>) -> Self {
        Self {
            inner,
            cluster: OnceCell::new(),
        }
    }

    pub async fn get(&self, name: &str) -> anyhow::Result<&Cluster> {
        self.cluster
            .get_or_try_init(|| self.inner.describe_cluster(name))
            .await
    }
}
