//! Cluster metadata as returned by the `DescribeCluster` API, reduced to the
//! fields a hybrid node needs.
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    pub name: String,
    pub endpoint: Option<String>,
    /// Base64 encoded certificate authority data.
    pub certificate_authority: Option<String>,
    pub service_ipv4_cidr: Option<String>,
    /// Kubernetes `major.minor` version of the control plane.
    pub version: Option<String>,
    pub remote_network_config: Option<RemoteNetworkConfig>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteNetworkConfig {
    #[serde(default)]
    pub remote_node_networks: Vec<RemoteNodeNetwork>,
    #[serde(default)]
    pub remote_pod_networks: Vec<RemotePodNetwork>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteNodeNetwork {
    #[serde(default)]
    pub cidrs: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RemotePodNetwork {
    #[serde(default)]
    pub cidrs: Vec<String>,
}

impl Cluster {
    /// Remote node networks in the order the API returned them. Empty when
    /// the cluster has no remote network config at all.
    pub fn remote_node_networks(&self) -> &[RemoteNodeNetwork] {
        self.remote_network_config
            .as_ref()
            .map(|c| c.remote_node_networks.as_slice())
            .unwrap_or_default()
    }
}
