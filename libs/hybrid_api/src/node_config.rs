//! `NodeConfig` represents the contents of the node configuration document.
//!
//! The document is passed to `nodeadm init` and `nodeadm upgrade` through
//! `--config-source`. It carries the identity of the cluster the node joins,
//! the credential mechanism used to authenticate the node, and optional
//! kubelet and containerd overrides.
use serde::{Deserialize, Serialize};

pub const API_VERSION: &str = "node.eks.aws/v1alpha1";
pub const KIND: &str = "NodeConfig";

/// Default location of the AWS config file written for IAM Roles Anywhere.
pub const DEFAULT_AWS_CONFIG_PATH: &str = "/etc/aws/hybrid/config";

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub spec: NodeConfigSpec,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfigSpec {
    #[serde(default)]
    pub cluster: ClusterDetails,
    pub hybrid: Option<HybridOptions>,
    #[serde(default)]
    pub kubelet: KubeletOptions,
    #[serde(default)]
    pub containerd: ContainerdOptions,
}

/// Cluster identity. Every empty field is filled in from `DescribeCluster`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDetails {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub api_server_endpoint: String,
    /// Base64 encoded PEM bundle of the cluster certificate authority.
    #[serde(default)]
    pub certificate_authority: String,
    /// Service IPv4 CIDR.
    #[serde(default)]
    pub cidr: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HybridOptions {
    #[serde(default)]
    pub enable_credentials_file: bool,
    pub iam_roles_anywhere: Option<IamRolesAnywhere>,
    pub ssm: Option<Ssm>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IamRolesAnywhere {
    #[serde(default)]
    pub node_name: String,
    #[serde(default)]
    pub trust_anchor_arn: String,
    #[serde(default)]
    pub profile_arn: String,
    #[serde(default)]
    pub role_arn: String,
    #[serde(default)]
    pub assume_role_arn: Option<String>,
    #[serde(default)]
    pub certificate_path: String,
    #[serde(default)]
    pub private_key_path: String,
    #[serde(default)]
    pub aws_config_path: Option<String>,
}

impl IamRolesAnywhere {
    pub fn aws_config_path(&self) -> &str {
        self.aws_config_path
            .as_deref()
            .filter(|p| !p.is_empty())
            .unwrap_or(DEFAULT_AWS_CONFIG_PATH)
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Ssm {
    #[serde(default)]
    pub activation_code: String,
    #[serde(default)]
    pub activation_id: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KubeletOptions {
    /// Overrides merged on top of the generated `KubeletConfiguration`.
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
    /// Extra command line flags, `--name=value`.
    #[serde(default)]
    pub flags: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerdOptions {
    /// Inline TOML merged on top of the generated containerd config.
    #[serde(default)]
    pub config: String,
}

impl NodeConfig {
    pub fn from_yaml(data: &str) -> anyhow::Result<Self> {
        let config: NodeConfig = serde_yaml::from_str(data)?;
        if !config.api_version.is_empty() && config.api_version != API_VERSION {
            anyhow::bail!(
                "unsupported apiVersion {:?}, expected {API_VERSION:?}",
                config.api_version
            );
        }
        if !config.kind.is_empty() && config.kind != KIND {
            anyhow::bail!("unsupported kind {:?}, expected {KIND:?}", config.kind);
        }
        Ok(config)
    }

    pub fn ssm(&self) -> Option<&Ssm> {
        self.spec.hybrid.as_ref().and_then(|h| h.ssm.as_ref())
    }

    pub fn iam_roles_anywhere(&self) -> Option<&IamRolesAnywhere> {
        self.spec
            .hybrid
            .as_ref()
            .and_then(|h| h.iam_roles_anywhere.as_ref())
    }

    pub fn is_ssm(&self) -> bool {
        self.ssm().is_some()
    }

    pub fn is_iam_roles_anywhere(&self) -> bool {
        self.iam_roles_anywhere().is_some()
    }

    pub fn is_hybrid(&self) -> bool {
        self.spec.hybrid.is_some()
    }

    /// Decodes the base64 certificate authority bundle.
    pub fn certificate_authority_pem(&self) -> anyhow::Result<Vec<u8>> {
        use base64::Engine;
        let ca = self.spec.cluster.certificate_authority.trim();
        Ok(base64::engine::general_purpose::STANDARD.decode(ca)?)
    }

    /// Returns the value of `--<name>=<value>` from the kubelet flags.
    pub fn kubelet_flag(&self, name: &str) -> Option<&str> {
        let prefix = format!("--{name}=");
        self.spec
            .kubelet
            .flags
            .iter()
            .rev()
            .find_map(|flag| flag.strip_prefix(prefix.as_str()))
    }
}
