//! Loading, enrichment and validation of the `NodeConfig` document.
use std::path::Path;

use anyhow::{Context, bail};
use base64::Engine;
use hybrid_api::cluster::Cluster;
use hybrid_api::node_config::NodeConfig;

use crate::creds::get_credential_provider_from_node_config;

/// Loads a config from `file://<path>` or a bare path.
pub fn load(source: &str) -> anyhow::Result<NodeConfig> {
    if source.is_empty() {
        bail!("--config-source is required");
    }
    let path = match source.split_once("://") {
        Some(("file", path)) => path,
        Some((scheme, _)) => bail!("unsupported config source scheme {scheme:?}, only file:// is supported"),
        None => source,
    };
    let data = std::fs::read_to_string(Path::new(path))
        .with_context(|| format!("reading config {path}"))?;
    NodeConfig::from_yaml(&data).with_context(|| format!("parsing config {path}"))
}

/// Fills every empty cluster field from the cluster metadata. Fields the
/// user set are never overwritten.
pub fn enrich(config: &mut NodeConfig, cluster: &Cluster) {
    let details = &mut config.spec.cluster;
    fill(&mut details.api_server_endpoint, cluster.endpoint.as_deref());
    fill(
        &mut details.certificate_authority,
        cluster.certificate_authority.as_deref(),
    );
    fill(&mut details.cidr, cluster.service_ipv4_cidr.as_deref());
}

fn fill(field: &mut String, value: Option<&str>) {
    if field.is_empty() {
        if let Some(value) = value {
            *field = value.to_string();
        }
    }
}

/// Checks a hybrid node config. Errors name the offending field.
pub fn validate(config: &NodeConfig) -> anyhow::Result<()> {
    // reported whatever else is invalid
    if let Some(value) = config.kubelet_flag("hostname-override") {
        bail!(
            "hostname-override kubelet flag is not supported for hybrid nodes but found override: {value}"
        );
    }
    let cluster = &config.spec.cluster;
    if cluster.name.is_empty() {
        bail!("spec.cluster.name is missing in hybrid node configuration");
    }
    if cluster.region.is_empty() {
        bail!("spec.cluster.region is missing in hybrid node configuration");
    }

    get_credential_provider_from_node_config(config)?;

    if let Some(ssm) = config.ssm() {
        if ssm.activation_code.is_empty() {
            bail!("spec.hybrid.ssm.activationCode is missing in hybrid node configuration");
        }
        if ssm.activation_id.is_empty() {
            bail!("spec.hybrid.ssm.activationId is missing in hybrid node configuration");
        }
    }

    if let Some(iam) = config.iam_roles_anywhere() {
        let required = [
            ("nodeName", &iam.node_name),
            ("trustAnchorArn", &iam.trust_anchor_arn),
            ("profileArn", &iam.profile_arn),
            ("roleArn", &iam.role_arn),
        ];
        for (name, value) in required {
            if value.is_empty() {
                bail!("spec.hybrid.iamRolesAnywhere.{name} is missing in hybrid node configuration");
            }
        }
        if iam.node_name.len() > 64 {
            bail!("spec.hybrid.iamRolesAnywhere.nodeName can't be longer than 64 characters");
        }
        let has_cert = !iam.certificate_path.is_empty();
        let has_key = !iam.private_key_path.is_empty();
        if has_cert != has_key {
            bail!(
                "spec.hybrid.iamRolesAnywhere.certificatePath and privateKeyPath must both be set or both be empty"
            );
        }
    }

    if !cluster.certificate_authority.is_empty() {
        base64::engine::general_purpose::STANDARD
            .decode(cluster.certificate_authority.trim())
            .context("spec.cluster.certificateAuthority is not valid base64")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use hybrid_api::node_config::{HybridOptions, IamRolesAnywhere, Ssm};

    use super::*;

    fn ssm_config() -> NodeConfig {
        let mut config = NodeConfig::default();
        config.spec.cluster.name = "test".to_string();
        config.spec.cluster.region = "us-west-2".to_string();
        config.spec.hybrid = Some(HybridOptions {
            ssm: Some(Ssm {
                activation_code: "code".to_string(),
                activation_id: "id".to_string(),
            }),
            ..Default::default()
        });
        config
    }

    #[test]
    fn valid_ssm_config() {
        validate(&ssm_config()).unwrap();
    }

    #[test]
    fn missing_cluster_fields() {
        let mut config = ssm_config();
        config.spec.cluster.region.clear();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("spec.cluster.region"));
    }

    #[test]
    fn hostname_override_wins_over_other_errors() {
        let mut config = ssm_config();
        config.spec.cluster.name.clear();
        config.spec.cluster.region.clear();
        config.spec.hybrid = None;
        config.spec.kubelet.flags = vec![
            "--node-labels=a=b".to_string(),
            "--hostname-override=my-node".to_string(),
        ];
        let err = validate(&config).unwrap_err().to_string();
        assert!(err.contains("hostname-override"), "{err}");
        assert!(err.contains("my-node"), "{err}");
    }

    #[test]
    fn iam_roles_anywhere_fields() {
        let mut config = ssm_config();
        config.spec.hybrid = Some(HybridOptions {
            iam_roles_anywhere: Some(IamRolesAnywhere {
                node_name: "node-1".to_string(),
                trust_anchor_arn: "arn:ta".to_string(),
                profile_arn: "arn:profile".to_string(),
                role_arn: String::new(),
                ..Default::default()
            }),
            ..Default::default()
        });
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("roleArn"));
    }

    #[test]
    fn enrich_only_fills_empty_fields() {
        let mut config = ssm_config();
        config.spec.cluster.api_server_endpoint = "https://mine".to_string();
        let cluster = Cluster {
            name: "test".to_string(),
            endpoint: Some("https://eks".to_string()),
            certificate_authority: Some("Q0E=".to_string()),
            service_ipv4_cidr: Some("172.16.0.0/16".to_string()),
            ..Default::default()
        };
        enrich(&mut config, &cluster);
        assert_eq!(config.spec.cluster.api_server_endpoint, "https://mine");
        assert_eq!(config.spec.cluster.certificate_authority, "Q0E=");
        assert_eq!(config.spec.cluster.cidr, "172.16.0.0/16");
    }

    #[test]
    fn load_from_file_url() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodeConfig.yaml");
        std::fs::write(
            &path,
            "apiVersion: node.eks.aws/v1alpha1\nkind: NodeConfig\nspec:\n  cluster:\n    name: test\n    region: us-west-2\n",
        )
        .unwrap();
        let config = load(&format!("file://{}", path.display())).unwrap();
        assert_eq!(config.spec.cluster.name, "test");
        assert_eq!(load(&path.display().to_string()).unwrap(), config);
        assert!(load("s3://bucket/key").is_err());
        assert!(load("").is_err());
    }
}
