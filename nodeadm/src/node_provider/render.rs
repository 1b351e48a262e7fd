//! Rendering of the files the node provider writes: containerd and kubelet
//! configuration, the kubelet kubeconfig and environment, and the IAM Roles
//! Anywhere AWS config and refresh unit.
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use anyhow::{Context, bail};
use hybrid_api::node_config::{IamRolesAnywhere, NodeConfig};
use ipnet::IpNet;
use serde_json::{Value, json};

use crate::components::{iam_authenticator, image_credential_provider, kubelet};

pub const CONTAINERD_SOCKET: &str = "unix:///run/containerd/containerd.sock";
pub const DEFAULT_CERTIFICATE_PATH: &str = "/etc/iam/pki/server.pem";
pub const DEFAULT_PRIVATE_KEY_PATH: &str = "/etc/iam/pki/server.key";

const KUBELET_ARGS_VAR: &str = "NODEADM_KUBELET_ARGS";

/// The generated containerd config with the user's TOML merged on top.
pub fn containerd_config(user: &str) -> anyhow::Result<String> {
    let mut base: toml::Table = include_str!("../config_template/containerd.toml")
        .parse()
        .context("parsing containerd config template")?;
    if !user.trim().is_empty() {
        let overlay: toml::Table = user
            .parse()
            .context("parsing spec.containerd.config")?;
        merge_toml(&mut base, overlay);
    }
    toml::to_string(&base).context("serializing containerd config")
}

fn merge_toml(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_toml(existing, incoming)
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

fn merge_json(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(existing), Value::Object(incoming)) => {
            for (key, value) in incoming {
                match existing.get_mut(&key) {
                    Some(slot) => merge_json(slot, value),
                    None => {
                        existing.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// The tenth address of the service CIDR, where the cluster DNS service
/// lives.
pub fn cluster_dns(service_cidr: &str) -> anyhow::Result<IpAddr> {
    let net: IpNet = service_cidr
        .parse()
        .with_context(|| format!("invalid service CIDR {service_cidr:?}"))?;
    Ok(match net.network() {
        IpAddr::V4(v4) => IpAddr::V4(Ipv4Addr::from(u32::from(v4) + 10)),
        IpAddr::V6(v6) => IpAddr::V6(Ipv6Addr::from(u128::from(v6) + 10)),
    })
}

pub fn provider_id(config: &NodeConfig, node_name: &str) -> String {
    let cluster = &config.spec.cluster;
    format!("eks-hybrid:///{}/{}/{node_name}", cluster.region, cluster.name)
}

/// `KubeletConfiguration` with `spec.kubelet.config` merged on top.
pub fn kubelet_config(config: &NodeConfig, node_name: &str) -> anyhow::Result<Value> {
    let cluster = &config.spec.cluster;
    if cluster.cidr.is_empty() {
        bail!("spec.cluster.cidr is required to derive the cluster DNS address");
    }
    let mut rendered = json!({
        "apiVersion": "kubelet.config.k8s.io/v1beta1",
        "kind": "KubeletConfiguration",
        "address": "0.0.0.0",
        "authentication": {
            "anonymous": { "enabled": false },
            "webhook": { "enabled": true, "cacheTTL": "2m0s" },
            "x509": { "clientCAFile": kubelet::CA_CERT_PATH },
        },
        "authorization": {
            "mode": "Webhook",
            "webhook": { "cacheAuthorizedTTL": "5m0s", "cacheUnauthorizedTTL": "30s" },
        },
        "cgroupDriver": "systemd",
        "cgroupRoot": "/",
        "clusterDNS": [cluster_dns(&cluster.cidr)?.to_string()],
        "clusterDomain": "cluster.local",
        "containerRuntimeEndpoint": CONTAINERD_SOCKET,
        "evictionHard": {
            "memory.available": "100Mi",
            "nodefs.available": "10%",
            "nodefs.inodesFree": "5%",
        },
        "featureGates": { "RotateKubeletServerCertificate": true },
        "hairpinMode": "hairpin-veth",
        "protectKernelDefaults": true,
        "providerID": provider_id(config, node_name),
        "readOnlyPort": 0,
        "serializeImagePulls": false,
        "serverTLSBootstrap": true,
    });
    merge_json(&mut rendered, Value::Object(config.spec.kubelet.config.clone()));
    Ok(rendered)
}

fn aws_env(config: &NodeConfig, credentials_path: &str) -> Vec<(String, String)> {
    let mut env = Vec::new();
    let Some(iam) = config.iam_roles_anywhere() else {
        return env;
    };
    env.push(("AWS_CONFIG_FILE".to_string(), iam.aws_config_path().to_string()));
    let credentials_file = config
        .spec
        .hybrid
        .as_ref()
        .is_some_and(|h| h.enable_credentials_file);
    if credentials_file {
        env.push((
            "AWS_SHARED_CREDENTIALS_FILE".to_string(),
            credentials_path.to_string(),
        ));
    }
    env
}

/// Kubeconfig authenticating the kubelet through `aws-iam-authenticator`.
pub fn kubeconfig(config: &NodeConfig, credentials_path: &str) -> anyhow::Result<String> {
    let cluster = &config.spec.cluster;
    let env: Vec<Value> = aws_env(config, credentials_path)
        .into_iter()
        .map(|(name, value)| json!({ "name": name, "value": value }))
        .collect();
    let doc = json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{
            "name": "kubernetes",
            "cluster": {
                "certificate-authority": kubelet::CA_CERT_PATH,
                "server": cluster.api_server_endpoint,
            },
        }],
        "contexts": [{
            "name": "kubelet",
            "context": { "cluster": "kubernetes", "user": "kubelet" },
        }],
        "current-context": "kubelet",
        "users": [{
            "name": "kubelet",
            "user": {
                "exec": {
                    "apiVersion": "client.authentication.k8s.io/v1beta1",
                    "command": iam_authenticator::BINARY_PATH,
                    "args": ["token", "-i", cluster.name, "--region", cluster.region],
                    "env": env,
                },
            },
        }],
    });
    serde_yaml::to_string(&doc).context("serializing kubeconfig")
}

pub fn image_credential_provider_config(config: &NodeConfig, credentials_path: &str) -> Value {
    let env: Vec<Value> = aws_env(config, credentials_path)
        .into_iter()
        .map(|(name, value)| json!({ "name": name, "value": value }))
        .collect();
    json!({
        "apiVersion": "kubelet.config.k8s.io/v1",
        "kind": "CredentialProviderConfig",
        "providers": [{
            "name": "ecr-credential-provider",
            "matchImages": [
                "*.dkr.ecr.*.amazonaws.com",
                "*.dkr.ecr.*.amazonaws.com.cn",
                "*.dkr.ecr-fips.*.amazonaws.com",
                "*.dkr.ecr.*.c2s.ic.gov",
                "*.dkr.ecr.*.sc2s.sgov.gov",
            ],
            "defaultCacheDuration": "12h",
            "apiVersion": "credentialprovider.kubelet.k8s.io/v1",
            "env": env,
        }],
    })
}

/// Command line the kubelet unit expands from the environment file. The
/// node IP and hostname override come last so they win over user flags.
pub fn kubelet_args(config: &NodeConfig, node_name: &str, node_ip: IpAddr) -> Vec<String> {
    let mut args = vec![
        format!("--config={}", kubelet::CONFIG_PATH),
        format!("--kubeconfig={}", kubelet::KUBECONFIG_PATH),
        format!(
            "--image-credential-provider-bin-dir={}",
            image_credential_provider::BIN_DIR
        ),
        format!(
            "--image-credential-provider-config={}",
            image_credential_provider::CONFIG_PATH
        ),
    ];
    args.extend(
        config
            .spec
            .kubelet
            .flags
            .iter()
            .filter(|f| !f.starts_with("--node-ip="))
            .cloned(),
    );
    args.push(format!("--node-ip={node_ip}"));
    args.push(format!("--hostname-override={node_name}"));
    args
}

pub fn kubelet_environment(args: &[String]) -> String {
    format!("{KUBELET_ARGS_VAR}=\"{}\"\n", args.join(" "))
}

fn certificate_paths(iam: &IamRolesAnywhere) -> (&str, &str) {
    if iam.certificate_path.is_empty() {
        (DEFAULT_CERTIFICATE_PATH, DEFAULT_PRIVATE_KEY_PATH)
    } else {
        (iam.certificate_path.as_str(), iam.private_key_path.as_str())
    }
}

pub fn aws_config(iam: &IamRolesAnywhere, region: &str, signing_helper: &str) -> String {
    let (certificate_path, private_key_path) = certificate_paths(iam);
    format!(
        include_str!("../config_template/aws_config"),
        region = region,
        signing_helper = signing_helper,
        certificate_path = certificate_path,
        private_key_path = private_key_path,
        trust_anchor_arn = iam.trust_anchor_arn,
        profile_arn = iam.profile_arn,
        role_arn = iam.role_arn,
        node_name = iam.node_name,
    )
}

pub fn signing_helper_unit(
    iam: &IamRolesAnywhere,
    region: &str,
    signing_helper: &str,
    credentials_path: &str,
) -> String {
    let (certificate_path, private_key_path) = certificate_paths(iam);
    format!(
        include_str!("../config_template/aws_signing_helper_update.service"),
        node_name = iam.node_name,
        credentials_path = credentials_path,
        signing_helper = signing_helper,
        certificate_path = certificate_path,
        private_key_path = private_key_path,
        trust_anchor_arn = iam.trust_anchor_arn,
        profile_arn = iam.profile_arn,
        role_arn = iam.role_arn,
        region = region,
    )
}
