//! Turns a `NodeConfig` into a configured hybrid node.
//!
//! The provider owns the config for the duration of a command. Callers drive
//! it step by step: validate, register credentials, enrich from the cluster,
//! validate the environment, write configuration and start the daemons.
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, anyhow};
use hybrid_api::cluster::Cluster;
use hybrid_api::node_config::NodeConfig;
use tracing::{info, warn};

use crate::cluster::CachedCluster;
use crate::components::ssm::SsmAgent;
use crate::components::{containerd, iam_roles_anywhere, image_credential_provider, kubelet};
use crate::config;
use crate::creds::{
    CredentialProvider, get_credential_provider_from_node_config, validate_credential_provider,
};
use crate::host::Host;
use crate::validation::certificate;
use crate::validation::credentials::{CredentialsLoader, check_aws_credentials};
use crate::validation::network::{self, ENDPOINT_TIMEOUT, HostNetwork};
use crate::validation::system;
use crate::validation::{Phase, Runner};

pub mod render;

/// Everything a [`NodeProvider`] is built from.
pub struct NodeProviderOptions {
    pub host: Host,
    pub config: NodeConfig,
    pub cluster: Arc<CachedCluster>,
    pub network: Arc<dyn HostNetwork>,
    pub credentials: Arc<dyn CredentialsLoader>,
}

pub struct NodeProvider {
    host: Host,
    config: NodeConfig,
    cluster: Arc<CachedCluster>,
    network: Arc<dyn HostNetwork>,
    credentials: Arc<dyn CredentialsLoader>,
    ssm: SsmAgent,
    described: Option<Cluster>,
}

impl NodeProvider {
    pub fn new(options: NodeProviderOptions) -> Self {
        Self {
            ssm: SsmAgent::new(&options.host),
            host: options.host,
            config: options.config,
            cluster: options.cluster,
            network: options.network,
            credentials: options.credentials,
            described: None,
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn validate_config(&self) -> anyhow::Result<CredentialProvider> {
        config::validate(&self.config)?;
        let provider = get_credential_provider_from_node_config(&self.config)?;
        validate_credential_provider(provider, &self.host.os)?;
        Ok(provider)
    }

    /// Fills empty cluster fields from `DescribeCluster`.
    pub async fn enrich_config(&mut self) -> anyhow::Result<()> {
        let name = self.config.spec.cluster.name.clone();
        let cluster = self
            .cluster
            .get(&name)
            .await
            .context("looking up cluster details")?
            .clone();
        config::enrich(&mut self.config, &cluster);
        self.described = Some(cluster);
        Ok(())
    }

    fn described(&self) -> anyhow::Result<&Cluster> {
        self.described
            .as_ref()
            .ok_or_else(|| anyhow!("cluster details have not been loaded"))
    }

    fn credentials_file_enabled(&self) -> bool {
        self.config
            .spec
            .hybrid
            .as_ref()
            .is_some_and(|h| h.enable_credentials_file)
    }

    /// Sets up the node's AWS credentials: SSM registration, or the IAM
    /// Roles Anywhere AWS config and refresh service.
    pub fn pre_process_daemon(&self) -> anyhow::Result<()> {
        let region = self.config.spec.cluster.region.as_str();
        if let Some(ssm) = self.config.ssm() {
            return self.ssm.register(ssm, region);
        }
        let Some(iam) = self.config.iam_roles_anywhere() else {
            return Ok(());
        };
        let layout = &self.host.layout;
        let signing_helper = iam_roles_anywhere::SIGNING_HELPER_PATH;
        utils::fs_ext::write_file(
            layout.resolve(iam.aws_config_path()),
            render::aws_config(iam, region, signing_helper),
            0o644,
        )?;
        info!("wrote AWS config to {}", iam.aws_config_path());

        if self.credentials_file_enabled() {
            utils::fs_ext::write_file(
                layout.resolve(iam_roles_anywhere::UNIT_PATH),
                render::signing_helper_unit(
                    iam,
                    region,
                    signing_helper,
                    iam_roles_anywhere::CREDENTIALS_PATH,
                ),
                0o644,
            )?;
            let daemons = &self.host.daemons;
            daemons.daemon_reload()?;
            daemons.enable_daemon(iam_roles_anywhere::DAEMON_NAME)?;
            daemons.restart_daemon(iam_roles_anywhere::DAEMON_NAME)?;
        }
        Ok(())
    }

    /// The name the node registers under: the IAM Roles Anywhere node name,
    /// or the SSM managed instance id.
    pub fn node_name(&self) -> anyhow::Result<String> {
        if let Some(iam) = self.config.iam_roles_anywhere() {
            return Ok(iam.node_name.clone());
        }
        let registration = self.ssm.registration()?.ok_or_else(|| {
            anyhow!("node is not registered with SSM, run `nodeadm init` without skipping preprocess")
        })?;
        Ok(registration.managed_instance_id)
    }

    pub async fn node_ip(&self) -> anyhow::Result<IpAddr> {
        network::resolve_node_ip(&self.config, self.network.as_ref()).await
    }

    pub async fn validate_node_ip(&self) -> anyhow::Result<()> {
        let ip = self.node_ip().await?;
        network::validate_ip_in_remote_node_networks(ip, self.described()?.remote_node_networks())
    }

    /// Checks the kubelet serving certificate. At init the kubelet replaces
    /// a missing or out of date certificate itself, so those are warnings.
    pub fn validate_kubelet_cert(&self, at_init: bool) -> anyhow::Result<()> {
        let path = self.host.layout.resolve(certificate::KUBELET_CERT_PATH);
        let ca = self.config.certificate_authority_pem()?;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();
        match certificate::validate_certificate(&path, &ca, now) {
            Ok(()) => Ok(()),
            Err(e) if at_init && !e.fatal_at_init() => {
                warn!(remediation = e.remediation(), "{e}");
                Ok(())
            }
            Err(e) => Err(certificate::into_remediated(e)),
        }
    }

    pub fn validate_version_skew(&self) -> anyhow::Result<()> {
        let server = self
            .described()?
            .version
            .clone()
            .context("cluster version is unknown")?;
        let kubelet = kubelet::version(self.host.runner.as_ref(), &self.host.layout)?;
        system::check_version_skew(&kubelet, &server)
    }

    /// Runs the environment checks that gate configuration.
    pub async fn run_validations(&self, runner: &Runner<'_>, at_init: bool) -> anyhow::Result<()> {
        runner
            .run(Phase::NodeIpValidation, "validating node IP", || self.validate_node_ip())
            .await?;
        runner
            .run(
                Phase::ApiServerEndpointResolutionValidation,
                "validating API server endpoint reachability",
                || {
                    network::check_endpoint_reachable(
                        &self.config.spec.cluster.api_server_endpoint,
                        ENDPOINT_TIMEOUT,
                    )
                },
            )
            .await?;
        runner
            .run(Phase::AwsCredentialsValidation, "validating AWS credentials", || {
                check_aws_credentials(self.credentials.as_ref())
            })
            .await?;
        runner
            .run(Phase::NtpSyncValidation, "validating NTP synchronization", || async {
                system::check_ntp_sync(self.host.runner.as_ref())
            })
            .await?;
        runner
            .run(Phase::KubeletVersionSkewValidation, "validating kubelet version skew", || async {
                self.validate_version_skew()
            })
            .await?;
        runner
            .run(Phase::KubeletCertValidation, "validating kubelet certificate", || async {
                self.validate_kubelet_cert(at_init)
            })
            .await?;
        Ok(())
    }

    /// Writes containerd, kubelet and credential provider configuration.
    pub async fn configure(&self) -> anyhow::Result<()> {
        let layout = &self.host.layout;
        let node_name = self.node_name()?;
        let node_ip = self.node_ip().await?;
        let credentials_path = iam_roles_anywhere::CREDENTIALS_PATH;

        utils::fs_ext::write_file(
            layout.resolve(containerd::CONFIG_PATH),
            render::containerd_config(&self.config.spec.containerd.config)?,
            0o644,
        )?;

        utils::fs_ext::write_file(
            layout.resolve(kubelet::CA_CERT_PATH),
            self.config.certificate_authority_pem()?,
            0o644,
        )?;
        let kubelet_config = render::kubelet_config(&self.config, &node_name)?;
        utils::fs_ext::write_file(
            layout.resolve(kubelet::CONFIG_PATH),
            serde_json::to_vec_pretty(&kubelet_config)?,
            0o644,
        )?;
        utils::fs_ext::write_file(
            layout.resolve(kubelet::KUBECONFIG_PATH),
            render::kubeconfig(&self.config, credentials_path)?,
            0o600,
        )?;
        let args = render::kubelet_args(&self.config, &node_name, node_ip);
        utils::fs_ext::write_file(
            layout.resolve(kubelet::ENV_FILE_PATH),
            render::kubelet_environment(&args),
            0o644,
        )?;
        utils::fs_ext::write_file(
            layout.resolve(image_credential_provider::CONFIG_PATH),
            serde_json::to_vec_pretty(&render::image_credential_provider_config(
                &self.config,
                credentials_path,
            ))?,
            0o644,
        )?;
        info!(%node_ip, "configured node {node_name}");
        Ok(())
    }

    pub fn ensure_daemons(&self) -> anyhow::Result<()> {
        let daemons = &self.host.daemons;
        daemons.daemon_reload()?;
        for daemon in [containerd::DAEMON_NAME, kubelet::DAEMON_NAME] {
            daemons.enable_daemon(daemon)?;
            daemons.restart_daemon(daemon)?;
        }
        Ok(())
    }

    /// Removes the credentials refresh service when the config no longer
    /// asks for a credentials file.
    pub fn cleanup(&self) -> anyhow::Result<()> {
        if self.config.iam_roles_anywhere().is_none() || self.credentials_file_enabled() {
            return Ok(());
        }
        let unit = self.host.layout.resolve(iam_roles_anywhere::UNIT_PATH);
        if !unit.exists() {
            return Ok(());
        }
        info!(
            "removing {} as the credentials file is disabled",
            iam_roles_anywhere::DAEMON_NAME
        );
        self.host.daemons.stop_daemon(iam_roles_anywhere::DAEMON_NAME)?;
        self.host.daemons.disable_daemon(iam_roles_anywhere::DAEMON_NAME)?;
        utils::fs_ext::remove_file_if_exists(&unit)?;
        self.host.daemons.daemon_reload()
    }
}
