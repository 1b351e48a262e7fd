//! Check that the node can obtain AWS credentials.
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, SdkConfig};
use aws_credential_types::provider::ProvideCredentials;
use aws_runtime::env_config::file::{EnvConfigFileKind, EnvConfigFiles};
use hybrid_api::node_config::NodeConfig;
use tracing::info;

use crate::remediation::with_remediation;

#[async_trait]
pub trait CredentialsLoader: Send + Sync {
    /// Resolves credentials once, returning the access key id.
    async fn load(&self) -> anyhow::Result<String>;
}

/// Resolves credentials through the default AWS provider chain, optionally
/// with an explicit config file such as the one written for IAM Roles
/// Anywhere.
pub struct ProfileCredentials {
    region: String,
    config_file: Option<PathBuf>,
}

impl ProfileCredentials {
    pub fn for_node(config: &NodeConfig) -> Self {
        Self {
            region: config.spec.cluster.region.clone(),
            config_file: config
                .iam_roles_anywhere()
                .map(|iam| PathBuf::from(iam.aws_config_path())),
        }
    }

    pub async fn sdk_config(&self) -> SdkConfig {
        load_sdk_config(&self.region, self.config_file.as_deref()).await
    }
}

/// Shared AWS SDK config for the node. `config_file` replaces the default
/// `~/.aws/config`, the default credentials file is still read.
pub async fn load_sdk_config(region: &str, config_file: Option<&Path>) -> SdkConfig {
    let mut loader = aws_config::defaults(BehaviorVersion::latest())
        .region(aws_config::Region::new(region.to_string()));
    if let Some(path) = config_file {
        loader = loader.profile_files(
            EnvConfigFiles::builder()
                .include_default_credentials_file(true)
                .with_file(EnvConfigFileKind::Config, path)
                .build(),
        );
    }
    loader.load().await
}

#[async_trait]
impl CredentialsLoader for ProfileCredentials {
    async fn load(&self) -> anyhow::Result<String> {
        let sdk_config = self.sdk_config().await;
        let provider = sdk_config
            .credentials_provider()
            .context("no AWS credentials provider configured")?;
        let credentials = provider
            .provide_credentials()
            .await
            .context("resolving AWS credentials")?;
        Ok(credentials.access_key_id().to_string())
    }
}

pub async fn check_aws_credentials(loader: &dyn CredentialsLoader) -> anyhow::Result<()> {
    match loader.load().await {
        Ok(key_id) if !key_id.is_empty() => {
            info!("resolved AWS credentials");
            Ok(())
        }
        Ok(_) => Err(with_remediation(
            anyhow!("AWS credentials resolved to an empty access key"),
            "Check the AWS credentials files on the node.",
        )),
        Err(e) => Err(with_remediation(
            e,
            "Ensure the SSM agent is registered, or that the IAM Roles Anywhere certificate, trust anchor, profile and role are valid and the signing helper can run.",
        )),
    }
}
