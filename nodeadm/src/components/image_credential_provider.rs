//! The kubelet image credential provider plugin for ECR.
use async_trait::async_trait;

use super::{install_binary, upgrade_binary};
use crate::artifact::Artifact;
use crate::layout::HostLayout;
use crate::tracker::{self, Tracker};

pub const BIN_DIR: &str = "/etc/eks/image-credential-provider";
pub const BINARY_PATH: &str = "/etc/eks/image-credential-provider/ecr-credential-provider";
pub const CONFIG_PATH: &str = "/etc/eks/image-credential-provider/config.json";

#[async_trait]
pub trait ImageCredentialProviderSource: Send + Sync {
    async fn get_image_credential_provider(&self) -> anyhow::Result<Artifact>;
}

pub async fn install(
    layout: &HostLayout,
    tracker: &mut Tracker,
    source: &dyn ImageCredentialProviderSource,
) -> anyhow::Result<()> {
    let artifact = source.get_image_credential_provider().await?;
    install_binary(layout, BINARY_PATH, &artifact)?;
    tracker.add(tracker::IMAGE_CREDENTIAL_PROVIDER)?;
    Ok(())
}

pub async fn upgrade(
    layout: &HostLayout,
    source: &dyn ImageCredentialProviderSource,
) -> anyhow::Result<()> {
    let artifact = source.get_image_credential_provider().await?;
    upgrade_binary(layout, BINARY_PATH, &artifact)?;
    Ok(())
}

/// Removes the plugin directory, including the config written at init.
pub fn uninstall(layout: &HostLayout) -> anyhow::Result<()> {
    utils::fs_ext::remove_dir_all_if_exists(layout.resolve(BIN_DIR))
}
