use async_trait::async_trait;

use super::{install_binary, remove_binary, upgrade_binary};
use crate::artifact::Artifact;
use crate::layout::HostLayout;
use crate::tracker::{self, Tracker};

/// Used by the kubelet kubeconfig as its exec credential plugin.
pub const BINARY_PATH: &str = "/usr/local/bin/aws-iam-authenticator";

#[async_trait]
pub trait IamAuthenticatorSource: Send + Sync {
    async fn get_iam_authenticator(&self) -> anyhow::Result<Artifact>;
}

pub async fn install(
    layout: &HostLayout,
    tracker: &mut Tracker,
    source: &dyn IamAuthenticatorSource,
) -> anyhow::Result<()> {
    let artifact = source.get_iam_authenticator().await?;
    install_binary(layout, BINARY_PATH, &artifact)?;
    tracker.add(tracker::IAM_AUTHENTICATOR)?;
    Ok(())
}

pub async fn upgrade(layout: &HostLayout, source: &dyn IamAuthenticatorSource) -> anyhow::Result<()> {
    let artifact = source.get_iam_authenticator().await?;
    upgrade_binary(layout, BINARY_PATH, &artifact)?;
    Ok(())
}

pub fn uninstall(layout: &HostLayout) -> anyhow::Result<()> {
    remove_binary(layout, BINARY_PATH)
}
