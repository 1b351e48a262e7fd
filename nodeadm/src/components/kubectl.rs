use async_trait::async_trait;

use super::{install_binary, remove_binary, upgrade_binary};
use crate::artifact::Artifact;
use crate::layout::HostLayout;
use crate::tracker::{self, Tracker};

pub const BINARY_PATH: &str = "/usr/local/bin/kubectl";

#[async_trait]
pub trait KubectlSource: Send + Sync {
    async fn get_kubectl(&self) -> anyhow::Result<Artifact>;
}

pub async fn install(
    layout: &HostLayout,
    tracker: &mut Tracker,
    source: &dyn KubectlSource,
) -> anyhow::Result<()> {
    let artifact = source.get_kubectl().await?;
    install_binary(layout, BINARY_PATH, &artifact)?;
    tracker.add(tracker::KUBECTL)?;
    Ok(())
}

pub async fn upgrade(layout: &HostLayout, source: &dyn KubectlSource) -> anyhow::Result<()> {
    let artifact = source.get_kubectl().await?;
    upgrade_binary(layout, BINARY_PATH, &artifact)?;
    Ok(())
}

pub fn uninstall(layout: &HostLayout) -> anyhow::Result<()> {
    remove_binary(layout, BINARY_PATH)
}
