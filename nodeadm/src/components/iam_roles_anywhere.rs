//! The IAM Roles Anywhere signing helper.
//!
//! The helper is both the `credential_process` of the node's AWS config and,
//! when a credentials file is requested, a long running service that keeps
//! that file fresh. The service unit itself is written at init, once the
//! node's certificate and role are known.
use async_trait::async_trait;
use tracing::info;

use super::{install_binary, remove_binary, upgrade_binary};
use crate::artifact::Artifact;
use crate::host::Host;
use crate::layout::HostLayout;
use crate::tracker::{self, Tracker};

pub const SIGNING_HELPER_PATH: &str = "/usr/local/bin/aws_signing_helper";
pub const DAEMON_NAME: &str = "aws_signing_helper_update";
pub const UNIT_PATH: &str = "/etc/systemd/system/aws_signing_helper_update.service";
pub const CREDENTIALS_PATH: &str = "/eks-hybrid/.aws/credentials";
pub const CONFIG_DIR: &str = "/etc/aws/hybrid";

#[async_trait]
pub trait SigningHelperSource: Send + Sync {
    async fn get_signing_helper(&self) -> anyhow::Result<Artifact>;
}

pub async fn install(
    layout: &HostLayout,
    tracker: &mut Tracker,
    source: &dyn SigningHelperSource,
) -> anyhow::Result<()> {
    let artifact = source.get_signing_helper().await?;
    install_binary(layout, SIGNING_HELPER_PATH, &artifact)?;
    tracker.add(tracker::IAM_ROLES_ANYWHERE)?;
    Ok(())
}

pub async fn upgrade(layout: &HostLayout, source: &dyn SigningHelperSource) -> anyhow::Result<()> {
    let artifact = source.get_signing_helper().await?;
    upgrade_binary(layout, SIGNING_HELPER_PATH, &artifact)?;
    Ok(())
}

pub fn uninstall(host: &Host) -> anyhow::Result<()> {
    let layout = &host.layout;
    if layout.resolve(UNIT_PATH).exists() {
        host.daemons.stop_daemon(DAEMON_NAME)?;
        host.daemons.disable_daemon(DAEMON_NAME)?;
        utils::fs_ext::remove_file_if_exists(layout.resolve(UNIT_PATH))?;
    }
    remove_binary(layout, SIGNING_HELPER_PATH)?;
    utils::fs_ext::remove_dir_all_if_exists(layout.resolve(CONFIG_DIR))?;
    if let Some(dir) = layout.resolve(CREDENTIALS_PATH).parent() {
        utils::fs_ext::remove_dir_all_if_exists(dir)?;
    }
    info!("removed aws_signing_helper");
    Ok(())
}
