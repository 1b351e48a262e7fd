//! containerd, installed as an OS package from the distribution or from
//! Docker's repository.
//!
//! A containerd that was already on the host (both `containerd` and `runc`
//! on `PATH`) is recorded with source `none` and never touched again.
use tracing::info;

use crate::artifact::Package;
use crate::host::Host;
use crate::system::os::{OsFamily, OsInfo};
use crate::tracker::{ContainerdSource, Tracker};

pub const CONFIG_DIR: &str = "/etc/containerd";
pub const CONFIG_PATH: &str = "/etc/containerd/config.toml";
pub const DAEMON_NAME: &str = "containerd";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ContainerdSourceError {
    #[error("containerd source {containerd_source} is not supported on {os}")]
    Unsupported {
        containerd_source: ContainerdSource,
        os: String,
    },
}

/// Resolves the package for a containerd source.
pub trait ContainerdPackageSource {
    fn containerd_package(&self, source: ContainerdSource) -> Option<Package>;
}

impl ContainerdPackageSource for crate::packages::PackageManager {
    fn containerd_package(&self, source: ContainerdSource) -> Option<Package> {
        crate::packages::PackageManager::containerd_package(self, source)
    }
}

/// Amazon Linux 2023 has no Docker repository and RHEL ships no containerd
/// package of its own.
pub fn validate_source(source: ContainerdSource, os: &OsInfo) -> Result<(), ContainerdSourceError> {
    let unsupported = matches!(
        (source, os.family),
        (ContainerdSource::Docker, OsFamily::AmazonLinux2023)
            | (ContainerdSource::Distro, OsFamily::Rhel)
    );
    if unsupported {
        return Err(ContainerdSourceError::Unsupported {
            containerd_source: source,
            os: os.to_string(),
        });
    }
    Ok(())
}

pub fn is_preinstalled(host: &Host) -> bool {
    host.binaries.find("containerd").is_some() && host.binaries.find("runc").is_some()
}

pub fn install(
    host: &Host,
    tracker: &mut Tracker,
    packages: &dyn ContainerdPackageSource,
    source: ContainerdSource,
) -> anyhow::Result<()> {
    validate_source(source, &host.os)?;
    if source == ContainerdSource::None {
        info!("containerd source is none, skipping containerd installation");
        tracker.mark_containerd(ContainerdSource::None);
        return Ok(());
    }
    if is_preinstalled(host) {
        info!("containerd and runc are already installed, leaving them as they are");
        tracker.mark_containerd(ContainerdSource::None);
        return Ok(());
    }
    if let Some(package) = packages.containerd_package(source) {
        package.install(host.runner.as_ref(), &host.package_retry)?;
    }
    tracker.mark_containerd(source);
    Ok(())
}

pub fn upgrade(
    host: &Host,
    packages: &dyn ContainerdPackageSource,
    source: ContainerdSource,
) -> anyhow::Result<()> {
    match packages.containerd_package(source) {
        Some(package) => package.upgrade(host.runner.as_ref(), &host.package_retry),
        None => {
            info!("containerd was not installed by nodeadm, skipping upgrade");
            Ok(())
        }
    }
}

pub fn uninstall(
    host: &Host,
    packages: &dyn ContainerdPackageSource,
    source: ContainerdSource,
) -> anyhow::Result<()> {
    let Some(package) = packages.containerd_package(source) else {
        info!("containerd was not installed by nodeadm, leaving it in place");
        return Ok(());
    };
    host.daemons.stop_daemon(DAEMON_NAME)?;
    package.uninstall(host.runner.as_ref(), &host.package_retry)?;
    utils::fs_ext::remove_dir_all_if_exists(host.layout.resolve(CONFIG_DIR))?;
    Ok(())
}
