use tracing::info;

use crate::artifact::Package;
use crate::host::Host;
use crate::tracker::{self, Tracker};

pub trait IptablesPackageSource {
    fn iptables_package(&self) -> Package;
}

impl IptablesPackageSource for crate::packages::PackageManager {
    fn iptables_package(&self) -> Package {
        crate::packages::PackageManager::iptables_package(self)
    }
}

/// kubelet needs `iptables` on the host. An existing installation is left
/// untracked so uninstall never removes it.
pub fn install(
    host: &Host,
    tracker: &mut Tracker,
    packages: &dyn IptablesPackageSource,
) -> anyhow::Result<()> {
    if host.binaries.find("iptables").is_some() {
        info!("iptables is already installed, skipping");
        return Ok(());
    }
    packages
        .iptables_package()
        .install(host.runner.as_ref(), &host.package_retry)?;
    tracker.add(tracker::IPTABLES)?;
    Ok(())
}

pub fn upgrade(host: &Host, packages: &dyn IptablesPackageSource) -> anyhow::Result<()> {
    packages
        .iptables_package()
        .upgrade(host.runner.as_ref(), &host.package_retry)
}

pub fn uninstall(host: &Host, packages: &dyn IptablesPackageSource) -> anyhow::Result<()> {
    packages
        .iptables_package()
        .uninstall(host.runner.as_ref(), &host.package_retry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packages::PackageManager;
    use crate::testing::{RHEL9, test_host};
    use crate::tracker::ContainerdSource;

    #[test]
    fn existing_iptables_is_not_tracked() {
        let dir = tempfile::tempdir().unwrap();
        let t = test_host(dir.path(), RHEL9);
        let pm = PackageManager::new(&t.host, ContainerdSource::None).unwrap();
        t.binaries.add("iptables");

        let mut tracker = Tracker::default();
        install(&t.host, &mut tracker, &pm).unwrap();
        assert!(!tracker.artifacts.iptables);
        assert!(t.runner.calls().is_empty());
    }

    #[test]
    fn missing_iptables_is_installed() {
        let dir = tempfile::tempdir().unwrap();
        let t = test_host(dir.path(), RHEL9);
        let pm = PackageManager::new(&t.host, ContainerdSource::None).unwrap();

        let mut tracker = Tracker::default();
        install(&t.host, &mut tracker, &pm).unwrap();
        assert!(tracker.artifacts.iptables);
        assert_eq!(t.runner.count("yum install -y iptables-nft"), 1);
    }
}
