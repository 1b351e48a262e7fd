//! `nodeadm install`: everything a node needs before it can join a cluster.
use std::path::Path;

use anyhow::Context;
use tracing::{info, warn};

use super::tracker_path;
use crate::artifact::Fetcher;
use crate::components::source::EksSource;
use crate::components::ssm::{SsmAgent, SsmSource};
use crate::components::{
    cni_plugins, containerd, iam_authenticator, iam_roles_anywhere, image_credential_provider,
    iptables, kubectl, kubelet,
};
use crate::creds::{CredentialProvider, validate_credential_provider};
use crate::host::Host;
use crate::layout::HostLayout;
use crate::packages::PackageManager;
use crate::system::os::OsFamily;
use crate::tracker::{ContainerdSource, Tracker};

pub const JOURNAL_DIR: &str = "/var/log/journal";
pub const RUNTIME_JOURNAL_DIR: &str = "/run/log/journal";

pub struct Installer<'a, E> {
    pub host: &'a Host,
    pub packages: &'a PackageManager,
    pub fetcher: &'a dyn Fetcher,
    pub eks: &'a E,
    pub ssm: &'a dyn SsmSource,
    pub credential_provider: CredentialProvider,
    pub containerd_source: ContainerdSource,
}

impl<E: EksSource> Installer<'_, E> {
    pub async fn run(&self) -> anyhow::Result<()> {
        validate_credential_provider(self.credential_provider, &self.host.os)?;
        containerd::validate_source(self.containerd_source, &self.host.os)?;

        let path = tracker_path(self.host);
        let mut tracker = Tracker::load(&path)?;
        let installed = self.install_components(&mut tracker).await;
        // whatever made it onto the host stays tracked, so uninstall can
        // clean up after a partial install
        let saved = tracker.save(&path);
        installed?;
        saved?;
        info!("installation complete");
        Ok(())
    }

    async fn install_components(&self, tracker: &mut Tracker) -> anyhow::Result<()> {
        let host = self.host;
        let layout = &host.layout;

        self.packages
            .configure(self.fetcher)
            .await
            .context("configuring package manager")?;
        if host.os.family == OsFamily::Rhel {
            link_journal(layout)?;
        }

        info!("installing containerd");
        containerd::install(host, tracker, self.packages, self.containerd_source)?;
        info!("installing iptables");
        iptables::install(host, tracker, self.packages)?;

        match self.credential_provider {
            CredentialProvider::Ssm => {
                info!("installing SSM setup CLI");
                SsmAgent::new(host).install(tracker, self.ssm).await?;
            }
            CredentialProvider::IamRolesAnywhere => {
                info!("installing aws_signing_helper");
                iam_roles_anywhere::install(layout, tracker, self.eks).await?;
            }
        }

        info!("installing kubelet");
        kubelet::install(layout, tracker, self.eks).await?;
        info!("installing kubectl");
        kubectl::install(layout, tracker, self.eks).await?;
        info!("installing cni-plugins");
        cni_plugins::install(layout, tracker, self.eks).await?;
        info!("installing image-credential-provider");
        image_credential_provider::install(layout, tracker, self.eks).await?;
        info!("installing aws-iam-authenticator");
        iam_authenticator::install(layout, tracker, self.eks).await?;
        Ok(())
    }
}

/// RHEL keeps the journal in memory only; the persistent directory has to
/// exist for the node's logs to survive a reboot. An existing directory or
/// link is left alone.
fn link_journal(layout: &HostLayout) -> anyhow::Result<()> {
    let link = layout.resolve(JOURNAL_DIR);
    if std::fs::symlink_metadata(&link).is_ok() {
        return Ok(());
    }
    if let Some(parent) = link.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    match std::os::unix::fs::symlink(Path::new(RUNTIME_JOURNAL_DIR), &link) {
        Ok(()) => {
            info!("linked {JOURNAL_DIR} to {RUNTIME_JOURNAL_DIR}");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            warn!("{JOURNAL_DIR} appeared while linking it, leaving it in place");
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("linking {}", link.display())),
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use sha2::{Digest, Sha256};

    use super::*;
    use crate::artifact::Artifact;
    use crate::components::cni_plugins::CniPluginsSource;
    use crate::components::iam_authenticator::IamAuthenticatorSource;
    use crate::components::iam_roles_anywhere::SigningHelperSource;
    use crate::components::image_credential_provider::ImageCredentialProviderSource;
    use crate::components::kubectl::KubectlSource;
    use crate::components::kubelet::KubeletSource;
    use crate::testing::{FakeFetcher, RHEL9, UBUNTU, test_host};

    fn artifact(name: &str) -> Artifact {
        let data = format!("{name}-binary").into_bytes();
        let checksum = Sha256::digest(&data).to_vec();
        Artifact::new(name, data, checksum)
    }

    fn cni_tarball() -> Artifact {
        let mut builder = tar::Builder::new(flate2::write::GzEncoder::new(
            Vec::new(),
            flate2::Compression::default(),
        ));
        let mut header = tar::Header::new_gnu();
        header.set_size(6);
        header.set_mode(0o755);
        header.set_cksum();
        builder.append_data(&mut header, "bridge", &b"bridge"[..]).unwrap();
        let data = builder.into_inner().unwrap().finish().unwrap();
        let checksum = Sha256::digest(&data).to_vec();
        Artifact::new("cni-plugins", data, checksum)
    }

    /// Serves every artifact, or fails for the one named in `broken`.
    #[derive(Default)]
    struct Release {
        broken: Option<&'static str>,
    }

    impl Release {
        fn get(&self, name: &'static str) -> anyhow::Result<Artifact> {
            if self.broken == Some(name) {
                anyhow::bail!("downloading {name}: connection reset");
            }
            Ok(if name == "cni-plugins" { cni_tarball() } else { artifact(name) })
        }
    }

    #[async_trait]
    impl KubeletSource for Release {
        async fn get_kubelet(&self) -> anyhow::Result<Artifact> {
            self.get("kubelet")
        }
    }

    #[async_trait]
    impl KubectlSource for Release {
        async fn get_kubectl(&self) -> anyhow::Result<Artifact> {
            self.get("kubectl")
        }
    }

    #[async_trait]
    impl CniPluginsSource for Release {
        async fn get_cni_plugins(&self) -> anyhow::Result<Artifact> {
            self.get("cni-plugins")
        }
    }

    #[async_trait]
    impl ImageCredentialProviderSource for Release {
        async fn get_image_credential_provider(&self) -> anyhow::Result<Artifact> {
            self.get("image-credential-provider")
        }
    }

    #[async_trait]
    impl IamAuthenticatorSource for Release {
        async fn get_iam_authenticator(&self) -> anyhow::Result<Artifact> {
            self.get("aws-iam-authenticator")
        }
    }

    #[async_trait]
    impl SigningHelperSource for Release {
        async fn get_signing_helper(&self) -> anyhow::Result<Artifact> {
            self.get("aws_signing_helper")
        }
    }

    #[async_trait]
    impl SsmSource for Release {
        async fn get_setup_cli(&self) -> anyhow::Result<Artifact> {
            self.get("ssm-setup-cli")
        }
    }

    #[tokio::test]
    async fn ssm_install_on_ubuntu() {
        let dir = tempfile::tempdir().unwrap();
        let t = test_host(dir.path(), UBUNTU);
        let packages = PackageManager::new(&t.host, ContainerdSource::Distro).unwrap();
        let release = Release::default();
        Installer {
            host: &t.host,
            packages: &packages,
            fetcher: &FakeFetcher::default(),
            eks: &release,
            ssm: &release,
            credential_provider: CredentialProvider::Ssm,
            containerd_source: ContainerdSource::Distro,
        }
        .run()
        .await
        .unwrap();

        let tracker = Tracker::load(&tracker_path(&t.host)).unwrap();
        let a = &tracker.artifacts;
        assert_eq!(a.containerd, ContainerdSource::Distro);
        assert!(a.ssm && a.iptables && a.kubelet && a.kubectl);
        assert!(a.cni_plugins && a.image_credential_provider && a.iam_authenticator);
        assert!(!a.iam_roles_anywhere);

        for path in [
            "opt/ssm/ssm-setup-cli",
            "usr/bin/kubelet",
            "usr/local/bin/kubectl",
            "opt/cni/bin/bridge",
            "usr/local/bin/aws-iam-authenticator",
        ] {
            assert!(dir.path().join(path).exists(), "{path} missing");
        }
        assert_eq!(t.runner.count("apt-get install -y containerd"), 1);
        assert!(!dir.path().join("var/log/journal").exists());
    }

    #[tokio::test]
    async fn iam_ra_install_on_rhel_links_journal() {
        let dir = tempfile::tempdir().unwrap();
        let t = test_host(dir.path(), RHEL9);
        t.binaries.add("containerd");
        t.binaries.add("runc");
        t.binaries.add("iptables");
        let packages = PackageManager::new(&t.host, ContainerdSource::Docker).unwrap();
        let release = Release::default();
        let fetcher = FakeFetcher::default().with(
            "https://download.docker.com/linux/rhel/docker-ce.repo",
            "[docker-ce-stable]\n",
        );
        Installer {
            host: &t.host,
            packages: &packages,
            fetcher: &fetcher,
            eks: &release,
            ssm: &release,
            credential_provider: CredentialProvider::IamRolesAnywhere,
            containerd_source: ContainerdSource::Docker,
        }
        .run()
        .await
        .unwrap();

        let tracker = Tracker::load(&tracker_path(&t.host)).unwrap();
        // containerd and iptables were already on the host
        assert_eq!(tracker.artifacts.containerd, ContainerdSource::None);
        assert!(!tracker.artifacts.iptables);
        assert!(tracker.artifacts.iam_roles_anywhere);
        assert!(!tracker.artifacts.ssm);
        assert!(dir.path().join("usr/local/bin/aws_signing_helper").exists());
        assert_eq!(
            std::fs::read_link(dir.path().join("var/log/journal")).unwrap(),
            Path::new("/run/log/journal")
        );
    }

    #[tokio::test]
    async fn partial_install_is_tracked() {
        let dir = tempfile::tempdir().unwrap();
        let t = test_host(dir.path(), UBUNTU);
        let packages = PackageManager::new(&t.host, ContainerdSource::None).unwrap();
        let release = Release {
            broken: Some("cni-plugins"),
        };
        let err = Installer {
            host: &t.host,
            packages: &packages,
            fetcher: &FakeFetcher::default(),
            eks: &release,
            ssm: &release,
            credential_provider: CredentialProvider::Ssm,
            containerd_source: ContainerdSource::None,
        }
        .run()
        .await
        .unwrap_err();
        assert!(format!("{err:#}").contains("connection reset"));

        let tracker = Tracker::load(&tracker_path(&t.host)).unwrap();
        assert!(tracker.artifacts.kubelet && tracker.artifacts.kubectl);
        assert!(!tracker.artifacts.cni_plugins);
        assert!(!tracker.artifacts.iam_authenticator);
    }

    #[tokio::test]
    async fn unsupported_combination_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let t = test_host(dir.path(), "ID=\"rhel\"\nVERSION_ID=\"8.9\"\n");
        let packages = PackageManager::new(&t.host, ContainerdSource::Docker).unwrap();
        let release = Release::default();
        assert!(
            Installer {
                host: &t.host,
                packages: &packages,
                fetcher: &FakeFetcher::default(),
                eks: &release,
                ssm: &release,
                credential_provider: CredentialProvider::IamRolesAnywhere,
                containerd_source: ContainerdSource::Docker,
            }
            .run()
            .await
            .is_err()
        );
        assert!(t.runner.calls().is_empty());
        assert!(!tracker_path(&t.host).exists());
    }
}
