//! OS package manager integration.
//!
//! Distro packages (containerd, iptables) are installed through apt on
//! Ubuntu and yum/dnf on the RHEL family and Amazon Linux. When containerd
//! should come from Docker's repository, the repository is registered during
//! `configure` and removed again during `cleanup`.
use anyhow::{Context, bail};
use tracing::info;
use utils::backoff::{RetryPolicy, retry_blocking};

use crate::artifact::{Fetcher, Package};
use crate::host::Host;
use crate::system::os::OsFamily;
use crate::tracker::ContainerdSource;

pub const DOCKER_APT_KEYRING: &str = "/etc/apt/keyrings/docker.asc";
pub const DOCKER_APT_SOURCE: &str = "/etc/apt/sources.list.d/docker.list";
pub const DOCKER_YUM_REPO: &str = "/etc/yum.repos.d/docker-ce.repo";

const DOCKER_UBUNTU_URL: &str = "https://download.docker.com/linux/ubuntu";
const DOCKER_RHEL_REPO_URL: &str = "https://download.docker.com/linux/rhel/docker-ce.repo";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PackageManagerKind {
    Apt,
    Yum,
    Dnf,
}

impl PackageManagerKind {
    fn program(self) -> &'static str {
        match self {
            PackageManagerKind::Apt => "apt-get",
            PackageManagerKind::Yum => "yum",
            PackageManagerKind::Dnf => "dnf",
        }
    }
}

pub struct PackageManager {
    host: Host,
    kind: PackageManagerKind,
    containerd_source: ContainerdSource,
}

impl PackageManager {
    pub fn new(host: &Host, containerd_source: ContainerdSource) -> anyhow::Result<Self> {
        let kind = match host.os.family {
            OsFamily::Ubuntu => PackageManagerKind::Apt,
            OsFamily::Rhel | OsFamily::Rocky => PackageManagerKind::Yum,
            OsFamily::AmazonLinux2023 => PackageManagerKind::Dnf,
            OsFamily::Other => {
                if host.binaries.find("apt-get").is_some() {
                    PackageManagerKind::Apt
                } else if host.binaries.find("dnf").is_some() {
                    PackageManagerKind::Dnf
                } else if host.binaries.find("yum").is_some() {
                    PackageManagerKind::Yum
                } else {
                    bail!("no supported package manager found on {}", host.os)
                }
            }
        };
        Ok(Self {
            host: host.clone(),
            kind,
            containerd_source,
        })
    }

    pub fn kind(&self) -> PackageManagerKind {
        self.kind
    }

    /// Registers the Docker repository when containerd comes from it, then
    /// refreshes package metadata.
    pub async fn configure(&self, fetcher: &dyn Fetcher) -> anyhow::Result<()> {
        if self.containerd_source == ContainerdSource::Docker {
            self.add_docker_repo(fetcher).await?;
        }
        self.refresh_metadata()
    }

    async fn add_docker_repo(&self, fetcher: &dyn Fetcher) -> anyhow::Result<()> {
        let layout = &self.host.layout;
        match self.kind {
            PackageManagerKind::Apt => {
                info!("adding docker apt repository");
                let key = fetcher.fetch(&format!("{DOCKER_UBUNTU_URL}/gpg")).await?;
                utils::fs_ext::write_file(layout.resolve(DOCKER_APT_KEYRING), key, 0o644)?;
                let arch = crate::system::artifact_arch()?;
                let source = format!(
                    "deb [arch={arch} signed-by={DOCKER_APT_KEYRING}] {DOCKER_UBUNTU_URL} {} stable\n",
                    self.host.os.codename
                );
                utils::fs_ext::write_file(layout.resolve(DOCKER_APT_SOURCE), source, 0o644)?;
            }
            PackageManagerKind::Yum | PackageManagerKind::Dnf => {
                info!("adding docker yum repository");
                let repo = fetcher.fetch(DOCKER_RHEL_REPO_URL).await?;
                utils::fs_ext::write_file(layout.resolve(DOCKER_YUM_REPO), repo, 0o644)?;
            }
        }
        Ok(())
    }

    /// Metadata refreshes hit remote mirrors, so they back off
    /// exponentially rather than at the fixed package lock interval.
    pub fn refresh_metadata(&self) -> anyhow::Result<()> {
        let program = self.kind.program();
        let args: &[&str] = match self.kind {
            PackageManagerKind::Apt => &["update"],
            PackageManagerKind::Yum | PackageManagerKind::Dnf => &["makecache"],
        };
        retry_blocking(&RetryPolicy::download(), "refresh package metadata", || {
            self.host.runner.run(program, args)
        })
        .context("refreshing package metadata")?;
        Ok(())
    }

    pub fn package(&self, name: &str) -> Package {
        let program = self.kind.program().to_string();
        let cmd = |args: &[&str]| {
            std::iter::once(program.clone())
                .chain(args.iter().map(|a| a.to_string()))
                .collect::<Vec<_>>()
        };
        match self.kind {
            PackageManagerKind::Apt => Package {
                name: name.to_string(),
                install: cmd(&["install", "-y", name]),
                upgrade: cmd(&["install", "-y", "--only-upgrade", name]),
                uninstall: cmd(&["remove", "-y", name]),
            },
            PackageManagerKind::Yum | PackageManagerKind::Dnf => Package {
                name: name.to_string(),
                install: cmd(&["install", "-y", name]),
                upgrade: cmd(&["update", "-y", name]),
                uninstall: cmd(&["remove", "-y", name]),
            },
        }
    }

    /// The containerd package for the given source, `None` when nodeadm
    /// does not manage containerd.
    pub fn containerd_package(&self, source: ContainerdSource) -> Option<Package> {
        match source {
            ContainerdSource::None => None,
            ContainerdSource::Distro => Some(self.package("containerd")),
            ContainerdSource::Docker => Some(self.package("containerd.io")),
        }
    }

    pub fn iptables_package(&self) -> Package {
        match self.kind {
            PackageManagerKind::Apt => self.package("iptables"),
            PackageManagerKind::Yum | PackageManagerKind::Dnf => self.package("iptables-nft"),
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.host.package_retry
    }

    /// Removes repository configuration added by `configure`.
    pub fn cleanup(&self) -> anyhow::Result<()> {
        let layout = &self.host.layout;
        for path in [DOCKER_APT_SOURCE, DOCKER_APT_KEYRING, DOCKER_YUM_REPO] {
            utils::fs_ext::remove_file_if_exists(layout.resolve(path))?;
        }
        Ok(())
    }
}
