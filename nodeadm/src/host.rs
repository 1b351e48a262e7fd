use std::sync::Arc;

use utils::backoff::RetryPolicy;

use crate::daemon::{DaemonManager, SystemdDaemonManager};
use crate::layout::HostLayout;
use crate::system::os::{OS_RELEASE_PATH, OsInfo};
use crate::system::{BinaryLookup, CommandRunner, PathLookup, SystemCommandRunner};

/// Everything a lifecycle step needs to touch the machine it runs on.
#[derive(Clone)]
pub struct Host {
    pub layout: HostLayout,
    pub os: OsInfo,
    pub runner: Arc<dyn CommandRunner>,
    pub daemons: Arc<dyn DaemonManager>,
    pub binaries: Arc<dyn BinaryLookup>,
    pub package_retry: RetryPolicy,
}

impl Host {
    /// The real machine: `/` as root, systemd, and the OS from
    /// `/etc/os-release`.
    pub fn detect() -> anyhow::Result<Self> {
        let layout = HostLayout::host();
        let os = OsInfo::detect(&layout.resolve(OS_RELEASE_PATH))?;
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemCommandRunner);
        Ok(Host {
            layout,
            os,
            daemons: Arc::new(SystemdDaemonManager::new(runner.clone())),
            runner,
            binaries: Arc::new(PathLookup),
            package_retry: RetryPolicy::package_manager(),
        })
    }
}
