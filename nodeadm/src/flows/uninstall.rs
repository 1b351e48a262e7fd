//! `nodeadm uninstall`: removes what `nodeadm install` and `init` put on the
//! host, in reverse order. Components the tracker does not list were there
//! before nodeadm and stay.
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use super::{EKS_CONFIG_DIR, KUBERNETES_CONFIG_DIR, tracker_path};
use crate::components::ssm::{InstanceDeregisterer, SsmAgent};
use crate::components::{
    cni_plugins, containerd, iam_authenticator, iam_roles_anywhere, image_credential_provider,
    iptables, kubectl, kubelet,
};
use crate::host::Host;
use crate::packages::PackageManager;
use crate::safe_remove::SafeRemover;
use crate::tracker::Tracker;
use crate::validation::node::{NodeStatusSource, check_cordoned, check_no_workload_pods};
use crate::validation::{Informer, Phase, Runner, SkipSet};

pub struct Uninstaller<'a> {
    pub host: &'a Host,
    pub nodes: Arc<dyn NodeStatusSource>,
    pub deregisterer: &'a dyn InstanceDeregisterer,
    pub remover: &'a SafeRemover,
    pub skip: SkipSet,
    pub informer: &'a dyn Informer,
    /// Unmount whatever is still mounted below the kubelet directories.
    pub force: bool,
}

impl Uninstaller<'_> {
    pub async fn run(self) -> anyhow::Result<()> {
        let host = self.host;
        let layout = &host.layout;
        let path = tracker_path(host);
        let tracker = Tracker::load(&path)?;
        let installed = &tracker.artifacts;
        let ssm = SsmAgent::new(host);

        self.validate_node(&ssm).await?;

        host.daemons.stop_daemon(kubelet::DAEMON_NAME)?;
        host.daemons.disable_daemon(kubelet::DAEMON_NAME)?;
        if installed.kubelet {
            kubelet::uninstall(layout)?;
        }

        if installed.ssm {
            info!("uninstalling SSM");
            ssm.deregister_and_uninstall(self.deregisterer).await?;
        }
        if installed.iam_roles_anywhere {
            info!("uninstalling aws_signing_helper");
            iam_roles_anywhere::uninstall(host)?;
        }

        let packages = PackageManager::new(host, installed.containerd)?;
        containerd::uninstall(host, &packages, installed.containerd)?;

        if installed.kubectl {
            kubectl::uninstall(layout)?;
        }
        if installed.cni_plugins {
            cni_plugins::uninstall(layout)?;
        }
        if installed.iam_authenticator {
            iam_authenticator::uninstall(layout)?;
        }
        if installed.image_credential_provider {
            image_credential_provider::uninstall(layout)?;
        }
        if installed.iptables {
            iptables::uninstall(host, &packages)?;
        }
        packages.cleanup()?;

        for dir in [kubelet::KUBELET_ROOT_DIR, KUBERNETES_CONFIG_DIR, EKS_CONFIG_DIR] {
            self.remover
                .remove_all(&layout.resolve(dir), self.force)
                .with_context(|| format!("cleaning up {dir}"))?;
        }
        host.daemons.daemon_reload()?;
        Tracker::clear(&path)?;
        info!("uninstall complete");
        Ok(())
    }

    /// Refuses to remove a node that still serves workloads. Skipped when
    /// the node never joined a cluster.
    async fn validate_node(&self, ssm: &SsmAgent) -> anyhow::Result<()> {
        let layout = &self.host.layout;
        if !layout.resolve(kubelet::KUBECONFIG_PATH).exists() {
            info!("node was never initialised, skipping node checks");
            return Ok(());
        }
        let name = match ssm.registration()? {
            Some(registration) => Some(registration.managed_instance_id),
            None => hostname_override(&layout.resolve(kubelet::ENV_FILE_PATH))?,
        };
        let Some(name) = name else {
            info!("node name is unknown, skipping node checks");
            return Ok(());
        };

        let runner = Runner::new(&self.skip, self.informer);
        let nodes = self.nodes.as_ref();
        runner
            .run(Phase::NodeValidation, "validating node is cordoned", || {
                check_cordoned(nodes, &name)
            })
            .await?;
        runner
            .run(Phase::PodValidation, "validating no pods remain on node", || {
                check_no_workload_pods(nodes, &name)
            })
            .await?;
        Ok(())
    }
}

/// The node name init passed to the kubelet.
fn hostname_override(env_file: &Path) -> anyhow::Result<Option<String>> {
    let data = match std::fs::read_to_string(env_file) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("reading {}", env_file.display())),
    };
    Ok(data
        .split(|c: char| c.is_whitespace() || c == '"')
        .find_map(|arg| arg.strip_prefix("--hostname-override="))
        .filter(|name| !name.is_empty())
        .map(str::to_string))
}
