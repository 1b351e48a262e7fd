//! `nodeadm upgrade`: moves an initialised node to another Kubernetes
//! release. Only components recorded in the tracker are touched.
use anyhow::anyhow;
use tracing::info;

use super::tracker_path;
use crate::components::source::EksSource;
use crate::components::ssm::{SsmAgent, SsmSource};
use crate::components::{
    cni_plugins, containerd, iam_authenticator, iam_roles_anywhere, image_credential_provider,
    iptables, kubectl, kubelet,
};
use crate::layout::HostLayout;
use crate::node_provider::NodeProvider;
use crate::packages::PackageManager;
use crate::remediation::with_remediation;
use crate::tracker::{InstalledArtifacts, Tracker};
use crate::validation::{Informer, Phase, Runner, SkipSet};

pub struct Upgrader<'a, E> {
    pub provider: NodeProvider,
    pub packages: &'a PackageManager,
    pub eks: &'a E,
    pub ssm: &'a dyn SsmSource,
    pub skip: SkipSet,
    pub informer: &'a dyn Informer,
}

impl<E: EksSource> Upgrader<'_, E> {
    pub async fn run(self) -> anyhow::Result<()> {
        let Upgrader {
            mut provider,
            packages,
            eks,
            ssm,
            skip,
            informer,
        } = self;
        let runner = Runner::new(&skip, informer);
        let host = provider.host().clone();

        let path = tracker_path(&host);
        if !path.exists() {
            return Err(with_remediation(
                anyhow!("no nodeadm installation found at {}", path.display()),
                "Only nodes set up with `nodeadm install` can be upgraded.",
            ));
        }
        let tracker = Tracker::load(&path)?;
        let installed = &tracker.artifacts;

        provider.validate_config()?;
        provider.enrich_config().await?;
        runner
            .run(Phase::NodeIpValidation, "validating node IP", || provider.validate_node_ip())
            .await?;
        runner
            .run(Phase::KubeletCertValidation, "validating kubelet certificate", || async {
                provider.validate_kubelet_cert(false)
            })
            .await?;

        info!("upgrading distro packages");
        containerd::upgrade(&host, packages, installed.containerd)?;
        if installed.iptables {
            iptables::upgrade(&host, packages)?;
        }

        if installed.ssm {
            info!("upgrading SSM");
            SsmAgent::new(&host).upgrade(ssm).await?;
        }
        if installed.iam_roles_anywhere {
            info!("upgrading aws_signing_helper");
            iam_roles_anywhere::upgrade(&host.layout, eks).await?;
        }

        upgrade_eks_artifacts(&host.layout, installed, eks).await?;

        host.daemons.stop_daemon(kubelet::DAEMON_NAME)?;
        provider.configure().await?;
        provider.ensure_daemons()?;
        provider.cleanup()?;
        tracker.save(&path)?;
        info!("upgrade complete");
        Ok(())
    }
}

async fn upgrade_eks_artifacts<E: EksSource>(
    layout: &HostLayout,
    installed: &InstalledArtifacts,
    eks: &E,
) -> anyhow::Result<()> {
    if installed.kubelet {
        info!("upgrading kubelet");
        kubelet::upgrade(layout, eks).await?;
    }
    if installed.kubectl {
        info!("upgrading kubectl");
        kubectl::upgrade(layout, eks).await?;
    }
    if installed.cni_plugins {
        info!("upgrading cni-plugins");
        cni_plugins::upgrade(layout, eks).await?;
    }
    if installed.image_credential_provider {
        info!("upgrading image-credential-provider");
        image_credential_provider::upgrade(layout, eks).await?;
    }
    if installed.iam_authenticator {
        info!("upgrading aws-iam-authenticator");
        iam_authenticator::upgrade(layout, eks).await?;
    }
    Ok(())
}
