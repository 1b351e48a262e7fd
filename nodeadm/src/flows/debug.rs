//! `nodeadm debug`: every read-only check, reported phase by phase. Nothing
//! on the host is changed.
use tracing::info;

use super::{check_cni_port, check_installed};
use crate::components::kubelet;
use crate::node_provider::NodeProvider;
use crate::validation::{Informer, Phase, Runner, SkipSet};

pub struct Debugger<'a> {
    pub provider: NodeProvider,
    pub skip: SkipSet,
    pub informer: &'a dyn Informer,
}

impl Debugger<'_> {
    /// Errors only when the configuration itself is unusable; failed
    /// checks end up in the informer.
    pub async fn run(self) -> anyhow::Result<()> {
        let Debugger {
            mut provider,
            skip,
            informer,
        } = self;
        let runner = Runner::new(&skip, informer).keep_going();

        runner
            .run(Phase::InstallValidation, "validating nodeadm installation", || async {
                check_installed(provider.host())
            })
            .await?;
        runner
            .run(Phase::CniValidation, "validating CNI VXLAN port in host firewall", || async {
                check_cni_port(provider.host())
            })
            .await?;

        provider.validate_config()?;
        provider.enrich_config().await?;
        // a node that was never initialised has no serving certificate yet
        let initialised = provider
            .host()
            .layout
            .resolve(kubelet::KUBECONFIG_PATH)
            .exists();
        provider.run_validations(&runner, !initialised).await?;
        info!("debug checks finished");
        Ok(())
    }
}
