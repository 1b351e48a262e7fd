//! `nodeadm init`: joins an installed node to its cluster.
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{check_cni_port, check_installed};
use crate::layout::HostLayout;
use crate::node_provider::NodeProvider;
use crate::remediation::remediation;
use crate::validation::cni::{Cni, wait_for_cni};
use crate::validation::node::{NodeStatusSource, wait_for_ready, wait_for_registration};
use crate::validation::{Informer, Phase, Runner, SkipSet};

pub const DEFAULT_VALIDATION_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

pub struct InitOptions {
    pub skip: SkipSet,
    /// Upper bound on the post-init wait for the node to become active.
    pub validation_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            skip: SkipSet::default(),
            validation_timeout: DEFAULT_VALIDATION_TIMEOUT,
            poll_interval: POLL_INTERVAL,
        }
    }
}

pub struct Initer<'a> {
    pub provider: NodeProvider,
    pub nodes: Arc<dyn NodeStatusSource>,
    pub informer: &'a dyn Informer,
    pub options: InitOptions,
    pub cancel: CancellationToken,
}

impl Initer<'_> {
    pub async fn run(self) -> anyhow::Result<()> {
        let Initer {
            mut provider,
            nodes,
            informer,
            options,
            cancel,
        } = self;
        let runner = Runner::new(&options.skip, informer);

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

        let credential_provider = provider.validate_config()?;
        info!(%credential_provider, "validated node configuration");
        if runner.is_skipped(Phase::Preprocess) {
            info!("skipping credential setup");
        } else {
            provider.pre_process_daemon()?;
        }
        provider.enrich_config().await?;
        provider.run_validations(&runner, true).await?;
        provider.configure().await?;
        provider.ensure_daemons()?;
        let node_name = provider.node_name()?;
        info!("node {node_name} bootstrapped");

        if runner.is_skipped(Phase::InitValidation) {
            info!(phase = %Phase::InitValidation, "skipping validation");
            return Ok(());
        }
        let layout = provider.host().layout.clone();
        let active = tokio::time::timeout(
            options.validation_timeout,
            wait_for_active_node(&layout, nodes, &node_name, &options, &cancel),
        )
        .await
        .unwrap_or_else(|_| {
            Err(anyhow!(
                "node {node_name} did not become active within {}",
                humantime::format_duration(options.validation_timeout)
            ))
        });
        match active {
            Ok(cni) => info!(%cni, "node {node_name} is active"),
            Err(e) => match remediation(&e) {
                Some(fix) => warn!(remediation = fix, "node is not active yet: {e:#}"),
                None => warn!("node is not active yet: {e:#}"),
            },
        }
        Ok(())
    }
}

/// Registration, then a CNI, then readiness.
async fn wait_for_active_node(
    layout: &HostLayout,
    nodes: Arc<dyn NodeStatusSource>,
    node_name: &str,
    options: &InitOptions,
    cancel: &CancellationToken,
) -> anyhow::Result<Cni> {
    let timeout = options.validation_timeout;
    let interval = options.poll_interval;
    wait_for_registration(nodes.clone(), node_name, timeout, interval, cancel).await?;
    info!("node {node_name} registered");
    let cni = wait_for_cni(layout, nodes.clone(), node_name, timeout, interval, cancel).await?;
    wait_for_ready(nodes, node_name, timeout, interval, cancel).await?;
    Ok(cni)
}
