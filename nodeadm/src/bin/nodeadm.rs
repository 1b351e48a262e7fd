//!
//! `nodeadm` prepares a machine outside the cloud to run as a node of a
//! managed Kubernetes cluster, and takes it apart again.
//!
//! ```sh
//! nodeadm install 1.31 --credential-provider ssm
//! nodeadm init --config-source file:///etc/nodeadm/config.yaml
//! nodeadm upgrade 1.32 --config-source file:///etc/nodeadm/config.yaml
//! nodeadm uninstall
//! ```
//!
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};
use hybrid_api::node_config::NodeConfig;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use utils::lock_file::{self, LockFileGuard};
use utils::logging::{self, LogFormat};

use nodeadm::artifact::{Fetcher, HttpFetcher};
use nodeadm::cluster::{CachedCluster, EksClusterDescriber};
use nodeadm::components::kubelet;
use nodeadm::components::source::{EksReleaseSource, MANIFEST_URL, SsmReleaseSource};
use nodeadm::components::ssm::SsmClientDeregisterer;
use nodeadm::config;
use nodeadm::creds::{CredentialProvider, get_credential_provider_from_node_config};
use nodeadm::flows::debug::Debugger;
use nodeadm::flows::ensure_root;
use nodeadm::flows::init::{InitOptions, Initer, POLL_INTERVAL};
use nodeadm::flows::install::Installer;
use nodeadm::flows::uninstall::Uninstaller;
use nodeadm::flows::upgrade::Upgrader;
use nodeadm::host::Host;
use nodeadm::node_provider::{NodeProvider, NodeProviderOptions};
use nodeadm::packages::PackageManager;
use nodeadm::remediation::{SilentError, flatten_remediation, is_silent};
use nodeadm::safe_remove::SafeRemover;
use nodeadm::system::artifact_arch;
use nodeadm::tracker::{ContainerdSource, TRACKER_FILE, Tracker};
use nodeadm::validation::credentials::{ProfileCredentials, load_sdk_config};
use nodeadm::validation::network::SystemNetwork;
use nodeadm::validation::node::KubeNodeStatus;
use nodeadm::validation::{LoggingInformer, ReportInformer, SkipSet};

const LOCK_FILE_PATH: &str = "/run/nodeadm.lock";

#[derive(Parser)]
#[command(name = "nodeadm", version, about = "Lifecycle management for hybrid Kubernetes nodes")]
struct Cli {
    /// plain or json
    #[arg(long, global = true, default_value = "plain")]
    log_format: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Install the node components for a Kubernetes version
    Install {
        /// Kubernetes version, `1.31` or `1.31.2`
        kubernetes_version: String,
        /// ssm or iam-ra
        #[arg(short = 'p', long)]
        credential_provider: CredentialProvider,
        /// none, distro or docker
        #[arg(long, default_value = "distro")]
        containerd_source: ContainerdSource,
        /// Region to download the SSM setup CLI from
        #[arg(short, long, default_value = "us-west-2")]
        region: String,
        /// Give up on the whole installation after this long
        #[arg(short, long, value_parser = humantime::parse_duration, default_value = "20m")]
        timeout: Duration,
    },
    /// Join the node to its cluster
    Init {
        #[arg(short, long)]
        config_source: String,
        /// Phases to skip, comma separated
        #[arg(short, long, value_delimiter = ',')]
        skip: Vec<String>,
        /// How long to wait for the node to become active
        #[arg(long, value_parser = humantime::parse_duration, default_value = "10m")]
        validation_timeout: Duration,
    },
    /// Move the node to another Kubernetes version
    Upgrade {
        kubernetes_version: String,
        #[arg(short, long)]
        config_source: String,
        #[arg(short, long, value_delimiter = ',')]
        skip: Vec<String>,
    },
    /// Remove everything nodeadm installed
    Uninstall {
        #[arg(short, long, value_delimiter = ',')]
        skip: Vec<String>,
        /// Unmount volumes still mounted below the kubelet directory
        #[arg(short, long)]
        force: bool,
    },
    /// Node configuration commands
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Run every read-only check and print a report
    Debug {
        #[arg(short, long)]
        config_source: String,
        #[arg(short, long, value_delimiter = ',')]
        skip: Vec<String>,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Load and validate a node config without touching the host
    Check {
        #[arg(short, long)]
        config_source: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let log_format = match LogFormat::from_config(&cli.log_format) {
        Ok(format) => format,
        Err(e) => {
            eprintln!("{e:#}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = logging::init(log_format) {
        eprintln!("{e:#}");
        return ExitCode::FAILURE;
    }
    logging::replace_panic_hook_with_tracing_panic_hook();

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if !is_silent(&e) {
                error!("{:#}", flatten_remediation(e));
            }
            ExitCode::FAILURE
        }
    }
}

fn run(command: Command) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;
    let cancel = CancellationToken::new();
    runtime.block_on(async {
        tokio::select! {
            result = dispatch(command, cancel.clone()) => result,
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
                Err(anyhow!("interrupted"))
            }
        }
    })
}

async fn dispatch(command: Command, cancel: CancellationToken) -> anyhow::Result<()> {
    match command {
        Command::Install {
            kubernetes_version,
            credential_provider,
            containerd_source,
            region,
            timeout,
        } => {
            let _lock = lock_host()?;
            let install = install(&kubernetes_version, credential_provider, containerd_source, &region);
            tokio::time::timeout(timeout, install)
                .await
                .map_err(|_| anyhow!("installation timed out after {}", humantime::format_duration(timeout)))?
        }
        Command::Init {
            config_source,
            skip,
            validation_timeout,
        } => {
            let _lock = lock_host()?;
            let skip = SkipSet::parse(&skip)?;
            init(&config_source, skip, validation_timeout, cancel).await
        }
        Command::Upgrade {
            kubernetes_version,
            config_source,
            skip,
        } => {
            let _lock = lock_host()?;
            let skip = SkipSet::parse(&skip)?;
            upgrade(&kubernetes_version, &config_source, skip).await
        }
        Command::Uninstall { skip, force } => {
            let _lock = lock_host()?;
            let skip = SkipSet::parse(&skip)?;
            uninstall(skip, force).await
        }
        Command::Config {
            command: ConfigCommand::Check { config_source },
        } => {
            let node_config = config::load(&config_source)?;
            config::validate(&node_config)?;
            let provider = get_credential_provider_from_node_config(&node_config)?;
            info!(credential_provider = %provider, "configuration is valid");
            Ok(())
        }
        Command::Debug {
            config_source,
            skip,
        } => debug(&config_source, SkipSet::parse(&skip)?).await,
    }
}

/// Mutating commands need root and must not run concurrently.
fn lock_host() -> anyhow::Result<LockFileGuard> {
    ensure_root()?;
    let guard = lock_file::create_exclusive(Path::new(LOCK_FILE_PATH))?;
    info!("acquired {}", guard.path().display());
    Ok(guard)
}

fn fetcher() -> anyhow::Result<Arc<dyn Fetcher>> {
    Ok(Arc::new(HttpFetcher::new()?))
}

async fn install(
    kubernetes_version: &str,
    credential_provider: CredentialProvider,
    containerd_source: ContainerdSource,
    region: &str,
) -> anyhow::Result<()> {
    let host = Host::detect()?;
    let arch = artifact_arch()?;
    let fetcher = fetcher()?;
    let eks = EksReleaseSource::load(fetcher.clone(), MANIFEST_URL, kubernetes_version, arch).await?;
    let ssm = SsmReleaseSource::new(fetcher.clone(), region, arch);
    let packages = PackageManager::new(&host, containerd_source)?;
    info!(
        kubernetes = eks.version(),
        %credential_provider,
        %containerd_source,
        "installing node components"
    );
    Installer {
        host: &host,
        packages: &packages,
        fetcher: fetcher.as_ref(),
        eks: &eks,
        ssm: &ssm,
        credential_provider,
        containerd_source,
    }
    .run()
    .await
}

/// The AWS config file nodeadm writes for IAM Roles Anywhere, resolved on
/// the host.
fn aws_config_file(host: &Host, node_config: &NodeConfig) -> Option<PathBuf> {
    node_config
        .iam_roles_anywhere()
        .map(|iam| host.layout.resolve(iam.aws_config_path()))
}

async fn node_provider(host: &Host, config_source: &str) -> anyhow::Result<NodeProvider> {
    let node_config = config::load(config_source)?;
    let region = node_config.spec.cluster.region.clone();
    let sdk_config = load_sdk_config(&region, aws_config_file(host, &node_config).as_deref()).await;
    let cluster = CachedCluster::new(Arc::new(EksClusterDescriber::new(&sdk_config)));
    Ok(NodeProvider::new(NodeProviderOptions {
        host: host.clone(),
        network: Arc::new(SystemNetwork::new(&host.layout)),
        credentials: Arc::new(ProfileCredentials::for_node(&node_config)),
        cluster: Arc::new(cluster),
        config: node_config,
    }))
}

async fn init(
    config_source: &str,
    skip: SkipSet,
    validation_timeout: Duration,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let host = Host::detect()?;
    let provider = node_provider(&host, config_source).await?;
    let nodes = Arc::new(KubeNodeStatus::new(host.layout.resolve(kubelet::KUBECONFIG_PATH)));
    let options = InitOptions {
        skip,
        validation_timeout,
        poll_interval: POLL_INTERVAL,
    };
    Initer {
        provider,
        nodes,
        informer: &LoggingInformer,
        options,
        cancel,
    }
    .run()
    .await
}

async fn upgrade(kubernetes_version: &str, config_source: &str, skip: SkipSet) -> anyhow::Result<()> {
    let host = Host::detect()?;
    let provider = node_provider(&host, config_source).await?;
    let tracker = Tracker::load(&host.layout.resolve(TRACKER_FILE))?;
    let arch = artifact_arch()?;
    let fetcher = fetcher()?;
    let eks = EksReleaseSource::load(fetcher.clone(), MANIFEST_URL, kubernetes_version, arch).await?;
    let ssm = SsmReleaseSource::new(fetcher, &provider.config().spec.cluster.region, arch);
    let packages = PackageManager::new(&host, tracker.artifacts.containerd)?;
    info!(kubernetes = eks.version(), "upgrading node");
    Upgrader {
        provider,
        packages: &packages,
        eks: &eks,
        ssm: &ssm,
        skip,
        informer: &LoggingInformer,
    }
    .run()
    .await
}

async fn uninstall(skip: SkipSet, force: bool) -> anyhow::Result<()> {
    let host = Host::detect()?;
    let remover = SafeRemover::system().with_force_unmount(force);
    Uninstaller {
        nodes: Arc::new(KubeNodeStatus::new(host.layout.resolve(kubelet::KUBECONFIG_PATH))),
        host: &host,
        deregisterer: &SsmClientDeregisterer,
        remover: &remover,
        skip,
        informer: &LoggingInformer,
        force,
    }
    .run()
    .await
}

async fn debug(config_source: &str, skip: SkipSet) -> anyhow::Result<()> {
    let host = Host::detect()?;
    let provider = node_provider(&host, config_source).await?;
    let informer = ReportInformer::default();
    Debugger {
        provider,
        skip,
        informer: &informer,
    }
    .run()
    .await?;

    for report in informer.reports() {
        match &report.error {
            None => println!("[ok]   {:<45} {}", report.phase.to_string(), report.description),
            Some(err) => {
                println!("[fail] {:<45} {}", report.phase.to_string(), report.description);
                println!("       error: {err}");
                if let Some(fix) = &report.remediation {
                    println!("       remediation: {fix}");
                }
            }
        }
    }
    if informer.failed() {
        return Err(SilentError.into());
    }
    Ok(())
}
