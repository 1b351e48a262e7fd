//! In-memory stand-ins for the host interfaces, used by unit tests.
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use async_trait::async_trait;
use base64::Engine;
use hybrid_api::cluster::{Cluster, RemoteNetworkConfig, RemoteNodeNetwork};
use hybrid_api::node_config::{HybridOptions, IamRolesAnywhere, NodeConfig, Ssm};
use k8s_openapi::api::core::v1::{Node, Pod};
use utils::backoff::RetryPolicy;

use crate::artifact::Fetcher;
use crate::cluster::{CachedCluster, ClusterDescriber};
use crate::daemon::{DaemonManager, DaemonStatus};
use crate::host::Host;
use crate::layout::HostLayout;
use crate::node_provider::{NodeProvider, NodeProviderOptions};
use crate::system::os::OsInfo;
use crate::system::{BinaryLookup, CommandRunner};
use crate::validation::credentials::CredentialsLoader;
use crate::validation::network::HostNetwork;
use crate::validation::node::NodeStatusSource;

/// Records every command line and answers from canned responses. Commands
/// without a response succeed with empty output.
#[derive(Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<String>>,
    responses: HashMap<String, String>,
    failing: HashMap<String, String>,
    transient: Mutex<HashMap<String, u32>>,
}

impl RecordingRunner {
    pub fn respond(mut self, cmdline: &str, stdout: &str) -> Self {
        self.responses.insert(cmdline.to_string(), stdout.to_string());
        self
    }

    /// Every invocation of `cmdline` fails with `stderr`.
    pub fn fail(mut self, cmdline: &str, stderr: &str) -> Self {
        self.failing.insert(cmdline.to_string(), stderr.to_string());
        self
    }

    /// The first `n` invocations of `program` fail.
    pub fn fail_times(self, program: &str, n: u32) -> Self {
        self.transient
            .lock()
            .unwrap()
            .insert(program.to_string(), n);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, cmdline: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.as_str() == cmdline)
            .count()
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, program: &str, args: &[&str]) -> anyhow::Result<String> {
        let cmdline = std::iter::once(program)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");
        self.calls.lock().unwrap().push(cmdline.clone());

        if let Some(left) = self.transient.lock().unwrap().get_mut(program) {
            if *left > 0 {
                *left -= 1;
                return Err(anyhow!("{program}: could not get lock"));
            }
        }
        if let Some(stderr) = self.failing.get(&cmdline) {
            return Err(anyhow!("`{cmdline}` failed: {stderr}"));
        }
        Ok(self.responses.get(&cmdline).cloned().unwrap_or_default())
    }
}

#[derive(Default)]
pub struct FakeFetcher {
    files: HashMap<String, Vec<u8>>,
    fetched: Mutex<Vec<String>>,
}

impl FakeFetcher {
    pub fn with(mut self, uri: &str, data: impl Into<Vec<u8>>) -> Self {
        self.files.insert(uri.to_string(), data.into());
        self
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }
}

#[async_trait]
impl Fetcher for FakeFetcher {
    async fn fetch(&self, uri: &str) -> anyhow::Result<Vec<u8>> {
        self.fetched.lock().unwrap().push(uri.to_string());
        self.files
            .get(uri)
            .cloned()
            .ok_or_else(|| anyhow!("404 Not Found: {uri}"))
    }
}

/// Tracks unit state in memory. Units never mentioned report `Unknown`.
#[derive(Default)]
pub struct FakeDaemonManager {
    status: Mutex<HashMap<String, DaemonStatus>>,
    actions: Mutex<Vec<String>>,
}

impl FakeDaemonManager {
    pub fn set_status(&self, name: &str, status: DaemonStatus) {
        self.status.lock().unwrap().insert(name.to_string(), status);
    }

    /// `"<verb> <name>"` for every call that changed something.
    pub fn actions(&self) -> Vec<String> {
        self.actions.lock().unwrap().clone()
    }

    fn record(&self, verb: &str, name: &str) {
        self.actions.lock().unwrap().push(format!("{verb} {name}"));
    }
}

impl DaemonManager for FakeDaemonManager {
    fn daemon_reload(&self) -> anyhow::Result<()> {
        self.record("reload", "systemd");
        Ok(())
    }

    fn start_daemon(&self, name: &str) -> anyhow::Result<()> {
        self.record("start", name);
        self.set_status(name, DaemonStatus::Running);
        Ok(())
    }

    fn stop_daemon(&self, name: &str) -> anyhow::Result<()> {
        if self.get_daemon_status(name)? == DaemonStatus::Running {
            self.record("stop", name);
            self.set_status(name, DaemonStatus::Stopped);
        }
        Ok(())
    }

    fn restart_daemon(&self, name: &str) -> anyhow::Result<()> {
        self.record("restart", name);
        self.set_status(name, DaemonStatus::Running);
        Ok(())
    }

    fn enable_daemon(&self, name: &str) -> anyhow::Result<()> {
        self.record("enable", name);
        Ok(())
    }

    fn disable_daemon(&self, name: &str) -> anyhow::Result<()> {
        self.record("disable", name);
        Ok(())
    }

    fn get_daemon_status(&self, name: &str) -> anyhow::Result<DaemonStatus> {
        Ok(self
            .status
            .lock()
            .unwrap()
            .get(name)
            .copied()
            .unwrap_or(DaemonStatus::Unknown))
    }
}

#[derive(Default)]
pub struct FakeBinaryLookup {
    found: Mutex<HashMap<String, PathBuf>>,
}

impl FakeBinaryLookup {
    pub fn add(&self, name: &str) {
        self.found
            .lock()
            .unwrap()
            .insert(name.to_string(), PathBuf::from("/usr/bin").join(name));
    }
}

impl BinaryLookup for FakeBinaryLookup {
    fn find(&self, name: &str) -> Option<PathBuf> {
        self.found.lock().unwrap().get(name).cloned()
    }
}

/// A [`Host`] rooted at a scratch directory, with handles on its fakes.
pub struct TestHost {
    pub host: Host,
    pub runner: Arc<RecordingRunner>,
    pub daemons: Arc<FakeDaemonManager>,
    pub binaries: Arc<FakeBinaryLookup>,
}

pub fn test_host(root: &Path, os_release: &str) -> TestHost {
    test_host_with_runner(root, os_release, RecordingRunner::default())
}

pub fn test_host_with_runner(root: &Path, os_release: &str, runner: RecordingRunner) -> TestHost {
    let runner = Arc::new(runner);
    let daemons = Arc::new(FakeDaemonManager::default());
    let binaries = Arc::new(FakeBinaryLookup::default());
    let host = Host {
        layout: HostLayout::with_root(root),
        os: OsInfo::parse(os_release),
        runner: runner.clone(),
        daemons: daemons.clone(),
        binaries: binaries.clone(),
        package_retry: RetryPolicy::immediate(2),
    };
    TestHost {
        host,
        runner,
        daemons,
        binaries,
    }
}

pub const UBUNTU: &str = "ID=ubuntu\nVERSION_ID=\"22.04\"\nVERSION_CODENAME=jammy\n";
pub const RHEL9: &str = "ID=\"rhel\"\nVERSION_ID=\"9.4\"\n";
pub const AL2023: &str = "ID=\"amzn\"\nVERSION_ID=\"2023\"\n";

/// A cluster with remote node network 10.0.0.0/24 and service CIDR
/// 172.16.0.0/16, running Kubernetes 1.31.
pub struct FixedCluster;

#[async_trait]
impl ClusterDescriber for FixedCluster {
    async fn describe_cluster(&self, name: &str) -> anyhow::Result<Cluster> {
        Ok(Cluster {
            name: name.to_string(),
            endpoint: Some("https://abc.gr7.us-west-2.eks.amazonaws.com".to_string()),
            certificate_authority: Some(
                base64::engine::general_purpose::STANDARD.encode("-----BEGIN CERTIFICATE-----\n"),
            ),
            service_ipv4_cidr: Some("172.16.0.0/16".to_string()),
            version: Some("1.31".to_string()),
            remote_network_config: Some(RemoteNetworkConfig {
                remote_node_networks: vec![RemoteNodeNetwork {
                    cidrs: vec!["10.0.0.0/24".to_string()],
                }],
                remote_pod_networks: vec![],
            }),
        })
    }
}

/// A host with a single address, which every name resolves to.
pub struct FixedNetwork(pub IpAddr);

#[async_trait]
impl HostNetwork for FixedNetwork {
    fn local_addresses(&self) -> anyhow::Result<Vec<IpAddr>> {
        Ok(vec![self.0])
    }

    fn default_route_address(&self) -> anyhow::Result<IpAddr> {
        Ok(self.0)
    }

    async fn lookup(&self, _host: &str) -> anyhow::Result<Vec<IpAddr>> {
        Ok(vec![self.0])
    }
}

pub struct StaticCredentials;

#[async_trait]
impl CredentialsLoader for StaticCredentials {
    async fn load(&self) -> anyhow::Result<String> {
        Ok("AKIAEXAMPLE".to_string())
    }
}

/// Node and pods held in memory; `None` means not registered.
#[derive(Default)]
pub struct FakeNodes {
    pub node: Mutex<Option<Node>>,
    pub pods: Mutex<Vec<Pod>>,
}

#[async_trait]
impl NodeStatusSource for FakeNodes {
    async fn get_node(&self, _name: &str) -> anyhow::Result<Option<Node>> {
        Ok(self.node.lock().unwrap().clone())
    }

    async fn list_pods_on_node(&self, _name: &str) -> anyhow::Result<Vec<Pod>> {
        Ok(self.pods.lock().unwrap().clone())
    }
}

pub fn iam_config(credentials_file: bool) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.spec.cluster.name = "hybrid".to_string();
    config.spec.cluster.region = "us-west-2".to_string();
    config.spec.hybrid = Some(HybridOptions {
        enable_credentials_file: credentials_file,
        iam_roles_anywhere: Some(IamRolesAnywhere {
            node_name: "node-1".to_string(),
            trust_anchor_arn: "arn:ta".to_string(),
            profile_arn: "arn:profile".to_string(),
            role_arn: "arn:role".to_string(),
            ..Default::default()
        }),
        ..Default::default()
    });
    config
}

pub fn ssm_config() -> NodeConfig {
    let mut config = iam_config(false);
    config.spec.hybrid = Some(HybridOptions {
        ssm: Some(Ssm {
            activation_code: "code".to_string(),
            activation_id: "id".to_string(),
        }),
        ..Default::default()
    });
    config
}

pub fn test_provider(t: &TestHost, config: NodeConfig, ip: &str) -> NodeProvider {
    NodeProvider::new(NodeProviderOptions {
        host: t.host.clone(),
        config,
        cluster: Arc::new(CachedCluster::new(Arc::new(FixedCluster))),
        network: Arc::new(FixedNetwork(ip.parse().unwrap())),
        credentials: Arc::new(StaticCredentials),
    })
}
