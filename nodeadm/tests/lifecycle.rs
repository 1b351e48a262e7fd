//! Install and uninstall against a scratch root through the public API.
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hybrid_api::cluster::RemoteNodeNetwork;
use k8s_openapi::api::core::v1::{Node, Pod};
use sha2::{Digest, Sha256};
use utils::backoff::RetryPolicy;

use nodeadm::artifact::{Artifact, Fetcher};
use nodeadm::components::cni_plugins::CniPluginsSource;
use nodeadm::components::iam_authenticator::IamAuthenticatorSource;
use nodeadm::components::iam_roles_anywhere::SigningHelperSource;
use nodeadm::components::image_credential_provider::ImageCredentialProviderSource;
use nodeadm::components::kubectl::KubectlSource;
use nodeadm::components::kubelet::KubeletSource;
use nodeadm::components::ssm::{InstanceDeregisterer, SsmSource};
use nodeadm::config;
use nodeadm::creds::CredentialProvider;
use nodeadm::daemon::{DaemonManager, DaemonStatus};
use nodeadm::flows::install::Installer;
use nodeadm::flows::uninstall::Uninstaller;
use nodeadm::host::Host;
use nodeadm::layout::HostLayout;
use nodeadm::packages::PackageManager;
use nodeadm::remediation::remediation;
use nodeadm::safe_remove::{MountChecker, SafeRemover, Unmounter};
use nodeadm::system::os::OsInfo;
use nodeadm::system::{BinaryLookup, CommandRunner};
use nodeadm::tracker::{ContainerdSource, TRACKER_FILE, Tracker};
use nodeadm::validation::cni::{Cni, detect_local};
use nodeadm::validation::network::validate_ip_in_remote_node_networks;
use nodeadm::validation::node::NodeStatusSource;
use nodeadm::validation::{ReportInformer, SkipSet};

const UBUNTU: &str = "ID=ubuntu\nVERSION_ID=\"22.04\"\nVERSION_CODENAME=jammy\n";

#[derive(Default)]
struct Commands(Mutex<Vec<String>>);

impl CommandRunner for Commands {
    fn run(&self, program: &str, args: &[&str]) -> anyhow::Result<String> {
        let mut line = program.to_string();
        for arg in args {
            line.push(' ');
            line.push_str(arg);
        }
        self.0.lock().unwrap().push(line);
        Ok(String::new())
    }
}

#[derive(Default)]
struct Daemons(Mutex<HashMap<String, DaemonStatus>>);

impl Daemons {
    fn set(&self, name: &str, status: DaemonStatus) {
        self.0.lock().unwrap().insert(name.to_string(), status);
    }
}

impl DaemonManager for Daemons {
    fn daemon_reload(&self) -> anyhow::Result<()> {
        Ok(())
    }
    fn start_daemon(&self, name: &str) -> anyhow::Result<()> {
        self.set(name, DaemonStatus::Running);
        Ok(())
    }
    fn stop_daemon(&self, name: &str) -> anyhow::Result<()> {
        if self.get_daemon_status(name)? == DaemonStatus::Running {
            self.set(name, DaemonStatus::Stopped);
        }
        Ok(())
    }
    fn restart_daemon(&self, name: &str) -> anyhow::Result<()> {
        self.start_daemon(name)
    }
    fn enable_daemon(&self, _name: &str) -> anyhow::Result<()> {
        Ok(())
    }
    fn disable_daemon(&self, _name: &str) -> anyhow::Result<()> {
        Ok(())
    }
    fn get_daemon_status(&self, name: &str) -> anyhow::Result<DaemonStatus> {
        Ok(self
            .0
            .lock()
            .unwrap()
            .get(name)
            .copied()
            .unwrap_or(DaemonStatus::Unknown))
    }
}

/// containerd, runc and iptables came with the machine image.
struct Preinstalled;

impl BinaryLookup for Preinstalled {
    fn find(&self, name: &str) -> Option<PathBuf> {
        matches!(name, "containerd" | "runc" | "iptables").then(|| Path::new("/usr/bin").join(name))
    }
}

struct NoDownloads;

#[async_trait]
impl Fetcher for NoDownloads {
    async fn fetch(&self, uri: &str) -> anyhow::Result<Vec<u8>> {
        anyhow::bail!("unexpected download of {uri}")
    }
}

struct Release;

impl Release {
    fn get(&self, name: &str) -> anyhow::Result<Artifact> {
        if name == "cni-plugins" {
            return Ok(cni_plugins());
        }
        let data = format!("{name}-v1.31.2").into_bytes();
        let checksum = Sha256::digest(&data).to_vec();
        Ok(Artifact::new(name, data, checksum))
    }
}

fn cni_plugins() -> Artifact {
    let mut builder = tar::Builder::new(flate2::write::GzEncoder::new(
        Vec::new(),
        flate2::Compression::default(),
    ));
    let mut header = tar::Header::new_gnu();
    header.set_size(8);
    header.set_mode(0o755);
    header.set_cksum();
    builder.append_data(&mut header, "loopback", &b"loopback"[..]).unwrap();
    let data = builder.into_inner().unwrap().finish().unwrap();
    let checksum = Sha256::digest(&data).to_vec();
    Artifact::new("cni-plugins", data, checksum)
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
        self.get("ecr-credential-provider")
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

struct NotRegistered;

#[async_trait]
impl NodeStatusSource for NotRegistered {
    async fn get_node(&self, _name: &str) -> anyhow::Result<Option<Node>> {
        Ok(None)
    }
    async fn list_pods_on_node(&self, _name: &str) -> anyhow::Result<Vec<Pod>> {
        Ok(Vec::new())
    }
}

struct NeverDeregister;

#[async_trait]
impl InstanceDeregisterer for NeverDeregister {
    async fn deregister(&self, instance_id: &str, _region: &str) -> anyhow::Result<()> {
        anyhow::bail!("{instance_id} was never registered")
    }
}

#[derive(Default)]
struct MountTable(Mutex<HashSet<PathBuf>>);

impl MountChecker for MountTable {
    fn is_mount_point(&self, path: &Path) -> anyhow::Result<bool> {
        Ok(self.0.lock().unwrap().contains(path))
    }
}

impl Unmounter for MountTable {
    fn unmount(&self, path: &Path, _force: bool) -> anyhow::Result<()> {
        self.0.lock().unwrap().remove(path);
        Ok(())
    }
}

fn host(root: &Path, commands: Arc<Commands>, daemons: Arc<Daemons>) -> Host {
    Host {
        layout: HostLayout::with_root(root),
        os: OsInfo::parse(UBUNTU),
        runner: commands,
        daemons,
        binaries: Arc::new(Preinstalled),
        package_retry: RetryPolicy::immediate(1),
    }
}

#[tokio::test]
async fn preinstalled_containerd_survives_install_and_uninstall() {
    let dir = tempfile::tempdir().unwrap();
    let commands = Arc::new(Commands::default());
    let daemons = Arc::new(Daemons::default());
    daemons.set("containerd", DaemonStatus::Running);
    let host = host(dir.path(), commands.clone(), daemons.clone());

    let packages = PackageManager::new(&host, ContainerdSource::Distro).unwrap();
    Installer {
        host: &host,
        packages: &packages,
        fetcher: &NoDownloads,
        eks: &Release,
        ssm: &Release,
        credential_provider: CredentialProvider::IamRolesAnywhere,
        containerd_source: ContainerdSource::Distro,
    }
    .run()
    .await
    .unwrap();

    let tracker = Tracker::load(&dir.path().join(TRACKER_FILE.trim_start_matches('/'))).unwrap();
    assert_eq!(tracker.artifacts.containerd, ContainerdSource::None);
    assert!(!tracker.artifacts.iptables);
    assert!(tracker.artifacts.kubelet && tracker.artifacts.iam_roles_anywhere);
    assert!(dir.path().join("opt/cni/bin/loopback").exists());

    let mounts = Arc::new(MountTable::default());
    let remover = SafeRemover::new(mounts.clone(), mounts).with_retry(RetryPolicy::immediate(1));
    Uninstaller {
        host: &host,
        nodes: Arc::new(NotRegistered),
        deregisterer: &NeverDeregister,
        remover: &remover,
        skip: SkipSet::default(),
        informer: &ReportInformer::default(),
        force: false,
    }
    .run()
    .await
    .unwrap();

    assert_eq!(
        daemons.get_daemon_status("containerd").unwrap(),
        DaemonStatus::Running
    );
    let commands = commands.0.lock().unwrap();
    assert!(
        commands
            .iter()
            .all(|c| !c.contains("containerd") && !c.contains("iptables")),
        "{commands:?}"
    );
    for gone in [
        "usr/bin/kubelet",
        "usr/local/bin/kubectl",
        "usr/local/bin/aws_signing_helper",
        "opt/cni/bin",
        "etc/eks",
        "opt/nodeadm",
    ] {
        assert!(!dir.path().join(gone).exists(), "{gone} left behind");
    }
}

#[test]
fn hostname_override_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(
        &path,
        r#"
apiVersion: node.eks.aws/v1alpha1
kind: NodeConfig
spec:
  cluster:
    name: hybrid
  hybrid:
    ssm:
      activationCode: code
  kubelet:
    flags:
      - --hostname-override=my-node
"#,
    )
    .unwrap();
    let node_config = config::load(&format!("file://{}", path.display())).unwrap();
    // region and activationId are missing too, the override is still named
    let err = config::validate(&node_config).unwrap_err().to_string();
    assert!(err.contains("hostname-override"), "{err}");
    assert!(err.contains("my-node"), "{err}");
}

#[test]
fn node_ip_must_be_in_a_remote_node_network() {
    let networks = [
        RemoteNodeNetwork {
            cidrs: vec!["10.0.0.0/24".to_string()],
        },
        RemoteNodeNetwork {
            cidrs: vec!["192.168.100.0/22".to_string()],
        },
    ];
    let ip = |s: &str| s.parse::<IpAddr>().unwrap();
    validate_ip_in_remote_node_networks(ip("192.168.102.7"), &networks).unwrap();
    let err = validate_ip_in_remote_node_networks(ip("10.0.1.1"), &networks).unwrap_err();
    assert_eq!(
        err.to_string(),
        "node IP 10.0.1.1 is not in any of the remote network CIDR blocks [10.0.0.0/24, 192.168.100.0/22]"
    );
    assert!(remediation(&err).is_some());
}

#[test]
fn cilium_wins_over_calico() {
    let dir = tempfile::tempdir().unwrap();
    let layout = HostLayout::with_root(dir.path());
    assert_eq!(detect_local(&layout), None);

    let conf = dir.path().join("etc/cni/net.d");
    std::fs::create_dir_all(&conf).unwrap();
    std::fs::write(conf.join("10-calico.conflist"), "{}").unwrap();
    assert_eq!(detect_local(&layout), Some(Cni::Calico));

    std::fs::write(conf.join("05-cilium.conflist"), "{}").unwrap();
    assert_eq!(detect_local(&layout), Some(Cni::Cilium));
}

#[test]
fn mounted_volumes_are_never_deleted() {
    let dir = tempfile::tempdir().unwrap();
    let volume = dir.path().join("pods/uid/volumes/kubernetes.io~csi/pv/mount");
    std::fs::create_dir_all(&volume).unwrap();
    std::fs::write(volume.join("data"), "precious").unwrap();
    let mounts = Arc::new(MountTable::default());
    mounts.0.lock().unwrap().insert(volume.clone());

    let remover = SafeRemover::new(mounts.clone(), mounts).with_retry(RetryPolicy::immediate(1));
    assert!(remover.remove_all(dir.path(), false).is_err());
    assert_eq!(std::fs::read_to_string(volume.join("data")).unwrap(), "precious");
}
