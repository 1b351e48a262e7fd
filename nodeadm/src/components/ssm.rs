//! The SSM agent and hybrid activation.
//!
//! nodeadm installs only the `ssm-setup-cli`; the agent itself is installed
//! and registered by that CLI when the node is initialised with an
//! activation. Ubuntu gets the agent as a snap, which changes its unit name,
//! so the daemon name is resolved once from the OS and kept on [`SsmAgent`].
use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use hybrid_api::node_config::Ssm;
use serde::Deserialize;
use tracing::{info, warn};

use super::{install_binary, upgrade_binary};
use crate::artifact::{Artifact, Package};
use crate::host::Host;
use crate::system::os::{OsFamily, OsInfo};
use crate::tracker::{self, Tracker};

pub const SETUP_CLI_PATH: &str = "/opt/ssm/ssm-setup-cli";
pub const REGISTRATION_PATH: &str = "/var/lib/amazon/ssm/registration";
const STATE_DIRS: [&str; 3] = ["/var/lib/amazon/ssm", "/etc/amazon/ssm", "/opt/ssm"];

const AGENT: &str = "amazon-ssm-agent";
const SNAP_DAEMON_NAME: &str = "snap.amazon-ssm-agent.amazon-ssm-agent";

#[async_trait]
pub trait SsmSource: Send + Sync {
    async fn get_setup_cli(&self) -> anyhow::Result<Artifact>;
}

/// Removes a managed instance from Systems Manager.
#[async_trait]
pub trait InstanceDeregisterer: Send + Sync {
    async fn deregister(&self, instance_id: &str, region: &str) -> anyhow::Result<()>;
}

pub struct SsmClientDeregisterer;

#[async_trait]
impl InstanceDeregisterer for SsmClientDeregisterer {
    async fn deregister(&self, instance_id: &str, region: &str) -> anyhow::Result<()> {
        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_sdk_ssm::config::Region::new(region.to_string()))
            .load()
            .await;
        let client = aws_sdk_ssm::Client::new(&config);
        client
            .deregister_managed_instance()
            .instance_id(instance_id)
            .send()
            .await
            .with_context(|| format!("deregistering managed instance {instance_id}"))?;
        Ok(())
    }
}

/// The contents of the agent's registration file.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct SsmRegistration {
    #[serde(rename = "ManagedInstanceID")]
    pub managed_instance_id: String,
    #[serde(rename = "Region", default)]
    pub region: String,
}

pub fn daemon_name(os: &OsInfo) -> &'static str {
    match os.family {
        OsFamily::Ubuntu => SNAP_DAEMON_NAME,
        _ => AGENT,
    }
}

fn agent_package(os: &OsInfo) -> Package {
    let cmd = |args: &[&str]| args.iter().map(|a| a.to_string()).collect::<Vec<_>>();
    match os.family {
        OsFamily::Ubuntu => Package {
            name: AGENT.to_string(),
            install: cmd(&["snap", "install", AGENT, "--classic"]),
            upgrade: cmd(&["snap", "refresh", AGENT]),
            uninstall: cmd(&["snap", "remove", "--purge", AGENT]),
        },
        _ => Package {
            name: AGENT.to_string(),
            install: cmd(&["yum", "install", "-y", AGENT]),
            upgrade: cmd(&["yum", "update", "-y", AGENT]),
            uninstall: cmd(&["yum", "remove", "-y", AGENT]),
        },
    }
}

pub struct SsmAgent {
    host: Host,
    daemon_name: &'static str,
    package: Package,
}

impl SsmAgent {
    pub fn new(host: &Host) -> Self {
        Self {
            daemon_name: daemon_name(&host.os),
            package: agent_package(&host.os),
            host: host.clone(),
        }
    }

    pub fn daemon_name(&self) -> &'static str {
        self.daemon_name
    }

    fn setup_cli(&self) -> PathBuf {
        self.host.layout.resolve(SETUP_CLI_PATH)
    }

    pub async fn install(&self, tracker: &mut Tracker, source: &dyn SsmSource) -> anyhow::Result<()> {
        let artifact = source.get_setup_cli().await?;
        install_binary(&self.host.layout, SETUP_CLI_PATH, &artifact)?;
        tracker.add(tracker::SSM)?;
        Ok(())
    }

    /// Refreshes the setup CLI and, if the agent is installed, the agent
    /// package. The existing registration is kept.
    pub async fn upgrade(&self, source: &dyn SsmSource) -> anyhow::Result<()> {
        let artifact = source.get_setup_cli().await?;
        upgrade_binary(&self.host.layout, SETUP_CLI_PATH, &artifact)?;
        if self.registration()?.is_some() {
            self.package
                .upgrade(self.host.runner.as_ref(), &self.host.package_retry)?;
        }
        Ok(())
    }

    pub fn registration(&self) -> anyhow::Result<Option<SsmRegistration>> {
        let path = self.host.layout.resolve(REGISTRATION_PATH);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        let registration: SsmRegistration = serde_json::from_slice(&data)
            .with_context(|| format!("parsing {}", path.display()))?;
        if registration.managed_instance_id.is_empty() {
            return Ok(None);
        }
        Ok(Some(registration))
    }

    /// Installs the agent and registers it with the activation. A node
    /// that is already registered is left as it is.
    pub fn register(&self, activation: &Ssm, region: &str) -> anyhow::Result<()> {
        if let Some(existing) = self.registration()? {
            info!(
                "node is already registered as managed instance {}",
                existing.managed_instance_id
            );
            return Ok(());
        }
        info!("registering node with SSM in {region}");
        let cli = self.setup_cli();
        let args = [
            "-register",
            "-activation-code",
            activation.activation_code.as_str(),
            "-activation-id",
            activation.activation_id.as_str(),
            "-region",
            region,
        ];
        utils::backoff::retry_blocking(&self.host.package_retry, "ssm registration", || {
            self.host.runner.run(&cli.to_string_lossy(), &args)
        })
        .context("registering with SSM")?;
        Ok(())
    }

    /// Removes the agent and its local state. The managed instance stays
    /// registered in the fleet.
    pub fn uninstall(&self) -> anyhow::Result<()> {
        self.host.daemons.stop_daemon(self.daemon_name)?;
        self.package
            .uninstall(self.host.runner.as_ref(), &self.host.package_retry)?;
        for dir in STATE_DIRS {
            utils::fs_ext::remove_dir_all_if_exists(self.host.layout.resolve(dir))?;
        }
        Ok(())
    }

    /// Deregisters the managed instance, then uninstalls.
    pub async fn deregister_and_uninstall(
        &self,
        deregisterer: &dyn InstanceDeregisterer,
    ) -> anyhow::Result<()> {
        match self.registration()? {
            Some(registration) => {
                info!(
                    "deregistering managed instance {}",
                    registration.managed_instance_id
                );
                deregisterer
                    .deregister(&registration.managed_instance_id, &registration.region)
                    .await?;
            }
            None => warn!("no SSM registration found, nothing to deregister"),
        }
        self.uninstall()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::daemon::DaemonStatus;
    use crate::testing::{RHEL9, UBUNTU, test_host};

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    #[async_trait]
    impl InstanceDeregisterer for Recorder {
        async fn deregister(&self, instance_id: &str, region: &str) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(format!("{instance_id}@{region}"));
            Ok(())
        }
    }

    #[test]
    fn daemon_name_depends_on_os() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            SsmAgent::new(&test_host(dir.path(), UBUNTU).host).daemon_name(),
            "snap.amazon-ssm-agent.amazon-ssm-agent"
        );
        assert_eq!(
            SsmAgent::new(&test_host(dir.path(), RHEL9).host).daemon_name(),
            "amazon-ssm-agent"
        );
    }

    #[test]
    fn register_is_skipped_when_registered() {
        let dir = tempfile::tempdir().unwrap();
        let t = test_host(dir.path(), RHEL9);
        let agent = SsmAgent::new(&t.host);
        let activation = Ssm {
            activation_code: "code".to_string(),
            activation_id: "id".to_string(),
        };

        agent.register(&activation, "us-west-2").unwrap();
        let cli = dir.path().join("opt/ssm/ssm-setup-cli");
        assert_eq!(
            t.runner.count(&format!(
                "{} -register -activation-code code -activation-id id -region us-west-2",
                cli.display()
            )),
            1
        );

        utils::fs_ext::write_file(
            dir.path().join("var/lib/amazon/ssm/registration"),
            r#"{"ManagedInstanceID":"mi-0123","Region":"us-west-2"}"#,
            0o600,
        )
        .unwrap();
        agent.register(&activation, "us-west-2").unwrap();
        assert_eq!(t.runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn uninstall_keeps_registration_deregister_does_not() {
        let dir = tempfile::tempdir().unwrap();
        let t = test_host(dir.path(), UBUNTU);
        let agent = SsmAgent::new(&t.host);
        utils::fs_ext::write_file(
            dir.path().join("var/lib/amazon/ssm/registration"),
            r#"{"ManagedInstanceID":"mi-0123","Region":"eu-west-1"}"#,
            0o600,
        )
        .unwrap();
        t.daemons.set_status(agent.daemon_name(), DaemonStatus::Running);

        let recorder = Recorder::default();
        agent.deregister_and_uninstall(&recorder).await.unwrap();
        assert_eq!(*recorder.0.lock().unwrap(), ["mi-0123@eu-west-1"]);
        assert_eq!(t.runner.count("snap remove --purge amazon-ssm-agent"), 1);
        assert!(!dir.path().join("var/lib/amazon/ssm").exists());

        // nothing left to deregister
        agent.deregister_and_uninstall(&recorder).await.unwrap();
        assert_eq!(recorder.0.lock().unwrap().len(), 1);
    }
}
