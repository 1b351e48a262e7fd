//! Control of the service units nodeadm manages.
//!
//! Units follow the `<name>.service` convention. The only implementation is
//! systemd, driven through `systemctl`.
use std::sync::Arc;

use anyhow::Context;
use tracing::{debug, info};

use crate::system::CommandRunner;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DaemonStatus {
    Running,
    Stopped,
    /// The unit does not exist.
    Unknown,
}

pub trait DaemonManager: Send + Sync {
    fn daemon_reload(&self) -> anyhow::Result<()>;
    fn start_daemon(&self, name: &str) -> anyhow::Result<()>;
    /// Succeeds without doing anything when the daemon is not running.
    fn stop_daemon(&self, name: &str) -> anyhow::Result<()>;
    fn restart_daemon(&self, name: &str) -> anyhow::Result<()>;
    /// Succeeds when the unit is already enabled.
    fn enable_daemon(&self, name: &str) -> anyhow::Result<()>;
    /// Succeeds when the unit is already disabled.
    fn disable_daemon(&self, name: &str) -> anyhow::Result<()>;
    fn get_daemon_status(&self, name: &str) -> anyhow::Result<DaemonStatus>;
}

pub fn unit_name(name: &str) -> String {
    if name.ends_with(".service") {
        name.to_string()
    } else {
        format!("{name}.service")
    }
}

pub struct SystemdDaemonManager {
    runner: Arc<dyn CommandRunner>,
}

impl SystemdDaemonManager {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn systemctl(&self, args: &[&str]) -> anyhow::Result<String> {
        self.runner.run("systemctl", args)
    }

    fn is_enabled(&self, unit: &str) -> bool {
        // `is-enabled` exits non-zero for disabled and missing units
        self.systemctl(&["is-enabled", unit])
            .map(|out| out.trim() == "enabled")
            .unwrap_or(false)
    }
}

impl DaemonManager for SystemdDaemonManager {
    fn daemon_reload(&self) -> anyhow::Result<()> {
        self.systemctl(&["daemon-reload"])
            .context("systemctl daemon-reload")?;
        Ok(())
    }

    fn start_daemon(&self, name: &str) -> anyhow::Result<()> {
        let unit = unit_name(name);
        info!("starting {unit}");
        self.systemctl(&["start", &unit])?;
        Ok(())
    }

    fn stop_daemon(&self, name: &str) -> anyhow::Result<()> {
        let unit = unit_name(name);
        if self.get_daemon_status(name)? != DaemonStatus::Running {
            debug!("{unit} is not running");
            return Ok(());
        }
        info!("stopping {unit}");
        self.systemctl(&["stop", &unit])?;
        Ok(())
    }

    fn restart_daemon(&self, name: &str) -> anyhow::Result<()> {
        let unit = unit_name(name);
        info!("restarting {unit}");
        self.systemctl(&["restart", &unit])?;
        Ok(())
    }

    fn enable_daemon(&self, name: &str) -> anyhow::Result<()> {
        let unit = unit_name(name);
        if self.is_enabled(&unit) {
            return Ok(());
        }
        info!("enabling {unit}");
        self.systemctl(&["enable", &unit])?;
        Ok(())
    }

    fn disable_daemon(&self, name: &str) -> anyhow::Result<()> {
        let unit = unit_name(name);
        if !self.is_enabled(&unit) {
            return Ok(());
        }
        info!("disabling {unit}");
        self.systemctl(&["disable", &unit])?;
        Ok(())
    }

    fn get_daemon_status(&self, name: &str) -> anyhow::Result<DaemonStatus> {
        let unit = unit_name(name);
        let out = self.systemctl(&["show", "--property=LoadState,ActiveState", &unit])?;
        Ok(parse_status(&out))
    }
}

/// Interprets `systemctl show --property=LoadState,ActiveState` output.
fn parse_status(show: &str) -> DaemonStatus {
    let mut load_state = "";
    let mut active_state = "";
    for line in show.lines() {
        match line.split_once('=') {
            Some(("LoadState", v)) => load_state = v.trim(),
            Some(("ActiveState", v)) => active_state = v.trim(),
            _ => {}
        }
    }
    match (load_state, active_state) {
        ("not-found", _) | ("", _) => DaemonStatus::Unknown,
        (_, "active" | "activating" | "reloading") => DaemonStatus::Running,
        _ => DaemonStatus::Stopped,
    }
}
