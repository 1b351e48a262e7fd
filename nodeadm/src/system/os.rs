//! Operating system identification from `/etc/os-release`.
use std::fmt;
use std::path::Path;

use anyhow::Context;

pub const OS_RELEASE_PATH: &str = "/etc/os-release";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OsFamily {
    Ubuntu,
    Rhel,
    Rocky,
    AmazonLinux2023,
    Other,
}

impl OsFamily {
    /// RHEL and its rebuilds share packaging and FIPS constraints.
    pub fn is_rhel_like(self) -> bool {
        matches!(self, OsFamily::Rhel | OsFamily::Rocky)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OsInfo {
    pub id: String,
    pub version_id: String,
    /// `VERSION_CODENAME`, only set by Debian derivatives.
    pub codename: String,
    pub family: OsFamily,
}

impl OsInfo {
    pub fn parse(os_release: &str) -> Self {
        let mut id = String::new();
        let mut version_id = String::new();
        let mut codename = String::new();
        for line in os_release.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"').trim_matches('\'');
            match key.trim() {
                "ID" => id = value.to_string(),
                "VERSION_ID" => version_id = value.to_string(),
                "VERSION_CODENAME" => codename = value.to_string(),
                _ => {}
            }
        }
        let family = match (id.as_str(), version_id.as_str()) {
            ("ubuntu", _) => OsFamily::Ubuntu,
            ("rhel", _) => OsFamily::Rhel,
            ("rocky", _) => OsFamily::Rocky,
            ("amzn", "2023") => OsFamily::AmazonLinux2023,
            _ => OsFamily::Other,
        };
        OsInfo {
            id,
            version_id,
            codename,
            family,
        }
    }

    pub fn detect(os_release_path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(os_release_path)
            .with_context(|| format!("reading {}", os_release_path.display()))?;
        Ok(Self::parse(&data))
    }

    /// Major version, `8` for `VERSION_ID="8.10"`.
    pub fn major_version(&self) -> Option<u32> {
        self.version_id.split('.').next()?.parse().ok()
    }
}

impl fmt::Display for OsInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.id, self.version_id)
    }
}
