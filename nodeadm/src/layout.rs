//! Resolution of the fixed host paths used by every component.
//!
//! Components refer to their files by the absolute path they occupy on a
//! real node (`/usr/bin/kubelet`, `/opt/cni/bin`, ...). A `HostLayout`
//! rebases those paths onto a root directory, which is `/` in production and
//! a scratch directory in tests.
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostLayout {
    root: PathBuf,
}

impl Default for HostLayout {
    fn default() -> Self {
        Self::host()
    }
}

impl HostLayout {
    pub fn host() -> Self {
        Self {
            root: PathBuf::from("/"),
        }
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, absolute: impl AsRef<Path>) -> PathBuf {
        let absolute = absolute.as_ref();
        match absolute.strip_prefix("/") {
            Ok(relative) => self.root.join(relative),
            Err(_) => self.root.join(absolute),
        }
    }
}
