//! Mount aware recursive removal.
//!
//! Directories such as `/var/lib/kubelet` can hold bind mounts of volumes
//! whose data lives elsewhere. A plain recursive delete would follow them
//! and destroy that data, so every entry is checked first and the tree is
//! only deleted once nothing is mounted below it.
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use nix::mount::MntFlags;
use tracing::{info, warn};
use utils::backoff::{Delay, RetryPolicy, retry_blocking};
use utils::fs_ext::PathExt;

const MOUNTINFO_PATH: &str = "/proc/self/mountinfo";
const UNMOUNT_ATTEMPTS: u32 = 3;

pub trait MountChecker: Send + Sync {
    fn is_mount_point(&self, path: &Path) -> anyhow::Result<bool>;
}

pub trait Unmounter: Send + Sync {
    fn unmount(&self, path: &Path, force: bool) -> anyhow::Result<()>;
}

/// Answers from `/proc/self/mountinfo`, read afresh on every query.
pub struct ProcMountChecker {
    mountinfo: PathBuf,
}

impl Default for ProcMountChecker {
    fn default() -> Self {
        Self {
            mountinfo: PathBuf::from(MOUNTINFO_PATH),
        }
    }
}

impl ProcMountChecker {
    fn mount_points(&self) -> anyhow::Result<HashSet<PathBuf>> {
        let data = fs::read_to_string(&self.mountinfo)
            .with_context(|| format!("reading {}", self.mountinfo.display()))?;
        Ok(parse_mountinfo(&data))
    }
}

impl MountChecker for ProcMountChecker {
    fn is_mount_point(&self, path: &Path) -> anyhow::Result<bool> {
        Ok(self.mount_points()?.contains(path))
    }
}

/// Mount points listed in mountinfo format: the fifth field, with the
/// kernel's octal escapes for whitespace undone.
pub fn parse_mountinfo(data: &str) -> HashSet<PathBuf> {
    data.lines()
        .filter_map(|line| line.split_whitespace().nth(4))
        .map(|field| PathBuf::from(unescape_octal(field)))
        .collect()
}

fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let code = std::str::from_utf8(&bytes[i + 1..i + 4]).ok();
            if let Some(value) = code.and_then(|c| u8::from_str_radix(c, 8).ok()) {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

pub struct SystemUnmounter;

impl Unmounter for SystemUnmounter {
    fn unmount(&self, path: &Path, force: bool) -> anyhow::Result<()> {
        let flags = if force {
            MntFlags::MNT_FORCE
        } else {
            MntFlags::empty()
        };
        nix::mount::umount2(path, flags).with_context(|| format!("unmounting {}", path.display()))
    }
}

pub struct SafeRemover {
    checker: Arc<dyn MountChecker>,
    unmounter: Arc<dyn Unmounter>,
    /// Fall back to a forced unmount once a graceful one keeps failing.
    force_unmount: bool,
    retry: RetryPolicy,
}

impl SafeRemover {
    pub fn new(checker: Arc<dyn MountChecker>, unmounter: Arc<dyn Unmounter>) -> Self {
        Self {
            checker,
            unmounter,
            force_unmount: false,
            retry: RetryPolicy {
                max_attempts: UNMOUNT_ATTEMPTS,
                delay: Delay::Fixed(Duration::from_secs(1)),
            },
        }
    }

    pub fn system() -> Self {
        Self::new(Arc::new(ProcMountChecker::default()), Arc::new(SystemUnmounter))
    }

    pub fn with_force_unmount(mut self, force: bool) -> Self {
        self.force_unmount = force;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Mount points at or below `root`. Directory mount points are recorded
    /// without descending into them.
    pub fn find_mount_points(&self, root: &Path) -> anyhow::Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        self.walk(root, &mut found)?;
        Ok(found)
    }

    fn walk(&self, path: &Path, found: &mut Vec<PathBuf>) -> anyhow::Result<()> {
        let metadata = fs::symlink_metadata(path)
            .with_context(|| format!("inspecting {}", path.display()))?;
        if self.checker.is_mount_point(path)? {
            found.push(path.to_path_buf());
            return Ok(());
        }
        if !metadata.is_dir() {
            return Ok(());
        }
        let entries = fs::read_dir(path).with_context(|| format!("listing {}", path.display()))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("listing {}", path.display()))?;
            self.walk(&entry.path(), found)?;
        }
        Ok(())
    }

    /// Removes `root` recursively. Mounted entries below it make this fail
    /// unless `allow_unmount` is set, in which case they are unmounted
    /// deepest first and checked again before anything is deleted.
    pub fn remove_all(&self, root: &Path, allow_unmount: bool) -> anyhow::Result<()> {
        match fs::symlink_metadata(root) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).with_context(|| format!("inspecting {}", root.display())),
        }
        let mut mounts = self.find_mount_points(root)?;
        if !mounts.is_empty() {
            if !allow_unmount {
                bail!(
                    "refusing to remove {}: found {} mount points: {}",
                    root.display(),
                    mounts.len(),
                    display_paths(&mounts)
                );
            }
            mounts.sort_by_key(|p| std::cmp::Reverse(p.depth()));
            for mount in &mounts {
                self.unmount(mount)?;
            }
            let remaining: Vec<PathBuf> = mounts
                .iter()
                .filter_map(|m| match self.checker.is_mount_point(m) {
                    Ok(false) => None,
                    _ => Some(m.clone()),
                })
                .collect();
            if !remaining.is_empty() {
                bail!(
                    "refusing to remove {}: {} mount points are still mounted: {}",
                    root.display(),
                    remaining.len(),
                    display_paths(&remaining)
                );
            }
        }
        fs::remove_dir_all(root).with_context(|| format!("removing {}", root.display()))?;
        info!("removed {}", root.display());
        Ok(())
    }

    fn unmount(&self, path: &Path) -> anyhow::Result<()> {
        let description = format!("unmount {}", path.display());
        let graceful = retry_blocking(&self.retry, &description, || self.unmounter.unmount(path, false));
        match graceful {
            Ok(()) => Ok(()),
            Err(e) if self.force_unmount => {
                warn!("graceful unmount of {} failed, forcing: {e:#}", path.display());
                retry_blocking(&self.retry, &description, || self.unmounter.unmount(path, true))
            }
            Err(e) => Err(e),
        }
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
