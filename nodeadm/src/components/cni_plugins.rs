//! The upstream CNI plugin binaries, shipped as a gzipped tarball and
//! unpacked into `/opt/cni/bin`.
//!
//! Unlike single-file components there is no one file to hash, so the digest
//! of the archive that was unpacked is kept next to the plugins and compared
//! on upgrade.
use std::fs;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use flate2::read::GzDecoder;
use tracing::info;

use crate::artifact::Artifact;
use crate::layout::HostLayout;
use crate::tracker::{self, Tracker};

pub const BIN_DIR: &str = "/opt/cni/bin";
pub const CONF_DIR: &str = "/etc/cni/net.d";
const DIGEST_FILE: &str = ".nodeadm-cni-plugins.sha256";

#[async_trait]
pub trait CniPluginsSource: Send + Sync {
    async fn get_cni_plugins(&self) -> anyhow::Result<Artifact>;
}

pub async fn install(
    layout: &HostLayout,
    tracker: &mut Tracker,
    source: &dyn CniPluginsSource,
) -> anyhow::Result<()> {
    let artifact = source.get_cni_plugins().await?;
    unpack(&layout.resolve(BIN_DIR), &artifact)?;
    tracker.add(tracker::CNI_PLUGINS)?;
    Ok(())
}

pub async fn upgrade(layout: &HostLayout, source: &dyn CniPluginsSource) -> anyhow::Result<()> {
    let artifact = source.get_cni_plugins().await?;
    let bin_dir = layout.resolve(BIN_DIR);
    let installed = fs::read_to_string(bin_dir.join(DIGEST_FILE)).unwrap_or_default();
    if installed.trim() == hex::encode(&artifact.checksum) {
        info!("cni-plugins are already up to date");
        return Ok(());
    }
    unpack(&bin_dir, &artifact)
}

pub fn uninstall(layout: &HostLayout) -> anyhow::Result<()> {
    utils::fs_ext::remove_dir_all_if_exists(layout.resolve(BIN_DIR))
}

fn unpack(bin_dir: &Path, artifact: &Artifact) -> anyhow::Result<()> {
    artifact.verify_data()?;
    fs::create_dir_all(bin_dir).with_context(|| format!("creating {}", bin_dir.display()))?;

    let mut archive = tar::Archive::new(GzDecoder::new(artifact.reader()));
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);
    archive
        .unpack(bin_dir)
        .with_context(|| format!("unpacking cni-plugins into {}", bin_dir.display()))?;

    utils::fs_ext::write_file(
        bin_dir.join(DIGEST_FILE),
        hex::encode(&artifact.checksum),
        0o644,
    )?;
    info!("installed cni-plugins into {}", bin_dir.display());
    Ok(())
}
