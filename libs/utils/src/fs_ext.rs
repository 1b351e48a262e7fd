/// Extensions to `std::fs` types.
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path};

use anyhow::Context;

pub trait PathExt {
    /// Number of normal components, used to order paths deepest first.
    fn depth(&self) -> usize;
}

impl<P> PathExt for P
where
    P: AsRef<Path>,
{
    fn depth(&self) -> usize {
        self.as_ref()
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .count()
    }
}

pub fn ignore_not_found(e: io::Error) -> io::Result<()> {
    if e.kind() == io::ErrorKind::NotFound {
        Ok(())
    } else {
        Err(e)
    }
}

pub fn ignore_absent_files<F>(fs_operation: F) -> io::Result<()>
where
    F: Fn() -> io::Result<()>,
{
    fs_operation().or_else(ignore_not_found)
}

/// Removes a file, succeeding if it was already gone.
pub fn remove_file_if_exists(path: impl AsRef<Path>) -> anyhow::Result<()> {
    let path = path.as_ref();
    ignore_absent_files(|| fs::remove_file(path))
        .with_context(|| format!("removing {}", path.display()))
}

/// Removes a directory tree, succeeding if it was already gone.
pub fn remove_dir_all_if_exists(path: impl AsRef<Path>) -> anyhow::Result<()> {
    let path = path.as_ref();
    ignore_absent_files(|| fs::remove_dir_all(path))
        .with_context(|| format!("removing directory {}", path.display()))
}

/// Writes `contents` to `path`, creating parent directories, and sets the
/// permission bits to `mode`.
pub fn write_file(path: impl AsRef<Path>, contents: impl AsRef<[u8]>, mode: u32) -> anyhow::Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("writing {}", path.display()))?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("setting permissions on {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod test {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn depth_counts_normal_components() {
        assert_eq!(PathBuf::from("/").depth(), 0);
        assert_eq!(PathBuf::from("/var/lib/kubelet").depth(), 3);
        assert_eq!(PathBuf::from("/var/lib/kubelet/").depth(), 3);
    }

    #[test]
    fn ignore_absent_files_works() {
        let dir = tempfile::tempdir().unwrap();

        let file_path = dir.path().join("testfile");

        ignore_absent_files(|| std::fs::remove_file(&file_path)).expect("should execute normally");

        let f = std::fs::File::create(&file_path).unwrap();
        drop(f);

        ignore_absent_files(|| std::fs::remove_file(&file_path)).expect("should execute normally");

        assert!(!file_path.exists());
    }

    #[test]
    fn write_file_creates_parents_and_sets_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/tracker");
        write_file(&path, "hello", 0o644).unwrap();
        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o644);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello");

        remove_file_if_exists(&path).unwrap();
        remove_file_if_exists(&path).unwrap();
        remove_dir_all_if_exists(dir.path().join("a")).unwrap();
        remove_dir_all_if_exists(dir.path().join("a")).unwrap();
    }
}
