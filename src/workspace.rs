//! Explicit workspace handle.
//!
//! The builder never derives staging paths from globals: every stage receives
//! the same [`Workspace`] and asks it for the tree it works on.
//!
//! ```text
//! <root>/
//!   downloads/   base archive + published checksum (survives create())
//!   rootfs/      root filesystem staging tree
//!   bootfs/      boot image staging tree (loader, kernel, initramfs, root image)
//!   initramfs/   first-stage boot root
//! ```
//!
//! Nothing is removed while a filesystem is still mounted inside it: a
//! leftover bind mount of the host `/dev` under `rootfs/` would otherwise
//! take host files with it.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::BuildError;

const TREES: [&str; 3] = ["rootfs", "bootfs", "initramfs"];

const MOUNT_TABLE: &str = "/proc/self/mountinfo";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    root: PathBuf,
    mount_table: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            mount_table: PathBuf::from(MOUNT_TABLE),
        }
    }

    /// Read mounts from `path` (mountinfo format) instead of the live table.
    pub fn with_mount_table(mut self, path: impl Into<PathBuf>) -> Self {
        self.mount_table = path.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn downloads(&self) -> PathBuf {
        self.root.join("downloads")
    }

    pub fn rootfs(&self) -> PathBuf {
        self.root.join("rootfs")
    }

    pub fn bootfs(&self) -> PathBuf {
        self.root.join("bootfs")
    }

    pub fn initramfs(&self) -> PathBuf {
        self.root.join("initramfs")
    }

    /// Destructively recreate the staging trees. Downloads are kept.
    pub fn create(&self) -> Result<()> {
        for tree in TREES {
            let path = self.root.join(tree);
            if path.exists() {
                self.remove_tree(&path)?;
            }
            fs::create_dir_all(&path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
        }
        fs::create_dir_all(self.downloads())
            .with_context(|| format!("Failed to create {}", self.downloads().display()))?;
        tracing::debug!("Workspace ready at {}", self.root.display());
        Ok(())
    }

    /// Remove the whole workspace, downloads included.
    pub fn reset(&self) -> Result<()> {
        if self.root.exists() {
            self.remove_tree(&self.root)?;
        }
        Ok(())
    }

    /// Remove staging trees only (used by `clean workspace`).
    pub fn clear_staging(&self) -> Result<bool> {
        let mut removed = false;
        for tree in TREES {
            let path = self.root.join(tree);
            if path.exists() {
                self.remove_tree(&path)?;
                removed = true;
            }
        }
        Ok(removed)
    }

    pub fn clear_downloads(&self) -> Result<bool> {
        let downloads = self.downloads();
        if !downloads.exists() {
            return Ok(false);
        }
        self.remove_tree(&downloads)?;
        Ok(true)
    }

    /// Mount points at or below `dir`.
    pub fn mounts_under(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let dir = dir
            .canonicalize()
            .with_context(|| format!("Failed to resolve {}", dir.display()))?;
        let table = fs::read_to_string(&self.mount_table)
            .with_context(|| format!("Failed to read {}", self.mount_table.display()))?;
        Ok(mount_points(&table)
            .into_iter()
            .filter(|m| m.starts_with(&dir))
            .collect())
    }

    fn remove_tree(&self, path: &Path) -> Result<()> {
        let live = self.mounts_under(path)?;
        if !live.is_empty() {
            let list: Vec<String> = live.iter().map(|p| p.display().to_string()).collect();
            return Err(BuildError::resource(format!(
                "refusing to remove {}: still mounted: {} (unmount them first)",
                path.display(),
                list.join(", ")
            ))
            .into());
        }
        fs::remove_dir_all(path).with_context(|| format!("Failed to remove {}", path.display()))
    }
}

/// Mount points listed in a mountinfo table (field 5).
fn mount_points(table: &str) -> Vec<PathBuf> {
    table
        .lines()
        .filter_map(|line| line.split(' ').nth(4))
        .map(|field| PathBuf::from(unescape_octal(field)))
        .collect()
}

/// Undo the kernel's `\ooo` escaping of space, tab, newline and backslash.
fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let octal = bytes
            .get(i + 1..i + 4)
            .filter(|d| bytes[i] == b'\\' && d.iter().all(|b| (b'0'..=b'7').contains(b)));
        if let Some(digits) = octal {
            let value = digits.iter().fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
            if let Ok(byte) = u8::try_from(value) {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::classify;

    #[test]
    fn test_create_keeps_downloads() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path().join("ws"));
        ws.create().unwrap();
        fs::write(ws.downloads().join("base.tar.gz"), b"x").unwrap();
        fs::write(ws.rootfs().join("stale"), b"x").unwrap();

        ws.create().unwrap();
        assert!(ws.downloads().join("base.tar.gz").exists());
        assert!(!ws.rootfs().join("stale").exists());
        assert!(ws.bootfs().is_dir());
        assert!(ws.initramfs().is_dir());
    }

    #[test]
    fn test_reset_removes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path().join("ws"));
        ws.create().unwrap();
        ws.reset().unwrap();
        assert!(!ws.root().exists());
        // Idempotent.
        ws.reset().unwrap();
    }

    fn mountinfo_with(dir: &Path, mounted: &Path) -> PathBuf {
        let table = dir.join("mountinfo");
        fs::write(
            &table,
            format!(
                "22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw\n\
                 97 22 0:5 / {} rw,nosuid master:2 - devtmpfs devtmpfs rw\n",
                mounted.display()
            ),
        )
        .unwrap();
        table
    }

    #[test]
    fn test_create_refuses_live_mount_under_rootfs() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path().join("ws"));
        ws.create().unwrap();
        // Stand-in for a host /dev left bind-mounted by an aborted run.
        let dev = ws.rootfs().join("dev");
        fs::create_dir_all(&dev).unwrap();
        fs::write(dev.join("host-file"), b"keep").unwrap();

        let table = mountinfo_with(dir.path(), &dev.canonicalize().unwrap());
        let ws = ws.with_mount_table(table);

        for result in [ws.create(), ws.reset(), ws.clear_staging().map(|_| ())] {
            let err = result.unwrap_err();
            assert_eq!(classify(&err).map(|e| e.kind()), Some("ResourceError"));
            assert!(format!("{:#}", err).contains("still mounted"));
        }
        assert_eq!(fs::read(dev.join("host-file")).unwrap(), b"keep");
    }

    #[test]
    fn test_unrelated_mounts_do_not_block_removal() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path().join("ws"));
        ws.create().unwrap();
        // A sibling whose name shares the prefix is not inside the tree.
        let sibling = dir.path().join("ws-other");
        fs::create_dir_all(&sibling).unwrap();
        let table = mountinfo_with(dir.path(), &sibling.canonicalize().unwrap());

        let ws = ws.with_mount_table(table);
        ws.create().unwrap();
        ws.reset().unwrap();
        assert!(!ws.root().exists());
    }

    #[test]
    fn test_mount_points_unescape() {
        let table = "36 35 98:0 /mnt1 /mnt/with\\040space rw - ext3 /dev/root rw\n\
                     37 35 98:0 / /plain rw - ext3 /dev/root rw\n";
        assert_eq!(
            mount_points(table),
            vec![PathBuf::from("/mnt/with space"), PathBuf::from("/plain")]
        );
        assert_eq!(unescape_octal("a\\134b"), "a\\b");
        assert_eq!(unescape_octal("tail\\04"), "tail\\04");
    }

    #[test]
    fn test_clear_staging_reports() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path());
        assert!(!ws.clear_staging().unwrap());
        ws.create().unwrap();
        assert!(ws.clear_staging().unwrap());
        assert!(ws.downloads().exists());
    }
}
