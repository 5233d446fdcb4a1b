//! Build sandbox mounts.
//!
//! Package scripts expect `/proc`, `/sys` and `/dev` inside the chroot. Those
//! mounts are host-global state, so they live in a [`Sandbox`] guard: armed
//! on entry, disarmed only after every mount came down in reverse order.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::process::Cmd;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    /// Fresh pseudo filesystem of the given type.
    Fs(&'static str),
    /// Bind mount of a host path.
    Bind,
}

/// One sandbox mount, target relative to the staging root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountSpec {
    pub source: &'static str,
    pub target: &'static str,
    pub kind: MountKind,
}

impl MountSpec {
    pub fn target_in(&self, root: &Path) -> PathBuf {
        root.join(self.target)
    }
}

/// Mounts established around package installation, in mount order.
pub const SANDBOX_MOUNTS: &[MountSpec] = &[
    MountSpec {
        source: "proc",
        target: "proc",
        kind: MountKind::Fs("proc"),
    },
    MountSpec {
        source: "/sys",
        target: "sys",
        kind: MountKind::Bind,
    },
    MountSpec {
        source: "/dev",
        target: "dev",
        kind: MountKind::Bind,
    },
];

pub trait MountOps {
    fn mount(&self, spec: &MountSpec, target: &Path) -> Result<()>;
    /// `lazy` detaches a busy mount point (`umount -l`).
    fn unmount(&self, target: &Path, lazy: bool) -> Result<()>;
}

/// Host `mount`/`umount`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMounts;

impl MountOps for SystemMounts {
    fn mount(&self, spec: &MountSpec, target: &Path) -> Result<()> {
        let cmd = match spec.kind {
            MountKind::Fs(fstype) => Cmd::new("mount").args(["-t", fstype, spec.source]),
            MountKind::Bind => Cmd::new("mount").args(["--bind", spec.source]),
        };
        cmd.arg_path(target)
            .error_msg(format!("mount {} failed", target.display()))
            .run()?;
        Ok(())
    }

    fn unmount(&self, target: &Path, lazy: bool) -> Result<()> {
        let mut cmd = Cmd::new("umount");
        if lazy {
            cmd = cmd.arg("-l");
        }
        cmd.arg_path(target)
            .error_msg(format!("umount {} failed", target.display()))
            .run()?;
        Ok(())
    }
}

/// Scoped ownership of the sandbox mounts.
pub struct Sandbox<'a> {
    ops: &'a dyn MountOps,
    /// Established mount points, in mount order.
    active: Vec<PathBuf>,
    armed: bool,
}

impl<'a> Sandbox<'a> {
    /// Mount every spec under `root`. If one fails, the ones already up are
    /// taken down before the error is returned.
    pub fn enter(root: &Path, specs: &[MountSpec], ops: &'a dyn MountOps) -> Result<Self> {
        let mut sandbox = Self {
            ops,
            active: Vec::with_capacity(specs.len()),
            armed: true,
        };

        for spec in specs {
            let target = spec.target_in(root);
            fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create mount point {}", target.display()))?;
            ops.mount(spec, &target)
                .with_context(|| format!("Failed to mount {} on {}", spec.source, target.display()))?;
            tracing::debug!("Mounted {} on {}", spec.source, target.display());
            sandbox.active.push(target);
        }

        Ok(sandbox)
    }

    pub fn active(&self) -> &[PathBuf] {
        &self.active
    }

    /// Unmount in reverse order. Disarms only if every unmount succeeded;
    /// otherwise the guard's drop retries with lazy unmounts.
    pub fn release(mut self) -> Result<()> {
        let failed = self.unmount_all(false);
        if failed.is_empty() {
            self.armed = false;
            return Ok(());
        }
        bail!("could not unmount: {}", failed.join(", "))
    }

    fn unmount_all(&mut self, lazy_fallback: bool) -> Vec<String> {
        let mut still_mounted = Vec::new();
        let mut failed = Vec::new();

        while let Some(target) = self.active.pop() {
            let mut result = self.ops.unmount(&target, false);
            if result.is_err() && lazy_fallback {
                result = self.ops.unmount(&target, true);
            }
            match result {
                Ok(()) => tracing::debug!("Unmounted {}", target.display()),
                Err(e) => {
                    tracing::warn!("Failed to unmount {}: {:#}", target.display(), e);
                    failed.push(target.display().to_string());
                    still_mounted.push(target);
                }
            }
        }

        still_mounted.reverse();
        self.active = still_mounted;
        failed
    }
}

impl Drop for Sandbox<'_> {
    fn drop(&mut self) {
        if !self.armed || self.active.is_empty() {
            return;
        }
        tracing::warn!("Build sandbox torn down on an error path, unmounting");
        let failed = self.unmount_all(true);
        if !failed.is_empty() {
            tracing::error!("Mounts left behind on the host: {}", failed.join(", "));
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::cell::RefCell;

    /// In-memory mount table.
    #[derive(Default)]
    pub struct RecordingMounts {
        pub table: RefCell<Vec<PathBuf>>,
        pub log: RefCell<Vec<String>>,
        /// Mount of this target fails.
        pub fail_mount: Option<&'static str>,
        /// Non-lazy unmount of this target fails.
        pub stuck: Option<&'static str>,
    }

    impl MountOps for RecordingMounts {
        fn mount(&self, spec: &MountSpec, target: &Path) -> Result<()> {
            if self.fail_mount == Some(spec.target) {
                bail!("mount {} refused", spec.target);
            }
            self.table.borrow_mut().push(target.to_path_buf());
            self.log.borrow_mut().push(format!("mount {}", spec.target));
            Ok(())
        }

        fn unmount(&self, target: &Path, lazy: bool) -> Result<()> {
            let name = target.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if !lazy && self.stuck == Some(name) {
                bail!("target is busy");
            }
            self.table.borrow_mut().retain(|t| t != target);
            self.log
                .borrow_mut()
                .push(format!("umount{} {}", if lazy { " -l" } else { "" }, name));
            Ok(())
        }
    }
}
