//! Post-install hardening of the staging tree.
//!
//! The image is immutable and single-purpose, so anything that could install,
//! fetch, edit or inspect software at run time is removed before packing. So
//! are the kernel and its modules: they already live in the boot tree and the
//! initramfs, which is why [`harden`] takes an [`InitramfsReceipt`].

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Component, Path};

use crate::features::{BuildConfig, Feature};
use crate::initramfs::InitramfsReceipt;

const PACKAGE_MANAGER: &[&str] = &[
    "sbin/apk",
    "etc/apk",
    "lib/apk",
    "usr/share/apk",
    "var/cache/apk",
];

const FETCH_TOOLS: &[&str] = &["usr/bin/wget", "usr/bin/curl", "usr/bin/nc"];

const EDITORS: &[&str] = &["bin/vi", "usr/bin/vi", "usr/bin/nano"];

const DEBUGGERS: &[&str] = &["usr/bin/gdb", "usr/bin/strace"];

const DOCS: &[&str] = &["usr/share/doc", "usr/share/man", "usr/share/info"];

const CACHES: &[&str] = &["var/cache", "root/.cache", "root/.npm"];

const BOOT_PAYLOAD: &[&str] = &["lib/modules", "boot"];

/// Build host state copied in so the installer could resolve mirrors.
const HOST_STATE: &[&str] = &["etc/resolv.conf"];

/// Where the DHCP client writes nameservers at boot (`/run` is tmpfs).
const RUNTIME_RESOLV: &str = "/run/resolv.conf";

/// Node tooling that only makes sense next to the runtime.
const NODE_TOOLING: &[&str] = &["usr/bin/npm", "usr/bin/npx", "usr/lib/node_modules"];

/// Paths (relative to the staging root) removed before packing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HardeningPlan {
    paths: Vec<&'static str>,
}

impl HardeningPlan {
    pub fn for_config(config: &BuildConfig) -> Self {
        let mut paths: Vec<&'static str> = [
            PACKAGE_MANAGER,
            FETCH_TOOLS,
            EDITORS,
            DEBUGGERS,
            DOCS,
            CACHES,
            BOOT_PAYLOAD,
            HOST_STATE,
        ]
        .concat();
        if !config.is_enabled(Feature::Runtime) {
            paths.extend_from_slice(NODE_TOOLING);
        }
        Self { paths }
    }

    pub fn paths(&self) -> &[&'static str] {
        &self.paths
    }

    pub fn contains(&self, path: &str) -> bool {
        self.paths.contains(&path)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct HardeningReport {
    pub removed: Vec<String>,
    pub absent: Vec<String>,
}

/// Apply `plan` to the staging tree at `root`.
///
/// A path missing from the tree is not an error; the package set decides
/// what exists.
pub fn harden(root: &Path, plan: &HardeningPlan, receipt: &InitramfsReceipt) -> Result<HardeningReport> {
    tracing::debug!(
        "Hardening after initramfs for kernel {} ({} modules copied)",
        receipt.kernel_version(),
        receipt.modules().len()
    );

    let mut report = HardeningReport::default();
    for rel in plan.paths() {
        if remove_path(root, rel)? {
            report.removed.push(rel.to_string());
        } else {
            report.absent.push(rel.to_string());
        }
    }

    link_runtime_resolv(root)?;

    tracing::info!(
        "Hardened staging tree: {} removed, {} not present",
        report.removed.len(),
        report.absent.len()
    );
    Ok(report)
}

/// Point `etc/resolv.conf` at the tmpfs copy the DHCP client maintains.
fn link_runtime_resolv(root: &Path) -> Result<()> {
    let etc = root.join("etc");
    if !etc.is_dir() {
        return Ok(());
    }
    let link = etc.join("resolv.conf");
    std::os::unix::fs::symlink(RUNTIME_RESOLV, &link)
        .with_context(|| format!("Failed to link {} to {}", link.display(), RUNTIME_RESOLV))
}

/// Remove `root/rel` without following a final symlink. Returns whether
/// anything was there.
fn remove_path(root: &Path, rel: &str) -> Result<bool> {
    let rel_path = Path::new(rel);
    if !rel_path.components().all(|c| matches!(c, Component::Normal(_))) {
        bail!("Refusing to remove '{}': not a plain relative path", rel);
    }

    let target = root.join(rel_path);
    let meta = match fs::symlink_metadata(&target) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e).with_context(|| format!("Failed to stat {}", target.display())),
    };

    if meta.is_dir() {
        fs::remove_dir_all(&target)
    } else {
        fs::remove_file(&target)
    }
    .with_context(|| format!("Failed to remove {}", target.display()))?;
    tracing::debug!("removed /{}", rel);
    Ok(true)
}
