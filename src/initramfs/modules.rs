//! Boot module selection.
//!
//! Only the modules needed to see the boot medium and mount the root image
//! are copied, together with everything they depend on according to the
//! kernel's own `modules.dep`.

use anyhow::{bail, Context, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::process::Cmd;

/// Storage/media transport and the root image filesystem.
pub const BOOT_MODULES: &[&str] = &[
    "cdrom",
    "sr_mod",
    "virtio_scsi",
    "virtio_blk",
    "ata_piix",
    "isofs",
    "squashfs",
    "loop",
];

/// Metadata copied next to the modules before `depmod` regenerates the index.
const MODULE_METADATA_FILES: &[&str] = &["modules.order", "modules.builtin", "modules.builtin.modinfo"];

const COMPRESSION_SUFFIXES: &[&str] = &[".gz", ".xz", ".zst"];

/// Module name from a path like `kernel/fs/isofs/isofs.ko.gz`.
/// Dashes and underscores are interchangeable in module names.
pub fn module_name(path: &str) -> Option<String> {
    let file = path.rsplit('/').next()?;
    let file = COMPRESSION_SUFFIXES
        .iter()
        .find_map(|s| file.strip_suffix(s))
        .unwrap_or(file);
    let stem = file.strip_suffix(".ko")?;
    Some(stem.replace('-', "_"))
}

/// Parsed `modules.dep` plus `modules.builtin`.
#[derive(Debug, Default)]
pub struct ModuleDb {
    by_name: BTreeMap<String, String>,
    deps: BTreeMap<String, Vec<String>>,
    builtin: BTreeSet<String>,
}

impl ModuleDb {
    pub fn parse(modules_dep: &str, modules_builtin: &str) -> Self {
        let mut db = ModuleDb::default();
        for line in modules_dep.lines() {
            let Some((path, deps)) = line.split_once(':') else {
                continue;
            };
            let path = path.trim().to_string();
            if let Some(name) = module_name(&path) {
                db.by_name.insert(name, path.clone());
            }
            db.deps
                .insert(path, deps.split_whitespace().map(str::to_string).collect());
        }
        db.builtin = modules_builtin.lines().filter_map(module_name).collect();
        db
    }

    pub fn load(kmod_dir: &Path) -> Result<Self> {
        let dep_path = kmod_dir.join("modules.dep");
        let deps = fs::read_to_string(&dep_path)
            .with_context(|| format!("Failed to read {}", dep_path.display()))?;
        let builtin = fs::read_to_string(kmod_dir.join("modules.builtin")).unwrap_or_default();
        Ok(Self::parse(&deps, &builtin))
    }

    pub fn is_builtin(&self, name: &str) -> bool {
        self.builtin.contains(&name.replace('-', "_"))
    }

    /// Relative paths of the requested modules and their transitive
    /// dependencies. Built-in modules are skipped; unknown ones are an error.
    pub fn closure(&self, wanted: &[&str]) -> Result<BTreeSet<String>> {
        let mut out = BTreeSet::new();
        let mut missing = Vec::new();
        let mut queue: Vec<String> = Vec::new();

        for name in wanted {
            let key = name.replace('-', "_");
            if self.builtin.contains(&key) {
                tracing::debug!("{} is built into the kernel", name);
                continue;
            }
            match self.by_name.get(&key) {
                Some(path) => queue.push(path.clone()),
                None => missing.push(*name),
            }
        }

        if !missing.is_empty() {
            bail!(
                "Boot modules missing from the kernel: {}. \
                 The initramfs could not see the boot medium without them.",
                missing.join(", ")
            );
        }

        while let Some(path) = queue.pop() {
            if !out.insert(path.clone()) {
                continue;
            }
            if let Some(deps) = self.deps.get(&path) {
                queue.extend(deps.iter().filter(|d| !out.contains(*d)).cloned());
            }
        }
        Ok(out)
    }
}

/// The single kernel version under `<root>/lib/modules`.
pub fn find_kernel_version(modules_base: &Path) -> Result<String> {
    let mut versions: Vec<String> = fs::read_dir(modules_base)
        .with_context(|| format!("No kernel modules at {}", modules_base.display()))?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().join("modules.dep").is_file())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    versions.sort();
    match versions.len() {
        0 => bail!(
            "No kernel version with modules.dep found in {}",
            modules_base.display()
        ),
        1 => Ok(versions.remove(0)),
        _ => bail!(
            "Several kernels staged in {} ({}); expected exactly one",
            modules_base.display(),
            versions.join(", ")
        ),
    }
}

/// Copy the boot module closure into the initramfs and rebuild its index.
/// Returns the copied module paths.
pub fn install_boot_modules(
    src_kmod: &Path,
    dst_root: &Path,
    kernel_version: &str,
) -> Result<Vec<PathBuf>> {
    let db = ModuleDb::load(src_kmod)?;
    let closure = db.closure(BOOT_MODULES)?;
    let dst_kmod = dst_root.join("lib/modules").join(kernel_version);
    fs::create_dir_all(&dst_kmod)?;

    let mut copied = Vec::with_capacity(closure.len());
    for rel in &closure {
        let src = src_kmod.join(rel);
        let dst = dst_kmod.join(rel);
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&src, &dst).with_context(|| format!("Failed to copy module {}", src.display()))?;
        copied.push(PathBuf::from(rel));
    }

    for name in MODULE_METADATA_FILES {
        let src = src_kmod.join(name);
        if src.exists() {
            fs::copy(&src, dst_kmod.join(name))?;
        }
    }

    Cmd::new("depmod")
        .arg("-b")
        .arg_path(dst_root)
        .arg(kernel_version)
        .error_msg("depmod failed for the initramfs module subset")
        .run()?;

    tracing::info!("Copied {} boot modules for kernel {}", copied.len(), kernel_version);
    Ok(copied)
}
