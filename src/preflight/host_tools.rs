//! Host tool availability checks.

use crate::artifact::LoaderFiles;
use crate::process;

use super::types::CheckResult;

/// (tool, package, purpose)
pub const REQUIRED_TOOLS: &[(&str, &str, &str)] = &[
    ("mksquashfs", "squashfs-tools", "Required to pack the root image"),
    ("xorriso", "xorriso", "Required to create the ISO image"),
    ("cpio", "cpio", "Required to archive the initramfs"),
    ("gzip", "gzip", "Required to compress the initramfs"),
    ("depmod", "kmod", "Required to index the initramfs modules"),
    ("chroot", "coreutils", "Required to run apk inside the staging tree"),
    ("mount", "util-linux", "Required for the build sandbox"),
    ("umount", "util-linux", "Required for the build sandbox"),
];

pub const OPTIONAL_TOOLS: &[(&str, &str, &str)] = &[(
    "qemu-system-x86_64",
    "qemu-system-x86",
    "Required for `monoboot run` and `monoboot test`",
)];

pub fn check_host_tools() -> Vec<CheckResult> {
    let mut results: Vec<CheckResult> = REQUIRED_TOOLS
        .iter()
        .map(|(tool, package, purpose)| check_tool_exists(tool, package, purpose, true))
        .collect();
    results.extend(
        OPTIONAL_TOOLS
            .iter()
            .map(|(tool, package, purpose)| check_tool_exists(tool, package, purpose, false)),
    );
    results.push(check_loader_files());
    results
}

fn check_tool_exists(tool: &str, package: &str, purpose: &str, required: bool) -> CheckResult {
    match process::which(tool) {
        Some(path) => CheckResult::pass_with(tool, &path.display().to_string()),
        None => {
            let msg = format!("Not found. Install '{}' package. {}", package, purpose);
            if required {
                CheckResult::fail(tool, &msg)
            } else {
                CheckResult::warn(tool, &msg)
            }
        }
    }
}

fn check_loader_files() -> CheckResult {
    match LoaderFiles::locate() {
        Ok(files) if files.isohdpfx.is_some() => {
            CheckResult::pass_with("isolinux", &files.isolinux_bin.display().to_string())
        }
        Ok(_) => CheckResult::warn(
            "isolinux",
            "isohdpfx.bin not found; the image will only boot as optical media",
        ),
        Err(e) => CheckResult::fail("isolinux", &e.to_string()),
    }
}
