//! First-stage boot root.
//!
//! The initramfs holds one static busybox, the applet links Stage 1 needs,
//! the boot module subset and the generated `/init`:
//!
//! ```text
//! /init                      generated discovery script
//! /bin/busybox               static multi-tool
//! /bin/{sh,mount,...}        applet links
//! /lib/modules/<kver>/       boot module closure + regenerated index
//! /dev/console               (when built as root)
//! ```
//!
//! Everything here is copied out of the staging tree, which is why hardening
//! may only run after [`assemble`] returned its [`InitramfsReceipt`].

pub mod modules;

use anyhow::{Context, Result};
use std::fs;
use std::io::Read;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};

use crate::boot::discovery::{render_stage1, ScanPolicy};
use crate::error::BuildError;
use crate::layout::{ISO_INITRAMFS_PATH, ISO_KERNEL_PATH, STAGED_BUSYBOX, STAGED_KERNEL, STAGED_MODULES};
use crate::process::shell_in;
use crate::workspace::Workspace;

pub use modules::BOOT_MODULES;

/// Applets linked to busybox: exactly what the discovery script calls.
pub const BUSYBOX_APPLETS: &[&str] = &[
    "sh",
    "mount",
    "umount",
    "mkdir",
    "sleep",
    "modprobe",
    "losetup",
    "switch_root",
];

const SKELETON: &[&str] = &["bin", "dev", "proc", "sys", "media/boot", "newroot", "lib/modules"];

/// Proof that the initramfs was assembled. Only this module can make one.
#[derive(Debug)]
pub struct InitramfsReceipt {
    kernel_version: String,
    archive: PathBuf,
    modules: Vec<PathBuf>,
}

impl InitramfsReceipt {
    pub fn kernel_version(&self) -> &str {
        &self.kernel_version
    }

    pub fn archive(&self) -> &Path {
        &self.archive
    }

    pub fn modules(&self) -> &[PathBuf] {
        &self.modules
    }
}

#[cfg(test)]
impl InitramfsReceipt {
    pub(crate) fn for_tests(kernel_version: &str) -> Self {
        Self {
            kernel_version: kernel_version.to_string(),
            archive: PathBuf::from(ISO_INITRAMFS_PATH),
            modules: Vec::new(),
        }
    }
}

/// Build the initramfs and copy the kernel into the boot tree.
pub fn assemble(ws: &Workspace, policy: &ScanPolicy) -> Result<InitramfsReceipt> {
    let staged = ws.rootfs();
    let root = ws.initramfs();
    let boot = ws.bootfs();

    create_skeleton(&root)?;
    install_busybox(&staged.join(STAGED_BUSYBOX), &root)?;
    create_console(&root);

    let modules_base = staged.join(STAGED_MODULES);
    let kernel_version = modules::find_kernel_version(&modules_base)
        .map_err(|e| BuildError::packaging("find kernel", format!("{:#}", e)))?;
    tracing::info!("Kernel version {}", kernel_version);
    let copied =
        modules::install_boot_modules(&modules_base.join(&kernel_version), &root, &kernel_version)?;

    write_init(&root, policy)?;
    copy_kernel(&staged.join(STAGED_KERNEL), &boot.join(ISO_KERNEL_PATH))?;

    let archive = boot.join(ISO_INITRAMFS_PATH);
    build_cpio(&root, &archive).map_err(|e| BuildError::packaging("archive initramfs", e))?;

    let size = fs::metadata(&archive)?.len();
    tracing::info!("Initramfs {} ({} KB)", archive.display(), size / 1024);

    Ok(InitramfsReceipt {
        kernel_version,
        archive,
        modules: copied,
    })
}

pub fn create_skeleton(root: &Path) -> Result<()> {
    for dir in SKELETON {
        fs::create_dir_all(root.join(dir))
            .with_context(|| format!("Failed to create initramfs/{}", dir))?;
    }
    Ok(())
}

/// Copy the static busybox and link exactly the Stage 1 applets.
pub fn install_busybox(src: &Path, root: &Path) -> Result<()> {
    if !src.is_file() {
        return Err(BuildError::packaging(
            "initramfs busybox",
            format!("{} not found (is busybox-static installed?)", src.display()),
        )
        .into());
    }
    let dst = root.join("bin/busybox");
    fs::copy(src, &dst).with_context(|| format!("Failed to copy {}", src.display()))?;
    fs::set_permissions(&dst, fs::Permissions::from_mode(0o755))?;

    for applet in BUSYBOX_APPLETS {
        let link = root.join("bin").join(applet);
        if link.symlink_metadata().is_ok() {
            fs::remove_file(&link)?;
        }
        symlink("busybox", &link)?;
    }
    Ok(())
}

/// The kernel opens /dev/console for init before devtmpfs exists.
fn create_console(root: &Path) {
    use nix::sys::stat::{makedev, mknod, Mode, SFlag};

    let console = root.join("dev/console");
    if console.exists() {
        return;
    }
    if let Err(e) = mknod(
        &console,
        SFlag::S_IFCHR,
        Mode::from_bits_truncate(0o600),
        makedev(5, 1),
    ) {
        tracing::warn!("Could not create /dev/console in initramfs ({}); early boot output may be lost", e);
    }
}

pub fn write_init(root: &Path, policy: &ScanPolicy) -> Result<()> {
    let init = root.join("init");
    fs::write(&init, render_stage1(policy, BOOT_MODULES))
        .with_context(|| format!("Failed to write {}", init.display()))?;
    fs::set_permissions(&init, fs::Permissions::from_mode(0o755))?;
    Ok(())
}

fn copy_kernel(src: &Path, dst: &Path) -> Result<()> {
    if !src.is_file() {
        return Err(BuildError::packaging(
            "copy kernel",
            format!("{} not found (is linux-virt installed?)", src.display()),
        )
        .into());
    }
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(src, dst).with_context(|| format!("Failed to copy kernel to {}", dst.display()))?;
    Ok(())
}

/// `find | cpio -H newc | gzip -9`, then check the result is a gzip stream.
pub fn build_cpio(root: &Path, output: &Path) -> Result<()> {
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }
    let quoted = output.display().to_string().replace('\'', r"'\''");
    shell_in(
        &format!("find . -print0 | cpio --null -o -H newc --quiet | gzip -9 > '{}'", quoted),
        root,
    )
    .context("cpio/gzip failed")?;

    let mut magic = [0u8; 2];
    fs::File::open(output)
        .and_then(|mut f| f.read_exact(&mut magic))
        .with_context(|| format!("{} is empty", output.display()))?;
    if magic != [0x1f, 0x8b] {
        anyhow::bail!("{} is not a gzip archive", output.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busybox_links_exactly_stage1_applets() {
        let staged = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let bb = staged.path().join("busybox.static");
        fs::write(&bb, b"\x7fELF").unwrap();

        create_skeleton(root.path()).unwrap();
        install_busybox(&bb, root.path()).unwrap();

        let mut links: Vec<String> = fs::read_dir(root.path().join("bin"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n != "busybox")
            .collect();
        links.sort();
        let mut expected: Vec<String> = BUSYBOX_APPLETS.iter().map(|s| s.to_string()).collect();
        expected.sort();
        assert_eq!(links, expected);
        assert_eq!(
            fs::read_link(root.path().join("bin/switch_root")).unwrap(),
            Path::new("busybox")
        );
    }

    #[test]
    fn test_missing_busybox_is_packaging_error() {
        let root = tempfile::tempdir().unwrap();
        let err = install_busybox(Path::new("/nonexistent/busybox.static"), root.path()).unwrap_err();
        assert_eq!(crate::error::classify(&err).map(|e| e.kind()), Some("PackagingError"));
    }

    #[test]
    fn test_init_is_executable() {
        let root = tempfile::tempdir().unwrap();
        write_init(root.path(), &ScanPolicy::default()).unwrap();
        let init = root.path().join("init");
        assert_eq!(fs::metadata(&init).unwrap().permissions().mode() & 0o777, 0o755);
        assert!(fs::read_to_string(&init).unwrap().contains("switch_root"));
    }
}
