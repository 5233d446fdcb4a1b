//! Bootable ISO assembly (BIOS, isolinux).
//!
//! ```text
//! isolinux/isolinux.bin, ldlinux.c32, isolinux.cfg
//! boot/vmlinuz
//! boot/initramfs.gz
//! live/rootfs.squashfs
//! ```
//!
//! The loader files come from the host's syslinux package.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use super::{commit_with_sidecars, manifest_path, squashfs, ImageManifest, PartialFile};
use crate::acquire::sha256_file;
use crate::error::BuildError;
use crate::features::BuildConfig;
use crate::layout::{
    IMAGE_CHECKSUM_SUFFIX, ISO_INITRAMFS_PATH, ISO_KERNEL_PATH, ISO_LABEL, ISO_LOADER_DIR,
    ISO_ROOTFS_PATH,
};
use crate::process::{self, Cmd};
use crate::workspace::Workspace;

/// Where distributions install syslinux/isolinux.
pub const SYSLINUX_DIRS: &[&str] = &[
    "/usr/share/syslinux",
    "/usr/lib/ISOLINUX",
    "/usr/lib/syslinux/modules/bios",
    "/usr/lib/syslinux/mbr",
    "/usr/lib/syslinux/bios",
    "/usr/lib/syslinux",
];

/// ISO9660 primary volume descriptor: "CD001" at byte 32769.
const ISO9660_MAGIC_OFFSET: u64 = 0x8001;
const ISO9660_MAGIC: &[u8; 5] = b"CD001";

/// Host loader files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoaderFiles {
    pub isolinux_bin: PathBuf,
    pub ldlinux_c32: PathBuf,
    /// Hybrid MBR; without it the ISO still boots from optical media.
    pub isohdpfx: Option<PathBuf>,
}

impl LoaderFiles {
    pub fn locate() -> Result<Self> {
        let dirs: Vec<PathBuf> = SYSLINUX_DIRS.iter().map(PathBuf::from).collect();
        Self::locate_in(&dirs)
    }

    pub fn locate_in(dirs: &[PathBuf]) -> Result<Self> {
        let find = |name: &str| dirs.iter().map(|d| d.join(name)).find(|p| p.is_file());

        let (Some(isolinux_bin), Some(ldlinux_c32)) = (find("isolinux.bin"), find("ldlinux.c32"))
        else {
            return Err(BuildError::resource(
                "isolinux loader files (isolinux.bin, ldlinux.c32) not found. \
                 Install syslinux/isolinux on the build host.",
            )
            .into());
        };

        Ok(Self {
            isolinux_bin,
            ldlinux_c32,
            isohdpfx: find("isohdpfx.bin"),
        })
    }
}

/// The finished image.
#[derive(Debug, Clone, Serialize)]
pub struct ImageArtifact {
    pub path: PathBuf,
    pub checksum_path: PathBuf,
    pub manifest_path: PathBuf,
    pub sha256: String,
    pub size: u64,
}

pub fn render_isolinux_cfg() -> String {
    format!(
        "DEFAULT monoboot\n\
         PROMPT 0\n\
         TIMEOUT 10\n\
         \n\
         LABEL monoboot\n\
         \x20   LINUX /{ISO_KERNEL_PATH}\n\
         \x20   INITRD /{ISO_INITRAMFS_PATH}\n\
         \x20   APPEND rdinit=/init console=tty0 console=ttyS0,115200n8 quiet\n"
    )
}

/// Payload files that must already be in the boot tree.
fn validate_inputs(bootfs: &Path) -> Result<u64> {
    let mut total = 0;
    for rel in [ISO_KERNEL_PATH, ISO_INITRAMFS_PATH, ISO_ROOTFS_PATH] {
        let path = bootfs.join(rel);
        let meta = fs::metadata(&path).map_err(|_| {
            BuildError::packaging("assemble image", format!("{} is missing", path.display()))
        })?;
        total += meta.len();
    }
    squashfs::verify(&bootfs.join(ISO_ROOTFS_PATH))?;
    Ok(total)
}

fn install_loader(bootfs: &Path, loader: &LoaderFiles) -> Result<()> {
    let dir = bootfs.join(ISO_LOADER_DIR);
    fs::create_dir_all(&dir)?;
    fs::copy(&loader.isolinux_bin, dir.join("isolinux.bin"))
        .with_context(|| format!("Failed to copy {}", loader.isolinux_bin.display()))?;
    fs::copy(&loader.ldlinux_c32, dir.join("ldlinux.c32"))
        .with_context(|| format!("Failed to copy {}", loader.ldlinux_c32.display()))?;
    fs::write(dir.join("isolinux.cfg"), render_isolinux_cfg())?;
    Ok(())
}

/// xorriso arguments producing `output` from `bootfs`.
pub fn xorriso_command(bootfs: &Path, output: &Path, loader: &LoaderFiles) -> Cmd {
    let mut cmd = Cmd::new("xorriso")
        .args(["-as", "mkisofs"])
        .args(["-V", ISO_LABEL])
        .arg("-o")
        .arg_path(output);
    if let Some(mbr) = &loader.isohdpfx {
        cmd = cmd.arg("-isohybrid-mbr").arg_path(mbr);
    }
    cmd.arg("-c")
        .arg(format!("{}/boot.cat", ISO_LOADER_DIR))
        .arg("-b")
        .arg(format!("{}/isolinux.bin", ISO_LOADER_DIR))
        .arg("-no-emul-boot")
        .args(["-boot-load-size", "4"])
        .arg("-boot-info-table")
        .arg("-R")
        .arg_path(bootfs)
        .error_msg("xorriso failed")
}

/// Check the produced image is an ISO9660 filesystem at least as large as
/// its payload.
pub fn verify_image(path: &Path, payload_bytes: u64) -> Result<u64> {
    let size = fs::metadata(path)
        .with_context(|| format!("{} was not produced", path.display()))?
        .len();
    if size < payload_bytes {
        bail!(
            "{} is {} bytes, smaller than its {} byte payload",
            path.display(),
            size,
            payload_bytes
        );
    }

    let mut file = File::open(path)?;
    let mut magic = [0u8; 5];
    file.seek(SeekFrom::Start(ISO9660_MAGIC_OFFSET))?;
    file.read_exact(&mut magic)
        .with_context(|| format!("{} is truncated", path.display()))?;
    if &magic != ISO9660_MAGIC {
        bail!("{} has no ISO9660 volume descriptor", path.display());
    }
    Ok(size)
}

/// `<image>.sha256`
pub fn checksum_path(image: &Path) -> PathBuf {
    let mut name = image.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(IMAGE_CHECKSUM_SUFFIX);
    image.with_file_name(name)
}

/// sha256sum-compatible line.
pub fn checksum_line(sha256: &str, image: &Path) -> String {
    let name = image
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{}  {}\n", sha256, name)
}

/// Hash `contents` and stage the checksum file for `image`. It is committed
/// together with the image.
fn stage_checksum(contents: &Path, image: &Path) -> Result<(PartialFile, String)> {
    let sha256 = sha256_file(contents)?;
    let partial = PartialFile::for_output(&checksum_path(image))?;
    fs::write(partial.path(), checksum_line(&sha256, image))?;
    Ok((partial, sha256))
}

/// Assemble the boot tree into a hybrid ISO at `out`, with its checksum and
/// build manifest beside it.
pub fn assemble(ws: &Workspace, out: &Path, build: &BuildConfig) -> Result<ImageArtifact> {
    process::require_tools(&["xorriso"])?;
    let loader = LoaderFiles::locate()?;
    if loader.isohdpfx.is_none() {
        tracing::warn!("isohdpfx.bin not found; the image will not boot from USB media");
    }

    let bootfs = ws.bootfs();
    let payload = validate_inputs(&bootfs)?;
    install_loader(&bootfs, &loader).map_err(|e| BuildError::packaging("install loader", e))?;

    let partial = PartialFile::for_output(out)?;
    tracing::info!("Creating ISO with xorriso (label {})...", ISO_LABEL);
    xorriso_command(&bootfs, partial.path(), &loader)
        .run()
        .map_err(|e| BuildError::packaging("assemble image", e))?;

    let size = verify_image(partial.path(), payload)
        .map_err(|e| BuildError::packaging("verify image", e))?;
    let (checksum, sha256) = stage_checksum(partial.path(), out)
        .map_err(|e| BuildError::packaging("write image checksum", e))?;
    let manifest = ImageManifest::new(build, &sha256)
        .stage(out)
        .map_err(|e| BuildError::packaging("write image manifest", e))?;

    let sum_path = checksum_path(out);
    let info_path = manifest_path(out);
    commit_with_sidecars(
        partial,
        out,
        vec![(checksum, sum_path.clone()), (manifest, info_path.clone())],
    )
    .map_err(|e| BuildError::packaging("publish image", e))?;

    tracing::info!("Image {} ({} MB)", out.display(), size / 1024 / 1024);
    Ok(ImageArtifact {
        path: out.to_path_buf(),
        checksum_path: sum_path,
        manifest_path: info_path,
        sha256,
        size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::classify;

    fn loader(dir: &Path, mbr: bool) -> LoaderFiles {
        fs::write(dir.join("isolinux.bin"), "bin").unwrap();
        fs::write(dir.join("ldlinux.c32"), "c32").unwrap();
        if mbr {
            fs::write(dir.join("isohdpfx.bin"), "mbr").unwrap();
        }
        LoaderFiles::locate_in(&[dir.to_path_buf()]).unwrap()
    }

    #[test]
    fn test_locate_loader_across_dirs() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        fs::write(a.path().join("isolinux.bin"), "bin").unwrap();
        fs::write(b.path().join("ldlinux.c32"), "c32").unwrap();

        let found = LoaderFiles::locate_in(&[a.path().to_path_buf(), b.path().to_path_buf()]).unwrap();
        assert_eq!(found.isolinux_bin, a.path().join("isolinux.bin"));
        assert_eq!(found.ldlinux_c32, b.path().join("ldlinux.c32"));
        assert!(found.isohdpfx.is_none());
    }

    #[test]
    fn test_missing_loader_is_resource_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = LoaderFiles::locate_in(&[dir.path().to_path_buf()]).unwrap_err();
        assert_eq!(classify(&err).map(|e| e.kind()), Some("ResourceError"));
    }

    #[test]
    fn test_isolinux_cfg_points_at_payload() {
        let cfg = render_isolinux_cfg();
        assert!(cfg.contains("LINUX /boot/vmlinuz\n"));
        assert!(cfg.contains("INITRD /boot/initramfs.gz\n"));
        assert!(cfg.contains("rdinit=/init"));
    }

    #[test]
    fn test_xorriso_command_label_and_hybrid_mbr() {
        let dir = tempfile::tempdir().unwrap();
        let with_mbr = xorriso_command(Path::new("/ws/bootfs"), Path::new("/o.iso"), &loader(dir.path(), true)).display();
        assert!(with_mbr.starts_with("xorriso -as mkisofs -V MONOBOOT -o /o.iso"));
        assert!(with_mbr.contains("-isohybrid-mbr"));
        assert!(with_mbr.ends_with("/ws/bootfs"));

        let other = tempfile::tempdir().unwrap();
        let without = xorriso_command(Path::new("/ws/bootfs"), Path::new("/o.iso"), &loader(other.path(), false)).display();
        assert!(!without.contains("-isohybrid-mbr"));
        assert!(without.contains("-b isolinux/isolinux.bin"));
    }

    #[test]
    fn test_missing_rootfs_is_packaging_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("boot")).unwrap();
        fs::write(dir.path().join(ISO_KERNEL_PATH), "k").unwrap();
        fs::write(dir.path().join(ISO_INITRAMFS_PATH), "i").unwrap();
        let err = validate_inputs(dir.path()).unwrap_err();
        assert_eq!(classify(&err).map(|e| e.kind()), Some("PackagingError"));
        assert!(format!("{:#}", err).contains("rootfs.squashfs"));
    }

    #[test]
    fn test_verify_image() {
        let dir = tempfile::tempdir().unwrap();
        let iso = dir.path().join("monoboot.iso");
        let mut bytes = vec![0u8; 0x9000];
        bytes[0x8001..0x8006].copy_from_slice(b"CD001");
        fs::write(&iso, &bytes).unwrap();

        assert_eq!(verify_image(&iso, 100).unwrap(), 0x9000);
        assert!(verify_image(&iso, 0x10000).is_err());

        fs::write(&iso, vec![0u8; 0x9000]).unwrap();
        assert!(verify_image(&iso, 0).is_err());
    }

    #[test]
    fn test_checksum_file_format() {
        let dir = tempfile::tempdir().unwrap();
        let iso = dir.path().join("monoboot.iso");
        fs::write(&iso, b"abc").unwrap();
        let (partial, sha) = stage_checksum(&iso, &iso).unwrap();
        let path = checksum_path(&iso);
        partial.commit(&path).unwrap();
        assert_eq!(path, dir.path().join("monoboot.iso.sha256"));
        assert_eq!(
            sha,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            format!("{}  monoboot.iso\n", sha)
        );
    }
}
