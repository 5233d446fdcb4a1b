//! Root image packing with mksquashfs.

use anyhow::Result;
use std::fs;
use std::path::Path;

use super::PartialFile;
use crate::boot::is_root_image;
use crate::error::BuildError;
use crate::process::{self, Cmd};

/// Pack the hardened staging tree into a read-only squashfs at `out`.
/// Returns the image size in bytes.
///
/// xz keeps the image small; linux-virt is built with squashfs xz support.
pub fn pack(staging: &Path, out: &Path) -> Result<u64> {
    process::require_tools(&["mksquashfs"])?;
    if !staging.is_dir() {
        return Err(BuildError::packaging(
            "pack rootfs",
            format!("staging tree {} does not exist", staging.display()),
        )
        .into());
    }

    let partial = PartialFile::for_output(out)?;
    tracing::info!("Packing {} with xz compression...", staging.display());

    // mksquashfs shows progress, so stream its output
    Cmd::new("mksquashfs")
        .arg_path(staging)
        .arg_path(partial.path())
        .args(["-comp", "xz"])
        .args(["-b", "1M"])
        .arg("-noappend")
        .arg("-no-xattrs")
        .arg("-progress")
        .error_msg("mksquashfs failed")
        .run_interactive()
        .map_err(|e| BuildError::packaging("pack rootfs", e))?;

    verify(partial.path())?;
    let size = fs::metadata(partial.path())?.len();
    partial.commit(out)?;

    tracing::info!("Root image {} ({} MB)", out.display(), size / 1024 / 1024);
    Ok(size)
}

/// The packed file must carry the signature Stage 1 looks for.
pub fn verify(image: &Path) -> Result<()> {
    let signed = is_root_image(image)
        .map_err(|e| BuildError::packaging("verify rootfs", e))?;
    if !signed {
        return Err(BuildError::packaging(
            "verify rootfs",
            format!("{} does not carry the squashfs signature", image.display()),
        )
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::classify;

    #[test]
    fn test_verify_rejects_unsigned_image() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("rootfs.squashfs");
        fs::write(&image, b"\0\0\0\0garbage").unwrap();
        let err = verify(&image).unwrap_err();
        assert_eq!(classify(&err).map(|e| e.kind()), Some("PackagingError"));

        fs::write(&image, b"hsqs\0\0\0\0").unwrap();
        assert!(verify(&image).is_ok());
    }

    #[test]
    fn test_missing_staging_is_packaging_error() {
        if !process::exists("mksquashfs") {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let err = pack(&dir.path().join("nope"), &dir.path().join("out.squashfs")).unwrap_err();
        assert_eq!(classify(&err).map(|e| e.kind()), Some("PackagingError"));
    }
}
