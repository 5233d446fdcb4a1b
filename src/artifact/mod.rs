//! Packaging: the root image and the bootable ISO.
//!
//! Both artifacts are written next to their final path under a `.partial`
//! name and renamed into place only once they pass verification. A previous
//! artifact at the final path is untouched by a failed run.

pub mod iso;
pub mod manifest;
pub mod squashfs;

use anyhow::{Context, Result};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

pub use iso::{assemble, ImageArtifact, LoaderFiles};
pub use manifest::{manifest_path, ImageManifest};
pub use squashfs::pack;

/// `<path>.partial`
pub fn partial_path(path: &Path) -> PathBuf {
    let mut name: OsString = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(".partial");
    path.with_file_name(name)
}

/// A file being produced for `final_path`. Removed on drop unless committed.
#[derive(Debug)]
pub struct PartialFile {
    path: PathBuf,
    armed: bool,
}

impl PartialFile {
    /// Claim the partial path, clearing leftovers from an earlier run.
    pub fn for_output(final_path: &Path) -> Result<Self> {
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let path = partial_path(final_path);
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove stale {}", path.display()))?;
        }
        Ok(Self { path, armed: true })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically move the finished file to `final_path`.
    pub fn commit(mut self, final_path: &Path) -> Result<()> {
        fs::rename(&self.path, final_path).with_context(|| {
            format!(
                "Failed to move {} to {}",
                self.path.display(),
                final_path.display()
            )
        })?;
        self.armed = false;
        Ok(())
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => tracing::warn!("Removed incomplete {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove {}: {}", self.path.display(), e),
        }
    }
}

/// Move `image` into place, then each of its sidecar files.
///
/// If a sidecar cannot be moved, the new image and every sidecar already in
/// place are removed again: an image is never left next to a missing or
/// stale checksum.
pub fn commit_with_sidecars(
    image: PartialFile,
    out: &Path,
    sidecars: Vec<(PartialFile, PathBuf)>,
) -> Result<()> {
    image.commit(out)?;
    let mut landed = vec![out.to_path_buf()];
    for (partial, path) in sidecars {
        if let Err(e) = partial.commit(&path) {
            for done in &landed {
                match fs::remove_file(done) {
                    Ok(()) => tracing::warn!("Removed {}", done.display()),
                    Err(rm) => tracing::warn!("Failed to remove {}: {}", done.display(), rm),
                }
            }
            return Err(e);
        }
        landed.push(path);
    }
    Ok(())
}
