//! Removal of build state.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use crate::artifact::{iso::checksum_path, manifest_path, partial_path};
use crate::workspace::Workspace;

/// Staging trees only; the downloaded base archive is kept.
pub fn clean_workspace(ws: &Workspace) -> Result<()> {
    if ws.clear_staging()? {
        tracing::info!("Removed staging trees under {}", ws.root().display());
    } else {
        tracing::info!("Nothing to clean in {}", ws.root().display());
    }
    Ok(())
}

pub fn clean_downloads(ws: &Workspace) -> Result<()> {
    if ws.clear_downloads()? {
        tracing::info!("Removed {}", ws.downloads().display());
    }
    Ok(())
}

/// The image, its sidecar files and any leftover partial files.
pub fn clean_output(image: &Path) -> Result<usize> {
    let mut removed = 0;
    for path in [
        image.to_path_buf(),
        checksum_path(image),
        manifest_path(image),
        partial_path(image),
        partial_path(&checksum_path(image)),
        partial_path(&manifest_path(image)),
    ] {
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove {}", path.display()))?;
            tracing::info!("Removed {}", path.display());
            removed += 1;
        }
    }
    Ok(removed)
}

/// Everything: workspace including downloads, plus the output image.
pub fn clean_all(ws: &Workspace, image: &Path) -> Result<()> {
    ws.reset()?;
    clean_output(image)?;
    Ok(())
}
