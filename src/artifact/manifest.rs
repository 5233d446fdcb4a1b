//! What an image was built with, recorded next to it.
//!
//! `monoboot run` and `monoboot test` size the VM from this record rather
//! than from whatever the feature file says today.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use super::PartialFile;
use crate::features::BuildConfig;
use crate::layout::IMAGE_MANIFEST_SUFFIX;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageManifest {
    pub components: Vec<String>,
    pub memory_mb: u32,
    pub sha256: String,
}

/// `<image>.manifest.json`
pub fn manifest_path(image: &Path) -> PathBuf {
    let mut name = image.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(IMAGE_MANIFEST_SUFFIX);
    image.with_file_name(name)
}

impl ImageManifest {
    pub fn new(build: &BuildConfig, sha256: &str) -> Self {
        Self {
            components: build
                .manifest()
                .names()
                .into_iter()
                .map(String::from)
                .collect(),
            memory_mb: build.memory_mb(),
            sha256: sha256.to_string(),
        }
    }

    /// Write to the partial path for `image`; committed with the image.
    pub fn stage(&self, image: &Path) -> Result<PartialFile> {
        let partial = PartialFile::for_output(&manifest_path(image))?;
        let json = serde_json::to_string_pretty(self).context("Failed to encode image manifest")?;
        fs::write(partial.path(), json + "\n")
            .with_context(|| format!("Failed to write {}", partial.path().display()))?;
        Ok(partial)
    }

    /// The manifest recorded for `image`, if there is one.
    pub fn read(image: &Path) -> Result<Option<Self>> {
        let path = manifest_path(image);
        let text = match fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
        };
        let manifest = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Some(manifest))
    }
}
