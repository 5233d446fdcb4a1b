//! Base image acquisition: fetch, verify, extract.
//!
//! The verification boundary is hard. Archive bytes are hashed and compared
//! against the published checksum before extraction is even considered, and
//! a mismatch is a [`BuildError::Verification`] with the archive left in
//! place for inspection.

pub mod download;

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::BuildError;
use crate::workspace::Workspace;

use download::DownloadOptions;

/// The pinned upstream minimal root filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseImage {
    pub mirror: String,
    pub version: String,
    pub arch: String,
}

impl BaseImage {
    pub fn from_config(config: &Config) -> Self {
        Self {
            mirror: config.alpine_mirror.clone(),
            version: config.alpine_version.clone(),
            arch: config.alpine_arch.clone(),
        }
    }

    /// Release branch, e.g. "v3.20" for "3.20.3".
    pub fn branch(&self) -> String {
        let major_minor: Vec<&str> = self.version.split('.').take(2).collect();
        format!("v{}", major_minor.join("."))
    }

    pub fn archive_name(&self) -> String {
        format!("alpine-minirootfs-{}-{}.tar.gz", self.version, self.arch)
    }

    pub fn archive_url(&self) -> String {
        format!(
            "{}/{}/releases/{}/{}",
            self.mirror,
            self.branch(),
            self.arch,
            self.archive_name()
        )
    }

    pub fn checksum_url(&self) -> String {
        format!("{}.sha256", self.archive_url())
    }

    /// Package repositories matching the pinned branch.
    pub fn repositories(&self) -> [String; 2] {
        [
            format!("{}/{}/main", self.mirror, self.branch()),
            format!("{}/{}/community", self.mirror, self.branch()),
        ]
    }
}

/// How remote files reach the workspace.
pub trait Fetcher {
    /// Fetch `url` into `dest`. `dest` must only appear once complete.
    fn fetch(&self, url: &str, dest: &Path) -> Result<()>;
}

/// Real network fetcher backed by `reqwest` on a current-thread runtime.
#[derive(Debug, Default)]
pub struct HttpFetcher {
    pub archive: DownloadOptions,
    pub metadata: DownloadOptions,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self {
            archive: DownloadOptions::default(),
            metadata: DownloadOptions::metadata(),
        }
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str, dest: &Path) -> Result<()> {
        let options = if url.ends_with(".sha256") {
            &self.metadata
        } else {
            &self.archive
        };
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to start async runtime")?;
        runtime.block_on(download::http(url, dest, options))
    }
}

/// Where acquisition left things.
#[derive(Debug, Clone)]
pub struct Acquired {
    pub archive: PathBuf,
    pub sha256: String,
    pub reused: bool,
}

/// Fetch (or reuse), verify and extract the base archive into `ws.rootfs()`.
pub fn acquire(ws: &Workspace, base: &BaseImage, fetcher: &dyn Fetcher) -> Result<Acquired> {
    let downloads = ws.downloads();
    fs::create_dir_all(&downloads)
        .with_context(|| format!("Failed to create {}", downloads.display()))?;

    let archive = downloads.join(base.archive_name());
    let checksum_file = downloads.join(format!("{}.sha256", base.archive_name()));

    let reused = archive.exists();
    if reused {
        tracing::info!("Reusing {}", archive.display());
    } else {
        tracing::info!("Downloading {}", base.archive_url());
        fetch_resource(fetcher, &base.archive_url(), &archive)?;
    }

    if !checksum_file.exists() {
        fetch_resource(fetcher, &base.checksum_url(), &checksum_file)?;
    }
    let published = fs::read_to_string(&checksum_file)
        .with_context(|| format!("Failed to read {}", checksum_file.display()))?;
    let expected = parse_published_checksum(&published).ok_or_else(|| {
        BuildError::resource(format!(
            "published checksum {} is malformed",
            checksum_file.display()
        ))
    })?;

    verify_sha256(&archive, &expected)?;
    tracing::info!("Checksum verified for {}", base.archive_name());

    extract(&archive, &ws.rootfs())
        .map_err(|e| BuildError::packaging("extract base archive", e))?;

    Ok(Acquired {
        archive,
        sha256: expected,
        reused,
    })
}

fn fetch_resource(fetcher: &dyn Fetcher, url: &str, dest: &Path) -> Result<()> {
    fetcher
        .fetch(url, dest)
        .map_err(|e| BuildError::resource(format!("download of {} failed: {:#}", url, e)).into())
}

/// Parse `<hex>  <filename>` (or a bare hex digest).
pub fn parse_published_checksum(text: &str) -> Option<String> {
    let token = text.split_whitespace().next()?;
    if token.len() == 64 && token.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(token.to_ascii_lowercase())
    } else {
        None
    }
}

/// Hex SHA-256 of a file, read in 1 MiB chunks.
pub fn sha256_file(path: &Path) -> Result<String> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open {} for checksum", path.display()))?;
    let mut reader = BufReader::with_capacity(1024 * 1024, file);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1024 * 1024];
    loop {
        let n = reader
            .read(&mut buffer)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Compare a file's digest against `expected`.
pub fn verify_sha256(path: &Path, expected: &str) -> Result<()> {
    let actual = sha256_file(path)?;
    if actual != expected.to_ascii_lowercase() {
        return Err(BuildError::Verification {
            path: path.to_path_buf(),
            expected: expected.to_string(),
            actual,
        }
        .into());
    }
    Ok(())
}

/// Unpack a gzip tarball, keeping modes and (when root) ownership.
pub fn extract(archive: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest).with_context(|| format!("Failed to create {}", dest.display()))?;
    let file = File::open(archive)
        .with_context(|| format!("Failed to open {}", archive.display()))?;

    let mut tar = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
    tar.set_preserve_permissions(true);
    tar.set_preserve_mtime(true);
    tar.set_preserve_ownerships(nix::unistd::geteuid().is_root());
    tar.set_unpack_xattrs(false);
    tar.unpack(dest)
        .with_context(|| format!("Failed to extract {} into {}", archive.display(), dest.display()))?;

    tracing::debug!("Extracted {} into {}", archive.display(), dest.display());
    Ok(())
}
