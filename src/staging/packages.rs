//! Package installation into the staging tree.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use crate::acquire::BaseImage;
use crate::process::chroot;

/// Installs packages into a staged root. Runs inside the build sandbox.
pub trait PackageInstaller {
    /// Make the root ready to resolve packages (repositories, DNS).
    fn prepare(&self, root: &Path) -> Result<()>;
    fn install(&self, root: &Path, packages: &[String]) -> Result<()>;
}

/// `apk` inside a chroot of the staged root.
#[derive(Debug, Clone)]
pub struct ApkInstaller {
    repositories: Vec<String>,
}

impl ApkInstaller {
    pub fn new(base: &BaseImage) -> Self {
        Self {
            repositories: base.repositories().to_vec(),
        }
    }

    pub fn repositories_file(&self) -> String {
        let mut out = self.repositories.join("\n");
        out.push('\n');
        out
    }
}

impl PackageInstaller for ApkInstaller {
    fn prepare(&self, root: &Path) -> Result<()> {
        let apk_dir = root.join("etc/apk");
        fs::create_dir_all(&apk_dir)
            .with_context(|| format!("Failed to create {}", apk_dir.display()))?;
        fs::write(apk_dir.join("repositories"), self.repositories_file())
            .context("Failed to write etc/apk/repositories")?;

        let host_resolv = Path::new("/etc/resolv.conf");
        if host_resolv.exists() {
            fs::copy(host_resolv, root.join("etc/resolv.conf"))
                .context("Failed to copy host resolv.conf into staging root")?;
        } else {
            tracing::warn!("Host has no /etc/resolv.conf, package download may fail");
        }
        Ok(())
    }

    fn install(&self, root: &Path, packages: &[String]) -> Result<()> {
        tracing::info!("Installing {} packages: {}", packages.len(), packages.join(" "));

        chroot(root, "/sbin/apk")
            .args(["update", "--quiet"])
            .error_msg("apk update failed")
            .run_interactive()?;

        chroot(root, "/sbin/apk")
            .args(["add", "--no-cache", "--quiet"])
            .args(packages)
            .error_msg("apk add failed")
            .run_interactive()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_writes_pinned_repositories() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("etc")).unwrap();
        let base = BaseImage {
            mirror: "https://m.test/alpine".into(),
            version: "3.20.3".into(),
            arch: "x86_64".into(),
        };
        ApkInstaller::new(&base).prepare(dir.path()).unwrap();

        let repos = fs::read_to_string(dir.path().join("etc/apk/repositories")).unwrap();
        assert_eq!(
            repos,
            "https://m.test/alpine/v3.20/main\nhttps://m.test/alpine/v3.20/community\n"
        );
    }
}
