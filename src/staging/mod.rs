//! Staging and package installation.
//!
//! Installation runs inside a [`Sandbox`]: the pseudo filesystems are
//! mounted right before the installer starts and come down on every exit
//! path, including installer failure and interruption.

pub mod mounts;
pub mod packages;
pub mod services;
pub mod users;

use anyhow::Result;
use std::path::Path;

use crate::config::Config;
use crate::error::BuildError;
use crate::features::{BuildConfig, ComponentManifest, Feature};
use crate::pipeline::Interrupt;

pub use mounts::{MountKind, MountOps, MountSpec, Sandbox, SystemMounts, SANDBOX_MOUNTS};
pub use packages::{ApkInstaller, PackageInstaller};
pub use users::ServiceAccount;

/// Installed in every image: file server, kernel, multi-tool, tz and certs.
pub const BASE_PACKAGES: &[&str] = &[
    "lighttpd",
    "linux-virt",
    "busybox-static",
    "tzdata",
    "ca-certificates",
];

/// Base set plus every manifest entry's packages, sorted and de-duplicated.
pub fn package_list(manifest: &ComponentManifest) -> Vec<String> {
    let mut all = manifest.packages();
    all.extend(BASE_PACKAGES.iter().map(|p| p.to_string()));
    all.into_iter().collect()
}

/// Install the package set inside the build sandbox.
pub fn install_packages(
    root: &Path,
    manifest: &ComponentManifest,
    mounts: &dyn MountOps,
    installer: &dyn PackageInstaller,
    interrupt: &Interrupt,
) -> Result<()> {
    let packages = package_list(manifest);
    interrupt.check()?;

    let sandbox = Sandbox::enter(root, SANDBOX_MOUNTS, mounts)
        .map_err(|e| BuildError::packaging("mount build sandbox", e))?;

    let outcome = installer
        .prepare(root)
        .and_then(|()| interrupt.check())
        .and_then(|()| installer.install(root, &packages))
        .and_then(|()| interrupt.check());

    let released = sandbox.release();
    outcome.map_err(|e| BuildError::packaging("install packages", e))?;
    released.map_err(|e| BuildError::packaging("release build sandbox", e))?;
    Ok(())
}

/// Service account, service directories and terminal service content.
pub fn provision(root: &Path, config: &Config, build: &BuildConfig) -> Result<ServiceAccount> {
    let account = users::ensure_service_account(root)?;
    services::write_lighttpd_conf(root, build)?;
    services::install_site(root, config.site_dir.as_deref())?;
    services::install_app(root, config.app_dir.as_deref(), build)?;
    if build.is_enabled(Feature::Discovery) {
        services::link_machine_id(root)?;
    }
    // After content is in place so the copied files get the account too.
    users::create_service_dirs(root, account)?;
    Ok(account)
}
