//! Build environment checks: privileges, writable directories, feature file.

use std::fs;
use std::path::Path;

use crate::config::Config;
use crate::features::BuildConfig;

use super::types::CheckResult;

pub fn check_build_environment(config: &Config) -> Vec<CheckResult> {
    let mut results = vec![check_root()];

    results.push(check_writable("workspace", &config.workspace));
    if let Some(parent) = config.output.parent() {
        results.push(check_writable("output directory", parent));
    }

    results.push(match BuildConfig::load(&config.features) {
        Ok(_) if !config.features.exists() => CheckResult::warn(
            "feature flags",
            &format!(
                "{} not found, all optional components off",
                config.features.display()
            ),
        ),
        Ok(build) => {
            let names = build.manifest().names();
            let summary = if names.is_empty() {
                "no optional components".to_string()
            } else {
                names.join(", ")
            };
            CheckResult::pass_with("feature flags", &summary)
        }
        Err(e) => CheckResult::fail("feature flags", &e.to_string()),
    });

    results
}

/// apk, chroot, mount and device nodes all need root.
fn check_root() -> CheckResult {
    if nix::unistd::geteuid().is_root() {
        CheckResult::pass("root privileges")
    } else {
        CheckResult::fail(
            "root privileges",
            "The build mounts pseudo filesystems and runs apk in a chroot. Run as root.",
        )
    }
}

fn check_writable(name: &str, dir: &Path) -> CheckResult {
    if let Err(e) = fs::create_dir_all(dir) {
        return CheckResult::fail(name, &format!("Cannot create {}: {}", dir.display(), e));
    }
    let probe = dir.join(".preflight-test");
    match fs::write(&probe, "test") {
        Ok(()) => {
            let _ = fs::remove_file(&probe);
            CheckResult::pass_with(name, &dir.display().to_string())
        }
        Err(e) => CheckResult::fail(name, &format!("Cannot write to {}: {}", dir.display(), e)),
    }
}
