//! Preflight checks for a monoboot build.
//!
//! Validates host tools, loader files and the build environment before any
//! stage runs. Run with `monoboot preflight` to check everything is ready.

mod environment;
mod host_tools;
mod types;

use anyhow::Result;

use crate::config::Config;
use crate::error::BuildError;

pub use host_tools::{OPTIONAL_TOOLS, REQUIRED_TOOLS};
pub use types::{CheckResult, CheckStatus, PreflightReport};

/// Run all preflight checks.
pub fn run_preflight(config: &Config) -> PreflightReport {
    let mut checks = Vec::new();

    tracing::info!("Checking host tools...");
    checks.extend(host_tools::check_host_tools());

    tracing::info!("Checking build environment...");
    checks.extend(environment::check_build_environment(config));

    PreflightReport { checks }
}

/// Run preflight, print the report and fail with a `ResourceError` if any
/// check failed (or warned, when `strict`).
pub fn run_preflight_or_fail(config: &Config, strict: bool) -> Result<PreflightReport> {
    let report = run_preflight(config);
    report.print();
    check_report(report, strict)
}

fn check_report(report: PreflightReport, strict: bool) -> Result<PreflightReport> {
    if !report.passed(strict) {
        return Err(BuildError::resource(format!(
            "preflight failed: {}",
            report.problems().join(", ")
        ))
        .into());
    }
    Ok(report)
}
