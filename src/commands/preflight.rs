//! Preflight command - runs preflight checks.

use anyhow::Result;

use monoboot::config::Config;
use monoboot::preflight;

pub fn cmd_preflight(config: &Config, strict: bool) -> Result<()> {
    if strict {
        preflight::run_preflight_or_fail(config, true)?;
        println!("All preflight checks passed!");
    } else {
        let report = preflight::run_preflight(config);
        report.print();
        if !report.passed(false) {
            println!("Some checks failed. Use --strict to fail with a non-zero exit code.");
        }
    }
    Ok(())
}
