//! Build command - runs the full image pipeline.

use anyhow::Result;
use std::time::Instant;

use monoboot::config::Config;
use monoboot::error::BuildError;
use monoboot::features::BuildConfig;
use monoboot::pipeline::{build::run_build, ImageBuild, Interrupt};
use monoboot::preflight;
use monoboot::timing::format_elapsed;

pub fn cmd_build(config: &Config, skip_preflight: bool) -> Result<()> {
    // Reject bad flags before preflight creates any directories.
    BuildConfig::load(&config.features).map_err(BuildError::from)?;

    if skip_preflight {
        tracing::warn!("Skipping preflight checks");
    } else {
        preflight::run_preflight_or_fail(config, false)?;
    }

    let interrupt = Interrupt::new();
    interrupt.register()?;

    let start = Instant::now();
    let artifact = run_build(ImageBuild::new(config.clone(), interrupt))?;

    println!();
    println!("=== Build complete ({}) ===", format_elapsed(start.elapsed().as_secs_f64()));
    println!("  Image:    {}", artifact.path.display());
    println!("  Size:     {} MB", artifact.size / 1_000_000);
    println!("  SHA256:   {}", artifact.sha256);
    println!("  Checksum: {}", artifact.checksum_path.display());
    println!("  Manifest: {}", artifact.manifest_path.display());
    println!();
    println!("Next: monoboot run   (or monoboot test)");
    Ok(())
}
