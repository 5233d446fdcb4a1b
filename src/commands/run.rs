//! Run and test commands - boot the image in QEMU.

use anyhow::Result;
use std::time::Duration;

use monoboot::config::Config;
use monoboot::qemu::{self, QemuConfig};

/// Memory follows the feature set the image was built with.
fn qemu_config(config: &Config) -> Result<QemuConfig> {
    QemuConfig::for_image(&config.output, &config.features)
}

pub fn cmd_run(config: &Config) -> Result<()> {
    qemu::run(&qemu_config(config)?)
}

/// Headless boot; succeeds once the health endpoint answers.
pub fn cmd_test(config: &Config, timeout: u64) -> Result<()> {
    let serial_log = config.output.with_extension("serial.log");
    let vm = qemu_config(config)?.headless(&serial_log);
    let elapsed = qemu::test(&vm, Duration::from_secs(timeout))?;
    println!(
        "PASS: {} answered after {:.1}s",
        vm.health_url(),
        elapsed.as_secs_f64()
    );
    Ok(())
}
