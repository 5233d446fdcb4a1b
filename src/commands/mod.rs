//! CLI command handlers.
//!
//! - `build` - run the build pipeline
//! - `preflight` - check the host
//! - `show` - print configuration, manifest, generated scripts, plan
//! - `clean` - remove build state
//! - `run` / `test` - boot the image in QEMU

pub mod build;
pub mod clean;
mod preflight;
mod run;
pub mod show;

pub use build::cmd_build;
pub use clean::cmd_clean;
pub use preflight::cmd_preflight;
pub use run::{cmd_run, cmd_test};
pub use show::cmd_show;
