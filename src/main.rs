//! monoboot - builder for minimal, immutable, single-purpose boot images.
//!
//! Produces a hybrid ISO from an Alpine base:
//! - squashfs root filesystem (read-only, hardened)
//! - busybox initramfs that finds and mounts it
//! - generated Stage 2 init that ends by exec'ing the file server

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use monoboot::config::Config;
use monoboot::error::classify;

#[derive(Parser)]
#[command(name = "monoboot")]
#[command(about = "Minimal immutable boot image builder")]
#[command(
    after_help = "QUICK START:\n  monoboot preflight  Check host tools\n  monoboot build      Build the image\n  monoboot run        Boot in QEMU\n  monoboot test       Headless boot + health check\n  monoboot clean      Remove build state"
)]
struct Cli {
    /// Feature flag file (overrides MONOBOOT_FEATURES)
    #[arg(long, global = true, value_name = "FILE")]
    features: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the image (downloads the base automatically)
    Build {
        /// Skip host checks
        #[arg(long)]
        skip_preflight: bool,
    },

    /// Boot the image in QEMU (serial console)
    Run,

    /// Boot headless and wait for the health endpoint
    Test {
        /// Timeout in seconds
        #[arg(short, long, default_value = "180")]
        timeout: u64,
    },

    /// Remove build state (default: staging trees, keeps downloads)
    Clean {
        #[command(subcommand)]
        what: Option<CleanTarget>,
    },

    /// Show information
    Show {
        #[command(subcommand)]
        what: ShowTarget,
    },

    /// Run preflight checks
    Preflight {
        /// Fail if any checks fail (exit code 1)
        #[arg(long)]
        strict: bool,
    },
}

#[derive(Subcommand)]
enum CleanTarget {
    /// Staging trees only (default)
    Workspace,
    /// Downloaded base archive only
    Downloads,
    /// Workspace, downloads and the output image
    All,
}

#[derive(Subcommand)]
enum ShowTarget {
    /// Show current configuration
    Config,
    /// Enabled components (JSON)
    Manifest,
    /// Generated Stage 2 init script
    Init,
    /// Generated initramfs /init
    Stage1,
    /// Stage order, packages and hardening paths (JSON)
    Plan,
    /// Simulate Stage 2 without running anything
    DryRun {
        /// Treat commands containing this text as failing (repeatable)
        #[arg(long = "fail", value_name = "PATTERN")]
        failing: Vec<String>,
    },
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let base_dir = std::env::current_dir()?;
    let mut config = Config::load(&base_dir);
    if let Some(features) = cli.features {
        config.features = features;
    }

    match cli.command {
        Commands::Build { skip_preflight } => commands::cmd_build(&config, skip_preflight)?,
        Commands::Run => commands::cmd_run(&config)?,
        Commands::Test { timeout } => commands::cmd_test(&config, timeout)?,
        Commands::Clean { what } => {
            let target = match what {
                None | Some(CleanTarget::Workspace) => commands::clean::CleanTarget::Workspace,
                Some(CleanTarget::Downloads) => commands::clean::CleanTarget::Downloads,
                Some(CleanTarget::All) => commands::clean::CleanTarget::All,
            };
            commands::cmd_clean(&config, target)?;
        }
        Commands::Show { what } => {
            let target = match what {
                ShowTarget::Config => commands::show::ShowTarget::Config,
                ShowTarget::Manifest => commands::show::ShowTarget::Manifest,
                ShowTarget::Init => commands::show::ShowTarget::Init,
                ShowTarget::Stage1 => commands::show::ShowTarget::Stage1,
                ShowTarget::Plan => commands::show::ShowTarget::Plan,
                ShowTarget::DryRun { failing } => commands::show::ShowTarget::DryRun { failing },
            };
            commands::cmd_show(&config, target)?;
        }
        Commands::Preflight { strict } => commands::cmd_preflight(&config, strict)?,
    }
    Ok(())
}

fn main() -> ExitCode {
    init_logging();
    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match classify(&e) {
                Some(kind) => eprintln!("{}: {:#}", kind.kind(), e),
                None => eprintln!("Error: {:#}", e),
            }
            ExitCode::FAILURE
        }
    }
}
