//! Show command - prints configuration and what a build would produce.
//!
//! Nothing here touches the workspace; every target is computed from the
//! configuration and the feature file alone.

use anyhow::Result;
use serde::Serialize;

use monoboot::boot::{render_stage1, DryRunRunner, ScanPolicy, Sequencer};
use monoboot::config::Config;
use monoboot::error::BuildError;
use monoboot::features::BuildConfig;
use monoboot::harden::HardeningPlan;
use monoboot::init::Stage2Script;
use monoboot::initramfs::modules::BOOT_MODULES;
use monoboot::pipeline::{BuildGraph, BuildStage};
use monoboot::staging;

pub enum ShowTarget {
    /// Effective configuration
    Config,
    /// Enabled components as JSON
    Manifest,
    /// Generated Stage 2 init script
    Init,
    /// Generated initramfs /init
    Stage1,
    /// Stage order, packages and hardening paths as JSON
    Plan,
    /// Simulated Stage 2 boot; commands matching `failing` fail
    DryRun { failing: Vec<String> },
}

#[derive(Serialize)]
struct BuildPlan<'a> {
    stages: Vec<BuildStage>,
    components: Vec<&'static str>,
    packages: Vec<String>,
    memory_mb: u32,
    hardening: &'a HardeningPlan,
}

fn load_build(config: &Config) -> Result<BuildConfig> {
    Ok(BuildConfig::load(&config.features).map_err(BuildError::from)?)
}

pub fn cmd_show(config: &Config, target: ShowTarget) -> Result<()> {
    match target {
        ShowTarget::Config => config.print(),
        ShowTarget::Manifest => {
            println!("{}", load_build(config)?.manifest().to_json()?);
        }
        ShowTarget::Init => {
            let script = Stage2Script::compose(&load_build(config)?.manifest())?;
            print!("{}", script.render());
        }
        ShowTarget::Stage1 => {
            print!("{}", render_stage1(&ScanPolicy::default(), BOOT_MODULES));
        }
        ShowTarget::Plan => {
            let build = load_build(config)?;
            let hardening = HardeningPlan::for_config(&build);
            let plan = BuildPlan {
                stages: BuildGraph::default().topological_order()?,
                components: build.manifest().names(),
                packages: staging::package_list(&build.manifest()),
                memory_mb: build.memory_mb(),
                hardening: &hardening,
            };
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }
        ShowTarget::DryRun { failing } => show_dry_run(config, failing)?,
    }
    Ok(())
}

fn show_dry_run(config: &Config, failing: Vec<String>) -> Result<()> {
    let script = Stage2Script::compose(&load_build(config)?.manifest())?;
    let mut runner = DryRunRunner::new();
    runner.failing = failing;

    let mut seq = Sequencer::new(runner);
    let outcome = match seq.run(&script) {
        Ok(never) => match never {},
        Err(e) => e,
    };

    println!("{}", seq.runner().render());
    println!();
    println!("Final stage: {}", seq.stage().name());
    if seq.degraded().is_empty() {
        println!("Degraded:    none");
    } else {
        println!("Degraded:    {}", seq.degraded().join(", "));
    }
    println!("Outcome:     {}", outcome);
    Ok(())
}
