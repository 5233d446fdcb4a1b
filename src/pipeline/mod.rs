//! Build orchestration.
//!
//! The build is a fixed graph of [`BuildStage`]s executed in dependency
//! order by a [`Pipeline`]. The pipeline owns ordering, interruption and
//! timing; what each stage does lives in a [`StageRunner`], normally
//! [`ImageBuild`].

pub mod build;
pub mod graph;
pub mod interrupt;
pub mod lock;

use anyhow::{bail, Context, Result};

use crate::timing::Timer;

pub use build::ImageBuild;
pub use graph::{BuildGraph, BuildStage};
pub use interrupt::Interrupt;
pub use lock::BuildLock;

/// Performs the work of one stage.
pub trait StageRunner {
    fn run_stage(&mut self, stage: BuildStage) -> Result<()>;
}

pub struct Pipeline {
    graph: BuildGraph,
    interrupt: Interrupt,
    completed: Vec<BuildStage>,
}

impl Pipeline {
    pub fn new(graph: BuildGraph, interrupt: Interrupt) -> Self {
        Self {
            graph,
            interrupt,
            completed: Vec::new(),
        }
    }

    pub fn completed(&self) -> &[BuildStage] {
        &self.completed
    }

    /// Run every stage in order, skipping stages already completed. The first
    /// failure aborts the build.
    pub fn run(&mut self, runner: &mut dyn StageRunner) -> Result<()> {
        let order = self.graph.topological_order()?;
        tracing::debug!(
            "stage order: {}",
            order.iter().map(|s| s.name()).collect::<Vec<_>>().join(" -> ")
        );
        for stage in order {
            if self.completed.contains(&stage) {
                continue;
            }
            self.run_stage(stage, runner)?;
        }
        Ok(())
    }

    /// Run a single stage, refusing it unless all its dependencies completed.
    pub fn run_stage(&mut self, stage: BuildStage, runner: &mut dyn StageRunner) -> Result<()> {
        if let Some(missing) = self
            .graph
            .deps(stage)
            .iter()
            .find(|d| !self.completed.contains(d))
        {
            bail!(
                "Stage '{}' cannot run: dependency '{}' has not completed",
                stage,
                missing
            );
        }
        self.interrupt.check()?;

        tracing::info!("=== {} ===", stage);
        let timer = Timer::start(stage.name());
        runner
            .run_stage(stage)
            .with_context(|| format!("Stage '{}' failed", stage))?;
        timer.finish();

        self.completed.push(stage);
        Ok(())
    }
}
