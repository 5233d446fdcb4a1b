//! Build stages and their dependency graph.

use anyhow::{bail, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildStage {
    ResolveFeatures,
    AcquireBase,
    InstallPackages,
    AssembleInitramfs,
    GenerateInit,
    Harden,
    PackRootfs,
    AssembleImage,
}

impl BuildStage {
    /// Declaration order, also the tie-break order of the graph.
    pub const ALL: [BuildStage; 8] = [
        BuildStage::ResolveFeatures,
        BuildStage::AcquireBase,
        BuildStage::InstallPackages,
        BuildStage::AssembleInitramfs,
        BuildStage::GenerateInit,
        BuildStage::Harden,
        BuildStage::PackRootfs,
        BuildStage::AssembleImage,
    ];

    pub fn name(self) -> &'static str {
        match self {
            BuildStage::ResolveFeatures => "resolve-features",
            BuildStage::AcquireBase => "acquire-base",
            BuildStage::InstallPackages => "install-packages",
            BuildStage::AssembleInitramfs => "assemble-initramfs",
            BuildStage::GenerateInit => "generate-init",
            BuildStage::Harden => "harden",
            BuildStage::PackRootfs => "pack-rootfs",
            BuildStage::AssembleImage => "assemble-image",
        }
    }

    /// Stages that must have completed first.
    ///
    /// Hardening strips the kernel modules the initramfs copies from, so it
    /// waits for the initramfs as well as the init script.
    pub fn deps(self) -> &'static [BuildStage] {
        use BuildStage::*;
        match self {
            ResolveFeatures => &[],
            AcquireBase => &[ResolveFeatures],
            InstallPackages => &[AcquireBase],
            AssembleInitramfs => &[InstallPackages],
            GenerateInit => &[InstallPackages],
            Harden => &[AssembleInitramfs, GenerateInit],
            PackRootfs => &[Harden],
            AssembleImage => &[PackRootfs, AssembleInitramfs],
        }
    }
}

impl fmt::Display for BuildStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone)]
pub struct BuildGraph {
    nodes: Vec<BuildStage>,
    deps: BTreeMap<BuildStage, Vec<BuildStage>>,
}

impl Default for BuildGraph {
    fn default() -> Self {
        Self::from_edges(BuildStage::ALL.iter().map(|s| (*s, s.deps().to_vec())))
    }
}

impl BuildGraph {
    /// Graph over the given stages; declaration order breaks ties.
    pub fn from_edges<I>(edges: I) -> Self
    where
        I: IntoIterator<Item = (BuildStage, Vec<BuildStage>)>,
    {
        let mut nodes = Vec::new();
        let mut deps = BTreeMap::new();
        for (stage, stage_deps) in edges {
            nodes.push(stage);
            deps.insert(stage, stage_deps);
        }
        Self { nodes, deps }
    }

    pub fn stages(&self) -> &[BuildStage] {
        &self.nodes
    }

    pub fn deps(&self, stage: BuildStage) -> &[BuildStage] {
        self.deps.get(&stage).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Kahn's algorithm, always taking the earliest-declared ready stage.
    pub fn topological_order(&self) -> Result<Vec<BuildStage>> {
        for (stage, deps) in &self.deps {
            if let Some(unknown) = deps.iter().find(|d| !self.deps.contains_key(d)) {
                bail!("stage '{}' depends on undeclared stage '{}'", stage, unknown);
            }
        }

        let mut pending: BTreeMap<BuildStage, usize> =
            self.nodes.iter().map(|s| (*s, self.deps(*s).len())).collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while order.len() < self.nodes.len() {
            let Some(next) = self
                .nodes
                .iter()
                .copied()
                .find(|s| pending.get(s) == Some(&0))
            else {
                let stuck: Vec<&str> = pending.keys().map(|s| s.name()).collect();
                bail!("build graph has a cycle among: {}", stuck.join(", "));
            };
            pending.remove(&next);
            for (stage, count) in pending.iter_mut() {
                if self.deps(*stage).contains(&next) {
                    *count -= 1;
                }
            }
            order.push(next);
        }
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use BuildStage::*;

    #[test]
    fn test_default_order_respects_deps() {
        let order = BuildGraph::default().topological_order().unwrap();
        assert_eq!(order, BuildStage::ALL.to_vec());
        for (i, stage) in order.iter().enumerate() {
            for dep in stage.deps() {
                assert!(order[..i].contains(dep), "{} before {}", dep, stage);
            }
        }
    }

    #[test]
    fn test_ties_follow_declaration_order() {
        let graph = BuildGraph::from_edges([
            (GenerateInit, vec![]),
            (AssembleInitramfs, vec![]),
            (Harden, vec![GenerateInit, AssembleInitramfs]),
        ]);
        assert_eq!(
            graph.topological_order().unwrap(),
            vec![GenerateInit, AssembleInitramfs, Harden]
        );
    }

    #[test]
    fn test_cycle_is_an_error() {
        let graph = BuildGraph::from_edges([
            (ResolveFeatures, vec![]),
            (PackRootfs, vec![AssembleImage]),
            (AssembleImage, vec![PackRootfs]),
        ]);
        let err = graph.topological_order().unwrap_err().to_string();
        assert!(err.contains("cycle"));
        assert!(err.contains("pack-rootfs"));
    }

    #[test]
    fn test_undeclared_dependency_is_an_error() {
        let graph = BuildGraph::from_edges([(Harden, vec![GenerateInit])]);
        assert!(graph.topological_order().is_err());
    }
}
