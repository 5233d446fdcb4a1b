//! The real build: each [`BuildStage`] mapped onto the modules that do the
//! work, with the state that flows between stages.

use anyhow::{anyhow, Result};

use super::{BuildGraph, BuildLock, BuildStage, Interrupt, Pipeline, StageRunner};
use crate::acquire::{self, BaseImage, Fetcher, HttpFetcher};
use crate::artifact::{self, ImageArtifact};
use crate::boot::ScanPolicy;
use crate::config::Config;
use crate::error::BuildError;
use crate::features::BuildConfig;
use crate::harden::{harden, HardeningPlan, HardeningReport};
use crate::init::{write_stage2, Stage2Script};
use crate::initramfs::{self, InitramfsReceipt};
use crate::layout::ISO_ROOTFS_PATH;
use crate::staging::{self, ApkInstaller, MountOps, PackageInstaller, ServiceAccount, SystemMounts};
use crate::workspace::Workspace;

pub struct ImageBuild {
    config: Config,
    ws: Workspace,
    base: BaseImage,
    interrupt: Interrupt,
    scan: ScanPolicy,
    fetcher: Box<dyn Fetcher>,
    installer: Box<dyn PackageInstaller>,
    mounts: Box<dyn MountOps>,

    build: Option<BuildConfig>,
    account: Option<ServiceAccount>,
    receipt: Option<InitramfsReceipt>,
    script: Option<Stage2Script>,
    hardening: Option<HardeningReport>,
    artifact: Option<ImageArtifact>,
}

impl ImageBuild {
    /// Network fetcher, apk in a chroot, real mounts.
    pub fn new(config: Config, interrupt: Interrupt) -> Self {
        let base = BaseImage::from_config(&config);
        Self {
            ws: Workspace::new(&config.workspace),
            installer: Box::new(ApkInstaller::new(&base)),
            base,
            config,
            interrupt,
            scan: ScanPolicy::default(),
            fetcher: Box::new(HttpFetcher::new()),
            mounts: Box::new(SystemMounts),
            build: None,
            account: None,
            receipt: None,
            script: None,
            hardening: None,
            artifact: None,
        }
    }

    pub fn with_fetcher(mut self, fetcher: Box<dyn Fetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_installer(mut self, installer: Box<dyn PackageInstaller>) -> Self {
        self.installer = installer;
        self
    }

    pub fn with_mounts(mut self, mounts: Box<dyn MountOps>) -> Self {
        self.mounts = mounts;
        self
    }

    pub fn workspace(&self) -> &Workspace {
        &self.ws
    }

    pub fn build_config(&self) -> Option<&BuildConfig> {
        self.build.as_ref()
    }

    pub fn hardening(&self) -> Option<&HardeningReport> {
        self.hardening.as_ref()
    }

    pub fn artifact(&self) -> Option<&ImageArtifact> {
        self.artifact.as_ref()
    }

    pub fn into_artifact(self) -> Option<ImageArtifact> {
        self.artifact
    }

    fn resolved(&self) -> Result<&BuildConfig> {
        self.build
            .as_ref()
            .ok_or_else(|| anyhow!("features have not been resolved"))
    }

    fn resolve_features(&mut self) -> Result<()> {
        let build = BuildConfig::load(&self.config.features).map_err(BuildError::from)?;
        let names = build.manifest().names();
        if names.is_empty() {
            tracing::info!("No optional components enabled");
        } else {
            tracing::info!("Components: {}", names.join(", "));
        }
        self.build = Some(build);
        Ok(())
    }

    fn acquire_base(&mut self) -> Result<()> {
        self.ws.create()?;
        let acquired = acquire::acquire(&self.ws, &self.base, self.fetcher.as_ref())?;
        tracing::info!("Base {} ({})", acquired.archive.display(), acquired.sha256);
        Ok(())
    }

    fn install_packages(&mut self) -> Result<()> {
        let build = self.resolved()?;
        let root = self.ws.rootfs();
        staging::install_packages(
            &root,
            &build.manifest(),
            self.mounts.as_ref(),
            self.installer.as_ref(),
            &self.interrupt,
        )?;
        self.interrupt.check()?;
        let account = staging::provision(&root, &self.config, build)
            .map_err(|e| BuildError::packaging("provision service", e))?;
        self.account = Some(account);
        Ok(())
    }

    fn assemble_initramfs(&mut self) -> Result<()> {
        self.receipt = Some(initramfs::assemble(&self.ws, &self.scan)?);
        Ok(())
    }

    fn generate_init(&mut self) -> Result<()> {
        let account = self
            .account
            .ok_or_else(|| anyhow!("service account has not been provisioned"))?;
        let script = Stage2Script::compose_for(&self.resolved()?.manifest(), account)?;
        let path = write_stage2(&self.ws.rootfs(), &script)?;
        tracing::info!(
            "Stage 2 init {} ({})",
            path.display(),
            script.fragment_names().join(" -> ")
        );
        self.script = Some(script);
        Ok(())
    }

    fn harden(&mut self) -> Result<()> {
        let receipt = self
            .receipt
            .as_ref()
            .ok_or_else(|| anyhow!("initramfs has not been assembled"))?;
        let plan = HardeningPlan::for_config(self.resolved()?);
        let report = harden(&self.ws.rootfs(), &plan, receipt)
            .map_err(|e| BuildError::packaging("harden", e))?;
        self.hardening = Some(report);
        Ok(())
    }

    fn pack_rootfs(&mut self) -> Result<()> {
        artifact::pack(&self.ws.rootfs(), &self.ws.bootfs().join(ISO_ROOTFS_PATH))?;
        Ok(())
    }

    fn assemble_image(&mut self) -> Result<()> {
        let build = self.resolved()?;
        self.artifact = Some(artifact::assemble(&self.ws, &self.config.output, build)?);
        Ok(())
    }
}

impl StageRunner for ImageBuild {
    fn run_stage(&mut self, stage: BuildStage) -> Result<()> {
        match stage {
            BuildStage::ResolveFeatures => self.resolve_features(),
            BuildStage::AcquireBase => self.acquire_base(),
            BuildStage::InstallPackages => self.install_packages(),
            BuildStage::AssembleInitramfs => self.assemble_initramfs(),
            BuildStage::GenerateInit => self.generate_init(),
            BuildStage::Harden => self.harden(),
            BuildStage::PackRootfs => self.pack_rootfs(),
            BuildStage::AssembleImage => self.assemble_image(),
        }
    }
}

/// Run a complete build under the workspace lock.
///
/// Features are resolved before the lock is taken, so a rejected flag set
/// leaves nothing behind on disk.
pub fn run_build(mut build: ImageBuild) -> Result<ImageArtifact> {
    let mut pipeline = Pipeline::new(BuildGraph::default(), build.interrupt.clone());
    pipeline.run_stage(BuildStage::ResolveFeatures, &mut build)?;
    let _lock = BuildLock::acquire(build.workspace().root())?;
    pipeline.run(&mut build)?;
    build
        .into_artifact()
        .ok_or_else(|| anyhow!("build finished without an image"))
}
