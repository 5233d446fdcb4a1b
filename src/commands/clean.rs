//! Clean command - removes build state.

use anyhow::Result;

use monoboot::clean;
use monoboot::config::Config;
use monoboot::workspace::Workspace;

pub enum CleanTarget {
    /// Staging trees (default); downloads are kept
    Workspace,
    /// Downloaded base archive and checksum
    Downloads,
    /// Workspace, downloads and the output image
    All,
}

pub fn cmd_clean(config: &Config, target: CleanTarget) -> Result<()> {
    let ws = Workspace::new(&config.workspace);
    match target {
        CleanTarget::Workspace => clean::clean_workspace(&ws)?,
        CleanTarget::Downloads => clean::clean_downloads(&ws)?,
        CleanTarget::All => clean::clean_all(&ws, &config.output)?,
    }
    Ok(())
}
