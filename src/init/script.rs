//! Stage 2 script composition.
//!
//! The script is an ordered list of immutable fragments joined
//! deterministically: base, enabled optional fragments in rank order,
//! terminal. Composition checks that shape; rendering is a pure function of
//! the composed list.

use std::fmt::Write as _;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::error::BuildError;
use crate::features::ComponentManifest;
use crate::layout::STAGE2_PATH;
use crate::staging::ServiceAccount;

use super::catalog;
use super::fragment::{Fragment, FragmentKind};

const PREAMBLE: &str = r#"PATH=/usr/sbin:/usr/bin:/sbin:/bin
export PATH

log() {
    echo "monoboot: $*" > /dev/console 2> /dev/null || echo "monoboot: $*"
}

fail_open() {
    log "step '$1' failed, continuing"
}

halt_boot() {
    log "step '$1' failed, halting (no recovery shell)"
    while :; do sleep 3600; done
}
"#;

/// The composed Stage 2 sequencer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage2Script {
    fragments: Vec<Fragment>,
}

impl Stage2Script {
    /// Compose base + manifest fragments + terminal, for an account with the
    /// default ids.
    pub fn compose(manifest: &ComponentManifest) -> Result<Self, BuildError> {
        Self::compose_for(manifest, ServiceAccount::default())
    }

    /// Compose for the service account actually provisioned in the image.
    pub fn compose_for(manifest: &ComponentManifest, owner: ServiceAccount) -> Result<Self, BuildError> {
        let mut fragments = vec![catalog::base()];
        for component in manifest.iter() {
            let fragment = component
                .init_fragment
                .clone()
                .unwrap_or_else(|| catalog::optional(component.feature));
            fragments.push(fragment);
        }
        fragments.push(catalog::terminal(owner));
        Self::from_fragments(fragments)
    }

    /// Accept an explicit fragment list after checking its shape.
    pub fn from_fragments(fragments: Vec<Fragment>) -> Result<Self, BuildError> {
        validate(&fragments).map_err(|msg| BuildError::packaging("compose stage 2 script", msg))?;
        Ok(Self { fragments })
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    /// Names of the fragments in script order.
    pub fn fragment_names(&self) -> Vec<&'static str> {
        self.fragments.iter().map(Fragment::name).collect()
    }

    /// Render POSIX sh for the image's busybox ash.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "#!/bin/sh");
        let _ = writeln!(out, "# monoboot stage 2 sequencer (generated, do not edit)");
        let _ = writeln!(out, "# fragments: {}", self.fragment_names().join(" "));
        out.push('\n');
        out.push_str(PREAMBLE);
        out.push('\n');
        for fragment in &self.fragments {
            fragment.render(&mut out);
        }
        out
    }
}

fn validate(fragments: &[Fragment]) -> std::result::Result<(), String> {
    let (Some(first), Some(last)) = (fragments.first(), fragments.last()) else {
        return Err("script has no fragments".into());
    };
    if first.kind != FragmentKind::Base {
        return Err(format!("first fragment must be base, found '{}'", first.name()));
    }
    if last.kind != FragmentKind::Terminal {
        return Err(format!("last fragment must be terminal, found '{}'", last.name()));
    }
    if fragments.len() < 2 {
        return Err("script needs both a base and a terminal fragment".into());
    }

    let middle = &fragments[1..fragments.len() - 1];
    let mut previous = None;
    for fragment in middle {
        let FragmentKind::Optional(feature) = fragment.kind else {
            return Err(format!(
                "fragment '{}' may only appear once, at its fixed position",
                fragment.name()
            ));
        };
        if let Some(prev) = previous {
            if feature <= prev {
                return Err(format!(
                    "optional fragment '{}' is out of order or duplicated",
                    fragment.name()
                ));
            }
        }
        previous = Some(feature);
    }

    match &last.unit {
        Some(unit) if !unit.backgrounded => Ok(()),
        Some(_) => Err("terminal unit must not be backgrounded".into()),
        None => Err("terminal fragment has no unit to hand off to".into()),
    }
}

/// Write the rendered script into the staged root. Returns its path.
pub fn write_stage2(staging_root: &Path, script: &Stage2Script) -> Result<PathBuf> {
    let path = staging_root.join(STAGE2_PATH);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::write(&path, script.render())
        .with_context(|| format!("Failed to write {}", path.display()))?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
    Ok(path)
}
