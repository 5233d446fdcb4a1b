//! Error taxonomy for the build pipeline and the boot sequencer.
//!
//! Build code propagates `anyhow::Error` with context, like the rest of the
//! builder. The variants here mark *which class* of failure happened so the
//! CLI and tests can tell a bad flag combination from a tampered archive:
//!
//! ```ignore
//! match err.downcast_ref::<BuildError>() {
//!     Some(BuildError::Verification { .. }) => { /* archive was tampered */ }
//!     _ => {}
//! }
//! ```

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Feature-flag problems. Always detected before any side effect.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("feature '{feature}' requires '{requires}' to be enabled")]
    UnmetDependency {
        feature: &'static str,
        requires: &'static str,
    },

    #[error("invalid value '{value}' for flag '{key}' (expected true/false)")]
    InvalidValue { key: String, value: String },

    #[error("cannot read feature file {path}: {reason}")]
    Unreadable { path: PathBuf, reason: String },
}

/// Failure classes of a build. Any of these aborts the whole build.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("checksum mismatch for {}\n  Expected: {expected}\n  Actual:   {actual}", path.display())]
    Verification {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("resource unavailable: {0}")]
    Resource(String),

    #[error("{step} failed: {message}")]
    Packaging { step: String, message: String },
}

impl BuildError {
    /// Wrap any failure of a staging/installation/packaging step.
    pub fn packaging(step: impl Into<String>, err: impl fmt::Display) -> Self {
        Self::Packaging {
            step: step.into(),
            message: format!("{:#}", err),
        }
    }

    pub fn resource(msg: impl Into<String>) -> Self {
        Self::Resource(msg.into())
    }

    /// Short class name, as printed to the operator.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "ConfigError",
            Self::Verification { .. } => "VerificationError",
            Self::Resource(_) => "ResourceError",
            Self::Packaging { .. } => "PackagingError",
        }
    }
}

/// Failures inside the boot sequencer model.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BootError {
    #[error("no block device carried the root image after {attempts} scan attempt(s)")]
    DiscoveryExhausted { attempts: u32 },

    #[error("boot stage {0} is terminal")]
    PastHandoff(&'static str),

    #[error("fail-closed step '{step}' failed: {reason}")]
    StepFailed { step: String, reason: String },

    #[error("process handoff to '{command}' failed: {reason}")]
    HandoffFailed { command: String, reason: String },
}

/// Classify an `anyhow::Error` coming out of the pipeline.
pub fn classify(err: &anyhow::Error) -> Option<&BuildError> {
    err.chain().find_map(|e| e.downcast_ref::<BuildError>())
}
